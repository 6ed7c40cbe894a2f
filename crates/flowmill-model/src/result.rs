// Uniform action result contract
//
// Local and remote actions both resolve to an ActionResult. Remote
// connectors return this shape as their response body; transport failures
// never surface here directly, the invoker maps them to a retriable result.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::status::ActionStatus;

/// Reference to an external resource created or touched by an action
///
/// The `(system, resource_type, resource_id)` tuple is globally unique across
/// executions; the engine uses it for cross-run idempotency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLinkRef {
    /// External system name, e.g. "slack"
    pub system: String,

    /// Resource type within the system, e.g. "message"
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Resource id within the system
    #[serde(rename = "id")]
    pub resource_id: String,

    /// Optional deep link
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl ResourceLinkRef {
    pub fn new(
        system: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self {
            system: system.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

/// Result of a single action invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionResult {
    /// Outcome of the attempt
    pub status: ActionStatus,

    /// Outputs made available to downstream nodes on success
    #[serde(default)]
    pub outputs: Map<String, Value>,

    /// External resources this attempt created or reused
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_links: Vec<ResourceLinkRef>,

    /// Human-readable failure description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl ActionResult {
    /// Successful result with outputs
    pub fn succeeded(outputs: Map<String, Value>) -> Self {
        Self {
            status: ActionStatus::Succeeded,
            outputs,
            resource_links: vec![],
            error_message: None,
        }
    }

    /// Permanent failure
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failed,
            outputs: Map::new(),
            resource_links: vec![],
            error_message: Some(message.into()),
        }
    }

    /// Transient failure, eligible for retry
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::RetriableFailure,
            outputs: Map::new(),
            resource_links: vec![],
            error_message: Some(message.into()),
        }
    }

    /// The action declined to run
    pub fn skipped() -> Self {
        Self {
            status: ActionStatus::Skipped,
            outputs: Map::new(),
            resource_links: vec![],
            error_message: None,
        }
    }

    /// Attach a resource link
    pub fn with_resource_link(mut self, link: ResourceLinkRef) -> Self {
        self.resource_links.push(link);
        self
    }

    /// Outputs as a JSON value
    pub fn outputs_value(&self) -> Value {
        Value::Object(self.outputs.clone())
    }
}
