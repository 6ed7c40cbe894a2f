// Workflow definition wire model
//
// WorkflowDefinition is the typed form of the definition JSON that authors
// publish. Parsing normalizes all optional fields to their documented
// defaults so downstream code never has to re-apply them:
//
// - absent `edges`              -> empty
// - absent `when`               -> success
// - absent `routePolicy`        -> parallel
// - absent `rerenderOnRetry`    -> false
// - absent `waitForCompletion`  -> true (sub-workflows)
//
// Parsing is pure: no IO, no side effects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error produced while parsing a workflow definition
#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    /// The JSON did not match the definition schema
    #[error("invalid definition: {0}")]
    Parse(#[from] serde_json::Error),

    /// Workflow id is not a valid slug
    #[error("invalid workflow id '{0}': expected ^[a-z0-9-]+$")]
    InvalidSlug(String),

    /// Retry policy failed numeric validation
    #[error("invalid retry policy on node '{node}': {message}")]
    InvalidRetryPolicy { node: String, message: String },
}

/// Kind of a workflow node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Executes an action resolved through the action registry
    #[default]
    Action,
    /// Starts a child workflow execution
    Subworkflow,
}

/// Branch selection policy for a node's outgoing edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum RoutePolicy {
    /// Every satisfied edge activates
    #[default]
    Parallel,
    /// Edge evaluation stops after the first satisfied edge
    FirstMatch,
}

/// Status match for an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EdgeWhen {
    /// Edge activates when the source node succeeded
    #[default]
    Success,
    /// Edge activates when the source node failed permanently
    Failure,
    /// Edge activates on any terminal source status except skipped
    Always,
}

impl std::fmt::Display for EdgeWhen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EdgeWhen::Success => write!(f, "success"),
            EdgeWhen::Failure => write!(f, "failure"),
            EdgeWhen::Always => write!(f, "always"),
        }
    }
}

/// An outgoing edge of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeSpec {
    /// Node the edge points at
    pub target_node: String,

    /// Which terminal status of the source activates this edge
    #[serde(default)]
    pub when: EdgeWhen,

    /// Optional boolean expression gating the edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Per-node retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySpec {
    /// Maximum attempts including the first (0 disables retries entirely)
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Multiplier applied per retry; must be >= 1.0
    pub backoff_factor: f64,

    /// Whether to randomize delays
    #[serde(default)]
    pub jitter: bool,
}

/// Execution policies of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodePolicies {
    /// Per-node timeout in milliseconds; engine default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Re-render parameters on every retry instead of reusing the first render
    #[serde(default)]
    pub rerender_on_retry: bool,

    /// Retry policy; engine default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetrySpec>,
}

/// A single node of the workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Unique id within the workflow
    pub id: String,

    /// Action node or sub-workflow invocation
    #[serde(default)]
    pub node_type: NodeType,

    /// Action type to resolve in the registry (action nodes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_type: Option<String>,

    /// Child workflow id (sub-workflow nodes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    /// Pinned child workflow version; current version when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_version: Option<i32>,

    /// Whether the node waits for the child to reach a terminal state
    #[serde(default = "default_true")]
    pub wait_for_completion: bool,

    /// Parameter template tree; string leaves are rendered before invocation
    #[serde(default)]
    pub parameters: serde_json::Map<String, Value>,

    /// Node to route to when this node fails permanently
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<String>,

    /// Branch selection policy for outgoing edges
    #[serde(default)]
    pub route_policy: RoutePolicy,

    /// Timeout, retry, and rendering policies
    #[serde(default)]
    pub policies: NodePolicies,

    /// Outgoing edges, evaluated in declaration order
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
}

fn default_true() -> bool {
    true
}

impl NodeSpec {
    /// Whether this node invokes a child workflow
    pub fn is_subworkflow(&self) -> bool {
        self.node_type == NodeType::Subworkflow
    }
}

/// A parsed, normalized workflow definition
///
/// This is the immutable content of a published version. Field defaults are
/// already applied, so two definitions that differ only in omitted-vs-default
/// fields compare equal and canonicalize to the same checksum input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    /// Stable workflow slug, `^[a-z0-9-]+$`
    pub id: String,

    /// Human-readable name
    pub display_name: String,

    /// Optional description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Entry node id
    pub start_node: String,

    /// Optional JSON Schema validating the trigger payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_schema: Option<Value>,

    /// The workflow graph
    pub nodes: Vec<NodeSpec>,
}

impl WorkflowDefinition {
    /// Parse a definition from a JSON string
    pub fn from_json(json: &str) -> Result<Self, DefinitionError> {
        let value: Value = serde_json::from_str(json)?;
        Self::from_value(value)
    }

    /// Parse a definition from a JSON value
    pub fn from_value(value: Value) -> Result<Self, DefinitionError> {
        let definition: WorkflowDefinition = serde_json::from_value(value)?;
        definition.check_shape()?;
        Ok(definition)
    }

    /// Serialize back to a JSON value (normalized form)
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("definition serialization is infallible")
    }

    /// Look up a node by id
    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Checksum of the canonicalized definition
    pub fn checksum(&self) -> String {
        crate::canonical::checksum(&self.to_value())
    }

    // Shape checks serde cannot express.
    fn check_shape(&self) -> Result<(), DefinitionError> {
        if !is_slug(&self.id) {
            return Err(DefinitionError::InvalidSlug(self.id.clone()));
        }

        for node in &self.nodes {
            if let Some(retry) = &node.policies.retry {
                if retry.backoff_factor < 1.0 {
                    return Err(DefinitionError::InvalidRetryPolicy {
                        node: node.id.clone(),
                        message: format!(
                            "backoffFactor must be >= 1.0, got {}",
                            retry.backoff_factor
                        ),
                    });
                }
            }
        }

        Ok(())
    }
}

fn is_slug(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
