//! Remote action invocation
//!
//! POSTs rendered parameters to a connector and maps the response onto the
//! uniform action result contract. Transport failures and malformed bodies
//! become `RetriableFailure`; a well-formed result body is returned as-is
//! regardless of the HTTP status, so connectors stay in control of their own
//! retry semantics.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use flowmill_model::{ActionResult, Principal};

use crate::config::ConnectorConfig;
use crate::registry::{ActionInvocation, RemoteAction};

const EXECUTE_PATH: &str = "/api/v1/actions/execute";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecuteRequestBody<'a> {
    action_type: &'a str,
    parameters: &'a Value,
    execution_context: ExecutionContextBody<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionContextBody<'a> {
    execution_id: String,
    node_id: &'a str,
    correlation_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    principal: Option<&'a Principal>,
}

/// HTTP client for connector-hosted actions
pub struct RemoteInvoker {
    client: reqwest::Client,
    connectors: HashMap<String, ConnectorConfig>,
}

impl RemoteInvoker {
    pub fn new(connectors: HashMap<String, ConnectorConfig>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self { client, connectors }
    }

    /// Invoke a remote action
    ///
    /// The linked cancel on `inv` aborts the in-flight request; the result is
    /// then retriable so a resumed run can retry the call.
    pub async fn invoke(
        &self,
        remote: &RemoteAction,
        action_type: &str,
        parameters: &Value,
        inv: &ActionInvocation,
    ) -> ActionResult {
        let url = match self.resolve_url(remote) {
            Some(url) => url,
            None => {
                // A missing connector is a configuration error, not transient
                return ActionResult::failed(format!(
                    "no connector configured for '{}'",
                    remote.connector_id
                ));
            }
        };

        let body = ExecuteRequestBody {
            action_type,
            parameters,
            execution_context: ExecutionContextBody {
                execution_id: inv.execution_id.to_string(),
                node_id: &inv.node_id,
                correlation_id: &inv.correlation_id,
                principal: inv.principal.as_ref(),
            },
        };

        let mut request = self
            .client
            .post(&url)
            .header("X-Correlation-Id", &inv.correlation_id)
            .json(&body);

        if let Some(principal) = &inv.principal {
            request = request.header("X-Acting-User-Id", &principal.user_id);
            if let Some(email) = &principal.email {
                request = request.header("X-Acting-User-Email", email);
            }
            if let Some(name) = &principal.display_name {
                request = request.header("X-Acting-User-Name", name);
            }
        }

        debug!(action_type, %url, node_id = %inv.node_id, "invoking remote action");

        let response = tokio::select! {
            response = request.send() => response,
            _ = inv.cancel.cancelled() => {
                return ActionResult::retriable("remote invocation cancelled");
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(action_type, error = %e, "connector request failed");
                return ActionResult::retriable(format!("connector request failed: {e}"));
            }
        };

        let status = response.status();
        let bytes = tokio::select! {
            bytes = response.bytes() => bytes,
            _ = inv.cancel.cancelled() => {
                return ActionResult::retriable("remote invocation cancelled");
            }
        };

        let bytes = match bytes {
            Ok(bytes) => bytes,
            Err(e) => {
                return ActionResult::retriable(format!("connector response read failed: {e}"));
            }
        };

        match serde_json::from_slice::<ActionResult>(&bytes) {
            Ok(result) => result,
            Err(e) => {
                warn!(action_type, %status, error = %e, "connector returned malformed body");
                ActionResult::retriable(format!(
                    "connector returned HTTP {status} with malformed body: {e}"
                ))
            }
        }
    }

    fn resolve_url(&self, remote: &RemoteAction) -> Option<String> {
        if let Some(url) = &remote.endpoint_url {
            return Some(url.clone());
        }

        self.connectors
            .get(&remote.connector_id)
            .map(|c| format!("{}{}", c.url.trim_end_matches('/'), EXECUTE_PATH))
    }
}
