//! Sub-workflow invocation
//!
//! A sub-workflow node renders its parameters into the child's trigger and
//! starts a child execution through the same conductor. Depth and recursion
//! limits are enforced before any child row exists; the child request id is a
//! deterministic hash of `(parent execution, node, attempt)` so a retried
//! node re-joins the child it already started instead of spawning another.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use flowmill_model::{ActionResult, ExecutionStatus};

use crate::conductor::{Conductor, RunState};
use crate::events::{EventCategory, EventLevel};
use crate::persistence::{GatewayError, HierarchyRecord, NewExecution};
use crate::registry::ActionInvocation;

/// Deterministic idempotency key for a child execution
pub(crate) fn child_request_id(parent_execution_id: uuid::Uuid, node_id: &str, attempt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent_execution_id.as_bytes());
    hasher.update(b":");
    hasher.update(node_id.as_bytes());
    hasher.update(b":");
    hasher.update(attempt.to_be_bytes());
    hex::encode(hasher.finalize())
}

pub(crate) async fn run_subworkflow(
    conductor: &Arc<Conductor>,
    run: &Arc<RunState>,
    child_workflow_id: &str,
    pinned_version: Option<i32>,
    wait_for_completion: bool,
    params: &Value,
    inv: &ActionInvocation,
) -> ActionResult {
    let options = &conductor.config().subworkflow;

    // Guards run before any child row is created
    if run.ctx.depth() + 1 > options.max_nesting_depth {
        let message = format!(
            "sub-workflow nesting depth {} exceeds the limit of {}",
            run.ctx.depth() + 1,
            options.max_nesting_depth
        );
        conductor
            .record_event(
                run,
                EventLevel::Error,
                EventCategory::SubworkflowRejected,
                json!({ "nodeId": inv.node_id, "workflowId": child_workflow_id, "reason": "depth" }),
            )
            .await;
        return ActionResult::failed(message);
    }

    if !options.allow_recursion {
        let recursive = child_workflow_id == run.plan.workflow_id
            || run.ctx.ancestors().iter().any(|a| a == child_workflow_id);
        if recursive {
            conductor
                .record_event(
                    run,
                    EventLevel::Error,
                    EventCategory::SubworkflowRejected,
                    json!({ "nodeId": inv.node_id, "workflowId": child_workflow_id, "reason": "recursion" }),
                )
                .await;
            return ActionResult::failed(format!(
                "workflow '{child_workflow_id}' already appears in the ancestor chain"
            ));
        }
    }

    let request_id = child_request_id(run.execution_id, &inv.node_id, inv.attempt);

    let started = match conductor
        .gateway()
        .start_execution(NewExecution {
            workflow_id: child_workflow_id.to_string(),
            request_id,
            workflow_version: pinned_version,
            trigger: params.clone(),
            parent_execution_id: Some(run.execution_id),
            principal: run.principal.clone(),
            tenant_id: run.ctx.tenant_id().map(str::to_string),
            correlation_id: Some(run.ctx.correlation_id().to_string()),
            allow_draft: conductor.config().catalog.allow_draft_execution,
        })
        .await
    {
        Ok(started) => started,
        Err(
            e @ (GatewayError::WorkflowNotFound(_)
            | GatewayError::WorkflowNotActive(_)
            | GatewayError::WorkflowDisabled(_)
            | GatewayError::RequestIdConflict { .. }),
        ) => return ActionResult::failed(format!("sub-workflow start rejected: {e}")),
        Err(e) => return ActionResult::retriable(format!("sub-workflow start failed: {e}")),
    };

    let child_id = started.execution_id;
    debug!(
        parent = %run.execution_id,
        child = %child_id,
        workflow_id = child_workflow_id,
        was_existing = started.was_existing,
        "starting sub-workflow"
    );

    if let Err(e) = conductor
        .gateway()
        .record_hierarchy(&HierarchyRecord {
            parent_execution_id: run.execution_id,
            child_execution_id: child_id,
            parent_node_id: inv.node_id.clone(),
        })
        .await
    {
        return ActionResult::retriable(format!("failed to record hierarchy: {e}"));
    }

    if !wait_for_completion {
        // Fire and forget: the child runs detached on the same conductor
        let detached = Arc::clone(conductor);
        tokio::spawn(async move {
            if let Err(e) = detached.execute_boxed(child_id).await {
                warn!(child = %child_id, error = %e, "detached sub-workflow run failed");
            }
        });

        let mut outputs = Map::new();
        outputs.insert("executionId".to_string(), json!(child_id.to_string()));
        return ActionResult::succeeded(outputs);
    }

    // Drive the child inline and forward a cancel exactly once. The child
    // future is never dropped mid-run: after forwarding we keep awaiting so
    // the child can settle into a terminal status.
    let exec_fut = Arc::clone(conductor).execute_boxed(child_id);
    tokio::pin!(exec_fut);
    let mut cancel_forwarded = false;

    let outcome = loop {
        tokio::select! {
            outcome = &mut exec_fut => break outcome,
            _ = inv.cancel.cancelled(), if !cancel_forwarded => {
                cancel_forwarded = true;
                if let Err(e) = conductor.cancel(child_id).await {
                    warn!(child = %child_id, error = %e, "failed to forward cancel to sub-workflow");
                }
            }
        }
    };

    let mut status = match outcome {
        Ok(status) => status,
        Err(e) => return ActionResult::failed(format!("sub-workflow run failed: {e}")),
    };

    // Claimed by another runner: wait for the store to report a terminal state
    while !status.is_terminal() {
        if inv.cancel.is_cancelled() {
            return ActionResult::retriable("sub-workflow wait cancelled");
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
        status = match conductor.gateway().get_execution(child_id).await {
            Ok(record) => record.status,
            Err(e) => return ActionResult::retriable(format!("sub-workflow poll failed: {e}")),
        };
    }

    match status {
        ExecutionStatus::Succeeded => {
            let child_data = match conductor.gateway().get_execution(child_id).await {
                Ok(record) => record
                    .context_snapshot
                    .and_then(|snapshot| snapshot.get("data").cloned())
                    .unwrap_or_else(|| json!({})),
                Err(e) => {
                    return ActionResult::retriable(format!(
                        "failed to load sub-workflow outputs: {e}"
                    ))
                }
            };

            let mut outputs = Map::new();
            outputs.insert("executionId".to_string(), json!(child_id.to_string()));
            outputs.insert("outputs".to_string(), child_data);
            ActionResult::succeeded(outputs)
        }
        ExecutionStatus::Failed => {
            ActionResult::failed(format!("sub-workflow execution {child_id} failed"))
        }
        ExecutionStatus::Cancelled => {
            ActionResult::failed(format!("sub-workflow execution {child_id} was cancelled"))
        }
        ExecutionStatus::Pending | ExecutionStatus::Running => unreachable!("terminal loop"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_child_request_id_deterministic() {
        let parent = Uuid::now_v7();
        assert_eq!(
            child_request_id(parent, "n1", 1),
            child_request_id(parent, "n1", 1)
        );
    }

    #[test]
    fn test_child_request_id_varies_by_inputs() {
        let parent = Uuid::now_v7();
        let base = child_request_id(parent, "n1", 1);

        assert_ne!(base, child_request_id(parent, "n1", 2));
        assert_ne!(base, child_request_id(parent, "n2", 1));
        assert_ne!(base, child_request_id(Uuid::now_v7(), "n1", 1));
    }
}
