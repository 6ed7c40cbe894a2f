//! End-to-end conductor tests against the in-memory gateway
//!
//! These drive full workflows through the engine: publish, start, run, and
//! then assert on the persisted rows rather than in-process state.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use flowmill_engine::prelude::*;
use flowmill_engine::{AttemptRecord, EngineConfig, EventCategory};
use flowmill_model::ActionStatus;

fn test_engine(config: EngineConfig) -> (Arc<Engine>, Arc<InMemoryGateway>, Arc<ActionRegistry>) {
    let gateway = Arc::new(InMemoryGateway::new());
    let registry = Arc::new(ActionRegistry::with_builtins());
    let engine = Arc::new(Engine::new(
        gateway.clone() as Arc<dyn PersistenceGateway>,
        registry.clone(),
        config,
    ));
    (engine, gateway, registry)
}

async fn create_and_publish(engine: &Engine, definition: Value) -> String {
    let definition = WorkflowDefinition::from_value(definition).unwrap();
    let workflow_id = definition.id.clone();
    engine
        .lifecycle()
        .create_workflow(&workflow_id, &definition.display_name, None, Some(&definition))
        .await
        .unwrap();
    engine.publish(&workflow_id, true).await.unwrap();
    workflow_id
}

async fn node_attempts(
    gateway: &InMemoryGateway,
    execution_id: uuid::Uuid,
    node_id: &str,
) -> Vec<AttemptRecord> {
    gateway
        .load_attempts(execution_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.node_id == node_id)
        .collect()
}

// ============================================
// Scenario A: linear two-node echo
// ============================================

#[tokio::test]
async fn test_linear_two_node_echo() {
    let (engine, gateway, _) = test_engine(EngineConfig::default());
    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "echo-line",
            "displayName": "Echo Line",
            "startNode": "n1",
            "nodes": [
                { "id": "n1", "actionType": "core.echo",
                  "parameters": { "msg": "A" },
                  "edges": [{ "targetNode": "n2" }] },
                { "id": "n2", "actionType": "core.echo",
                  "parameters": { "msg": "B" } }
            ]
        }),
    )
    .await;

    let (run, status) = engine
        .execute_and_wait(&workflow_id, ExecuteRequest::new(json!({})))
        .await
        .unwrap();

    assert_eq!(status, ExecutionStatus::Succeeded);

    let attempts = gateway.load_attempts(run.execution_id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| a.status == ActionStatus::Succeeded));

    let record = gateway.get_execution(run.execution_id).await.unwrap();
    let snapshot = record.context_snapshot.unwrap();
    assert_eq!(snapshot["data"]["n1"]["msg"], json!("A"));
    assert_eq!(snapshot["data"]["n2"]["msg"], json!("B"));
}

// ============================================
// Scenario B: retriable failures then success
// ============================================

#[tokio::test]
async fn test_retriable_then_success() {
    let (engine, gateway, registry) = test_engine(EngineConfig::default());

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    registry.register_local_fn("test.flaky", move |_ctx, _params| {
        let counter = counter.clone();
        async move {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                ActionResult::retriable("transient failure")
            } else {
                ActionResult::succeeded(Default::default())
            }
        }
    });

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "flaky",
            "displayName": "Flaky",
            "startNode": "n1",
            "nodes": [
                { "id": "n1", "actionType": "test.flaky",
                  "policies": { "retry": { "maxAttempts": 3, "baseDelayMs": 10,
                                           "backoffFactor": 1.0, "jitter": false } } }
            ]
        }),
    )
    .await;

    let (run, status) = engine
        .execute_and_wait(&workflow_id, ExecuteRequest::new(json!({})))
        .await
        .unwrap();

    assert_eq!(status, ExecutionStatus::Succeeded);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let attempts = node_attempts(&gateway, run.execution_id, "n1").await;
    assert_eq!(attempts.len(), 3);
    assert_eq!(attempts[0].attempt, 1);
    assert_eq!(attempts[0].status, ActionStatus::RetriableFailure);
    assert_eq!(attempts[1].status, ActionStatus::RetriableFailure);
    assert_eq!(attempts[2].status, ActionStatus::Succeeded);

    // The maximum-attempt row is terminal and retry_count tracks attempt - 1
    let last = attempts.last().unwrap();
    assert!(last.status.is_terminal());
    assert_eq!(last.retry_count, last.attempt - 1);
}

#[tokio::test]
async fn test_zero_retry_policy_promotes_immediately() {
    let (engine, gateway, registry) = test_engine(EngineConfig::default());

    registry.register_local_fn("test.always-retriable", |_ctx, _params| async {
        ActionResult::retriable("still down")
    });

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "no-retry",
            "displayName": "No Retry",
            "startNode": "n1",
            "nodes": [
                { "id": "n1", "actionType": "test.always-retriable",
                  "policies": { "retry": { "maxAttempts": 0, "baseDelayMs": 10,
                                           "backoffFactor": 1.0 } } }
            ]
        }),
    )
    .await;

    let (run, status) = engine
        .execute_and_wait(&workflow_id, ExecuteRequest::new(json!({})))
        .await
        .unwrap();

    assert_eq!(status, ExecutionStatus::Failed);

    let attempts = node_attempts(&gateway, run.execution_id, "n1").await;
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, ActionStatus::Failed);
}

// ============================================
// Scenario C: fan-out/fan-in with a false condition
// ============================================

#[tokio::test]
async fn test_fan_in_with_false_condition_branch() {
    let (engine, gateway, _) = test_engine(EngineConfig::default());

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "fan",
            "displayName": "Fan",
            "startNode": "a",
            "nodes": [
                { "id": "a", "actionType": "core.echo",
                  "edges": [
                    { "targetNode": "b", "condition": "true" },
                    { "targetNode": "c", "condition": "false" }
                  ] },
                { "id": "b", "actionType": "core.echo",
                  "edges": [{ "targetNode": "d" }] },
                { "id": "c", "actionType": "core.echo",
                  "edges": [{ "targetNode": "d" }] },
                { "id": "d", "actionType": "core.echo" }
            ]
        }),
    )
    .await;

    let (run, status) = engine
        .execute_and_wait(&workflow_id, ExecuteRequest::new(json!({})))
        .await
        .unwrap();

    assert_eq!(status, ExecutionStatus::Succeeded);

    // The false branch leaves no trace; the join fires on the live parent
    assert!(node_attempts(&gateway, run.execution_id, "c").await.is_empty());
    for node in ["a", "b", "d"] {
        let attempts = node_attempts(&gateway, run.execution_id, node).await;
        assert_eq!(attempts.len(), 1, "node {node}");
        assert_eq!(attempts[0].status, ActionStatus::Succeeded, "node {node}");
    }
}

// ============================================
// Scenario D: permanent failure cancels the run
// ============================================

#[tokio::test]
async fn test_permanent_failure_cancels_branches() {
    let (engine, gateway, registry) = test_engine(EngineConfig::default());

    registry.register_local_fn("test.slow-echo", |_ctx, _params| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        ActionResult::succeeded(Default::default())
    });

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "fail-fast",
            "displayName": "Fail Fast",
            "startNode": "start",
            "nodes": [
                { "id": "start", "actionType": "core.noop",
                  "edges": [{ "targetNode": "p" }, { "targetNode": "q" }] },
                { "id": "p", "actionType": "core.fail",
                  "parameters": { "message": "boom" },
                  "edges": [{ "targetNode": "j" }] },
                { "id": "q", "actionType": "test.slow-echo",
                  "edges": [{ "targetNode": "j" }] },
                { "id": "j", "actionType": "core.echo" }
            ]
        }),
    )
    .await;

    let (run, status) = engine
        .execute_and_wait(&workflow_id, ExecuteRequest::new(json!({})))
        .await
        .unwrap();

    assert_eq!(status, ExecutionStatus::Failed);

    let p = node_attempts(&gateway, run.execution_id, "p").await;
    assert_eq!(p.last().unwrap().status, ActionStatus::Failed);

    // Raced: q completed before observing the cancel, or was skipped
    let q = node_attempts(&gateway, run.execution_id, "q").await;
    assert!(matches!(
        q.last().unwrap().status,
        ActionStatus::Succeeded | ActionStatus::Skipped
    ));

    let j = node_attempts(&gateway, run.execution_id, "j").await;
    assert_eq!(j.last().unwrap().status, ActionStatus::Skipped);

    let events = gateway.list_events(run.execution_id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.category == EventCategory::CancelTriggered));
}

// ============================================
// Scenario E: cross-run resource link idempotency
// ============================================

#[tokio::test]
async fn test_resource_link_conflict_across_runs() {
    let (engine, gateway, registry) = test_engine(EngineConfig::default());

    registry.register_local_fn("test.create-message", |_ctx, _params| async {
        ActionResult::succeeded(Default::default())
            .with_resource_link(ResourceLinkRef::new("slack", "message", "M1"))
    });

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "linker",
            "displayName": "Linker",
            "startNode": "l",
            "nodes": [{ "id": "l", "actionType": "test.create-message" }]
        }),
    )
    .await;

    let (run1, status1) = engine
        .execute_and_wait(
            &workflow_id,
            ExecuteRequest::new(json!({})).with_request_id("r1"),
        )
        .await
        .unwrap();
    assert_eq!(status1, ExecutionStatus::Succeeded);

    // A different run claiming the same tuple fails permanently
    let (run2, status2) = engine
        .execute_and_wait(
            &workflow_id,
            ExecuteRequest::new(json!({})).with_request_id("r2"),
        )
        .await
        .unwrap();
    assert_eq!(status2, ExecutionStatus::Failed);

    let attempts = node_attempts(&gateway, run2.execution_id, "l").await;
    assert_eq!(attempts.last().unwrap().status, ActionStatus::Failed);

    // The original owner is untouched
    let link = gateway
        .find_resource_link("slack", "message", "M1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(link.execution_id, run1.execution_id);

    let events = gateway.list_events(run2.execution_id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.category == EventCategory::ResourceLinkConflict));
}

// ============================================
// Scenario F: publish idempotence through the engine
// ============================================

#[tokio::test]
async fn test_publish_idempotence() {
    let (engine, _, _) = test_engine(EngineConfig::default());

    let v1 = WorkflowDefinition::from_value(json!({
        "id": "pub",
        "displayName": "Pub",
        "startNode": "a",
        "nodes": [{ "id": "a", "actionType": "core.echo", "parameters": { "msg": "1" } }]
    }))
    .unwrap();

    engine
        .lifecycle()
        .create_workflow("pub", "Pub", None, Some(&v1))
        .await
        .unwrap();

    let first = engine.publish("pub", true).await.unwrap();
    assert_eq!(first.version, 1);

    let again = engine.publish("pub", true).await.unwrap();
    assert_eq!(again.version, 1);
    assert!(again.was_existing);

    let v2 = WorkflowDefinition::from_value(json!({
        "id": "pub",
        "displayName": "Pub",
        "startNode": "a",
        "nodes": [{ "id": "a", "actionType": "core.echo", "parameters": { "msg": "2" } }]
    }))
    .unwrap();
    engine.lifecycle().update_draft("pub", &v2).await.unwrap();

    let third = engine.publish("pub", true).await.unwrap();
    assert_eq!(third.version, 2);
    assert!(!third.was_existing);
}

// ============================================
// Routing behaviors
// ============================================

#[tokio::test]
async fn test_on_failure_handler_runs_and_run_fails() {
    let (engine, gateway, _) = test_engine(EngineConfig::default());

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "compensated",
            "displayName": "Compensated",
            "startNode": "a",
            "nodes": [
                { "id": "a", "actionType": "core.fail",
                  "parameters": { "message": "expected" },
                  "onFailure": "cleanup" },
                { "id": "cleanup", "actionType": "core.echo",
                  "parameters": { "note": "compensated" } }
            ]
        }),
    )
    .await;

    let (run, status) = engine
        .execute_and_wait(&workflow_id, ExecuteRequest::new(json!({})))
        .await
        .unwrap();

    // A permanent failure always fails the run, even with failure routing
    assert_eq!(status, ExecutionStatus::Failed);

    let a = node_attempts(&gateway, run.execution_id, "a").await;
    assert_eq!(a.last().unwrap().status, ActionStatus::Failed);

    // The cleanup node still ran to completion before the run closed out
    let cleanup = node_attempts(&gateway, run.execution_id, "cleanup").await;
    assert_eq!(cleanup.last().unwrap().status, ActionStatus::Succeeded);

    let events = gateway.list_events(run.execution_id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.category == EventCategory::CancelTriggered));
}

#[tokio::test]
async fn test_first_match_routing_stops_at_first_satisfied_edge() {
    let (engine, gateway, _) = test_engine(EngineConfig::default());

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "route",
            "displayName": "Route",
            "startNode": "a",
            "nodes": [
                { "id": "a", "actionType": "core.echo", "routePolicy": "firstMatch",
                  "edges": [
                    { "targetNode": "b", "condition": "true" },
                    { "targetNode": "c", "condition": "true" }
                  ] },
                { "id": "b", "actionType": "core.echo" },
                { "id": "c", "actionType": "core.echo" }
            ]
        }),
    )
    .await;

    let (run, status) = engine
        .execute_and_wait(&workflow_id, ExecuteRequest::new(json!({})))
        .await
        .unwrap();

    assert_eq!(status, ExecutionStatus::Succeeded);
    assert_eq!(node_attempts(&gateway, run.execution_id, "b").await.len(), 1);
    assert!(node_attempts(&gateway, run.execution_id, "c").await.is_empty());
}

#[tokio::test]
async fn test_condition_error_reads_false_and_records_event() {
    let (engine, gateway, _) = test_engine(EngineConfig::default());

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "soft-cond",
            "displayName": "Soft Cond",
            "startNode": "a",
            "nodes": [
                { "id": "a", "actionType": "core.echo",
                  "edges": [{ "targetNode": "b", "condition": "trigger | bogus_filter" }] },
                { "id": "b", "actionType": "core.echo" }
            ]
        }),
    )
    .await;

    let (run, status) = engine
        .execute_and_wait(&workflow_id, ExecuteRequest::new(json!({})))
        .await
        .unwrap();

    // The run still succeeds; the edge just reads false
    assert_eq!(status, ExecutionStatus::Succeeded);
    assert!(node_attempts(&gateway, run.execution_id, "b").await.is_empty());

    let events = gateway.list_events(run.execution_id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.category == EventCategory::ConditionError));
}

#[tokio::test]
async fn test_templates_render_trigger_and_context() {
    let (engine, gateway, _) = test_engine(EngineConfig::default());

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "tmpl",
            "displayName": "Tmpl",
            "startNode": "fetch",
            "nodes": [
                { "id": "fetch", "actionType": "core.echo",
                  "parameters": { "name": "{{ trigger.name }}" },
                  "edges": [{ "targetNode": "greet" }] },
                { "id": "greet", "actionType": "core.echo",
                  "parameters": { "greeting": "hello {{ context.fetch.name }}" } }
            ]
        }),
    )
    .await;

    let (run, status) = engine
        .execute_and_wait(&workflow_id, ExecuteRequest::new(json!({ "name": "ada" })))
        .await
        .unwrap();

    assert_eq!(status, ExecutionStatus::Succeeded);

    let record = gateway.get_execution(run.execution_id).await.unwrap();
    let snapshot = record.context_snapshot.unwrap();
    assert_eq!(snapshot["data"]["greet"]["greeting"], json!("hello ada"));
}

// ============================================
// Timeouts and cancellation
// ============================================

#[tokio::test]
async fn test_node_timeout_is_permanent_failure() {
    let (engine, gateway, registry) = test_engine(EngineConfig::default());

    registry.register_local_fn("test.sleepy", |_ctx, _params| async {
        tokio::time::sleep(Duration::from_millis(500)).await;
        ActionResult::succeeded(Default::default())
    });

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "sleepy",
            "displayName": "Sleepy",
            "startNode": "n1",
            "nodes": [
                { "id": "n1", "actionType": "test.sleepy",
                  "policies": { "timeoutMs": 50 } }
            ]
        }),
    )
    .await;

    let (run, status) = engine
        .execute_and_wait(&workflow_id, ExecuteRequest::new(json!({})))
        .await
        .unwrap();

    assert_eq!(status, ExecutionStatus::Failed);

    let attempts = node_attempts(&gateway, run.execution_id, "n1").await;
    assert_eq!(attempts.last().unwrap().status, ActionStatus::Failed);
    let error = attempts.last().unwrap().error.clone().unwrap();
    assert!(error["message"].as_str().unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_workflow_timeout_cancels_run() {
    let config = EngineConfig::default().with_default_workflow_timeout(Duration::from_millis(100));
    let (engine, _, registry) = test_engine(config);

    registry.register_local_fn("test.slow", |_ctx, _params| async {
        tokio::time::sleep(Duration::from_millis(400)).await;
        ActionResult::succeeded(Default::default())
    });

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "timeout",
            "displayName": "Timeout",
            "startNode": "n1",
            "nodes": [
                { "id": "n1", "actionType": "test.slow",
                  "edges": [{ "targetNode": "n2" }] },
                { "id": "n2", "actionType": "core.echo" }
            ]
        }),
    )
    .await;

    let (_, status) = engine
        .execute_and_wait(&workflow_id, ExecuteRequest::new(json!({})))
        .await
        .unwrap();

    assert_eq!(status, ExecutionStatus::Cancelled);
}

#[tokio::test]
async fn test_external_cancel() {
    let (engine, gateway, registry) = test_engine(EngineConfig::default());

    registry.register_local_fn("test.slow", |_ctx, _params| async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        ActionResult::succeeded(Default::default())
    });

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "cancel-me",
            "displayName": "Cancel Me",
            "startNode": "n1",
            "nodes": [
                { "id": "n1", "actionType": "test.slow",
                  "edges": [{ "targetNode": "n2" }] },
                { "id": "n2", "actionType": "core.echo" }
            ]
        }),
    )
    .await;

    let started = engine
        .start_execution(&workflow_id, ExecuteRequest::new(json!({})))
        .await
        .unwrap();

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_execution(started.execution_id).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine.cancel_execution(started.execution_id).await.unwrap();

    let status = runner.await.unwrap().unwrap();
    assert_eq!(status, ExecutionStatus::Cancelled);

    // The node after the in-flight one never ran
    let n2 = node_attempts(&gateway, started.execution_id, "n2").await;
    assert_eq!(n2.last().unwrap().status, ActionStatus::Skipped);
}

// ============================================
// Idempotent starts and re-entry
// ============================================

#[tokio::test]
async fn test_start_is_idempotent_and_rerun_is_safe() {
    let (engine, gateway, _) = test_engine(EngineConfig::default());

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "idem",
            "displayName": "Idem",
            "startNode": "n1",
            "nodes": [{ "id": "n1", "actionType": "core.echo" }]
        }),
    )
    .await;

    let request = ExecuteRequest::new(json!({})).with_request_id("req-1");
    let first = engine
        .start_execution(&workflow_id, request.clone())
        .await
        .unwrap();
    let second = engine.start_execution(&workflow_id, request).await.unwrap();

    assert_eq!(first.execution_id, second.execution_id);
    assert!(!first.was_existing);
    assert!(second.was_existing);

    let status = engine.run_execution(first.execution_id).await.unwrap();
    assert_eq!(status, ExecutionStatus::Succeeded);

    // Re-entering a terminal execution returns its status without rerunning
    let rows_before = gateway.load_attempts(first.execution_id).await.unwrap().len();
    let again = engine.run_execution(first.execution_id).await.unwrap();
    assert_eq!(again, ExecutionStatus::Succeeded);
    let rows_after = gateway.load_attempts(first.execution_id).await.unwrap().len();
    assert_eq!(rows_before, rows_after);
}

#[tokio::test]
async fn test_request_id_conflict_across_workflows() {
    let (engine, _, _) = test_engine(EngineConfig::default());

    for id in ["one", "two"] {
        create_and_publish(
            &engine,
            json!({
                "id": id,
                "displayName": id,
                "startNode": "a",
                "nodes": [{ "id": "a", "actionType": "core.echo" }]
            }),
        )
        .await;
    }

    engine
        .start_execution("one", ExecuteRequest::new(json!({})).with_request_id("shared"))
        .await
        .unwrap();

    let err = engine
        .start_execution("two", ExecuteRequest::new(json!({})).with_request_id("shared"))
        .await
        .unwrap_err();

    assert_eq!(err.code(), Some("WFENG001"));
}

#[tokio::test]
async fn test_archived_workflow_rejects_new_starts() {
    let (engine, _, _) = test_engine(EngineConfig::default());

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "retiree",
            "displayName": "Retiree",
            "startNode": "a",
            "nodes": [{ "id": "a", "actionType": "core.echo" }]
        }),
    )
    .await;

    engine.lifecycle().archive(&workflow_id).await.unwrap();

    let err = engine
        .start_execution(&workflow_id, ExecuteRequest::new(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::WorkflowNotActive(_)));
}

// ============================================
// Parallelism
// ============================================

#[tokio::test]
async fn test_independent_branches_run_in_parallel() {
    let (engine, _, registry) = test_engine(EngineConfig::default().with_max_parallel_actions(4));

    registry.register_local_fn("test.pause", |_ctx, _params| async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        ActionResult::succeeded(Default::default())
    });

    let workflow_id = create_and_publish(
        &engine,
        json!({
            "id": "wide",
            "displayName": "Wide",
            "startNode": "s",
            "nodes": [
                { "id": "s", "actionType": "core.noop",
                  "edges": [
                    { "targetNode": "b1" }, { "targetNode": "b2" }, { "targetNode": "b3" }
                  ] },
                { "id": "b1", "actionType": "test.pause" },
                { "id": "b2", "actionType": "test.pause" },
                { "id": "b3", "actionType": "test.pause" }
            ]
        }),
    )
    .await;

    let started = std::time::Instant::now();
    let (_, status) = engine
        .execute_and_wait(&workflow_id, ExecuteRequest::new(json!({})))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert_eq!(status, ExecutionStatus::Succeeded);
    // Three 150ms branches sequentially would take 450ms+
    assert!(
        elapsed < Duration::from_millis(400),
        "branches did not overlap: {elapsed:?}"
    );
}
