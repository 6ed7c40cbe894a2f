//! Sub-workflow invocation tests against the in-memory gateway

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use flowmill_engine::prelude::*;
use flowmill_engine::{EngineConfig, SubworkflowOptions};
use flowmill_model::ActionStatus;

fn test_engine(config: EngineConfig) -> (Arc<Engine>, Arc<InMemoryGateway>) {
    let gateway = Arc::new(InMemoryGateway::new());
    let registry = Arc::new(ActionRegistry::with_builtins());
    let engine = Arc::new(Engine::new(
        gateway.clone() as Arc<dyn PersistenceGateway>,
        registry,
        config,
    ));
    (engine, gateway)
}

async fn create_and_publish(engine: &Engine, definition: Value) {
    let definition = WorkflowDefinition::from_value(definition).unwrap();
    engine
        .lifecycle()
        .create_workflow(
            &definition.id,
            &definition.display_name,
            None,
            Some(&definition),
        )
        .await
        .unwrap();
    engine.publish(&definition.id, true).await.unwrap();
}

fn child_definition() -> Value {
    json!({
        "id": "child-flow",
        "displayName": "Child",
        "startNode": "c1",
        "nodes": [
            { "id": "c1", "actionType": "core.echo",
              "parameters": { "got": "{{ trigger.input }}" } }
        ]
    })
}

fn parent_definition(wait: bool) -> Value {
    json!({
        "id": "parent-flow",
        "displayName": "Parent",
        "startNode": "sub",
        "nodes": [
            { "id": "sub", "nodeType": "subworkflow", "workflowId": "child-flow",
              "waitForCompletion": wait,
              "parameters": { "input": "{{ trigger.value }}" } }
        ]
    })
}

#[tokio::test]
async fn test_subworkflow_waits_and_merges_outputs() {
    let (engine, gateway) = test_engine(EngineConfig::default());
    create_and_publish(&engine, child_definition()).await;
    create_and_publish(&engine, parent_definition(true)).await;

    let (run, status) = engine
        .execute_and_wait(
            "parent-flow",
            ExecuteRequest::new(json!({ "value": "hello" })).with_tenant_id("acme"),
        )
        .await
        .unwrap();

    assert_eq!(status, ExecutionStatus::Succeeded);

    // Hierarchy row points at the child
    let children = gateway.list_children(run.execution_id).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].parent_node_id, "sub");

    let child = gateway
        .get_execution(children[0].child_execution_id)
        .await
        .unwrap();
    assert_eq!(child.status, ExecutionStatus::Succeeded);
    assert_eq!(child.workflow_id, "child-flow");
    // Rendered parent parameters became the child trigger
    assert_eq!(child.trigger, json!({ "input": "hello" }));

    // Tenant and correlation are inherited
    let parent = gateway.get_execution(run.execution_id).await.unwrap();
    assert_eq!(child.tenant_id.as_deref(), Some("acme"));
    assert_eq!(child.correlation_id, parent.correlation_id);
    assert_eq!(child.parent_execution_id, Some(run.execution_id));

    // Child outputs are merged under the node id
    let snapshot = parent.context_snapshot.unwrap();
    assert_eq!(
        snapshot["data"]["sub"]["outputs"]["c1"]["got"],
        json!("hello")
    );
    assert_eq!(
        snapshot["data"]["sub"]["executionId"],
        json!(child.id.to_string())
    );
}

#[tokio::test]
async fn test_subworkflow_fire_and_forget() {
    let (engine, gateway) = test_engine(EngineConfig::default());
    create_and_publish(&engine, child_definition()).await;
    create_and_publish(&engine, parent_definition(false)).await;

    let (run, status) = engine
        .execute_and_wait(
            "parent-flow",
            ExecuteRequest::new(json!({ "value": "bg" })),
        )
        .await
        .unwrap();

    // The parent completes without waiting on the child
    assert_eq!(status, ExecutionStatus::Succeeded);

    let children = gateway.list_children(run.execution_id).await.unwrap();
    assert_eq!(children.len(), 1);
    let child_id = children[0].child_execution_id;

    // The detached child finishes on its own shortly after
    let mut child_status = gateway.get_execution(child_id).await.unwrap().status;
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while !child_status.is_terminal() && std::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
        child_status = gateway.get_execution(child_id).await.unwrap().status;
    }
    assert_eq!(child_status, ExecutionStatus::Succeeded);
}

#[tokio::test]
async fn test_child_failure_fails_parent_node() {
    let (engine, gateway) = test_engine(EngineConfig::default());

    create_and_publish(
        &engine,
        json!({
            "id": "child-flow",
            "displayName": "Child",
            "startNode": "c1",
            "nodes": [
                { "id": "c1", "actionType": "core.fail",
                  "parameters": { "message": "child broke" } }
            ]
        }),
    )
    .await;
    create_and_publish(&engine, parent_definition(true)).await;

    let (run, status) = engine
        .execute_and_wait("parent-flow", ExecuteRequest::new(json!({ "value": "x" })))
        .await
        .unwrap();

    assert_eq!(status, ExecutionStatus::Failed);

    let attempts = gateway.load_attempts(run.execution_id).await.unwrap();
    let sub = attempts.iter().find(|a| a.node_id == "sub").unwrap();
    assert_eq!(sub.status, ActionStatus::Failed);

    // The child run itself is recorded as failed
    let children = gateway.list_children(run.execution_id).await.unwrap();
    let child = gateway
        .get_execution(children[0].child_execution_id)
        .await
        .unwrap();
    assert_eq!(child.status, ExecutionStatus::Failed);
}

#[tokio::test]
async fn test_recursion_rejected_before_child_exists() {
    let (engine, gateway) = test_engine(EngineConfig::default());

    create_and_publish(
        &engine,
        json!({
            "id": "ouroboros",
            "displayName": "Ouroboros",
            "startNode": "sub",
            "nodes": [
                { "id": "sub", "nodeType": "subworkflow", "workflowId": "ouroboros" }
            ]
        }),
    )
    .await;

    let (run, status) = engine
        .execute_and_wait("ouroboros", ExecuteRequest::new(json!({})))
        .await
        .unwrap();

    assert_eq!(status, ExecutionStatus::Failed);

    // Rejected before any child row was created
    assert!(gateway.list_children(run.execution_id).await.unwrap().is_empty());
    assert_eq!(gateway.execution_count(), 1);
}

#[tokio::test]
async fn test_nesting_depth_limit() {
    let config = EngineConfig::default().with_subworkflow(SubworkflowOptions {
        max_nesting_depth: 1,
        ..Default::default()
    });
    let (engine, gateway) = test_engine(config);

    // grand -> middle -> leaf: the middle's sub-workflow node exceeds depth 1
    create_and_publish(
        &engine,
        json!({
            "id": "leaf",
            "displayName": "Leaf",
            "startNode": "l",
            "nodes": [{ "id": "l", "actionType": "core.echo" }]
        }),
    )
    .await;
    create_and_publish(
        &engine,
        json!({
            "id": "middle",
            "displayName": "Middle",
            "startNode": "m",
            "nodes": [
                { "id": "m", "nodeType": "subworkflow", "workflowId": "leaf" }
            ]
        }),
    )
    .await;
    create_and_publish(
        &engine,
        json!({
            "id": "grand",
            "displayName": "Grand",
            "startNode": "g",
            "nodes": [
                { "id": "g", "nodeType": "subworkflow", "workflowId": "middle" }
            ]
        }),
    )
    .await;

    // Depth 1 alone is fine
    let (_, mid_status) = engine
        .execute_and_wait("middle", ExecuteRequest::new(json!({})))
        .await
        .unwrap();
    assert_eq!(mid_status, ExecutionStatus::Succeeded);

    // Depth 2 is rejected before the leaf child is created
    let (run, status) = engine
        .execute_and_wait("grand", ExecuteRequest::new(json!({})))
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Failed);

    let children = gateway.list_children(run.execution_id).await.unwrap();
    assert_eq!(children.len(), 1);
    let middle_run = gateway
        .get_execution(children[0].child_execution_id)
        .await
        .unwrap();
    assert_eq!(middle_run.status, ExecutionStatus::Failed);
    assert!(gateway
        .list_children(middle_run.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_retried_subworkflow_node_reuses_child() {
    // The child request id is deterministic per (execution, node, attempt),
    // so re-running a terminal parent never spawns a second child.
    let (engine, gateway) = test_engine(EngineConfig::default());
    create_and_publish(&engine, child_definition()).await;
    create_and_publish(&engine, parent_definition(true)).await;

    let (run, status) = engine
        .execute_and_wait(
            "parent-flow",
            ExecuteRequest::new(json!({ "value": "once" })),
        )
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Succeeded);

    // Idempotent re-entry leaves the hierarchy unchanged
    let again = engine.run_execution(run.execution_id).await.unwrap();
    assert_eq!(again, ExecutionStatus::Succeeded);
    assert_eq!(gateway.list_children(run.execution_id).await.unwrap().len(), 1);

    // Parent + one child only
    assert_eq!(gateway.execution_count(), 2);
}
