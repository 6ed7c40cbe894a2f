//! Engine façade
//!
//! Wires the configuration snapshot, persistence gateway, action registry,
//! evaluators, planner, conductor, and lifecycle manager into one entry
//! point. Start requests come in as [`ExecuteRequest`]s; the engine mints a
//! request id when the producer did not supply one and hands the run to the
//! conductor.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;
use uuid::Uuid;

use flowmill_model::{ExecutionStatus, Principal};

use crate::conductor::{Conductor, ConductorError};
use crate::config::EngineConfig;
use crate::eval::{
    ConditionEvaluator, MinijinjaConditionEvaluator, MinijinjaTemplateEvaluator, TemplateEvaluator,
};
use crate::lifecycle::{LifecycleManager, PublishOutcome};
use crate::persistence::{GatewayError, NewExecution, PersistenceGateway};
use crate::publish::PublishValidator;
use crate::registry::ActionRegistry;
use crate::LifecycleError;

/// A request to start an execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    /// Idempotency key; a UUID is minted when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<Principal>,

    /// Trigger payload handed to the workflow
    #[serde(default)]
    pub trigger: Value,

    /// Accepted for forward compatibility; in-process scheduling is FIFO
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

impl ExecuteRequest {
    pub fn new(trigger: Value) -> Self {
        Self {
            request_id: None,
            principal: None,
            trigger,
            priority: None,
            tenant_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }
}

/// Result of accepting an execute request
#[derive(Debug, Clone, Copy)]
pub struct StartedRun {
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    /// True when the request id matched an existing run
    pub was_existing: bool,
}

/// The workflow engine
///
/// # Example
///
/// ```ignore
/// use flowmill_engine::prelude::*;
///
/// let gateway = Arc::new(InMemoryGateway::new());
/// let registry = Arc::new(ActionRegistry::with_builtins());
/// let engine = Engine::new(gateway, registry, EngineConfig::default());
///
/// engine.lifecycle().create_workflow("greet", "Greeter", None, Some(&definition)).await?;
/// engine.publish("greet", true).await?;
///
/// let (run, status) = engine
///     .execute_and_wait("greet", ExecuteRequest::new(json!({ "name": "ada" })))
///     .await?;
/// ```
pub struct Engine {
    config: EngineConfig,
    gateway: Arc<dyn PersistenceGateway>,
    registry: Arc<ActionRegistry>,
    conductor: Arc<Conductor>,
    lifecycle: LifecycleManager,
}

impl Engine {
    /// Create an engine with the default minijinja evaluators
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        registry: Arc<ActionRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self::with_evaluators(
            gateway,
            registry,
            config,
            Arc::new(MinijinjaTemplateEvaluator::new()),
            Arc::new(MinijinjaConditionEvaluator::new()),
        )
    }

    /// Create an engine with custom template/condition evaluators
    pub fn with_evaluators(
        gateway: Arc<dyn PersistenceGateway>,
        registry: Arc<ActionRegistry>,
        config: EngineConfig,
        templates: Arc<dyn TemplateEvaluator>,
        conditions: Arc<dyn ConditionEvaluator>,
    ) -> Self {
        if config.catalog.auto_register_actions_on_startup {
            crate::builtins::register(&registry);
        }
        if config.catalog.validate_action_schemas_on_startup {
            for issue in registry.validate_schemas() {
                tracing::warn!(%issue, "action schema validation");
            }
        }

        let conductor = Arc::new(Conductor::new(
            gateway.clone(),
            registry.clone(),
            templates.clone(),
            conditions.clone(),
            config.clone(),
        ));
        let lifecycle = LifecycleManager::new(
            gateway.clone(),
            PublishValidator::new(registry.clone(), templates, conditions),
        );

        Self {
            config,
            gateway,
            registry,
            conductor,
            lifecycle,
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        &self.gateway
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Publish the draft of a workflow, invalidating cached plans
    pub async fn publish(
        &self,
        workflow_id: &str,
        auto_activate: bool,
    ) -> Result<PublishOutcome, LifecycleError> {
        let outcome = self.lifecycle.publish(workflow_id, auto_activate).await?;
        if !outcome.was_existing {
            self.conductor.invalidate_plans(workflow_id);
        }
        Ok(outcome)
    }

    /// Idempotently create an execution for a workflow
    #[instrument(skip(self, request), fields(workflow_id = %workflow_id))]
    pub async fn start_execution(
        &self,
        workflow_id: &str,
        request: ExecuteRequest,
    ) -> Result<StartedRun, GatewayError> {
        let request_id = request
            .request_id
            .unwrap_or_else(|| Uuid::now_v7().to_string());

        let started = self
            .gateway
            .start_execution(NewExecution {
                workflow_id: workflow_id.to_string(),
                request_id,
                workflow_version: None,
                trigger: request.trigger,
                parent_execution_id: None,
                principal: request.principal,
                tenant_id: request.tenant_id,
                correlation_id: None,
                allow_draft: self.config.catalog.allow_draft_execution,
            })
            .await?;

        let record = self.gateway.get_execution(started.execution_id).await?;
        Ok(StartedRun {
            execution_id: started.execution_id,
            status: record.status,
            was_existing: started.was_existing,
        })
    }

    /// Drive an execution to a terminal status
    pub async fn run_execution(
        &self,
        execution_id: Uuid,
    ) -> Result<ExecutionStatus, ConductorError> {
        self.conductor.execute(execution_id).await
    }

    /// Start and run in one call
    pub async fn execute_and_wait(
        &self,
        workflow_id: &str,
        request: ExecuteRequest,
    ) -> Result<(StartedRun, ExecutionStatus), ConductorError> {
        let started = self.start_execution(workflow_id, request).await?;
        let status = self.run_execution(started.execution_id).await?;
        Ok((started, status))
    }

    /// Request cancellation of an execution
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<(), GatewayError> {
        self.conductor.cancel(execution_id).await
    }
}
