//! # Flowmill Engine
//!
//! A durable DAG workflow conductor: immutable JSON-defined workflows are
//! validated at publish time, compiled into runtime plans, and executed with
//! bounded parallelism, retries with backoff, join synchronization,
//! fail-fast cancellation, and cross-run idempotency against external
//! resources.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Engine                              │
//! │   (start requests, lifecycle, publish, cancellation)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Conductor                            │
//! │  (plan-driven node tasks, joins, retries, cancel scope)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    PersistenceGateway                        │
//! │  (PostgreSQL / in-memory: executions, attempts, links)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use flowmill_engine::prelude::*;
//!
//! let gateway = Arc::new(InMemoryGateway::new());
//! let registry = Arc::new(ActionRegistry::with_builtins());
//! let engine = Engine::new(gateway, registry, EngineConfig::default());
//!
//! engine
//!     .lifecycle()
//!     .create_workflow("greet", "Greeter", None, Some(&definition))
//!     .await?;
//! engine.publish("greet", true).await?;
//!
//! let (_, status) = engine
//!     .execute_and_wait("greet", ExecuteRequest::new(json!({ "name": "ada" })))
//!     .await?;
//! assert_eq!(status, ExecutionStatus::Succeeded);
//! ```

pub mod builtins;
pub mod conductor;
pub mod config;
pub mod context;
pub mod engine;
pub mod eval;
pub mod events;
pub mod lifecycle;
pub mod persistence;
pub mod plan;
pub mod publish;
pub mod registry;
pub mod remote;
pub mod retry;
mod subflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::conductor::{Conductor, ConductorError};
    pub use crate::config::{ContextSnapshotConfig, ContextSnapshotMode, EngineConfig};
    pub use crate::engine::{Engine, ExecuteRequest, StartedRun};
    pub use crate::eval::{
        ConditionEvaluator, EvalContext, MinijinjaConditionEvaluator,
        MinijinjaTemplateEvaluator, TemplateEvaluator,
    };
    pub use crate::lifecycle::{LifecycleError, LifecycleManager, PublishOutcome};
    pub use crate::persistence::{
        GatewayError, InMemoryGateway, PersistenceGateway, PostgresGateway,
    };
    pub use crate::registry::{ActionInvocation, ActionRegistry, LocalAction};
    pub use crate::retry::RetryPolicy;
    pub use flowmill_model::{
        ActionResult, ActionStatus, ExecutionStatus, Principal, ResourceLinkRef,
        WorkflowDefinition, WorkflowStatus,
    };
}

// Re-export key types at crate root
pub use conductor::{Conductor, ConductorError};
pub use config::{
    CatalogOptions, ConnectorConfig, ContextOverflowBehavior, ContextSnapshotConfig,
    ContextSnapshotMode, EngineConfig, SubworkflowOptions,
};
pub use context::RuntimeContext;
pub use engine::{Engine, ExecuteRequest, StartedRun};
pub use eval::{
    CompiledCondition, CompiledTemplate, ConditionEvaluator, EvalContext, EvalError,
    MinijinjaConditionEvaluator, MinijinjaTemplateEvaluator, TemplateEvaluator,
};
pub use events::{EventCategory, EventLevel, ExecutionEvent, NewExecutionEvent};
pub use lifecycle::{LifecycleError, LifecycleManager, PublishOutcome};
pub use persistence::{
    AttemptRecord, ExecutionRecord, GatewayError, HierarchyRecord, InMemoryGateway, LinkOutcome,
    NewAttempt, NewExecution, PersistenceGateway, PostgresGateway, ResourceLinkRecord,
    StartedExecution, StoredDefinition,
};
pub use plan::{EdgeDescriptor, NodeDescriptor, NodeKind, Plan, PlanCache, PlanError, Planner};
pub use publish::{PublishValidationResult, PublishValidator};
pub use registry::{ActionHandler, ActionInvocation, ActionRegistry, LocalAction, RemoteAction};
pub use remote::RemoteInvoker;
pub use retry::RetryPolicy;
