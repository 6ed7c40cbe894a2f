//! PersistenceGateway trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use flowmill_model::{ActionStatus, ExecutionStatus, Principal, ResourceLinkRef, Workflow};

use crate::events::{ExecutionEvent, NewExecutionEvent};

/// Error type for store operations
///
/// The `WFENG` codes are part of the wire contract: callers branch on them
/// and the conductor never retries an operation that returned one.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Workflow not found in the catalog
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    /// Execution not found
    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    /// Definition version not found
    #[error("definition not found: {workflow_id} v{version}")]
    DefinitionNotFound { workflow_id: String, version: i32 },

    /// Start was attempted against a non-Active workflow
    #[error("workflow '{0}' is not active")]
    WorkflowNotActive(String),

    /// Start was attempted against a disabled workflow
    #[error("workflow '{0}' is disabled")]
    WorkflowDisabled(String),

    /// WFENG001: the request id already belongs to a different workflow
    #[error("request id '{request_id}' already used by workflow '{other_workflow_id}'")]
    RequestIdConflict {
        request_id: String,
        other_workflow_id: String,
    },

    /// WFENG002: execution state machine violation
    #[error("illegal state transition for execution {execution_id}: {from} -> {to}")]
    IllegalStateTransition {
        execution_id: Uuid,
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    /// WFENG003: the resource link is owned by another execution
    #[error("resource ({system}, {resource_type}, {resource_id}) already linked to execution {owner_execution_id}")]
    ResourceLinkConflict {
        system: String,
        resource_type: String,
        resource_id: String,
        owner_execution_id: Uuid,
    },

    /// A published definition row cannot be rewritten
    #[error("definition {workflow_id} v{version} is immutable")]
    ImmutableDefinition { workflow_id: String, version: i32 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl GatewayError {
    /// Reserved engine error code, when one applies
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::RequestIdConflict { .. } => Some("WFENG001"),
            Self::IllegalStateTransition { .. } => Some("WFENG002"),
            Self::ResourceLinkConflict { .. } => Some("WFENG003"),
            _ => None,
        }
    }
}

/// A stored definition row; immutable once `version > 0`
#[derive(Debug, Clone)]
pub struct StoredDefinition {
    pub workflow_id: String,
    pub version: i32,
    pub definition: Value,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Parameters for starting an execution
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub workflow_id: String,
    /// Idempotency key; two starts with the same key return the same run
    pub request_id: String,
    /// Pin a specific published version; the workflow's current version
    /// otherwise
    pub workflow_version: Option<i32>,
    pub trigger: Value,
    pub parent_execution_id: Option<Uuid>,
    pub principal: Option<Principal>,
    pub tenant_id: Option<String>,
    /// Minted by the store when absent
    pub correlation_id: Option<String>,
    /// Permit starts against Draft workflows (runs the version-0 draft)
    pub allow_draft: bool,
}

/// Result of `start_execution`
#[derive(Debug, Clone, Copy)]
pub struct StartedExecution {
    pub execution_id: Uuid,
    /// True when an existing run was returned instead of a new one
    pub was_existing: bool,
}

/// A workflow execution row
#[derive(Debug, Clone)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub workflow_id: String,
    pub workflow_version: i32,
    pub request_id: String,
    pub status: ExecutionStatus,
    pub trigger: Value,
    pub context_snapshot: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub correlation_id: String,
    pub tenant_id: Option<String>,
    pub parent_execution_id: Option<Uuid>,
    pub principal: Option<Principal>,
    /// Set by an external cancel request; observed at acquisition
    pub cancel_requested: bool,
}

/// An attempt row about to be recorded
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub execution_id: Uuid,
    pub node_id: String,
    pub action_type: String,
    pub status: ActionStatus,
    /// 1-based attempt number
    pub attempt: u32,
    /// Attempts before this one (`attempt - 1`)
    pub retry_count: u32,
    pub parameters: Option<Value>,
    pub outputs: Option<Value>,
    pub error: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// A persisted attempt row
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub node_id: String,
    pub action_type: String,
    pub status: ActionStatus,
    pub attempt: u32,
    pub retry_count: u32,
    pub parameters: Option<Value>,
    pub outputs: Option<Value>,
    pub error: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Outcome of linking an external resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkOutcome {
    /// The link was created and is now owned by the execution
    Created,
    /// The same execution already holds the link; safe to proceed
    ExistsSameExecution,
}

/// A persisted resource link
#[derive(Debug, Clone)]
pub struct ResourceLinkRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub action_execution_id: Option<Uuid>,
    pub system: String,
    pub resource_type: String,
    pub resource_id: String,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A parent/child execution relationship
#[derive(Debug, Clone)]
pub struct HierarchyRecord {
    pub parent_execution_id: Uuid,
    pub child_execution_id: Uuid,
    pub parent_node_id: String,
}

/// Store contract for the workflow engine
///
/// All operations are transactional at the row level. Implementations must be
/// thread-safe; the conductor calls them concurrently from node tasks.
#[async_trait]
pub trait PersistenceGateway: Send + Sync + 'static {
    // =========================================================================
    // Workflow Catalog
    // =========================================================================

    /// Insert a catalog row; fails on duplicate id
    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), GatewayError>;

    /// Fetch a catalog row
    async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, GatewayError>;

    /// Replace a catalog row (status, current version, enablement)
    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), GatewayError>;

    /// Delete a workflow and cascade all dependent rows
    async fn delete_workflow(&self, workflow_id: &str) -> Result<(), GatewayError>;

    // =========================================================================
    // Definitions
    // =========================================================================

    /// Upsert the mutable version-0 draft definition
    async fn save_draft(
        &self,
        workflow_id: &str,
        definition: Value,
        checksum: &str,
    ) -> Result<(), GatewayError>;

    /// Fetch a definition (version 0 is the draft)
    async fn get_definition(
        &self,
        workflow_id: &str,
        version: i32,
    ) -> Result<StoredDefinition, GatewayError>;

    /// Insert an immutable published version; rejects overwrites
    async fn insert_definition(
        &self,
        workflow_id: &str,
        version: i32,
        definition: Value,
        checksum: &str,
    ) -> Result<(), GatewayError>;

    /// Highest published version, if any
    async fn latest_published_version(
        &self,
        workflow_id: &str,
    ) -> Result<Option<i32>, GatewayError>;

    /// Published version with this checksum, if any (idempotent re-publish)
    async fn find_version_by_checksum(
        &self,
        workflow_id: &str,
        checksum: &str,
    ) -> Result<Option<i32>, GatewayError>;

    // =========================================================================
    // Executions
    // =========================================================================

    /// Idempotently create an execution row
    ///
    /// Returns the existing run when `(workflow_id, request_id)` was seen
    /// before. Verifies workflow status and enablement.
    async fn start_execution(
        &self,
        new: NewExecution,
    ) -> Result<StartedExecution, GatewayError>;

    /// Fetch an execution row
    async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionRecord, GatewayError>;

    /// Pending -> Running compare-and-set; the single claim point across
    /// replicas. Returns false when the execution was already claimed or is
    /// terminal.
    async fn try_acquire_execution(&self, execution_id: Uuid) -> Result<bool, GatewayError>;

    /// Running -> terminal transition with the pruned context snapshot
    async fn complete_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        context_snapshot: Option<Value>,
    ) -> Result<(), GatewayError>;

    /// Flag an execution for cancellation (observed at acquisition; in-flight
    /// runs are cancelled through their in-process cancel scope)
    async fn request_cancel(&self, execution_id: Uuid) -> Result<(), GatewayError>;

    // =========================================================================
    // Action Attempts
    // =========================================================================

    /// Record an attempt row; upserts on `(execution_id, node_id, attempt)`
    /// so replays and retry-exhaustion promotion are safe
    async fn record_attempt(&self, attempt: NewAttempt) -> Result<Uuid, GatewayError>;

    /// All attempt rows of an execution, ordered by (node_id, attempt)
    async fn load_attempts(&self, execution_id: Uuid)
        -> Result<Vec<AttemptRecord>, GatewayError>;

    // =========================================================================
    // Resource Links
    // =========================================================================

    /// Claim a globally unique `(system, type, resource_id)` tuple
    ///
    /// Fails with [`GatewayError::ResourceLinkConflict`] when another
    /// execution owns it.
    async fn link_external_resource(
        &self,
        execution_id: Uuid,
        action_execution_id: Option<Uuid>,
        link: &ResourceLinkRef,
    ) -> Result<LinkOutcome, GatewayError>;

    /// Look up a link by its tuple (connectors query this before creating
    /// external objects)
    async fn find_resource_link(
        &self,
        system: &str,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<ResourceLinkRecord>, GatewayError>;

    // =========================================================================
    // Hierarchy
    // =========================================================================

    /// Record a parent/child execution relationship
    async fn record_hierarchy(&self, record: &HierarchyRecord) -> Result<(), GatewayError>;

    /// Children of an execution
    async fn list_children(
        &self,
        parent_execution_id: Uuid,
    ) -> Result<Vec<HierarchyRecord>, GatewayError>;

    // =========================================================================
    // Execution Events
    // =========================================================================

    /// Append an audit event
    async fn record_event(&self, event: NewExecutionEvent) -> Result<(), GatewayError>;

    /// Events of an execution in insertion order
    async fn list_events(&self, execution_id: Uuid)
        -> Result<Vec<ExecutionEvent>, GatewayError>;

    // =========================================================================
    // Plan Cache
    // =========================================================================

    /// Cached plan JSON for a version, if any
    async fn get_plan(
        &self,
        workflow_id: &str,
        version: i32,
    ) -> Result<Option<Value>, GatewayError>;

    /// Store a compiled plan
    async fn put_plan(
        &self,
        workflow_id: &str,
        version: i32,
        plan: Value,
    ) -> Result<(), GatewayError>;

    /// Drop all cached plans of a workflow (called on publish)
    async fn invalidate_plans(&self, workflow_id: &str) -> Result<(), GatewayError>;
}
