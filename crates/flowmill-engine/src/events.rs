//! Execution audit events
//!
//! Append-only diagnostics recorded alongside an execution: soft condition
//! failures, retry scheduling, cancellation, resource-link conflicts. Events
//! never affect routing; they exist so an operator can reconstruct why a run
//! took the path it did.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Severity of an execution event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// What kind of occurrence the event records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// An edge condition errored or timed out and was read as false
    ConditionError,
    /// A retriable failure scheduled a backoff retry
    RetryScheduled,
    /// The workflow cancel scope was triggered
    CancelTriggered,
    /// A resource link was already owned by another execution
    ResourceLinkConflict,
    /// The context snapshot exceeded its size cap
    ContextOverflow,
    /// A sub-workflow start was rejected (depth or recursion)
    SubworkflowRejected,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConditionError => write!(f, "condition_error"),
            Self::RetryScheduled => write!(f, "retry_scheduled"),
            Self::CancelTriggered => write!(f, "cancel_triggered"),
            Self::ResourceLinkConflict => write!(f, "resource_link_conflict"),
            Self::ContextOverflow => write!(f, "context_overflow"),
            Self::SubworkflowRejected => write!(f, "subworkflow_rejected"),
        }
    }
}

/// A persisted execution event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionEvent {
    /// Monotonic id assigned by the store
    pub id: i64,
    pub execution_id: Uuid,
    pub at: DateTime<Utc>,
    pub level: EventLevel,
    pub category: EventCategory,
    pub payload: Value,
}

/// An event about to be recorded
#[derive(Debug, Clone)]
pub struct NewExecutionEvent {
    pub execution_id: Uuid,
    pub level: EventLevel,
    pub category: EventCategory,
    pub payload: Value,
}

impl NewExecutionEvent {
    pub fn new(
        execution_id: Uuid,
        level: EventLevel,
        category: EventCategory,
        payload: Value,
    ) -> Self {
        Self {
            execution_id,
            level,
            category,
            payload,
        }
    }
}
