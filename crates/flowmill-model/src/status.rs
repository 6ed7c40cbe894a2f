// Lifecycle and runtime statuses
//
// Workflow is DB-agnostic catalog metadata; the three status enums cover the
// lifecycle state machine (Draft/Active/Archived), execution runs, and
// per-attempt action outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Editable; only the mutable version-0 draft definition exists or is current
    Draft,
    /// Published and executable
    Active,
    /// Retired; in-flight runs proceed, new starts are rejected
    Archived,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::Active => write!(f, "active"),
            Self::Archived => write!(f, "archived"),
        }
    }
}

/// Status of a workflow execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created but not yet claimed by a runner
    Pending,
    /// Claimed and executing
    Running,
    /// All routed nodes completed successfully
    Succeeded,
    /// Cancelled by a permanent node failure
    Failed,
    /// Cancelled externally or by workflow timeout
    Cancelled,
}

impl ExecutionStatus {
    /// Whether this status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of a single action attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    /// Attempt completed; outputs are authoritative for the node
    Succeeded,
    /// Permanent failure; no further attempts
    Failed,
    /// Transient failure; eligible for retry under the node's policy
    RetriableFailure,
    /// Not executed (cancellation, or an action declining to run)
    Skipped,
}

impl ActionStatus {
    /// Whether this status ends the node (retriable failures do not)
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::RetriableFailure)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::RetriableFailure => write!(f, "retriable_failure"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// Identity that initiated an execution
///
/// Forwarded to remote connectors via pass-through headers so downstream
/// systems can attribute side effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            display_name: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

/// Workflow catalog metadata
///
/// Invariant: `current_version` is non-null iff at least one published
/// version exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workflow {
    /// Stable slug, `^[a-z0-9-]+$`
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Latest activated published version, if any
    pub current_version: Option<i32>,
    pub status: WorkflowStatus,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_status_terminal() {
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
        assert!(ExecutionStatus::Succeeded.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_action_status_terminal() {
        assert!(ActionStatus::Succeeded.is_terminal());
        assert!(ActionStatus::Failed.is_terminal());
        assert!(ActionStatus::Skipped.is_terminal());
        assert!(!ActionStatus::RetriableFailure.is_terminal());
    }

    #[test]
    fn test_status_serde_names() {
        assert_eq!(
            serde_json::to_string(&ActionStatus::RetriableFailure).unwrap(),
            "\"retriable_failure\""
        );
        assert_eq!(
            serde_json::to_string(&WorkflowStatus::Active).unwrap(),
            "\"active\""
        );
    }

    #[test]
    fn test_principal_builder() {
        let p = Principal::new("u-1")
            .with_email("u@example.com")
            .with_display_name("User One");

        assert_eq!(p.user_id, "u-1");
        assert_eq!(p.email.as_deref(), Some("u@example.com"));
        assert_eq!(p.display_name.as_deref(), Some("User One"));
    }
}
