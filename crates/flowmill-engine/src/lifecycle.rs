//! Workflow lifecycle management
//!
//! Draft -> Active -> Archived transitions and checksum-idempotent version
//! minting. The mutable draft lives at version 0; publishing validates it,
//! computes the canonical checksum, and either returns the existing version
//! with identical content or mints `latest + 1` as a new immutable row.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument};

use flowmill_model::{
    checksum, ValidationIssue, Workflow, WorkflowDefinition, WorkflowStatus,
};

use crate::persistence::{GatewayError, PersistenceGateway};
use crate::publish::{PublishValidationResult, PublishValidator};

/// Errors from lifecycle operations
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// WFENG005: publish validation refused the definition
    #[error("publish validation failed with {} error(s)", result.errors.len())]
    Validation { result: PublishValidationResult },

    /// The workflow is in the wrong state for the operation
    #[error("workflow '{workflow_id}' is {actual}, expected {expected}")]
    InvalidState {
        workflow_id: String,
        actual: WorkflowStatus,
        expected: &'static str,
    },

    /// The draft definition's id does not match the workflow
    #[error("definition id '{definition_id}' does not match workflow '{workflow_id}'")]
    IdMismatch {
        workflow_id: String,
        definition_id: String,
    },

    /// The stored draft no longer parses
    #[error("stored draft is invalid: {0}")]
    Definition(#[from] flowmill_model::DefinitionError),

    /// Store error
    #[error("store error: {0}")]
    Gateway(#[from] GatewayError),
}

impl LifecycleError {
    /// Reserved engine error code, when one applies
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Validation { .. } => Some("WFENG005"),
            Self::Gateway(e) => e.code(),
            _ => None,
        }
    }

    /// Validation issues when this is a validation refusal
    pub fn validation_errors(&self) -> &[ValidationIssue] {
        match self {
            Self::Validation { result } => &result.errors,
            _ => &[],
        }
    }
}

/// Result of a publish
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    /// The published version (existing one for identical content)
    pub version: i32,
    /// True when no new row was written
    pub was_existing: bool,
    pub warnings: Vec<ValidationIssue>,
}

/// Manages workflow lifecycle state
pub struct LifecycleManager {
    gateway: Arc<dyn PersistenceGateway>,
    validator: PublishValidator,
}

impl LifecycleManager {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, validator: PublishValidator) -> Self {
        Self { gateway, validator }
    }

    /// Create a workflow in Draft, optionally seeding its draft definition
    #[instrument(skip(self, draft))]
    pub async fn create_workflow(
        &self,
        workflow_id: &str,
        display_name: &str,
        description: Option<String>,
        draft: Option<&WorkflowDefinition>,
    ) -> Result<Workflow, LifecycleError> {
        let now = Utc::now();
        let workflow = Workflow {
            id: workflow_id.to_string(),
            display_name: display_name.to_string(),
            description,
            current_version: None,
            status: WorkflowStatus::Draft,
            is_enabled: false,
            created_at: now,
            updated_at: now,
        };

        self.gateway.create_workflow(&workflow).await?;

        if let Some(definition) = draft {
            self.save_draft_checked(workflow_id, definition).await?;
        }

        info!(workflow_id, "created workflow");
        Ok(workflow)
    }

    /// Replace the mutable version-0 draft
    pub async fn update_draft(
        &self,
        workflow_id: &str,
        definition: &WorkflowDefinition,
    ) -> Result<(), LifecycleError> {
        let workflow = self.gateway.get_workflow(workflow_id).await?;
        if workflow.status == WorkflowStatus::Archived {
            return Err(LifecycleError::InvalidState {
                workflow_id: workflow_id.to_string(),
                actual: workflow.status,
                expected: "draft or active",
            });
        }

        self.save_draft_checked(workflow_id, definition).await
    }

    /// Publish the draft as an immutable version
    ///
    /// Identical content (by canonical checksum) returns the existing
    /// version without writing a new row. With `auto_activate` the workflow
    /// becomes Active on the published version; otherwise the new version is
    /// staged and the lifecycle status is untouched.
    #[instrument(skip(self))]
    pub async fn publish(
        &self,
        workflow_id: &str,
        auto_activate: bool,
    ) -> Result<PublishOutcome, LifecycleError> {
        let mut workflow = self.gateway.get_workflow(workflow_id).await?;
        if workflow.status == WorkflowStatus::Archived {
            return Err(LifecycleError::InvalidState {
                workflow_id: workflow_id.to_string(),
                actual: workflow.status,
                expected: "draft or active",
            });
        }

        let draft = self.gateway.get_definition(workflow_id, 0).await?;
        let definition = WorkflowDefinition::from_value(draft.definition)?;

        let validation = self.validator.validate(&definition);
        if !validation.is_valid {
            return Err(LifecycleError::Validation { result: validation });
        }

        let normalized = definition.to_value();
        let content_checksum = checksum(&normalized);

        let (version, was_existing) = match self
            .gateway
            .find_version_by_checksum(workflow_id, &content_checksum)
            .await?
        {
            Some(existing) => (existing, true),
            None => {
                let next = self
                    .gateway
                    .latest_published_version(workflow_id)
                    .await?
                    .unwrap_or(0)
                    + 1;
                self.gateway
                    .insert_definition(workflow_id, next, normalized, &content_checksum)
                    .await?;
                self.gateway.invalidate_plans(workflow_id).await?;
                (next, false)
            }
        };

        if auto_activate {
            workflow.current_version = Some(version);
            workflow.status = WorkflowStatus::Active;
            workflow.is_enabled = true;
            workflow.updated_at = Utc::now();
            self.gateway.update_workflow(&workflow).await?;
        }

        info!(workflow_id, version, was_existing, "published workflow");
        Ok(PublishOutcome {
            version,
            was_existing,
            warnings: validation.warnings,
        })
    }

    /// Retire an Active workflow; in-flight runs proceed, new starts are
    /// rejected
    pub async fn archive(&self, workflow_id: &str) -> Result<(), LifecycleError> {
        let mut workflow = self.gateway.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Active {
            return Err(LifecycleError::InvalidState {
                workflow_id: workflow_id.to_string(),
                actual: workflow.status,
                expected: "active",
            });
        }

        workflow.status = WorkflowStatus::Archived;
        workflow.is_enabled = false;
        workflow.updated_at = Utc::now();
        self.gateway.update_workflow(&workflow).await?;

        info!(workflow_id, "archived workflow");
        Ok(())
    }

    /// Bring an Archived workflow back to Active on its current version
    pub async fn reactivate(&self, workflow_id: &str) -> Result<(), LifecycleError> {
        let mut workflow = self.gateway.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Archived || workflow.current_version.is_none() {
            return Err(LifecycleError::InvalidState {
                workflow_id: workflow_id.to_string(),
                actual: workflow.status,
                expected: "archived with a published version",
            });
        }

        workflow.status = WorkflowStatus::Active;
        workflow.is_enabled = true;
        workflow.updated_at = Utc::now();
        self.gateway.update_workflow(&workflow).await?;

        info!(workflow_id, "reactivated workflow");
        Ok(())
    }

    /// Delete a Draft workflow and everything under it
    pub async fn delete(&self, workflow_id: &str) -> Result<(), LifecycleError> {
        let workflow = self.gateway.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Draft {
            return Err(LifecycleError::InvalidState {
                workflow_id: workflow_id.to_string(),
                actual: workflow.status,
                expected: "draft",
            });
        }

        self.gateway.delete_workflow(workflow_id).await?;
        info!(workflow_id, "deleted workflow");
        Ok(())
    }

    /// Toggle start eligibility without changing lifecycle status
    pub async fn set_enabled(
        &self,
        workflow_id: &str,
        enabled: bool,
    ) -> Result<(), LifecycleError> {
        let mut workflow = self.gateway.get_workflow(workflow_id).await?;
        workflow.is_enabled = enabled;
        workflow.updated_at = Utc::now();
        self.gateway.update_workflow(&workflow).await?;
        Ok(())
    }

    async fn save_draft_checked(
        &self,
        workflow_id: &str,
        definition: &WorkflowDefinition,
    ) -> Result<(), LifecycleError> {
        if definition.id != workflow_id {
            return Err(LifecycleError::IdMismatch {
                workflow_id: workflow_id.to_string(),
                definition_id: definition.id.clone(),
            });
        }

        let normalized = definition.to_value();
        let content_checksum = checksum(&normalized);
        self.gateway
            .save_draft(workflow_id, normalized, &content_checksum)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eval::{MinijinjaConditionEvaluator, MinijinjaTemplateEvaluator};
    use crate::persistence::InMemoryGateway;
    use crate::registry::ActionRegistry;
    use serde_json::json;

    fn manager() -> (Arc<InMemoryGateway>, LifecycleManager) {
        let gateway = Arc::new(InMemoryGateway::new());
        let validator = PublishValidator::new(
            Arc::new(ActionRegistry::with_builtins()),
            Arc::new(MinijinjaTemplateEvaluator::new()),
            Arc::new(MinijinjaConditionEvaluator::new()),
        );
        let manager = LifecycleManager::new(gateway.clone(), validator);
        (gateway, manager)
    }

    fn echo_definition(msg: &str) -> WorkflowDefinition {
        WorkflowDefinition::from_value(json!({
            "id": "w",
            "displayName": "W",
            "startNode": "a",
            "nodes": [
                { "id": "a", "actionType": "core.echo", "parameters": { "msg": msg } }
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_publish_mints_and_activates() {
        let (gateway, manager) = manager();
        manager
            .create_workflow("w", "W", None, Some(&echo_definition("A")))
            .await
            .unwrap();

        let outcome = manager.publish("w", true).await.unwrap();
        assert_eq!(outcome.version, 1);
        assert!(!outcome.was_existing);

        let workflow = gateway.get_workflow("w").await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Active);
        assert_eq!(workflow.current_version, Some(1));
        assert!(workflow.is_enabled);
    }

    #[tokio::test]
    async fn test_publish_is_idempotent_by_checksum() {
        let (_, manager) = manager();
        manager
            .create_workflow("w", "W", None, Some(&echo_definition("A")))
            .await
            .unwrap();

        let first = manager.publish("w", true).await.unwrap();
        let second = manager.publish("w", true).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 1);
        assert!(second.was_existing);

        // Changed content mints the next version
        manager
            .update_draft("w", &echo_definition("B"))
            .await
            .unwrap();
        let third = manager.publish("w", true).await.unwrap();
        assert_eq!(third.version, 2);
        assert!(!third.was_existing);
    }

    #[tokio::test]
    async fn test_publish_refuses_invalid_draft() {
        let (_, manager) = manager();
        let bad = WorkflowDefinition::from_value(json!({
            "id": "w",
            "displayName": "W",
            "startNode": "ghost",
            "nodes": [{ "id": "a", "actionType": "core.echo" }]
        }))
        .unwrap();

        manager
            .create_workflow("w", "W", None, Some(&bad))
            .await
            .unwrap();

        let err = manager.publish("w", true).await.unwrap_err();
        assert_eq!(err.code(), Some("WFENG005"));
        assert!(!err.validation_errors().is_empty());
    }

    #[tokio::test]
    async fn test_publish_without_activation_stages() {
        let (gateway, manager) = manager();
        manager
            .create_workflow("w", "W", None, Some(&echo_definition("A")))
            .await
            .unwrap();

        let outcome = manager.publish("w", false).await.unwrap();
        assert_eq!(outcome.version, 1);

        let workflow = gateway.get_workflow("w").await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Draft);
        assert_eq!(workflow.current_version, None);
    }

    #[tokio::test]
    async fn test_archive_and_reactivate() {
        let (gateway, manager) = manager();
        manager
            .create_workflow("w", "W", None, Some(&echo_definition("A")))
            .await
            .unwrap();
        manager.publish("w", true).await.unwrap();

        manager.archive("w").await.unwrap();
        let workflow = gateway.get_workflow("w").await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Archived);
        assert!(!workflow.is_enabled);

        // Archive is only valid from Active
        assert!(matches!(
            manager.archive("w").await,
            Err(LifecycleError::InvalidState { .. })
        ));

        manager.reactivate("w").await.unwrap();
        let workflow = gateway.get_workflow("w").await.unwrap();
        assert_eq!(workflow.status, WorkflowStatus::Active);
    }

    #[tokio::test]
    async fn test_delete_only_from_draft() {
        let (_, manager) = manager();
        manager
            .create_workflow("w", "W", None, Some(&echo_definition("A")))
            .await
            .unwrap();
        manager.publish("w", true).await.unwrap();

        assert!(matches!(
            manager.delete("w").await,
            Err(LifecycleError::InvalidState { .. })
        ));

        manager
            .create_workflow("d", "D", None, None)
            .await
            .unwrap();
        manager.delete("d").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_draft_checks_id() {
        let (_, manager) = manager();
        manager.create_workflow("other", "O", None, None).await.unwrap();

        let err = manager
            .update_draft("other", &echo_definition("A"))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::IdMismatch { .. }));
    }
}
