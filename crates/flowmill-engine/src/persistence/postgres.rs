//! PostgreSQL implementation of PersistenceGateway
//!
//! Production persistence: idempotent execution creation via a unique
//! request-id index, single-runner acquisition through a status
//! compare-and-set, attempt upserts keyed by `(execution, node, attempt)`,
//! and globally unique resource links. No cross-row locks are held across
//! action invocations; every operation is a single short transaction.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use flowmill_model::{
    ActionStatus, ExecutionStatus, ResourceLinkRef, Workflow, WorkflowStatus,
};

use super::gateway::*;
use crate::events::{EventCategory, EventLevel, ExecutionEvent, NewExecutionEvent};

/// PostgreSQL persistence gateway
///
/// # Example
///
/// ```ignore
/// use flowmill_engine::PostgresGateway;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/flowmill").await?;
/// sqlx::migrate!().run(&pool).await?;
/// let gateway = PostgresGateway::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresGateway {
    pool: PgPool,
}

impl PostgresGateway {
    /// Create a gateway over an existing connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_err(e: sqlx::Error) -> GatewayError {
    error!("database error: {}", e);
    GatewayError::Database(e.to_string())
}

fn parse_workflow_status(s: &str) -> Result<WorkflowStatus, GatewayError> {
    match s {
        "draft" => Ok(WorkflowStatus::Draft),
        "active" => Ok(WorkflowStatus::Active),
        "archived" => Ok(WorkflowStatus::Archived),
        other => Err(GatewayError::Database(format!(
            "unknown workflow status '{other}'"
        ))),
    }
}

fn parse_execution_status(s: &str) -> Result<ExecutionStatus, GatewayError> {
    match s {
        "pending" => Ok(ExecutionStatus::Pending),
        "running" => Ok(ExecutionStatus::Running),
        "succeeded" => Ok(ExecutionStatus::Succeeded),
        "failed" => Ok(ExecutionStatus::Failed),
        "cancelled" => Ok(ExecutionStatus::Cancelled),
        other => Err(GatewayError::Database(format!(
            "unknown execution status '{other}'"
        ))),
    }
}

fn parse_action_status(s: &str) -> Result<ActionStatus, GatewayError> {
    match s {
        "succeeded" => Ok(ActionStatus::Succeeded),
        "failed" => Ok(ActionStatus::Failed),
        "retriable_failure" => Ok(ActionStatus::RetriableFailure),
        "skipped" => Ok(ActionStatus::Skipped),
        other => Err(GatewayError::Database(format!(
            "unknown action status '{other}'"
        ))),
    }
}

fn parse_event_level(s: &str) -> EventLevel {
    match s {
        "warning" => EventLevel::Warning,
        "error" => EventLevel::Error,
        _ => EventLevel::Info,
    }
}

fn parse_event_category(s: &str) -> EventCategory {
    match s {
        "retry_scheduled" => EventCategory::RetryScheduled,
        "cancel_triggered" => EventCategory::CancelTriggered,
        "resource_link_conflict" => EventCategory::ResourceLinkConflict,
        "context_overflow" => EventCategory::ContextOverflow,
        "subworkflow_rejected" => EventCategory::SubworkflowRejected,
        _ => EventCategory::ConditionError,
    }
}

fn row_to_workflow(row: &sqlx::postgres::PgRow) -> Result<Workflow, GatewayError> {
    let status: String = row.get("status");
    Ok(Workflow {
        id: row.get("id"),
        display_name: row.get("display_name"),
        description: row.get("description"),
        current_version: row.get("current_version"),
        status: parse_workflow_status(&status)?,
        is_enabled: row.get("is_enabled"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<ExecutionRecord, GatewayError> {
    let status: String = row.get("status");
    let principal: Option<serde_json::Value> = row.get("principal");

    Ok(ExecutionRecord {
        id: row.get("id"),
        workflow_id: row.get("workflow_id"),
        workflow_version: row.get("workflow_version"),
        request_id: row.get("request_id"),
        status: parse_execution_status(&status)?,
        trigger: row.get("trigger"),
        context_snapshot: row.get("context_snapshot"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        created_at: row.get("created_at"),
        correlation_id: row.get("correlation_id"),
        tenant_id: row.get("tenant_id"),
        parent_execution_id: row.get("parent_execution_id"),
        principal: principal.and_then(|v| serde_json::from_value(v).ok()),
        cancel_requested: row.get("cancel_requested"),
    })
}

fn row_to_attempt(row: &sqlx::postgres::PgRow) -> Result<AttemptRecord, GatewayError> {
    let status: String = row.get("status");
    Ok(AttemptRecord {
        id: row.get("id"),
        execution_id: row.get("execution_id"),
        node_id: row.get("node_id"),
        action_type: row.get("action_type"),
        status: parse_action_status(&status)?,
        attempt: row.get::<i32, _>("attempt") as u32,
        retry_count: row.get::<i32, _>("retry_count") as u32,
        parameters: row.get("parameters"),
        outputs: row.get("outputs"),
        error: row.get("error"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
    })
}

#[async_trait]
impl PersistenceGateway for PostgresGateway {
    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO workflows
                (id, display_name, description, current_version, status, is_enabled,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.display_name)
        .bind(&workflow.description)
        .bind(workflow.current_version)
        .bind(workflow.status.to_string())
        .bind(workflow.is_enabled)
        .bind(workflow.created_at)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        debug!("created workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT id, display_name, description, current_version, status, is_enabled,
                   created_at, updated_at
            FROM workflows WHERE id = $1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| GatewayError::WorkflowNotFound(workflow_id.to_string()))?;

        row_to_workflow(&row)
    }

    #[instrument(skip(self, workflow), fields(workflow_id = %workflow.id))]
    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), GatewayError> {
        let result = sqlx::query(
            r#"
            UPDATE workflows
            SET display_name = $2, description = $3, current_version = $4,
                status = $5, is_enabled = $6, updated_at = $7
            WHERE id = $1
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.display_name)
        .bind(&workflow.description)
        .bind(workflow.current_version)
        .bind(workflow.status.to_string())
        .bind(workflow.is_enabled)
        .bind(workflow.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::WorkflowNotFound(workflow.id.clone()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_workflow(&self, workflow_id: &str) -> Result<(), GatewayError> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = $1")
            .bind(workflow_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(GatewayError::WorkflowNotFound(workflow_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self, definition))]
    async fn save_draft(
        &self,
        workflow_id: &str,
        definition: serde_json::Value,
        checksum: &str,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_definitions (workflow_id, version, definition, checksum)
            VALUES ($1, 0, $2, $3)
            ON CONFLICT (workflow_id, version)
            DO UPDATE SET definition = EXCLUDED.definition, checksum = EXCLUDED.checksum
            "#,
        )
        .bind(workflow_id)
        .bind(&definition)
        .bind(checksum)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_definition(
        &self,
        workflow_id: &str,
        version: i32,
    ) -> Result<StoredDefinition, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_id, version, definition, checksum, created_at
            FROM workflow_definitions
            WHERE workflow_id = $1 AND version = $2
            "#,
        )
        .bind(workflow_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| GatewayError::DefinitionNotFound {
            workflow_id: workflow_id.to_string(),
            version,
        })?;

        Ok(StoredDefinition {
            workflow_id: row.get("workflow_id"),
            version: row.get("version"),
            definition: row.get("definition"),
            checksum: row.get("checksum"),
            created_at: row.get("created_at"),
        })
    }

    #[instrument(skip(self, definition))]
    async fn insert_definition(
        &self,
        workflow_id: &str,
        version: i32,
        definition: serde_json::Value,
        checksum: &str,
    ) -> Result<(), GatewayError> {
        let result = sqlx::query(
            r#"
            INSERT INTO workflow_definitions (workflow_id, version, definition, checksum)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (workflow_id, version) DO NOTHING
            "#,
        )
        .bind(workflow_id)
        .bind(version)
        .bind(&definition)
        .bind(checksum)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        // Published rows are written exactly once
        if result.rows_affected() == 0 {
            return Err(GatewayError::ImmutableDefinition {
                workflow_id: workflow_id.to_string(),
                version,
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn latest_published_version(
        &self,
        workflow_id: &str,
    ) -> Result<Option<i32>, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT MAX(version) AS latest
            FROM workflow_definitions
            WHERE workflow_id = $1 AND version > 0
            "#,
        )
        .bind(workflow_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get("latest"))
    }

    #[instrument(skip(self))]
    async fn find_version_by_checksum(
        &self,
        workflow_id: &str,
        checksum: &str,
    ) -> Result<Option<i32>, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT MAX(version) AS version
            FROM workflow_definitions
            WHERE workflow_id = $1 AND version > 0 AND checksum = $2
            "#,
        )
        .bind(workflow_id)
        .bind(checksum)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get("version"))
    }

    #[instrument(skip(self, new), fields(workflow_id = %new.workflow_id))]
    async fn start_execution(
        &self,
        new: NewExecution,
    ) -> Result<StartedExecution, GatewayError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let workflow_row = sqlx::query(
            r#"
            SELECT status, is_enabled, current_version FROM workflows WHERE id = $1
            "#,
        )
        .bind(&new.workflow_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?
        .ok_or_else(|| GatewayError::WorkflowNotFound(new.workflow_id.clone()))?;

        let status = parse_workflow_status(workflow_row.get("status"))?;
        let is_enabled: bool = workflow_row.get("is_enabled");
        let current_version: Option<i32> = workflow_row.get("current_version");

        let version = match status {
            WorkflowStatus::Active => {
                if !is_enabled {
                    return Err(GatewayError::WorkflowDisabled(new.workflow_id));
                }
                match new.workflow_version {
                    Some(pinned) => pinned,
                    None => current_version
                        .ok_or_else(|| GatewayError::WorkflowNotActive(new.workflow_id.clone()))?,
                }
            }
            WorkflowStatus::Draft if new.allow_draft => new.workflow_version.unwrap_or(0),
            _ => return Err(GatewayError::WorkflowNotActive(new.workflow_id)),
        };

        let execution_id = Uuid::now_v7();
        let correlation_id = new
            .correlation_id
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let principal = new
            .principal
            .as_ref()
            .map(|p| serde_json::to_value(p).unwrap_or_default());

        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_executions
                (id, workflow_id, workflow_version, request_id, status, trigger,
                 correlation_id, tenant_id, parent_execution_id, principal)
            VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9)
            ON CONFLICT (request_id) DO NOTHING
            "#,
        )
        .bind(execution_id)
        .bind(&new.workflow_id)
        .bind(version)
        .bind(&new.request_id)
        .bind(&new.trigger)
        .bind(&correlation_id)
        .bind(&new.tenant_id)
        .bind(new.parent_execution_id)
        .bind(&principal)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 1 {
            tx.commit().await.map_err(db_err)?;
            debug!(%execution_id, "created execution");
            return Ok(StartedExecution {
                execution_id,
                was_existing: false,
            });
        }

        // Request id seen before: same workflow returns the existing run,
        // another workflow is a hard conflict
        let existing = sqlx::query(
            r#"
            SELECT id, workflow_id FROM workflow_executions WHERE request_id = $1
            "#,
        )
        .bind(&new.request_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;

        let existing_workflow: String = existing.get("workflow_id");
        if existing_workflow != new.workflow_id {
            return Err(GatewayError::RequestIdConflict {
                request_id: new.request_id,
                other_workflow_id: existing_workflow,
            });
        }

        Ok(StartedExecution {
            execution_id: existing.get("id"),
            was_existing: true,
        })
    }

    #[instrument(skip(self))]
    async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionRecord, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_id, workflow_version, request_id, status, trigger,
                   context_snapshot, started_at, ended_at, created_at, correlation_id,
                   tenant_id, parent_execution_id, principal, cancel_requested
            FROM workflow_executions WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or(GatewayError::ExecutionNotFound(execution_id))?;

        row_to_execution(&row)
    }

    #[instrument(skip(self))]
    async fn try_acquire_execution(&self, execution_id: Uuid) -> Result<bool, GatewayError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = 'running', started_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Distinguish "already claimed" from "missing"
        let exists = sqlx::query("SELECT 1 AS one FROM workflow_executions WHERE id = $1")
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        if exists.is_none() {
            return Err(GatewayError::ExecutionNotFound(execution_id));
        }
        Ok(false)
    }

    #[instrument(skip(self, context_snapshot))]
    async fn complete_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        context_snapshot: Option<serde_json::Value>,
    ) -> Result<(), GatewayError> {
        if !status.is_terminal() {
            return Err(GatewayError::IllegalStateTransition {
                execution_id,
                from: ExecutionStatus::Running,
                to: status,
            });
        }

        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET status = $2, context_snapshot = $3, ended_at = NOW()
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(status.to_string())
        .bind(&context_snapshot)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let current = self.get_execution(execution_id).await?;
        Err(GatewayError::IllegalStateTransition {
            execution_id,
            from: current.status,
            to: status,
        })
    }

    #[instrument(skip(self))]
    async fn request_cancel(&self, execution_id: Uuid) -> Result<(), GatewayError> {
        let result = sqlx::query(
            r#"
            UPDATE workflow_executions
            SET cancel_requested = TRUE
            WHERE id = $1 AND status IN ('pending', 'running')
            "#,
        )
        .bind(execution_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            // Terminal executions ignore cancel; missing ones are an error
            let exists = sqlx::query("SELECT 1 AS one FROM workflow_executions WHERE id = $1")
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
            if exists.is_none() {
                return Err(GatewayError::ExecutionNotFound(execution_id));
            }
        }
        Ok(())
    }

    #[instrument(skip(self, attempt), fields(execution_id = %attempt.execution_id, node_id = %attempt.node_id))]
    async fn record_attempt(&self, attempt: NewAttempt) -> Result<Uuid, GatewayError> {
        let row = sqlx::query(
            r#"
            INSERT INTO action_executions
                (id, execution_id, node_id, action_type, status, attempt, retry_count,
                 parameters, outputs, error, started_at, ended_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (execution_id, node_id, attempt)
            DO UPDATE SET status = EXCLUDED.status,
                          retry_count = EXCLUDED.retry_count,
                          parameters = EXCLUDED.parameters,
                          outputs = EXCLUDED.outputs,
                          error = EXCLUDED.error,
                          ended_at = EXCLUDED.ended_at
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(attempt.execution_id)
        .bind(&attempt.node_id)
        .bind(&attempt.action_type)
        .bind(attempt.status.to_string())
        .bind(attempt.attempt as i32)
        .bind(attempt.retry_count as i32)
        .bind(&attempt.parameters)
        .bind(&attempt.outputs)
        .bind(&attempt.error)
        .bind(attempt.started_at)
        .bind(attempt.ended_at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get("id"))
    }

    #[instrument(skip(self))]
    async fn load_attempts(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<AttemptRecord>, GatewayError> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, node_id, action_type, status, attempt, retry_count,
                   parameters, outputs, error, started_at, ended_at
            FROM action_executions
            WHERE execution_id = $1
            ORDER BY node_id, attempt
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(row_to_attempt).collect()
    }

    #[instrument(skip(self, link), fields(system = %link.system, resource_id = %link.resource_id))]
    async fn link_external_resource(
        &self,
        execution_id: Uuid,
        action_execution_id: Option<Uuid>,
        link: &ResourceLinkRef,
    ) -> Result<LinkOutcome, GatewayError> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_resource_links
                (id, execution_id, action_execution_id, system_name, resource_type,
                 resource_id, url)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (system_name, resource_type, resource_id) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(execution_id)
        .bind(action_execution_id)
        .bind(&link.system)
        .bind(&link.resource_type)
        .bind(&link.resource_id)
        .bind(&link.url)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() == 1 {
            return Ok(LinkOutcome::Created);
        }

        let owner = sqlx::query(
            r#"
            SELECT execution_id FROM workflow_resource_links
            WHERE system_name = $1 AND resource_type = $2 AND resource_id = $3
            "#,
        )
        .bind(&link.system)
        .bind(&link.resource_type)
        .bind(&link.resource_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let owner_execution_id: Uuid = owner.get("execution_id");
        if owner_execution_id == execution_id {
            Ok(LinkOutcome::ExistsSameExecution)
        } else {
            Err(GatewayError::ResourceLinkConflict {
                system: link.system.clone(),
                resource_type: link.resource_type.clone(),
                resource_id: link.resource_id.clone(),
                owner_execution_id,
            })
        }
    }

    #[instrument(skip(self))]
    async fn find_resource_link(
        &self,
        system: &str,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<ResourceLinkRecord>, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT id, execution_id, action_execution_id, system_name, resource_type,
                   resource_id, url, created_at
            FROM workflow_resource_links
            WHERE system_name = $1 AND resource_type = $2 AND resource_id = $3
            "#,
        )
        .bind(system)
        .bind(resource_type)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|row| ResourceLinkRecord {
            id: row.get("id"),
            execution_id: row.get("execution_id"),
            action_execution_id: row.get("action_execution_id"),
            system: row.get("system_name"),
            resource_type: row.get("resource_type"),
            resource_id: row.get("resource_id"),
            url: row.get("url"),
            created_at: row.get("created_at"),
        }))
    }

    #[instrument(skip(self, record), fields(parent = %record.parent_execution_id, child = %record.child_execution_id))]
    async fn record_hierarchy(&self, record: &HierarchyRecord) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_execution_hierarchy
                (parent_execution_id, child_execution_id, parent_node_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (parent_execution_id, child_execution_id) DO NOTHING
            "#,
        )
        .bind(record.parent_execution_id)
        .bind(record.child_execution_id)
        .bind(&record.parent_node_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_children(
        &self,
        parent_execution_id: Uuid,
    ) -> Result<Vec<HierarchyRecord>, GatewayError> {
        let rows = sqlx::query(
            r#"
            SELECT parent_execution_id, child_execution_id, parent_node_id
            FROM workflow_execution_hierarchy
            WHERE parent_execution_id = $1
            "#,
        )
        .bind(parent_execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| HierarchyRecord {
                parent_execution_id: row.get("parent_execution_id"),
                child_execution_id: row.get("child_execution_id"),
                parent_node_id: row.get("parent_node_id"),
            })
            .collect())
    }

    #[instrument(skip(self, event), fields(execution_id = %event.execution_id))]
    async fn record_event(&self, event: NewExecutionEvent) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO execution_events (execution_id, level, category, payload)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(event.execution_id)
        .bind(event.level.to_string())
        .bind(event.category.to_string())
        .bind(&event.payload)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_events(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionEvent>, GatewayError> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, at, level, category, payload
            FROM execution_events
            WHERE execution_id = $1
            ORDER BY id
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|row| {
                let level: String = row.get("level");
                let category: String = row.get("category");
                ExecutionEvent {
                    id: row.get("id"),
                    execution_id: row.get("execution_id"),
                    at: row.get("at"),
                    level: parse_event_level(&level),
                    category: parse_event_category(&category),
                    payload: row.get("payload"),
                }
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn get_plan(
        &self,
        workflow_id: &str,
        version: i32,
    ) -> Result<Option<serde_json::Value>, GatewayError> {
        let row = sqlx::query(
            r#"
            SELECT plan FROM workflow_plans WHERE workflow_id = $1 AND version = $2
            "#,
        )
        .bind(workflow_id)
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|row| row.get("plan")))
    }

    #[instrument(skip(self, plan))]
    async fn put_plan(
        &self,
        workflow_id: &str,
        version: i32,
        plan: serde_json::Value,
    ) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_plans (workflow_id, version, plan)
            VALUES ($1, $2, $3)
            ON CONFLICT (workflow_id, version) DO UPDATE SET plan = EXCLUDED.plan
            "#,
        )
        .bind(workflow_id)
        .bind(version)
        .bind(&plan)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn invalidate_plans(&self, workflow_id: &str) -> Result<(), GatewayError> {
        sqlx::query("DELETE FROM workflow_plans WHERE workflow_id = $1")
            .bind(workflow_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}
