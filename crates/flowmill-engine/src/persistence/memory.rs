//! In-memory implementation of PersistenceGateway
//!
//! Same semantics as the PostgreSQL implementation, held in process memory.
//! Primarily for tests and embedded single-process deployments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use flowmill_model::{ExecutionStatus, ResourceLinkRef, Workflow, WorkflowStatus};

use super::gateway::*;
use crate::events::{ExecutionEvent, NewExecutionEvent};

/// In-memory persistence gateway
///
/// # Example
///
/// ```
/// use flowmill_engine::InMemoryGateway;
///
/// let gateway = InMemoryGateway::new();
/// ```
pub struct InMemoryGateway {
    workflows: RwLock<HashMap<String, Workflow>>,
    definitions: RwLock<HashMap<(String, i32), StoredDefinition>>,
    // request_id -> (workflow_id, execution_id); the global idempotency index
    request_index: RwLock<HashMap<String, (String, Uuid)>>,
    executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
    attempts: RwLock<HashMap<Uuid, Vec<AttemptRecord>>>,
    links: RwLock<HashMap<(String, String, String), ResourceLinkRecord>>,
    hierarchy: RwLock<Vec<HierarchyRecord>>,
    events: RwLock<Vec<ExecutionEvent>>,
    event_seq: AtomicI64,
    plans: RwLock<HashMap<(String, i32), Value>>,
}

impl InMemoryGateway {
    /// Create an empty in-memory gateway
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            definitions: RwLock::new(HashMap::new()),
            request_index: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            attempts: RwLock::new(HashMap::new()),
            links: RwLock::new(HashMap::new()),
            hierarchy: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            event_seq: AtomicI64::new(0),
            plans: RwLock::new(HashMap::new()),
        }
    }

    /// Number of executions (for tests)
    pub fn execution_count(&self) -> usize {
        self.executions.read().len()
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistenceGateway for InMemoryGateway {
    async fn create_workflow(&self, workflow: &Workflow) -> Result<(), GatewayError> {
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&workflow.id) {
            return Err(GatewayError::Database(format!(
                "workflow '{}' already exists",
                workflow.id
            )));
        }
        workflows.insert(workflow.id.clone(), workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &str) -> Result<Workflow, GatewayError> {
        self.workflows
            .read()
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| GatewayError::WorkflowNotFound(workflow_id.to_string()))
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), GatewayError> {
        let mut workflows = self.workflows.write();
        match workflows.get_mut(&workflow.id) {
            Some(existing) => {
                *existing = workflow.clone();
                Ok(())
            }
            None => Err(GatewayError::WorkflowNotFound(workflow.id.clone())),
        }
    }

    async fn delete_workflow(&self, workflow_id: &str) -> Result<(), GatewayError> {
        // Lock order matches start_execution: request_index before workflows
        let mut request_index = self.request_index.write();
        let mut workflows = self.workflows.write();
        if workflows.remove(workflow_id).is_none() {
            return Err(GatewayError::WorkflowNotFound(workflow_id.to_string()));
        }
        request_index.retain(|_, (wf, _)| wf != workflow_id);

        self.definitions
            .write()
            .retain(|(wf, _), _| wf != workflow_id);
        self.plans.write().retain(|(wf, _), _| wf != workflow_id);

        // Cascade executions and their dependents
        let removed: Vec<Uuid> = {
            let mut executions = self.executions.write();
            let ids: Vec<Uuid> = executions
                .values()
                .filter(|e| e.workflow_id == workflow_id)
                .map(|e| e.id)
                .collect();
            for id in &ids {
                executions.remove(id);
            }
            ids
        };

        let mut attempts = self.attempts.write();
        let mut links = self.links.write();
        let mut hierarchy = self.hierarchy.write();
        let mut events = self.events.write();
        for id in &removed {
            attempts.remove(id);
            links.retain(|_, l| l.execution_id != *id);
            hierarchy.retain(|h| h.parent_execution_id != *id && h.child_execution_id != *id);
            events.retain(|e| e.execution_id != *id);
        }

        Ok(())
    }

    async fn save_draft(
        &self,
        workflow_id: &str,
        definition: Value,
        checksum: &str,
    ) -> Result<(), GatewayError> {
        if !self.workflows.read().contains_key(workflow_id) {
            return Err(GatewayError::WorkflowNotFound(workflow_id.to_string()));
        }

        self.definitions.write().insert(
            (workflow_id.to_string(), 0),
            StoredDefinition {
                workflow_id: workflow_id.to_string(),
                version: 0,
                definition,
                checksum: checksum.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_definition(
        &self,
        workflow_id: &str,
        version: i32,
    ) -> Result<StoredDefinition, GatewayError> {
        self.definitions
            .read()
            .get(&(workflow_id.to_string(), version))
            .cloned()
            .ok_or_else(|| GatewayError::DefinitionNotFound {
                workflow_id: workflow_id.to_string(),
                version,
            })
    }

    async fn insert_definition(
        &self,
        workflow_id: &str,
        version: i32,
        definition: Value,
        checksum: &str,
    ) -> Result<(), GatewayError> {
        let mut definitions = self.definitions.write();
        let key = (workflow_id.to_string(), version);

        if version > 0 && definitions.contains_key(&key) {
            return Err(GatewayError::ImmutableDefinition {
                workflow_id: workflow_id.to_string(),
                version,
            });
        }

        definitions.insert(
            key,
            StoredDefinition {
                workflow_id: workflow_id.to_string(),
                version,
                definition,
                checksum: checksum.to_string(),
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn latest_published_version(
        &self,
        workflow_id: &str,
    ) -> Result<Option<i32>, GatewayError> {
        Ok(self
            .definitions
            .read()
            .keys()
            .filter(|(wf, v)| wf == workflow_id && *v > 0)
            .map(|(_, v)| *v)
            .max())
    }

    async fn find_version_by_checksum(
        &self,
        workflow_id: &str,
        checksum: &str,
    ) -> Result<Option<i32>, GatewayError> {
        Ok(self
            .definitions
            .read()
            .values()
            .filter(|d| d.workflow_id == workflow_id && d.version > 0 && d.checksum == checksum)
            .map(|d| d.version)
            .max())
    }

    async fn start_execution(
        &self,
        new: NewExecution,
    ) -> Result<StartedExecution, GatewayError> {
        // Hold the request index write lock across the dedupe check and the
        // insert so concurrent identical requests cannot both create rows.
        let mut request_index = self.request_index.write();

        if let Some((workflow_id, execution_id)) = request_index.get(&new.request_id) {
            if workflow_id == &new.workflow_id {
                return Ok(StartedExecution {
                    execution_id: *execution_id,
                    was_existing: true,
                });
            }
            return Err(GatewayError::RequestIdConflict {
                request_id: new.request_id,
                other_workflow_id: workflow_id.clone(),
            });
        }

        let workflow = self
            .workflows
            .read()
            .get(&new.workflow_id)
            .cloned()
            .ok_or_else(|| GatewayError::WorkflowNotFound(new.workflow_id.clone()))?;

        let version = match workflow.status {
            WorkflowStatus::Active => {
                if !workflow.is_enabled {
                    return Err(GatewayError::WorkflowDisabled(workflow.id));
                }
                match new.workflow_version {
                    Some(pinned) => pinned,
                    None => workflow
                        .current_version
                        .ok_or_else(|| GatewayError::WorkflowNotActive(workflow.id.clone()))?,
                }
            }
            WorkflowStatus::Draft if new.allow_draft => new.workflow_version.unwrap_or(0),
            _ => return Err(GatewayError::WorkflowNotActive(workflow.id)),
        };

        let execution_id = Uuid::now_v7();
        let record = ExecutionRecord {
            id: execution_id,
            workflow_id: new.workflow_id.clone(),
            workflow_version: version,
            request_id: new.request_id.clone(),
            status: ExecutionStatus::Pending,
            trigger: new.trigger,
            context_snapshot: None,
            started_at: None,
            ended_at: None,
            created_at: Utc::now(),
            correlation_id: new
                .correlation_id
                .unwrap_or_else(|| Uuid::now_v7().to_string()),
            tenant_id: new.tenant_id,
            parent_execution_id: new.parent_execution_id,
            principal: new.principal,
            cancel_requested: false,
        };

        self.executions.write().insert(execution_id, record);
        request_index.insert(new.request_id, (new.workflow_id, execution_id));

        Ok(StartedExecution {
            execution_id,
            was_existing: false,
        })
    }

    async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionRecord, GatewayError> {
        self.executions
            .read()
            .get(&execution_id)
            .cloned()
            .ok_or(GatewayError::ExecutionNotFound(execution_id))
    }

    async fn try_acquire_execution(&self, execution_id: Uuid) -> Result<bool, GatewayError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&execution_id)
            .ok_or(GatewayError::ExecutionNotFound(execution_id))?;

        if execution.status != ExecutionStatus::Pending {
            return Ok(false);
        }

        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        Ok(true)
    }

    async fn complete_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
        context_snapshot: Option<Value>,
    ) -> Result<(), GatewayError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&execution_id)
            .ok_or(GatewayError::ExecutionNotFound(execution_id))?;

        if execution.status != ExecutionStatus::Running || !status.is_terminal() {
            return Err(GatewayError::IllegalStateTransition {
                execution_id,
                from: execution.status,
                to: status,
            });
        }

        execution.status = status;
        execution.context_snapshot = context_snapshot;
        execution.ended_at = Some(Utc::now());
        Ok(())
    }

    async fn request_cancel(&self, execution_id: Uuid) -> Result<(), GatewayError> {
        let mut executions = self.executions.write();
        let execution = executions
            .get_mut(&execution_id)
            .ok_or(GatewayError::ExecutionNotFound(execution_id))?;

        if !execution.status.is_terminal() {
            execution.cancel_requested = true;
        }
        Ok(())
    }

    async fn record_attempt(&self, attempt: NewAttempt) -> Result<Uuid, GatewayError> {
        let mut attempts = self.attempts.write();
        let rows = attempts.entry(attempt.execution_id).or_default();

        // Upsert on (node_id, attempt): replay-safe and allows promotion of
        // the final retriable row to its terminal status.
        if let Some(existing) = rows
            .iter_mut()
            .find(|r| r.node_id == attempt.node_id && r.attempt == attempt.attempt)
        {
            existing.status = attempt.status;
            existing.retry_count = attempt.retry_count;
            existing.parameters = attempt.parameters;
            existing.outputs = attempt.outputs;
            existing.error = attempt.error;
            existing.ended_at = attempt.ended_at;
            return Ok(existing.id);
        }

        let id = Uuid::now_v7();
        rows.push(AttemptRecord {
            id,
            execution_id: attempt.execution_id,
            node_id: attempt.node_id,
            action_type: attempt.action_type,
            status: attempt.status,
            attempt: attempt.attempt,
            retry_count: attempt.retry_count,
            parameters: attempt.parameters,
            outputs: attempt.outputs,
            error: attempt.error,
            started_at: attempt.started_at,
            ended_at: attempt.ended_at,
        });
        Ok(id)
    }

    async fn load_attempts(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<AttemptRecord>, GatewayError> {
        let mut rows = self
            .attempts
            .read()
            .get(&execution_id)
            .cloned()
            .unwrap_or_default();
        rows.sort_by(|a, b| (a.node_id.as_str(), a.attempt).cmp(&(b.node_id.as_str(), b.attempt)));
        Ok(rows)
    }

    async fn link_external_resource(
        &self,
        execution_id: Uuid,
        action_execution_id: Option<Uuid>,
        link: &ResourceLinkRef,
    ) -> Result<LinkOutcome, GatewayError> {
        let mut links = self.links.write();
        let key = (
            link.system.clone(),
            link.resource_type.clone(),
            link.resource_id.clone(),
        );

        if let Some(existing) = links.get(&key) {
            if existing.execution_id == execution_id {
                return Ok(LinkOutcome::ExistsSameExecution);
            }
            return Err(GatewayError::ResourceLinkConflict {
                system: link.system.clone(),
                resource_type: link.resource_type.clone(),
                resource_id: link.resource_id.clone(),
                owner_execution_id: existing.execution_id,
            });
        }

        links.insert(
            key,
            ResourceLinkRecord {
                id: Uuid::now_v7(),
                execution_id,
                action_execution_id,
                system: link.system.clone(),
                resource_type: link.resource_type.clone(),
                resource_id: link.resource_id.clone(),
                url: link.url.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(LinkOutcome::Created)
    }

    async fn find_resource_link(
        &self,
        system: &str,
        resource_type: &str,
        resource_id: &str,
    ) -> Result<Option<ResourceLinkRecord>, GatewayError> {
        Ok(self
            .links
            .read()
            .get(&(
                system.to_string(),
                resource_type.to_string(),
                resource_id.to_string(),
            ))
            .cloned())
    }

    async fn record_hierarchy(&self, record: &HierarchyRecord) -> Result<(), GatewayError> {
        let mut hierarchy = self.hierarchy.write();
        let exists = hierarchy.iter().any(|h| {
            h.parent_execution_id == record.parent_execution_id
                && h.child_execution_id == record.child_execution_id
        });
        if !exists {
            hierarchy.push(record.clone());
        }
        Ok(())
    }

    async fn list_children(
        &self,
        parent_execution_id: Uuid,
    ) -> Result<Vec<HierarchyRecord>, GatewayError> {
        Ok(self
            .hierarchy
            .read()
            .iter()
            .filter(|h| h.parent_execution_id == parent_execution_id)
            .cloned()
            .collect())
    }

    async fn record_event(&self, event: NewExecutionEvent) -> Result<(), GatewayError> {
        let id = self.event_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.events.write().push(ExecutionEvent {
            id,
            execution_id: event.execution_id,
            at: Utc::now(),
            level: event.level,
            category: event.category,
            payload: event.payload,
        });
        Ok(())
    }

    async fn list_events(
        &self,
        execution_id: Uuid,
    ) -> Result<Vec<ExecutionEvent>, GatewayError> {
        Ok(self
            .events
            .read()
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn get_plan(
        &self,
        workflow_id: &str,
        version: i32,
    ) -> Result<Option<Value>, GatewayError> {
        Ok(self
            .plans
            .read()
            .get(&(workflow_id.to_string(), version))
            .cloned())
    }

    async fn put_plan(
        &self,
        workflow_id: &str,
        version: i32,
        plan: Value,
    ) -> Result<(), GatewayError> {
        self.plans
            .write()
            .insert((workflow_id.to_string(), version), plan);
        Ok(())
    }

    async fn invalidate_plans(&self, workflow_id: &str) -> Result<(), GatewayError> {
        self.plans.write().retain(|(wf, _), _| wf != workflow_id);
        Ok(())
    }
}
