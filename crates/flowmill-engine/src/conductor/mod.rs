//! The conductor
//!
//! Drives a compiled plan to completion: event-driven node scheduling under a
//! process-wide concurrency limit, per-node retries with backoff, join
//! synchronization, condition-based routing, and a workflow-scoped
//! cancellation tree. Every attempt is persisted before its outgoing edges
//! are evaluated, so a crashed process never leaves routing ahead of the
//! store.

mod joins;

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use flowmill_model::{
    ActionResult, ActionStatus, DefinitionError, EdgeWhen, ExecutionStatus, Principal,
    RoutePolicy, WorkflowDefinition,
};

use self::joins::{JoinTable, Resolution};
use crate::config::EngineConfig;
use crate::context::RuntimeContext;
use crate::eval::{ConditionEvaluator, EvalContext, TemplateEvaluator};
use crate::events::{EventCategory, EventLevel, NewExecutionEvent};
use crate::persistence::{GatewayError, NewAttempt, PersistenceGateway};
use crate::plan::{EdgeDescriptor, NodeDescriptor, NodeKind, Plan, PlanCache, PlanError, Planner};
use crate::registry::{ActionHandler, ActionInvocation, ActionRegistry};
use crate::remote::RemoteInvoker;
use crate::subflow;

/// Errors from conductor operations
#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    /// Store error
    #[error("store error: {0}")]
    Gateway(#[from] GatewayError),

    /// Plan compilation error
    #[error("plan error: {0}")]
    Plan(#[from] PlanError),

    /// The stored definition no longer parses
    #[error("stored definition is invalid: {0}")]
    Definition(#[from] DefinitionError),
}

/// Why the workflow cancel scope fired
#[derive(Debug, Clone)]
pub(crate) enum CancelCause {
    /// A permanent node failure
    NodeFailure(String),
    /// External cancel request
    External,
    /// Workflow timeout
    Timeout,
}

impl CancelCause {
    fn as_str(&self) -> &'static str {
        match self {
            Self::NodeFailure(_) => "node_failure",
            Self::External => "external",
            Self::Timeout => "timeout",
        }
    }
}

/// Shared state of one running execution
pub(crate) struct RunState {
    pub(crate) execution_id: Uuid,
    pub(crate) plan: Arc<Plan>,
    pub(crate) ctx: RuntimeContext,
    pub(crate) principal: Option<Principal>,
    joins: JoinTable,
    /// Workflow-scoped cancel; node tasks derive child tokens from it
    pub(crate) cancel: CancellationToken,
    cancel_cause: Mutex<Option<CancelCause>>,
    /// Nodes with at least one persisted attempt row
    visited: Mutex<HashSet<String>>,
    /// Nodes resolved dead (all incoming unsatisfied) before any cancel;
    /// these get no Skipped row in the completion sweep
    dead: Mutex<HashSet<String>>,
    /// Targets of satisfied failure edges. A permanent failure always fires
    /// the cancel scope, but its failure routing still runs: these nodes
    /// execute and record their outcome despite the cancel.
    failure_path: Mutex<HashSet<String>>,
}

/// The workflow executor
///
/// One conductor serves every execution in the process; the semaphore it
/// holds is the global `max_parallel_actions` ceiling. Executions are driven
/// by [`Conductor::execute`], which is safe to call repeatedly: terminal
/// executions return their status without rerunning, and the
/// Pending -> Running compare-and-set guarantees a single runner across
/// replicas.
pub struct Conductor {
    gateway: Arc<dyn PersistenceGateway>,
    registry: Arc<ActionRegistry>,
    templates: Arc<dyn TemplateEvaluator>,
    conditions: Arc<dyn ConditionEvaluator>,
    remote: RemoteInvoker,
    planner: Planner,
    plan_cache: PlanCache,
    permits: Arc<Semaphore>,
    config: EngineConfig,
    /// In-flight runs, for external cancellation
    active: Mutex<HashMap<Uuid, Arc<RunState>>>,
}

impl Conductor {
    pub fn new(
        gateway: Arc<dyn PersistenceGateway>,
        registry: Arc<ActionRegistry>,
        templates: Arc<dyn TemplateEvaluator>,
        conditions: Arc<dyn ConditionEvaluator>,
        config: EngineConfig,
    ) -> Self {
        Self {
            remote: RemoteInvoker::new(config.connectors.clone()),
            planner: Planner::new(templates.clone(), conditions.clone()),
            plan_cache: PlanCache::new(),
            permits: Arc::new(Semaphore::new(config.max_parallel_actions.max(1))),
            active: Mutex::new(HashMap::new()),
            gateway,
            registry,
            templates,
            conditions,
            config,
        }
    }

    /// Drop all cached plans of a workflow (called on publish)
    pub fn invalidate_plans(&self, workflow_id: &str) {
        self.plan_cache.invalidate(workflow_id);
    }

    /// Run an execution to a terminal status
    ///
    /// Idempotent re-entry: a terminal execution returns its status without
    /// rerunning; an execution claimed by another runner returns `Running`.
    #[instrument(skip(self), fields(execution_id = %execution_id))]
    pub async fn execute(
        self: &Arc<Self>,
        execution_id: Uuid,
    ) -> Result<ExecutionStatus, ConductorError> {
        let record = self.gateway.get_execution(execution_id).await?;
        if record.status.is_terminal() {
            debug!(status = %record.status, "execution already terminal");
            return Ok(record.status);
        }

        if !self.gateway.try_acquire_execution(execution_id).await? {
            let current = self.gateway.get_execution(execution_id).await?;
            debug!(status = %current.status, "execution not acquired");
            return Ok(current.status);
        }

        if record.cancel_requested {
            self.gateway
                .complete_execution(execution_id, ExecutionStatus::Cancelled, None)
                .await?;
            return Ok(ExecutionStatus::Cancelled);
        }

        let plan = self
            .plan_for(&record.workflow_id, record.workflow_version)
            .await?;
        let (depth, ancestors) = self.lineage(record.parent_execution_id).await?;

        let ctx = RuntimeContext::new(record.trigger.clone(), record.correlation_id.clone())
            .with_tenant(record.tenant_id.clone())
            .with_lineage(depth, ancestors);

        let run = Arc::new(RunState {
            execution_id,
            joins: JoinTable::new(&plan),
            plan,
            ctx,
            principal: record.principal.clone(),
            cancel: CancellationToken::new(),
            cancel_cause: Mutex::new(None),
            visited: Mutex::new(HashSet::new()),
            dead: Mutex::new(HashSet::new()),
            failure_path: Mutex::new(HashSet::new()),
        });

        self.active.lock().insert(execution_id, run.clone());
        let result = self
            .drive(&run, record.parent_execution_id.is_some())
            .await;
        self.active.lock().remove(&execution_id);

        result
    }

    /// Boxed form of [`Conductor::execute`] for recursive sub-workflow calls
    pub(crate) fn execute_boxed(
        self: Arc<Self>,
        execution_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<ExecutionStatus, ConductorError>> + Send>> {
        Box::pin(async move { self.execute(execution_id).await })
    }

    /// Request cancellation of an execution
    ///
    /// Flags the row for replicas that have not started it and fires the
    /// in-process cancel scope when this process holds the run.
    pub async fn cancel(&self, execution_id: Uuid) -> Result<(), GatewayError> {
        self.gateway.request_cancel(execution_id).await?;

        let run = self.active.lock().get(&execution_id).cloned();
        if let Some(run) = run {
            self.trigger_cancel(&run, CancelCause::External).await;
        }
        Ok(())
    }

    // =========================================================================
    // Scheduling loop
    // =========================================================================

    async fn drive(
        self: &Arc<Self>,
        run: &Arc<RunState>,
        is_child: bool,
    ) -> Result<ExecutionStatus, ConductorError> {
        let workflow_timeout = if is_child {
            self.config.subworkflow.default_child_timeout
        } else {
            self.config.default_workflow_timeout
        };

        info!(
            execution_id = %run.execution_id,
            workflow_id = %run.plan.workflow_id,
            version = run.plan.version,
            "running workflow"
        );

        // Close the race with a cancel request that landed between the
        // acquisition CAS and this run's registration
        if self
            .gateway
            .get_execution(run.execution_id)
            .await?
            .cancel_requested
        {
            self.trigger_cancel(run, CancelCause::External).await;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        tx.send(run.plan.start_node.clone())
            .expect("receiver alive");

        let mut tasks: JoinSet<()> = JoinSet::new();
        let timeout_sleep = tokio::time::sleep(workflow_timeout);
        tokio::pin!(timeout_sleep);
        let mut timed_out = false;

        loop {
            // Drain everything runnable, then wait for progress. A node task
            // always enqueues successors before finishing, so when the last
            // task joins the queue already holds whatever it produced.
            while let Ok(node_id) = rx.try_recv() {
                self.spawn_node(&mut tasks, run, node_id, &tx);
            }
            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                _ = &mut timeout_sleep, if !timed_out => {
                    timed_out = true;
                    warn!(execution_id = %run.execution_id, "workflow timed out");
                    self.trigger_cancel(run, CancelCause::Timeout).await;
                }
                joined = tasks.join_next() => {
                    if let Some(Err(e)) = joined {
                        error!(execution_id = %run.execution_id, error = %e, "node task panicked");
                        self.trigger_cancel(
                            run,
                            CancelCause::NodeFailure("<panicked>".to_string()),
                        )
                        .await;
                    }
                }
                Some(node_id) = rx.recv() => {
                    self.spawn_node(&mut tasks, run, node_id, &tx);
                }
            }
        }

        let cause = run.cancel_cause.lock().clone();
        let status = match &cause {
            None => ExecutionStatus::Succeeded,
            Some(CancelCause::NodeFailure(_)) => ExecutionStatus::Failed,
            Some(CancelCause::External) | Some(CancelCause::Timeout) => {
                ExecutionStatus::Cancelled
            }
        };

        if cause.is_some() {
            self.record_skipped_unvisited(run).await?;
        }

        let snapshot = match run.ctx.prune(&self.config.context_snapshot) {
            Ok(doc) => Some(doc),
            Err(overflow) => {
                self.record_event(
                    run,
                    EventLevel::Warning,
                    EventCategory::ContextOverflow,
                    json!({ "actualBytes": overflow.actual, "maxBytes": overflow.max }),
                )
                .await;
                None
            }
        };

        self.gateway
            .complete_execution(run.execution_id, status, snapshot)
            .await?;

        info!(execution_id = %run.execution_id, status = %status, "workflow completed");
        Ok(status)
    }

    fn spawn_node(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        run: &Arc<RunState>,
        node_id: String,
        tx: &UnboundedSender<String>,
    ) {
        let conductor = Arc::clone(self);
        let run = Arc::clone(run);
        let tx = tx.clone();

        tasks.spawn(async move {
            if let Err(e) = conductor.run_node(&run, &node_id, &tx).await {
                error!(
                    execution_id = %run.execution_id,
                    node_id = %node_id,
                    error = %e,
                    "node task failed against the store"
                );
                conductor
                    .trigger_cancel(&run, CancelCause::NodeFailure(node_id.clone()))
                    .await;
            }
        });
    }

    // =========================================================================
    // Per-node execution
    // =========================================================================

    async fn run_node(
        self: &Arc<Self>,
        run: &Arc<RunState>,
        node_id: &str,
        tx: &UnboundedSender<String>,
    ) -> Result<(), GatewayError> {
        let node = match run.plan.node(node_id) {
            Some(node) => node.clone(),
            None => return Ok(()),
        };
        let outgoing = run.plan.outgoing(node_id).to_vec();

        // Failure routing runs even under the cancel scope: a node reached
        // through a satisfied failure edge records a real outcome, not Skipped
        let exempt = run.failure_path.lock().contains(node_id);

        if run.cancel.is_cancelled() && !exempt {
            self.record_skip(run, &node, 1, "workflow cancelled before node started")
                .await?;
            self.cascade(run, &outgoing, &vec![false; outgoing.len()], tx);
            return Ok(());
        }

        let retry = node
            .retry
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());

        let mut rendered: Option<Value> = None;
        let mut attempt: u32 = 1;

        let terminal = loop {
            // 1. Permit: global concurrency ceiling, released before backoff
            let permit = tokio::select! {
                biased;
                _ = run.cancel.cancelled(), if !exempt => {
                    self.record_skip(run, &node, attempt, "workflow cancelled before node started")
                        .await?;
                    break ActionStatus::Skipped;
                }
                permit = Arc::clone(&self.permits).acquire_owned() => {
                    permit.expect("semaphore never closed")
                }
            };

            let started_at = Utc::now();

            // 2. Parameter rendering; the first render is reused on retries
            //    unless the node opts into rerendering
            let render_result = if rendered.is_none() || node.rerender_on_retry {
                match self
                    .templates
                    .render(&node.parameters, &self.eval_context(run, node_id, attempt))
                {
                    Ok(params) => {
                        rendered = Some(params.clone());
                        Ok(params)
                    }
                    Err(e) => Err(e),
                }
            } else {
                Ok(rendered.clone().expect("rendered on a prior attempt"))
            };

            // Sub-workflow waits must not pin a permit: the child's nodes
            // acquire their own
            let held = if matches!(node.kind, NodeKind::Subworkflow { .. }) {
                drop(permit);
                None
            } else {
                Some(permit)
            };

            // 3. Invocation under per-node timeout and the workflow cancel
            let (params, result) = match render_result {
                Ok(params) => {
                    let result = self.invoke(run, &node, node_id, &params, attempt).await;
                    (Some(params), result)
                }
                Err(e) => (
                    None,
                    ActionResult::retriable(format!("parameter render failed: {e}")),
                ),
            };

            drop(held);

            // 4. Persist the attempt before any routing happens
            let row_id = self
                .record_attempt_row(run, &node, attempt, params.clone(), &result, started_at)
                .await?;

            match result.status {
                ActionStatus::Succeeded => {
                    if let Some(conflict) =
                        self.claim_links(run, node_id, row_id, &result).await?
                    {
                        // Cross-execution ownership conflict: permanent failure
                        self.record_attempt_row(
                            run,
                            &node,
                            attempt,
                            params,
                            &ActionResult::failed(conflict),
                            started_at,
                        )
                        .await?;
                        break ActionStatus::Failed;
                    }

                    run.ctx.set_output(node_id, result.outputs.clone());
                    break ActionStatus::Succeeded;
                }
                ActionStatus::Failed => break ActionStatus::Failed,
                ActionStatus::Skipped => break ActionStatus::Skipped,
                ActionStatus::RetriableFailure => {
                    if retry.has_attempts_remaining(attempt) {
                        let delay = retry.delay_after_attempt(attempt);
                        self.record_event(
                            run,
                            EventLevel::Info,
                            EventCategory::RetryScheduled,
                            json!({
                                "nodeId": node_id,
                                "attempt": attempt,
                                "delayMs": delay.as_millis() as u64,
                            }),
                        )
                        .await;

                        tokio::select! {
                            _ = tokio::time::sleep(delay) => {
                                attempt += 1;
                                continue;
                            }
                            _ = run.cancel.cancelled(), if !exempt => {
                                self.record_skip(
                                    run,
                                    &node,
                                    attempt + 1,
                                    "workflow cancelled during retry backoff",
                                )
                                .await?;
                                break ActionStatus::Skipped;
                            }
                        }
                    }

                    // Retries exhausted: promote the final row to permanent
                    let message = result
                        .error_message
                        .unwrap_or_else(|| "retriable failure".to_string());
                    self.record_attempt_row(
                        run,
                        &node,
                        attempt,
                        params,
                        &ActionResult::failed(format!("retries exhausted: {message}")),
                        started_at,
                    )
                    .await?;
                    break ActionStatus::Failed;
                }
            }
        };

        // 5. Edge evaluation in declaration order
        let satisfied = self.evaluate_edges(run, &node, node_id, terminal, &outgoing).await;

        // 6. A permanent failure always triggers fail-fast cancellation; the
        //    run will complete as Failed. The cancel fires before join
        //    resolution so downstream tasks observe it, while satisfied
        //    failure edges still route (cascade marks their targets as
        //    failure-path, exempt from the cancel scope).
        if terminal == ActionStatus::Failed {
            self.trigger_cancel(run, CancelCause::NodeFailure(node_id.to_string()))
                .await;
        }

        self.cascade(run, &outgoing, &satisfied, tx);
        Ok(())
    }

    /// Dispatch the node body: registry action or sub-workflow
    async fn invoke(
        self: &Arc<Self>,
        run: &Arc<RunState>,
        node: &NodeDescriptor,
        node_id: &str,
        params: &Value,
        attempt: u32,
    ) -> ActionResult {
        let timeout = node.timeout.unwrap_or(self.config.default_action_timeout);
        // Failure-path nodes get a token detached from the workflow scope;
        // the per-node timeout still bounds them
        let node_cancel = if run.failure_path.lock().contains(node_id) {
            CancellationToken::new()
        } else {
            run.cancel.child_token()
        };

        let inv = ActionInvocation {
            execution_id: run.execution_id,
            node_id: node_id.to_string(),
            attempt,
            correlation_id: run.ctx.correlation_id().to_string(),
            principal: run.principal.clone(),
            cancel: node_cancel.clone(),
        };

        let body = async {
            match &node.kind {
                NodeKind::Action { action_type } => match self.registry.resolve(action_type) {
                    None => ActionResult::failed(format!(
                        "action type '{action_type}' is not registered"
                    )),
                    Some(ActionHandler::Local(action)) => {
                        action.execute(&inv, params.clone()).await
                    }
                    Some(ActionHandler::Remote(remote)) => {
                        self.remote.invoke(&remote, action_type, params, &inv).await
                    }
                },
                NodeKind::Subworkflow {
                    workflow_id,
                    workflow_version,
                    wait_for_completion,
                } => {
                    subflow::run_subworkflow(
                        self,
                        run,
                        workflow_id,
                        *workflow_version,
                        *wait_for_completion,
                        params,
                        &inv,
                    )
                    .await
                }
            }
        };

        tokio::select! {
            result = body => result,
            _ = tokio::time::sleep(timeout) => {
                // A node timeout is a permanent failure
                node_cancel.cancel();
                ActionResult::failed(format!("node timed out after {}ms", timeout.as_millis()))
            }
        }
    }

    // =========================================================================
    // Routing
    // =========================================================================

    async fn evaluate_edges(
        &self,
        run: &Arc<RunState>,
        node: &NodeDescriptor,
        node_id: &str,
        terminal: ActionStatus,
        outgoing: &[EdgeDescriptor],
    ) -> Vec<bool> {
        let mut satisfied = vec![false; outgoing.len()];

        // A skipped node activates nothing, `always` edges included
        if terminal == ActionStatus::Skipped {
            return satisfied;
        }

        for (i, edge) in outgoing.iter().enumerate() {
            let when_matches = match edge.when {
                EdgeWhen::Success => terminal == ActionStatus::Succeeded,
                EdgeWhen::Failure => terminal == ActionStatus::Failed,
                EdgeWhen::Always => true,
            };
            if !when_matches {
                continue;
            }

            let condition_holds = match &edge.condition {
                None => true,
                Some(condition) => {
                    let ctx = self.eval_context(run, node_id, 0);
                    match self.conditions.evaluate(condition, &ctx) {
                        Ok(value) => value,
                        Err(e) => {
                            // Evaluator errors read as false, recorded softly
                            self.record_event(
                                run,
                                EventLevel::Warning,
                                EventCategory::ConditionError,
                                json!({
                                    "nodeId": node_id,
                                    "target": edge.target,
                                    "condition": condition.source(),
                                    "error": e.to_string(),
                                }),
                            )
                            .await;
                            false
                        }
                    }
                }
            };

            if condition_holds {
                satisfied[i] = true;
                if node.route_policy == RoutePolicy::FirstMatch {
                    break;
                }
            }
        }

        satisfied
    }

    /// Resolve edges into the join table, cascading dead branches
    fn cascade(
        &self,
        run: &Arc<RunState>,
        outgoing: &[EdgeDescriptor],
        satisfied: &[bool],
        tx: &UnboundedSender<String>,
    ) {
        let mut work: VecDeque<(String, bool)> = VecDeque::with_capacity(outgoing.len());
        for (edge, &s) in outgoing.iter().zip(satisfied.iter()) {
            // Mark failure routing before the target can fire so its task
            // sees the exemption even when the cancel scope is already set
            if s && edge.when == EdgeWhen::Failure {
                run.failure_path.lock().insert(edge.target.clone());
            }
            work.push_back((edge.target.clone(), s));
        }

        while let Some((target, satisfied)) = work.pop_front() {
            match run.joins.resolve(&target, satisfied) {
                Resolution::Fire => {
                    // Receiver outlives all tasks; send cannot fail in practice
                    let _ = tx.send(target);
                }
                Resolution::Dead => {
                    if !run.cancel.is_cancelled() {
                        run.dead.lock().insert(target.clone());
                    }
                    for edge in run.plan.outgoing(&target) {
                        work.push_back((edge.target.clone(), false));
                    }
                }
                Resolution::Pending => {}
            }
        }
    }

    // =========================================================================
    // Persistence helpers
    // =========================================================================

    async fn record_attempt_row(
        &self,
        run: &Arc<RunState>,
        node: &NodeDescriptor,
        attempt: u32,
        params: Option<Value>,
        result: &ActionResult,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<Uuid, GatewayError> {
        run.visited.lock().insert(node.id.clone());

        let outputs = match result.status {
            ActionStatus::Succeeded => Some(result.outputs_value()),
            _ => None,
        };
        let error = result
            .error_message
            .as_ref()
            .map(|message| json!({ "message": message }));

        self.gateway
            .record_attempt(NewAttempt {
                execution_id: run.execution_id,
                node_id: node.id.clone(),
                action_type: node.kind.action_type(),
                status: result.status,
                attempt,
                retry_count: attempt.saturating_sub(1),
                parameters: params,
                outputs,
                error,
                started_at,
                ended_at: Some(Utc::now()),
            })
            .await
    }

    async fn record_skip(
        &self,
        run: &Arc<RunState>,
        node: &NodeDescriptor,
        attempt: u32,
        reason: &str,
    ) -> Result<(), GatewayError> {
        let mut skipped = ActionResult::skipped();
        skipped.error_message = Some(reason.to_string());
        self.record_attempt_row(run, node, attempt, None, &skipped, Utc::now())
            .await?;
        Ok(())
    }

    /// After a cancel, every reachable node that never produced an attempt
    /// row (and was not already dead-routed) is recorded Skipped.
    async fn record_skipped_unvisited(&self, run: &Arc<RunState>) -> Result<(), GatewayError> {
        let visited = run.visited.lock().clone();
        let dead = run.dead.lock().clone();

        let mut unvisited: Vec<&String> = run
            .plan
            .reachable
            .iter()
            .filter(|id| !visited.contains(*id) && !dead.contains(*id))
            .collect();
        unvisited.sort();

        for node_id in unvisited {
            if let Some(node) = run.plan.node(node_id) {
                self.record_skip(run, node, 1, "workflow cancelled before node became runnable")
                    .await?;
            }
        }
        Ok(())
    }

    async fn claim_links(
        &self,
        run: &Arc<RunState>,
        node_id: &str,
        action_execution_id: Uuid,
        result: &ActionResult,
    ) -> Result<Option<String>, GatewayError> {
        for link in &result.resource_links {
            match self
                .gateway
                .link_external_resource(run.execution_id, Some(action_execution_id), link)
                .await
            {
                Ok(_) => {}
                Err(e @ GatewayError::ResourceLinkConflict { .. }) => {
                    let message = e.to_string();
                    self.record_event(
                        run,
                        EventLevel::Error,
                        EventCategory::ResourceLinkConflict,
                        json!({ "nodeId": node_id, "error": message }),
                    )
                    .await;
                    return Ok(Some(message));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    pub(crate) async fn record_event(
        &self,
        run: &Arc<RunState>,
        level: EventLevel,
        category: EventCategory,
        payload: Value,
    ) {
        let event = NewExecutionEvent::new(run.execution_id, level, category, payload);
        if let Err(e) = self.gateway.record_event(event).await {
            warn!(execution_id = %run.execution_id, error = %e, "failed to record event");
        }
    }

    pub(crate) async fn trigger_cancel(&self, run: &Arc<RunState>, cause: CancelCause) {
        let newly_triggered = {
            let mut current = run.cancel_cause.lock();
            if current.is_none() {
                *current = Some(cause.clone());
                true
            } else {
                false
            }
        };

        if newly_triggered {
            run.cancel.cancel();
            self.record_event(
                run,
                EventLevel::Warning,
                EventCategory::CancelTriggered,
                json!({ "cause": cause.as_str() }),
            )
            .await;
        }
    }

    // =========================================================================
    // Plan and lineage loading
    // =========================================================================

    async fn plan_for(
        &self,
        workflow_id: &str,
        version: i32,
    ) -> Result<Arc<Plan>, ConductorError> {
        if let Some(plan) = self.plan_cache.get(workflow_id, version) {
            return Ok(plan);
        }

        // Try the persistent cache before recompiling
        if let Some(plan_json) = self.gateway.get_plan(workflow_id, version).await? {
            if let Ok(plan) = serde_json::from_value::<Plan>(plan_json) {
                let plan = Arc::new(plan);
                self.plan_cache.put(plan.clone());
                return Ok(plan);
            }
            // A stale or unreadable cached plan is regenerated below
        }

        let stored = self.gateway.get_definition(workflow_id, version).await?;
        let definition = WorkflowDefinition::from_value(stored.definition)?;
        let plan = Arc::new(self.planner.compile(&definition, version)?);

        if let Ok(plan_json) = serde_json::to_value(plan.as_ref()) {
            self.gateway.put_plan(workflow_id, version, plan_json).await?;
        }
        self.plan_cache.put(plan.clone());
        Ok(plan)
    }

    /// Depth and ancestor workflow ids, derived by walking the parent chain
    async fn lineage(
        &self,
        parent_execution_id: Option<Uuid>,
    ) -> Result<(usize, Vec<String>), ConductorError> {
        let mut ancestors = Vec::new();
        let mut parent = parent_execution_id;

        while let Some(parent_id) = parent {
            let record = self.gateway.get_execution(parent_id).await?;
            ancestors.push(record.workflow_id.clone());
            parent = record.parent_execution_id;

            if ancestors.len() > 64 {
                break;
            }
        }

        ancestors.reverse();
        Ok((ancestors.len(), ancestors))
    }

    fn eval_context(&self, run: &Arc<RunState>, node_id: &str, attempt: u32) -> EvalContext {
        EvalContext::new(
            run.ctx.trigger().clone(),
            run.ctx.data_snapshot(),
            json!({
                "workflowId": run.plan.workflow_id,
                "executionId": run.execution_id.to_string(),
                "correlationId": run.ctx.correlation_id(),
                "nodeId": node_id,
                "attempt": attempt,
            }),
        )
    }

    pub(crate) fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        &self.gateway
    }

    pub(crate) fn config(&self) -> &EngineConfig {
        &self.config
    }
}
