//! Action registry
//!
//! Single lookup surface mapping an `actionType` string to its handler. Both
//! the publish validator (availability checks) and the conductor (invocation)
//! resolve through here. Handlers come in two variants:
//!
//! - **Local**: an in-process async function
//! - **Remote**: a descriptor pointing at a connector endpoint; the
//!   `RemoteInvoker` performs the HTTP call

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use flowmill_model::{ActionResult, Principal};

/// Per-invocation context handed to action handlers
#[derive(Debug, Clone)]
pub struct ActionInvocation {
    /// Execution that owns the attempt
    pub execution_id: Uuid,

    /// Node being executed
    pub node_id: String,

    /// Attempt number (1-based)
    pub attempt: u32,

    /// Correlation id propagated end to end
    pub correlation_id: String,

    /// Identity that started the execution, if any
    pub principal: Option<Principal>,

    /// Linked cancel: workflow cancel and per-node timeout
    pub cancel: CancellationToken,
}

/// An in-process action
///
/// Failures are expressed through the returned [`ActionResult`] status, not
/// through `Err`: the conductor's retry machinery keys off
/// `RetriableFailure` vs `Failed`.
///
/// # Example
///
/// ```ignore
/// struct SendEmail;
///
/// #[async_trait]
/// impl LocalAction for SendEmail {
///     async fn execute(&self, ctx: &ActionInvocation, params: Value) -> ActionResult {
///         match mailer::send(&params).await {
///             Ok(id) => ActionResult::succeeded(outputs!{ "messageId": id }),
///             Err(e) if e.is_transient() => ActionResult::retriable(e.to_string()),
///             Err(e) => ActionResult::failed(e.to_string()),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait LocalAction: Send + Sync + 'static {
    async fn execute(&self, ctx: &ActionInvocation, params: Value) -> ActionResult;
}

/// Remote action descriptor
#[derive(Debug, Clone)]
pub struct RemoteAction {
    /// Connector whose base URL is resolved from engine configuration
    pub connector_id: String,

    /// Full endpoint override; when absent the conventional
    /// `{connectorUrl}/api/v1/actions/execute` path is used
    pub endpoint_url: Option<String>,
}

/// Resolved handler for an action type
#[derive(Clone)]
pub enum ActionHandler {
    Local(Arc<dyn LocalAction>),
    Remote(RemoteAction),
}

struct RegisteredAction {
    handler: ActionHandler,
    parameter_schema: Option<Value>,
    output_schema: Option<Value>,
    enabled: bool,
}

/// Maps action types to handlers
///
/// # Example
///
/// ```ignore
/// let registry = ActionRegistry::with_builtins();
/// registry.register_local_fn("mail.send", |_ctx, params| async move {
///     ActionResult::succeeded(Default::default())
/// });
/// registry.register_remote("slack.post-message", "slack", None);
/// ```
pub struct ActionRegistry {
    actions: RwLock<HashMap<String, RegisteredAction>>,
}

impl ActionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            actions: RwLock::new(HashMap::new()),
        }
    }

    /// Create a registry preloaded with the `core.*` built-ins
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        crate::builtins::register(&registry);
        registry
    }

    /// Register a local action handler
    pub fn register_local(
        &self,
        action_type: &str,
        handler: Arc<dyn LocalAction>,
        parameter_schema: Option<Value>,
        output_schema: Option<Value>,
    ) {
        self.actions.write().insert(
            action_type.to_string(),
            RegisteredAction {
                handler: ActionHandler::Local(handler),
                parameter_schema,
                output_schema,
                enabled: true,
            },
        );
        info!(action_type, "registered local action");
    }

    /// Register a local action from an async closure
    pub fn register_local_fn<F, Fut>(&self, action_type: &str, f: F)
    where
        F: Fn(ActionInvocation, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ActionResult> + Send + 'static,
    {
        struct FnAction<F>(F);

        #[async_trait]
        impl<F, Fut> LocalAction for FnAction<F>
        where
            F: Fn(ActionInvocation, Value) -> Fut + Send + Sync + 'static,
            Fut: std::future::Future<Output = ActionResult> + Send + 'static,
        {
            async fn execute(&self, ctx: &ActionInvocation, params: Value) -> ActionResult {
                (self.0)(ctx.clone(), params).await
            }
        }

        self.register_local(action_type, Arc::new(FnAction(f)), None, None);
    }

    /// Register a remote action served by a connector
    pub fn register_remote(
        &self,
        action_type: &str,
        connector_id: &str,
        endpoint_url: Option<String>,
    ) {
        self.actions.write().insert(
            action_type.to_string(),
            RegisteredAction {
                handler: ActionHandler::Remote(RemoteAction {
                    connector_id: connector_id.to_string(),
                    endpoint_url,
                }),
                parameter_schema: None,
                output_schema: None,
                enabled: true,
            },
        );
        info!(action_type, connector_id, "registered remote action");
    }

    /// Resolve an action type to its handler (enabled actions only)
    pub fn resolve(&self, action_type: &str) -> Option<ActionHandler> {
        let actions = self.actions.read();
        actions
            .get(action_type)
            .filter(|a| a.enabled)
            .map(|a| a.handler.clone())
    }

    /// Whether an action type is registered and enabled
    pub fn is_available(&self, action_type: &str) -> bool {
        self.actions
            .read()
            .get(action_type)
            .is_some_and(|a| a.enabled)
    }

    /// Enable or disable an action type; returns false when unknown
    pub fn set_enabled(&self, action_type: &str, enabled: bool) -> bool {
        let mut actions = self.actions.write();
        match actions.get_mut(action_type) {
            Some(action) => {
                action.enabled = enabled;
                true
            }
            None => false,
        }
    }

    /// All registered action types, sorted
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.actions.read().keys().cloned().collect();
        types.sort();
        types
    }

    /// Structural check of registered parameter/output schemas
    ///
    /// Returns one message per malformed schema; run at startup when
    /// `validateActionSchemasOnStartup` is enabled.
    pub fn validate_schemas(&self) -> Vec<String> {
        let actions = self.actions.read();
        let mut issues = Vec::new();

        for (action_type, action) in actions.iter() {
            let schemas = [
                ("parameter", &action.parameter_schema),
                ("output", &action.output_schema),
            ];
            for (label, schema) in schemas {
                if let Some(schema) = schema {
                    if !schema.is_object() {
                        issues.push(format!(
                            "{action_type}: {label} schema is not a JSON object"
                        ));
                    }
                }
            }
        }

        issues.sort();
        issues
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
