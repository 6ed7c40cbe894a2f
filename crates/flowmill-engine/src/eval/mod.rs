//! Template and condition evaluation
//!
//! The planner precompiles node parameter templates and edge conditions; the
//! conductor renders and evaluates them against a read-only view of the run.
//! Both evaluators are trait seams so deployments can swap the scripting
//! surface; the defaults are backed by minijinja with a compute-fuel cap.
//!
//! Error policy (fixed by the conductor, not the evaluators):
//! - template failures surface as retriable node errors
//! - condition failures evaluate soft: the edge reads `false` and an
//!   execution event records the error

mod condition;
mod template;

pub use condition::MinijinjaConditionEvaluator;
pub use template::MinijinjaTemplateEvaluator;

use serde_json::Value;

/// Evaluation failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalError {
    /// The source failed to compile
    #[error("syntax error in {what}: {message}")]
    Syntax { what: String, message: String },

    /// Rendering or evaluation failed (including fuel exhaustion)
    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

/// Read-only context supplied to templates and conditions
///
/// `trigger` is the immutable trigger payload, `context` the point-in-time
/// node-output snapshot, `vars` engine-provided variables (execution id,
/// node id, attempt, correlation id).
#[derive(Debug, Clone)]
pub struct EvalContext {
    pub trigger: Value,
    pub context: Value,
    pub vars: Value,
}

impl EvalContext {
    pub fn new(trigger: Value, context: Value, vars: Value) -> Self {
        Self {
            trigger,
            context,
            vars,
        }
    }

    /// Empty context for publish-time dry rendering
    pub fn empty() -> Self {
        Self {
            trigger: Value::Object(Default::default()),
            context: Value::Object(Default::default()),
            vars: Value::Object(Default::default()),
        }
    }
}

/// A parameter template tree whose string leaves passed syntax validation
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CompiledTemplate {
    pub(crate) tree: Value,
}

impl CompiledTemplate {
    /// The underlying template tree
    pub fn tree(&self) -> &Value {
        &self.tree
    }
}

/// A boolean expression that passed syntax validation
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CompiledCondition {
    pub(crate) source: String,
}

impl CompiledCondition {
    /// The original expression source
    pub fn source(&self) -> &str {
        &self.source
    }
}

/// Renders parameter template trees
pub trait TemplateEvaluator: Send + Sync + 'static {
    /// Validate every template string in the tree
    fn compile(&self, tree: &Value) -> Result<CompiledTemplate, EvalError>;

    /// Render the tree: string leaves are interpolated, everything else is
    /// passed through unchanged
    fn render(&self, template: &CompiledTemplate, ctx: &EvalContext) -> Result<Value, EvalError>;
}

/// Evaluates boolean edge conditions
pub trait ConditionEvaluator: Send + Sync + 'static {
    /// Validate the expression syntax
    fn compile(&self, source: &str) -> Result<CompiledCondition, EvalError>;

    /// Evaluate to a boolean under resource caps
    fn evaluate(&self, condition: &CompiledCondition, ctx: &EvalContext)
        -> Result<bool, EvalError>;
}

pub(crate) fn minijinja_context(ctx: &EvalContext) -> minijinja::Value {
    minijinja::context! {
        trigger => minijinja::Value::from_serialize(&ctx.trigger),
        context => minijinja::Value::from_serialize(&ctx.context),
        vars => minijinja::Value::from_serialize(&ctx.vars),
    }
}
