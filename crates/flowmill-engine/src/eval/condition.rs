//! Default condition evaluator backed by minijinja expressions

use minijinja::Environment;

use super::{minijinja_context, CompiledCondition, ConditionEvaluator, EvalContext, EvalError};

/// Evaluates edge conditions as minijinja expressions with jinja truthiness.
///
/// `context.fetch.count > 3`, `trigger.kind == "order"`, and plain `true` /
/// `false` all work. Undefined lookups are falsy rather than errors, which
/// matches the soft-failure policy for conditions.
pub struct MinijinjaConditionEvaluator {
    env: Environment<'static>,
}

impl MinijinjaConditionEvaluator {
    pub fn new() -> Self {
        Self::with_fuel(Some(50_000))
    }

    /// Create an evaluator with an explicit fuel cap (`None` disables it)
    pub fn with_fuel(fuel: Option<u64>) -> Self {
        let mut env = Environment::new();
        env.set_fuel(fuel);
        Self { env }
    }
}

impl Default for MinijinjaConditionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl ConditionEvaluator for MinijinjaConditionEvaluator {
    fn compile(&self, source: &str) -> Result<CompiledCondition, EvalError> {
        self.env
            .compile_expression(source)
            .map_err(|e| EvalError::Syntax {
                what: format!("condition '{source}'"),
                message: e.to_string(),
            })?;

        Ok(CompiledCondition {
            source: source.to_string(),
        })
    }

    fn evaluate(
        &self,
        condition: &CompiledCondition,
        ctx: &EvalContext,
    ) -> Result<bool, EvalError> {
        let expression = self
            .env
            .compile_expression(&condition.source)
            .map_err(|e| EvalError::Evaluation(e.to_string()))?;

        let result = expression
            .eval(minijinja_context(ctx))
            .map_err(|e| EvalError::Evaluation(e.to_string()))?;

        Ok(result.is_true())
    }
}
