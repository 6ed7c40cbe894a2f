//! Default template evaluator backed by minijinja

use minijinja::Environment;
use serde_json::Value;

use super::{minijinja_context, CompiledTemplate, EvalContext, EvalError, TemplateEvaluator};

/// Renders `{{ ... }}` interpolations in string leaves of a parameter tree.
///
/// Non-string values (numbers, booleans, nested objects/arrays) are traversed
/// structurally; only string leaves are treated as templates. Evaluation is
/// bounded by a fuel cap so a pathological template cannot stall a node task.
pub struct MinijinjaTemplateEvaluator {
    env: Environment<'static>,
}

impl MinijinjaTemplateEvaluator {
    pub fn new() -> Self {
        Self::with_fuel(Some(200_000))
    }

    /// Create an evaluator with an explicit fuel cap (`None` disables it)
    pub fn with_fuel(fuel: Option<u64>) -> Self {
        let mut env = Environment::new();
        env.set_fuel(fuel);
        Self { env }
    }
}

impl Default for MinijinjaTemplateEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEvaluator for MinijinjaTemplateEvaluator {
    fn compile(&self, tree: &Value) -> Result<CompiledTemplate, EvalError> {
        check_tree(&self.env, tree, "$")?;
        Ok(CompiledTemplate { tree: tree.clone() })
    }

    fn render(&self, template: &CompiledTemplate, ctx: &EvalContext) -> Result<Value, EvalError> {
        let context = minijinja_context(ctx);
        render_tree(&self.env, &template.tree, &context)
    }
}

fn check_tree(env: &Environment<'_>, value: &Value, path: &str) -> Result<(), EvalError> {
    match value {
        Value::String(source) => {
            env.template_from_str(source)
                .map_err(|e| EvalError::Syntax {
                    what: format!("template at {path}"),
                    message: e.to_string(),
                })?;
            Ok(())
        }
        Value::Object(map) => {
            for (key, child) in map {
                check_tree(env, child, &format!("{path}.{key}"))?;
            }
            Ok(())
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                check_tree(env, child, &format!("{path}[{i}]"))?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn render_tree(
    env: &Environment<'_>,
    value: &Value,
    context: &minijinja::Value,
) -> Result<Value, EvalError> {
    match value {
        Value::String(source) => {
            // Fast path: plain strings need no rendering
            if !source.contains("{{") && !source.contains("{%") {
                return Ok(value.clone());
            }
            let rendered = env
                .render_str(source, context)
                .map_err(|e| EvalError::Evaluation(e.to_string()))?;
            Ok(Value::String(rendered))
        }
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, child) in map {
                out.insert(key.clone(), render_tree(env, child, context)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for child in items {
                out.push(render_tree(env, child, context)?);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}
