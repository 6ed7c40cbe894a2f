//! Built-in `core.*` actions
//!
//! Small utility actions that ship with the engine: enough to wire demo
//! workflows and exercise the conductor without any connector.

use serde_json::Value;

use flowmill_model::ActionResult;

use crate::registry::ActionRegistry;

/// Register the built-in actions on a registry
pub fn register(registry: &ActionRegistry) {
    // core.echo: returns its rendered parameters as outputs
    registry.register_local_fn("core.echo", |_ctx, params| async move {
        let outputs = match params {
            Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        ActionResult::succeeded(outputs)
    });

    // core.noop: succeeds with no outputs
    registry.register_local_fn("core.noop", |_ctx, _params| async move {
        ActionResult::succeeded(Default::default())
    });

    // core.fail: fails with the given message; { "retriable": true } makes it transient
    registry.register_local_fn("core.fail", |_ctx, params| async move {
        let message = params
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("core.fail invoked")
            .to_string();

        if params.get("retriable").and_then(Value::as_bool).unwrap_or(false) {
            ActionResult::retriable(message)
        } else {
            ActionResult::failed(message)
        }
    });
}
