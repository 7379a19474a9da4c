//! Shipped middleware catalog (v0.1)
//!
//! Framework-provided task middlewares, auto-registered at boot:
//!
//! - `timeout` - rejects with `task.timeout` when the rest of the chain
//!   exceeds the configured deadline; side-effects already issued by the
//!   task are not rolled back.
//! - `require_context` - fails the task pre-run with `context.missing`
//!   when the configured ambient key is absent.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use serde_json::{json, Value};

use crate::builders::task_middleware;
use crate::context::Context;
use crate::error::WeftError;
use crate::unit::TaskMiddlewareDef;

/// Default timeout budget when an attachment omits `ms`
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

static TIMEOUT: Lazy<Arc<TaskMiddlewareDef>> = Lazy::new(|| {
    task_middleware("runtime:middleware:timeout")
        .config_schema(json!({
            "type": "object",
            "properties": {"ms": {"type": "integer", "minimum": 1}},
        }))
        .run(|call, _deps, config| async move {
            let ms = config
                .get("ms")
                .and_then(Value::as_u64)
                .unwrap_or(DEFAULT_TIMEOUT_MS);
            let task_id = call.task_id.clone();
            match tokio::time::timeout(
                Duration::from_millis(ms),
                call.next.invoke(call.input),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(WeftError::TaskTimeout {
                    task: task_id,
                    after_ms: ms,
                }),
            }
        })
        .build()
        .expect("valid shipped timeout middleware")
});

static REQUIRE_CONTEXT: Lazy<Arc<TaskMiddlewareDef>> = Lazy::new(|| {
    task_middleware("runtime:middleware:requireContext")
        .config_schema(json!({
            "type": "object",
            "properties": {"key": {"type": "string", "minLength": 1}},
            "required": ["key"],
        }))
        .run(|call, _deps, config| async move {
            let key = config.get("key").and_then(Value::as_str).unwrap_or("");
            if !Context::has(key) {
                return Err(WeftError::ContextMissing {
                    key: key.to_string(),
                });
            }
            call.next.invoke(call.input).await
        })
        .build()
        .expect("valid shipped requireContext middleware")
});

/// The shipped timeout middleware; attach with `{"ms": <budget>}`
pub fn timeout() -> Arc<TaskMiddlewareDef> {
    TIMEOUT.clone()
}

/// The shipped context-require middleware; attach with `{"key": <name>}`
pub fn require_context() -> Arc<TaskMiddlewareDef> {
    REQUIRE_CONTEXT.clone()
}

/// Every shipped middleware, for boot auto-registration
pub(crate) fn shipped() -> Vec<Arc<TaskMiddlewareDef>> {
    vec![timeout(), require_context()]
}
