//! Task invocation pipeline (v0.1)
//!
//! Composes `interceptors ∘ middleware ∘ run` around the user function:
//!
//! 1. ambient context propagates task-locally
//! 2. input schema validation (failure → onError, suppressible)
//! 3. interceptors, registration order, outer to inner
//! 4. middleware, authored order, outer to inner (`m1.before, m2.before,
//!    run, m2.after, m1.after`)
//! 5. the user function
//! 6. result schema validation (same error path as input)
//! 7. `afterRun` observability when a listener is present

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{ValidationTarget, WeftError};
use crate::events::{EventEnvelope, EventManager};
use crate::kernel::Kernel;
use crate::types::UnitId;
use crate::unit::{BoxFut, MiddlewareAttachment, Next, TaskCall, TaskDef};

/// Runs tasks through the full per-call pipeline
pub struct TaskRunner {
    kernel: Arc<Kernel>,
}

impl TaskRunner {
    pub(crate) fn new(kernel: Arc<Kernel>) -> Self {
        Self { kernel }
    }

    /// Run a task by id through interceptors, middleware and validation
    pub fn run(&self, task_id: &UnitId, input: Value) -> BoxFut<Result<Value, WeftError>> {
        let kernel = self.kernel.clone();
        let task_id = task_id.clone();
        Box::pin(async move { run_inner(kernel, task_id, input).await })
    }
}

async fn run_inner(
    kernel: Arc<Kernel>,
    task_id: UnitId,
    input: Value,
) -> Result<Value, WeftError> {
    kernel.ensure_live()?;
    let task = kernel.store.task(&task_id)?;
    debug!(task = %task_id, "running task");

    // 2. input validation
    if let Some(schema) = &task.input_schema {
        if let Err(err) = schema.check_for(&input, ValidationTarget::TaskInput, &task.id) {
            return fail(&kernel, &task, err).await;
        }
    }

    // 3–5. interceptors wrap middleware wrap the user function
    let chain_result = compose_chain(&kernel, &task)?.invoke(input).await;

    match chain_result {
        Ok(result) => {
            // 6. result validation
            if let Some(schema) = &task.result_schema {
                if let Err(err) =
                    schema.check_for(&result, ValidationTarget::TaskResult, &task.id)
                {
                    return fail(&kernel, &task, err).await;
                }
            }

            // 7. afterRun, only when someone listens
            let after_id = task.after_run_id();
            if let Ok(def) = kernel.store.event(&after_id) {
                if kernel.subscriptions.reaches(&def) {
                    EventManager::new(kernel.clone())
                        .emit(&after_id, json!({"taskId": task.id, "result": result}))
                        .await?;
                }
            }

            Ok(result)
        }
        Err(err) => fail(&kernel, &task, err).await,
    }
}

/// Build the `interceptors ∘ middleware ∘ run` continuation chain.
///
/// Attachments wrap innermost-last, so iterating them in reverse keeps
/// the authored order outermost-first.
fn compose_chain(kernel: &Arc<Kernel>, task: &Arc<TaskDef>) -> Result<Next, WeftError> {
    let deps = kernel.deps_for(&task.id);
    let run = task.run.clone();
    let mut next = Next::new(move |input| {
        let fut = run(input, deps);
        Box::pin(async move { fut.await.map_err(WeftError::from_any) })
    });

    let attachments: Arc<Vec<MiddlewareAttachment>> = kernel
        .task_middleware
        .get(&task.id)
        .map(|a| a.clone())
        .unwrap_or_else(|| Arc::new(task.middleware.clone()));

    for attachment in attachments.iter().rev() {
        let mw = kernel.store.task_middleware(&attachment.id)?;
        let mw_deps = kernel.deps_for(&mw.id);
        let config = attachment.config.clone();
        let run = mw.run.clone();
        let tid = task.id.clone();
        let prev = next;
        next = Next::new(move |input| {
            let call = TaskCall {
                task_id: tid,
                input,
                next: prev,
            };
            run(call, mw_deps, config)
        });
    }

    let interceptors = kernel
        .task_interceptors
        .get(&task.id)
        .map(|v| v.clone())
        .unwrap_or_default();
    for interceptor in interceptors.into_iter().rev() {
        let prev = next;
        next = Next::new(move |input| interceptor(prev, input));
    }

    Ok(next)
}

/// Error path: fire the task's onError companion event; a handler calling
/// `suppress()` converts the rejection into a null resolution.
async fn fail(
    kernel: &Arc<Kernel>,
    task: &Arc<TaskDef>,
    err: WeftError,
) -> Result<Value, WeftError> {
    let on_error = task.on_error_id();
    if kernel.store.event(&on_error).is_ok() {
        let envelope = EventEnvelope::new(
            on_error,
            json!({
                "taskId": task.id,
                "kind": err.kind(),
                "message": err.to_string(),
            }),
        );
        if let Err(hook_err) = EventManager::new(kernel.clone())
            .emit_prepared(envelope.clone())
            .await
        {
            // The original failure stays primary; the handler failure is
            // already reported through hookCompleted.
            warn!(task = %task.id, error = %hook_err, "onError handler failed");
        }
        if envelope.is_suppressed() {
            debug!(task = %task.id, "error suppressed by onError handler");
            return Ok(Value::Null);
        }
    }
    Err(err)
}
