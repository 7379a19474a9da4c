//! Replay-safe durable context (v0.1)
//!
//! Passed into durable task bodies. Every operation is a step keyed by a
//! user-chosen id: the first execution runs and persists, replays return
//! the stored outcome without re-executing. Cancellation is checked at
//! every step boundary; `sleep` suspends by raising a control-flow error
//! the worker converts into a persisted timer.

use std::future::Future;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::{json, Value};

use super::model::{ExecutionStatus, StepRecord};
use super::store::DurableStore;
use super::DurableError;

/// Step ids starting with these prefixes are reserved for the engine
const RESERVED_PREFIXES: [&str; 2] = ["__", "rollback:"];

/// Effective poll interval when neither call nor engine configures one
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Boxed branch body, invoked at most once per execution
pub type BranchRun = Box<dyn FnOnce(Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send>;

/// One `switch` arm: matcher + body, evaluated in declaration order
pub struct SwitchBranch {
    pub id: String,
    matcher: Box<dyn Fn(&Value) -> bool + Send>,
    handler: BranchRun,
}

impl SwitchBranch {
    pub fn new<M, F, Fut>(id: impl Into<String>, matcher: M, handler: F) -> Self
    where
        M: Fn(&Value) -> bool + Send + 'static,
        F: FnOnce(Value) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            matcher: Box::new(matcher),
            handler: Box::new(move |value| handler(value).boxed()),
        }
    }
}

/// Build a `switch` default arm
pub fn switch_default<F, Fut>(handler: F) -> BranchRun
where
    F: FnOnce(Value) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Box::new(move |value| handler(value).boxed())
}

/// One concurrent arm for `race`/`all`
pub struct ConcurrentBranch {
    pub id: String,
    run: Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<Value>> + Send>,
}

impl ConcurrentBranch {
    pub fn new<F, Fut>(id: impl Into<String>, run: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self {
            id: id.into(),
            run: Box::new(move || run().boxed()),
        }
    }
}

// ============================================================================
// DURABLE CONTEXT
// ============================================================================

/// The context handed to durable task bodies
#[derive(Clone)]
pub struct DurableContext {
    execution_id: String,
    store: Arc<dyn DurableStore>,
    poll_interval_ms: u64,
}

impl DurableContext {
    /// Build a context over a store; the worker does this per message,
    /// custom workers may too.
    pub fn new(
        execution_id: impl Into<String>,
        store: Arc<dyn DurableStore>,
        poll_interval_ms: u64,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            store,
            poll_interval_ms,
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    fn validate_step_id(&self, step_id: &str) -> Result<(), DurableError> {
        for prefix in RESERVED_PREFIXES {
            if step_id.starts_with(prefix) {
                return Err(DurableError::StepIdReserved {
                    step: step_id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Cancellation check at every step boundary
    async fn check_cancelled(&self) -> Result<(), DurableError> {
        let execution = self.store.get_execution(&self.execution_id).await?;
        match execution {
            Some(e) if e.status == ExecutionStatus::Cancelled => {
                Err(DurableError::ExecutionCancelled {
                    execution_id: self.execution_id.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Return the stored outcome of a settled step, if any
    async fn settled(&self, step_id: &str) -> Result<Option<Value>, DurableError> {
        match self
            .store
            .get_step_result(&self.execution_id, step_id)
            .await?
        {
            Some(record) if record.is_settled() => match record.error {
                Some(message) => Err(DurableError::StepFailed {
                    step: step_id.to_string(),
                    message,
                }),
                None => Ok(Some(record.result.unwrap_or(Value::Null))),
            },
            _ => Ok(None),
        }
    }

    async fn persist(&self, step_id: &str, record: StepRecord) -> Result<(), DurableError> {
        self.store
            .save_step_result(&self.execution_id, step_id, record)
            .await
    }

    // ────────────────────────────────────────────────────────────────
    // Step operations
    // ────────────────────────────────────────────────────────────────

    /// Memoized step: the first call executes `f` and stores the outcome;
    /// replays return the stored value without invoking `f`.
    pub async fn run<F, Fut>(&self, step_id: &str, f: F) -> Result<Value, DurableError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Value>> + Send,
    {
        self.validate_step_id(step_id)?;
        self.check_cancelled().await?;

        if let Some(cached) = self.settled(step_id).await? {
            return Ok(cached);
        }

        match f().await {
            Ok(value) => {
                self.persist(step_id, StepRecord::ok(value.clone())).await?;
                Ok(value)
            }
            Err(err) => {
                self.persist(step_id, StepRecord::err(err.to_string())).await?;
                Err(DurableError::User(err))
            }
        }
    }

    /// Persist a wake-up time and suspend until the scheduler resumes the
    /// execution; on replay past the wake-up, the step completes.
    pub async fn sleep(&self, step_id: &str, ms: u64) -> Result<(), DurableError> {
        self.validate_step_id(step_id)?;
        self.check_cancelled().await?;

        let record = self
            .store
            .get_step_result(&self.execution_id, step_id)
            .await?;
        match record {
            Some(record) if record.is_settled() => Ok(()),
            Some(record) => {
                let wake_at = record.wake_at.unwrap_or_else(Utc::now);
                if Utc::now() >= wake_at {
                    self.store.clear_timer(&self.execution_id).await?;
                    self.persist(step_id, StepRecord::ok(Value::Null)).await?;
                    Ok(())
                } else {
                    Err(DurableError::Suspended {
                        execution_id: self.execution_id.clone(),
                        resume_at: wake_at,
                    })
                }
            }
            None => {
                let wake_at = Utc::now() + Duration::milliseconds(ms as i64);
                self.persist(step_id, StepRecord::sleeping(wake_at)).await?;
                self.store.save_timer(&self.execution_id, wake_at).await?;
                Err(DurableError::Suspended {
                    execution_id: self.execution_id.clone(),
                    resume_at: wake_at,
                })
            }
        }
    }

    /// Poll an external condition until it holds. The effective interval
    /// resolves call option → engine config → 500 ms.
    pub async fn wait<F, Fut>(
        &self,
        step_id: &str,
        mut predicate: F,
        poll_interval_ms: Option<u64>,
    ) -> Result<(), DurableError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<bool>> + Send,
    {
        self.validate_step_id(step_id)?;

        if self.settled(step_id).await?.is_some() {
            return Ok(());
        }

        let interval = poll_interval_ms.unwrap_or(self.poll_interval_ms);
        loop {
            self.check_cancelled().await?;
            if predicate().await.map_err(DurableError::User)? {
                self.persist(step_id, StepRecord::ok(Value::Null)).await?;
                return Ok(());
            }
            tokio::time::sleep(std::time::Duration::from_millis(interval)).await;
        }
    }

    /// Evaluate matchers in declaration order; record `{branchId, result}`
    /// at the step. Replays return the cached result without re-matching.
    pub async fn switch(
        &self,
        step_id: &str,
        value: Value,
        branches: Vec<SwitchBranch>,
        default: Option<BranchRun>,
    ) -> Result<Value, DurableError> {
        self.validate_step_id(step_id)?;
        self.check_cancelled().await?;

        if let Some(cached) = self.settled(step_id).await? {
            return Ok(cached
                .get("result")
                .cloned()
                .unwrap_or(Value::Null));
        }

        for branch in branches {
            if (branch.matcher)(&value) {
                return self.settle_branch(step_id, branch.id, branch.handler, value).await;
            }
        }

        match default {
            Some(handler) => {
                self.settle_branch(step_id, "default".to_string(), handler, value)
                    .await
            }
            None => Err(DurableError::SwitchNoMatch {
                step: step_id.to_string(),
                value,
            }),
        }
    }

    async fn settle_branch(
        &self,
        step_id: &str,
        branch_id: String,
        handler: BranchRun,
        value: Value,
    ) -> Result<Value, DurableError> {
        match handler(value).await {
            Ok(result) => {
                self.persist(
                    step_id,
                    StepRecord::ok(json!({"branchId": branch_id, "result": result})),
                )
                .await?;
                Ok(result)
            }
            Err(err) => {
                self.persist(step_id, StepRecord::err(err.to_string())).await?;
                Err(DurableError::User(err))
            }
        }
    }

    /// First branch to settle wins; each branch memoizes under
    /// `{step}:{branch}`, so replays resolve the same winner immediately.
    pub async fn race(
        &self,
        step_id: &str,
        branches: Vec<ConcurrentBranch>,
    ) -> Result<Value, DurableError> {
        self.validate_step_id(step_id)?;
        self.check_cancelled().await?;

        if let Some(cached) = self.settled(step_id).await? {
            return Ok(cached.get("result").cloned().unwrap_or(Value::Null));
        }

        let futures: Vec<BoxFuture<'_, (String, Result<Value, DurableError>)>> = branches
            .into_iter()
            .map(|branch| {
                let child = format!("{}:{}", step_id, branch.id);
                let id = branch.id;
                let run = branch.run;
                async move { (id, self.run(&child, run).await) }.boxed()
            })
            .collect();

        if futures.is_empty() {
            return Err(DurableError::SwitchNoMatch {
                step: step_id.to_string(),
                value: Value::Null,
            });
        }

        let ((branch_id, outcome), _, _) = futures::future::select_all(futures).await;
        let result = outcome?;
        self.persist(
            step_id,
            StepRecord::ok(json!({"branchId": branch_id, "result": result})),
        )
        .await?;
        Ok(result)
    }

    /// Run every branch concurrently; record the ordered results array
    pub async fn all(
        &self,
        step_id: &str,
        branches: Vec<ConcurrentBranch>,
    ) -> Result<Value, DurableError> {
        self.validate_step_id(step_id)?;
        self.check_cancelled().await?;

        if let Some(cached) = self.settled(step_id).await? {
            return Ok(cached);
        }

        let futures: Vec<BoxFuture<'_, (String, Result<Value, DurableError>)>> = branches
            .into_iter()
            .map(|branch| {
                let child = format!("{}:{}", step_id, branch.id);
                let id = branch.id;
                let run = branch.run;
                async move { (id, self.run(&child, run).await) }.boxed()
            })
            .collect();

        let settled = futures::future::join_all(futures).await;
        let mut results = Vec::with_capacity(settled.len());
        for (branch_id, outcome) in settled {
            results.push(json!({"branchId": branch_id, "result": outcome?}));
        }

        let value = Value::Array(results);
        self.persist(step_id, StepRecord::ok(value.clone())).await?;
        Ok(value)
    }
}

impl std::fmt::Debug for DurableContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableContext")
            .field("execution_id", &self.execution_id)
            .finish()
    }
}
