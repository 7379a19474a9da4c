//! Durable execution engine (v0.1)
//!
//! Replay-safe workflow execution over three injection seams - store,
//! queue, event bus - with a worker that consumes executions, a scheduler
//! for cron/interval triggers and sleep timers, and a [`DurableContext`]
//! giving task bodies memoized steps, waits, switches and races.
//!
//! Backends are named: `"memory"` ships in-process reference
//! implementations; anything else must be registered first or surfaces
//! `optionalDependency.missing`.

pub mod bus;
pub mod context;
pub mod cron;
pub mod model;
pub mod queue;
pub mod scheduler;
pub mod store;
pub mod worker;

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{FixHint, WeftError};

pub use bus::{BusEvent, BusEventKind, EventBus, InMemoryEventBus};
pub use context::{
    switch_default, BranchRun, ConcurrentBranch, DurableContext, SwitchBranch,
    DEFAULT_POLL_INTERVAL_MS,
};
pub use cron::CronExpr;
pub use model::{
    Execution, ExecutionStatus, MessageType, QueueMessage, Schedule, ScheduleKind, StepRecord,
};
pub use queue::{DurableQueue, InMemoryDurableQueue};
pub use scheduler::DurableScheduler;
pub use store::{DurableStore, InMemoryDurableStore};
pub use worker::DurableWorker;

// ============================================================================
// ERRORS
// ============================================================================

/// Durable engine errors; `kind()` yields stable dotted codes
#[derive(Debug, Error)]
pub enum DurableError {
    #[error("[execution.cancelled] execution '{execution_id}' was cancelled")]
    ExecutionCancelled { execution_id: String },

    /// Control flow: the execution suspended and resumes at `resume_at`
    #[error("[execution.suspended] execution '{execution_id}' suspended until {resume_at}")]
    Suspended {
        execution_id: String,
        resume_at: DateTime<Utc>,
    },

    #[error("[execution.notFound] no execution '{execution_id}'")]
    ExecutionNotFound { execution_id: String },

    #[error("[execution.waitTimeout] timed out waiting for execution '{execution_id}'")]
    WaitTimeout { execution_id: String },

    #[error("[step.reserved] step id '{step}' uses a reserved prefix")]
    StepIdReserved { step: String },

    /// A replayed step had a stored error
    #[error("[step.failed] step '{step}': {message}")]
    StepFailed { step: String, message: String },

    #[error("[switch.noMatch] step '{step}': no branch matched {value}")]
    SwitchNoMatch { step: String, value: Value },

    #[error("[schedule.config] invalid schedule '{expr}': {reason}")]
    ScheduleConfig { expr: String, reason: String },

    #[error("[schedule.noMatch] schedule expression is unsatisfiable: {expr}")]
    ScheduleNoMatch { expr: String },

    #[error("[durable.store] {message}")]
    Store { message: String },

    #[error("[durable.queue] {message}")]
    Queue { message: String },

    #[error("[durable.bus] {message}")]
    Bus { message: String },

    /// Error raised by a durable task body or step function
    #[error("{0}")]
    User(#[from] anyhow::Error),
}

impl DurableError {
    pub fn kind(&self) -> &'static str {
        match self {
            DurableError::ExecutionCancelled { .. } => "execution.cancelled",
            DurableError::Suspended { .. } => "execution.suspended",
            DurableError::ExecutionNotFound { .. } => "execution.notFound",
            DurableError::WaitTimeout { .. } => "execution.waitTimeout",
            DurableError::StepIdReserved { .. } => "step.reserved",
            DurableError::StepFailed { .. } => "step.failed",
            DurableError::SwitchNoMatch { .. } => "switch.noMatch",
            DurableError::ScheduleConfig { .. } => "schedule.config",
            DurableError::ScheduleNoMatch { .. } => "schedule.noMatch",
            DurableError::Store { .. } => "durable.store",
            DurableError::Queue { .. } => "durable.queue",
            DurableError::Bus { .. } => "durable.bus",
            DurableError::User(_) => "user",
        }
    }
}

impl FixHint for DurableError {
    fn hint(&self) -> Option<&str> {
        Some(match self {
            DurableError::ExecutionCancelled { .. } => {
                "Cancellation is cooperative; nothing to fix unless it was unintended"
            }
            DurableError::Suspended { .. } => {
                "Internal control flow; seeing this outside the worker means a task body \
                 swallowed and re-raised it"
            }
            DurableError::ExecutionNotFound { .. } => {
                "Check the execution id; executions exist once `execute` was called"
            }
            DurableError::WaitTimeout { .. } => {
                "Raise the wait timeout, or check that a worker is running"
            }
            DurableError::StepIdReserved { .. } => {
                "Pick a step id that does not start with '__' or 'rollback:'"
            }
            DurableError::StepFailed { .. } => {
                "The step failed on a previous attempt; its error is replayed deterministically"
            }
            DurableError::SwitchNoMatch { .. } => {
                "Add a default branch, or a matcher covering this value"
            }
            DurableError::ScheduleConfig { .. } => {
                "Use 5 fields: minute hour day-of-month month day-of-week; `*`, `*/n` or a value"
            }
            DurableError::ScheduleNoMatch { .. } => {
                "The expression never fires (e.g. Feb 31); fix the day/month combination"
            }
            DurableError::Store { .. } | DurableError::Queue { .. } | DurableError::Bus { .. } => {
                "Check the backing service for the durable collaborator"
            }
            DurableError::User(_) => return None,
        })
    }
}

// ============================================================================
// CONFIG AND TASK REGISTRY
// ============================================================================

/// A registered durable task body
pub type DurableTaskFn =
    Arc<dyn Fn(Value, DurableContext) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Default `wait` poll interval (call option wins)
    pub poll_interval_ms: u64,
    /// Scheduler tick period
    pub tick_interval_ms: u64,
    /// Attempt budget for executions and queue messages
    pub default_max_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            tick_interval_ms: 250,
            default_max_attempts: 3,
        }
    }
}

/// Per-call options for [`DurableEngine::execute`]
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Fingerprint id: reusing one makes the execution at-most-once
    pub execution_id: Option<String>,
    pub max_attempts: Option<u32>,
}

// ============================================================================
// BACKENDS
// ============================================================================

/// The three collaborator seams, bundled
#[derive(Clone)]
pub struct DurableBackend {
    pub store: Arc<dyn DurableStore>,
    pub queue: Arc<dyn DurableQueue>,
    pub bus: Arc<dyn EventBus>,
}

impl std::fmt::Debug for DurableBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableBackend").finish_non_exhaustive()
    }
}

impl DurableBackend {
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryDurableStore::new()),
            queue: Arc::new(InMemoryDurableQueue::new()),
            bus: Arc::new(InMemoryEventBus::new()),
        }
    }
}

type BackendFactory = Arc<dyn Fn() -> Result<DurableBackend, String> + Send + Sync>;

static BACKENDS: Lazy<DashMap<String, BackendFactory>> = Lazy::new(|| {
    let map: DashMap<String, BackendFactory> = DashMap::new();
    map.insert(
        "memory".to_string(),
        Arc::new(|| Ok(DurableBackend::in_memory())) as BackendFactory,
    );
    map
});

/// Register a named backend (collaborator crates call this)
pub fn register_backend(
    name: impl Into<String>,
    factory: impl Fn() -> Result<DurableBackend, String> + Send + Sync + 'static,
) {
    BACKENDS.insert(name.into(), Arc::new(factory));
}

/// Construct a named backend. Unknown names surface
/// `optionalDependency.missing`; a factory that fails surfaces
/// `optionalDependency.invalidExport`.
pub fn create_backend(name: &str) -> Result<DurableBackend, WeftError> {
    let Some(factory) = BACKENDS.get(name).map(|f| f.clone()) else {
        return Err(WeftError::OptionalDependencyMissing {
            package: name.to_string(),
        });
    };
    factory().map_err(|reason| WeftError::OptionalDependencyInvalidExport {
        package: name.to_string(),
        reason,
    })
}

// ============================================================================
// ENGINE FACADE
// ============================================================================

/// Wires store + queue + bus + registry into a running engine
pub struct DurableEngine {
    backend: DurableBackend,
    registry: Arc<DashMap<String, DurableTaskFn>>,
    config: EngineConfig,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl DurableEngine {
    pub fn new(backend: DurableBackend, config: EngineConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            backend,
            registry: Arc::new(DashMap::new()),
            config,
            shutdown,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(DurableBackend::in_memory(), config)
    }

    /// Construct from a named backend (`"memory"` built in)
    pub fn from_backend(name: &str, config: EngineConfig) -> Result<Self, WeftError> {
        Ok(Self::new(create_backend(name)?, config))
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.backend.store
    }

    pub fn queue(&self) -> &Arc<dyn DurableQueue> {
        &self.backend.queue
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.backend.bus
    }

    /// Register a durable task body under its id
    pub fn register_task<F, Fut>(&self, task_id: impl Into<String>, f: F)
    where
        F: Fn(Value, DurableContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.registry.insert(
            task_id.into(),
            Arc::new(move |input, ctx| f(input, ctx).boxed()),
        );
    }

    /// Spawn the worker and scheduler loops
    pub fn start(&self) {
        let worker = Arc::new(DurableWorker::new(
            self.backend.store.clone(),
            self.backend.queue.clone(),
            self.backend.bus.clone(),
            self.registry.clone(),
            self.config.clone(),
        ));
        let scheduler = Arc::new(DurableScheduler::new(
            self.backend.store.clone(),
            self.backend.queue.clone(),
            self.config.clone(),
        ));

        let mut handles = self.handles.lock();
        handles.push(tokio::spawn(worker.run(self.shutdown.subscribe())));
        handles.push(tokio::spawn(scheduler.run(self.shutdown.subscribe())));
    }

    /// Stop the loops and wait for them to drain
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Enqueue a durable execution. A reused fingerprint id makes the
    /// call at-most-once: the duplicate is detected and not re-enqueued.
    pub async fn execute(
        &self,
        task_id: impl Into<String>,
        input: Value,
        options: ExecuteOptions,
    ) -> Result<String, DurableError> {
        let id = options
            .execution_id
            .unwrap_or_else(|| model::unique_id("exec"));
        let max_attempts = options
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);

        let created = self
            .backend
            .store
            .create_execution(Execution::new(&id, task_id, input, max_attempts))
            .await?;
        if created {
            self.backend
                .queue
                .enqueue(QueueMessage::execute(&id, max_attempts))
                .await?;
        }
        Ok(id)
    }

    /// Wait for an execution to settle, observing the bus
    pub async fn wait_for(
        &self,
        execution_id: &str,
        timeout: Option<std::time::Duration>,
    ) -> Result<Execution, DurableError> {
        let mut rx = self.backend.bus.subscribe();

        // The execution may have settled before we subscribed.
        if let Some(execution) = self.backend.store.get_execution(execution_id).await? {
            if execution.status.is_terminal() {
                return Ok(execution);
            }
        }

        let store = self.backend.store.clone();
        let id = execution_id.to_string();
        let wait = async move {
            loop {
                match rx.recv().await {
                    Ok(event) if event.execution_id == id => {
                        if matches!(
                            event.kind,
                            BusEventKind::ExecutionCompleted
                                | BusEventKind::ExecutionFailed
                                | BusEventKind::ExecutionCancelled
                        ) {
                            return store.get_execution(&id).await?.ok_or(
                                DurableError::ExecutionNotFound { execution_id: id },
                            );
                        }
                    }
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                        if let Some(execution) = store.get_execution(&id).await? {
                            if execution.status.is_terminal() {
                                return Ok(execution);
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        return Err(DurableError::Bus {
                            message: "event bus closed".into(),
                        })
                    }
                }
            }
        };

        match timeout {
            None => wait.await,
            Some(limit) => tokio::time::timeout(limit, wait).await.map_err(|_| {
                DurableError::WaitTimeout {
                    execution_id: execution_id.to_string(),
                }
            })?,
        }
    }

    /// Cooperative cancellation: the context aborts at its next step
    /// boundary.
    pub async fn cancel(&self, execution_id: &str) -> Result<(), DurableError> {
        self.backend
            .store
            .set_status(execution_id, ExecutionStatus::Cancelled)
            .await?;
        self.backend
            .bus
            .publish(BusEvent::new(
                BusEventKind::ExecutionCancelled,
                execution_id,
                Value::Null,
            ))
            .await
    }

    /// Register a cron schedule; the first fire time comes from the
    /// expression itself.
    pub async fn schedule_cron(
        &self,
        id: impl Into<String>,
        expr: &str,
        task_id: impl Into<String>,
        input: Value,
    ) -> Result<Schedule, DurableError> {
        let first = CronExpr::parse(expr)?.next_after(Utc::now())?;
        let schedule = Schedule::cron(id, expr, task_id, input, first);
        self.backend.store.save_schedule(schedule.clone()).await?;
        Ok(schedule)
    }

    /// Register an interval schedule, first firing one interval from now
    pub async fn schedule_interval(
        &self,
        id: impl Into<String>,
        interval_ms: u64,
        task_id: impl Into<String>,
        input: Value,
    ) -> Result<Schedule, DurableError> {
        let first = Utc::now() + chrono::Duration::milliseconds(interval_ms as i64);
        let schedule = Schedule::interval(id, interval_ms, task_id, input, first);
        self.backend.store.save_schedule(schedule.clone()).await?;
        Ok(schedule)
    }
}

impl std::fmt::Debug for DurableEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableEngine")
            .field("tasks", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_is_built_in() {
        assert!(create_backend("memory").is_ok());
    }

    #[test]
    fn unknown_backend_is_optional_dependency_missing() {
        let err = create_backend("redis").unwrap_err();
        assert_eq!(err.kind(), "optionalDependency.missing");
    }

    #[test]
    fn broken_factory_is_invalid_export() {
        register_backend("broken", || Err("factory exploded".into()));
        let err = create_backend("broken").unwrap_err();
        assert_eq!(err.kind(), "optionalDependency.invalidExport");
    }

    #[tokio::test]
    async fn duplicate_fingerprint_execute_is_noop() {
        let engine = DurableEngine::in_memory(EngineConfig::default());
        let options = ExecuteOptions {
            execution_id: Some("fp".into()),
            ..Default::default()
        };

        let first = engine
            .execute("t", Value::Null, options.clone())
            .await
            .unwrap();
        let second = engine.execute("t", Value::Null, options).await.unwrap();
        assert_eq!(first, second);

        // Exactly one message was enqueued for the fingerprint.
        engine.queue().next().await.unwrap();
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), engine.queue().next())
                .await
                .is_err()
        );
    }
}
