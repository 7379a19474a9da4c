//! Schedules and timers (v0.1)
//!
//! Periodic tick: fire due schedules (cron or interval) and enqueue
//! resume messages for suspended executions whose wake-up passed. Each
//! schedule slot produces a fingerprinted execution id, so a duplicate
//! fire is a store-level no-op.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, warn};

use super::cron::CronExpr;
use super::model::{Execution, QueueMessage, Schedule, ScheduleKind};
use super::queue::DurableQueue;
use super::store::DurableStore;
use super::{DurableError, EngineConfig};

/// Periodic driver for schedules and sleep timers
pub struct DurableScheduler {
    store: Arc<dyn DurableStore>,
    queue: Arc<dyn DurableQueue>,
    config: EngineConfig,
}

impl DurableScheduler {
    pub(crate) fn new(
        store: Arc<dyn DurableStore>,
        queue: Arc<dyn DurableQueue>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            config,
        }
    }

    /// Tick until shutdown flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(std::time::Duration::from_millis(self.config.tick_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        warn!(error = %err, "scheduler tick failed");
                    }
                }
            }
        }
    }

    /// One pass over due schedules and due timers
    pub async fn tick(&self) -> Result<(), DurableError> {
        let now = Utc::now();

        for schedule in self.store.list_pending_schedules(now).await? {
            fire_schedule(&self.store, &self.queue, &self.config, schedule).await?;
        }

        for execution_id in self.store.list_due_timers(now).await? {
            debug!(execution = %execution_id, "timer due, enqueueing resume");
            self.queue
                .enqueue(QueueMessage::resume(
                    &execution_id,
                    self.config.default_max_attempts,
                ))
                .await?;
            self.store.clear_timer(&execution_id).await?;
        }

        Ok(())
    }
}

/// Fire one schedule slot: create the fingerprinted execution (no-op when
/// the slot already fired), enqueue it, and advance `next_run_at`.
pub(crate) async fn fire_schedule(
    store: &Arc<dyn DurableStore>,
    queue: &Arc<dyn DurableQueue>,
    config: &EngineConfig,
    mut schedule: Schedule,
) -> Result<(), DurableError> {
    let fingerprint = format!("{}:{}", schedule.id, schedule.next_run_at.timestamp_millis());
    let execution = Execution::new(
        &fingerprint,
        &schedule.task_id,
        schedule.input.clone(),
        config.default_max_attempts,
    );
    if store.create_execution(execution).await? {
        debug!(schedule = %schedule.id, execution = %fingerprint, "schedule fired");
        queue
            .enqueue(QueueMessage::execute(
                &fingerprint,
                config.default_max_attempts,
            ))
            .await?;
    }

    match compute_next(&schedule, Utc::now()) {
        Ok(next) => schedule.next_run_at = next,
        Err(err) => {
            warn!(schedule = %schedule.id, error = %err, "schedule disabled");
            schedule.enabled = false;
        }
    }
    store.save_schedule(schedule).await
}

/// Next fire time for a schedule, from `from`
pub(crate) fn compute_next(
    schedule: &Schedule,
    from: DateTime<Utc>,
) -> Result<DateTime<Utc>, DurableError> {
    match schedule.kind {
        ScheduleKind::Cron => CronExpr::parse(&schedule.expr)?.next_after(from),
        ScheduleKind::Interval => {
            let ms = schedule
                .interval_ms()
                .ok_or_else(|| DurableError::ScheduleConfig {
                    expr: schedule.expr.clone(),
                    reason: "interval is not a millisecond count".into(),
                })?;
            Ok(from + Duration::milliseconds(ms as i64))
        }
    }
}
