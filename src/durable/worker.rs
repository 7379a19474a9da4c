//! Queue consumer (v0.1)
//!
//! Drains the durable queue: validates message shapes (unknown shapes are
//! acked and dropped), dispatches executions, and converts outcomes into
//! ack/nack so the queue's attempt budget drives redelivery. Suspensions
//! and cancellations are terminal for the message, not the execution.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::bus::{BusEvent, BusEventKind, EventBus};
use super::context::DurableContext;
use super::model::{Execution, ExecutionStatus, MessageType, QueueMessage};
use super::queue::DurableQueue;
use super::scheduler;
use super::store::DurableStore;
use super::{DurableError, DurableTaskFn, EngineConfig};

/// One message-processing loop over the durable queue
pub struct DurableWorker {
    store: Arc<dyn DurableStore>,
    queue: Arc<dyn DurableQueue>,
    bus: Arc<dyn EventBus>,
    registry: Arc<DashMap<String, DurableTaskFn>>,
    config: EngineConfig,
}

impl DurableWorker {
    pub(crate) fn new(
        store: Arc<dyn DurableStore>,
        queue: Arc<dyn DurableQueue>,
        bus: Arc<dyn EventBus>,
        registry: Arc<DashMap<String, DurableTaskFn>>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            queue,
            bus,
            registry,
            config,
        }
    }

    /// Consume until shutdown flips
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                message = self.queue.next() => match message {
                    Ok(message) => self.handle(message).await,
                    Err(err) => {
                        warn!(error = %err, "durable queue closed, worker stopping");
                        break;
                    }
                }
            }
        }
    }

    /// Ack on success, nack(requeue) on processing errors
    pub async fn handle(&self, message: QueueMessage) {
        match self.process(&message).await {
            Ok(()) => {
                if let Err(err) = self.queue.ack(&message.id).await {
                    warn!(message = %message.id, error = %err, "ack failed");
                }
            }
            Err(err) => {
                warn!(message = %message.id, error = %err, "message processing failed");
                if let Err(nack_err) = self.queue.nack(&message.id, true).await {
                    warn!(message = %message.id, error = %nack_err, "nack failed");
                }
            }
        }
    }

    async fn process(&self, message: &QueueMessage) -> Result<(), DurableError> {
        match message.message_type {
            MessageType::Execute | MessageType::Resume => {
                let Some(execution_id) = message.execution_id() else {
                    warn!(message = %message.id, "payload has no executionId, dropping");
                    return Ok(());
                };
                self.process_execution(execution_id).await
            }
            MessageType::Schedule => {
                let Some(schedule_id) = message.schedule_id() else {
                    warn!(message = %message.id, "payload has no scheduleId, dropping");
                    return Ok(());
                };
                match self.store.get_schedule(schedule_id).await? {
                    Some(schedule) => {
                        scheduler::fire_schedule(&self.store, &self.queue, &self.config, schedule)
                            .await
                    }
                    None => Ok(()),
                }
            }
        }
    }

    async fn process_execution(&self, execution_id: &str) -> Result<(), DurableError> {
        let Some(execution) = self.store.get_execution(execution_id).await? else {
            warn!(execution = %execution_id, "unknown execution, dropping");
            return Ok(());
        };

        // Duplicate messages for a settled execution are no-ops.
        if execution.status.is_terminal() {
            debug!(execution = %execution_id, status = ?execution.status,
                   "duplicate message for settled execution");
            return Ok(());
        }

        let Some(task) = self
            .registry
            .get(&execution.task_id)
            .map(|t| t.clone())
        else {
            let message = format!("no durable task registered under '{}'", execution.task_id);
            self.store
                .set_result(execution_id, Err(message.clone()))
                .await?;
            self.publish(BusEventKind::ExecutionFailed, execution_id, json!({"error": message}))
                .await;
            return Ok(());
        };

        self.store
            .set_status(execution_id, ExecutionStatus::Running)
            .await?;
        let context = DurableContext::new(
            execution_id,
            self.store.clone(),
            self.config.poll_interval_ms,
        );

        match task(execution.input.clone(), context).await {
            Ok(result) => {
                self.store
                    .set_result(execution_id, Ok(result.clone()))
                    .await?;
                self.publish(
                    BusEventKind::ExecutionCompleted,
                    execution_id,
                    json!({"result": result}),
                )
                .await;
                Ok(())
            }
            Err(err) => self.handle_failure(execution, err).await,
        }
    }

    async fn handle_failure(
        &self,
        execution: Execution,
        err: anyhow::Error,
    ) -> Result<(), DurableError> {
        match err.downcast::<DurableError>() {
            Ok(DurableError::Suspended { resume_at, .. }) => {
                // Timer already persisted by the context; the scheduler
                // resumes the execution when it comes due.
                self.store
                    .set_status(&execution.id, ExecutionStatus::Pending)
                    .await?;
                self.publish(
                    BusEventKind::ExecutionSuspended,
                    &execution.id,
                    json!({"resumeAt": resume_at.to_rfc3339()}),
                )
                .await;
                Ok(())
            }
            Ok(DurableError::ExecutionCancelled { .. }) => {
                self.store
                    .set_status(&execution.id, ExecutionStatus::Cancelled)
                    .await?;
                self.publish(BusEventKind::ExecutionCancelled, &execution.id, json!(null))
                    .await;
                Ok(())
            }
            Ok(other) => self.retry_or_fail(execution, other.to_string()).await,
            Err(user) => self.retry_or_fail(execution, user.to_string()).await,
        }
    }

    /// Within the attempt budget, fail the message (nack → redelivery);
    /// beyond it, settle the execution as failed.
    async fn retry_or_fail(
        &self,
        execution: Execution,
        message: String,
    ) -> Result<(), DurableError> {
        let attempt = self.store.increment_attempt(&execution.id).await?;
        if attempt < execution.max_attempts {
            debug!(execution = %execution.id, attempt, "retrying via redelivery");
            // Back to pending so the redelivered message runs it again.
            self.store
                .set_status(&execution.id, ExecutionStatus::Pending)
                .await?;
            Err(DurableError::User(anyhow::anyhow!(message)))
        } else {
            self.store
                .set_result(&execution.id, Err(message.clone()))
                .await?;
            self.publish(
                BusEventKind::ExecutionFailed,
                &execution.id,
                json!({"error": message}),
            )
            .await;
            Ok(())
        }
    }

    async fn publish(&self, kind: BusEventKind, execution_id: &str, payload: serde_json::Value) {
        if let Err(err) = self
            .bus
            .publish(BusEvent::new(kind, execution_id, payload))
            .await
        {
            warn!(execution = %execution_id, error = %err, "bus publish failed");
        }
    }
}
