//! Execution store seam (v0.1)
//!
//! `DurableStore` is one of the three injection seams of the engine. The
//! in-memory reference implementation backs tests and single-process use;
//! persistent backends implement the same trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use super::model::{Execution, ExecutionStatus, Schedule, StepRecord};
use super::DurableError;

/// Persistent state for executions, step results, schedules and timers
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert a new execution; returns `false` when the fingerprint id
    /// already exists (at-most-once enforcement).
    async fn create_execution(&self, execution: Execution) -> Result<bool, DurableError>;

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, DurableError>;

    async fn set_status(&self, id: &str, status: ExecutionStatus) -> Result<(), DurableError>;

    /// Record the terminal outcome: `Ok` → completed, `Err` → failed
    async fn set_result(&self, id: &str, outcome: Result<Value, String>)
        -> Result<(), DurableError>;

    /// Bump and return the attempt counter
    async fn increment_attempt(&self, id: &str) -> Result<u32, DurableError>;

    async fn save_step_result(
        &self,
        execution_id: &str,
        step_id: &str,
        record: StepRecord,
    ) -> Result<(), DurableError>;

    async fn get_step_result(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> Result<Option<StepRecord>, DurableError>;

    async fn save_schedule(&self, schedule: Schedule) -> Result<(), DurableError>;

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>, DurableError>;

    /// Enabled schedules whose `next_run_at` is due
    async fn list_pending_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Schedule>, DurableError>;

    /// Persist a wake-up for a suspended execution
    async fn save_timer(
        &self,
        execution_id: &str,
        wake_at: DateTime<Utc>,
    ) -> Result<(), DurableError>;

    /// Executions whose wake-up time has passed
    async fn list_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<String>, DurableError>;

    async fn clear_timer(&self, execution_id: &str) -> Result<(), DurableError>;
}

// ============================================================================
// IN-MEMORY IMPLEMENTATION
// ============================================================================

/// Reference store: DashMap-backed, single process
#[derive(Debug, Default)]
pub struct InMemoryDurableStore {
    executions: DashMap<String, Execution>,
    steps: DashMap<(String, String), StepRecord>,
    schedules: DashMap<String, Schedule>,
    timers: DashMap<String, DateTime<Utc>>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn touch(execution: &mut Execution) {
        execution.updated_at = Utc::now();
    }

    fn missing(id: &str) -> DurableError {
        DurableError::ExecutionNotFound {
            execution_id: id.to_string(),
        }
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn create_execution(&self, execution: Execution) -> Result<bool, DurableError> {
        match self.executions.entry(execution.id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(execution);
                Ok(true)
            }
        }
    }

    async fn get_execution(&self, id: &str) -> Result<Option<Execution>, DurableError> {
        Ok(self.executions.get(id).map(|e| e.clone()))
    }

    async fn set_status(&self, id: &str, status: ExecutionStatus) -> Result<(), DurableError> {
        let mut execution = self.executions.get_mut(id).ok_or_else(|| Self::missing(id))?;
        execution.status = status;
        Self::touch(&mut execution);
        Ok(())
    }

    async fn set_result(
        &self,
        id: &str,
        outcome: Result<Value, String>,
    ) -> Result<(), DurableError> {
        let mut execution = self.executions.get_mut(id).ok_or_else(|| Self::missing(id))?;
        match outcome {
            Ok(value) => {
                execution.status = ExecutionStatus::Completed;
                execution.result = Some(value);
                execution.error = None;
            }
            Err(message) => {
                execution.status = ExecutionStatus::Failed;
                execution.error = Some(message);
            }
        }
        Self::touch(&mut execution);
        Ok(())
    }

    async fn increment_attempt(&self, id: &str) -> Result<u32, DurableError> {
        let mut execution = self.executions.get_mut(id).ok_or_else(|| Self::missing(id))?;
        execution.attempt += 1;
        Self::touch(&mut execution);
        Ok(execution.attempt)
    }

    async fn save_step_result(
        &self,
        execution_id: &str,
        step_id: &str,
        record: StepRecord,
    ) -> Result<(), DurableError> {
        self.steps
            .insert((execution_id.to_string(), step_id.to_string()), record);
        Ok(())
    }

    async fn get_step_result(
        &self,
        execution_id: &str,
        step_id: &str,
    ) -> Result<Option<StepRecord>, DurableError> {
        Ok(self
            .steps
            .get(&(execution_id.to_string(), step_id.to_string()))
            .map(|r| r.clone()))
    }

    async fn save_schedule(&self, schedule: Schedule) -> Result<(), DurableError> {
        self.schedules.insert(schedule.id.clone(), schedule);
        Ok(())
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<Schedule>, DurableError> {
        Ok(self.schedules.get(id).map(|s| s.clone()))
    }

    async fn list_pending_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Schedule>, DurableError> {
        let mut due: Vec<Schedule> = self
            .schedules
            .iter()
            .filter(|s| s.enabled && s.next_run_at <= now)
            .map(|s| s.clone())
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        Ok(due)
    }

    async fn save_timer(
        &self,
        execution_id: &str,
        wake_at: DateTime<Utc>,
    ) -> Result<(), DurableError> {
        self.timers.insert(execution_id.to_string(), wake_at);
        Ok(())
    }

    async fn list_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<String>, DurableError> {
        Ok(self
            .timers
            .iter()
            .filter(|t| *t.value() <= now)
            .map(|t| t.key().clone())
            .collect())
    }

    async fn clear_timer(&self, execution_id: &str) -> Result<(), DurableError> {
        self.timers.remove(execution_id);
        Ok(())
    }
}
