//! Persisted durable records (v0.1)
//!
//! Executions, memoized step records, schedules, queue messages. All
//! serde-serializable so any store/queue backend can persist them as-is.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique id with a readable prefix (`exec-…`, `msg-…`)
pub fn unique_id(prefix: &str) -> String {
    let n = ID_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}-{}", prefix, Utc::now().timestamp_millis(), n)
}

// ============================================================================
// EXECUTIONS
// ============================================================================

/// Lifecycle of a durable invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    /// Terminal states are never left again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// A durable invocation of a task with persistent state
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub id: String,
    pub task_id: String,
    pub input: Value,
    pub status: ExecutionStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(
        id: impl Into<String>,
        task_id: impl Into<String>,
        input: Value,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            task_id: task_id.into(),
            input,
            status: ExecutionStatus::Pending,
            attempt: 0,
            max_attempts,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ============================================================================
// STEP RECORDS
// ============================================================================

/// Memoized outcome of one step, keyed by `(execution_id, step_id)`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Sleep bookkeeping: when the step may complete
    pub wake_at: Option<DateTime<Utc>>,
}

impl StepRecord {
    pub fn ok(result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::default()
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn sleeping(wake_at: DateTime<Utc>) -> Self {
        Self {
            wake_at: Some(wake_at),
            ..Self::default()
        }
    }

    /// A step is settled once it holds a result or an error
    pub fn is_settled(&self) -> bool {
        self.result.is_some() || self.error.is_some()
    }
}

// ============================================================================
// SCHEDULES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleKind {
    Cron,
    Interval,
}

/// A recurring trigger: cron expression or fixed interval
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub id: String,
    pub kind: ScheduleKind,
    /// Cron expression, or interval milliseconds rendered as decimal
    pub expr: String,
    pub task_id: String,
    pub input: Value,
    pub next_run_at: DateTime<Utc>,
    pub enabled: bool,
}

impl Schedule {
    pub fn cron(
        id: impl Into<String>,
        expr: impl Into<String>,
        task_id: impl Into<String>,
        input: Value,
        first_run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: ScheduleKind::Cron,
            expr: expr.into(),
            task_id: task_id.into(),
            input,
            next_run_at: first_run_at,
            enabled: true,
        }
    }

    pub fn interval(
        id: impl Into<String>,
        interval_ms: u64,
        task_id: impl Into<String>,
        input: Value,
        first_run_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: ScheduleKind::Interval,
            expr: interval_ms.to_string(),
            task_id: task_id.into(),
            input,
            next_run_at: first_run_at,
            enabled: true,
        }
    }

    pub fn interval_ms(&self) -> Option<u64> {
        match self.kind {
            ScheduleKind::Interval => self.expr.parse().ok(),
            ScheduleKind::Cron => None,
        }
    }
}

// ============================================================================
// QUEUE MESSAGES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Execute,
    Resume,
    Schedule,
}

/// At-least-once durable queue message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub payload: Value,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(message_type: MessageType, payload: Value, max_attempts: u32) -> Self {
        Self {
            id: unique_id("msg"),
            message_type,
            payload,
            attempts: 0,
            max_attempts,
            created_at: Utc::now(),
        }
    }

    pub fn execute(execution_id: &str, max_attempts: u32) -> Self {
        Self::new(
            MessageType::Execute,
            serde_json::json!({"executionId": execution_id}),
            max_attempts,
        )
    }

    pub fn resume(execution_id: &str, max_attempts: u32) -> Self {
        Self::new(
            MessageType::Resume,
            serde_json::json!({"executionId": execution_id}),
            max_attempts,
        )
    }

    pub fn schedule(schedule_id: &str, max_attempts: u32) -> Self {
        Self::new(
            MessageType::Schedule,
            serde_json::json!({"scheduleId": schedule_id}),
            max_attempts,
        )
    }

    /// The execution this message targets, when its shape is valid
    pub fn execution_id(&self) -> Option<&str> {
        self.payload.get("executionId").and_then(Value::as_str)
    }

    pub fn schedule_id(&self) -> Option<&str> {
        self.payload.get("scheduleId").and_then(Value::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unique_ids_differ() {
        assert_ne!(unique_id("exec"), unique_id("exec"));
    }

    #[test]
    fn execution_starts_pending() {
        let exec = Execution::new("e1", "send-email", json!({"to": "x"}), 3);
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.attempt, 0);
        assert!(!exec.status.is_terminal());
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }

    #[test]
    fn execution_serializes_camel_case() {
        let exec = Execution::new("e1", "t", Value::Null, 1);
        let json = serde_json::to_value(&exec).unwrap();
        assert_eq!(json["taskId"], "t");
        assert_eq!(json["status"], "pending");
        assert!(json["maxAttempts"].is_number());
    }

    #[test]
    fn step_record_states() {
        assert!(StepRecord::ok(json!(1)).is_settled());
        assert!(StepRecord::err("boom").is_settled());
        assert!(!StepRecord::sleeping(Utc::now()).is_settled());
    }

    #[test]
    fn message_payload_accessors() {
        let msg = QueueMessage::execute("e1", 3);
        assert_eq!(msg.execution_id(), Some("e1"));
        assert_eq!(msg.schedule_id(), None);

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "execute");
    }

    #[test]
    fn interval_schedule_parses_expr() {
        let s = Schedule::interval("s1", 1500, "t", Value::Null, Utc::now());
        assert_eq!(s.interval_ms(), Some(1500));

        let c = Schedule::cron("s2", "*/5 * * * *", "t", Value::Null, Utc::now());
        assert_eq!(c.interval_ms(), None);
    }
}
