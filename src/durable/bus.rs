//! Signal event bus seam (v0.1)
//!
//! Broadcasts execution lifecycle signals (completion wake-ups,
//! cancellation). Connection-oriented backends must hand out isolated
//! connections from `duplicate()`; the in-memory bus shares one channel,
//! which is already isolation-safe.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::DurableError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BusEventKind {
    ExecutionCompleted,
    ExecutionFailed,
    ExecutionCancelled,
    ExecutionSuspended,
}

/// One lifecycle signal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusEvent {
    pub kind: BusEventKind,
    pub execution_id: String,
    pub payload: Value,
}

impl BusEvent {
    pub fn new(kind: BusEventKind, execution_id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            execution_id: execution_id.into(),
            payload,
        }
    }
}

/// Broadcast of execution signals
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, event: BusEvent) -> Result<(), DurableError>;

    fn subscribe(&self) -> broadcast::Receiver<BusEvent>;

    /// An isolated connection to the same bus (required for backends whose
    /// client multiplexes subscriptions on one connection)
    fn duplicate(&self) -> Arc<dyn EventBus>;
}

// ============================================================================
// IN-MEMORY IMPLEMENTATION
// ============================================================================

const BUS_CAPACITY: usize = 256;

/// Reference bus over a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct InMemoryEventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl InMemoryEventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: BusEvent) -> Result<(), DurableError> {
        // No subscribers is fine; signals are best-effort wake-ups.
        let _ = self.tx.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    fn duplicate(&self) -> Arc<dyn EventBus> {
        Arc::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_subscribers() {
        let bus = InMemoryEventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(BusEvent::new(
            BusEventKind::ExecutionCompleted,
            "e1",
            json!({"result": 42}),
        ))
        .await
        .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, BusEventKind::ExecutionCompleted);
        assert_eq!(event.execution_id, "e1");
    }

    #[tokio::test]
    async fn duplicate_shares_the_channel() {
        let bus = InMemoryEventBus::new();
        let dup = bus.duplicate();
        let mut rx = dup.subscribe();

        bus.publish(BusEvent::new(BusEventKind::ExecutionCancelled, "e2", json!(null)))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().execution_id, "e2");
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_ok() {
        let bus = InMemoryEventBus::new();
        bus.publish(BusEvent::new(BusEventKind::ExecutionFailed, "e3", json!(null)))
            .await
            .unwrap();
    }
}
