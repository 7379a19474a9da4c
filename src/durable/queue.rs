//! Durable queue seam (v0.1)
//!
//! At-least-once delivery with explicit ack/nack. The in-memory reference
//! implementation redelivers nacked messages until their attempt budget is
//! exhausted, then routes them to an inspectable dead-letter buffer.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::model::QueueMessage;
use super::DurableError;

/// Durable at-least-once message queue
#[async_trait]
pub trait DurableQueue: Send + Sync {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), DurableError>;

    /// Await the next deliverable message; the message stays in flight
    /// until acked or nacked.
    async fn next(&self) -> Result<QueueMessage, DurableError>;

    /// Positive acknowledgement: the message is done
    async fn ack(&self, id: &str) -> Result<(), DurableError>;

    /// Negative acknowledgement. With `requeue`, the message is redelivered
    /// until `attempts > max_attempts`, then dead-lettered.
    async fn nack(&self, id: &str, requeue: bool) -> Result<(), DurableError>;

    /// Messages that exhausted their attempts
    async fn dead_letters(&self) -> Result<Vec<QueueMessage>, DurableError>;
}

// ============================================================================
// IN-MEMORY IMPLEMENTATION
// ============================================================================

/// Reference queue: unbounded channel + in-flight table + dead letters
pub struct InMemoryDurableQueue {
    tx: mpsc::UnboundedSender<QueueMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<QueueMessage>>,
    in_flight: DashMap<String, QueueMessage>,
    dead: Mutex<Vec<QueueMessage>>,
}

impl InMemoryDurableQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            in_flight: DashMap::new(),
            dead: Mutex::new(Vec::new()),
        }
    }
}

impl Default for InMemoryDurableQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableQueue for InMemoryDurableQueue {
    async fn enqueue(&self, message: QueueMessage) -> Result<(), DurableError> {
        self.tx.send(message).map_err(|e| DurableError::Queue {
            message: format!("enqueue on closed queue: {}", e),
        })
    }

    async fn next(&self) -> Result<QueueMessage, DurableError> {
        let mut rx = self.rx.lock().await;
        let message = rx.recv().await.ok_or_else(|| DurableError::Queue {
            message: "queue channel closed".into(),
        })?;
        self.in_flight.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn ack(&self, id: &str) -> Result<(), DurableError> {
        self.in_flight.remove(id);
        Ok(())
    }

    async fn nack(&self, id: &str, requeue: bool) -> Result<(), DurableError> {
        let Some((_, mut message)) = self.in_flight.remove(id) else {
            return Ok(());
        };
        message.attempts += 1;
        if requeue && message.attempts <= message.max_attempts {
            self.enqueue(message).await
        } else {
            self.dead.lock().push(message);
            Ok(())
        }
    }

    async fn dead_letters(&self) -> Result<Vec<QueueMessage>, DurableError> {
        Ok(self.dead.lock().clone())
    }
}

impl std::fmt::Debug for InMemoryDurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDurableQueue")
            .field("in_flight", &self.in_flight.len())
            .field("dead", &self.dead.lock().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::model::MessageType;
    use serde_json::json;

    fn msg(max_attempts: u32) -> QueueMessage {
        QueueMessage::new(MessageType::Execute, json!({"executionId": "e1"}), max_attempts)
    }

    #[tokio::test]
    async fn enqueue_then_next() {
        let queue = InMemoryDurableQueue::new();
        let sent = msg(3);
        queue.enqueue(sent.clone()).await.unwrap();

        let got = queue.next().await.unwrap();
        assert_eq!(got.id, sent.id);
        queue.ack(&got.id).await.unwrap();
        assert!(queue.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn nack_requeues_until_exhausted() {
        let queue = InMemoryDurableQueue::new();
        queue.enqueue(msg(1)).await.unwrap();

        // First delivery: nack bumps attempts to 1, still within budget.
        let first = queue.next().await.unwrap();
        assert_eq!(first.attempts, 0);
        queue.nack(&first.id, true).await.unwrap();

        // Redelivery: nack bumps attempts to 2 > max_attempts → dead letter.
        let second = queue.next().await.unwrap();
        assert_eq!(second.attempts, 1);
        queue.nack(&second.id, true).await.unwrap();

        let dead = queue.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
    }

    #[tokio::test]
    async fn nack_without_requeue_dead_letters() {
        let queue = InMemoryDurableQueue::new();
        queue.enqueue(msg(5)).await.unwrap();

        let got = queue.next().await.unwrap();
        queue.nack(&got.id, false).await.unwrap();

        assert_eq!(queue.dead_letters().await.unwrap().len(), 1);
    }
}
