//! FIFO task queue with cooperative cancellation (v0.1)
//!
//! One worker drains jobs strictly in submission order. Each job receives
//! an [`AbortSignal`]; `dispose({cancel: true})` flips it, rejects tasks
//! still pending with `queue.cancelled`, and lets the running task wind
//! down cooperatively. Without `cancel`, dispose waits for a full drain.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, Notify};

use crate::error::WeftError;

// ============================================================================
// ABORT SIGNAL
// ============================================================================

/// Cooperative cancellation token handed to queued tasks
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    aborted: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl AbortSignal {
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Bail out with `queue.cancelled` when the signal fired
    pub fn throw_if_aborted(&self) -> Result<(), WeftError> {
        if self.is_aborted() {
            Err(WeftError::QueueCancelled)
        } else {
            Ok(())
        }
    }

    /// Resolve when the signal fires (select against long work)
    pub async fn aborted(&self) {
        while !self.is_aborted() {
            self.notify.notified().await;
        }
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

// ============================================================================
// QUEUE
// ============================================================================

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Options for [`Queue::dispose`]
#[derive(Debug, Clone, Copy, Default)]
pub struct DisposeOptions {
    /// Reject pending tasks instead of draining them
    pub cancel: bool,
}

/// Strictly ordered execution of async tasks
pub struct Queue {
    tx: mpsc::UnboundedSender<Job>,
    signal: AbortSignal,
    disposed: Arc<AtomicBool>,
}

impl Queue {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
        });
        Self {
            tx,
            signal: AbortSignal::default(),
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Enqueue a task; resolves with its output once every earlier task
    /// finished. Tasks opt into cancellation by checking the signal.
    pub async fn run<T, F, Fut>(&self, f: F) -> Result<T, WeftError>
    where
        F: FnOnce(AbortSignal) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(WeftError::QueueCancelled);
        }

        let (out_tx, out_rx) = oneshot::channel::<Result<T, WeftError>>();
        let signal = self.signal.clone();
        let job: Job = Box::pin(async move {
            // A cancelled dispose rejects everything still pending.
            let result = if signal.is_aborted() {
                Err(WeftError::QueueCancelled)
            } else {
                f(signal).await.map_err(WeftError::from_any)
            };
            let _ = out_tx.send(result);
        });

        self.tx
            .send(job)
            .map_err(|_| WeftError::QueueCancelled)?;
        out_rx.await.map_err(|_| WeftError::QueueCancelled)?
    }

    /// Stop accepting work. With `cancel`, pending tasks reject with
    /// `queue.cancelled` and the running task is signalled; otherwise the
    /// queue drains. Resolves once the queue is empty.
    pub async fn dispose(&self, options: DisposeOptions) {
        self.disposed.store(true, Ordering::SeqCst);
        if options.cancel {
            self.signal.abort();
        }

        // FIFO marker: when it runs, everything enqueued earlier is done.
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let marker: Job = Box::pin(async move {
            let _ = done_tx.send(());
        });
        if self.tx.send(marker).is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl Default for Queue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .finish()
    }
}
