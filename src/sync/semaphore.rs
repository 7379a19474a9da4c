//! Counting semaphore with RAII permits (v0.1)

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore as TokioSemaphore};

/// Counting semaphore; `acquire` blocks until a permit frees up
#[derive(Debug, Clone)]
pub struct Semaphore {
    inner: Arc<TokioSemaphore>,
    capacity: usize,
}

/// A held permit; dropping releases
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
}

impl Semaphore {
    pub fn new(permits: usize) -> Self {
        Self {
            inner: Arc::new(TokioSemaphore::new(permits)),
            capacity: permits,
        }
    }

    /// Wait for a permit
    pub async fn acquire(&self) -> Permit {
        let permit = self
            .inner
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore is never closed");
        Permit { _permit: permit }
    }

    /// Take a permit only if one is free right now
    pub fn try_acquire(&self) -> Option<Permit> {
        self.inner
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Permit { _permit: permit })
    }

    /// Run `f` under a permit; the permit releases on every exit path,
    /// rejection included.
    pub async fn with_permit<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.acquire().await;
        f().await
    }

    pub fn available(&self) -> usize {
        self.inner.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn acquire_and_release() {
        let sem = Semaphore::new(2);
        let a = sem.acquire().await;
        let _b = sem.acquire().await;
        assert_eq!(sem.available(), 0);
        assert!(sem.try_acquire().is_none());

        drop(a);
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn with_permit_releases_on_error() {
        let sem = Semaphore::new(1);
        let result: Result<(), anyhow::Error> =
            sem.with_permit(|| async { Err(anyhow::anyhow!("boom")) }).await;
        assert!(result.is_err());
        assert_eq!(sem.available(), 1);
    }

    #[tokio::test]
    async fn bounds_concurrency() {
        let sem = Semaphore::new(3);
        let peak = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let sem = sem.clone();
            let peak = peak.clone();
            let current = current.clone();
            handles.push(tokio::spawn(async move {
                sem.with_permit(|| async {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                })
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }
}
