//! Bounded worker pool shared by all connections.
//!
//! Connections are tokio tasks; the pool bounds how many of them execute
//! dispatch or deferred handler work at the same time. A connection holds a
//! permit only while it processes one event, so one session never occupies
//! more than one worker for its dispatches and ordering within a session is
//! kept by the connection itself.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::XmppError;

/// Default number of concurrent workers.
pub const DEFAULT_WORKERS: usize = 16;

#[derive(Debug, Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Workers currently idle.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a free worker. The worker is released when the permit drops.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, XmppError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| XmppError::internal("worker pool closed"))
    }

    /// Wrap `work` so that it runs while holding a worker.
    pub fn run<F>(&self, work: F) -> impl Future<Output = Result<F::Output, XmppError>> + Send + 'static
    where
        F: Future + Send + 'static,
        F::Output: Send,
    {
        let semaphore = Arc::clone(&self.semaphore);
        async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| XmppError::internal("worker pool closed"))?;
            Ok(work.await)
        }
    }

    /// Stop handing out workers; pending and future acquisitions fail.
    pub fn close(&self) {
        self.semaphore.close();
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(DEFAULT_WORKERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_and_release() {
        let pool = WorkerPool::new(2);
        let first = pool.acquire().await.unwrap();
        let _second = pool.acquire().await.unwrap();
        assert_eq!(pool.available(), 0);
        drop(first);
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn test_run_bounds_concurrency() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                tokio::spawn(pool.run(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                }))
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_closed_pool_fails() {
        let pool = WorkerPool::new(1);
        pool.close();
        assert!(matches!(pool.acquire().await, Err(XmppError::Internal(_))));
    }

    #[test]
    fn test_zero_size_is_clamped() {
        assert_eq!(WorkerPool::new(0).size(), 1);
    }
}
