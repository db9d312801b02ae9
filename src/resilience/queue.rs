//! Bounded-concurrency FIFO queue for outbound requests.

use crate::errors::{MarketingError, MarketingResult};
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Semaphore;
use tracing::{debug, info};

/// Request queue configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RequestQueueConfig {
    /// Operations allowed to run at once
    pub max_concurrent: usize,
}

impl Default for RequestQueueConfig {
    fn default() -> Self {
        Self { max_concurrent: 10 }
    }
}

impl RequestQueueConfig {
    /// Create new config
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency bound
    pub fn max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }
}

/// Queue occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    /// Operations currently running
    pub active: usize,
    /// Operations waiting for a slot
    pub queued: usize,
    /// Concurrency bound
    pub max_concurrent: usize,
}

/// Admits operations in arrival order, never more than `max_concurrent` at a time.
///
/// Backed by a fair semaphore, so waiters are served first-in first-out.
/// A waiter that is dropped leaves the queue without consuming a slot.
pub struct RequestQueue {
    semaphore: Semaphore,
    max_concurrent: usize,
    active: AtomicUsize,
    queued: AtomicUsize,
}

impl RequestQueue {
    /// Create a queue
    pub fn new(config: RequestQueueConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            semaphore: Semaphore::new(max_concurrent),
            max_concurrent,
            active: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
        }
    }

    /// Run `operation` once a slot is free and return its result
    pub async fn add<F, Fut, T>(&self, operation: F) -> MarketingResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MarketingResult<T>>,
    {
        let waiting = CounterGuard::enter(&self.queued);
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| MarketingError::QueueClosed)?;
        drop(waiting);

        let _running = CounterGuard::enter(&self.active);
        debug!(
            active = self.active.load(Ordering::Relaxed),
            queued = self.queued.load(Ordering::Relaxed),
            "Request admitted"
        );

        let result = operation().await;
        drop(permit);
        result
    }

    /// Current occupancy
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            active: self.active.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            max_concurrent: self.max_concurrent,
        }
    }

    /// Reject queued and future operations; running ones finish normally
    pub fn close(&self) {
        info!(queued = self.queued.load(Ordering::Relaxed), "Closing request queue");
        self.semaphore.close();
    }

    /// Whether [`RequestQueue::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(RequestQueueConfig::default())
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

struct CounterGuard<'a>(&'a AtomicUsize);

impl<'a> CounterGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_runs_operation_and_returns_result() {
        let queue = RequestQueue::default();

        let value = queue.add(|| async { Ok::<_, MarketingError>(42) }).await.unwrap();

        assert_eq!(value, 42);
        assert_eq!(queue.stats().active, 0);
    }

    #[tokio::test]
    async fn test_excess_operations_wait() {
        let queue = Arc::new(RequestQueue::new(RequestQueueConfig::new().max_concurrent(2)));
        let mut releases = Vec::new();
        let mut handles = Vec::new();

        for _ in 0..3 {
            let (tx, rx) = oneshot::channel::<()>();
            releases.push(tx);
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .add(|| async move {
                        rx.await.ok();
                        Ok::<_, MarketingError>(())
                    })
                    .await
            }));
        }
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            queue.stats(),
            QueueStats { active: 2, queued: 1, max_concurrent: 2 }
        );

        let mut releases = releases.into_iter();
        if let Some(first) = releases.next() {
            first.send(()).ok();
        }
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.stats().active, 2);
        assert_eq!(queue.stats().queued, 0);

        for tx in releases {
            tx.send(()).ok();
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(queue.stats().active, 0);
    }

    #[tokio::test]
    async fn test_errors_release_the_slot() {
        let queue = RequestQueue::new(RequestQueueConfig::new().max_concurrent(1));

        let failed: MarketingResult<()> = queue
            .add(|| async { Err(MarketingError::Timeout { message: "slow".to_string() }) })
            .await;
        assert!(failed.is_err());

        let ok = queue.add(|| async { Ok::<_, MarketingError>("next") }).await;
        assert_eq!(ok.unwrap(), "next");
    }

    #[test]
    fn test_dropped_callers_leave_the_queue() {
        let queue = RequestQueue::new(RequestQueueConfig::new().max_concurrent(1));
        let (_hold, rx) = oneshot::channel::<()>();

        let mut running = tokio_test::task::spawn(queue.add(move || async move {
            rx.await.ok();
            Ok::<_, MarketingError>(())
        }));
        tokio_test::assert_pending!(running.poll());

        let mut waiting = tokio_test::task::spawn(queue.add(|| async { Ok::<_, MarketingError>(()) }));
        tokio_test::assert_pending!(waiting.poll());
        assert_eq!(queue.stats().queued, 1);

        drop(waiting);
        assert_eq!(queue.stats().queued, 0);

        drop(running);
        assert_eq!(queue.stats().active, 0);
        assert_eq!(queue.semaphore.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_closed_queue_rejects() {
        let queue = RequestQueue::default();
        queue.close();

        let result = queue.add(|| async { Ok::<_, MarketingError>(()) }).await;

        assert!(matches!(result, Err(MarketingError::QueueClosed)));
        assert!(queue.is_closed());
    }
}
