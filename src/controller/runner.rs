//! Worker pool
//!
//! A fixed-size pool of workers pulls keys from the change notification
//! queue and runs one reconciliation pass per key. Per-key mutual exclusion
//! comes from the queue; cross-key passes run in parallel across workers.
//! Shutdown is cooperative: cancelling the token shuts the queue, pending
//! keys drain, and in-flight passes finish.

use async_trait::async_trait;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{ErrorAction, Result};

use super::queue::WorkQueue;
use super::ObjectKey;

/// One reconciliation pass for one key
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &ObjectKey) -> Result<()>;
}

/// Run `workers` workers over `queue` until the token is cancelled and the
/// queue has drained
pub async fn run_worker_pool<R: Reconcile>(
    name: &'static str,
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<R>,
    workers: usize,
    token: CancellationToken,
) {
    info!(controller = name, workers, "starting workers");

    {
        let queue = queue.clone();
        let token = token.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            queue.shutdown();
        });
    }

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let queue = queue.clone();
            let reconciler = reconciler.clone();
            tokio::spawn(async move {
                worker_loop(name, worker, queue, reconciler).await;
            })
        })
        .collect();

    for handle in handles {
        let _ = handle.await;
    }
    info!(controller = name, "workers stopped");
}

async fn worker_loop<R: Reconcile>(
    name: &'static str,
    worker: usize,
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<R>,
) {
    while let Some(key) = queue.dequeue().await {
        match reconciler.reconcile(&key).await {
            Ok(()) => {
                queue.forget(&key);
            }
            Err(err) => match err.action() {
                ErrorAction::RequeueWithBackoff => {
                    warn!(
                        controller = name,
                        worker,
                        key = %key,
                        retries = queue.retries(&key),
                        error = %err,
                        "pass failed, requeueing with backoff"
                    );
                    queue.clone().enqueue_rate_limited(key.clone());
                }
                ErrorAction::RequeueAfter(delay) => {
                    warn!(controller = name, key = %key, error = %err, delay = ?delay, "pass failed, requeueing");
                    queue.clone().enqueue_after(key.clone(), delay);
                }
                ErrorAction::NoRequeue => {
                    warn!(controller = name, key = %key, error = %err, "pass failed, waiting for a new spec");
                    queue.forget(&key);
                }
            },
        }
        queue.done(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::queue::RateLimiter;
    use crate::error::Error;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct CountingReconciler {
        seen: Mutex<Vec<ObjectKey>>,
        fail_first: Mutex<bool>,
    }

    #[async_trait]
    impl Reconcile for CountingReconciler {
        async fn reconcile(&self, key: &ObjectKey) -> Result<()> {
            self.seen.lock().push(key.clone());
            let mut fail = self.fail_first.lock();
            if *fail {
                *fail = false;
                return Err(Error::Internal("transient".into()));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_pool_processes_and_drains() {
        let queue = WorkQueue::with_rate_limiter(RateLimiter::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
        ));
        let reconciler = Arc::new(CountingReconciler {
            seen: Mutex::new(Vec::new()),
            fail_first: Mutex::new(false),
        });
        let token = CancellationToken::new();

        queue.enqueue(ObjectKey::new("ns", "a"));
        queue.enqueue(ObjectKey::new("ns", "b"));

        let pool = tokio::spawn(run_worker_pool(
            "test",
            queue.clone(),
            reconciler.clone(),
            1,
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        pool.await.unwrap();

        let seen = reconciler.seen.lock();
        assert_eq!(seen.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_pass_is_retried() {
        let queue = WorkQueue::with_rate_limiter(RateLimiter::new(
            Duration::from_millis(1),
            Duration::from_millis(10),
        ));
        let reconciler = Arc::new(CountingReconciler {
            seen: Mutex::new(Vec::new()),
            fail_first: Mutex::new(true),
        });
        let token = CancellationToken::new();

        queue.enqueue(ObjectKey::new("ns", "flaky"));

        let pool = tokio::spawn(run_worker_pool(
            "test",
            queue.clone(),
            reconciler.clone(),
            1,
            token.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        token.cancel();
        pool.await.unwrap();

        // one failed pass plus its retry; the successful retry resets the
        // backoff counter
        let seen = reconciler.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(queue.retries(&ObjectKey::new("ns", "flaky")), 0);
    }
}
