//! Change notification queue
//!
//! A deduplicating, rate-limited work queue with single-flight semantics per
//! key: at most one worker processes a given key at a time, and a key that is
//! enqueued again while in flight is re-delivered exactly once after the
//! current pass calls [`WorkQueue::done`]. Workers therefore always
//! reconcile against the latest observed spec, never a stale intermediate
//! one (level-triggered).
//!
//! Failed keys are re-enqueued through a per-key exponential
//! [`RateLimiter`]; successful keys are forgotten, resetting their counter.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

// =============================================================================
// Rate Limiter
// =============================================================================

/// Default delay after the first failure of a key
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on the per-key retry delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

/// Per-key exponential backoff: `base * 2^(failures-1)`, capped at `max`.
pub struct RateLimiter<K> {
    failures: Mutex<HashMap<K, u32>>,
    base_delay: Duration,
    max_delay: Duration,
}

impl<K: Clone + Eq + Hash> RateLimiter<K> {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            base_delay,
            max_delay,
        }
    }

    /// Record a failure for `key` and return the delay before its retry
    pub fn next_delay(&self, key: &K) -> Duration {
        let mut failures = self.failures.lock();
        let count = failures.entry(key.clone()).or_insert(0);
        *count += 1;

        let shift = (*count - 1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }

    /// Number of consecutive failures recorded for `key`
    pub fn retries(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }

    /// Reset the failure counter for `key`
    pub fn forget(&self, key: &K) {
        self.failures.lock().remove(key);
    }
}

impl<K: Clone + Eq + Hash> Default for RateLimiter<K> {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

// =============================================================================
// Work Queue
// =============================================================================

struct QueueState<K> {
    /// Keys awaiting delivery, in arrival order
    queue: VecDeque<K>,
    /// Keys that need (re-)processing; a key stays dirty while queued or
    /// while a newer notification arrived mid-flight
    dirty: HashSet<K>,
    /// Keys currently held by a worker
    processing: HashSet<K>,
}

/// Deduplicating single-flight work queue
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    shutting_down: AtomicBool,
    limiter: RateLimiter<K>,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Self::with_rate_limiter(RateLimiter::default())
    }

    pub fn with_rate_limiter(limiter: RateLimiter<K>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
            }),
            notify: Notify::new(),
            shutting_down: AtomicBool::new(false),
            limiter,
        })
    }

    /// Add `key` for processing. Duplicate adds of a pending key collapse;
    /// adds of an in-flight key mark it dirty for re-delivery after `done`.
    pub fn enqueue(&self, key: K) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let mut state = self.state.lock();
        if state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }

    /// Add `key` after `delay`
    pub fn enqueue_after(self: Arc<Self>, key: K, delay: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            self.enqueue(key);
        });
    }

    /// Add `key` after its rate-limited backoff delay
    pub fn enqueue_rate_limited(self: Arc<Self>, key: K) {
        let delay = self.limiter.next_delay(&key);
        self.enqueue_after(key, delay);
    }

    /// Block until a key is available or the queue is shut down and drained.
    /// The returned key is marked in flight until [`WorkQueue::done`].
    pub async fn dequeue(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        // keep sibling workers draining
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                if self.shutting_down.load(Ordering::SeqCst) {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a pass over `key` complete; re-deliver it if a notification
    /// arrived while it was in flight
    pub fn done(&self, key: &K) {
        let mut state = self.state.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !self.shutting_down.load(Ordering::SeqCst) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Reset the backoff counter for `key` after a successful pass
    pub fn forget(&self, key: &K) {
        self.limiter.forget(key);
    }

    /// Consecutive failures recorded for `key`
    pub fn retries(&self, key: &K) -> u32 {
        self.limiter.retries(key)
    }

    /// Begin shutdown: pending keys are still delivered, new adds are
    /// dropped, and `dequeue` returns `None` once drained
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Number of keys awaiting delivery
    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_duplicate_enqueues_collapse() {
        let queue = WorkQueue::new();
        queue.enqueue("a");
        queue.enqueue("a");
        queue.enqueue("b");

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue().await, Some("a"));
        assert_eq!(queue.dequeue().await, Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_in_flight_key_is_redelivered_once() {
        let queue = WorkQueue::new();
        queue.enqueue("a");

        let key = queue.dequeue().await.unwrap();
        assert_eq!(key, "a");

        // two notifications while in flight collapse to one re-delivery
        queue.enqueue("a");
        queue.enqueue("a");
        assert!(queue.is_empty(), "in-flight key must not be queued yet");

        queue.done(&"a");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().await, Some("a"));
        queue.done(&"a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_done_without_new_notification_does_not_requeue() {
        let queue = WorkQueue::new();
        queue.enqueue("a");
        let key = queue.dequeue().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_dequeue_blocks_until_enqueue() {
        let queue = WorkQueue::new();

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue("late");

        let got = timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got, Some("late"));
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_stops() {
        let queue = WorkQueue::new();
        queue.enqueue("a");
        queue.shutdown();

        // queued work is still delivered
        assert_eq!(queue.dequeue().await, Some("a"));
        // new work is refused
        queue.enqueue("b");
        assert_eq!(queue.dequeue().await, None);
    }

    #[tokio::test]
    async fn test_enqueue_after_delivers_later() {
        let queue = WorkQueue::new();
        queue.clone().enqueue_after("delayed", Duration::from_millis(20));
        assert!(queue.is_empty());

        let got = timeout(Duration::from_secs(1), queue.dequeue()).await.unwrap();
        assert_eq!(got, Some("delayed"));
    }

    #[test]
    fn test_rate_limiter_grows_exponentially() {
        let limiter: RateLimiter<&str> =
            RateLimiter::new(Duration::from_millis(100), Duration::from_secs(60));

        assert_eq!(limiter.next_delay(&"k"), Duration::from_millis(100));
        assert_eq!(limiter.next_delay(&"k"), Duration::from_millis(200));
        assert_eq!(limiter.next_delay(&"k"), Duration::from_millis(400));
        assert_eq!(limiter.retries(&"k"), 3);

        // independent keys do not share counters
        assert_eq!(limiter.next_delay(&"other"), Duration::from_millis(100));
    }

    #[test]
    fn test_rate_limiter_caps_at_max() {
        let limiter: RateLimiter<&str> =
            RateLimiter::new(Duration::from_secs(1), Duration::from_secs(8));

        for _ in 0..10 {
            limiter.next_delay(&"k");
        }
        assert_eq!(limiter.next_delay(&"k"), Duration::from_secs(8));
    }

    #[test]
    fn test_rate_limiter_forget_resets() {
        let limiter: RateLimiter<&str> =
            RateLimiter::new(Duration::from_millis(100), Duration::from_secs(60));

        limiter.next_delay(&"k");
        limiter.next_delay(&"k");
        limiter.forget(&"k");
        assert_eq!(limiter.retries(&"k"), 0);
        assert_eq!(limiter.next_delay(&"k"), Duration::from_millis(100));
    }
}
