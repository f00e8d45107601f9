//! Deduplicating, rate limited work queue
//!
//! A key is held at most once in the queue and is never handed to two
//! workers at the same time. Adding a key that is being processed marks it
//! dirty; it is queued again when the worker calls `done`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::trace;

/// First delay handed out by `add_rate_limited`
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
/// Cap of the per-key exponential delay
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);

#[derive(Default)]
struct State {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    failures: HashMap<String, u32>,
    shutting_down: bool,
}

struct Shared {
    name: &'static str,
    state: Mutex<State>,
    notify: Notify,
    base_delay: Duration,
    max_delay: Duration,
}

#[derive(Clone)]
pub struct WorkQueue {
    shared: Arc<Shared>,
}

impl WorkQueue {
    pub fn new(name: &'static str) -> Self {
        Self::with_backoff(name, DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }

    pub fn with_backoff(name: &'static str, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                base_delay,
                max_delay,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    pub fn add(&self, key: impl Into<String>) {
        let key = key.into();
        let depth = {
            let mut state = self.lock();
            if state.shutting_down || !state.dirty.insert(key.clone()) {
                return;
            }
            if state.processing.contains(&key) {
                return;
            }
            state.queue.push_back(key);
            state.queue.len()
        };
        self.observe_depth(depth);
        self.shared.notify.notify_one();
    }

    /// Add `key` once `delay` has elapsed
    pub fn add_after(&self, key: impl Into<String>, delay: Duration) {
        let key = key.into();
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.lock().shutting_down {
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Add `key` after its exponential per-key backoff
    pub fn add_rate_limited(&self, key: impl Into<String>) {
        let key = key.into();
        let delay = self.when(&key);
        self.add_after(key, delay);
    }

    fn when(&self, key: &str) -> Duration {
        let mut state = self.lock();
        let failures = state.failures.entry(key.to_string()).or_insert(0);
        let exp = (*failures).min(31);
        *failures = failures.saturating_add(1);
        let delay = self.shared.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.shared.max_delay)
    }

    /// Reset the backoff of `key`
    pub fn forget(&self, key: &str) {
        self.lock().failures.remove(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    fn try_pop(&self) -> Option<Option<String>> {
        let mut state = self.lock();
        if let Some(key) = state.queue.pop_front() {
            state.dirty.remove(&key);
            state.processing.insert(key.clone());
            let depth = state.queue.len();
            drop(state);
            self.observe_depth(depth);
            return Some(Some(key));
        }
        if state.shutting_down {
            return Some(None);
        }
        None
    }

    /// Wait for the next key. `None` once the queue is shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(next) = self.try_pop() {
                return next;
            }
            notified.await;
        }
    }

    /// Mark `key` as processed, queueing it again when it was re-added meanwhile
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.lock();
            state.processing.remove(key);
            if state.dirty.contains(key) {
                state.queue.push_back(key.to_string());
                Some(state.queue.len())
            } else {
                None
            }
        };
        if let Some(depth) = requeued {
            trace!(queue = self.shared.name, key, "Requeued dirty key");
            self.observe_depth(depth);
            self.shared.notify.notify_one();
        }
    }

    /// Refuse new keys; workers drain what is queued and then stop
    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.shared.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys waiting to be processed, in order
    pub fn pending(&self) -> Vec<String> {
        self.lock().queue.iter().cloned().collect()
    }

    #[cfg(feature = "metrics")]
    fn observe_depth(&self, depth: usize) {
        super::metrics::set_queue_depth(self.shared.name, depth as i64);
    }

    #[cfg(not(feature = "metrics"))]
    fn observe_depth(&self, _depth: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let queue = WorkQueue::new("test");
        queue.add("ns/a");
        queue.add("ns/a");
        queue.add("ns/b");
        assert_eq!(queue.pending(), vec!["ns/a", "ns/b"]);
    }

    #[tokio::test]
    async fn test_key_added_while_processing_is_requeued_on_done() {
        let queue = WorkQueue::new("test");
        queue.add("ns/a");
        let key = queue.get().await.unwrap();
        queue.add("ns/a");
        assert!(queue.is_empty(), "not handed out twice");
        queue.done(&key);
        assert_eq!(queue.pending(), vec!["ns/a"]);
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        use tokio_test::{assert_pending, assert_ready_eq, task};

        let queue = WorkQueue::new("test");
        let mut get = task::spawn(queue.get());
        assert_pending!(get.poll());

        queue.add("ns/a");
        assert!(get.is_woken());
        assert_ready_eq!(get.poll(), Some("ns/a".to_string()));
    }

    #[tokio::test]
    async fn test_done_without_readd_drops_key() {
        let queue = WorkQueue::new("test");
        queue.add("ns/a");
        let key = queue.get().await.unwrap();
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_drains_then_stops() {
        let queue = WorkQueue::new("test");
        queue.add("ns/a");
        queue.shut_down();
        queue.add("ns/b");
        assert_eq!(queue.get().await.as_deref(), Some("ns/a"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn test_waiting_worker_is_woken() {
        let queue = WorkQueue::new("test");
        let worker = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };
        tokio::task::yield_now().await;
        queue.add("ns/a");
        let got = tokio::time::timeout(Duration::from_secs(1), worker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("ns/a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delays() {
        let queue = WorkQueue::new("test");
        queue.add_after("ns/a", Duration::from_secs(10));
        tokio::task::yield_now().await;
        assert!(queue.is_empty());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(queue.pending(), vec!["ns/a"]);
    }

    #[test]
    fn test_rate_limit_backoff_grows_and_resets() {
        let queue = WorkQueue::with_backoff("test", Duration::from_millis(10), Duration::from_millis(50));
        assert_eq!(queue.when("k"), Duration::from_millis(10));
        assert_eq!(queue.when("k"), Duration::from_millis(20));
        assert_eq!(queue.when("k"), Duration::from_millis(40));
        assert_eq!(queue.when("k"), Duration::from_millis(50));
        assert_eq!(queue.num_requeues("k"), 4);
        queue.forget("k");
        assert_eq!(queue.when("k"), Duration::from_millis(10));
    }
}
