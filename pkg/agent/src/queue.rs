use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

/// Per-key exponential backoff: 5ms, 10ms, 20ms, ... capped at 1000s.
const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

/// Global requeue rate: token bucket shared by every key.
const BUCKET_QPS: f64 = 10.0;
const BUCKET_BURST: f64 = 100.0;

/// Keyed, deduplicating, rate-limited work queue. Cheap to clone; clones
/// share the same queue.
///
/// Guarantees:
/// - a key is never queued twice: re-adding a queued key is a no-op, and
///   re-adding a key that is currently being processed marks it dirty so it
///   is requeued once `done` is called;
/// - requeues after failures back off exponentially per key, bounded by a
///   global token bucket;
/// - `shut_down` lets `get` drain what is already queued, then return None.
///
/// The queue only carries keys. Consumers read the object's latest state
/// from the cache when the key is dispatched, which collapses event bursts
/// into a single reconcile.
#[derive(Clone)]
pub struct WorkQueue {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

struct State {
    queue: VecDeque<String>,
    queued: HashSet<String>,
    processing: HashSet<String>,
    dirty: HashSet<String>,
    retries: HashMap<String, u32>,
    tokens: f64,
    last_refill: Instant,
    shutting_down: bool,
}

impl State {
    /// Take one token from the global bucket, returning how long the caller
    /// must wait for it.
    fn take_token(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * BUCKET_QPS).min(BUCKET_BURST);
        self.last_refill = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / BUCKET_QPS)
        }
    }
}

impl WorkQueue {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                dirty: HashSet::new(),
                retries: HashMap::new(),
                tokens: BUCKET_BURST,
                last_refill: Instant::now(),
                shutting_down: false,
            })),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a key. No-op if the key is already queued; if the key is
    /// in-flight it will be requeued when the current pass finishes.
    pub fn add(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        if state.shutting_down || state.queued.contains(key) {
            return;
        }
        if state.processing.contains(key) {
            state.dirty.insert(key.to_string());
            return;
        }
        state.queue.push_back(key.to_string());
        state.queued.insert(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Enqueue a key after its backoff delay. Increments the key's requeue
    /// count; check `num_requeues` before calling to bound retries.
    pub fn add_rate_limited(&self, key: &str) {
        let delay = {
            let mut state = self.state.lock().unwrap();
            if state.shutting_down {
                return;
            }
            let attempts = *state.retries.get(key).unwrap_or(&0);
            state.retries.insert(key.to_string(), attempts + 1);
            let backoff = BASE_DELAY
                .saturating_mul(2u32.saturating_pow(attempts))
                .min(MAX_DELAY);
            backoff.max(state.take_token())
        };

        debug!("Requeueing {} after {:?}", key, delay);
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.add(&key);
        });
    }

    /// Wait for the next key. Returns None once the queue is shut down and
    /// drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock().unwrap();
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark a key's processing pass finished, requeueing it if events
    /// arrived while it was in flight.
    pub fn done(&self, key: &str) {
        let mut state = self.state.lock().unwrap();
        state.processing.remove(key);
        if state.dirty.remove(key) && !state.shutting_down {
            state.queue.push_back(key.to_string());
            state.queued.insert(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// How many times the key has been requeued since it was last forgotten.
    pub fn num_requeues(&self, key: &str) -> u32 {
        *self.state.lock().unwrap().retries.get(key).unwrap_or(&0)
    }

    /// Reset the key's retry counter after a success or a final drop.
    pub fn forget(&self, key: &str) {
        self.state.lock().unwrap().retries.remove(key);
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stop accepting new keys. Queued keys still drain through `get`.
    pub fn shut_down(&self) {
        self.state.lock().unwrap().shutting_down = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_keys_in_order() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("b");

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn deduplicates_queued_keys() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("a");
        queue.add("a");

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        queue.done("a");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn readd_while_processing_requeues_after_done() {
        let queue = WorkQueue::new();
        queue.add("a");

        let key = queue.get().await.unwrap();
        // Events for an in-flight key collapse into one future pass
        queue.add("a");
        queue.add("a");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_requeue_counts_and_redelivers() {
        let queue = WorkQueue::new();
        queue.add("a");
        let key = queue.get().await.unwrap();
        queue.done(&key);

        assert_eq!(queue.num_requeues("a"), 0);
        queue.add_rate_limited("a");
        assert_eq!(queue.num_requeues("a"), 1);

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        queue.done("a");

        queue.add_rate_limited("a");
        assert_eq!(queue.num_requeues("a"), 2);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        queue.done("a");

        queue.forget("a");
        assert_eq!(queue.num_requeues("a"), 0);
    }

    #[tokio::test]
    async fn shutdown_drains_then_stops() {
        let queue = WorkQueue::new();
        queue.add("a");
        queue.add("b");
        queue.shut_down();

        // Adds after shutdown are dropped
        queue.add("c");

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert_eq!(queue.get().await, None);
    }

    #[tokio::test]
    async fn get_wakes_on_add() {
        let queue = WorkQueue::new();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get().await })
        };

        tokio::task::yield_now().await;
        queue.add("a");

        assert_eq!(waiter.await.unwrap().as_deref(), Some("a"));
    }
}
