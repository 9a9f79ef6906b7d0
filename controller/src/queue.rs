//! Queue implements a rate-limited, deduplicating work queue.
//!
//! The semantics mirror a controller work queue: a key re-added while a
//! worker holds it is only marked dirty and re-queued when the holder calls
//! [`RateLimitingQueue::done`], so at most one worker processes a given key
//! at a time.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    hash::Hash,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{sync::Notify, time::Instant};
use tracing::trace;

/// RateLimiter decides how long a key must wait before re-admission.
pub trait RateLimiter<K>: Send + Sync {
    /// When returns the delay to impose on `key` right now.
    fn when(&self, key: &K) -> Duration;
    /// Forget clears accumulated state for `key`.
    fn forget(&self, key: &K);
    /// Retries reports how often `key` has been delayed since last forgotten.
    fn retries(&self, key: &K) -> u32;
}

/// ItemExponentialFailure delays each key by `base * 2^failures`, capped.
pub struct ItemExponentialFailure<K> {
    base: Duration,
    cap: Duration,
    failures: Mutex<HashMap<K, u32>>,
}

impl<K: Clone + Eq + Hash> ItemExponentialFailure<K> {
    /// New creates a limiter with the given base delay and cap.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Clone + Eq + Hash + Send + Sync> RateLimiter<K> for ItemExponentialFailure<K> {
    fn when(&self, key: &K) -> Duration {
        let exponent = {
            let mut failures = self.failures.lock().expect("limiter lock poisoned");
            let count = failures.entry(key.clone()).or_insert(0);
            let exponent = *count;
            *count = count.saturating_add(1);
            exponent
        };
        let backoff = self
            .base
            .saturating_mul(2u32.saturating_pow(exponent.min(31)));
        backoff.min(self.cap)
    }

    fn forget(&self, key: &K) {
        self.failures
            .lock()
            .expect("limiter lock poisoned")
            .remove(key);
    }

    fn retries(&self, key: &K) -> u32 {
        self.failures
            .lock()
            .expect("limiter lock poisoned")
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

/// TokenBucket imposes a global admission rate across all keys.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refreshed: Instant,
}

impl TokenBucket {
    /// New creates a bucket admitting `rate` items per second with the given
    /// burst size.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self {
            rate,
            burst: f64::from(burst),
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                refreshed: Instant::now(),
            }),
        }
    }
}

impl<K: Send + Sync> RateLimiter<K> for TokenBucket {
    fn when(&self, _key: &K) -> Duration {
        let mut state = self.state.lock().expect("bucket lock poisoned");
        let now = Instant::now();
        let replenished = now.saturating_duration_since(state.refreshed).as_secs_f64() * self.rate;
        state.tokens = (state.tokens + replenished).min(self.burst);
        state.refreshed = now;
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.rate)
        }
    }

    fn forget(&self, _key: &K) {}

    fn retries(&self, _key: &K) -> u32 {
        0
    }
}

/// MaxOf composes limiters by imposing the worst delay of the set.
pub struct MaxOf<K> {
    limiters: Vec<Box<dyn RateLimiter<K>>>,
}

impl<K> MaxOf<K> {
    /// New composes the provided limiters.
    pub fn new(limiters: Vec<Box<dyn RateLimiter<K>>>) -> Self {
        Self { limiters }
    }
}

impl<K: Send + Sync> RateLimiter<K> for MaxOf<K> {
    fn when(&self, key: &K) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &K) {
        for limiter in &self.limiters {
            limiter.forget(key);
        }
    }

    fn retries(&self, key: &K) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.retries(key))
            .max()
            .unwrap_or(0)
    }
}

/// Default_rate_limiter composes the controller's limiters: per-item
/// exponential backoff from 5ms capped at 1000s, and a 50/s burst-300 bucket.
pub fn default_rate_limiter<K: Clone + Eq + Hash + Send + Sync + 'static>() -> MaxOf<K> {
    MaxOf::new(vec![
        Box::new(ItemExponentialFailure::new(
            Duration::from_millis(5),
            Duration::from_secs(1000),
        )),
        Box::new(TokenBucket::new(50.0, 300)),
    ])
}

/// RateLimitingQueue coalesces keys and hands each to one holder at a time.
///
/// The queue is a cheap handle; clones share the same state.
pub struct RateLimitingQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for RateLimitingQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<K> {
    state: Mutex<QueueState<K>>,
    wake: Notify,
    limiter: MaxOf<K>,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

impl<K> RateLimitingQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    /// New creates a queue governed by `limiter`.
    pub fn new(limiter: MaxOf<K>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                wake: Notify::new(),
                limiter,
            }),
        }
    }

    /// Add marks `key` for processing, coalescing duplicates.
    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock().expect("queue lock poisoned");
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if !state.processing.contains(&key) {
            state.queue.push_back(key);
            drop(state);
            self.inner.wake.notify_one();
        }
    }

    /// Add_rate_limited re-admits `key` once the composed limiter allows it.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.inner.limiter.when(&key);
        if delay.is_zero() {
            self.add(key);
            return;
        }
        trace!(?delay, "delaying re-add");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Forget resets the rate-limit history for `key`.
    pub fn forget(&self, key: &K) {
        self.inner.limiter.forget(key);
    }

    /// Retries reports how often `key` has been re-admitted with a delay.
    pub fn retries(&self, key: &K) -> u32 {
        self.inner.limiter.retries(key)
    }

    /// Get blocks until a key is available and marks it processing. `None`
    /// means the queue has shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let wake = self.inner.wake.notified();
            {
                let mut state = self.inner.state.lock().expect("queue lock poisoned");
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.inner.wake.notify_one();
                    }
                    return Some(key);
                }
                if state.shutting_down {
                    return None;
                }
            }
            wake.await;
        }
    }

    /// Done releases `key`; a re-add coalesced while it was held is queued.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock().expect("queue lock poisoned");
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.wake.notify_one();
        }
    }

    /// Shut_down stops admission and releases blocked getters.
    pub fn shut_down(&self) {
        {
            let mut state = self.inner.state.lock().expect("queue lock poisoned");
            state.shutting_down = true;
        }
        self.inner.wake.notify_waiters();
        self.inner.wake.notify_one();
    }

    /// Len reports how many keys are queued (not counting held ones).
    pub fn len(&self) -> usize {
        self.inner
            .state
            .lock()
            .expect("queue lock poisoned")
            .queue
            .len()
    }

    /// Is_empty reports whether no keys are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> RateLimitingQueue<&'static str> {
        RateLimitingQueue::new(default_rate_limiter())
    }

    #[tokio::test]
    async fn adds_coalesce() {
        let q = queue();
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        q.done(&"a");
        q.done(&"b");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn readds_while_held_release_on_done() {
        let q = queue();
        q.add("a");
        let key = q.get().await.expect("item");

        // Re-adds while the key is held stay coalesced and off the queue.
        q.add("a");
        q.add("a");
        assert!(q.is_empty());

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn single_flight_per_key() {
        let q = queue();
        q.add("a");
        let first = q.get().await.expect("item");
        q.add("a");

        // The same key must not be handed out again while held.
        let second = tokio::time::timeout(Duration::from_millis(50), q.get()).await;
        assert!(second.is_err(), "key handed to a second holder");
        q.done(&first);
    }

    #[tokio::test]
    async fn get_wakes_on_add() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.add("a");
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter finished")
            .expect("join");
        assert_eq!(got, Some("a"));
    }

    #[tokio::test]
    async fn shutdown_releases_getters() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.shut_down();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter finished")
            .expect("join");
        assert_eq!(got, None);
        q.add("late");
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_readds_are_delayed() {
        let q = queue();
        q.add_rate_limited("a");
        // First failure: 5ms backoff; the paused clock advances instantly.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");

        q.add_rate_limited("a");
        assert!(q.is_empty(), "second re-add must be delayed");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn exponential_backoff_grows_and_forgets() {
        let limiter = ItemExponentialFailure::new(Duration::from_millis(5), Duration::from_secs(1000));
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"a"), Duration::from_millis(5));
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"a"), Duration::from_millis(10));
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"a"), Duration::from_millis(20));
        assert_eq!(RateLimiter::<&str>::retries(&limiter, &"a"), 3);

        // Other keys are unaffected.
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"b"), Duration::from_millis(5));

        limiter.forget(&"a");
        assert_eq!(RateLimiter::<&str>::when(&limiter, &"a"), Duration::from_millis(5));
    }

    #[test]
    fn exponential_backoff_caps() {
        let limiter = ItemExponentialFailure::new(Duration::from_millis(5), Duration::from_secs(1000));
        let mut last = Duration::ZERO;
        for _ in 0..40 {
            last = RateLimiter::<&str>::when(&limiter, &"a");
        }
        assert_eq!(last, Duration::from_secs(1000));
    }

    #[test]
    fn token_bucket_delays_past_burst() {
        let bucket = TokenBucket::new(10.0, 2);
        assert_eq!(RateLimiter::<&str>::when(&bucket, &"a"), Duration::ZERO);
        assert_eq!(RateLimiter::<&str>::when(&bucket, &"b"), Duration::ZERO);
        let delay = RateLimiter::<&str>::when(&bucket, &"c");
        assert!(delay > Duration::ZERO, "bucket exhausted, delay expected");
        assert!(delay <= Duration::from_millis(150));
    }

    #[test]
    fn max_of_picks_the_worst_delay() {
        let composed: MaxOf<&str> = MaxOf::new(vec![
            Box::new(ItemExponentialFailure::new(
                Duration::from_millis(5),
                Duration::from_secs(1000),
            )),
            Box::new(TokenBucket::new(50.0, 300)),
        ]);
        // Bucket has plenty of burst, so the item backoff dominates.
        assert_eq!(composed.when(&"a"), Duration::from_millis(5));
        assert_eq!(composed.when(&"a"), Duration::from_millis(10));
        composed.forget(&"a");
        assert_eq!(composed.when(&"a"), Duration::from_millis(5));
    }
}
