use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, watch};

use crate::time::Instant;
use crate::types::SeriesResult;

/// A batch of series produced by one coalesced fetch.
///
/// Batches are immutable once cached; a refresh replaces the whole `Arc`.
pub type SeriesBatch = Arc<Vec<SeriesResult>>;

/// Coalescing state for one in-flight request key.
///
/// The two gates are single-permit semaphores that are acquired
/// non-blockingly and never released: the first task through
/// [`try_send`](Self::try_send) becomes the sender, and the first task to
/// claim a parked response through [`try_receive`](Self::try_receive)
/// becomes the receiver. The receive gate only opens once a response has
/// actually been parked, so a caller that races ahead of the sender cannot
/// claim (and then lose) the response. Everyone else waits on the
/// completion latch and reads the result cache afterwards.
pub struct PendingFetch {
    send_gate: Semaphore,
    recv_gate: Semaphore,
    response: Mutex<Option<reqwest::Response>>,
    done: watch::Sender<bool>,
}

impl PendingFetch {
    fn new() -> Arc<Self> {
        let (done, _) = watch::channel(false);
        Arc::new(Self {
            send_gate: Semaphore::new(1),
            recv_gate: Semaphore::new(1),
            response: Mutex::new(None),
            done,
        })
    }

    /// Returns `true` for exactly one caller across the lifetime of this
    /// entry; that caller must perform the network send.
    pub fn try_send(&self) -> bool {
        match self.send_gate.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Claims the parked response for exactly one caller; that caller must
    /// read and parse it, then signal completion.
    ///
    /// Returns `None` while no response is parked, without consuming the
    /// receive gate, so the claim can be retried once the sender has parked.
    pub fn try_receive(&self) -> Option<reqwest::Response> {
        let mut slot = self.response.lock().unwrap();
        let response = slot.take()?;
        match self.recv_gate.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Some(response)
            }
            Err(_) => {
                *slot = Some(response);
                None
            }
        }
    }

    /// Parks the in-flight response for whichever task wins the receive
    /// gate.
    pub fn park_response(&self, response: reqwest::Response) {
        *self.response.lock().unwrap() = Some(response);
    }

    /// Signals completion. Always called by the sender on send failure and
    /// by the receiver on any outcome, so no waiter blocks forever.
    pub fn complete(&self) {
        let _ = self.done.send(true);
    }

    /// Waits for the completion signal up to `timeout`.
    ///
    /// A timeout is not an error at this layer; the waiter re-checks the
    /// result cache either way and reports failure from there.
    pub async fn wait_done(&self, timeout: Duration) {
        let mut done = self.done.subscribe();
        let _ = tokio::time::timeout(timeout, done.wait_for(|done| *done)).await;
    }
}

/// Deduplicates concurrent fetches per canonical request key and keeps their
/// parsed results in a bounded, lazily swept in-memory cache.
///
/// One coarse lock guards the pending-request table, the creation timestamps
/// and the result cache together, so the eviction sweep always sees a
/// consistent snapshot of all three. The lock is never held across network
/// I/O.
pub struct FetchCoalescer {
    fetch_timeout: Duration,
    size_limit: usize,
    state: Mutex<CoalescerState>,
}

#[derive(Default)]
struct CoalescerState {
    pending: HashMap<String, Arc<PendingFetch>>,
    started: HashMap<String, Instant>,
    results: HashMap<String, SeriesBatch>,
}

impl FetchCoalescer {
    /// Creates a coalescer sweeping entries older than `2 * fetch_timeout`
    /// once `size_limit` keys are tracked.
    pub fn new(fetch_timeout: Duration, size_limit: usize) -> Self {
        Self {
            fetch_timeout,
            size_limit,
            state: Mutex::new(CoalescerState::default()),
        }
    }

    /// Sweeps out expired entries, but only once the tracked-key count has
    /// reached the size limit.
    ///
    /// This is a lazy sweep, not an LRU: it removes every entry whose age
    /// reached twice the fetch timeout and can overshoot the limit between
    /// sweeps. The cost is paid by whichever fetch crosses the threshold;
    /// there is no background task.
    pub fn maybe_evict(&self) {
        let mut state = self.state.lock().unwrap();
        if state.started.len() < self.size_limit {
            return;
        }

        let horizon = self.fetch_timeout * 2;
        let now = Instant::now();
        let expired: Vec<String> = state
            .started
            .iter()
            .filter(|(_, started)| now.duration_since(**started) >= horizon)
            .map(|(key, _)| key.clone())
            .collect();

        if expired.is_empty() {
            return;
        }

        tracing::debug!(count = expired.len(), "evicting stale fetch entries");
        metric!(counter("fetch.coalesce.evicted") += expired.len() as i64);
        for key in expired {
            state.pending.remove(&key);
            state.started.remove(&key);
            state.results.remove(&key);
        }
        metric!(gauge("fetch.cache.tracked") = state.started.len() as u64);
    }

    /// Returns the cached batch for `key`, if present.
    pub fn lookup(&self, key: &str) -> Option<SeriesBatch> {
        self.state.lock().unwrap().results.get(key).cloned()
    }

    /// Stores the parsed batch for `key`, replacing any previous value.
    pub fn store(&self, key: &str, batch: SeriesBatch) {
        self.state
            .lock()
            .unwrap()
            .results
            .insert(key.to_owned(), batch);
    }

    /// Gets or creates the pending entry for `key`.
    ///
    /// The entry is created at most once: the first caller wins, and every
    /// concurrent caller receives the same gates. Completed entries stay
    /// around (their cached batch remains reusable) until the sweep removes
    /// them.
    pub fn entry(&self, key: &str) -> Arc<PendingFetch> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = state.pending.get(key) {
            return Arc::clone(existing);
        }

        let entry = PendingFetch::new();
        state.pending.insert(key.to_owned(), Arc::clone(&entry));
        state.started.insert(key.to_owned(), Instant::now());
        entry
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.state.lock().unwrap().started.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_entry_created_once() {
        let coalescer = FetchCoalescer::new(Duration::from_secs(6), 10);

        let first = coalescer.entry("http://peer/render/?target=a");
        let second = coalescer.entry("http://peer/render/?target=a");
        assert!(Arc::ptr_eq(&first, &second));

        let other = coalescer.entry("http://peer/render/?target=b");
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gates_admit_one_caller() {
        let coalescer = FetchCoalescer::new(Duration::from_secs(6), 10);
        let entry = coalescer.entry("key");

        assert!(entry.try_send());
        assert!(!entry.try_send());

        // The receive gate stays shut until a response is parked.
        assert!(entry.try_receive().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_done_wakes_on_complete() {
        let coalescer = FetchCoalescer::new(Duration::from_secs(6), 10);
        let entry = coalescer.entry("key");

        // Completion before the wait must not block at all.
        entry.complete();
        entry.wait_done(Duration::from_secs(60)).await;

        // Repeated signals are fine.
        entry.complete();
        entry.wait_done(Duration::from_secs(60)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_only_at_size_limit() {
        let coalescer = FetchCoalescer::new(Duration::from_millis(100), 3);

        coalescer.entry("a");
        coalescer.store("a", Arc::new(Vec::new()));

        tokio::time::advance(Duration::from_secs(10)).await;
        coalescer.maybe_evict();

        // Below the limit nothing is removed, no matter how old.
        assert_eq!(coalescer.tracked_keys(), 1);
        assert!(coalescer.lookup("a").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired_keeps_fresh() {
        let coalescer = FetchCoalescer::new(Duration::from_millis(100), 2);

        coalescer.entry("old");
        coalescer.store("old", Arc::new(Vec::new()));

        // Exactly the 2x-timeout horizon counts as expired.
        tokio::time::advance(Duration::from_millis(200)).await;
        coalescer.entry("fresh");
        coalescer.store("fresh", Arc::new(Vec::new()));

        coalescer.maybe_evict();

        assert_eq!(coalescer.tracked_keys(), 1);
        assert!(coalescer.lookup("old").is_none());
        assert!(coalescer.lookup("fresh").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_replaces_batch() {
        let coalescer = FetchCoalescer::new(Duration::from_secs(6), 10);

        let first = Arc::new(vec![crate::types::SeriesResult {
            name: "a".to_owned(),
            start: 0,
            end: 60,
            step: 60,
            values: vec![Some(1.0), None],
        }]);
        coalescer.store("key", Arc::clone(&first));
        assert!(Arc::ptr_eq(&coalescer.lookup("key").unwrap(), &first));

        let second = Arc::new(Vec::new());
        coalescer.store("key", Arc::clone(&second));
        assert!(Arc::ptr_eq(&coalescer.lookup("key").unwrap(), &second));
    }
}
