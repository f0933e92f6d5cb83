use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::time::Instant;

/// Per-backend failure tracking with time-based auto-reset.
///
/// This is a deliberately minimal circuit breaker: a single failure makes a
/// backend unavailable for `retry_delay`, after which it becomes available
/// again without probing. There is no failure counting and no half-open
/// state; a backend that is still down simply fails its next request and
/// extends the window.
pub struct AvailabilityTracker {
    retry_delay: Duration,
    last_failure: Mutex<HashMap<String, Instant>>,
}

impl AvailabilityTracker {
    pub fn new(retry_delay: Duration) -> Self {
        Self {
            retry_delay,
            last_failure: Mutex::new(HashMap::new()),
        }
    }

    /// Records a failure for `host`, starting (or extending) its backoff
    /// window.
    ///
    /// Concurrent calls race benignly; the failure timestamp only ever moves
    /// forward.
    pub fn fail(&self, host: &str) {
        tracing::warn!(host, "marking backend as failed");
        metric!(counter("remote.backend.failed") += 1, "host" => host);
        self.last_failure
            .lock()
            .unwrap()
            .insert(host.to_owned(), Instant::now());
    }

    /// Whether requests may currently be sent to `host`.
    ///
    /// A backend is unavailable from the moment of a failure until strictly
    /// more than `retry_delay` has passed; at exactly the delay it is still
    /// unavailable.
    pub fn is_available(&self, host: &str) -> bool {
        match self.last_failure.lock().unwrap().get(host) {
            Some(failed_at) => Instant::now().duration_since(*failed_at) > self.retry_delay,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_available_until_failure() {
        let tracker = AvailabilityTracker::new(Duration::from_secs(60));

        assert!(tracker.is_available("peer-1:8080"));
        tracker.fail("peer-1:8080");
        assert!(!tracker.is_available("peer-1:8080"));

        // Other hosts are unaffected.
        assert!(tracker.is_available("peer-2:8080"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_boundary_is_strict() {
        let tracker = AvailabilityTracker::new(Duration::from_secs(60));
        tracker.fail("peer-1:8080");

        // At exactly the retry delay the backend is still unavailable.
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!tracker.is_available("peer-1:8080"));

        // Strictly past it, it recovers.
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(tracker.is_available("peer-1:8080"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failure_extends_window() {
        let tracker = AvailabilityTracker::new(Duration::from_secs(60));
        tracker.fail("peer-1:8080");

        tokio::time::advance(Duration::from_secs(45)).await;
        tracker.fail("peer-1:8080");

        // 45s after the second failure the first window would already be
        // over, but the window restarts on every failure.
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(!tracker.is_available("peer-1:8080"));

        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(tracker.is_available("peer-1:8080"));
    }
}
