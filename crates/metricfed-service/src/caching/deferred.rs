use std::fmt;
use std::future::Future;

use futures::FutureExt;
use futures::future::BoxFuture;

/// A lazily-evaluated fetch result.
///
/// Wraps a computation that runs only when the owner explicitly calls
/// [`get`](Self::get), in the caller's own task; constructing one never
/// polls anything. This makes the scheduling point explicit: a caller can
/// collect several deferred fetches and decide later when to block on them.
/// There is no cancellation; dropping an unevaluated `Deferred` simply
/// discards the computation.
pub struct Deferred<T> {
    inner: BoxFuture<'static, T>,
}

impl<T: Send + 'static> Deferred<T> {
    /// Wraps a computation without starting it.
    pub fn new<F>(computation: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            inner: computation.boxed(),
        }
    }

    /// Wraps a value that is already available.
    pub fn ready(value: T) -> Self {
        Self {
            inner: futures::future::ready(value).boxed(),
        }
    }

    /// Evaluates the computation, exactly once, in the calling context.
    pub async fn get(self) -> T {
        self.inner.await
    }

    /// Applies `f` to the eventual result, still without evaluating
    /// anything.
    pub fn map<U, F>(self, f: F) -> Deferred<U>
    where
        U: Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        Deferred::new(async move { f(self.inner.await) })
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_evaluates_only_on_get() {
        let calls = Arc::new(AtomicUsize::new(0));

        let deferred = {
            let calls = Arc::clone(&calls);
            Deferred::new(async move { calls.fetch_add(1, Ordering::SeqCst) + 1 })
        };

        // Constructing must not run the computation.
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        assert_eq!(deferred.get().await, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_unevaluated() {
        let calls = Arc::new(AtomicUsize::new(0));

        let deferred = {
            let calls = Arc::clone(&calls);
            Deferred::new(async move {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };
        drop(deferred);

        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_map_is_lazy() {
        let deferred = Deferred::ready(21).map(|n| n * 2);
        assert_eq!(deferred.get().await, 42);
    }
}
