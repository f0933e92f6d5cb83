//! Caching and request-coalescing primitives.
//!
//! [`FetchCoalescer`] keeps the bookkeeping for in-flight fetches and their
//! cached results; [`Deferred`] is the caller-driven handle onto a coalesced
//! fetch outcome.

use std::error::Error;
use std::time::Duration;

use thiserror::Error;

mod coalesce;
mod deferred;

pub use coalesce::{FetchCoalescer, PendingFetch, SeriesBatch};
pub use deferred::Deferred;

/// An error that happens while fetching data from a remote backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The response body did not arrive within the fetch timeout.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The backend could not be reached, or answered with a non-success
    /// status.
    ///
    /// The attached string contains the innermost transport error.
    #[error("fetch failed: {0}")]
    Download(String),
    /// The backend answered, but the payload did not decode.
    #[error("malformed payload: {0}")]
    Malformed(String),
    /// A passive waiter woke up after the completion signal and found no
    /// cached result for its key.
    ///
    /// This is fatal for that caller only and does not touch the backend's
    /// availability state.
    #[error("no cached result available after coalesced fetch")]
    NoCachedResult,
}

/// Result alias used throughout the fetch layer.
pub type FetchResult<T = ()> = Result<T, FetchError>;

impl FetchError {
    fn innermost(mut error: &dyn Error) -> String {
        while let Some(source) = error.source() {
            error = source;
        }
        error.to_string()
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            Self::Malformed(Self::innermost(&error))
        } else {
            Self::Download(Self::innermost(&error))
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(error: serde_json::Error) -> Self {
        Self::Malformed(error.to_string())
    }
}
