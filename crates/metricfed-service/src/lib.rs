//! Federated fetch layer for a metrics-visualization front end.
//!
//! This crate lets a dashboard discover and fetch time-series data from
//! remote backends (peer nodes of the same flat metrics store, or a
//! hierarchical metrics-tree service) without duplicating in-flight network
//! work and without hammering a backend that is currently failing.
//!
//! The moving parts:
//!
//! - [`caching::FetchCoalescer`] deduplicates concurrent identical fetches
//!   and bounds their cost with a lazily swept in-memory cache.
//! - [`remote::AvailabilityTracker`] is a minimal per-backend circuit
//!   breaker: it trips on a single failure and resets after a fixed delay.
//! - [`remote::RemoteStore`] resolves discovery queries (with a TTL'd cache)
//!   and hands out [`remote::SeriesReader`]s whose fetches run through the
//!   coalescer.
//! - The tree resolver in [`remote`] turns a dotted `*`/`{a,b,c}` pattern
//!   into a level-by-level traversal of a remote branch/leaf tree.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod remote;
pub mod types;

pub use crate::config::Config;
pub use crate::remote::{BackendConfig, RemoteNode, RemoteStore, SeriesReader};

/// Initializes logging and metrics reporting from the configuration.
///
/// # Safety
/// This modifies the process environment and may only be called in a
/// single-threaded context, before the async runtime starts.
pub unsafe fn init(config: &Config) {
    // SAFETY: guaranteed by the caller.
    unsafe { logging::init(&config.logging) };
    metrics::configure(&config.metrics);
}

// Clock source for availability and eviction timestamps. Tests run against
// the tokio clock so they can pause and advance time deterministically.
#[cfg(test)]
pub(crate) use tokio::time;

#[cfg(not(test))]
pub(crate) use std::time;
