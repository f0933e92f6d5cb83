//! Remote backends and the federated fetch service.
//!
//! [`RemoteStore`] is the entry point: it resolves discovery queries against
//! configured backends (with a TTL'd payload cache and per-backend
//! availability tracking) and hands out [`SeriesReader`]s whose data fetches
//! run through the request coalescer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::caching::{Deferred, FetchCoalescer, FetchError, FetchResult, SeriesBatch};
use crate::config::Config;
use crate::types::{Interval, NodeDescriptor, Query, SeriesResult};

mod availability;
mod graphite;
mod opentsdb;
mod tree;

pub use availability::AvailabilityTracker;

/// Unique identifier of a configured backend.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Configuration of a flat peer store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphiteConfig {
    /// Unique backend identifier.
    pub id: BackendId,
    /// `host:port` of the peer.
    pub host: String,
}

/// Configuration of a tree-shaped store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenTsdbConfig {
    /// Unique backend identifier.
    pub id: BackendId,
    /// `host:port` of the store.
    pub host: String,
}

/// Configuration of a remote backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// A peer node of the same flat metrics store.
    Graphite(Arc<GraphiteConfig>),
    /// A hierarchical metrics-tree service.
    Opentsdb(Arc<OpenTsdbConfig>),
}

impl BackendConfig {
    pub fn id(&self) -> &BackendId {
        match self {
            Self::Graphite(cfg) => &cfg.id,
            Self::Opentsdb(cfg) => &cfg.id,
        }
    }

    pub fn host(&self) -> &str {
        match self {
            Self::Graphite(cfg) => &cfg.host,
            Self::Opentsdb(cfg) => &cfg.host,
        }
    }
}

/// A discovery result node, optionally fetchable.
///
/// Every node produced by this layer lives on a remote backend; a hosting
/// framework that merges these with its own store should treat them as
/// non-local.
#[derive(Debug, Clone)]
pub struct RemoteNode {
    /// Full dotted path of the node.
    pub path: String,
    /// Whether this node is a terminal metric.
    pub is_leaf: bool,
    reader: Option<SeriesReader>,
}

impl RemoteNode {
    /// The series reader for leaf nodes.
    pub fn reader(&self) -> Option<&SeriesReader> {
        self.reader.as_ref()
    }

    pub fn into_reader(self) -> Option<SeriesReader> {
        self.reader
    }
}

/// Fetches one metric's data through the shared coalescing layer.
///
/// Readers produced by the same discovery query share a bulk fetch: the flat
/// store is asked for the whole find pattern at once and every reader
/// extracts its own series from the shared batch.
#[derive(Clone)]
pub struct SeriesReader {
    store: Arc<StoreInner>,
    backend: BackendConfig,
    metric_path: String,
    bulk_query: String,
    intervals: Vec<Interval>,
}

impl SeriesReader {
    /// Data retention intervals known for this metric.
    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// The metric path this reader extracts.
    pub fn metric_path(&self) -> &str {
        &self.metric_path
    }

    /// Starts a fetch for the given time range.
    ///
    /// The request is sent (or joined, if an identical fetch is in flight)
    /// before this returns; reading and decoding the response is deferred
    /// until the returned handle is evaluated. A missing series in the
    /// shared batch yields `Ok(None)`, never another metric's data.
    pub async fn fetch(
        &self,
        start_time: i64,
        end_time: i64,
    ) -> Deferred<FetchResult<Option<SeriesResult>>> {
        let target = match &self.backend {
            BackendConfig::Graphite(_) => self.bulk_query.as_str(),
            BackendConfig::Opentsdb(_) => self.metric_path.as_str(),
        };
        let batch = self
            .store
            .fetch_batch(&self.backend, target, start_time, end_time)
            .await;

        let metric_path = self.metric_path.clone();
        batch.map(move |result| {
            result.map(|batch| {
                batch
                    .iter()
                    .find(|series| series.name == metric_path)
                    .cloned()
            })
        })
    }
}

impl fmt::Debug for SeriesReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SeriesReader")
            .field("backend", &self.backend.id())
            .field("metric_path", &self.metric_path)
            .finish_non_exhaustive()
    }
}

struct StoreInner {
    client: reqwest::Client,
    availability: AvailabilityTracker,
    coalescer: FetchCoalescer,
    find_cache: moka::sync::Cache<String, Arc<Vec<NodeDescriptor>>>,
    find_timeout: Duration,
    fetch_timeout: Duration,
    find_cache_ttl: Duration,
}

/// The federated fetch service.
///
/// Explicitly constructed from a [`Config`]; all state (HTTP client,
/// caches, availability) lives inside and is shared by the readers it hands
/// out.
pub struct RemoteStore {
    inner: Arc<StoreInner>,
    backends: Arc<[BackendConfig]>,
}

impl RemoteStore {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .context("failed to create HTTP client")?;

        let find_cache = moka::sync::Cache::builder()
            .max_capacity(config.find_cache.capacity)
            .time_to_live(config.find_cache.ttl)
            .build();

        Ok(Self {
            inner: Arc::new(StoreInner {
                client,
                availability: AvailabilityTracker::new(config.retry_delay),
                coalescer: FetchCoalescer::new(config.fetch_timeout, config.fetch_cache_size_limit),
                find_cache,
                find_timeout: config.find_timeout,
                fetch_timeout: config.fetch_timeout,
                find_cache_ttl: config.find_cache.ttl,
            }),
            backends: config.backends.clone(),
        })
    }

    /// The configured backends.
    pub fn backends(&self) -> &[BackendConfig] {
        &self.backends
    }

    /// The per-backend availability tracker.
    ///
    /// Exposed so callers that perform their own requests against a backend
    /// can record failures here as well.
    pub fn availability(&self) -> &AvailabilityTracker {
        &self.inner.availability
    }

    /// Resolves a discovery query against one backend.
    ///
    /// Never fails: any error marks the backend as failed and degrades to an
    /// empty result, so a single broken backend cannot abort aggregation
    /// across the rest. An unavailable backend is skipped without any
    /// network I/O.
    pub async fn find(&self, backend: &BackendConfig, query: &Query) -> Vec<RemoteNode> {
        let key = find_cache_key(backend.host(), query, self.inner.find_cache_ttl);

        metric!(counter("remote.find.cache.access") += 1);
        if let Some(descriptors) = self.inner.find_cache.get(&key) {
            metric!(counter("remote.find.cache.hit") += 1);
            return self.wrap(backend, query, &descriptors);
        }

        if !self.inner.availability.is_available(backend.host()) {
            metric!(counter("remote.find.blocked") += 1, "host" => backend.host());
            tracing::debug!(host = backend.host(), "skipping unavailable backend");
            return Vec::new();
        }

        let started = std::time::Instant::now();
        let fetched = match backend {
            BackendConfig::Graphite(cfg) => {
                graphite::find(&self.inner.client, &cfg.host, query, self.inner.find_timeout).await
            }
            BackendConfig::Opentsdb(cfg) => {
                let api = opentsdb::Api::new(&self.inner.client, &cfg.host, self.inner.find_timeout);
                tree::find(&api, &query.pattern).await
            }
        };
        metric!(timer("remote.find.duration") = started.elapsed(), "host" => backend.host());

        match fetched {
            Ok(descriptors) => {
                let descriptors = Arc::new(descriptors);
                self.inner.find_cache.insert(key, Arc::clone(&descriptors));
                self.wrap(backend, query, &descriptors)
            }
            Err(error) => {
                self.inner.availability.fail(backend.host());
                tracing::warn!(host = backend.host(), %error, "remote find failed");
                Vec::new()
            }
        }
    }

    fn wrap(
        &self,
        backend: &BackendConfig,
        query: &Query,
        descriptors: &[NodeDescriptor],
    ) -> Vec<RemoteNode> {
        descriptors
            .iter()
            .map(|descriptor| {
                let reader = descriptor.is_leaf.then(|| SeriesReader {
                    store: Arc::clone(&self.inner),
                    backend: backend.clone(),
                    metric_path: descriptor.metric_path.clone(),
                    bulk_query: query.pattern.clone(),
                    intervals: if descriptor.intervals.is_empty() {
                        vec![Interval::unbounded()]
                    } else {
                        descriptor.intervals.clone()
                    },
                });
                RemoteNode {
                    path: descriptor.metric_path.clone(),
                    is_leaf: descriptor.is_leaf,
                    reader,
                }
            })
            .collect()
    }
}

impl StoreInner {
    /// Runs the coalesced fetch flow for one canonical key.
    ///
    /// The send happens here, at most once per key; reading the response is
    /// wrapped into the returned deferred and races through the receive gate
    /// when evaluated.
    async fn fetch_batch(
        self: &Arc<Self>,
        backend: &BackendConfig,
        target: &str,
        start: i64,
        end: i64,
    ) -> Deferred<FetchResult<SeriesBatch>> {
        self.coalescer.maybe_evict();

        let key = match backend {
            BackendConfig::Graphite(cfg) => graphite::render_url(&cfg.host, target, start, end),
            BackendConfig::Opentsdb(cfg) => opentsdb::query_key(&cfg.host, target, start, end),
        };

        metric!(counter("fetch.cache.access") += 1);
        if let Some(batch) = self.coalescer.lookup(&key) {
            metric!(counter("fetch.cache.hit") += 1);
            return Deferred::ready(Ok(batch));
        }

        let entry = self.coalescer.entry(&key);

        if entry.try_send() {
            metric!(counter("fetch.coalesce.send") += 1);
            tracing::debug!(key = %key, "sending remote fetch");
            match self.send(backend, target, start, end).await {
                Ok(response) => entry.park_response(response),
                Err(error) => {
                    entry.complete();
                    self.availability.fail(backend.host());
                    tracing::warn!(host = backend.host(), %error, "remote fetch failed");
                    return Deferred::ready(Err(error));
                }
            }
        }

        let inner = Arc::clone(self);
        let backend = backend.clone();
        let fetch_timeout = self.fetch_timeout;
        Deferred::new(async move {
            match entry.try_receive() {
                Some(response) => {
                    let result = inner.receive(&backend, &key, response).await;
                    entry.complete();
                    result
                }
                None => {
                    entry.wait_done(fetch_timeout).await;
                    match inner.coalescer.lookup(&key) {
                        Some(batch) => Ok(batch),
                        None => Err(FetchError::NoCachedResult),
                    }
                }
            }
        })
    }

    /// Sends the bulk request and checks the response status, without
    /// reading the body.
    async fn send(
        &self,
        backend: &BackendConfig,
        target: &str,
        start: i64,
        end: i64,
    ) -> FetchResult<reqwest::Response> {
        let request = match backend {
            BackendConfig::Graphite(cfg) => self
                .client
                .get(graphite::render_url(&cfg.host, target, start, end)),
            BackendConfig::Opentsdb(cfg) => {
                opentsdb::query_request(&self.client, &cfg.host, target, start, end)
            }
        };

        let response = tokio::time::timeout(self.fetch_timeout, request.send())
            .await
            .map_err(|_| FetchError::Timeout(self.fetch_timeout))??;
        if !response.status().is_success() {
            return Err(FetchError::Download(format!(
                "received error response {} from {}",
                response.status(),
                backend.host()
            )));
        }
        Ok(response)
    }

    /// The receiver role: read, decode, cache, and report.
    async fn receive(
        &self,
        backend: &BackendConfig,
        key: &str,
        response: reqwest::Response,
    ) -> FetchResult<SeriesBatch> {
        match self.parse(backend, response).await {
            Ok(series) => {
                let batch: SeriesBatch = Arc::new(series);
                self.coalescer.store(key, Arc::clone(&batch));
                Ok(batch)
            }
            Err(error) => {
                self.availability.fail(backend.host());
                tracing::warn!(host = backend.host(), %error, "failed reading remote fetch response");
                Err(error)
            }
        }
    }

    async fn parse(
        &self,
        backend: &BackendConfig,
        response: reqwest::Response,
    ) -> FetchResult<Vec<SeriesResult>> {
        match backend {
            BackendConfig::Graphite(_) => {
                graphite::parse_render(response, self.fetch_timeout).await
            }
            BackendConfig::Opentsdb(_) => {
                let entries: Vec<opentsdb::QueryEntry> =
                    tokio::time::timeout(self.fetch_timeout, response.json())
                        .await
                        .map_err(|_| FetchError::Timeout(self.fetch_timeout))??;
                Ok(entries.into_iter().filter_map(opentsdb::normalize).collect())
            }
        }
    }
}

/// The quantized discovery cache key.
///
/// Time bounds are rounded down to TTL-sized buckets so queries issued
/// within the same window share an entry; absent bounds render as the empty
/// string.
fn find_cache_key(host: &str, query: &Query, ttl: Duration) -> String {
    let bucket_size = (ttl.as_secs() as i64).max(1);
    let bucket = |bound: Option<i64>| match bound {
        Some(ts) => (ts - ts.rem_euclid(bucket_size)).to_string(),
        None => String::new(),
    };
    format!(
        "find:{host}:{}:{}:{}",
        query.pattern,
        bucket(query.start_time),
        bucket(query.end_time)
    )
}
