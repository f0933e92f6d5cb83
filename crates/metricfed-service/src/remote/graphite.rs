//! Wire protocol of the flat peer store.
//!
//! Peers speak the front end's own HTTP API: `/metrics/find/` for metadata
//! discovery and `/render/` for bulk series data, both with `local=1` so a
//! peer answers from its own store instead of fanning out again.

use std::time::Duration;

use crate::caching::{FetchError, FetchResult};
use crate::types::{NodeDescriptor, Query, SeriesResult};

/// Builds the discovery URL for `query`.
///
/// Absent time bounds are omitted entirely.
pub(crate) fn find_url(host: &str, query: &Query) -> String {
    let mut params = url::form_urlencoded::Serializer::new(String::new());
    params.append_pair("local", "1");
    params.append_pair("format", "json");
    params.append_pair("query", &query.pattern);
    if let Some(start_time) = query.start_time {
        params.append_pair("from", &start_time.to_string());
    }
    if let Some(end_time) = query.end_time {
        params.append_pair("until", &end_time.to_string());
    }
    format!("http://{host}/metrics/find/?{}", params.finish())
}

/// Builds the bulk data URL for `target`.
///
/// The URL doubles as the coalescing cache key, so its parameter order must
/// stay deterministic.
pub(crate) fn render_url(host: &str, target: &str, start: i64, end: i64) -> String {
    let mut params = url::form_urlencoded::Serializer::new(String::new());
    params.append_pair("target", target);
    params.append_pair("format", "json");
    params.append_pair("local", "1");
    params.append_pair("noCache", "1");
    params.append_pair("from", &start.to_string());
    params.append_pair("until", &end.to_string());
    format!("http://{host}/render/?{}", params.finish())
}

/// Runs one discovery request against a peer.
pub(crate) async fn find(
    client: &reqwest::Client,
    host: &str,
    query: &Query,
    timeout: Duration,
) -> FetchResult<Vec<NodeDescriptor>> {
    let url = find_url(host, query);
    tracing::debug!(%url, "requesting remote find");

    let response = tokio::time::timeout(timeout, client.get(&url).send())
        .await
        .map_err(|_| FetchError::Timeout(timeout))??;
    if !response.status().is_success() {
        return Err(FetchError::Download(format!(
            "received error response {} from {url}",
            response.status()
        )));
    }

    let nodes = tokio::time::timeout(timeout, response.json())
        .await
        .map_err(|_| FetchError::Timeout(timeout))??;
    Ok(nodes)
}

/// Reads and decodes a bulk data response.
pub(crate) async fn parse_render(
    response: reqwest::Response,
    timeout: Duration,
) -> FetchResult<Vec<SeriesResult>> {
    let series = tokio::time::timeout(timeout, response.json())
        .await
        .map_err(|_| FetchError::Timeout(timeout))??;
    Ok(series)
}
