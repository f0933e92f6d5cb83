//! Wire protocol of the tree-shaped store.
//!
//! Metadata lives in a branch/leaf tree queried one branch at a time via
//! `/api/tree/branch`; series data comes from `/api/query` as a sparse
//! timestamp map that gets normalized into an evenly-stepped series.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::caching::{FetchError, FetchResult};
use crate::types::SeriesResult;

/// Branch id of the tree root.
pub(crate) const ROOT_BRANCH_ID: &str = "0001";

/// One branch of the metrics tree, as returned by `/api/tree/branch`.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Branch {
    #[serde(default)]
    pub branches: Option<Vec<BranchRef>>,
    #[serde(default)]
    pub leaves: Option<Vec<Leaf>>,
}

impl Branch {
    pub fn branches(&self) -> &[BranchRef] {
        self.branches.as_deref().unwrap_or_default()
    }

    pub fn leaves(&self) -> &[Leaf] {
        self.leaves.as_deref().unwrap_or_default()
    }
}

/// An unresolved reference to a child branch.
///
/// `path` maps depth (as a decimal string) to the segment name at that
/// depth; depth 0 is the root and not part of any metric path.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct BranchRef {
    #[serde(rename = "branchId")]
    pub branch_id: String,
    #[serde(default)]
    pub path: HashMap<String, String>,
    #[serde(default)]
    pub depth: u32,
}

impl BranchRef {
    /// The branch's own segment name, i.e. the path entry at its depth.
    pub fn name(&self) -> &str {
        self.path
            .get(&self.depth.to_string())
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Rebuilds the dotted metric path from the stored per-depth segments,
    /// skipping the depth-0 root.
    pub fn dotted_path(&self) -> String {
        let mut segments: Vec<(u32, &str)> = self
            .path
            .iter()
            .filter_map(|(depth, name)| Some((depth.parse().ok()?, name.as_str())))
            .filter(|(depth, _)| *depth >= 1)
            .collect();
        segments.sort_unstable_by_key(|(depth, _)| *depth);
        segments
            .into_iter()
            .map(|(_, name)| name)
            .collect::<Vec<_>>()
            .join(".")
    }
}

/// A terminal metric in the tree.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Leaf {
    pub metric: String,
    #[serde(rename = "displayName", default)]
    pub display_name: String,
}

/// One series of a `/api/query` response.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct QueryEntry {
    pub metric: String,
    #[serde(default)]
    pub dps: HashMap<String, f64>,
}

/// Thin client for the tree store's HTTP API.
pub(crate) struct Api<'a> {
    client: &'a reqwest::Client,
    host: &'a str,
    timeout: Duration,
}

impl<'a> Api<'a> {
    pub fn new(client: &'a reqwest::Client, host: &'a str, timeout: Duration) -> Self {
        Self {
            client,
            host,
            timeout,
        }
    }

    /// Looks up one branch by id.
    pub async fn branch(&self, branch_id: &str) -> FetchResult<Branch> {
        let url = format!("http://{}/api/tree/branch?branch={branch_id}", self.host);
        tracing::debug!(%url, "requesting tree branch");
        metric!(counter("remote.tree.branch.lookup") += 1);

        let response = tokio::time::timeout(self.timeout, self.client.get(&url).send())
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;
        if !response.status().is_success() {
            return Err(FetchError::Download(format!(
                "received error response {} from {url}",
                response.status()
            )));
        }

        let branch = tokio::time::timeout(self.timeout, response.json())
            .await
            .map_err(|_| FetchError::Timeout(self.timeout))??;
        Ok(branch)
    }
}

/// The canonical coalescing key for a series query.
///
/// The actual request is a POST; this URL-shaped key stands in for it in the
/// coalescing table and must be deterministic.
pub(crate) fn query_key(host: &str, metric: &str, start: i64, end: i64) -> String {
    format!("http://{host}/api/query?start={start}&end={end}&m={metric}")
}

/// Builds the `/api/query` POST request for one metric.
pub(crate) fn query_request(
    client: &reqwest::Client,
    host: &str,
    metric: &str,
    start: i64,
    end: i64,
) -> reqwest::RequestBuilder {
    let body = json!({
        "start": start,
        "end": end,
        "queries": [
            {
                "aggregator": "avg",
                "metric": metric,
                "rate": "false",
                "tags": null,
                "downsample": "1m-avg"
            }
        ]
    });
    client.post(format!("http://{host}/api/query")).json(&body)
}

/// Turns a sparse timestamp map into an evenly-stepped series.
///
/// Points are ordered by numeric timestamp; the step is the span divided by
/// the gap count, so a single point gets step 0. Entries without any points
/// are dropped.
pub(crate) fn normalize(entry: QueryEntry) -> Option<SeriesResult> {
    let mut points: Vec<(i64, f64)> = entry
        .dps
        .iter()
        .filter_map(|(ts, value)| Some((ts.parse().ok()?, *value)))
        .collect();
    if points.is_empty() {
        return None;
    }
    points.sort_unstable_by_key(|(ts, _)| *ts);

    let start = points[0].0;
    let end = points[points.len() - 1].0;
    let step = match points.len() {
        1 => 0,
        n => (end - start) / (n as i64 - 1),
    };

    Some(SeriesResult {
        name: entry.metric,
        start,
        end,
        step,
        values: points.into_iter().map(|(_, value)| Some(value)).collect(),
    })
}
