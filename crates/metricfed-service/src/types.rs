//! Core data types exchanged with remote backends and the hosting framework.

use serde::{Deserialize, Serialize};

/// A metadata discovery query as issued by the hosting front end.
///
/// Immutable once constructed; the optional time bounds narrow discovery to
/// metrics that have data in the given window.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Query {
    /// Dotted metric pattern, possibly containing `*` and `{a,b,c}` segments.
    pub pattern: String,
    /// Optional lower time bound (unix seconds).
    pub start_time: Option<i64>,
    /// Optional upper time bound (unix seconds).
    pub end_time: Option<i64>,
}

impl Query {
    /// Creates a query without time bounds.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            start_time: None,
            end_time: None,
        }
    }

    /// Restricts the query to the given time window.
    pub fn with_range(mut self, start_time: i64, end_time: i64) -> Self {
        self.start_time = Some(start_time);
        self.end_time = Some(end_time);
        self
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.pattern)
    }
}

/// A closed time interval attached to leaf metadata, serialized as
/// `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval(pub f64, pub f64);

impl Interval {
    /// The interval covering all of time, reported by backends that do not
    /// track retention per metric.
    pub fn unbounded() -> Self {
        Interval(f64::NEG_INFINITY, f64::INFINITY)
    }
}

/// A node produced by metadata discovery.
///
/// Immutable; consumed by the hosting framework to build its tree nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Full dotted path of the node.
    pub metric_path: String,
    /// Whether the node is a terminal (fetchable) metric.
    #[serde(rename = "isLeaf", default)]
    pub is_leaf: bool,
    /// Data retention intervals, present for leaves of backends that track
    /// them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub intervals: Vec<Interval>,
}

impl NodeDescriptor {
    /// Creates a branch (non-leaf) descriptor.
    pub fn branch(metric_path: impl Into<String>) -> Self {
        Self {
            metric_path: metric_path.into(),
            is_leaf: false,
            intervals: Vec::new(),
        }
    }

    /// Creates a leaf descriptor without interval metadata.
    pub fn leaf(metric_path: impl Into<String>) -> Self {
        Self {
            metric_path: metric_path.into(),
            is_leaf: true,
            intervals: Vec::new(),
        }
    }
}

/// One time series extracted from a bulk fetch response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesResult {
    /// Metric path the series belongs to.
    pub name: String,
    /// Timestamp of the first point (unix seconds).
    pub start: i64,
    /// Timestamp of the last point (unix seconds).
    pub end: i64,
    /// Seconds between consecutive points.
    pub step: i64,
    /// Point values in time order; `None` marks a gap.
    pub values: Vec<Option<f64>>,
}
