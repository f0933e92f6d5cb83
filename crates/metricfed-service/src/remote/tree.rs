//! Pattern traversal over the tree store's branch/leaf hierarchy.
//!
//! A dotted pattern like `sys.{cpu,mem}.*` is compiled into one matcher per
//! segment and walked level by level from the root branch. Each matched
//! child branch costs one branch lookup; nothing is batched.

use crate::caching::FetchResult;
use crate::remote::opentsdb::{Api, Branch, Leaf, ROOT_BRANCH_ID};
use crate::types::NodeDescriptor;

/// Matcher for a single dotted-path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SegmentMatcher {
    /// A bare `*`, matching any name.
    Any,
    /// An exact name.
    Literal(String),
    /// A `{a,b,c}` alternation of exact names.
    Alternation(Vec<String>),
}

impl SegmentMatcher {
    fn compile(segment: &str) -> Self {
        if segment == "*" {
            return Self::Any;
        }
        if let Some(alternation) = segment
            .strip_prefix('{')
            .and_then(|rest| rest.strip_suffix('}'))
        {
            return Self::Alternation(alternation.split(',').map(str::to_owned).collect());
        }
        Self::Literal(segment.to_owned())
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Literal(literal) => literal == name,
            Self::Alternation(alternatives) => alternatives.iter().any(|a| a == name),
        }
    }
}

/// Compiles a dotted pattern into per-segment matchers.
///
/// Empty segments are dropped, and so is a trailing bare `*`: the result of
/// a traversal is always the children of the matched branches, so `a.*`
/// and `a` name the same result set.
fn compile_pattern(pattern: &str) -> Vec<SegmentMatcher> {
    let mut segments: Vec<&str> = pattern.split('.').filter(|s| !s.is_empty()).collect();
    if segments.last() == Some(&"*") {
        segments.pop();
    }
    segments.iter().map(|s| SegmentMatcher::compile(s)).collect()
}

/// Resolves `pattern` against the remote tree.
///
/// Matched branches form the next traversal frontier; leaves only count at
/// the final segment. After the last segment, every frontier branch
/// contributes its direct children. A pattern that matches nothing yields an
/// empty result, not an error.
pub(crate) async fn find(api: &Api<'_>, pattern: &str) -> FetchResult<Vec<NodeDescriptor>> {
    metric!(counter("remote.tree.find") += 1);
    let matchers = compile_pattern(pattern);

    let root = api.branch(ROOT_BRANCH_ID).await?;
    let mut frontier = vec![root];
    let mut matched_leaves: Vec<Leaf> = Vec::new();

    for (index, matcher) in matchers.iter().enumerate() {
        let is_final = index + 1 == matchers.len();
        let mut next: Vec<Branch> = Vec::new();

        for branch in &frontier {
            for child in branch.branches() {
                if matcher.matches(child.name()) {
                    next.push(api.branch(&child.branch_id).await?);
                }
            }
            if is_final {
                for leaf in branch.leaves() {
                    if matcher.matches(&leaf.display_name) {
                        matched_leaves.push(leaf.clone());
                    }
                }
            }
        }

        if next.is_empty() && matched_leaves.is_empty() {
            return Ok(Vec::new());
        }
        frontier = next;
    }

    let mut result = Vec::new();
    for branch in &frontier {
        for child in branch.branches() {
            result.push(NodeDescriptor::branch(child.dotted_path()));
        }
        for leaf in branch.leaves() {
            result.push(NodeDescriptor::leaf(leaf.metric.clone()));
        }
    }
    for leaf in matched_leaves {
        result.push(NodeDescriptor::leaf(leaf.metric));
    }

    Ok(result)
}
