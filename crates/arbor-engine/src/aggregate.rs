//! Bottom-up rollups over an assembled span tree.

use arbor_core::{MetricRollup, NodeRollup, Span, SpanStatus};
use std::collections::HashMap;

/// Borrowed shape of a trace: which spans hang under which.
#[derive(Debug)]
pub struct TreeView<'a> {
    /// The trace root, if one exists.
    pub root: Option<&'a str>,
    /// Tops of every fragment: the root first, then spans still waiting on a parent.
    pub tops: Vec<&'a str>,
    pub spans: &'a HashMap<String, Span>,
    /// Children per span, ordered by start offset then id.
    pub children: HashMap<&'a str, Vec<&'a str>>,
}

impl TreeView<'_> {
    pub fn children_of(&self, id: &str) -> &[&str] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Aggregated values for a whole trace plus every subtree.
#[derive(Debug, Clone)]
pub struct TraceRollup {
    pub status: SpanStatus,
    /// Root span duration, in seconds. Zero until a root exists.
    pub total_duration: f64,
    pub span_count: u32,
    pub metrics: MetricRollup,
    /// Subtree rollup per span id.
    pub nodes: HashMap<String, NodeRollup>,
}

/// Computes rollups with an iterative post-order walk.
///
/// Each span's own metrics are counted once, at its own node, and reach its
/// ancestors only through the child's subtree rollup. Spans still waiting on a
/// parent form fragments that count toward the trace totals.
pub fn aggregate(view: &TreeView<'_>) -> TraceRollup {
    let mut nodes: HashMap<String, NodeRollup> = HashMap::with_capacity(view.spans.len());
    let mut stack: Vec<(&str, bool)> = view.tops.iter().rev().map(|id| (*id, false)).collect();

    while let Some((id, expanded)) = stack.pop() {
        if nodes.contains_key(id) {
            continue;
        }
        let Some(span) = view.spans.get(id) else {
            continue;
        };

        if !expanded {
            stack.push((id, true));
            for child in view.children_of(id).iter().rev() {
                stack.push((*child, false));
            }
            continue;
        }

        let mut rollup = NodeRollup::of(span);
        for child in view.children_of(id) {
            if let Some(child_rollup) = nodes.get(*child) {
                rollup.absorb(child_rollup);
            }
        }
        nodes.insert(id.to_string(), rollup);
    }

    let mut status = SpanStatus::Success;
    let mut metrics = MetricRollup::new();
    for top in &view.tops {
        if let Some(rollup) = nodes.get(*top) {
            status = status.combine(rollup.status);
            for (key, value) in &rollup.metrics {
                *metrics.entry(key.clone()).or_insert(0.0) += value;
            }
        }
    }

    let total_duration = view
        .root
        .and_then(|root| view.spans.get(root))
        .map(|span| span.duration)
        .unwrap_or(0.0);

    TraceRollup {
        status,
        total_duration,
        span_count: view.spans.len() as u32,
        metrics,
        nodes,
    }
}
