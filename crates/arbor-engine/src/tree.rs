//! Lazy reads of an assembled trace: one node, or a bounded subtree.

use arbor_core::{
    DetachReason, NodeRollup, SpanKind, SpanRecord, SpanStatus, TraceError, TraceRecord,
};
use arbor_store::TraceStore;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Deepest subtree served in one read.
pub const MAX_SUBTREE_DEPTH: u32 = 64;

/// A span with summaries of its direct children.
#[derive(Debug, Clone, Serialize)]
pub struct SpanNode {
    pub span: SpanRecord,
    pub child_count: u32,
    pub children: Vec<ChildSummary>,
}

/// Enough of a child span to render it collapsed.
#[derive(Debug, Clone, Serialize)]
pub struct ChildSummary {
    pub id: String,
    pub name: String,
    pub kind: SpanKind,
    pub status: SpanStatus,
    pub start_offset: f64,
    pub duration: f64,
    pub detached: Option<DetachReason>,
    pub rollup: NodeRollup,
    /// Number of the child's own direct children.
    pub child_count: u32,
}

impl ChildSummary {
    fn new(record: SpanRecord, child_count: u32) -> Self {
        Self {
            id: record.span.id,
            name: record.span.name,
            kind: record.span.kind,
            status: record.span.status,
            start_offset: record.span.start_offset,
            duration: record.span.duration,
            detached: record.detached,
            rollup: record.rollup,
            child_count,
        }
    }
}

/// A span and its descendants down to a depth limit.
#[derive(Debug, Clone, Serialize)]
pub struct SpanTree {
    #[serde(flatten)]
    pub record: SpanRecord,
    pub child_count: u32,
    /// Children exist below the depth limit but were not included.
    pub truncated: bool,
    pub children: Vec<SpanTree>,
}

/// Read access to stored traces and their span trees.
#[derive(Clone)]
pub struct TreeReader {
    store: Arc<TraceStore>,
}

impl TreeReader {
    pub fn new(store: Arc<TraceStore>) -> Self {
        Self { store }
    }

    pub fn get_trace(&self, trace_id: &str) -> Result<TraceRecord, TraceError> {
        self.store
            .get_trace(trace_id)?
            .ok_or_else(|| TraceError::TraceNotFound(trace_id.to_string()))
    }

    /// All spans of a trace, ordered by start offset.
    pub fn get_spans(&self, trace_id: &str) -> Result<Vec<SpanRecord>, TraceError> {
        let (_, spans) = self
            .store
            .get_trace_tree(trace_id)?
            .ok_or_else(|| TraceError::TraceNotFound(trace_id.to_string()))?;
        Ok(spans)
    }

    pub fn get_span(&self, trace_id: &str, span_id: &str) -> Result<SpanRecord, TraceError> {
        match self.store.get_span(trace_id, span_id)? {
            Some(span) => Ok(span),
            None => Err(self.not_found(trace_id, span_id)),
        }
    }

    /// A span plus its direct children, without loading deeper levels.
    pub fn get_node(&self, trace_id: &str, span_id: &str) -> Result<SpanNode, TraceError> {
        let snapshot = match self.store.get_node(trace_id, span_id)? {
            Some(snapshot) => snapshot,
            None => return Err(self.not_found(trace_id, span_id)),
        };
        Ok(SpanNode {
            span: snapshot.span,
            child_count: snapshot.children.len() as u32,
            children: snapshot
                .children
                .into_iter()
                .map(|(record, count)| ChildSummary::new(record, count))
                .collect(),
        })
    }

    /// The root node of a trace. Fails with `SpanNotFound` while the root is absent.
    pub fn get_root(&self, trace_id: &str) -> Result<SpanNode, TraceError> {
        let trace = self.get_trace(trace_id)?;
        let root = trace.root_span_id.ok_or_else(|| TraceError::SpanNotFound {
            trace_id: trace_id.to_string(),
            span_id: "(root)".to_string(),
        })?;
        self.get_node(trace_id, &root)
    }

    /// The subtree under a span, `max_depth` levels deep (0 = the span alone).
    pub fn get_subtree(
        &self,
        trace_id: &str,
        span_id: &str,
        max_depth: u32,
    ) -> Result<SpanTree, TraceError> {
        let spans = self.get_spans(trace_id)?;
        let mut children: HashMap<&str, Vec<&SpanRecord>> = HashMap::new();
        let mut target = None;
        for record in &spans {
            if record.id() == span_id {
                target = Some(record);
            }
            if let Some(parent) = record.tree_parent_id.as_deref() {
                children.entry(parent).or_default().push(record);
            }
        }
        let target = target.ok_or_else(|| TraceError::SpanNotFound {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
        })?;

        Ok(build(target, &children, max_depth.min(MAX_SUBTREE_DEPTH)))
    }

    fn not_found(&self, trace_id: &str, span_id: &str) -> TraceError {
        match self.store.trace_exists(trace_id) {
            Ok(false) => TraceError::TraceNotFound(trace_id.to_string()),
            Ok(true) => TraceError::SpanNotFound {
                trace_id: trace_id.to_string(),
                span_id: span_id.to_string(),
            },
            Err(e) => e.into(),
        }
    }
}

fn build(record: &SpanRecord, children: &HashMap<&str, Vec<&SpanRecord>>, depth: u32) -> SpanTree {
    let kids = children.get(record.id()).map(Vec::as_slice).unwrap_or(&[]);
    let (nested, truncated) = if depth == 0 {
        (Vec::new(), !kids.is_empty())
    } else {
        let nested = kids
            .iter()
            .map(|kid| build(kid, children, depth - 1))
            .collect();
        (nested, false)
    };
    SpanTree {
        record: record.clone(),
        child_count: kids.len() as u32,
        truncated,
        children: nested,
    }
}
