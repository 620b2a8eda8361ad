//! Trace storage and query types.

use crate::span::{Span, SpanStatus};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Summed numeric metadata, keyed by metadata field name.
pub type MetricRollup = BTreeMap<String, f64>;

/// A reconstructed execution trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    /// Unique trace identifier.
    pub id: String,
    /// Display name, taken from the root span.
    pub name: String,
    /// Root span, once one has arrived or been synthesized.
    pub root_span_id: Option<String>,
    /// Unix timestamp (milliseconds) when the first span was ingested.
    pub created_at: i64,
    /// Client-reported request time (Unix milliseconds).
    pub request_time: i64,
    /// Unix timestamp (milliseconds) of the last commit.
    pub updated_at: i64,
    /// Derived status over every span of the trace.
    pub status: SpanStatus,
    /// Duration of the root span, in seconds.
    pub total_duration: f64,
    /// Number of spans in the trace.
    pub span_count: u32,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub tags: BTreeSet<String>,
    /// Assembly lifecycle state.
    pub assembly: AssemblyState,
    /// Numeric metadata summed over all spans.
    pub rollup: MetricRollup,
    /// Anomalies recorded while assembling.
    pub warnings: Vec<AssemblyAnomaly>,
}

/// Row shape returned by trace queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceSummary {
    pub id: String,
    pub name: String,
    pub status: SpanStatus,
    pub total_duration: f64,
    pub request_time: i64,
    pub user_id: Option<String>,
    pub span_count: u32,
    pub assembly: AssemblyState,
}

impl From<&TraceRecord> for TraceSummary {
    fn from(trace: &TraceRecord) -> Self {
        Self {
            id: trace.id.clone(),
            name: trace.name.clone(),
            status: trace.status,
            total_duration: trace.total_duration,
            request_time: trace.request_time,
            user_id: trace.user_id.clone(),
            span_count: trace.span_count,
            assembly: trace.assembly,
        }
    }
}

/// Assembly lifecycle of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssemblyState {
    /// Waiting for the root, missing parents, or the quiescence window.
    Assembling,
    /// Connected and settled; structure no longer changes.
    Complete,
}

impl AssemblyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssemblyState::Assembling => "assembling",
            AssemblyState::Complete => "complete",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "complete" => AssemblyState::Complete,
            _ => AssemblyState::Assembling,
        }
    }
}

/// Why a span was attached to the root instead of its declared parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    /// The declared parent never arrived before the assembly timeout.
    MissingParent,
    /// Linking to the declared parent would have closed a cycle.
    Cycle,
    /// A second span without a parent arrived after the root.
    DuplicateRoot,
}

impl DetachReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetachReason::MissingParent => "missing_parent",
            DetachReason::Cycle => "cycle",
            DetachReason::DuplicateRoot => "duplicate_root",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "missing_parent" => Some(DetachReason::MissingParent),
            "cycle" => Some(DetachReason::Cycle),
            "duplicate_root" => Some(DetachReason::DuplicateRoot),
            _ => None,
        }
    }
}

/// A structural irregularity recovered during assembly. Never drops data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AssemblyAnomaly {
    Detached {
        span_id: String,
        declared_parent: Option<String>,
        reason: DetachReason,
    },
    /// Child window extends outside its parent's window (clock disagreement).
    WindowOverrun {
        span_id: String,
        parent_id: String,
        /// Seconds outside the parent window.
        overrun: f64,
    },
    SyntheticRoot {
        span_id: String,
    },
}

/// Subtree rollup of a single span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRollup {
    /// Status over the span and all its descendants.
    pub status: SpanStatus,
    /// Numeric metadata summed over the span and all its descendants.
    pub metrics: MetricRollup,
    /// Number of descendants (excluding the span itself).
    pub descendants: u32,
}

impl NodeRollup {
    /// Rollup of a span considered on its own.
    pub fn of(span: &Span) -> Self {
        let mut metrics = MetricRollup::new();
        for (key, value) in span.metric_values() {
            *metrics.entry(key.to_string()).or_insert(0.0) += value;
        }
        Self {
            status: span.status,
            metrics,
            descendants: 0,
        }
    }

    /// Folds a child's subtree rollup into this one.
    pub fn absorb(&mut self, child: &NodeRollup) {
        self.status = self.status.combine(child.status);
        for (key, value) in &child.metrics {
            *self.metrics.entry(key.clone()).or_insert(0.0) += value;
        }
        self.descendants += child.descendants + 1;
    }
}

/// A span as persisted: content plus its place in the assembled tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    #[serde(flatten)]
    pub span: Span,
    /// Parent in the assembled tree. Differs from `parent_id` for detached spans.
    pub tree_parent_id: Option<String>,
    /// Set when the span hangs off the root instead of its declared parent.
    pub detached: Option<DetachReason>,
    /// Rollup over this span's subtree.
    pub rollup: NodeRollup,
}

impl SpanRecord {
    pub fn id(&self) -> &str {
        &self.span.id
    }
}

/// Filter for trace queries. Empty fields do not constrain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceFilter {
    /// Inclusive lower bound on `request_time` (Unix ms).
    pub from: Option<i64>,
    /// Exclusive upper bound on `request_time` (Unix ms).
    pub to: Option<i64>,
    /// Match any of these statuses.
    #[serde(default)]
    pub statuses: Vec<SpanStatus>,
    /// Case-insensitive substring of the trace name.
    pub text: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub tag: Option<String>,
    /// Only return traces whose assembly is complete.
    #[serde(default)]
    pub complete_only: bool,
}

impl TraceFilter {
    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = SpanStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    pub fn with_range(mut self, from: Option<i64>, to: Option<i64>) -> Self {
        self.from = from;
        self.to = to;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// 1-based page request. `size` falls back to the configured default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub number: u32,
    pub size: Option<u32>,
}

impl PageRequest {
    pub fn new(number: u32, size: u32) -> Self {
        Self {
            number,
            size: Some(size),
        }
    }

    pub fn first() -> Self {
        Self {
            number: 1,
            size: None,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::first()
    }
}

/// One page of query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPage<T> {
    pub items: Vec<T>,
    pub total_count: u64,
    pub has_next: bool,
    pub page: u32,
    pub page_size: u32,
}
