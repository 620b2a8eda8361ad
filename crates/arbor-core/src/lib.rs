//! Core domain types and error definitions for arbor.
//!
//! This crate provides the types shared across the arbor workspace:
//!
//! - [`Span`], [`SpanInput`], [`SpanKind`] and [`SpanStatus`]: execution spans
//! - [`TraceRecord`] and [`TraceSummary`]: reconstructed traces
//! - [`SpanRecord`] and [`NodeRollup`]: stored spans with their subtree rollup
//! - [`TraceFilter`], [`PageRequest`] and [`QueryPage`]: query contract
//! - [`TraceError`] and [`RejectionReason`]: error taxonomy
//!
//! # Example
//!
//! ```rust
//! use arbor_core::{SpanStatus, SpanKind};
//!
//! assert_eq!(SpanStatus::Pending.combine(SpanStatus::Error), SpanStatus::Error);
//! assert_eq!(SpanKind::parse("llm"), Some(SpanKind::Llm));
//! ```

mod error;
mod span;
mod trace;

pub use error::{RejectionReason, Result, TraceError};
pub use span::{keys, Payload, Span, SpanInput, SpanKind, SpanStatus};
pub use trace::{
    AssemblyAnomaly, AssemblyState, DetachReason, MetricRollup, NodeRollup, PageRequest, QueryPage,
    SpanRecord, TraceFilter, TraceRecord, TraceSummary,
};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as Unix milliseconds.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
