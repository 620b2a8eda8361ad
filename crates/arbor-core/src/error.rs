//! Error taxonomy shared across arbor crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, TraceError>;

/// Errors surfaced to ingestion and read-path callers.
///
/// Assembly anomalies are not errors: they are recorded on the trace as
/// [`AssemblyAnomaly`](crate::AssemblyAnomaly) and the span is still admitted.
#[derive(Error, Debug)]
pub enum TraceError {
    /// A span failed validation. Reported per span, never fatal to a batch.
    #[error("span rejected: {0}")]
    ValidationRejection(RejectionReason),

    #[error("trace not found: {0}")]
    TraceNotFound(String),

    #[error("span {span_id} not found in trace {trace_id}")]
    SpanNotFound { trace_id: String, span_id: String },

    /// Transient backend failure. Safe to retry.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// Query exceeded its execution budget. Retry with a narrower filter.
    #[error("query exceeded its {0} ms budget")]
    QueryTimeout(u64),

    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// The caller abandoned the request.
    #[error("request cancelled")]
    Cancelled,
}

impl TraceError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            TraceError::ValidationRejection(_) => "validation_rejection",
            TraceError::TraceNotFound(_) | TraceError::SpanNotFound { .. } => "not_found",
            TraceError::StoreUnavailable(_) => "store_unavailable",
            TraceError::QueryTimeout(_) => "query_timeout",
            TraceError::InvalidQuery(_) => "invalid_query",
            TraceError::Cancelled => "cancelled",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TraceError::TraceNotFound(_) | TraceError::SpanNotFound { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TraceError::StoreUnavailable(_) | TraceError::QueryTimeout(_) | TraceError::Cancelled
        )
    }
}

/// Why a span was refused at admission.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum RejectionReason {
    #[error("missing required field `{field}`")]
    MissingField { field: String },

    #[error("duration must be >= 0, got {value}")]
    NegativeDuration { value: f64 },

    #[error("start_offset must be >= 0, got {value}")]
    NegativeStartOffset { value: f64 },

    #[error("`{field}` is not a finite number")]
    NonFiniteNumber { field: String },

    #[error("invalid status `{value}`")]
    InvalidStatus { value: String },

    #[error("metadata `{key}` is not a scalar")]
    MetadataNotScalar { key: String },

    #[error("inputs/outputs are {bytes} bytes, limit is {limit}")]
    PayloadTooLarge { bytes: usize, limit: usize },

    #[error("span id appears more than once in the batch")]
    DuplicateInBatch,

    #[error("span id already belongs to trace {owner}")]
    SpanIdConflict { owner: String },
}

impl RejectionReason {
    pub fn missing(field: &str) -> Self {
        RejectionReason::MissingField {
            field: field.to_string(),
        }
    }

    /// Stable reason code, matching the serialized `code` tag.
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::MissingField { .. } => "missing_field",
            RejectionReason::NegativeDuration { .. } => "negative_duration",
            RejectionReason::NegativeStartOffset { .. } => "negative_start_offset",
            RejectionReason::NonFiniteNumber { .. } => "non_finite_number",
            RejectionReason::InvalidStatus { .. } => "invalid_status",
            RejectionReason::MetadataNotScalar { .. } => "metadata_not_scalar",
            RejectionReason::PayloadTooLarge { .. } => "payload_too_large",
            RejectionReason::DuplicateInBatch => "duplicate_in_batch",
            RejectionReason::SpanIdConflict { .. } => "span_id_conflict",
        }
    }
}

impl From<RejectionReason> for TraceError {
    fn from(reason: RejectionReason) -> Self {
        TraceError::ValidationRejection(reason)
    }
}
