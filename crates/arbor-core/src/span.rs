//! Span types as produced by instrumented agent pipelines.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Ordered mapping of string keys to arbitrary structured values.
pub type Payload = Map<String, Value>;

/// Metadata keys with a reserved meaning.
pub mod keys {
    /// Set to `true` on spans attached to the root without their declared parent.
    pub const DETACHED: &str = "detached";
    /// Why a span was detached (`missing_parent`, `cycle`, `duplicate_root`).
    pub const DETACHED_REASON: &str = "detached_reason";
    /// Set to `true` on a root span synthesized by the assembler.
    pub const SYNTHETIC: &str = "synthetic";
    /// Producer-supplied kind when it was not recognized.
    pub const KIND_RAW: &str = "kind_raw";
    pub const USER_ID: &str = "user_id";
    pub const SESSION_ID: &str = "session_id";
    /// Client-reported request time, Unix milliseconds.
    pub const REQUEST_TIME: &str = "request_time";
    /// Comma separated trace tags.
    pub const TAGS: &str = "tags";

    /// Keys never summed into numeric rollups.
    pub const NON_METRIC: &[&str] = &[USER_ID, SESSION_ID, REQUEST_TIME, "start_offset", "duration"];

    /// Keys written by the assembler rather than the producer.
    pub const ASSEMBLY: &[&str] = &[DETACHED, DETACHED_REASON];
}

/// Kind of work a span represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanKind {
    System,
    Layer,
    Llm,
    Tool,
    Retriever,
    Memory,
    Step,
    /// Kind not known to this version; the producer's value is kept in metadata.
    Unknown,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::System => "system",
            SpanKind::Layer => "layer",
            SpanKind::Llm => "llm",
            SpanKind::Tool => "tool",
            SpanKind::Retriever => "retriever",
            SpanKind::Memory => "memory",
            SpanKind::Step => "step",
            SpanKind::Unknown => "unknown",
        }
    }

    /// Parses a known kind. Returns `None` for anything else, including "unknown".
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "system" => Some(SpanKind::System),
            "layer" => Some(SpanKind::Layer),
            "llm" => Some(SpanKind::Llm),
            "tool" => Some(SpanKind::Tool),
            "retriever" => Some(SpanKind::Retriever),
            "memory" => Some(SpanKind::Memory),
            "step" => Some(SpanKind::Step),
            _ => None,
        }
    }

    /// Decodes a stored kind, mapping unrecognized values to `Unknown`.
    pub fn from_stored(s: &str) -> Self {
        Self::parse(s).unwrap_or(SpanKind::Unknown)
    }
}

/// Execution status of a span or trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Success,
    Error,
    Pending,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Success => "success",
            SpanStatus::Error => "error",
            SpanStatus::Pending => "pending",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(SpanStatus::Success),
            "error" => Some(SpanStatus::Error),
            "pending" => Some(SpanStatus::Pending),
            _ => None,
        }
    }

    /// Combines two statuses: errors dominate pending, pending dominates success.
    pub fn combine(self, other: SpanStatus) -> SpanStatus {
        if self.rank() >= other.rank() {
            self
        } else {
            other
        }
    }

    fn rank(self) -> u8 {
        match self {
            SpanStatus::Success => 0,
            SpanStatus::Pending => 1,
            SpanStatus::Error => 2,
        }
    }
}

/// A span as submitted at the ingestion boundary, before validation.
///
/// Every field is optional so malformed spans can be reported per-span
/// instead of failing deserialization of the whole batch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpanInput {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub start_offset: Option<f64>,
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub inputs: Payload,
    #[serde(default)]
    pub outputs: Payload,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A validated span: a single timed unit of execution within a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Unique span identifier.
    pub id: String,
    /// Owning trace identifier.
    pub trace_id: String,
    /// Declared parent span; `None` only for a root span.
    #[serde(default)]
    pub parent_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    /// Seconds since trace start.
    pub start_offset: f64,
    /// Seconds.
    pub duration: f64,
    pub status: SpanStatus,
    #[serde(default)]
    pub inputs: Payload,
    #[serde(default)]
    pub outputs: Payload,
    /// Scalar metadata (strings, numbers, booleans, null).
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Span {
    /// End of the span window, in seconds since trace start.
    pub fn window_end(&self) -> f64 {
        self.start_offset + self.duration
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Finite numeric metadata values that take part in rollups.
    pub fn metric_values(&self) -> impl Iterator<Item = (&str, f64)> {
        self.metadata.iter().filter_map(|(k, v)| {
            if keys::NON_METRIC.contains(&k.as_str()) {
                return None;
            }
            let n = v.as_f64()?;
            n.is_finite().then_some((k.as_str(), n))
        })
    }

    /// Returns a metadata value as a string, if it is one.
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Returns an identifier-like metadata value, rendering numbers as text.
    pub fn meta_id(&self, key: &str) -> Option<String> {
        match self.metadata.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Returns a metadata value as an integer, accepting numeric strings.
    pub fn meta_i64(&self, key: &str) -> Option<i64> {
        match self.metadata.get(key)? {
            Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}
