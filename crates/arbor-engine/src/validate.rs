//! Structural checks applied to every span before admission.

use arbor_config::ValidationConfig;
use arbor_core::{keys, RejectionReason, Span, SpanInput, SpanKind, SpanStatus};
use serde_json::Value;
use std::collections::BTreeMap;

/// Span validator.
#[derive(Debug, Clone, Default)]
pub struct Validator {
    config: ValidationConfig,
}

impl Validator {
    pub fn new(config: ValidationConfig) -> Self {
        Self { config }
    }

    /// Validates a submitted span.
    ///
    /// Checks run in a fixed order: required fields, numeric ranges, status,
    /// kind, metadata shape, payload size. Unknown kinds are accepted as
    /// [`SpanKind::Unknown`] with the producer's value kept under `kind_raw`.
    pub fn validate(&self, input: SpanInput) -> Result<Span, RejectionReason> {
        let id = required(input.id, "id")?;
        let trace_id = required(input.trace_id, "trace_id")?;
        let name = required(input.name, "name")?;
        let kind_raw = required(input.kind, "kind")?;
        let status_raw = required(input.status, "status")?;

        let duration = non_negative(input.duration, "duration")?;
        let start_offset = non_negative(input.start_offset, "start_offset")?;

        let status = SpanStatus::parse(&status_raw)
            .ok_or(RejectionReason::InvalidStatus { value: status_raw })?;

        let mut metadata = BTreeMap::new();
        for (key, value) in input.metadata {
            if matches!(value, Value::Array(_) | Value::Object(_)) {
                return Err(RejectionReason::MetadataNotScalar { key });
            }
            metadata.insert(key, value);
        }

        let kind = match SpanKind::parse(&kind_raw) {
            Some(kind) => kind,
            None => {
                tracing::debug!(span_id = %id, kind = %kind_raw, "Unknown span kind accepted");
                metadata.insert(keys::KIND_RAW.to_string(), Value::String(kind_raw));
                SpanKind::Unknown
            }
        };

        let bytes = payload_len(&input.inputs) + payload_len(&input.outputs);
        if bytes > self.config.max_payload_bytes {
            return Err(RejectionReason::PayloadTooLarge {
                bytes,
                limit: self.config.max_payload_bytes,
            });
        }

        Ok(Span {
            id,
            trace_id,
            parent_id: input.parent_id.filter(|p| !p.is_empty()),
            name,
            kind,
            start_offset,
            duration,
            status,
            inputs: input.inputs,
            outputs: input.outputs,
            metadata,
        })
    }
}

fn required(value: Option<String>, field: &str) -> Result<String, RejectionReason> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(RejectionReason::missing(field)),
    }
}

fn non_negative(value: Option<f64>, field: &str) -> Result<f64, RejectionReason> {
    let value = value.unwrap_or(0.0);
    if !value.is_finite() {
        return Err(RejectionReason::NonFiniteNumber {
            field: field.to_string(),
        });
    }
    if value < 0.0 {
        return Err(match field {
            "duration" => RejectionReason::NegativeDuration { value },
            _ => RejectionReason::NegativeStartOffset { value },
        });
    }
    Ok(value)
}

fn payload_len(payload: &arbor_core::Payload) -> usize {
    if payload.is_empty() {
        return 0;
    }
    serde_json::to_vec(payload).map(|v| v.len()).unwrap_or(usize::MAX)
}
