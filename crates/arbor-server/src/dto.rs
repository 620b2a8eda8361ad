//! Request and response bodies for the HTTP API.

use arbor_core::{PageRequest, SpanInput, SpanStatus, TraceFilter};
use arbor_engine::IngestReport;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Body of `POST /api/spans`.
#[derive(Debug, Deserialize)]
pub struct IngestRequest {
    pub spans: Vec<SpanInput>,
}

#[derive(Debug, Default, Deserialize)]
pub struct IngestParams {
    /// Wait until touched traces are committed before replying.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Serialize)]
pub struct IngestResponse {
    #[serde(flatten)]
    pub report: IngestReport,
    /// True when the reply was sent after the commit.
    pub committed: bool,
}

/// Query parameters for listing traces.
#[derive(Debug, Default, Deserialize)]
pub struct ListTracesQuery {
    pub from: Option<i64>,
    pub to: Option<i64>,
    /// Comma-separated statuses.
    pub status: Option<String>,
    /// Case-insensitive substring of the trace name.
    pub q: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub tag: Option<String>,
    #[serde(default)]
    pub complete_only: bool,
    pub page: Option<u32>,
    pub page_size: Option<u32>,
}

impl ListTracesQuery {
    pub fn into_parts(self) -> Result<(TraceFilter, PageRequest), AppError> {
        let statuses = match self.status.as_deref() {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    SpanStatus::parse(s)
                        .ok_or_else(|| AppError::bad_request(format!("unknown status `{s}`")))
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => Vec::new(),
        };

        let filter = TraceFilter {
            from: self.from,
            to: self.to,
            statuses,
            text: self.q.filter(|q| !q.is_empty()),
            user_id: self.user_id,
            session_id: self.session_id,
            tag: self.tag,
            complete_only: self.complete_only,
        };
        let page = PageRequest {
            number: self.page.unwrap_or(1),
            size: self.page_size,
        };
        Ok((filter, page))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SubtreeQuery {
    pub max_depth: Option<u32>,
}
