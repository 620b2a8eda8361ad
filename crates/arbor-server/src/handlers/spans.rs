//! Span ingestion handler.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::Json;

use crate::dto::{IngestParams, IngestRequest, IngestResponse};
use crate::error::AppError;
use crate::ServerState;

/// POST /api/spans - Validate and admit a batch of spans.
///
/// Rejected spans are reported per span; the call only fails as a whole
/// when the store is unavailable.
pub async fn ingest(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<IngestParams>,
    Json(body): Json<IngestRequest>,
) -> Result<Json<IngestResponse>, AppError> {
    // Admission reads the store, so it runs on the blocking pool.
    let ingestor = state.engine.ingestor.clone();
    let report = tokio::task::spawn_blocking(move || ingestor.ingest(body.spans))
        .await
        .map_err(|e| AppError::Internal(format!("ingest task failed: {e}")))??;

    if params.wait {
        state.engine.ingestor.sync_all(&report.trace_ids()).await?;
    }

    Ok(Json(IngestResponse {
        report,
        committed: params.wait,
    }))
}
