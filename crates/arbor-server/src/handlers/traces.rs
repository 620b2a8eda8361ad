//! Trace query and tree API handlers.

use std::sync::Arc;

use arbor_core::{QueryPage, SpanRecord, TraceRecord, TraceSummary};
use arbor_engine::{SpanNode, SpanTree};
use arbor_store::MetricsSummary;
use axum::extract::{Path, Query, State};
use axum::Json;

use crate::dto::{ListTracesQuery, SubtreeQuery};
use crate::error::AppError;
use crate::ServerState;

const DEFAULT_SUBTREE_DEPTH: u32 = 3;

/// GET /api/traces - List traces with filtering and pagination.
pub async fn list(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<ListTracesQuery>,
) -> Result<Json<QueryPage<TraceSummary>>, AppError> {
    let (filter, page) = params.into_parts()?;
    let page = state.engine.queries.query(filter, page).await?;
    Ok(Json(page))
}

/// GET /api/traces/{id} - Get a single trace record.
pub async fn get(
    State(state): State<Arc<ServerState>>,
    Path(trace_id): Path<String>,
) -> Result<Json<TraceRecord>, AppError> {
    Ok(Json(state.engine.trees.get_trace(&trace_id)?))
}

/// GET /api/traces/{id}/spans - All spans of a trace, ordered by start offset.
pub async fn spans(
    State(state): State<Arc<ServerState>>,
    Path(trace_id): Path<String>,
) -> Result<Json<Vec<SpanRecord>>, AppError> {
    Ok(Json(state.engine.trees.get_spans(&trace_id)?))
}

/// GET /api/traces/{id}/root - The root span with its direct children.
pub async fn root(
    State(state): State<Arc<ServerState>>,
    Path(trace_id): Path<String>,
) -> Result<Json<SpanNode>, AppError> {
    Ok(Json(state.engine.trees.get_root(&trace_id)?))
}

/// GET /api/traces/{id}/spans/{span_id} - A span with its direct children.
pub async fn node(
    State(state): State<Arc<ServerState>>,
    Path((trace_id, span_id)): Path<(String, String)>,
) -> Result<Json<SpanNode>, AppError> {
    Ok(Json(state.engine.trees.get_node(&trace_id, &span_id)?))
}

/// GET /api/traces/{id}/spans/{span_id}/subtree - Bounded-depth subtree.
pub async fn subtree(
    State(state): State<Arc<ServerState>>,
    Path((trace_id, span_id)): Path<(String, String)>,
    Query(params): Query<SubtreeQuery>,
) -> Result<Json<SpanTree>, AppError> {
    let depth = params.max_depth.unwrap_or(DEFAULT_SUBTREE_DEPTH);
    Ok(Json(state.engine.trees.get_subtree(&trace_id, &span_id, depth)?))
}

/// GET /api/metrics/summary - Get aggregate metrics.
pub async fn metrics_summary(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<MetricsSummary>, AppError> {
    let summary = state.engine.store.get_metrics_summary().map_err(|e| {
        tracing::error!("Failed to get metrics summary: {}", e);
        AppError::from(e)
    })?;

    Ok(Json(summary))
}
