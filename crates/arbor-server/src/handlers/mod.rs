//! HTTP route handlers for the arbor server.

pub mod spans;
pub mod traces;

use std::sync::Arc;

use axum::extract::State;

use crate::error::AppError;
use crate::ServerState;

/// Health check endpoint. Fails with 503 when the store is unreachable.
pub async fn health(State(state): State<Arc<ServerState>>) -> Result<&'static str, AppError> {
    state.engine.store.ping()?;
    Ok("OK")
}
