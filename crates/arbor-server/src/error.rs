//! Application error types and Axum response conversion.

use arbor_core::TraceError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application-level errors with HTTP status code mapping.
#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    BadRequest { code: &'static str, message: String },
    Unavailable(String),
    Timeout(String),
    Internal(String),
}

impl AppError {
    /// Creates a BadRequest error for malformed request input.
    pub fn bad_request(message: impl Into<String>) -> Self {
        AppError::BadRequest {
            code: "invalid_query",
            message: message.into(),
        }
    }

    fn parts(self) -> (StatusCode, &'static str, String) {
        match self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, "not_found", m),
            AppError::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            AppError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", m),
            AppError::Timeout(m) => (StatusCode::GATEWAY_TIMEOUT, "query_timeout", m),
            AppError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", m),
        }
    }
}

impl From<TraceError> for AppError {
    fn from(e: TraceError) -> Self {
        let message = e.to_string();
        match e {
            TraceError::TraceNotFound(_) | TraceError::SpanNotFound { .. } => {
                AppError::NotFound(message)
            }
            TraceError::InvalidQuery(_) | TraceError::ValidationRejection(_) => {
                AppError::BadRequest {
                    code: e.code(),
                    message,
                }
            }
            TraceError::StoreUnavailable(_) => {
                tracing::error!(error = %message, "Store unavailable");
                AppError::Unavailable(message)
            }
            TraceError::QueryTimeout(_) => AppError::Timeout(message),
            TraceError::Cancelled => AppError::Internal(message),
        }
    }
}

impl From<arbor_store::StoreError> for AppError {
    fn from(e: arbor_store::StoreError) -> Self {
        TraceError::from(e).into()
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, error) = self.parts();
        (status, Json(ErrorResponse { error, code })).into_response()
    }
}
