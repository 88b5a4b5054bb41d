//! Gateway failures and the HTTP status each one maps to.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::warn;

/// Why a storage request could not be answered.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("the gateway needs at least one node")]
    NoNodes,

    #[error("key {0:?} is not a valid storage key")]
    InvalidKey(String),

    #[error("key {0:?} not found")]
    NotFound(String),

    #[error("failed to complete {operation} after {attempts} attempts")]
    Exhausted {
        operation: &'static str,
        attempts: usize,
    },
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match self {
            GatewayError::InvalidKey(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::NoNodes | GatewayError::Exhausted { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        if status.is_server_error() {
            warn!(error = %self, "storage request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
