use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use raft_kv::types::{CompareAndSwapRequest, CompareAndSwapResponse, StrongGetResponse};
use serde::Deserialize;
use tower_http::trace::TraceLayer;

use crate::error::GatewayError;
use crate::gateway::Gateway;

/// `?key=` of the read routes.
#[derive(Debug, Deserialize)]
pub struct KeyQuery {
    pub key: String,
}

/// The storage API under `/api/storage`.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/api/storage/strong", get(strong_get))
        .route("/api/storage/eventual", get(eventual_get))
        .route("/api/storage/compare-and-swap", post(compare_and_swap))
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

async fn strong_get(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<KeyQuery>,
) -> Result<Json<StrongGetResponse>, GatewayError> {
    Ok(Json(gateway.strong_get(&query.key).await?))
}

/// The raw value as `text/plain`; an absent key is an empty `204`.
async fn eventual_get(
    State(gateway): State<Arc<Gateway>>,
    Query(query): Query<KeyQuery>,
) -> Result<Response, GatewayError> {
    Ok(match gateway.eventual_get(&query.key).await? {
        Some(value) => value.into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

async fn compare_and_swap(
    State(gateway): State<Arc<Gateway>>,
    Json(request): Json<CompareAndSwapRequest>,
) -> Result<Json<CompareAndSwapResponse>, GatewayError> {
    Ok(Json(gateway.compare_and_swap(request).await?))
}
