//! RPC server adapter: exposes a [`NodeHandle`] over HTTP/JSON.
//!
//! Routes mirror the [`crate::peer::Peer`] operations one to one, so an
//! [`crate::transport::HttpPeer`] pointed at this router behaves like a local
//! peer. Calls that time out inside the node are retried a few times before
//! the error is reported, except compare-and-swap, which may already have been
//! proposed. A stopped node answers `503`.

use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::NodeError;
use crate::retry::RetryPolicy;
use crate::runtime::{NodeHandle, NodeStatus};
use crate::types::{
    AppendEntriesRequest, AppendEntriesResponse, CompareAndSwapRequest, CompareAndSwapResponse,
    EventualGetRequest, EventualGetResponse, MostRecentLeaderResponse, RequestVoteRequest,
    RequestVoteResponse, StrongGetRequest, StrongGetResponse,
};

const HANDLER_RETRY: RetryPolicy = RetryPolicy::new(3, Duration::ZERO);

/// One POST route per peer RPC plus `GET /raft/status`.
pub fn router(handle: NodeHandle) -> Router {
    Router::new()
        .route("/raft/append-entries", post(append_entries))
        .route("/raft/request-vote", post(request_vote))
        .route("/raft/strong-get", post(strong_get))
        .route("/raft/eventual-get", post(eventual_get))
        .route("/raft/compare-and-swap", post(compare_and_swap))
        .route("/raft/most-recent-leader", post(most_recent_leader))
        .route("/raft/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(handle)
}

/// A node failure turned into an HTTP answer.
#[derive(Debug)]
pub struct ServerError(NodeError);

impl From<NodeError> for ServerError {
    fn from(err: NodeError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            NodeError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            NodeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        warn!(status = %status, error = %self.0, "rpc failed");
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn append_entries(
    State(handle): State<NodeHandle>,
    Json(request): Json<AppendEntriesRequest>,
) -> Result<Json<AppendEntriesResponse>, ServerError> {
    let response = HANDLER_RETRY
        .run(|_| handle.append_entries(request.clone()), NodeError::is_transient)
        .await?;
    Ok(Json(response))
}

async fn request_vote(
    State(handle): State<NodeHandle>,
    Json(request): Json<RequestVoteRequest>,
) -> Result<Json<RequestVoteResponse>, ServerError> {
    let response = HANDLER_RETRY
        .run(|_| handle.request_vote(request.clone()), NodeError::is_transient)
        .await?;
    Ok(Json(response))
}

async fn strong_get(
    State(handle): State<NodeHandle>,
    Json(request): Json<StrongGetRequest>,
) -> Result<Json<StrongGetResponse>, ServerError> {
    let response = HANDLER_RETRY
        .run(|_| handle.strong_get(request.clone()), NodeError::is_transient)
        .await?;
    Ok(Json(response))
}

async fn eventual_get(
    State(handle): State<NodeHandle>,
    Json(request): Json<EventualGetRequest>,
) -> Result<Json<EventualGetResponse>, ServerError> {
    let value = HANDLER_RETRY
        .run(|_| handle.eventual_get(request.key.clone()), NodeError::is_transient)
        .await?;
    Ok(Json(EventualGetResponse { value }))
}

async fn compare_and_swap(
    State(handle): State<NodeHandle>,
    Json(request): Json<CompareAndSwapRequest>,
) -> Result<Json<CompareAndSwapResponse>, ServerError> {
    // A timed-out write may still commit; resending it would conflict with itself.
    Ok(Json(handle.compare_and_swap(request).await?))
}

async fn most_recent_leader(
    State(handle): State<NodeHandle>,
) -> Result<Json<MostRecentLeaderResponse>, ServerError> {
    let leader_id = HANDLER_RETRY
        .run(|_| handle.most_recent_leader(), NodeError::is_transient)
        .await?;
    Ok(Json(MostRecentLeaderResponse { leader_id }))
}

async fn status(State(handle): State<NodeHandle>) -> Result<Json<NodeStatus>, ServerError> {
    Ok(Json(handle.status().await?))
}
