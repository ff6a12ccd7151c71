//! Waiting-room endpoints.

use crate::auth::AuthedUser;
use crate::error::ApiError;
use crate::state::AppState;
use axum::Json;
use axum::extract::{Query, State};
use rushtix_core::EventId;
use serde::{Deserialize, Serialize};

/// Request body for `POST /api/v1/queue/join`.
#[derive(Debug, Deserialize)]
pub struct JoinRequest {
    /// Event to queue for
    pub event_id: EventId,
}

/// Response for a join.
#[derive(Debug, Serialize)]
pub struct JoinResponse {
    /// 1-based position in the queue
    pub position: u64,
    /// Estimated seconds until admission
    pub estimated_wait_seconds: u64,
    /// Signed queue token for `X-Queue-Pass`
    pub token: String,
}

/// `POST /api/v1/queue/join`
///
/// Idempotent: re-joining returns the existing position.
///
/// # Errors
///
/// 503 if the queue store is unreachable.
pub async fn join(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Json(body): Json<JoinRequest>,
) -> Result<Json<JoinResponse>, ApiError> {
    let now = state.clock.now();
    let position = state.queue.join(body.event_id, claims.user_id, now).await?;

    Ok(Json(JoinResponse {
        position: position.position,
        estimated_wait_seconds: position.estimated_wait_seconds,
        token: position.token,
    }))
}

/// Query for `GET /api/v1/queue/status`.
#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    /// Event to report on
    pub event_id: EventId,
}

/// Response for a status poll.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    /// 1-based position; absent once admitted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    /// Whether the user may attempt a reservation now
    pub is_open: bool,
    /// Users currently queued
    pub total_in_queue: u64,
}

/// `GET /api/v1/queue/status?event_id=X`
///
/// # Errors
///
/// 503 if the queue store is unreachable.
pub async fn status(
    State(state): State<AppState>,
    AuthedUser(claims): AuthedUser,
    Query(query): Query<StatusQuery>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = state.queue.status(query.event_id, claims.user_id).await?;

    Ok(Json(StatusResponse {
        position: status.position,
        is_open: status.is_open,
        total_in_queue: status.total_in_queue,
    }))
}
