//! Idempotency middleware.
//!
//! Wraps the mutating booking routes. Keyed requests run exactly once:
//!
//! 1. claim `X-Idempotency-Key` with a `processing` record,
//! 2. run the handler, buffering the response,
//! 3. cache status + body for the 24 h replay window (server failures
//!    drop the claim instead, so the client's retry can run again),
//! 4. on a duplicate: hash mismatch → 422, still running → 409,
//!    completed → replay the cached bytes untouched.
//!
//! Non-mutating methods pass through.

use crate::error::ApiError;
use crate::state::AppState;
use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rushtix_core::idempotency::{BeginOutcome, request_hash};
use rushtix_core::{ErrorCode, UserId};

/// Header carrying the client's dedupe key.
pub const IDEMPOTENCY_KEY_HEADER: &str = "X-Idempotency-Key";

/// Largest request/response body the middleware will buffer.
const MAX_BUFFERED_BODY: usize = 1024 * 1024;

const fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// The idempotency middleware.
pub async fn idempotency(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    if !is_mutating(request.method()) {
        return next.run(request).await;
    }

    let Some(key) = request
        .headers()
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|k| !k.is_empty())
        .map(ToString::to_string)
    else {
        return ApiError::new(
            ErrorCode::MissingIdempotencyKey,
            "X-Idempotency-Key header is required",
        )
        .into_response();
    };

    // The hash binds the key to the caller and the exact request bytes.
    let user_id = bearer_user(&request, &state).unwrap_or_else(|| UserId::from_uuid(uuid::Uuid::nil()));
    let method = request.method().to_string();
    let path = request.uri().path().to_string();

    let (parts, body) = request.into_parts();
    let Ok(body_bytes) = to_bytes(body, MAX_BUFFERED_BODY).await else {
        return ApiError::bad_request("request body too large").into_response();
    };
    let hash = request_hash(&method, &path, user_id, &body_bytes);

    match state.idempotency.begin(&key, &hash).await {
        Ok(BeginOutcome::Started) => {
            let request = Request::from_parts(parts, Body::from(body_bytes));
            let response = next.run(request).await;
            finish(&state, &key, &hash, response).await
        }
        Ok(BeginOutcome::Mismatch) => ApiError::new(
            ErrorCode::IdempotencyKeyReused,
            "idempotency key was used with a different request",
        )
        .into_response(),
        Ok(BeginOutcome::InProgress) => ApiError::new(
            ErrorCode::RequestInProgress,
            "the original request is still being processed",
        )
        .into_response(),
        Ok(BeginOutcome::Replay(record)) => {
            metrics::counter!("idempotency.replayed_responses").increment(1);
            replay(&record)
        }
        Err(e) => {
            // Failing open here risks double effects; the key is the
            // only thing standing between a retry and a second booking.
            tracing::error!(error = %e, "idempotency backend unavailable, failing closed");
            ApiError::new(
                ErrorCode::DependencyUnavailable,
                "please retry this request shortly",
            )
            .into_response()
        }
    }
}

/// Capture the handler's response and settle the record.
async fn finish(state: &AppState, key: &str, hash: &str, response: Response) -> Response {
    let status = response.status();
    let (mut parts, body) = response.into_parts();
    let Ok(body_bytes) = to_bytes(body, MAX_BUFFERED_BODY).await else {
        return ApiError::internal("response too large to cache").into_response();
    };

    if status.is_server_error() {
        // Let the retry run the handler again instead of replaying a 500.
        if let Err(e) = state.idempotency.abandon(key).await {
            tracing::warn!(error = %e, "failed to abandon idempotency claim");
        }
    } else {
        let body_str = String::from_utf8_lossy(&body_bytes);
        let now = state.clock.now();
        if let Err(e) = state
            .idempotency
            .complete(key, hash, status.as_u16(), &body_str, now)
            .await
        {
            tracing::warn!(error = %e, "failed to complete idempotency record");
        }
    }

    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(body_bytes))
}

/// Rebuild the cached response byte-for-byte.
fn replay(record: &rushtix_core::IdempotencyRecord) -> Response {
    let status = record
        .response_code
        .and_then(|c| StatusCode::from_u16(c).ok())
        .unwrap_or(StatusCode::OK);
    let body = record.response_body.clone().unwrap_or_default();

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

fn bearer_user(request: &Request, state: &AppState) -> Option<UserId> {
    let token = request
        .headers()
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?;
    state.verifier.verify(token).ok().map(|c| c.user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutating_methods() {
        assert!(is_mutating(&Method::POST));
        assert!(is_mutating(&Method::PUT));
        assert!(is_mutating(&Method::PATCH));
        assert!(is_mutating(&Method::DELETE));
        assert!(!is_mutating(&Method::GET));
        assert!(!is_mutating(&Method::HEAD));
    }

    #[test]
    fn replay_reconstructs_status_and_body() {
        let record = rushtix_core::IdempotencyRecord {
            status: rushtix_core::IdempotencyStatus::Completed,
            request_hash: "h".to_string(),
            response_code: Some(202),
            response_body: Some("{\"status\":\"reserved\"}".to_string()),
            completed_at: None,
        };
        let response = replay(&record);
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }
}
