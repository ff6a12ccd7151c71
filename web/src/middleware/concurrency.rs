//! Global concurrency cap.
//!
//! A semaphore bounds requests in flight across the process. Acquisition
//! never waits: at capacity the request is rejected immediately with
//! 429, which under a flash-sale surge is kinder than queueing into a
//! timeout. The permit is RAII, so every exit path (including a panic
//! caught further out) releases it.

use crate::error::ApiError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

/// The concurrency-cap middleware.
pub async fn concurrency_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    match state.concurrency.clone().try_acquire_owned() {
        Ok(_permit) => next.run(request).await,
        Err(_) => {
            metrics::counter!("http.concurrency_rejected").increment(1);
            tracing::debug!(path = %request.uri().path(), "concurrency cap reached");
            let mut response = ApiError::too_many_requests().into_response();
            response
                .headers_mut()
                .insert("Retry-After", HeaderValue::from_static("1"));
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Semaphore;

    #[tokio::test]
    async fn permits_release_on_drop() {
        let semaphore = std::sync::Arc::new(Semaphore::new(1));

        {
            let _permit = semaphore.clone().try_acquire_owned().ok();
            assert!(semaphore.clone().try_acquire_owned().is_err());
        }

        assert!(semaphore.try_acquire_owned().is_ok());
    }
}
