//! Panic recovery.
//!
//! A panicking handler becomes a 500 `INTERNAL_ERROR` envelope; nothing
//! internal leaks to the client and the process keeps serving.

use crate::error::ApiError;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;

/// The recovery middleware.
pub async fn recover(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();

    match std::panic::AssertUnwindSafe(next.run(request))
        .catch_unwind()
        .await
    {
        Ok(response) => response,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map_or("handler panicked", |s| s);
            tracing::error!(path = %path, panic = message, "handler panicked");
            metrics::counter!("http.panics").increment(1);
            ApiError::internal("an internal error occurred").into_response()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request as HttpRequest, routing::get};
    use tower::ServiceExt;

    #[tokio::test]
    async fn panic_becomes_500_envelope() {
        #[allow(clippy::panic)]
        let app = Router::new()
            .route(
                "/boom",
                get(|| async {
                    panic!("seat map corrupted");
                    #[allow(unreachable_code)]
                    ()
                }),
            )
            .layer(axum::middleware::from_fn(recover));

        let response = app
            .oneshot(HttpRequest::builder().uri("/boom").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), 500);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["success"], serde_json::json!(false));
        assert_eq!(json["error"]["code"], serde_json::json!("INTERNAL_ERROR"));
        // The panic message must not leak.
        assert!(!body.iter().eq(b"seat map corrupted".iter()));
    }
}
