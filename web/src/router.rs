//! Router assembly.

use crate::handlers::{auth, bookings, health, queue};
use crate::middleware::{concurrency_limit, idempotency, rate_limit, recover, request_id_layer};
use crate::state::AppState;
use axum::Router;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the full application router.
///
/// Layer order, outermost first: request-id/trace context → access log →
/// CORS (preflight short-circuits before business layers) → panic
/// recovery → rate limit → concurrency cap. Idempotency wraps only the
/// booking routes, where mutations carry an `X-Idempotency-Key`.
#[must_use]
pub fn router(state: AppState, cors: CorsLayer) -> Router {
    let booking_routes = Router::new()
        .route("/bookings", post(bookings::reserve))
        .route("/bookings/summary", get(bookings::summary))
        .route("/bookings/:id", get(bookings::get_booking))
        .route("/bookings/:id/confirm", post(bookings::confirm))
        .route("/bookings/:id/release", post(bookings::release))
        .route_layer(from_fn_with_state(state.clone(), idempotency));

    let api = Router::new()
        .route("/auth/validate", post(auth::validate))
        .route("/queue/join", post(queue::join))
        .route("/queue/status", get(queue::status))
        .merge(booking_routes);

    Router::new()
        .nest("/api/v1", api)
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        // Innermost of the chain first: axum wraps each `.layer` around
        // everything added before it.
        .layer(from_fn_with_state(state.clone(), concurrency_limit))
        .layer(from_fn_with_state(state.clone(), rate_limit))
        .layer(from_fn(recover))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(request_id_layer())
        .with_state(state)
}
