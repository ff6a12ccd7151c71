//! The ingress middleware chain.
//!
//! Applied outermost to innermost: request-id/trace context, access
//! logging, CORS (preflight short-circuits), panic recovery, rate
//! limiting, the concurrency cap, and (on the booking routes)
//! idempotency.

pub mod concurrency;
pub mod idempotency;
pub mod rate_limit;
pub mod recover;
pub mod request_id;

pub use concurrency::concurrency_limit;
pub use idempotency::{IDEMPOTENCY_KEY_HEADER, idempotency};
pub use rate_limit::{
    IngressLimiter, LocalRateLimiter, RateLimitRule, RateLimiterBackend, pattern_matches,
    rate_limit,
};
pub use recover::recover;
pub use request_id::{REQUEST_ID_HEADER, TRACE_ID_HEADER, request_id_layer};
