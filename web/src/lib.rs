//! Ingress fabric for the Rushtix booking platform.
//!
//! The middleware chain in front of every business handler:
//!
//! - request-id / trace-context injection (inbound `X-Request-ID` or a
//!   fresh ULID), structured access logging
//! - CORS with preflight short-circuit
//! - panic recovery (panics become a 500 envelope, never a leak)
//! - token-bucket rate limiting per `{client_ip, endpoint_rule}` (local
//!   map or Redis-shared, failing open)
//! - a global concurrency cap with immediate 429 at capacity
//! - idempotency on the booking mutations: claimed, executed once,
//!   replayed byte-for-byte for 24 hours
//!
//! plus the core HTTP surface: auth validation, queue join/status and
//! the booking lifecycle endpoints. Handlers translate typed domain
//! errors into the `{"success": false, "error": …}` envelope at this
//! boundary and nowhere else.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;

pub use auth::{AuthedUser, TokenVerifier};
pub use error::ApiError;
pub use extractors::{ClientIp, RequestId};
pub use router::router;
pub use state::{AppState, BookingSettings};
