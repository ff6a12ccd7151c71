//! Redis-resident state for the Rushtix booking platform.
//!
//! Redis owns everything that must be decided at flash-sale speed:
//!
//! - **Inventory counters and reservations** ([`reservation`]): atomic
//!   seat decrement/restore via server-side Lua scripts
//! - **Queue admission** ([`queue`]): the virtual waiting room and its
//!   queue-pass tokens
//! - **Idempotency records** ([`idempotency`]): dedupe of mutating
//!   requests with response replay
//! - **Rate-limit buckets** ([`rate_limit`]): the distributed token-bucket
//!   script behind the ingress limiter
//!
//! All access goes through one shared [`redis::aio::ConnectionManager`].
//! Scripts are addressed by SHA and transparently reloaded on `NOSCRIPT`
//! (a cold replica or a flushed instance never breaks a request).
//!
//! # Failure policy
//!
//! Transient errors are retried up to 3 times with exponential backoff.
//! After that, reservation paths fail **closed** (we cannot guess
//! inventory) while the rate limiter fails **open** (availability beats
//! throttling accuracy). See [`retry`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod idempotency;
pub mod keys;
pub mod queue;
pub mod rate_limit;
pub mod reservation;
pub mod retry;

pub use idempotency::IdempotencyStore;
pub use queue::{QueueAdmission, QueueConfig, QueuePassClaims};
pub use rate_limit::{DistributedRateLimiter, RateLimitDecision};
pub use reservation::{RESERVATION_TTL_GRACE_SECS, ReservationEngine};

use redis::Client;
use redis::aio::ConnectionManager;
use rushtix_core::DomainError;

/// Build the shared connection manager from a Redis URL.
///
/// # Errors
///
/// Returns [`DomainError::DependencyUnavailable`] if the client cannot be
/// created or the initial connection fails.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager, DomainError> {
    let client = Client::open(redis_url).map_err(|e| {
        DomainError::DependencyUnavailable(format!("failed to create Redis client: {e}"))
    })?;

    let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
        DomainError::DependencyUnavailable(format!(
            "failed to create Redis connection manager: {e}"
        ))
    })?;

    tracing::info!(url = %redis_url, "Redis connection manager created");

    Ok(conn_manager)
}

/// Map a redis error into the domain taxonomy.
pub(crate) fn dependency_error(context: &str, err: &redis::RedisError) -> DomainError {
    DomainError::DependencyUnavailable(format!("{context}: {err}"))
}
