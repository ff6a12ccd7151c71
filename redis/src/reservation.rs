//! Atomic seat reservation engine.
//!
//! Each operation is a single Lua script evaluated server-side, so there
//! is no read-modify-write race between concurrent reservers: Redis'
//! single-threaded command loop serializes them. The cost is strict
//! serialization per instance; keys are hash-tagged by event id
//! ([`crate::keys`]) so a cluster shards load by event.
//!
//! Scripts are invoked by SHA and reloaded on `NOSCRIPT` (handled by
//! [`redis::Script`]). The booking id is minted by the caller and passed
//! as an argument so the scripts stay deterministic.
//!
//! # Expiry
//!
//! Redis TTL deletes a lapsed reservation but cannot restore inventory
//! (eviction runs no user code). The durable `reservation_expires_at`
//! drives the expiry sweeper, which calls [`ReservationEngine::release`];
//! the Redis TTL trails that deadline by a grace margin so the hash is
//! still there when the sweeper arrives. Startup reconciliation rewrites
//! counters if both mechanisms miss.

use crate::keys;
use crate::retry::{RetryPolicy, retry_with_backoff};
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use rushtix_core::repository::RepoFuture;
use rushtix_core::reservation::{ReservationOutcome, ReservationStore, ReserveRequest};
use rushtix_core::{BookingId, DomainError, EventId, PaymentId, UserId, ZoneId};

/// Seconds the Redis TTL trails `reservation_expires_at`, leaving the
/// sweeper a window in which the hash still exists.
pub const RESERVATION_TTL_GRACE_SECS: u64 = 120;

const RESERVE_LUA: &str = r"
local avail = tonumber(redis.call('GET', KEYS[1]) or '0')
local quantity = tonumber(ARGV[1])
if avail < quantity then
    return {'ERR', 'INSUFFICIENT_SEATS'}
end
local total = quantity
local held = redis.call('HVALS', KEYS[3])
for i = 1, #held do
    total = total + tonumber(held[i])
end
if total > tonumber(ARGV[2]) then
    return {'ERR', 'MAX_TICKETS_EXCEEDED'}
end
redis.call('DECRBY', KEYS[1], quantity)
redis.call('HSET', KEYS[2],
    'user_id', ARGV[5],
    'zone_id', ARGV[6],
    'event_id', ARGV[7],
    'quantity', ARGV[1],
    'price', ARGV[4],
    'status', 'reserved',
    'expires_at', ARGV[8])
redis.call('EXPIRE', KEYS[2], tonumber(ARGV[3]))
redis.call('HSET', KEYS[3], ARGV[9], ARGV[1])
return {'OK', ARGV[9], ARGV[8]}
";

const CONFIRM_LUA: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return {'ERR', 'RESERVATION_NOT_FOUND'}
end
if redis.call('HGET', KEYS[1], 'user_id') ~= ARGV[1] then
    return {'ERR', 'INVALID_USER_ID'}
end
local status = redis.call('HGET', KEYS[1], 'status')
if status == 'confirmed' then
    return {'ERR', 'ALREADY_CONFIRMED'}
end
if status ~= 'reserved' then
    return {'ERR', 'INVALID_STATUS'}
end
redis.call('HSET', KEYS[1], 'status', 'confirmed', 'payment_id', ARGV[2])
redis.call('PERSIST', KEYS[1])
local quantity = tonumber(redis.call('HGET', KEYS[1], 'quantity'))
redis.call('INCRBY', KEYS[2], quantity)
return {'OK', tostring(quantity)}
";

const RELEASE_LUA: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return {'ERR', 'ALREADY_RELEASED'}
end
if redis.call('HGET', KEYS[1], 'user_id') ~= ARGV[1] then
    return {'ERR', 'INVALID_USER_ID'}
end
local status = redis.call('HGET', KEYS[1], 'status')
local quantity = tonumber(redis.call('HGET', KEYS[1], 'quantity'))
redis.call('INCRBY', KEYS[2], quantity)
if status == 'confirmed' then
    redis.call('DECRBY', KEYS[3], quantity)
end
redis.call('DEL', KEYS[1])
redis.call('HDEL', KEYS[4], ARGV[2])
return {'OK', tostring(quantity)}
";

/// Atomic inventory operations over Redis.
#[derive(Clone)]
pub struct ReservationEngine {
    conn: ConnectionManager,
    reserve: Script,
    confirm: Script,
    release: Script,
    policy: RetryPolicy,
}

impl ReservationEngine {
    /// Create an engine over the shared connection manager.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            reserve: Script::new(RESERVE_LUA),
            confirm: Script::new(CONFIRM_LUA),
            release: Script::new(RELEASE_LUA),
            policy: RetryPolicy::default(),
        }
    }

    /// Atomically hold `quantity` seats.
    ///
    /// # Errors
    ///
    /// - [`DomainError::InsufficientSeats`] if the zone cannot cover the
    ///   request
    /// - [`DomainError::MaxTicketsExceeded`] if the hold would push the
    ///   user past the per-event cap
    /// - [`DomainError::DependencyUnavailable`] after 3 failed attempts
    ///   (reservation fails closed)
    pub async fn reserve(
        &self,
        req: &ReserveRequest,
        now: DateTime<Utc>,
    ) -> Result<ReservationOutcome, DomainError> {
        let expires_at = now + chrono::Duration::from_std(req.ttl).unwrap_or_default();
        let ttl_secs = req.ttl.as_secs() + RESERVATION_TTL_GRACE_SECS;

        let reply: Vec<String> = self
            .invoke(|| {
                let mut conn = self.conn.clone();
                let mut invocation = self.reserve.prepare_invoke();
                invocation
                    .key(keys::availability(req.event_id, req.zone_id))
                    .key(keys::booking(req.event_id, req.booking_id))
                    .key(keys::user_bookings(req.event_id, req.user_id))
                    .arg(req.quantity)
                    .arg(req.max_per_user)
                    .arg(ttl_secs)
                    .arg(req.unit_price.cents())
                    .arg(req.user_id.to_string())
                    .arg(req.zone_id.to_string())
                    .arg(req.event_id.to_string())
                    .arg(expires_at.timestamp())
                    .arg(req.booking_id.to_string());
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;

        match Self::status_of(&reply) {
            "OK" => {
                metrics::counter!("reservation.reserved").increment(1);
                tracing::debug!(
                    booking_id = %req.booking_id,
                    zone_id = %req.zone_id,
                    quantity = req.quantity,
                    "seats reserved"
                );
                Ok(ReservationOutcome {
                    booking_id: req.booking_id,
                    expires_at,
                })
            }
            "INSUFFICIENT_SEATS" => {
                metrics::counter!("reservation.rejected", "reason" => "insufficient_seats")
                    .increment(1);
                Err(DomainError::InsufficientSeats)
            }
            "MAX_TICKETS_EXCEEDED" => {
                metrics::counter!("reservation.rejected", "reason" => "max_tickets").increment(1);
                Err(DomainError::MaxTicketsExceeded {
                    user_id: req.user_id,
                    event_id: req.event_id,
                    max_allowed: req.max_per_user,
                })
            }
            other => Self::unrecognized_code("reserve", other),
        }
    }

    /// Confirm a held reservation after payment success.
    ///
    /// Removes the TTL, marks the hash confirmed and bumps the sold
    /// counter. Returns the confirmed quantity.
    ///
    /// # Errors
    ///
    /// Discriminated per the script: [`DomainError::ReservationNotFound`],
    /// [`DomainError::InvalidUserId`], [`DomainError::AlreadyConfirmed`]
    /// or [`DomainError::InvalidReservationStatus`].
    pub async fn confirm(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
        booking_id: BookingId,
        user_id: UserId,
        payment_id: PaymentId,
    ) -> Result<u32, DomainError> {
        let reply: Vec<String> = self
            .invoke(|| {
                let mut conn = self.conn.clone();
                let mut invocation = self.confirm.prepare_invoke();
                invocation
                    .key(keys::booking(event_id, booking_id))
                    .key(keys::sold(event_id, zone_id))
                    .arg(user_id.to_string())
                    .arg(payment_id.to_string());
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;

        match Self::status_of(&reply) {
            "OK" => {
                metrics::counter!("reservation.confirmed").increment(1);
                Ok(Self::quantity_of(&reply))
            }
            "RESERVATION_NOT_FOUND" => Err(DomainError::ReservationNotFound(booking_id)),
            "INVALID_USER_ID" => Err(DomainError::InvalidUserId),
            "ALREADY_CONFIRMED" => Err(DomainError::AlreadyConfirmed(booking_id)),
            "INVALID_STATUS" => Err(DomainError::InvalidReservationStatus(booking_id)),
            other => Self::unrecognized_code("confirm", other),
        }
    }

    /// Return held seats to the pool and drop the reservation.
    ///
    /// Idempotent: releasing a reservation that is already gone reports
    /// [`DomainError::AlreadyReleased`] without touching inventory.
    /// Returns the released quantity.
    ///
    /// # Errors
    ///
    /// [`DomainError::AlreadyReleased`], [`DomainError::InvalidUserId`],
    /// or a dependency failure after retries.
    pub async fn release(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
        booking_id: BookingId,
        user_id: UserId,
    ) -> Result<u32, DomainError> {
        let reply: Vec<String> = self
            .invoke(|| {
                let mut conn = self.conn.clone();
                let mut invocation = self.release.prepare_invoke();
                invocation
                    .key(keys::booking(event_id, booking_id))
                    .key(keys::availability(event_id, zone_id))
                    .key(keys::sold(event_id, zone_id))
                    .key(keys::user_bookings(event_id, user_id))
                    .arg(user_id.to_string())
                    .arg(booking_id.to_string());
                async move { invocation.invoke_async(&mut conn).await }
            })
            .await?;

        match Self::status_of(&reply) {
            "OK" => {
                metrics::counter!("reservation.released").increment(1);
                Ok(Self::quantity_of(&reply))
            }
            "ALREADY_RELEASED" => Err(DomainError::AlreadyReleased(booking_id)),
            "INVALID_USER_ID" => Err(DomainError::InvalidUserId),
            other => Self::unrecognized_code("release", other),
        }
    }

    /// Overwrite a zone's availability counter (seeding and
    /// reconciliation).
    ///
    /// # Errors
    ///
    /// Returns a dependency failure after retries.
    pub async fn set_availability(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
        available: u32,
    ) -> Result<(), DomainError> {
        let key = keys::availability(event_id, zone_id);
        let mut conn = self.conn.clone();
        let () = redis::cmd("SET")
            .arg(&key)
            .arg(available)
            .query_async(&mut conn)
            .await
            .map_err(|e| crate::dependency_error("failed to set zone availability", &e))?;
        Ok(())
    }

    /// Read a zone's availability counter.
    ///
    /// # Errors
    ///
    /// Returns a dependency failure after retries.
    pub async fn availability(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
    ) -> Result<Option<i64>, DomainError> {
        let key = keys::availability(event_id, zone_id);
        let mut conn = self.conn.clone();
        redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| crate::dependency_error("failed to read zone availability", &e))
    }

    async fn invoke<F, Fut>(&self, operation: F) -> Result<Vec<String>, DomainError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<String>, redis::RedisError>>,
    {
        retry_with_backoff(&self.policy, operation)
            .await
            .map_err(|e| crate::dependency_error("reservation script failed", &e))
    }

    fn status_of(reply: &[String]) -> &str {
        match reply.first().map(String::as_str) {
            Some("OK") => "OK",
            Some("ERR") => reply.get(1).map_or("", String::as_str),
            _ => "",
        }
    }

    fn quantity_of(reply: &[String]) -> u32 {
        reply
            .get(1)
            .and_then(|q| q.parse().ok())
            .unwrap_or_default()
    }

    // A script replying with a code this build doesn't know means the
    // store and the binary disagree about the protocol; continuing would
    // corrupt inventory. The ingress recovery layer turns this into a 500.
    #[allow(clippy::panic)]
    fn unrecognized_code(op: &str, code: &str) -> ! {
        panic!("reservation {op} script returned unrecognized code: {code:?}")
    }
}

impl ReservationStore for ReservationEngine {
    fn reserve(
        &self,
        request: &ReserveRequest,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, ReservationOutcome> {
        let request = request.clone();
        Box::pin(async move { Self::reserve(self, &request, now).await })
    }

    fn confirm(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
        booking_id: BookingId,
        user_id: UserId,
        payment_id: PaymentId,
    ) -> RepoFuture<'_, u32> {
        Box::pin(
            async move { Self::confirm(self, event_id, zone_id, booking_id, user_id, payment_id).await },
        )
    }

    fn release(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
        booking_id: BookingId,
        user_id: UserId,
    ) -> RepoFuture<'_, u32> {
        Box::pin(async move { Self::release(self, event_id, zone_id, booking_id, user_id).await })
    }

    fn set_availability(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
        available: u32,
    ) -> RepoFuture<'_, ()> {
        Box::pin(async move { Self::set_availability(self, event_id, zone_id, available).await })
    }

    fn availability(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
    ) -> RepoFuture<'_, Option<i64>> {
        Box::pin(async move { Self::availability(self, event_id, zone_id).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_of_reads_ok_and_err_shapes() {
        let ok = vec!["OK".to_string(), "abc".to_string()];
        assert_eq!(ReservationEngine::status_of(&ok), "OK");

        let err = vec!["ERR".to_string(), "INSUFFICIENT_SEATS".to_string()];
        assert_eq!(ReservationEngine::status_of(&err), "INSUFFICIENT_SEATS");

        let empty: Vec<String> = vec![];
        assert_eq!(ReservationEngine::status_of(&empty), "");
    }

    #[test]
    fn quantity_of_parses_second_element() {
        let ok = vec!["OK".to_string(), "4".to_string()];
        assert_eq!(ReservationEngine::quantity_of(&ok), 4);
    }

    #[test]
    fn reserve_script_checks_cap_before_mutating() {
        // The availability decrement must come after both guard clauses,
        // otherwise a rejected request would leak seats.
        let decrby = RESERVE_LUA.find("DECRBY").unwrap_or(usize::MAX);
        let insufficient = RESERVE_LUA.find("INSUFFICIENT_SEATS").unwrap_or(0);
        let cap = RESERVE_LUA.find("MAX_TICKETS_EXCEEDED").unwrap_or(0);
        assert!(insufficient < decrby);
        assert!(cap < decrby);
    }

    #[test]
    fn release_script_restores_before_deleting() {
        let incrby = RELEASE_LUA.find("INCRBY").unwrap_or(usize::MAX);
        let del = RELEASE_LUA.find("'DEL'").unwrap_or(0);
        assert!(incrby < del);
    }
}
