//! Storage contracts.
//!
//! Each repository is a trait with a Postgres implementation in
//! `rushtix-postgres` and an in-memory implementation in
//! `rushtix-testing`. Services depend on these traits, never on the
//! concrete stores, and receive them as `Arc<dyn …>`.
//!
//! Methods take the current time as an argument instead of reading the
//! system clock, so every implementation stays deterministic under test.

use crate::booking::{Booking, BookingSummary, NewBooking};
use crate::error::DomainError;
use crate::saga::SagaInstance;
use crate::outbox::OutboxRow;
use crate::types::{BookingId, EventId, PaymentId, SagaId, UserId, Zone, ZoneId};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Boxed future returned by repository methods.
pub type RepoFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, DomainError>> + Send + 'a>>;

/// Clock abstraction so time-dependent logic is testable.
pub trait Clock: Send + Sync {
    /// Get the current time
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Durable booking storage.
///
/// Every mutating method runs its status-gated `UPDATE` (or `INSERT`) and
/// the matching outbox row in one database transaction. That pairing is
/// the only way domain events leave the core, so implementations must
/// never skip the outbox write.
pub trait BookingRepository: Send + Sync {
    /// Insert a booking whose seats are already held in Redis.
    ///
    /// The row lands directly in RESERVED with a `booking.created` outbox
    /// row. Fails with [`DomainError::Storage`] on an idempotency-key
    /// collision (the ingress replays the cached response instead).
    fn create_reserved(&self, booking: NewBooking, now: DateTime<Utc>)
        -> RepoFuture<'_, Booking>;

    /// Transition RESERVED → CONFIRMED, mint the confirmation code and
    /// record the payment reference. Emits `booking.confirmed`.
    fn confirm(
        &self,
        id: BookingId,
        user_id: UserId,
        payment_id: PaymentId,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, Booking>;

    /// Transition RESERVED → CANCELLED. Emits `booking.cancelled`.
    fn cancel(&self, id: BookingId, now: DateTime<Utc>) -> RepoFuture<'_, Booking>;

    /// Transition CONFIRMED → REFUNDED. Emits `booking.refunded`.
    fn refund(&self, id: BookingId, now: DateTime<Utc>) -> RepoFuture<'_, Booking>;

    /// Claim up to `limit` RESERVED rows whose reservation window has
    /// elapsed and transition each to EXPIRED, emitting `booking.expired`.
    ///
    /// Implementations must skip rows claimed by a concurrent sweeper
    /// replica (`FOR UPDATE SKIP LOCKED` in Postgres).
    fn expire_batch(&self, now: DateTime<Utc>, limit: u32) -> RepoFuture<'_, Vec<Booking>>;

    /// Fetch a booking by id.
    fn get(&self, id: BookingId) -> RepoFuture<'_, Option<Booking>>;

    /// Fetch the booking created under an idempotency key, if any.
    fn find_by_idempotency_key(&self, key: &str) -> RepoFuture<'_, Option<Booking>>;

    /// Seats held or sold to `user_id` for `event_id`, against the cap.
    fn summary(
        &self,
        user_id: UserId,
        event_id: EventId,
        max_allowed: u32,
    ) -> RepoFuture<'_, BookingSummary>;
}

/// Zone projection storage (read side of inventory).
pub trait ZoneRepository: Send + Sync {
    /// Fetch a zone by id.
    fn get(&self, id: ZoneId) -> RepoFuture<'_, Option<Zone>>;

    /// Apply a signed delta to the projected `available_seats`.
    fn apply_available_delta(&self, id: ZoneId, delta: i64) -> RepoFuture<'_, ()>;

    /// Per-zone capacity and confirmed totals, for startup reconciliation.
    fn reconciliation_counts(&self) -> RepoFuture<'_, Vec<ZoneReconciliation>>;

    /// Overwrite the projected `available_seats` with a reconciled value.
    fn set_available(&self, id: ZoneId, available: u32) -> RepoFuture<'_, ()>;
}

/// One row of the startup reconciliation pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZoneReconciliation {
    /// Zone being reconciled
    pub zone_id: ZoneId,
    /// Event the zone belongs to (addresses the Redis counter)
    pub event_id: EventId,
    /// Capacity of the zone
    pub total_seats: u32,
    /// Seats in CONFIRMED bookings
    pub confirmed_quantity: u32,
}

impl ZoneReconciliation {
    /// The availability both stores should converge to.
    #[must_use]
    pub const fn expected_available(&self) -> u32 {
        self.total_seats.saturating_sub(self.confirmed_quantity)
    }
}

/// Outbox polling and bookkeeping.
///
/// Rows are inserted by [`BookingRepository`] transactions; this trait
/// covers the relay side.
pub trait OutboxStore: Send + Sync {
    /// Claim up to `batch_size` due rows in `created_at` order.
    ///
    /// Claimed rows are leased for `lease`: their `next_retry_at` moves
    /// forward so a crashed relay replica re-delivers after the lease
    /// rather than never (duplicates are acceptable, loss is not).
    fn claim_batch(
        &self,
        batch_size: u32,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, Vec<OutboxRow>>;

    /// Mark a row published.
    fn mark_sent(&self, id: i64, now: DateTime<Utc>) -> RepoFuture<'_, ()>;

    /// Record a publish failure and when to try again.
    fn mark_failed(
        &self,
        id: i64,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> RepoFuture<'_, ()>;

    /// Delete sent rows older than `cutoff`; returns rows removed.
    fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> RepoFuture<'_, u64>;

    /// Rows not yet sent, for health reporting.
    fn pending_count(&self) -> RepoFuture<'_, i64>;
}

/// Saga instance storage.
///
/// A single orchestrator consumer mutates any given instance, so updates
/// are whole-row writes rather than field-level merges.
pub trait SagaStore: Send + Sync {
    /// Persist a new instance.
    fn insert(&self, instance: &SagaInstance) -> RepoFuture<'_, ()>;

    /// Fetch an instance with its step records.
    fn get(&self, id: SagaId) -> RepoFuture<'_, Option<SagaInstance>>;

    /// Overwrite an instance and its step records.
    fn update(&self, instance: &SagaInstance) -> RepoFuture<'_, ()>;

    /// Instances in `running` or `compensating`, for crash recovery.
    fn find_in_flight(&self, limit: u32) -> RepoFuture<'_, Vec<SagaInstance>>;

    /// In-flight instances whose current step passed its `timeout_at`.
    fn find_timed_out(&self, now: DateTime<Utc>, limit: u32)
        -> RepoFuture<'_, Vec<SagaInstance>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reconciliation_expected_available_saturates() {
        let rec = ZoneReconciliation {
            zone_id: ZoneId::new(),
            event_id: EventId::new(),
            total_seats: 100,
            confirmed_quantity: 120,
        };
        assert_eq!(rec.expected_available(), 0);

        let rec = ZoneReconciliation {
            zone_id: ZoneId::new(),
            event_id: EventId::new(),
            total_seats: 100,
            confirmed_quantity: 37,
        };
        assert_eq!(rec.expected_available(), 63);
    }
}
