//! Reservation engine contract.
//!
//! The runtime inventory lives in Redis (`rushtix-redis` implements this
//! trait with atomic Lua scripts); tests run against the in-memory
//! implementation in `rushtix-testing`. Either way the semantics are the
//! same: each operation is atomic, and availability can never go
//! negative.

use crate::repository::RepoFuture;
use crate::types::{BookingId, EventId, Money, PaymentId, UserId, ZoneId};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Input for [`ReservationStore::reserve`].
#[derive(Clone, Debug)]
pub struct ReserveRequest {
    /// Caller-minted booking id
    pub booking_id: BookingId,
    /// Reserving user
    pub user_id: UserId,
    /// Event the zone belongs to
    pub event_id: EventId,
    /// Zone to decrement
    pub zone_id: ZoneId,
    /// Seats requested
    pub quantity: u32,
    /// Per-event ticket cap for this user
    pub max_per_user: u32,
    /// Reservation window
    pub ttl: Duration,
    /// Price per seat, recorded on the hold
    pub unit_price: Money,
}

/// A successful reservation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReservationOutcome {
    /// The booking id the seats are held under
    pub booking_id: BookingId,
    /// When the hold lapses unless confirmed
    pub expires_at: DateTime<Utc>,
}

/// Atomic seat inventory operations.
pub trait ReservationStore: Send + Sync {
    /// Atomically hold seats, enforcing availability and the per-event
    /// user cap. Fails closed on backend trouble.
    fn reserve(
        &self,
        request: &ReserveRequest,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, ReservationOutcome>;

    /// Confirm a held reservation (payment succeeded): drop the TTL,
    /// count the seats sold. Returns the confirmed quantity.
    fn confirm(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
        booking_id: BookingId,
        user_id: UserId,
        payment_id: PaymentId,
    ) -> RepoFuture<'_, u32>;

    /// Return held seats to the pool. Idempotent: a reservation that is
    /// already gone reports [`crate::DomainError::AlreadyReleased`]
    /// without any side effect. Returns the released quantity.
    fn release(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
        booking_id: BookingId,
        user_id: UserId,
    ) -> RepoFuture<'_, u32>;

    /// Overwrite a zone's availability counter (seeding and
    /// reconciliation).
    fn set_availability(
        &self,
        event_id: EventId,
        zone_id: ZoneId,
        available: u32,
    ) -> RepoFuture<'_, ()>;

    /// Read a zone's availability counter.
    fn availability(&self, event_id: EventId, zone_id: ZoneId)
        -> RepoFuture<'_, Option<i64>>;
}
