//! Booking entity and its status state machine.
//!
//! Legal transitions:
//!
//! ```text
//!         reserve               confirm
//! PENDING ──────► RESERVED ─────────────► CONFIRMED
//!                    │                        │
//!                    │ release / expire       │ refund
//!                    ▼                        ▼
//!                 CANCELLED                REFUNDED
//!                 EXPIRED
//! ```
//!
//! Transitions are enforced twice: here (so services can reject early) and
//! inside the repository's gated `UPDATE` (so concurrent writers cannot
//! race past the check). Every committed transition co-commits exactly one
//! outbox row.

use crate::error::DomainError;
use crate::event::EventType;
use crate::types::{BookingId, EventId, Money, PaymentId, ShowId, TenantId, UserId, ZoneId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a booking.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookingStatus {
    /// Row created, seats not yet held
    Pending,
    /// Seats held in Redis, awaiting payment
    Reserved,
    /// Payment succeeded, seats sold
    Confirmed,
    /// Released before payment (user action or payment failure)
    Cancelled,
    /// Reservation window elapsed without payment
    Expired,
    /// Confirmed booking refunded
    Refunded,
}

impl BookingStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Reserved => "RESERVED",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
            Self::Refunded => "REFUNDED",
        }
    }

    /// Parse a status from its database string.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Internal`] if the string doesn't match a
    /// known status.
    pub fn parse(s: &str) -> Result<Self, DomainError> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "RESERVED" => Ok(Self::Reserved),
            "CONFIRMED" => Ok(Self::Confirmed),
            "CANCELLED" => Ok(Self::Cancelled),
            "EXPIRED" => Ok(Self::Expired),
            "REFUNDED" => Ok(Self::Refunded),
            _ => Err(DomainError::Internal(format!(
                "unknown booking status: {s}"
            ))),
        }
    }

    /// Whether a transition from `self` to `target` is legal.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        matches!(
            (self, target),
            (Self::Pending, Self::Reserved)
                | (Self::Reserved, Self::Confirmed)
                | (Self::Reserved, Self::Cancelled)
                | (Self::Reserved, Self::Expired)
                | (Self::Confirmed, Self::Refunded)
        )
    }

    /// Terminal states admit no further transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired | Self::Refunded)
    }

    /// States whose seat hold still counts against the per-user cap.
    #[must_use]
    pub const fn holds_seats(&self) -> bool {
        matches!(self, Self::Reserved | Self::Confirmed)
    }

    /// The outbox event type emitted when a booking enters this status.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::Pending | Self::Reserved => EventType::BookingCreated,
            Self::Confirmed => EventType::BookingConfirmed,
            Self::Cancelled => EventType::BookingCancelled,
            Self::Expired => EventType::BookingExpired,
            Self::Refunded => EventType::BookingRefunded,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A durable booking row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    /// Booking identifier (time-ordered)
    pub id: BookingId,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Owning user
    pub user_id: UserId,
    /// Event booked
    pub event_id: EventId,
    /// Show booked
    pub show_id: ShowId,
    /// Zone booked
    pub zone_id: ZoneId,
    /// Seats held
    pub quantity: u32,
    /// Price per seat at reservation time
    pub unit_price: Money,
    /// `unit_price * quantity`
    pub total_amount: Money,
    /// Current lifecycle status
    pub status: BookingStatus,
    /// Client-supplied dedupe key (globally unique)
    pub idempotency_key: String,
    /// Payment reference, set at confirm time
    pub payment_id: Option<PaymentId>,
    /// When seats were held
    pub reserved_at: DateTime<Utc>,
    /// When the hold lapses unless confirmed
    pub reservation_expires_at: DateTime<Utc>,
    /// When payment succeeded
    pub confirmed_at: Option<DateTime<Utc>>,
    /// Set iff status is CONFIRMED or REFUNDED
    pub confirmation_code: Option<String>,
}

impl Booking {
    /// Whether `user` may read this booking.
    #[must_use]
    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.user_id == user
    }
}

/// Input for creating a booking whose seats are already held in Redis.
///
/// The reservation engine runs first; the row is then inserted directly in
/// RESERVED with the `booking.created` outbox row in the same transaction,
/// so a successful reserve produces exactly one outbox row.
#[derive(Clone, Debug)]
pub struct NewBooking {
    /// Pre-minted booking id (shared with the Redis reservation)
    pub id: BookingId,
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Owning user
    pub user_id: UserId,
    /// Event booked
    pub event_id: EventId,
    /// Show booked
    pub show_id: ShowId,
    /// Zone booked
    pub zone_id: ZoneId,
    /// Seats held
    pub quantity: u32,
    /// Price per seat
    pub unit_price: Money,
    /// Client-supplied dedupe key
    pub idempotency_key: String,
    /// When seats were held
    pub reserved_at: DateTime<Utc>,
    /// When the hold lapses
    pub reservation_expires_at: DateTime<Utc>,
}

impl NewBooking {
    /// Total order amount.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::InvalidQuantity`] if the multiplication
    /// overflows.
    pub fn total_amount(&self) -> Result<Money, DomainError> {
        self.unit_price
            .checked_multiply(self.quantity)
            .ok_or(DomainError::InvalidQuantity {
                quantity: self.quantity,
            })
    }
}

/// Per-user booking summary for an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingSummary {
    /// Seats currently held or sold to this user for the event
    pub booked_count: u32,
    /// The per-event cap
    pub max_allowed: u32,
    /// Seats the user may still book
    pub remaining_slots: u32,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use BookingStatus as S;
        assert!(S::Pending.can_transition_to(S::Reserved));
        assert!(S::Reserved.can_transition_to(S::Confirmed));
        assert!(S::Reserved.can_transition_to(S::Cancelled));
        assert!(S::Reserved.can_transition_to(S::Expired));
        assert!(S::Confirmed.can_transition_to(S::Refunded));
    }

    #[test]
    fn confirmed_never_regresses() {
        use BookingStatus as S;
        assert!(!S::Confirmed.can_transition_to(S::Reserved));
        assert!(!S::Confirmed.can_transition_to(S::Pending));
        assert!(!S::Confirmed.can_transition_to(S::Cancelled));
    }

    #[test]
    fn terminal_states_admit_nothing() {
        use BookingStatus as S;
        for terminal in [S::Cancelled, S::Expired, S::Refunded] {
            assert!(terminal.is_terminal());
            for target in [
                S::Pending,
                S::Reserved,
                S::Confirmed,
                S::Cancelled,
                S::Expired,
                S::Refunded,
            ] {
                assert!(!terminal.can_transition_to(target));
            }
        }
    }

    #[test]
    fn status_round_trips_through_db_strings() {
        use BookingStatus as S;
        for status in [
            S::Pending,
            S::Reserved,
            S::Confirmed,
            S::Cancelled,
            S::Expired,
            S::Refunded,
        ] {
            assert_eq!(BookingStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(BookingStatus::parse("reserved").is_err());
    }

    #[test]
    fn seat_holding_states() {
        use BookingStatus as S;
        assert!(S::Reserved.holds_seats());
        assert!(S::Confirmed.holds_seats());
        assert!(!S::Cancelled.holds_seats());
        assert!(!S::Expired.holds_seats());
    }

    #[test]
    fn total_amount_multiplies_price() {
        let new = NewBooking {
            id: BookingId::mint(),
            tenant_id: TenantId::new(),
            user_id: UserId::new(),
            event_id: EventId::new(),
            show_id: ShowId::new(),
            zone_id: ZoneId::new(),
            quantity: 3,
            unit_price: Money::from_cents(1500),
            idempotency_key: "key-1".to_string(),
            reserved_at: Utc::now(),
            reservation_expires_at: Utc::now() + chrono::Duration::minutes(10),
        };
        assert_eq!(new.total_amount().unwrap(), Money::from_cents(4500));
    }
}
