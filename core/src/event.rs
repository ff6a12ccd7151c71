//! Domain event envelope carried through the outbox and the message bus.
//!
//! Payloads are JSON blobs with a `version` field. Schema evolution is
//! add-only: consumers decode tolerantly and relays preserve unknown
//! fields untouched.

use crate::types::{BookingId, EventId, Money, PaymentId, UserId, ZoneId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Current envelope schema version.
pub const SCHEMA_VERSION: u16 = 1;

/// Every domain event type the core emits or consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Seats held, booking row created
    BookingCreated,
    /// Payment succeeded, seats sold
    BookingConfirmed,
    /// Hold released before payment
    BookingCancelled,
    /// Reservation window elapsed
    BookingExpired,
    /// Confirmed booking refunded
    BookingRefunded,
    /// Payment gateway reported success
    PaymentSuccess,
    /// Payment gateway reported failure
    PaymentFailed,
    /// Payment cancelled by the user or gateway
    PaymentCancelled,
    /// Payment refunded
    PaymentRefunded,
}

impl EventType {
    /// Dotted wire name, e.g. `booking.created`.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::BookingCreated => "booking.created",
            Self::BookingConfirmed => "booking.confirmed",
            Self::BookingCancelled => "booking.cancelled",
            Self::BookingExpired => "booking.expired",
            Self::BookingRefunded => "booking.refunded",
            Self::PaymentSuccess => "payment.success",
            Self::PaymentFailed => "payment.failed",
            Self::PaymentCancelled => "payment.cancelled",
            Self::PaymentRefunded => "payment.refunded",
        }
    }

    /// Parse a dotted wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "booking.created" => Some(Self::BookingCreated),
            "booking.confirmed" => Some(Self::BookingConfirmed),
            "booking.cancelled" => Some(Self::BookingCancelled),
            "booking.expired" => Some(Self::BookingExpired),
            "booking.refunded" => Some(Self::BookingRefunded),
            "payment.success" => Some(Self::PaymentSuccess),
            "payment.failed" => Some(Self::PaymentFailed),
            "payment.cancelled" => Some(Self::PaymentCancelled),
            "payment.refunded" => Some(Self::PaymentRefunded),
            _ => None,
        }
    }

    /// The topic this event type is published on.
    ///
    /// The namespace prefix (everything before the first dot) selects the
    /// topic, so `booking.*` shares one topic and keys preserve
    /// per-aggregate ordering.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::BookingCreated
            | Self::BookingConfirmed
            | Self::BookingCancelled
            | Self::BookingExpired
            | Self::BookingRefunded => "booking-events",
            Self::PaymentSuccess
            | Self::PaymentFailed
            | Self::PaymentCancelled
            | Self::PaymentRefunded => "payment-events",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The JSON envelope published on every topic.
///
/// `data` is an opaque blob; consumers decode the fields they know and
/// keep the rest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainEvent {
    /// Unique id of this event instance
    pub event_id: Uuid,
    /// Dotted event type name
    pub event_type: String,
    /// When the originating state change committed
    pub occurred_at: DateTime<Utc>,
    /// Envelope schema version (add-only evolution)
    pub version: u16,
    /// Event payload
    pub data: serde_json::Value,
}

impl DomainEvent {
    /// Build an envelope for `event_type` around a serializable payload.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the payload cannot be represented
    /// as JSON.
    pub fn new<T: Serialize>(
        event_type: EventType,
        occurred_at: DateTime<Utc>,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.as_str().to_string(),
            occurred_at,
            version: SCHEMA_VERSION,
            data: serde_json::to_value(data)?,
        })
    }

    /// The typed event type, if recognized.
    #[must_use]
    pub fn typed(&self) -> Option<EventType> {
        EventType::parse(&self.event_type)
    }
}

// ============================================================================
// Well-known payloads
// ============================================================================

/// Payload for `booking.*` events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingEventData {
    /// Booking the event concerns
    pub booking_id: BookingId,
    /// Owning user
    pub user_id: UserId,
    /// Event booked
    pub event_id: EventId,
    /// Zone booked
    pub zone_id: ZoneId,
    /// Seats held
    pub quantity: u32,
    /// Order total
    pub total_amount: Money,
    /// Status after the transition (database string form)
    pub status: String,
}

/// Payload for `payment.*` events, as emitted by the payment collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentEventData {
    /// Payment id at the gateway boundary
    pub payment_id: PaymentId,
    /// Booking the payment settles
    pub booking_id: BookingId,
    /// Amount settled
    pub amount: Money,
    /// Gateway-side failure code, when failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}
