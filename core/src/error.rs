//! Error taxonomy with stable wire codes.
//!
//! Inside the core, failures are typed `DomainError` values. Handlers map
//! them to HTTP at the ingress boundary only, via [`ErrorCode`], which
//! pins the code string and status for every failure class.

use crate::types::{BookingId, EventId, UserId};
use thiserror::Error;

/// Stable, client-visible error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)] // Names are the documentation
pub enum ErrorCode {
    // Validation (400)
    InvalidUserId,
    InvalidQuantity,
    MissingIdempotencyKey,
    InvalidRequest,
    // Auth (401/403)
    MissingToken,
    InvalidToken,
    Forbidden,
    // Not found (404)
    BookingNotFound,
    EventNotFound,
    ReservationNotFound,
    // Conflict (409)
    InsufficientSeats,
    MaxTicketsExceeded,
    AlreadyConfirmed,
    AlreadyReleased,
    RequestInProgress,
    // Semantic (422)
    InvalidBookingStatus,
    IdempotencyKeyReused,
    // Throttle (429)
    TooManyRequests,
    // Server (5xx)
    InternalError,
    DependencyUnavailable,
}

impl ErrorCode {
    /// Wire form of the code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidUserId => "INVALID_USER_ID",
            Self::InvalidQuantity => "INVALID_QUANTITY",
            Self::MissingIdempotencyKey => "MISSING_IDEMPOTENCY_KEY",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MissingToken => "MISSING_TOKEN",
            Self::InvalidToken => "INVALID_TOKEN",
            Self::Forbidden => "FORBIDDEN",
            Self::BookingNotFound => "BOOKING_NOT_FOUND",
            Self::EventNotFound => "EVENT_NOT_FOUND",
            Self::ReservationNotFound => "RESERVATION_NOT_FOUND",
            Self::InsufficientSeats => "INSUFFICIENT_SEATS",
            Self::MaxTicketsExceeded => "MAX_TICKETS_EXCEEDED",
            Self::AlreadyConfirmed => "ALREADY_CONFIRMED",
            Self::AlreadyReleased => "ALREADY_RELEASED",
            Self::RequestInProgress => "REQUEST_IN_PROGRESS",
            Self::InvalidBookingStatus => "INVALID_BOOKING_STATUS",
            Self::IdempotencyKeyReused => "IDEMPOTENCY_KEY_REUSED",
            Self::TooManyRequests => "TOO_MANY_REQUESTS",
            Self::InternalError => "INTERNAL_ERROR",
            Self::DependencyUnavailable => "DEPENDENCY_UNAVAILABLE",
        }
    }

    /// HTTP status this code maps to at the ingress.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::InvalidUserId
            | Self::InvalidQuantity
            | Self::MissingIdempotencyKey
            | Self::InvalidRequest => 400,
            Self::MissingToken | Self::InvalidToken => 401,
            Self::Forbidden => 403,
            Self::BookingNotFound | Self::EventNotFound | Self::ReservationNotFound => 404,
            Self::InsufficientSeats
            | Self::MaxTicketsExceeded
            | Self::AlreadyConfirmed
            | Self::AlreadyReleased
            | Self::RequestInProgress => 409,
            Self::InvalidBookingStatus | Self::IdempotencyKeyReused => 422,
            Self::TooManyRequests => 429,
            Self::InternalError => 500,
            Self::DependencyUnavailable => 503,
        }
    }
}

/// Typed failures produced inside the core.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The zone has fewer seats than requested
    #[error("insufficient seats available")]
    InsufficientSeats,

    /// The reservation would push the user past the per-event cap
    #[error("user {user_id} would exceed the cap of {max_allowed} tickets for event {event_id}")]
    MaxTicketsExceeded {
        /// The user at the cap
        user_id: UserId,
        /// The event the cap applies to
        event_id: EventId,
        /// The cap value
        max_allowed: u32,
    },

    /// Quantity outside the zone's per-order bounds (or zero)
    #[error("invalid quantity: {quantity}")]
    InvalidQuantity {
        /// The rejected quantity
        quantity: u32,
    },

    /// Booking does not exist
    #[error("booking {0} not found")]
    BookingNotFound(BookingId),

    /// Redis reservation does not exist (never created, or TTL fired)
    #[error("reservation {0} not found")]
    ReservationNotFound(BookingId),

    /// Caller is not the reservation owner
    #[error("user does not own this reservation")]
    InvalidUserId,

    /// Confirm called on an already confirmed booking
    #[error("booking {0} is already confirmed")]
    AlreadyConfirmed(BookingId),

    /// Release called on an already released booking
    #[error("booking {0} is already released")]
    AlreadyReleased(BookingId),

    /// The requested transition is illegal from the current status
    #[error("illegal booking transition from {from} to {to}")]
    InvalidStatus {
        /// Status the row is in
        from: crate::booking::BookingStatus,
        /// Status the caller asked for
        to: crate::booking::BookingStatus,
    },

    /// The Redis reservation is in a state the operation does not accept
    #[error("reservation {0} is not in an operable state")]
    InvalidReservationStatus(BookingId),

    /// Caller may not read or mutate this resource
    #[error("forbidden")]
    Forbidden,

    /// A required backing service did not answer
    #[error("dependency unavailable: {0}")]
    DependencyUnavailable(String),

    /// Storage-layer failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Bus-layer failure
    #[error("bus error: {0}")]
    Bus(String),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invariant-breaking condition that should never occur
    #[error("internal error: {0}")]
    Internal(String),
}

impl DomainError {
    /// The stable wire code for this failure.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::InsufficientSeats => ErrorCode::InsufficientSeats,
            Self::MaxTicketsExceeded { .. } => ErrorCode::MaxTicketsExceeded,
            Self::InvalidQuantity { .. } => ErrorCode::InvalidQuantity,
            Self::BookingNotFound(_) => ErrorCode::BookingNotFound,
            Self::ReservationNotFound(_) => ErrorCode::ReservationNotFound,
            Self::InvalidUserId => ErrorCode::InvalidUserId,
            Self::AlreadyConfirmed(_) => ErrorCode::AlreadyConfirmed,
            Self::AlreadyReleased(_) => ErrorCode::AlreadyReleased,
            Self::InvalidStatus { .. } => ErrorCode::InvalidBookingStatus,
            Self::InvalidReservationStatus(_) => ErrorCode::InvalidBookingStatus,
            Self::Forbidden => ErrorCode::Forbidden,
            Self::DependencyUnavailable(_) => ErrorCode::DependencyUnavailable,
            Self::Storage(_) | Self::Bus(_) | Self::Serialization(_) | Self::Internal(_) => {
                ErrorCode::InternalError
            }
        }
    }

    /// Whether retrying the same call may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DependencyUnavailable(_) | Self::Storage(_) | Self::Bus(_)
        )
    }
}
