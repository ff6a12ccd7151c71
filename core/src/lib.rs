//! # Rushtix Core
//!
//! Domain types and contracts for the Rushtix booking platform.
//!
//! This crate holds everything the other workspace members agree on:
//!
//! - **Identifiers**: newtype ids for users, events, shows, zones, bookings,
//!   payments and sagas
//! - **Money**: cents-based value object (no floating point)
//! - **Booking state machine**: legal status transitions and the rules that
//!   gate them
//! - **Domain events**: the JSON envelope carried through the outbox and the
//!   message bus
//! - **Error taxonomy**: stable error codes with their HTTP mapping
//! - **Repository contracts**: storage traits implemented by
//!   `rushtix-postgres` (production) and `rushtix-testing` (in-memory)
//!
//! ## Architecture principles
//!
//! - Redis owns runtime inventory; Postgres owns durable booking state
//! - Every durable state change co-commits exactly one outbox row
//! - Services depend on traits, never on concrete stores
//! - Errors are typed values inside the core; HTTP translation happens at
//!   the ingress boundary only

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod booking;
pub mod bus;
pub mod error;
pub mod event;
pub mod idempotency;
pub mod outbox;
pub mod queue;
pub mod repository;
pub mod reservation;
pub mod saga;
pub mod types;

pub use booking::{Booking, BookingStatus, BookingSummary, NewBooking};
pub use bus::{EventPublisher, PublishFuture};
pub use error::{DomainError, ErrorCode};
pub use event::{BookingEventData, DomainEvent, EventType, PaymentEventData, SCHEMA_VERSION};
pub use idempotency::{BeginOutcome, IdempotencyBackend, IdempotencyRecord, IdempotencyStatus};
pub use outbox::{NewOutboxRow, OutboxRow};
pub use queue::{AdmissionQueue, QueuePosition, QueueStatus, ReleaseReport};
pub use repository::{
    BookingRepository, Clock, OutboxStore, RepoFuture, SagaStore, SystemClock, ZoneReconciliation,
    ZoneRepository,
};
pub use reservation::{ReservationOutcome, ReservationStore, ReserveRequest};
pub use saga::{SagaInstance, SagaStatus, SagaStepRecord, StepOutcome};
pub use types::{
    BookingId, EventId, Money, PaymentId, Role, SagaId, ShowId, TenantId, UserClaims, UserId,
    Zone, ZoneId,
};

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
