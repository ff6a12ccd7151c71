//! In-memory implementations of the Rushtix contracts.
//!
//! Every storage and bus trait from `rushtix-core` has a deterministic
//! in-memory twin here, so services and end-to-end scenarios run without
//! Postgres, Redis or a broker. Semantics mirror the production
//! implementations, including the awkward parts (gated transitions,
//! outbox co-commit, reservation caps, single-use passes), because the
//! tests assert exactly those.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bookings;
pub mod bus;
pub mod clock;
pub mod idempotency;
pub mod outbox;
pub mod queue;
pub mod reservations;
pub mod sagas;
pub mod zones;

pub use bookings::MemoryBookingRepository;
pub use bus::{MemoryBus, PublishedMessage};
pub use clock::FixedClock;
pub use idempotency::MemoryIdempotency;
pub use outbox::MemoryOutboxStore;
pub use queue::MemoryQueue;
pub use reservations::MemoryReservationStore;
pub use sagas::MemorySagaStore;
pub use zones::MemoryZoneRepository;
