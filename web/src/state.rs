//! Shared application state.

use crate::auth::TokenVerifier;
use crate::middleware::rate_limit::IngressLimiter;
use rushtix_core::{
    AdmissionQueue, BookingRepository, Clock, IdempotencyBackend, ReservationStore, TenantId,
    ZoneRepository,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Booking-path settings.
#[derive(Clone, Debug)]
pub struct BookingSettings {
    /// Tenant the deployment serves
    pub tenant_id: TenantId,
    /// Per-event ticket cap per user
    pub max_tickets_per_user: u32,
    /// Reservation window
    pub reservation_ttl: Duration,
}

impl Default for BookingSettings {
    fn default() -> Self {
        Self {
            tenant_id: TenantId::new(),
            max_tickets_per_user: 10,
            reservation_ttl: Duration::from_secs(600),
        }
    }
}

/// Everything the handlers and middleware share.
///
/// Stores are trait objects: production wires Redis and Postgres,
/// tests wire the in-memory implementations.
#[derive(Clone)]
pub struct AppState {
    /// Durable booking storage
    pub bookings: Arc<dyn BookingRepository>,
    /// Seat-zone projection
    pub zones: Arc<dyn ZoneRepository>,
    /// Atomic inventory operations
    pub reservations: Arc<dyn ReservationStore>,
    /// Virtual waiting room
    pub queue: Arc<dyn AdmissionQueue>,
    /// Idempotency records
    pub idempotency: Arc<dyn IdempotencyBackend>,
    /// Token-bucket rate limiting (rules + backend)
    pub limiter: Arc<IngressLimiter>,
    /// Global in-flight request cap
    pub concurrency: Arc<Semaphore>,
    /// Bearer-token verification
    pub verifier: Arc<TokenVerifier>,
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Booking-path settings
    pub settings: BookingSettings,
}
