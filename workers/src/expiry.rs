//! Reservation expiry sweeper.
//!
//! Redis TTL deletes a lapsed reservation hash but cannot restore the
//! availability counter, so this sweeper owns expiry: it claims
//! RESERVED rows past their window from Postgres (`FOR UPDATE SKIP
//! LOCKED`, so replicas share the backlog), transitions each to EXPIRED
//! with its `booking.expired` outbox row, then returns the seats to the
//! Redis pool.

use rushtix_core::{BookingRepository, Clock, DomainError, ReservationStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// The expiry sweeper.
pub struct ExpirySweeper {
    repo: Arc<dyn BookingRepository>,
    engine: Arc<dyn ReservationStore>,
    clock: Arc<dyn Clock>,
    /// Sweep interval (spec range 1–5 s)
    pub interval: Duration,
    /// Rows claimed per sweep
    pub batch_size: u32,
}

impl ExpirySweeper {
    /// Create a sweeper.
    #[must_use]
    pub fn new(
        repo: Arc<dyn BookingRepository>,
        engine: Arc<dyn ReservationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            engine,
            clock,
            interval: Duration::from_secs(2),
            batch_size: 100,
        }
    }

    /// One sweep: expire a batch and restore inventory.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the claim; per-row Redis failures are
    /// logged and left to reconciliation.
    pub async fn sweep(&self) -> Result<usize, DomainError> {
        let now = self.clock.now();
        let expired = self.repo.expire_batch(now, self.batch_size).await?;

        for booking in &expired {
            match self
                .engine
                .release(booking.event_id, booking.zone_id, booking.id, booking.user_id)
                .await
            {
                Ok(quantity) => {
                    tracing::debug!(
                        booking_id = %booking.id,
                        quantity,
                        "expired reservation released"
                    );
                }
                // The hash can already be gone (TTL fired first, or a
                // concurrent release); reconciliation repairs the counter.
                Err(DomainError::AlreadyReleased(_)) => {}
                Err(e) => {
                    tracing::error!(
                        booking_id = %booking.id,
                        error = %e,
                        "failed to restore inventory for expired booking"
                    );
                }
            }
        }

        Ok(expired.len())
    }

    /// Sweep loop. Returns when `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let sweeper = Arc::clone(&self);
        crate::supervisor::run_interval("expiry-sweeper", self.interval, shutdown, move || {
            let sweeper = Arc::clone(&sweeper);
            async move {
                match sweeper.sweep().await {
                    Ok(0) => {}
                    Ok(count) => {
                        metrics::counter!("sweeper.expired").increment(count as u64);
                    }
                    Err(e) => tracing::error!(error = %e, "expiry sweep failed"),
                }
            }
        })
        .await;
    }
}
