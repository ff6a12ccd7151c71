//! Booking-side executor for the post-payment saga.
//!
//! Consumes `saga.commands.post-payment`, performs each step, and replies
//! on `saga.events.post-payment` keyed by saga id. Every effect is
//! idempotent: the orchestrator re-dispatches on crash recovery, so a
//! command may arrive more than once:
//!
//! - `confirm-booking`: RESERVED → CONFIRMED in both stores; an
//!   already-confirmed booking counts as success
//! - `release-booking` (compensation): seats back to the pool, row →
//!   CANCELLED; an already-released hold counts as success
//! - `issue-tickets` / `void-tickets` / `notify-user`: acknowledged here;
//!   the ticketing and notification services own the real effects and
//!   consume the same command topic

use rushtix_core::{
    BookingId, BookingRepository, BookingStatus, Clock, DomainError, EventPublisher, PaymentId,
    ReservationStore,
};
use rushtix_redpanda::{ConsumeError, EventHandler, ReceivedEvent, topics};
use rushtix_saga::{COMMAND_EVENT_TYPE, SagaCommand, SagaReply};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Saga payload fields this executor needs.
#[derive(Debug, Deserialize)]
struct PostPaymentData {
    booking_id: BookingId,
    payment_id: PaymentId,
}

/// Executes booking-side saga steps.
pub struct PostPaymentExecutor {
    repo: Arc<dyn BookingRepository>,
    engine: Arc<dyn ReservationStore>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
}

impl PostPaymentExecutor {
    /// Create the executor.
    #[must_use]
    pub fn new(
        repo: Arc<dyn BookingRepository>,
        engine: Arc<dyn ReservationStore>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            engine,
            publisher,
            clock,
        }
    }

    /// Run one step; `Ok(())` is success, `Err(code)` feeds the reply.
    async fn execute(&self, command: &SagaCommand) -> Result<(), String> {
        let data: PostPaymentData = serde_json::from_value(command.data.clone())
            .map_err(|_| "INVALID_SAGA_DATA".to_string())?;

        match command.step_name.as_str() {
            "confirm-booking" => self.confirm_booking(data).await,
            "release-booking" => self.release_booking(data).await,
            "issue-tickets" | "void-tickets" | "notify-user" => Ok(()),
            other => {
                tracing::warn!(step = other, "unknown saga step");
                Err("UNKNOWN_STEP".to_string())
            }
        }
    }

    async fn confirm_booking(&self, data: PostPaymentData) -> Result<(), String> {
        let booking = self
            .repo
            .get(data.booking_id)
            .await
            .map_err(|e| transient_code(&e))?
            .ok_or_else(|| "BOOKING_NOT_FOUND".to_string())?;

        if booking.status == BookingStatus::Confirmed {
            return Ok(());
        }
        if booking.status != BookingStatus::Reserved {
            return Err("INVALID_BOOKING_STATUS".to_string());
        }

        match self
            .engine
            .confirm(
                booking.event_id,
                booking.zone_id,
                booking.id,
                booking.user_id,
                data.payment_id,
            )
            .await
        {
            Ok(_) | Err(DomainError::AlreadyConfirmed(_)) => {}
            Err(DomainError::ReservationNotFound(_)) => {
                // The hold lapsed between payment and confirmation.
                return Err("RESERVATION_NOT_FOUND".to_string());
            }
            Err(e) => return Err(transient_code(&e)),
        }

        match self
            .repo
            .confirm(booking.id, booking.user_id, data.payment_id, self.clock.now())
            .await
        {
            Ok(_) | Err(DomainError::AlreadyConfirmed(_)) => Ok(()),
            Err(e) => Err(transient_code(&e)),
        }
    }

    async fn release_booking(&self, data: PostPaymentData) -> Result<(), String> {
        let Some(booking) = self
            .repo
            .get(data.booking_id)
            .await
            .map_err(|e| transient_code(&e))?
        else {
            return Ok(());
        };

        match self
            .engine
            .release(booking.event_id, booking.zone_id, booking.id, booking.user_id)
            .await
        {
            Ok(_) | Err(DomainError::AlreadyReleased(_)) => {}
            Err(e) => return Err(transient_code(&e)),
        }

        match self.repo.cancel(booking.id, self.clock.now()).await {
            Ok(_) | Err(DomainError::InvalidStatus { .. }) => Ok(()),
            Err(e) => Err(transient_code(&e)),
        }
    }
}

fn transient_code(err: &DomainError) -> String {
    if err.is_transient() {
        "DEPENDENCY_UNAVAILABLE".to_string()
    } else {
        err.code().as_str().to_string()
    }
}

impl EventHandler for PostPaymentExecutor {
    fn handle(
        &self,
        event: ReceivedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsumeError>> + Send + '_>> {
        Box::pin(async move {
            if event.event.event_type != COMMAND_EVENT_TYPE {
                return Ok(());
            }

            let command: SagaCommand = serde_json::from_value(event.event.data.clone())
                .map_err(|e| ConsumeError::Permanent(format!("undecodable saga command: {e}")))?;

            let started = std::time::Instant::now();
            let result = self.execute(&command).await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let reply = SagaReply {
                saga_id: command.saga_id,
                saga_name: command.saga_name.clone(),
                step_name: command.step_name.clone(),
                step_index: command.step_index,
                success: result.is_ok(),
                error_code: result.err(),
                duration_ms,
            };

            let envelope = reply
                .envelope(self.clock.now())
                .map_err(|e| ConsumeError::Permanent(format!("reply encoding failed: {e}")))?;

            self.publisher
                .publish(
                    &topics::saga_events(&command.saga_name),
                    &command.saga_id.to_string(),
                    &envelope,
                )
                .await
                .map_err(|e| ConsumeError::Transient(format!("reply publish failed: {e}")))
        })
    }
}
