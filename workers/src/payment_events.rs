//! Payment-events consumer.
//!
//! The payment service is an external collaborator; its authority reaches
//! this system only through the event stream. This handler turns payment
//! outcomes into booking effects:
//!
//! - `payment.success` → start the post-payment saga
//! - `payment.failed` / `payment.cancelled` → release seats, booking →
//!   CANCELLED
//! - `payment.refunded` → release seats, booking → REFUNDED
//!
//! Idempotent by current-status check: replaying any of these messages
//! against an already-transitioned booking is a no-op.

use rushtix_core::{
    BookingRepository, BookingStatus, Clock, DomainError, EventType, PaymentEventData,
    ReservationStore,
};
use rushtix_redpanda::{ConsumeError, EventHandler, ReceivedEvent};
use rushtix_saga::Orchestrator;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Consumer for `payment-events` and `payment.seat-release`.
pub struct PaymentEventsHandler {
    repo: Arc<dyn BookingRepository>,
    engine: Arc<dyn ReservationStore>,
    orchestrator: Arc<Orchestrator>,
    clock: Arc<dyn Clock>,
}

impl PaymentEventsHandler {
    /// Create the handler.
    #[must_use]
    pub fn new(
        repo: Arc<dyn BookingRepository>,
        engine: Arc<dyn ReservationStore>,
        orchestrator: Arc<Orchestrator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            repo,
            engine,
            orchestrator,
            clock,
        }
    }

    async fn on_payment_success(&self, data: PaymentEventData) -> Result<(), DomainError> {
        // Replay guard: a booking that already confirmed has a saga.
        if let Some(booking) = self.repo.get(data.booking_id).await? {
            if booking.status != BookingStatus::Reserved {
                tracing::debug!(
                    booking_id = %data.booking_id,
                    status = %booking.status,
                    "payment.success replay on settled booking, ignoring"
                );
                return Ok(());
            }
        } else {
            tracing::warn!(booking_id = %data.booking_id, "payment.success for unknown booking");
            return Ok(());
        }

        self.orchestrator
            .start(
                "post-payment",
                serde_json::json!({
                    "version": 1,
                    "booking_id": data.booking_id,
                    "payment_id": data.payment_id,
                }),
            )
            .await?;
        Ok(())
    }

    /// Release seats and settle the row into `target`.
    async fn release_booking(
        &self,
        data: &PaymentEventData,
        target: BookingStatus,
    ) -> Result<(), DomainError> {
        let Some(booking) = self.repo.get(data.booking_id).await? else {
            tracing::warn!(booking_id = %data.booking_id, "payment event for unknown booking");
            return Ok(());
        };

        // Current-status check makes redelivery a no-op.
        let actionable = match target {
            BookingStatus::Cancelled => booking.status == BookingStatus::Reserved,
            BookingStatus::Refunded => booking.status == BookingStatus::Confirmed,
            _ => false,
        };
        if !actionable {
            tracing::debug!(
                booking_id = %booking.id,
                status = %booking.status,
                target = %target,
                "payment event replay, ignoring"
            );
            return Ok(());
        }

        match self
            .engine
            .release(booking.event_id, booking.zone_id, booking.id, booking.user_id)
            .await
        {
            Ok(_) | Err(DomainError::AlreadyReleased(_)) => {}
            Err(e) => return Err(e),
        }

        let now = self.clock.now();
        let result = match target {
            BookingStatus::Cancelled => self.repo.cancel(booking.id, now).await,
            BookingStatus::Refunded => self.repo.refund(booking.id, now).await,
            _ => return Ok(()),
        };

        match result {
            Ok(_) => {
                metrics::counter!("worker.seat_release", "target" => target.as_str())
                    .increment(1);
                Ok(())
            }
            // Lost the race against another replica: the work is done.
            Err(DomainError::InvalidStatus { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

impl EventHandler for PaymentEventsHandler {
    fn handle(
        &self,
        event: ReceivedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsumeError>> + Send + '_>> {
        Box::pin(async move {
            let Some(event_type) = event.event.typed() else {
                tracing::debug!(event_type = %event.event.event_type, "unknown payment event type, skipping");
                return Ok(());
            };

            let data: PaymentEventData =
                serde_json::from_value(event.event.data.clone()).map_err(|e| {
                    ConsumeError::Permanent(format!("undecodable payment event: {e}"))
                })?;

            let result = match event_type {
                EventType::PaymentSuccess => self.on_payment_success(data).await,
                EventType::PaymentFailed | EventType::PaymentCancelled => {
                    self.release_booking(&data, BookingStatus::Cancelled).await
                }
                EventType::PaymentRefunded => {
                    self.release_booking(&data, BookingStatus::Refunded).await
                }
                other => {
                    tracing::debug!(event_type = %other, "non-payment event on payment topic, skipping");
                    Ok(())
                }
            };

            result.map_err(|e| {
                if e.is_transient() {
                    ConsumeError::Transient(e.to_string())
                } else {
                    ConsumeError::Permanent(e.to_string())
                }
            })
        })
    }
}
