//! Inventory-sync worker.
//!
//! Keeps the relational `seat_zones.available_seats` projection trailing
//! the Redis counters. Deltas from `booking.*` events accumulate in an
//! in-memory batch flushed every window (default 5 s) or at the batch
//! cap (default 1000 events), whichever comes first.
//!
//! The projection is advisory: duplicates or a lost batch skew it until
//! the next [`reconcile`] pass, which recomputes
//! `total_seats − confirmed` per zone from the bookings table and
//! rewrites both the projection and the Redis counter.

use rushtix_core::{
    BookingEventData, DomainError, EventId, EventType, ReservationStore, ZoneId, ZoneRepository,
};
use rushtix_redpanda::{ConsumeError, EventHandler, ReceivedEvent};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// One signed availability change for a zone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InventoryDelta {
    /// Event owning the zone (addresses the Redis counter)
    pub event_id: EventId,
    /// Zone to adjust
    pub zone_id: ZoneId,
    /// Signed seat delta
    pub delta: i64,
}

/// Bus handler translating `booking.*` events into deltas.
pub struct InventorySyncHandler {
    sender: mpsc::Sender<InventoryDelta>,
}

impl InventorySyncHandler {
    /// Create the handler over the batcher's channel.
    #[must_use]
    pub const fn new(sender: mpsc::Sender<InventoryDelta>) -> Self {
        Self { sender }
    }

    const fn delta_for(event_type: EventType, quantity: u32) -> Option<i64> {
        let quantity = quantity as i64;
        match event_type {
            // Seats leave the pool when held, return on any release path.
            EventType::BookingCreated => Some(-quantity),
            EventType::BookingCancelled | EventType::BookingExpired | EventType::BookingRefunded => {
                Some(quantity)
            }
            // Confirmation keeps seats held; no availability change.
            EventType::BookingConfirmed => None,
            EventType::PaymentSuccess
            | EventType::PaymentFailed
            | EventType::PaymentCancelled
            | EventType::PaymentRefunded => None,
        }
    }
}

impl EventHandler for InventorySyncHandler {
    fn handle(
        &self,
        event: ReceivedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsumeError>> + Send + '_>> {
        Box::pin(async move {
            let Some(event_type) = event.event.typed() else {
                return Ok(());
            };

            let data: BookingEventData =
                serde_json::from_value(event.event.data.clone()).map_err(|e| {
                    ConsumeError::Permanent(format!("undecodable booking event: {e}"))
                })?;

            let Some(delta) = Self::delta_for(event_type, data.quantity) else {
                return Ok(());
            };

            self.sender
                .send(InventoryDelta {
                    event_id: data.event_id,
                    zone_id: data.zone_id,
                    delta,
                })
                .await
                .map_err(|e| ConsumeError::Transient(format!("batcher unavailable: {e}")))
        })
    }
}

/// Accumulates deltas and flushes them to the projection.
pub struct InventoryBatcher {
    zones: Arc<dyn ZoneRepository>,
    receiver: mpsc::Receiver<InventoryDelta>,
    /// Flush window
    pub window: Duration,
    /// Flush when this many events are buffered
    pub max_events: usize,
}

impl InventoryBatcher {
    /// Create a batcher and the channel feeding it.
    #[must_use]
    pub fn channel(
        zones: Arc<dyn ZoneRepository>,
        buffer: usize,
    ) -> (mpsc::Sender<InventoryDelta>, Self) {
        let (tx, rx) = mpsc::channel(buffer);
        (
            tx,
            Self {
                zones,
                receiver: rx,
                window: Duration::from_secs(5),
                max_events: 1000,
            },
        )
    }

    /// Batch loop. Returns when `shutdown` flips (after a final flush).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut pending: HashMap<(EventId, ZoneId), i64> = HashMap::new();
        let mut buffered = 0usize;
        let mut window = tokio::time::interval(self.window);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = window.tick() => {
                    Self::flush(&self.zones, &mut pending, &mut buffered).await;
                }
                delta = self.receiver.recv() => {
                    let Some(delta) = delta else { break };
                    *pending.entry((delta.event_id, delta.zone_id)).or_insert(0) += delta.delta;
                    buffered += 1;
                    if buffered >= self.max_events {
                        Self::flush(&self.zones, &mut pending, &mut buffered).await;
                    }
                }
            }
        }

        Self::flush(&self.zones, &mut pending, &mut buffered).await;
        tracing::info!("inventory batcher stopped");
    }

    async fn flush(
        zones: &Arc<dyn ZoneRepository>,
        pending: &mut HashMap<(EventId, ZoneId), i64>,
        buffered: &mut usize,
    ) {
        if pending.is_empty() {
            return;
        }

        let batch = std::mem::take(pending);
        let events = *buffered;
        *buffered = 0;

        for ((_event_id, zone_id), delta) in batch {
            if delta == 0 {
                continue;
            }
            if let Err(e) = zones.apply_available_delta(zone_id, delta).await {
                tracing::error!(zone_id = %zone_id, delta, error = %e, "projection update failed");
            }
        }

        metrics::counter!("inventory_sync.flushed").increment(events as u64);
        tracing::debug!(events, "inventory projection flushed");
    }
}

/// Startup reconciliation: recompute availability from confirmed
/// bookings and rewrite the projection and the Redis counters.
///
/// # Errors
///
/// Returns storage errors from the count query; per-zone write failures
/// are logged and skipped.
pub async fn reconcile(
    zones: &Arc<dyn ZoneRepository>,
    engine: &Arc<dyn ReservationStore>,
) -> Result<usize, DomainError> {
    let counts = zones.reconciliation_counts().await?;
    let total = counts.len();

    for rec in counts {
        let expected = rec.expected_available();

        if let Err(e) = zones.set_available(rec.zone_id, expected).await {
            tracing::error!(zone_id = %rec.zone_id, error = %e, "projection reconcile failed");
            continue;
        }
        if let Err(e) = engine
            .set_availability(rec.event_id, rec.zone_id, expected)
            .await
        {
            tracing::error!(zone_id = %rec.zone_id, error = %e, "redis reconcile failed");
        }
    }

    tracing::info!(zones = total, "inventory reconciliation complete");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_follow_the_seat_lifecycle() {
        assert_eq!(
            InventorySyncHandler::delta_for(EventType::BookingCreated, 3),
            Some(-3)
        );
        assert_eq!(
            InventorySyncHandler::delta_for(EventType::BookingExpired, 3),
            Some(3)
        );
        assert_eq!(
            InventorySyncHandler::delta_for(EventType::BookingCancelled, 2),
            Some(2)
        );
        assert_eq!(
            InventorySyncHandler::delta_for(EventType::BookingRefunded, 1),
            Some(1)
        );
        assert_eq!(
            InventorySyncHandler::delta_for(EventType::BookingConfirmed, 4),
            None
        );
    }
}
