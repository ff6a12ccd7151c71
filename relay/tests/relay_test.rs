//! Relay behavior over the in-memory outbox and bus.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use chrono::Utc;
use rushtix_core::bus::PublishFuture;
use rushtix_core::{
    Clock, DomainError, DomainEvent, EventPublisher, EventType, NewOutboxRow, OutboxStore,
};
use rushtix_relay::{OutboxRelay, RelayConfig};
use rushtix_testing::{FixedClock, MemoryBus, MemoryOutboxStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use uuid::Uuid;

/// A publisher that can be flipped into a failing state. DLQ topics are
/// exempt so parking behavior stays observable while the broker "fails".
struct FlakyBus {
    inner: MemoryBus,
    failing: AtomicBool,
    attempts: AtomicUsize,
}

impl FlakyBus {
    fn new() -> Self {
        Self {
            inner: MemoryBus::new(),
            failing: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
        }
    }

    fn fail(&self, on: bool) {
        self.failing.store(on, Ordering::SeqCst);
    }
}

impl EventPublisher for FlakyBus {
    fn publish(&self, topic: &str, key: &str, event: &DomainEvent) -> PublishFuture<'_> {
        let payload = serde_json::to_vec(event).unwrap_or_default();
        self.publish_raw(topic, key, &payload)
    }

    fn publish_raw(&self, topic: &str, key: &str, payload: &[u8]) -> PublishFuture<'_> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) && !topic.ends_with(".dlq") {
            return Box::pin(async { Err(DomainError::Bus("broker unreachable".to_string())) });
        }
        self.inner.publish_raw(topic, key, payload)
    }
}

struct Harness {
    relay: OutboxRelay,
    outbox: Arc<MemoryOutboxStore>,
    bus: Arc<FlakyBus>,
    clock: Arc<FixedClock>,
}

fn harness(config: RelayConfig) -> Harness {
    let outbox = Arc::new(MemoryOutboxStore::new());
    let bus = Arc::new(FlakyBus::new());
    let clock = Arc::new(FixedClock::from_system());

    let outbox_dyn: Arc<dyn OutboxStore> = Arc::clone(&outbox) as Arc<dyn OutboxStore>;
    let bus_dyn: Arc<dyn EventPublisher> = Arc::clone(&bus) as Arc<dyn EventPublisher>;
    let clock_dyn: Arc<dyn Clock> = Arc::clone(&clock) as Arc<dyn Clock>;
    let relay = OutboxRelay::new(outbox_dyn, bus_dyn, clock_dyn, config);

    Harness {
        relay,
        outbox,
        bus,
        clock,
    }
}

fn seed_row(outbox: &MemoryOutboxStore, clock: &FixedClock, event_type: EventType) -> Uuid {
    let aggregate = Uuid::new_v4();
    let event = DomainEvent::new(event_type, clock.now(), &serde_json::json!({"q": 1})).unwrap();
    let row = NewOutboxRow::from_event(aggregate, &event, serde_json::json!({})).unwrap();
    outbox.insert(row, clock.now());
    aggregate
}

#[tokio::test]
async fn tick_publishes_pending_rows_and_marks_them_sent() {
    let h = harness(RelayConfig::default());
    let aggregate = seed_row(&h.outbox, &h.clock, EventType::BookingCreated);

    let claimed = h.relay.tick().await.unwrap();
    assert_eq!(claimed, 1);

    let published = h.bus.inner.messages_for("booking-events");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key, aggregate.to_string());
    assert_eq!(
        published[0].payload["event_type"],
        serde_json::json!("booking.created")
    );

    let rows = h.outbox.rows();
    assert!(rows[0].sent_at.is_some());

    // A second tick finds nothing.
    assert_eq!(h.relay.tick().await.unwrap(), 0);
}

#[tokio::test]
async fn rows_drain_in_created_at_order() {
    let h = harness(RelayConfig::default());
    for _ in 0..5 {
        seed_row(&h.outbox, &h.clock, EventType::BookingCreated);
        h.clock.advance(chrono::Duration::milliseconds(10));
    }

    h.relay.tick().await.unwrap();

    let expected: Vec<String> = h.outbox.rows().iter().map(|r| r.aggregate_id.to_string()).collect();
    let published: Vec<String> = h
        .bus
        .inner
        .messages_for("booking-events")
        .iter()
        .map(|m| m.key.clone())
        .collect();
    assert_eq!(published, expected);
}

#[tokio::test]
async fn publish_failure_schedules_a_backoff_retry() {
    let h = harness(RelayConfig::default());
    seed_row(&h.outbox, &h.clock, EventType::BookingConfirmed);

    h.bus.fail(true);
    h.relay.tick().await.unwrap();

    let row = &h.outbox.rows()[0];
    assert!(row.sent_at.is_none());
    assert_eq!(row.attempts, 1);
    assert!(row.last_error.as_deref().unwrap().contains("broker unreachable"));
    let next_retry = row.next_retry_at.unwrap();
    assert!(next_retry > h.clock.now());

    // Not due yet: the next tick skips it.
    assert_eq!(h.relay.tick().await.unwrap(), 0);

    // Once due and the broker is back, it drains.
    h.bus.fail(false);
    h.clock.advance(chrono::Duration::seconds(301));
    assert_eq!(h.relay.tick().await.unwrap(), 1);
    assert!(h.outbox.rows()[0].sent_at.is_some());
}

#[tokio::test]
async fn exhausted_rows_move_to_the_dlq() {
    let config = RelayConfig {
        max_attempts: 2,
        ..RelayConfig::default()
    };
    let h = harness(config);
    seed_row(&h.outbox, &h.clock, EventType::BookingExpired);

    // First failure schedules a retry.
    h.bus.fail(true);
    h.relay.tick().await.unwrap();
    assert_eq!(h.outbox.rows()[0].attempts, 1);

    // Second failure hits the cap: the row is wrapped onto the DLQ and
    // retired from active polling.
    h.clock.advance(chrono::Duration::seconds(600));
    h.relay.tick().await.unwrap();

    let dlq = h.bus.inner.messages_for("booking-events.dlq");
    assert_eq!(dlq.len(), 1);
    let wrapper = &dlq[0].payload;
    assert_eq!(wrapper["original_topic"], serde_json::json!("booking-events"));
    assert_eq!(wrapper["source"], serde_json::json!("outbox-relay"));
    assert_eq!(wrapper["attempts"], serde_json::json!(2));
    assert_eq!(
        wrapper["payload"]["event_type"],
        serde_json::json!("booking.expired")
    );

    assert!(h.outbox.rows()[0].sent_at.is_some());
    // Nothing was ever delivered to the real topic.
    assert!(h.bus.inner.messages_for("booking-events").is_empty());
}

#[tokio::test]
async fn cleanup_deletes_only_old_sent_rows() {
    let h = harness(RelayConfig::default());
    seed_row(&h.outbox, &h.clock, EventType::BookingCreated);
    seed_row(&h.outbox, &h.clock, EventType::BookingCreated);

    h.relay.tick().await.unwrap();
    assert!(h.outbox.rows().iter().all(|r| r.sent_at.is_some()));

    // Inside retention: nothing goes.
    let removed = h
        .outbox
        .delete_sent_before(h.clock.now() - chrono::Duration::days(8))
        .await
        .unwrap();
    assert_eq!(removed, 0);

    // Past retention: both go.
    let removed = h
        .outbox
        .delete_sent_before(h.clock.now() + chrono::Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 2);
    assert!(h.outbox.rows().is_empty());
}
