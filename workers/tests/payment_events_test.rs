//! Payment-events consumer: releases on failure, refunds, saga kickoff,
//! and the idempotency of all three under redelivery.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use chrono::Utc;
use rushtix_core::reservation::ReserveRequest;
use rushtix_core::{
    BookingId, BookingRepository, BookingStatus, Clock, DomainEvent, EventId, EventType, Money,
    NewBooking, PaymentEventData, PaymentId, ReservationStore, SagaStatus, ShowId, TenantId,
    UserId, ZoneId,
};
use rushtix_redpanda::{EventHandler, ReceivedEvent};
use rushtix_saga::Orchestrator;
use rushtix_saga::definition::post_payment;
use rushtix_testing::{
    FixedClock, MemoryBookingRepository, MemoryBus, MemoryOutboxStore, MemoryReservationStore,
    MemorySagaStore,
};
use rushtix_workers::PaymentEventsHandler;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    handler: PaymentEventsHandler,
    repo: Arc<MemoryBookingRepository>,
    reservations: Arc<MemoryReservationStore>,
    sagas: Arc<MemorySagaStore>,
    user: UserId,
    event: EventId,
    zone: ZoneId,
    booking: BookingId,
}

async fn harness() -> Harness {
    let outbox = Arc::new(MemoryOutboxStore::new());
    let repo = Arc::new(MemoryBookingRepository::new(Arc::clone(&outbox)));
    let reservations = Arc::new(MemoryReservationStore::new());
    let sagas = Arc::new(MemorySagaStore::new());
    let bus = Arc::new(MemoryBus::new());
    let clock = Arc::new(FixedClock::from_system());

    let saga_store: Arc<dyn rushtix_core::SagaStore> = Arc::clone(&sagas) as Arc<dyn rushtix_core::SagaStore>;
    let publisher: Arc<dyn rushtix_core::EventPublisher> = Arc::clone(&bus) as Arc<dyn rushtix_core::EventPublisher>;
    let clock_dyn: Arc<dyn Clock> = Arc::clone(&clock) as Arc<dyn Clock>;
    let orchestrator = Arc::new(Orchestrator::new(
        saga_store,
        publisher,
        Arc::clone(&clock_dyn),
        vec![post_payment()],
    ));

    let repo_dyn: Arc<dyn BookingRepository> = Arc::clone(&repo) as Arc<dyn BookingRepository>;
    let res_dyn: Arc<dyn ReservationStore> = Arc::clone(&reservations) as Arc<dyn ReservationStore>;
    let handler = PaymentEventsHandler::new(repo_dyn, res_dyn, orchestrator, clock_dyn);

    // Seed one reserved booking backed by held seats.
    let user = UserId::new();
    let event = EventId::new();
    let zone = ZoneId::new();
    let booking = BookingId::mint();
    let now = clock.now();

    reservations.set_availability(event, zone, 10).await.unwrap();
    let outcome = reservations
        .reserve(
            &ReserveRequest {
                booking_id: booking,
                user_id: user,
                event_id: event,
                zone_id: zone,
                quantity: 2,
                max_per_user: 10,
                ttl: Duration::from_secs(600),
                unit_price: Money::from_cents(1000),
            },
            now,
        )
        .await
        .unwrap();
    repo.create_reserved(
        NewBooking {
            id: booking,
            tenant_id: TenantId::new(),
            user_id: user,
            event_id: event,
            show_id: ShowId::new(),
            zone_id: zone,
            quantity: 2,
            unit_price: Money::from_cents(1000),
            idempotency_key: "seed".to_string(),
            reserved_at: now,
            reservation_expires_at: outcome.expires_at,
        },
        now,
    )
    .await
    .unwrap();

    Harness {
        handler,
        repo,
        reservations,
        sagas,
        user,
        event,
        zone,
        booking,
    }
}

fn payment_event(h: &Harness, event_type: EventType) -> ReceivedEvent {
    let data = PaymentEventData {
        payment_id: PaymentId::new(),
        booking_id: h.booking,
        amount: Money::from_cents(2000),
        failure_reason: None,
    };
    ReceivedEvent {
        topic: "payment-events".to_string(),
        key: h.booking.to_string(),
        event: DomainEvent::new(event_type, Utc::now(), &data).unwrap(),
    }
}

#[tokio::test]
async fn payment_failure_releases_seats_and_cancels() {
    let h = harness().await;
    assert_eq!(
        h.reservations.availability(h.event, h.zone).await.unwrap(),
        Some(8)
    );

    h.handler
        .handle(payment_event(&h, EventType::PaymentFailed))
        .await
        .unwrap();

    assert_eq!(
        h.reservations.availability(h.event, h.zone).await.unwrap(),
        Some(10)
    );
    assert_eq!(
        h.repo.snapshot(h.booking).unwrap().status,
        BookingStatus::Cancelled
    );
}

#[tokio::test]
async fn replayed_payment_failure_is_a_no_op() {
    let h = harness().await;
    h.handler
        .handle(payment_event(&h, EventType::PaymentFailed))
        .await
        .unwrap();

    // Same message again: no double release, no state change.
    h.handler
        .handle(payment_event(&h, EventType::PaymentFailed))
        .await
        .unwrap();

    assert_eq!(
        h.reservations.availability(h.event, h.zone).await.unwrap(),
        Some(10)
    );
    assert_eq!(
        h.repo.snapshot(h.booking).unwrap().status,
        BookingStatus::Cancelled
    );
}

#[tokio::test]
async fn payment_success_starts_the_post_payment_saga() {
    let h = harness().await;
    h.handler
        .handle(payment_event(&h, EventType::PaymentSuccess))
        .await
        .unwrap();

    let sagas = h.sagas.all();
    assert_eq!(sagas.len(), 1);
    assert_eq!(sagas[0].name, "post-payment");
    assert_eq!(sagas[0].status, SagaStatus::Running);
    assert_eq!(
        sagas[0].data["booking_id"],
        serde_json::json!(h.booking)
    );
}

#[tokio::test]
async fn refund_releases_sold_seats_and_marks_refunded() {
    let h = harness().await;

    // Settle the booking first (confirmed in both stores).
    let payment = PaymentId::new();
    h.reservations
        .confirm(h.event, h.zone, h.booking, h.user, payment)
        .await
        .unwrap();
    h.repo
        .confirm(h.booking, h.user, payment, Utc::now())
        .await
        .unwrap();
    assert_eq!(h.reservations.sold(h.event, h.zone), 2);

    h.handler
        .handle(payment_event(&h, EventType::PaymentRefunded))
        .await
        .unwrap();

    let booking = h.repo.snapshot(h.booking).unwrap();
    assert_eq!(booking.status, BookingStatus::Refunded);
    assert_eq!(
        h.reservations.availability(h.event, h.zone).await.unwrap(),
        Some(10)
    );
    assert_eq!(h.reservations.sold(h.event, h.zone), 0);

    // Replay: nothing moves again.
    h.handler
        .handle(payment_event(&h, EventType::PaymentRefunded))
        .await
        .unwrap();
    assert_eq!(
        h.reservations.availability(h.event, h.zone).await.unwrap(),
        Some(10)
    );
}

#[tokio::test]
async fn unknown_bookings_are_skipped_not_failed() {
    let h = harness().await;
    let ghost = ReceivedEvent {
        topic: "payment-events".to_string(),
        key: "ghost".to_string(),
        event: DomainEvent::new(
            EventType::PaymentFailed,
            Utc::now(),
            &PaymentEventData {
                payment_id: PaymentId::new(),
                booking_id: BookingId::mint(),
                amount: Money::from_cents(100),
                failure_reason: Some("card declined".to_string()),
            },
        )
        .unwrap(),
    };

    // Must commit (Ok) so the poisoned message does not wedge the topic.
    h.handler.handle(ghost).await.unwrap();
}
