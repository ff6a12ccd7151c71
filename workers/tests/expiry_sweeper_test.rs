//! Expiry sweeper over the in-memory stack: lapsed reservations return
//! their seats and settle as EXPIRED with a `booking.expired` outbox row.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use chrono::Duration as ChronoDuration;
use rushtix_core::reservation::ReserveRequest;
use rushtix_core::{
    BookingId, BookingRepository, BookingStatus, Clock, EventId, Money, NewBooking,
    ReservationStore, ShowId, TenantId, UserId, ZoneId,
};
use rushtix_testing::{FixedClock, MemoryBookingRepository, MemoryOutboxStore, MemoryReservationStore};
use rushtix_workers::ExpirySweeper;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    sweeper: ExpirySweeper,
    repo: Arc<MemoryBookingRepository>,
    outbox: Arc<MemoryOutboxStore>,
    reservations: Arc<MemoryReservationStore>,
    clock: Arc<FixedClock>,
}

fn harness() -> Harness {
    let outbox = Arc::new(MemoryOutboxStore::new());
    let repo = Arc::new(MemoryBookingRepository::new(Arc::clone(&outbox)));
    let reservations = Arc::new(MemoryReservationStore::new());
    let clock = Arc::new(FixedClock::from_system());

    let repo_dyn: Arc<dyn BookingRepository> = Arc::clone(&repo) as Arc<dyn BookingRepository>;
    let res_dyn: Arc<dyn ReservationStore> = Arc::clone(&reservations) as Arc<dyn ReservationStore>;
    let clock_dyn: Arc<dyn Clock> = Arc::clone(&clock) as Arc<dyn Clock>;
    let sweeper = ExpirySweeper::new(repo_dyn, res_dyn, clock_dyn);

    Harness {
        sweeper,
        repo,
        outbox,
        reservations,
        clock,
    }
}

/// Hold seats in both stores, the way the reserve endpoint does.
async fn reserve(h: &Harness, event: EventId, zone: ZoneId, quantity: u32, ttl: Duration) -> BookingId {
    let user = UserId::new();
    let booking_id = BookingId::mint();
    let now = h.clock.now();

    let outcome = h
        .reservations
        .reserve(
            &ReserveRequest {
                booking_id,
                user_id: user,
                event_id: event,
                zone_id: zone,
                quantity,
                max_per_user: 10,
                ttl,
                unit_price: Money::from_cents(1000),
            },
            now,
        )
        .await
        .unwrap();

    h.repo
        .create_reserved(
            NewBooking {
                id: booking_id,
                tenant_id: TenantId::new(),
                user_id: user,
                event_id: event,
                show_id: ShowId::new(),
                zone_id: zone,
                quantity,
                unit_price: Money::from_cents(1000),
                idempotency_key: format!("key-{booking_id}"),
                reserved_at: now,
                reservation_expires_at: outcome.expires_at,
            },
            now,
        )
        .await
        .unwrap();

    booking_id
}

#[tokio::test]
async fn lapsed_reservations_expire_and_restore_inventory() {
    let h = harness();
    let event = EventId::new();
    let zone = ZoneId::new();
    h.reservations.set_availability(event, zone, 10).await.unwrap();

    let booking_id = reserve(&h, event, zone, 3, Duration::from_secs(2)).await;
    assert_eq!(h.reservations.availability(event, zone).await.unwrap(), Some(7));

    // Nothing expires inside the window.
    assert_eq!(h.sweeper.sweep().await.unwrap(), 0);

    // Past the window the sweep restores the 3 seats and settles the row.
    h.clock.advance(ChronoDuration::seconds(5));
    assert_eq!(h.sweeper.sweep().await.unwrap(), 1);

    assert_eq!(h.reservations.availability(event, zone).await.unwrap(), Some(10));
    assert_eq!(
        h.repo.snapshot(booking_id).unwrap().status,
        BookingStatus::Expired
    );

    let expired_rows = h.outbox.rows_of_type("booking.expired");
    assert_eq!(expired_rows.len(), 1);
    assert_eq!(expired_rows[0].aggregate_id, *booking_id.as_uuid());
}

#[tokio::test]
async fn sweep_is_idempotent() {
    let h = harness();
    let event = EventId::new();
    let zone = ZoneId::new();
    h.reservations.set_availability(event, zone, 10).await.unwrap();

    reserve(&h, event, zone, 2, Duration::from_secs(1)).await;
    h.clock.advance(ChronoDuration::seconds(5));

    assert_eq!(h.sweeper.sweep().await.unwrap(), 1);
    // A second sweep finds nothing and does not double-restore.
    assert_eq!(h.sweeper.sweep().await.unwrap(), 0);
    assert_eq!(h.reservations.availability(event, zone).await.unwrap(), Some(10));
    assert_eq!(h.outbox.rows_of_type("booking.expired").len(), 1);
}

#[tokio::test]
async fn active_reservations_survive_the_sweep() {
    let h = harness();
    let event = EventId::new();
    let zone = ZoneId::new();
    h.reservations.set_availability(event, zone, 10).await.unwrap();

    let short = reserve(&h, event, zone, 1, Duration::from_secs(1)).await;
    let long = reserve(&h, event, zone, 1, Duration::from_secs(3600)).await;

    h.clock.advance(ChronoDuration::seconds(10));
    assert_eq!(h.sweeper.sweep().await.unwrap(), 1);

    assert_eq!(h.repo.snapshot(short).unwrap().status, BookingStatus::Expired);
    assert_eq!(h.repo.snapshot(long).unwrap().status, BookingStatus::Reserved);
    assert_eq!(h.reservations.availability(event, zone).await.unwrap(), Some(9));
}
