//! Property tests over random operation traces.
//!
//! These assert the platform's core invariants: no overselling, the
//! per-user cap, status monotonicity, outbox atomicity, queue fairness
//! and the rate-limit window bound.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use chrono::Utc;
use futures::executor::block_on;
use proptest::prelude::*;
use rushtix_core::reservation::ReserveRequest;
use rushtix_core::{
    AdmissionQueue, BookingId, BookingRepository, BookingStatus, DomainError, EventId, Money,
    NewBooking, PaymentId, ReservationStore, ShowId, TenantId, UserId, ZoneId,
};
use rushtix_testing::{
    MemoryBookingRepository, MemoryOutboxStore, MemoryQueue, MemoryReservationStore,
};
use std::sync::Arc;
use std::time::Duration;

const CAPACITY: u32 = 20;
const MAX_PER_USER: u32 = 10;

/// One step of a random reservation trace.
#[derive(Clone, Debug)]
enum Step {
    Reserve { user: usize, quantity: u32 },
    ReleaseOldest { user: usize },
    ConfirmOldest { user: usize },
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0..4_usize, 1..6_u32).prop_map(|(user, quantity)| Step::Reserve { user, quantity }),
        (0..4_usize).prop_map(|user| Step::ReleaseOldest { user }),
        (0..4_usize).prop_map(|user| Step::ConfirmOldest { user }),
    ]
}

proptest! {
    /// Invariants 1 & 2: `reserved + confirmed ≤ total_seats` at every
    /// point of every trace, and no user ever holds more than the cap.
    #[test]
    fn no_overselling_and_user_cap(steps in proptest::collection::vec(step_strategy(), 1..60)) {
        let store = MemoryReservationStore::new();
        let event = EventId::new();
        let zone = ZoneId::new();
        let users: Vec<UserId> = (0..4).map(|_| UserId::new()).collect();
        block_on(store.set_availability(event, zone, CAPACITY)).unwrap();

        // (booking, user_idx, quantity, confirmed) for live holds
        let mut live: Vec<(BookingId, usize, u32, bool)> = Vec::new();

        for step in steps {
            match step {
                Step::Reserve { user, quantity } => {
                    let booking = BookingId::mint();
                    let result = block_on(store.reserve(&ReserveRequest {
                        booking_id: booking,
                        user_id: users[user],
                        event_id: event,
                        zone_id: zone,
                        quantity,
                        max_per_user: MAX_PER_USER,
                        ttl: Duration::from_secs(600),
                        unit_price: Money::from_cents(1000),
                    }, Utc::now()));
                    if result.is_ok() {
                        live.push((booking, user, quantity, false));
                    }
                }
                Step::ReleaseOldest { user } => {
                    if let Some(pos) = live.iter().position(|(_, u, _, _)| *u == user) {
                        let (booking, _, _, _) = live.remove(pos);
                        let _ = block_on(store.release(event, zone, booking, users[user]));
                    }
                }
                Step::ConfirmOldest { user } => {
                    if let Some(entry) = live
                        .iter_mut()
                        .find(|(_, u, _, confirmed)| *u == user && !confirmed)
                    {
                        let booking = entry.0;
                        if block_on(store.confirm(event, zone, booking, users[user], PaymentId::new())).is_ok() {
                            entry.3 = true;
                        }
                    }
                }
            }

            // Invariant 1: availability never negative, held never
            // exceeds capacity.
            let available = block_on(store.availability(event, zone)).unwrap().unwrap();
            prop_assert!(available >= 0, "availability went negative: {available}");
            let held: u32 = live.iter().map(|(_, _, q, _)| *q).sum();
            prop_assert!(held <= CAPACITY, "held {held} > capacity {CAPACITY}");
            prop_assert_eq!(available, i64::from(CAPACITY) - i64::from(held));

            // Invariant 2: per-user cap.
            for user in 0..4 {
                let user_held: u32 = live
                    .iter()
                    .filter(|(_, u, _, _)| *u == user)
                    .map(|(_, _, q, _)| *q)
                    .sum();
                prop_assert!(user_held <= MAX_PER_USER, "user {user} holds {user_held}");
            }
        }
    }

    /// Invariant 3: once CONFIRMED, a booking never returns to RESERVED
    /// or PENDING, whatever is thrown at it.
    #[test]
    fn confirmed_status_is_monotonic(ops in proptest::collection::vec(0..3_u8, 1..20)) {
        let outbox = Arc::new(MemoryOutboxStore::new());
        let repo = MemoryBookingRepository::new(Arc::clone(&outbox));
        let user = UserId::new();
        let now = Utc::now();

        let id = BookingId::mint();
        block_on(repo.create_reserved(new_booking(id, user), now)).unwrap();
        block_on(repo.confirm(id, user, PaymentId::new(), now)).unwrap();

        for op in ops {
            match op {
                0 => { let _ = block_on(repo.confirm(id, user, PaymentId::new(), now)); }
                1 => { let _ = block_on(repo.cancel(id, now)); }
                _ => { let _ = block_on(repo.expire_batch(now + chrono::Duration::days(1), 10)); }
            }
            let status = block_on(repo.get(id)).unwrap().unwrap().status;
            prop_assert!(
                matches!(status, BookingStatus::Confirmed | BookingStatus::Refunded),
                "booking regressed to {status}"
            );
        }
    }

    /// Invariant 5: every committed transition writes exactly one outbox
    /// row; rejected transitions write none.
    #[test]
    fn outbox_rows_match_transitions(ops in proptest::collection::vec(0..3_u8, 1..25)) {
        let outbox = Arc::new(MemoryOutboxStore::new());
        let repo = MemoryBookingRepository::new(Arc::clone(&outbox));
        let user = UserId::new();
        let now = Utc::now();

        let id = BookingId::mint();
        block_on(repo.create_reserved(new_booking(id, user), now)).unwrap();
        let mut transitions = 1_usize; // the insert emitted booking.created

        for op in ops {
            let result = match op {
                0 => block_on(repo.confirm(id, user, PaymentId::new(), now)).map(|_| ()),
                1 => block_on(repo.cancel(id, now)).map(|_| ()),
                _ => block_on(repo.refund(id, now)).map(|_| ()),
            };
            if result.is_ok() {
                transitions += 1;
            }
        }

        prop_assert_eq!(outbox.rows().len(), transitions);
    }

    /// Invariant 8: with rate r and burst b, a 1-second window admits at
    /// most `r + b` requests from one client.
    #[test]
    fn rate_limit_window_bound(requests in 1..200_u32, rate in 1..20_u32, burst in 1..20_u32) {
        use rushtix_web::middleware::LocalRateLimiter;

        let limiter = LocalRateLimiter::default();
        let mut allowed = 0_u32;
        for _ in 0..requests {
            // One tight loop ≪ 1 s of wall clock: refill is negligible,
            // so the bound reduces to rate + burst.
            if block_on(limiter.check("10.0.0.1", "rule", f64::from(rate), burst)).allowed {
                allowed += 1;
            }
        }
        prop_assert!(
            allowed <= rate + burst,
            "allowed {allowed} > rate {rate} + burst {burst}"
        );
    }
}

/// Invariant 7: release order matches join order.
#[tokio::test]
async fn queue_releases_in_join_order() {
    let queue = MemoryQueue::with_cap(3);
    let event = EventId::new();
    let users: Vec<UserId> = (0..8).map(|_| UserId::new()).collect();

    for user in &users {
        queue.join(event, *user, Utc::now()).await.unwrap();
    }

    let report = queue.release_batch(event, Utc::now()).await.unwrap();
    assert_eq!(report.released, 3);

    // Exactly the first three joiners hold passes.
    for (i, user) in users.iter().enumerate() {
        let status = queue.status(event, *user).await.unwrap();
        assert_eq!(status.is_open, i < 3, "user {i} pass state wrong");
    }

    // Consume one pass; the next tick admits exactly the next joiner.
    queue.consume_pass(event, users[0]).await.unwrap();
    let report = queue.release_batch(event, Utc::now()).await.unwrap();
    assert_eq!(report.released, 1);
    assert!(queue.status(event, users[3]).await.unwrap().is_open);
    assert!(!queue.status(event, users[4]).await.unwrap().is_open);
}

fn new_booking(id: BookingId, user: UserId) -> NewBooking {
    let now = Utc::now();
    NewBooking {
        id,
        tenant_id: TenantId::new(),
        user_id: user,
        event_id: EventId::new(),
        show_id: ShowId::new(),
        zone_id: ZoneId::new(),
        quantity: 2,
        unit_price: Money::from_cents(1500),
        idempotency_key: format!("prop-{id}"),
        reserved_at: now,
        reservation_expires_at: now + chrono::Duration::minutes(10),
    }
}

/// Error taxonomy sanity used by the traces above.
#[test]
fn reservation_errors_are_discriminated() {
    let store = MemoryReservationStore::new();
    let event = EventId::new();
    let zone = ZoneId::new();
    block_on(store.set_availability(event, zone, 1)).unwrap();

    let user = UserId::new();
    let err = block_on(store.reserve(
        &ReserveRequest {
            booking_id: BookingId::mint(),
            user_id: user,
            event_id: event,
            zone_id: zone,
            quantity: 2,
            max_per_user: 10,
            ttl: Duration::from_secs(60),
            unit_price: Money::from_cents(100),
        },
        Utc::now(),
    ))
    .unwrap_err();
    assert!(matches!(err, DomainError::InsufficientSeats));

    let err = block_on(store.release(event, zone, BookingId::mint(), user)).unwrap_err();
    assert!(matches!(err, DomainError::AlreadyReleased(_)));
}
