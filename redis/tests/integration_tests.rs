//! Integration tests against a live Redis.
//!
//! Run with: `docker run -d -p 6379:6379 redis:7-alpine`, then
//! `cargo test -p rushtix-redis -- --ignored`

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]

use chrono::Utc;
use rushtix_core::idempotency::BeginOutcome;
use rushtix_core::reservation::ReserveRequest;
use rushtix_core::{BookingId, DomainError, EventId, Money, PaymentId, UserId, ZoneId};
use rushtix_redis::{
    DistributedRateLimiter, IdempotencyStore, QueueAdmission, QueueConfig, ReservationEngine,
};
use std::time::Duration;

const REDIS_URL: &str = "redis://127.0.0.1:6379";

async fn engine() -> ReservationEngine {
    let conn = rushtix_redis::connect(REDIS_URL).await.unwrap();
    ReservationEngine::new(conn)
}

fn request(
    event: EventId,
    zone: ZoneId,
    user: UserId,
    quantity: u32,
    max_per_user: u32,
) -> ReserveRequest {
    ReserveRequest {
        booking_id: BookingId::mint(),
        user_id: user,
        event_id: event,
        zone_id: zone,
        quantity,
        max_per_user,
        ttl: Duration::from_secs(60),
        unit_price: Money::from_cents(1000),
    }
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn reserve_decrements_until_sold_out() {
    let engine = engine().await;
    let event = EventId::new();
    let zone = ZoneId::new();
    engine.set_availability(event, zone, 3).await.unwrap();

    for _ in 0..3 {
        let user = UserId::new();
        engine
            .reserve(&request(event, zone, user, 1, 10), Utc::now())
            .await
            .unwrap();
    }
    assert_eq!(engine.availability(event, zone).await.unwrap(), Some(0));

    let err = engine
        .reserve(&request(event, zone, UserId::new(), 1, 10), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InsufficientSeats));
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn per_user_cap_sums_quantities_across_bookings() {
    let engine = engine().await;
    let event = EventId::new();
    let zone = ZoneId::new();
    let user = UserId::new();
    engine.set_availability(event, zone, 100).await.unwrap();

    engine
        .reserve(&request(event, zone, user, 6, 10), Utc::now())
        .await
        .unwrap();
    engine
        .reserve(&request(event, zone, user, 4, 10), Utc::now())
        .await
        .unwrap();

    // 11th seat crosses the cap even though inventory remains.
    let err = engine
        .reserve(&request(event, zone, user, 1, 10), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::MaxTicketsExceeded { .. }));
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn confirm_then_release_round_trip() {
    let engine = engine().await;
    let event = EventId::new();
    let zone = ZoneId::new();
    let user = UserId::new();
    engine.set_availability(event, zone, 10).await.unwrap();

    let req = request(event, zone, user, 2, 10);
    let booking = req.booking_id;
    engine.reserve(&req, Utc::now()).await.unwrap();

    let quantity = engine
        .confirm(event, zone, booking, user, PaymentId::new())
        .await
        .unwrap();
    assert_eq!(quantity, 2);

    // Double confirm is discriminated.
    let err = engine
        .confirm(event, zone, booking, user, PaymentId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::AlreadyConfirmed(_)));

    // Releasing the confirmed hold restores availability.
    let released = engine.release(event, zone, booking, user).await.unwrap();
    assert_eq!(released, 2);
    assert_eq!(engine.availability(event, zone).await.unwrap(), Some(10));

    // Releasing again is a side-effect-free conflict.
    let err = engine.release(event, zone, booking, user).await.unwrap_err();
    assert!(matches!(err, DomainError::AlreadyReleased(_)));
    assert_eq!(engine.availability(event, zone).await.unwrap(), Some(10));
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn ownership_is_checked_server_side() {
    let engine = engine().await;
    let event = EventId::new();
    let zone = ZoneId::new();
    let owner = UserId::new();
    engine.set_availability(event, zone, 10).await.unwrap();

    let req = request(event, zone, owner, 1, 10);
    let booking = req.booking_id;
    engine.reserve(&req, Utc::now()).await.unwrap();

    let err = engine
        .release(event, zone, booking, UserId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, DomainError::InvalidUserId));
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn concurrent_reserves_never_oversell() {
    let conn = rushtix_redis::connect(REDIS_URL).await.unwrap();
    let engine = std::sync::Arc::new(ReservationEngine::new(conn));
    let event = EventId::new();
    let zone = ZoneId::new();
    engine.set_availability(event, zone, 50).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..200 {
        let engine = std::sync::Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine
                .reserve(&request(event, zone, UserId::new(), 1, 10), Utc::now())
                .await
                .is_ok()
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        if handle.await.unwrap() {
            succeeded += 1;
        }
    }
    assert_eq!(succeeded, 50);
    assert_eq!(engine.availability(event, zone).await.unwrap(), Some(0));
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn queue_passes_are_single_use_and_fifo() {
    let conn = rushtix_redis::connect(REDIS_URL).await.unwrap();
    let queue = QueueAdmission::new(
        conn,
        QueueConfig {
            max_concurrent: 2,
            ..QueueConfig::default()
        },
        b"queue-secret",
    );

    let event = EventId::new();
    let users: Vec<UserId> = (0..4).map(|_| UserId::new()).collect();
    for (i, user) in users.iter().enumerate() {
        let position = queue.join(event, *user, Utc::now()).await.unwrap();
        assert_eq!(position.position, i as u64 + 1);
        // Token verifies for its owner, not for anyone else.
        queue
            .verify_token(&position.token, event, *user)
            .expect("own token should verify");
        assert!(
            queue
                .verify_token(&position.token, event, UserId::new())
                .is_err()
        );
    }

    let report = queue.release_batch(event, Utc::now()).await.unwrap();
    assert_eq!(report.released, 2);

    assert!(queue.consume_pass(event, users[0]).await.unwrap());
    // Single use: consuming again fails.
    assert!(!queue.consume_pass(event, users[0]).await.unwrap());
    // User 3 was never admitted.
    assert!(!queue.consume_pass(event, users[3]).await.unwrap());
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn idempotency_records_replay_and_mismatch() {
    let conn = rushtix_redis::connect(REDIS_URL).await.unwrap();
    let store = IdempotencyStore::new(conn);
    let key = format!("test:{}", BookingId::mint());

    assert_eq!(
        store.begin(&key, "hash-a").await.unwrap(),
        BeginOutcome::Started
    );
    assert_eq!(
        store.begin(&key, "hash-a").await.unwrap(),
        BeginOutcome::InProgress
    );
    assert_eq!(
        store.begin(&key, "hash-b").await.unwrap(),
        BeginOutcome::Mismatch
    );

    store
        .complete(&key, "hash-a", 202, "{\"ok\":true}", Utc::now())
        .await
        .unwrap();
    match store.begin(&key, "hash-a").await.unwrap() {
        BeginOutcome::Replay(record) => {
            assert_eq!(record.response_code, Some(202));
            assert_eq!(record.response_body.as_deref(), Some("{\"ok\":true}"));
        }
        other => panic!("expected replay, got {other:?}"),
    }
}

#[tokio::test]
#[ignore] // Requires Redis running
async fn distributed_bucket_enforces_burst() {
    let conn = rushtix_redis::connect(REDIS_URL).await.unwrap();
    let limiter = DistributedRateLimiter::new(conn);
    let client = format!("198.51.100.7:{}", BookingId::mint());

    // rate 0 tokens/s, burst 3: exactly 3 allowed.
    for i in 0..3 {
        let decision = limiter
            .check(&client, "itest", 0.0, 3, Utc::now())
            .await
            .unwrap();
        assert!(decision.allowed, "request {i} should pass");
    }
    let denied = limiter
        .check(&client, "itest", 0.0, 3, Utc::now())
        .await
        .unwrap();
    assert!(!denied.allowed);
    assert!(denied.retry_after.is_some());
}
