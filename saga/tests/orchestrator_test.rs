//! Orchestrator behavior over the in-memory store and bus.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use rushtix_core::{SagaId, SagaStatus};
use rushtix_saga::definition::post_payment;
use rushtix_saga::messages::SagaCommand;
use rushtix_saga::{Orchestrator, SagaReply};
use rushtix_testing::{FixedClock, MemoryBus, MemorySagaStore};
use std::sync::Arc;

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<MemorySagaStore>,
    bus: Arc<MemoryBus>,
    clock: Arc<FixedClock>,
}

fn harness() -> Harness {
    let store = Arc::new(MemorySagaStore::new());
    let bus = Arc::new(MemoryBus::new());
    let clock = Arc::new(FixedClock::from_system());

    let store_dyn: Arc<dyn rushtix_core::SagaStore> = Arc::clone(&store) as Arc<dyn rushtix_core::SagaStore>;
    let bus_dyn: Arc<dyn rushtix_core::EventPublisher> = Arc::clone(&bus) as Arc<dyn rushtix_core::EventPublisher>;
    let clock_dyn: Arc<dyn rushtix_core::Clock> = Arc::clone(&clock) as Arc<dyn rushtix_core::Clock>;
    let orchestrator = Orchestrator::new(store_dyn, bus_dyn, clock_dyn, vec![post_payment()]);

    Harness {
        orchestrator,
        store,
        bus,
        clock,
    }
}

fn last_command(bus: &MemoryBus) -> SagaCommand {
    let messages = bus.messages_for("saga.commands.post-payment");
    let last = messages.last().expect("a command should be dispatched");
    serde_json::from_value(last.payload["data"].clone()).unwrap()
}

fn reply(command: &SagaCommand, success: bool, error_code: Option<&str>) -> SagaReply {
    SagaReply {
        saga_id: command.saga_id,
        saga_name: command.saga_name.clone(),
        step_name: command.step_name.clone(),
        step_index: command.step_index,
        success,
        error_code: error_code.map(ToString::to_string),
        duration_ms: 5,
    }
}

#[tokio::test]
async fn happy_path_walks_all_steps_to_completed() {
    let h = harness();
    let saga_id = h
        .orchestrator
        .start("post-payment", serde_json::json!({"version": 1}))
        .await
        .unwrap();

    for expected in ["confirm-booking", "issue-tickets", "notify-user"] {
        let command = last_command(&h.bus);
        assert_eq!(command.step_name, expected);
        assert_eq!(command.saga_id, saga_id);
        assert_eq!(
            command.idempotency_key,
            format!("{saga_id}:{expected}"),
            "idempotency key is saga-scoped"
        );
        h.orchestrator
            .handle_reply(&reply(&command, true, None))
            .await
            .unwrap();
    }

    let instance = h.store.snapshot(saga_id).unwrap();
    assert_eq!(instance.status, SagaStatus::Completed);
    assert!(instance.completed_at.is_some());
    assert_eq!(instance.steps.len(), 3);
}

#[tokio::test]
async fn permanent_failure_compensates_in_reverse_order() {
    let h = harness();
    let saga_id = h
        .orchestrator
        .start("post-payment", serde_json::json!({"version": 1}))
        .await
        .unwrap();

    // Step 0 succeeds.
    let confirm = last_command(&h.bus);
    h.orchestrator
        .handle_reply(&reply(&confirm, true, None))
        .await
        .unwrap();

    // Step 1 fails past its retry budget (initial + 3 retries).
    for _ in 0..4 {
        let issue = last_command(&h.bus);
        assert_eq!(issue.step_name, "issue-tickets");
        h.orchestrator
            .handle_reply(&reply(&issue, false, Some("TICKET_STORE_DOWN")))
            .await
            .unwrap();
    }

    // The compensation for the completed step 0 is now in flight.
    let compensation = last_command(&h.bus);
    assert_eq!(compensation.step_name, "release-booking");
    let instance = h.store.snapshot(saga_id).unwrap();
    assert_eq!(instance.status, SagaStatus::Compensating);
    assert_eq!(instance.error.as_deref(), Some("TICKET_STORE_DOWN"));

    h.orchestrator
        .handle_reply(&reply(&compensation, true, None))
        .await
        .unwrap();

    let instance = h.store.snapshot(saga_id).unwrap();
    assert_eq!(instance.status, SagaStatus::Compensated);
    assert!(instance.completed_at.is_some());
}

#[tokio::test]
async fn failure_on_first_step_fails_without_compensation() {
    let h = harness();
    let saga_id = h
        .orchestrator
        .start("post-payment", serde_json::json!({"version": 1}))
        .await
        .unwrap();

    for _ in 0..4 {
        let command = last_command(&h.bus);
        h.orchestrator
            .handle_reply(&reply(&command, false, Some("BOOKING_NOT_FOUND")))
            .await
            .unwrap();
    }

    let instance = h.store.snapshot(saga_id).unwrap();
    assert_eq!(instance.status, SagaStatus::Failed);
    assert_eq!(instance.error.as_deref(), Some("BOOKING_NOT_FOUND"));
}

#[tokio::test]
async fn failed_step_is_retried_before_compensating() {
    let h = harness();
    let saga_id = h
        .orchestrator
        .start("post-payment", serde_json::json!({"version": 1}))
        .await
        .unwrap();

    let first = last_command(&h.bus);
    assert_eq!(first.retry_count, 0);
    h.orchestrator
        .handle_reply(&reply(&first, false, Some("DEPENDENCY_UNAVAILABLE")))
        .await
        .unwrap();

    let retried = last_command(&h.bus);
    assert_eq!(retried.step_name, "confirm-booking");
    assert_eq!(retried.retry_count, 1);

    // Recovering with a success keeps the saga running forward.
    h.orchestrator
        .handle_reply(&reply(&retried, true, None))
        .await
        .unwrap();
    let instance = h.store.snapshot(saga_id).unwrap();
    assert_eq!(instance.status, SagaStatus::Running);
    assert_eq!(instance.current_step, 1);
}

#[tokio::test]
async fn stale_and_duplicate_replies_are_ignored() {
    let h = harness();
    let saga_id = h
        .orchestrator
        .start("post-payment", serde_json::json!({"version": 1}))
        .await
        .unwrap();

    let confirm = last_command(&h.bus);
    h.orchestrator
        .handle_reply(&reply(&confirm, true, None))
        .await
        .unwrap();

    // Redelivered reply for the finished step must not advance again.
    h.orchestrator
        .handle_reply(&reply(&confirm, true, None))
        .await
        .unwrap();

    let instance = h.store.snapshot(saga_id).unwrap();
    assert_eq!(instance.current_step, 1);
    assert_eq!(instance.status, SagaStatus::Running);
}

#[tokio::test]
async fn timeout_sweeper_counts_as_failure() {
    let h = harness();
    let saga_id = h
        .orchestrator
        .start("post-payment", serde_json::json!({"version": 1}))
        .await
        .unwrap();

    // No reply arrives; walk past the 30 s deadline and every retry.
    for attempt in 0..4 {
        h.clock.advance(chrono::Duration::seconds(31));
        let swept = h.orchestrator.sweep_timeouts().await.unwrap();
        assert_eq!(swept, 1, "attempt {attempt} should time out");
    }

    let instance = h.store.snapshot(saga_id).unwrap();
    assert_eq!(instance.status, SagaStatus::Failed);
    assert_eq!(instance.error.as_deref(), Some("STEP_TIMEOUT"));
}

#[tokio::test]
async fn recovery_redispatches_the_current_step() {
    let h = harness();
    let saga_id = h
        .orchestrator
        .start("post-payment", serde_json::json!({"version": 1}))
        .await
        .unwrap();

    let before = h.bus.messages_for("saga.commands.post-payment").len();
    let recovered = h.orchestrator.recover().await.unwrap();
    assert_eq!(recovered, 1);

    let after = h.bus.messages_for("saga.commands.post-payment");
    assert_eq!(after.len(), before + 1);

    // Same step, same idempotency key: the executor dedupes.
    let redispatched = last_command(&h.bus);
    assert_eq!(redispatched.step_name, "confirm-booking");
    assert_eq!(
        redispatched.idempotency_key,
        format!("{saga_id}:confirm-booking")
    );
}

#[tokio::test]
async fn replies_for_unknown_sagas_are_dropped() {
    let h = harness();
    let ghost = SagaReply {
        saga_id: SagaId::new(),
        saga_name: "post-payment".to_string(),
        step_name: "confirm-booking".to_string(),
        step_index: 0,
        success: true,
        error_code: None,
        duration_ms: 1,
    };
    // Must not error: redelivery after retention is expected.
    h.orchestrator.handle_reply(&ghost).await.unwrap();
    assert!(h.store.all().is_empty());
}

#[tokio::test]
async fn commands_are_keyed_by_saga_id() {
    let h = harness();
    let saga_id = h
        .orchestrator
        .start("post-payment", serde_json::json!({"version": 1}))
        .await
        .unwrap();

    let messages = h.bus.messages_for("saga.commands.post-payment");
    assert!(messages.iter().all(|m| m.key == saga_id.to_string()));
}
