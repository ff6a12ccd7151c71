//! Outbox relay.
//!
//! Bridges the transactional outbox to the message bus. Every poll tick:
//!
//! 1. claim due rows in `created_at` order (skipping rows another replica
//!    holds),
//! 2. publish each payload **verbatim** to its topic, keyed by
//!    `aggregate_id` so per-aggregate ordering survives partitioning,
//! 3. mark the row sent, or schedule the next attempt with exponential
//!    backoff and jitter,
//! 4. after [`RelayConfig::max_attempts`], wrap the row in a
//!    [`DlqEnvelope`] on `{topic}.dlq` and retire it.
//!
//! Delivery is at-least-once: a crash between publish and mark-sent
//! re-publishes after the claim lease lapses. Consumers dedupe.
//!
//! A companion cleanup loop deletes sent rows past the retention window.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use rand::Rng;
use rushtix_core::{Clock, DomainError, EventPublisher, EventType, OutboxRow, OutboxStore};
use rushtix_redpanda::DlqEnvelope;
use rushtix_redpanda::topics;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Relay tuning knobs.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Sleep between poll ticks
    pub poll_interval: Duration,
    /// Rows claimed per tick
    pub batch_size: u32,
    /// Publish attempts before a row is parked on the DLQ
    pub max_attempts: i32,
    /// First retry delay
    pub backoff_base: Duration,
    /// Retry delay ceiling
    pub backoff_cap: Duration,
    /// How long a claimed row stays invisible to other replicas
    pub claim_lease: Duration,
    /// Sleep between cleanup runs
    pub cleanup_interval: Duration,
    /// How long sent rows are kept
    pub retention: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            max_attempts: 10,
            backoff_base: Duration::from_secs(5),
            backoff_cap: Duration::from_secs(300),
            claim_lease: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(3600),
            retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

impl RelayConfig {
    /// Exponential backoff with jitter for the given attempt count.
    ///
    /// Full jitter over `[base·2^(n-1) / 2, base·2^(n-1)]`, capped.
    #[must_use]
    pub fn backoff(&self, attempts: i32) -> Duration {
        let exponent = u32::try_from(attempts.max(1) - 1).unwrap_or(0).min(16);
        let raw = self
            .backoff_base
            .saturating_mul(1_u32 << exponent)
            .min(self.backoff_cap);

        let half = raw / 2;
        let jitter = rand::thread_rng().gen_range(0..=half.as_millis().max(1));
        half + Duration::from_millis(u64::try_from(jitter).unwrap_or(0))
    }
}

/// The relay service.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<dyn EventPublisher>,
    clock: Arc<dyn Clock>,
    config: RelayConfig,
}

impl OutboxRelay {
    /// Create a relay.
    #[must_use]
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<dyn EventPublisher>,
        clock: Arc<dyn Clock>,
        config: RelayConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            clock,
            config,
        }
    }

    /// Poll loop. Returns when `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            poll_interval_ms = self.config.poll_interval.as_millis(),
            batch_size = self.config.batch_size,
            "outbox relay started"
        );

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "relay tick failed");
                    }
                }
            }
        }

        tracing::info!("outbox relay stopped");
    }

    /// Retention cleanup loop. Returns when `shutdown` flips to `true`.
    pub async fn run_cleanup(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(self.config.cleanup_interval) => {
                    let cutoff = self.clock.now()
                        - chrono::Duration::from_std(self.config.retention).unwrap_or_default();
                    match self.store.delete_sent_before(cutoff).await {
                        Ok(removed) => {
                            metrics::counter!("relay.cleaned").increment(removed);
                        }
                        Err(e) => tracing::error!(error = %e, "outbox cleanup failed"),
                    }
                }
            }
        }
    }

    /// One poll tick: claim a batch and work through it in order.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the claim query; per-row failures are
    /// absorbed into the retry schedule.
    pub async fn tick(&self) -> Result<usize, DomainError> {
        let now = self.clock.now();
        let batch = self
            .store
            .claim_batch(self.config.batch_size, self.config.claim_lease, now)
            .await?;

        let claimed = batch.len();
        for row in batch {
            self.deliver(row).await;
        }
        Ok(claimed)
    }

    async fn deliver(&self, row: OutboxRow) {
        let topic = Self::topic_for(&row.event_type);
        let key = row.aggregate_id.to_string();
        let payload = row.payload.to_string();

        match self.publisher.publish_raw(&topic, &key, payload.as_bytes()).await {
            Ok(()) => {
                if let Err(e) = self.store.mark_sent(row.id, self.clock.now()).await {
                    // The publish happened; losing the mark means one
                    // duplicate after the lease, which consumers absorb.
                    tracing::warn!(outbox_id = row.id, error = %e, "mark-sent failed");
                }
                metrics::counter!("relay.published", "topic" => topic).increment(1);
            }
            Err(e) => {
                let attempts = row.attempts + 1;
                if attempts >= self.config.max_attempts {
                    self.park(&row, &topic, &key, &e.to_string()).await;
                } else {
                    let next_retry_at = self.clock.now()
                        + chrono::Duration::from_std(self.config.backoff(attempts))
                            .unwrap_or_default();
                    tracing::warn!(
                        outbox_id = row.id,
                        attempts,
                        next_retry_at = %next_retry_at,
                        error = %e,
                        "publish failed, scheduled retry"
                    );
                    if let Err(mark_err) = self
                        .store
                        .mark_failed(row.id, &e.to_string(), next_retry_at)
                        .await
                    {
                        tracing::error!(outbox_id = row.id, error = %mark_err, "mark-failed failed");
                    }
                    metrics::counter!("relay.retried").increment(1);
                }
            }
        }
    }

    /// Exhausted row: wrap and publish to the DLQ, then retire it from
    /// active polling.
    async fn park(&self, row: &OutboxRow, topic: &str, key: &str, error: &str) {
        let now = self.clock.now();
        let envelope = DlqEnvelope {
            original_topic: topic.to_string(),
            original_key: key.to_string(),
            payload: row.payload.clone(),
            headers: row.headers.clone(),
            error: error.to_string(),
            attempts: u32::try_from(row.attempts + 1).unwrap_or(0),
            first_attempt_at: row.created_at,
            last_attempt_at: now,
            moved_to_dlq_at: now,
            source: "outbox-relay".to_string(),
        };

        let dlq_topic = topics::dlq(topic);
        let body = match serde_json::to_vec(&envelope) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(outbox_id = row.id, error = %e, "DLQ envelope serialization failed");
                return;
            }
        };

        match self.publisher.publish_raw(&dlq_topic, key, &body).await {
            Ok(()) => {
                tracing::warn!(
                    outbox_id = row.id,
                    topic = %dlq_topic,
                    attempts = row.attempts + 1,
                    "outbox row moved to DLQ"
                );
                metrics::counter!("relay.dlq").increment(1);
                if let Err(e) = self.store.mark_sent(row.id, now).await {
                    tracing::error!(outbox_id = row.id, error = %e, "failed to retire DLQ'd row");
                }
            }
            Err(e) => {
                // Even the DLQ is down: leave the row pending and let the
                // schedule try again at the cap.
                let next_retry_at = now
                    + chrono::Duration::from_std(self.config.backoff_cap).unwrap_or_default();
                tracing::error!(outbox_id = row.id, error = %e, "DLQ publish failed, row stays pending");
                if let Err(mark_err) = self
                    .store
                    .mark_failed(row.id, &e.to_string(), next_retry_at)
                    .await
                {
                    tracing::error!(outbox_id = row.id, error = %mark_err, "mark-failed failed");
                }
            }
        }
    }

    /// Topic from the event-type namespace. Recognized types use their
    /// pinned topic; anything else maps `{ns}.{rest}` → `{ns}-events` so
    /// new producers drain without a relay redeploy.
    fn topic_for(event_type: &str) -> String {
        EventType::parse(event_type).map_or_else(
            || {
                let namespace = event_type.split('.').next().unwrap_or(event_type);
                format!("{namespace}-events")
            },
            |ty| ty.topic().to_string(),
        )
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let config = RelayConfig::default();

        let first = config.backoff(1);
        assert!(first >= Duration::from_millis(2500) && first <= Duration::from_secs(5));

        let second = config.backoff(2);
        assert!(second >= Duration::from_secs(5) && second <= Duration::from_secs(10));

        let huge = config.backoff(30);
        assert!(huge <= config.backoff_cap);
        assert!(huge >= config.backoff_cap / 2);
    }

    #[test]
    fn known_event_types_use_pinned_topics() {
        assert_eq!(OutboxRelay::topic_for("booking.created"), "booking-events");
        assert_eq!(OutboxRelay::topic_for("payment.failed"), "payment-events");
    }

    #[test]
    fn unknown_event_types_fall_back_to_namespace() {
        assert_eq!(OutboxRelay::topic_for("ticket.issued"), "ticket-events");
    }
}
