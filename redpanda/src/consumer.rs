//! Consumer-group worker pool.
//!
//! Each pool member owns a `StreamConsumer` in the shared consumer group,
//! so partitions spread across the pool. Per message:
//!
//! 1. decode the [`DomainEvent`] envelope,
//! 2. run the handler (panics are caught and treated as permanent
//!    failures, so the pool survives),
//! 3. retry transient failures in place with backoff,
//! 4. park the message on the DLQ once the budget is spent,
//! 5. commit the offset, only after the handler (or the DLQ) accepted
//!    the message, giving at-least-once delivery.

use crate::dlq::DlqEnvelope;
use crate::{BusError, BusProducer};
use chrono::Utc;
use futures::FutureExt;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rushtix_core::DomainEvent;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// A decoded message handed to a handler.
#[derive(Clone, Debug)]
pub struct ReceivedEvent {
    /// Topic the message arrived on
    pub topic: String,
    /// Partition key
    pub key: String,
    /// Decoded envelope
    pub event: DomainEvent,
}

/// How a handler failed.
#[derive(Debug, thiserror::Error)]
pub enum ConsumeError {
    /// Worth retrying: dependency briefly down, lock contention
    #[error("transient: {0}")]
    Transient(String),
    /// Retrying cannot help: straight to the DLQ
    #[error("permanent: {0}")]
    Permanent(String),
}

/// Message handler run by the pool.
pub trait EventHandler: Send + Sync {
    /// Process one message. Must be idempotent: redelivery happens.
    fn handle(
        &self,
        event: ReceivedEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), ConsumeError>> + Send + '_>>;
}

/// Pool configuration.
#[derive(Clone, Debug)]
pub struct ConsumerPoolConfig {
    /// Broker addresses (comma-separated)
    pub brokers: String,
    /// Consumer group id
    pub group_id: String,
    /// Topics to subscribe to
    pub topics: Vec<String>,
    /// Number of consumer tasks
    pub pool_size: usize,
    /// In-place retries for transient handler failures
    pub max_retries: usize,
    /// Delay between in-place retries
    pub retry_delay: Duration,
    /// Where new groups start reading
    pub auto_offset_reset: String,
}

impl Default for ConsumerPoolConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "rushtix".to_string(),
            topics: vec![],
            pool_size: 5,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            auto_offset_reset: "earliest".to_string(),
        }
    }
}

/// Spawns and supervises the consumer tasks.
pub struct ConsumerPool {
    config: ConsumerPoolConfig,
    producer: BusProducer,
}

impl ConsumerPool {
    /// Create a pool description.
    #[must_use]
    pub const fn new(config: ConsumerPoolConfig, producer: BusProducer) -> Self {
        Self { config, producer }
    }

    /// Spawn the pool. Tasks run until `shutdown` flips to `true`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::SubscriptionFailed`] if any member cannot
    /// subscribe (already-spawned members keep running and drain on
    /// shutdown).
    pub fn spawn(
        &self,
        handler: Arc<dyn EventHandler>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<JoinHandle<()>>, BusError> {
        let mut handles = Vec::with_capacity(self.config.pool_size);

        for worker in 0..self.config.pool_size {
            let consumer = self.build_consumer()?;
            let config = self.config.clone();
            let producer = self.producer.clone();
            let handler = Arc::clone(&handler);
            let mut shutdown = shutdown.clone();

            handles.push(tokio::spawn(async move {
                tracing::info!(
                    group = %config.group_id,
                    topics = ?config.topics,
                    worker,
                    "consumer started"
                );

                loop {
                    tokio::select! {
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                        received = consumer.recv() => {
                            match received {
                                Ok(message) => {
                                    Self::process(
                                        &config,
                                        &producer,
                                        handler.as_ref(),
                                        &message,
                                    )
                                    .await;

                                    if let Err(e) =
                                        consumer.commit_message(&message, CommitMode::Async)
                                    {
                                        tracing::warn!(
                                            topic = message.topic(),
                                            partition = message.partition(),
                                            offset = message.offset(),
                                            error = %e,
                                            "offset commit failed (message may be redelivered)"
                                        );
                                    }
                                }
                                Err(e) => {
                                    tracing::error!(
                                        group = %config.group_id,
                                        error = %e,
                                        "consumer receive error"
                                    );
                                    tokio::time::sleep(Duration::from_secs(1)).await;
                                }
                            }
                        }
                    }
                }

                tracing::info!(group = %config.group_id, worker, "consumer stopped");
            }));
        }

        Ok(handles)
    }

    fn build_consumer(&self) -> Result<StreamConsumer, BusError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.config.brokers)
            .set("group.id", &self.config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set("session.timeout.ms", "6000")
            .set("enable.partition.eof", "false")
            .create()
            .map_err(|e| BusError::SubscriptionFailed {
                topics: self.config.topics.clone(),
                reason: format!("failed to create consumer: {e}"),
            })?;

        let topic_refs: Vec<&str> = self.config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BusError::SubscriptionFailed {
                topics: self.config.topics.clone(),
                reason: format!("failed to subscribe: {e}"),
            })?;

        Ok(consumer)
    }

    /// Run the handler with retries; absorb every failure mode so the
    /// caller can always commit afterwards.
    async fn process<M: Message>(
        config: &ConsumerPoolConfig,
        producer: &BusProducer,
        handler: &dyn EventHandler,
        message: &M,
    ) {
        let topic = message.topic().to_string();
        let key = String::from_utf8_lossy(message.key().unwrap_or_default()).to_string();

        let Some(payload) = message.payload() else {
            tracing::warn!(topic = %topic, "dropping message without payload");
            return;
        };

        let event: DomainEvent = match serde_json::from_slice(payload) {
            Ok(event) => event,
            Err(e) => {
                Self::park(
                    producer,
                    &topic,
                    &key,
                    payload,
                    &format!("undecodable envelope: {e}"),
                    0,
                    Utc::now(),
                )
                .await;
                return;
            }
        };

        let first_attempt_at = Utc::now();
        let mut attempts: u32 = 0;
        let mut last_error;

        loop {
            attempts += 1;
            let received = ReceivedEvent {
                topic: topic.clone(),
                key: key.clone(),
                event: event.clone(),
            };

            // catch_unwind keeps one poisoned message from killing the
            // pool member.
            let outcome = std::panic::AssertUnwindSafe(handler.handle(received))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {
                    metrics::counter!("bus.consumed", "topic" => topic.clone()).increment(1);
                    return;
                }
                Ok(Err(ConsumeError::Transient(e))) => {
                    last_error = e;
                    if attempts <= config.max_retries as u32 {
                        tracing::warn!(
                            topic = %topic,
                            key = %key,
                            attempts,
                            error = %last_error,
                            "transient handler failure, retrying"
                        );
                        tokio::time::sleep(config.retry_delay).await;
                        continue;
                    }
                }
                Ok(Err(ConsumeError::Permanent(e))) => {
                    last_error = e;
                }
                Err(panic) => {
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map_or_else(|| "handler panicked".to_string(), ToString::to_string);
                    tracing::error!(topic = %topic, key = %key, panic = %msg, "handler panicked");
                    metrics::counter!("bus.handler_panics", "topic" => topic.clone()).increment(1);
                    last_error = format!("panic: {msg}");
                }
            }

            Self::park(
                producer,
                &topic,
                &key,
                payload,
                &last_error,
                attempts,
                first_attempt_at,
            )
            .await;
            return;
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn park(
        producer: &BusProducer,
        topic: &str,
        key: &str,
        payload: &[u8],
        error: &str,
        attempts: u32,
        first_attempt_at: chrono::DateTime<Utc>,
    ) {
        let now = Utc::now();
        let envelope = DlqEnvelope {
            original_topic: topic.to_string(),
            original_key: key.to_string(),
            payload: serde_json::from_slice(payload)
                .unwrap_or_else(|_| serde_json::Value::String(String::from_utf8_lossy(payload).into_owned())),
            headers: serde_json::json!({}),
            error: error.to_string(),
            attempts,
            first_attempt_at,
            last_attempt_at: now,
            moved_to_dlq_at: now,
            source: "consumer-pool".to_string(),
        };

        if let Err(e) = envelope.publish(producer).await {
            // Offsets still advance: redelivery of everything behind one
            // poisoned message hurts more than losing the DLQ copy.
            tracing::error!(topic = %topic, key = %key, error = %e, "DLQ publish failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pool_config() {
        let config = ConsumerPoolConfig::default();
        assert_eq!(config.pool_size, 5);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.auto_offset_reset, "earliest");
    }

    #[test]
    fn consume_error_display() {
        assert_eq!(
            ConsumeError::Transient("db down".to_string()).to_string(),
            "transient: db down"
        );
        assert_eq!(
            ConsumeError::Permanent("bad state".to_string()).to_string(),
            "permanent: bad state"
        );
    }
}
