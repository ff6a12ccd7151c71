//! Redpanda message bus for the Rushtix booking platform.
//!
//! Kafka-compatible transport via rdkafka. The outbox relay is the only
//! producer of domain events; workers and the saga orchestrator consume
//! with consumer-group semantics.
//!
//! # Delivery semantics
//!
//! **At-least-once**: consumers commit offsets manually, *after* their
//! database transaction succeeds. A crash between processing and commit
//! redelivers the message, so every consumer must be idempotent.
//! Per-aggregate ordering holds because messages are keyed by aggregate
//! id and Kafka preserves order within a partition.
//!
//! # Wire format
//!
//! Payloads are the JSON [`DomainEvent`] envelope. Unknown payload fields
//! pass through untouched (add-only schema evolution).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consumer;
pub mod dlq;
pub mod topics;

pub use consumer::{ConsumeError, ConsumerPool, ConsumerPoolConfig, EventHandler, ReceivedEvent};
pub use dlq::DlqEnvelope;

use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rushtix_core::DomainEvent;
use std::time::Duration;
use thiserror::Error;

/// Bus-layer failures.
#[derive(Debug, Error)]
pub enum BusError {
    /// Could not build or connect a client
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Publish did not reach the broker
    #[error("publish to {topic} failed: {reason}")]
    PublishFailed {
        /// Target topic
        topic: String,
        /// Broker-reported reason
        reason: String,
    },

    /// Subscription could not be established
    #[error("subscription to {topics:?} failed: {reason}")]
    SubscriptionFailed {
        /// Topics requested
        topics: Vec<String>,
        /// Broker-reported reason
        reason: String,
    },

    /// Message on the wire was not a valid envelope
    #[error("deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Serialization of an outgoing message failed
    #[error("serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),
}

/// Bus producer handle.
///
/// One producer per process; cheap to clone.
#[derive(Clone)]
pub struct BusProducer {
    producer: FutureProducer,
    timeout: Duration,
}

/// Builder for [`BusProducer`].
#[derive(Default)]
pub struct BusProducerBuilder {
    brokers: Option<String>,
    acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl BusProducerBuilder {
    /// Set the broker addresses (comma-separated).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the acknowledgment mode: `"0"`, `"1"` or `"all"`. Default `"all"`:
    /// the outbox already absorbed the write, losing it here would break
    /// at-least-once.
    #[must_use]
    pub fn acks(mut self, acks: impl Into<String>) -> Self {
        self.acks = Some(acks.into());
        self
    }

    /// Set the compression codec. Default `"none"`.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the send timeout. Default 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the producer.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] if brokers are missing or
    /// the client cannot be created.
    pub fn build(self) -> Result<BusProducer, BusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BusError::ConnectionFailed("brokers not configured".to_string()))?;

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", self.acks.as_deref().unwrap_or("all"))
            .set(
                "compression.type",
                self.compression.as_deref().unwrap_or("none"),
            )
            .create()
            .map_err(|e| BusError::ConnectionFailed(format!("failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            acks = self.acks.as_deref().unwrap_or("all"),
            "bus producer created"
        );

        Ok(BusProducer {
            producer,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
        })
    }
}

impl BusProducer {
    /// Create a builder.
    #[must_use]
    pub fn builder() -> BusProducerBuilder {
        BusProducerBuilder::default()
    }

    /// Publish an envelope, keyed by `key` for partition affinity.
    ///
    /// Events for the same aggregate must use the same key so consumers
    /// observe them in commit order.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the broker does not
    /// acknowledge within the timeout.
    pub async fn publish(
        &self,
        topic: &str,
        key: &str,
        event: &DomainEvent,
    ) -> Result<(), BusError> {
        let payload = serde_json::to_vec(event)?;
        self.publish_raw(topic, key, &payload).await
    }

    /// Publish pre-serialized bytes (used by the relay, which forwards
    /// outbox payloads verbatim to preserve unknown fields).
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if the broker does not
    /// acknowledge within the timeout.
    pub async fn publish_raw(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<(), BusError> {
        let record = FutureRecord::to(topic).payload(payload).key(key);

        match self
            .producer
            .send(record, Timeout::After(self.timeout))
            .await
        {
            Ok((partition, offset)) => {
                tracing::debug!(
                    topic = %topic,
                    partition,
                    offset,
                    key = %key,
                    "message published"
                );
                metrics::counter!("bus.published", "topic" => topic.to_string()).increment(1);
                Ok(())
            }
            Err((kafka_error, _)) => {
                tracing::error!(topic = %topic, error = %kafka_error, "failed to publish message");
                metrics::counter!("bus.publish_failed", "topic" => topic.to_string()).increment(1);
                Err(BusError::PublishFailed {
                    topic: topic.to_string(),
                    reason: kafka_error.to_string(),
                })
            }
        }
    }
}

impl rushtix_core::EventPublisher for BusProducer {
    fn publish(
        &self,
        topic: &str,
        key: &str,
        event: &DomainEvent,
    ) -> rushtix_core::PublishFuture<'_> {
        let topic = topic.to_string();
        let key = key.to_string();
        let event = event.clone();
        Box::pin(async move {
            Self::publish(self, &topic, &key, &event)
                .await
                .map_err(|e| rushtix_core::DomainError::Bus(e.to_string()))
        })
    }

    fn publish_raw(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> rushtix_core::PublishFuture<'_> {
        let topic = topic.to_string();
        let key = key.to_string();
        let payload = payload.to_vec();
        Box::pin(async move {
            Self::publish_raw(self, &topic, &key, &payload)
                .await
                .map_err(|e| rushtix_core::DomainError::Bus(e.to_string()))
        })
    }
}
