//! In-memory event publisher.

use rushtix_core::bus::PublishFuture;
use rushtix_core::{DomainEvent, EventPublisher};
use std::sync::Mutex;

/// One captured publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Topic published to
    pub topic: String,
    /// Partition key
    pub key: String,
    /// Payload, decoded back to JSON
    pub payload: serde_json::Value,
}

/// Records every publish for assertions.
#[derive(Default)]
pub struct MemoryBus {
    messages: Mutex<Vec<PublishedMessage>>,
}

impl MemoryBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published so far.
    #[must_use]
    pub fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// Messages on one topic.
    #[must_use]
    pub fn messages_for(&self, topic: &str) -> Vec<PublishedMessage> {
        self.messages()
            .into_iter()
            .filter(|m| m.topic == topic)
            .collect()
    }

    fn record(&self, topic: &str, key: &str, payload: serde_json::Value) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push(PublishedMessage {
                topic: topic.to_string(),
                key: key.to_string(),
                payload,
            });
        }
    }
}

impl EventPublisher for MemoryBus {
    fn publish(&self, topic: &str, key: &str, event: &DomainEvent) -> PublishFuture<'_> {
        let topic = topic.to_string();
        let key = key.to_string();
        let payload = serde_json::to_value(event);
        Box::pin(async move {
            self.record(&topic, &key, payload?);
            Ok(())
        })
    }

    fn publish_raw(&self, topic: &str, key: &str, payload: &[u8]) -> PublishFuture<'_> {
        let topic = topic.to_string();
        let key = key.to_string();
        let value = serde_json::from_slice(payload).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(payload).into_owned())
        });
        Box::pin(async move {
            self.record(&topic, &key, value);
            Ok(())
        })
    }
}
