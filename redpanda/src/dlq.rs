//! Dead-letter envelope.
//!
//! A message that exhausts its retry budget is wrapped (original bytes
//! untouched) and published to `{original_topic}.dlq` for operators to
//! inspect or replay.

use crate::{BusError, BusProducer, topics};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wrapper published to a dead-letter topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqEnvelope {
    /// Topic the message was meant for
    pub original_topic: String,
    /// Partition key it carried
    pub original_key: String,
    /// Original payload, verbatim
    pub payload: serde_json::Value,
    /// Transport headers it carried
    pub headers: serde_json::Value,
    /// Last failure message
    pub error: String,
    /// Delivery attempts made
    pub attempts: u32,
    /// When the first attempt failed
    pub first_attempt_at: DateTime<Utc>,
    /// When the last attempt failed
    pub last_attempt_at: DateTime<Utc>,
    /// When the message was parked here
    pub moved_to_dlq_at: DateTime<Utc>,
    /// Component that gave up, e.g. `outbox-relay`
    pub source: String,
}

impl DlqEnvelope {
    /// Publish this envelope to the original topic's dead-letter topic,
    /// preserving the original key.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if even the DLQ publish fails
    /// (the caller keeps the row pending in that case).
    pub async fn publish(&self, producer: &BusProducer) -> Result<(), BusError> {
        let topic = topics::dlq(&self.original_topic);
        let payload = serde_json::to_vec(self)?;
        producer
            .publish_raw(&topic, &self.original_key, &payload)
            .await?;

        tracing::warn!(
            topic = %topic,
            key = %self.original_key,
            attempts = self.attempts,
            error = %self.error,
            source = %self.source,
            "message moved to DLQ"
        );
        metrics::counter!("bus.dlq", "topic" => self.original_topic.clone()).increment(1);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn envelope_serde_round_trips() {
        let now = Utc::now();
        let envelope = DlqEnvelope {
            original_topic: "booking-events".to_string(),
            original_key: "abc".to_string(),
            payload: serde_json::json!({"event_type": "booking.created"}),
            headers: serde_json::json!({}),
            error: "broker unreachable".to_string(),
            attempts: 10,
            first_attempt_at: now,
            last_attempt_at: now,
            moved_to_dlq_at: now,
            source: "outbox-relay".to_string(),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: DlqEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }
}
