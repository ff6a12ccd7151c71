//! Outbox row types.
//!
//! An outbox row is written in the same database transaction as the
//! business change it announces; the relay publishes it to the bus later.
//! A row is terminal once `sent_at` is set.

use crate::event::DomainEvent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A pending or sent outbox row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRow {
    /// Row id
    pub id: i64,
    /// Aggregate the event concerns (bus partition key)
    pub aggregate_id: Uuid,
    /// Dotted event type name
    pub event_type: String,
    /// Serialized [`DomainEvent`] envelope
    pub payload: serde_json::Value,
    /// Transport headers to forward (request id, trace id)
    pub headers: serde_json::Value,
    /// When the business transaction committed
    pub created_at: DateTime<Utc>,
    /// When the relay published successfully
    pub sent_at: Option<DateTime<Utc>>,
    /// Publish attempts so far
    pub attempts: i32,
    /// Earliest time the relay may try again
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Last publish failure, for operators
    pub last_error: Option<String>,
}

impl OutboxRow {
    /// Decode the payload back into the envelope.
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the payload is not a valid
    /// envelope (such rows end up in the DLQ).
    pub fn event(&self) -> Result<DomainEvent, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Input for inserting an outbox row inside a business transaction.
#[derive(Clone, Debug)]
pub struct NewOutboxRow {
    /// Aggregate the event concerns
    pub aggregate_id: Uuid,
    /// Dotted event type name
    pub event_type: String,
    /// Serialized envelope
    pub payload: serde_json::Value,
    /// Transport headers to forward
    pub headers: serde_json::Value,
}

impl NewOutboxRow {
    /// Build a row from an envelope, keyed by `aggregate_id`.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the envelope cannot be encoded.
    pub fn from_event(
        aggregate_id: Uuid,
        event: &DomainEvent,
        headers: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            aggregate_id,
            event_type: event.event_type.clone(),
            payload: serde_json::to_value(event)?,
            headers,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::{EventType, SCHEMA_VERSION};

    #[test]
    fn row_payload_round_trips_envelope() {
        let envelope =
            DomainEvent::new(EventType::BookingCreated, Utc::now(), &serde_json::json!({"q": 2}))
                .unwrap();
        let aggregate = Uuid::new_v4();
        let new = NewOutboxRow::from_event(aggregate, &envelope, serde_json::json!({})).unwrap();
        assert_eq!(new.event_type, "booking.created");

        let row = OutboxRow {
            id: 1,
            aggregate_id: new.aggregate_id,
            event_type: new.event_type,
            payload: new.payload,
            headers: new.headers,
            created_at: Utc::now(),
            sent_at: None,
            attempts: 0,
            next_retry_at: None,
            last_error: None,
        };
        let decoded = row.event().unwrap();
        assert_eq!(decoded.version, SCHEMA_VERSION);
        assert_eq!(decoded.data["q"], serde_json::json!(2));
    }
}
