//! Saga wire messages.
//!
//! Commands go out on `saga.commands.{name}`, replies come back on
//! `saga.events.{name}`. Both ride the standard [`DomainEvent`] envelope
//! and are keyed by saga id, which gives each instance a single writer:
//! all replies for one saga land on one orchestrator consumer.

use chrono::{DateTime, Utc};
use rushtix_core::{DomainEvent, SCHEMA_VERSION, SagaId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope event type for step commands.
pub const COMMAND_EVENT_TYPE: &str = "saga.command";

/// Envelope event type for step replies.
pub const REPLY_EVENT_TYPE: &str = "saga.reply";

/// A step command dispatched to an executing service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaCommand {
    /// Instance the step belongs to
    pub saga_id: SagaId,
    /// Definition name
    pub saga_name: String,
    /// Step (or compensation) command name
    pub step_name: String,
    /// Position in the definition
    pub step_index: u32,
    /// `{saga_id}:{step_name}`; executors dedupe on this
    pub idempotency_key: String,
    /// Reply deadline
    pub timeout_at: DateTime<Utc>,
    /// Dispatch attempt number (0-based)
    pub retry_count: u32,
    /// The step's retry budget
    pub max_retries: u32,
    /// Saga payload threaded through every step
    pub data: serde_json::Value,
}

/// An executor's reply to a step command.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaReply {
    /// Instance the reply belongs to
    pub saga_id: SagaId,
    /// Definition name
    pub saga_name: String,
    /// Step (or compensation) command name replied to
    pub step_name: String,
    /// Position in the definition
    pub step_index: u32,
    /// Whether the step succeeded
    pub success: bool,
    /// Service error code when it did not
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Execution time on the service side
    pub duration_ms: u64,
}

impl SagaCommand {
    /// Wrap this command in the wire envelope.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the command cannot be encoded.
    pub fn envelope(&self, now: DateTime<Utc>) -> Result<DomainEvent, serde_json::Error> {
        Ok(DomainEvent {
            event_id: Uuid::new_v4(),
            event_type: COMMAND_EVENT_TYPE.to_string(),
            occurred_at: now,
            version: SCHEMA_VERSION,
            data: serde_json::to_value(self)?,
        })
    }
}

impl SagaReply {
    /// Wrap this reply in the wire envelope.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the reply cannot be encoded.
    pub fn envelope(&self, now: DateTime<Utc>) -> Result<DomainEvent, serde_json::Error> {
        Ok(DomainEvent {
            event_id: Uuid::new_v4(),
            event_type: REPLY_EVENT_TYPE.to_string(),
            occurred_at: now,
            version: SCHEMA_VERSION,
            data: serde_json::to_value(self)?,
        })
    }

    /// Decode a reply out of an envelope, if it is one.
    #[must_use]
    pub fn from_envelope(event: &DomainEvent) -> Option<Self> {
        if event.event_type != REPLY_EVENT_TYPE {
            return None;
        }
        serde_json::from_value(event.data.clone()).ok()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn command_envelope_round_trips() {
        let command = SagaCommand {
            saga_id: SagaId::new(),
            saga_name: "post-payment".to_string(),
            step_name: "confirm-booking".to_string(),
            step_index: 0,
            idempotency_key: "abc:confirm-booking".to_string(),
            timeout_at: Utc::now(),
            retry_count: 0,
            max_retries: 3,
            data: serde_json::json!({"version": 1}),
        };
        let envelope = command.envelope(Utc::now()).unwrap();
        assert_eq!(envelope.event_type, COMMAND_EVENT_TYPE);
        let back: SagaCommand = serde_json::from_value(envelope.data).unwrap();
        assert_eq!(back, command);
    }

    #[test]
    fn reply_decoding_rejects_other_event_types() {
        let reply = SagaReply {
            saga_id: SagaId::new(),
            saga_name: "post-payment".to_string(),
            step_name: "confirm-booking".to_string(),
            step_index: 0,
            success: true,
            error_code: None,
            duration_ms: 12,
        };
        let envelope = reply.envelope(Utc::now()).unwrap();
        assert_eq!(SagaReply::from_envelope(&envelope), Some(reply));

        let mut not_a_reply = envelope;
        not_a_reply.event_type = "booking.created".to_string();
        assert_eq!(SagaReply::from_envelope(&not_a_reply), None);
    }
}
