//! Saga instance and step record types.
//!
//! A saga is a durable multi-step workflow with per-step compensations.
//! The orchestrator in `rushtix-saga` drives these records; storage lives
//! behind [`crate::repository::SagaStore`].

use crate::types::SagaId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a saga instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Persisted, not yet dispatched
    Pending,
    /// Forward steps in flight
    Running,
    /// All forward steps completed
    Completed,
    /// A step failed before anything completed
    Failed,
    /// Compensations in flight
    Compensating,
    /// Compensations completed
    Compensated,
}

impl SagaStatus {
    /// Database string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Compensating => "compensating",
            Self::Compensated => "compensated",
        }
    }

    /// Parse a status from its database string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "compensating" => Some(Self::Compensating),
            "compensated" => Some(Self::Compensated),
            _ => None,
        }
    }

    /// Whether crash recovery must re-dispatch this instance.
    #[must_use]
    pub const fn is_in_flight(&self) -> bool {
        matches!(self, Self::Running | Self::Compensating)
    }
}

/// Outcome of a dispatched step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Step completed successfully
    Succeeded,
    /// Step failed with a service error code
    Failed {
        /// Error code reported by the executing service
        error_code: String,
    },
    /// No reply before `timeout_at`
    TimedOut,
}

/// Timing and outcome record for one step of one saga instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaStepRecord {
    /// Position in the saga definition (0-based)
    pub step_index: u32,
    /// Step name, e.g. `confirm-booking`
    pub step_name: String,
    /// When the command was dispatched
    pub started_at: DateTime<Utc>,
    /// Deadline for the reply
    pub timeout_at: DateTime<Utc>,
    /// When the reply arrived (or the timeout fired)
    pub finished_at: Option<DateTime<Utc>>,
    /// Outcome, once finished
    pub outcome: Option<StepOutcome>,
    /// Dispatch attempts for this step
    pub retry_count: u32,
}

/// A durable saga instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaInstance {
    /// Instance id
    pub id: SagaId,
    /// Saga definition name, e.g. `post-payment`
    pub name: String,
    /// Lifecycle status
    pub status: SagaStatus,
    /// Index of the step currently in flight (forward or compensating)
    pub current_step: u32,
    /// Versioned JSON payload threaded through the steps
    pub data: serde_json::Value,
    /// When the instance was persisted
    pub started_at: DateTime<Utc>,
    /// When the instance reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// First permanent failure, when any
    pub error: Option<String>,
    /// Per-step records, ordered by `step_index`
    pub steps: Vec<SagaStepRecord>,
}

impl SagaInstance {
    /// Step indices that completed forward execution, in completion order.
    ///
    /// These are the steps compensation must undo, in reverse.
    #[must_use]
    pub fn completed_steps(&self) -> Vec<u32> {
        self.steps
            .iter()
            .filter(|s| matches!(s.outcome, Some(StepOutcome::Succeeded)))
            .map(|s| s.step_index)
            .collect()
    }

    /// The idempotency key for a step of this instance.
    #[must_use]
    pub fn step_idempotency_key(&self, step_name: &str) -> String {
        format!("{}:{step_name}", self.id)
    }
}
