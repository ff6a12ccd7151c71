//! Admission queue contract.
//!
//! The virtual waiting room in front of the booking endpoints.
//! `rushtix-redis` implements it over sorted sets and signed queue
//! tokens; `rushtix-testing` keeps everything in memory.

use crate::repository::RepoFuture;
use crate::error::DomainError;
use crate::types::{EventId, UserId};
use chrono::{DateTime, Utc};

/// Result of joining (or re-joining) a queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueuePosition {
    /// 1-based position in the queue
    pub position: u64,
    /// Users currently queued
    pub total_in_queue: u64,
    /// Estimated seconds until admission
    pub estimated_wait_seconds: u64,
    /// Signed queue token to present as `X-Queue-Pass`
    pub token: String,
}

/// Point-in-time queue status for one user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueStatus {
    /// 1-based position, absent once released (or never joined)
    pub position: Option<u64>,
    /// Whether the user holds an active pass
    pub is_open: bool,
    /// Users currently queued
    pub total_in_queue: u64,
}

/// Outcome of one release tick for one event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Passes issued this tick
    pub released: u32,
    /// Active passes after the tick
    pub active_passes: u32,
    /// Users put back because pass creation kept failing
    pub requeued: u32,
}

/// The virtual waiting room.
pub trait AdmissionQueue: Send + Sync {
    /// Join the waiting room; idempotent for a user already queued.
    fn join(
        &self,
        event_id: EventId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, QueuePosition>;

    /// Current position and pass state for a user.
    fn status(&self, event_id: EventId, user_id: UserId) -> RepoFuture<'_, QueueStatus>;

    /// One release tick: admit users from the head of the queue up to
    /// the active-pass cap.
    fn release_batch(&self, event_id: EventId, now: DateTime<Utc>)
        -> RepoFuture<'_, ReleaseReport>;

    /// Consume a user's pass (single use). Returns whether an active
    /// pass existed.
    fn consume_pass(&self, event_id: EventId, user_id: UserId) -> RepoFuture<'_, bool>;

    /// Verify a queue token belongs to `{event_id, user_id}`.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Forbidden`] for a token that fails
    /// validation or names someone else.
    fn verify_token(
        &self,
        token: &str,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<(), DomainError>;

    /// Events with a non-empty waiting room, for the release ticker.
    fn active_events(&self) -> RepoFuture<'_, Vec<EventId>>;
}
