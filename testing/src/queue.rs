//! In-memory admission queue.
//!
//! FIFO by join order, single-use passes and the active-pass cap,
//! without Redis. Tokens are plain `{event_id}:{user_id}` strings so tests can
//! forge and tamper with them deliberately.

use chrono::{DateTime, Utc};
use rushtix_core::queue::{AdmissionQueue, QueuePosition, QueueStatus, ReleaseReport};
use rushtix_core::repository::RepoFuture;
use rushtix_core::{DomainError, EventId, UserId};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    /// Join order per event
    queues: HashMap<EventId, Vec<UserId>>,
    /// Active passes with expiry
    passes: HashMap<(EventId, UserId), DateTime<Utc>>,
}

/// In-memory waiting room.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    /// Maximum active passes per event
    pub max_concurrent: u32,
    /// Pass lifetime in seconds
    pub pass_ttl_seconds: i64,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_concurrent: 500,
            pass_ttl_seconds: 300,
        }
    }
}

impl MemoryQueue {
    /// Create a queue with defaults (cap 500, pass TTL 5 min).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a queue with an explicit cap.
    #[must_use]
    pub fn with_cap(max_concurrent: u32) -> Self {
        Self {
            max_concurrent,
            ..Self::default()
        }
    }

    fn token(event_id: EventId, user_id: UserId) -> String {
        format!("{event_id}:{user_id}")
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, DomainError> {
        self.inner
            .lock()
            .map_err(|_| DomainError::Internal("queue poisoned".to_string()))
    }
}

impl AdmissionQueue for MemoryQueue {
    fn join(
        &self,
        event_id: EventId,
        user_id: UserId,
        _now: DateTime<Utc>,
    ) -> RepoFuture<'_, QueuePosition> {
        Box::pin(async move {
            let mut inner = self.lock()?;
            let queue = inner.queues.entry(event_id).or_default();

            let index = match queue.iter().position(|&u| u == user_id) {
                Some(existing) => existing,
                None => {
                    queue.push(user_id);
                    queue.len() - 1
                }
            };
            let position = index as u64 + 1;
            let total = queue.len() as u64;
            drop(inner);

            Ok(QueuePosition {
                position,
                total_in_queue: total,
                estimated_wait_seconds: position,
                token: Self::token(event_id, user_id),
            })
        })
    }

    fn status(&self, event_id: EventId, user_id: UserId) -> RepoFuture<'_, QueueStatus> {
        Box::pin(async move {
            let inner = self.lock()?;
            let queue = inner.queues.get(&event_id);
            Ok(QueueStatus {
                position: queue.and_then(|q| {
                    q.iter().position(|&u| u == user_id).map(|p| p as u64 + 1)
                }),
                is_open: inner.passes.contains_key(&(event_id, user_id)),
                total_in_queue: queue.map_or(0, |q| q.len() as u64),
            })
        })
    }

    fn release_batch(
        &self,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, ReleaseReport> {
        Box::pin(async move {
            let mut inner = self.lock()?;
            inner.passes.retain(|_, expiry| *expiry > now);

            let active = inner
                .passes
                .keys()
                .filter(|(event, _)| *event == event_id)
                .count() as u32;
            let capacity = self.max_concurrent.saturating_sub(active) as usize;

            let queue = inner.queues.entry(event_id).or_default();
            let take = capacity.min(queue.len());
            let admitted: Vec<UserId> = queue.drain(..take).collect();
            let released = admitted.len() as u32;

            let expiry = now + chrono::Duration::seconds(self.pass_ttl_seconds);
            for user in admitted {
                inner.passes.insert((event_id, user), expiry);
            }

            Ok(ReleaseReport {
                released,
                active_passes: active + released,
                requeued: 0,
            })
        })
    }

    fn consume_pass(&self, event_id: EventId, user_id: UserId) -> RepoFuture<'_, bool> {
        Box::pin(async move {
            let mut inner = self.lock()?;
            Ok(inner.passes.remove(&(event_id, user_id)).is_some())
        })
    }

    fn verify_token(
        &self,
        token: &str,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<(), DomainError> {
        if token == Self::token(event_id, user_id) {
            Ok(())
        } else {
            Err(DomainError::Forbidden)
        }
    }

    fn active_events(&self) -> RepoFuture<'_, Vec<EventId>> {
        Box::pin(async move {
            let inner = self.lock()?;
            Ok(inner
                .queues
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(&event, _)| event)
                .collect())
        })
    }
}
