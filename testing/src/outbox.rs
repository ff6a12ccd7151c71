//! In-memory outbox store.

use chrono::{DateTime, Utc};
use rushtix_core::repository::RepoFuture;
use rushtix_core::{DomainError, NewOutboxRow, OutboxRow, OutboxStore};
use std::sync::Mutex;
use std::time::Duration;

/// Outbox rows in a vector, claimed and marked like the Postgres store.
#[derive(Default)]
pub struct MemoryOutboxStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    rows: Vec<OutboxRow>,
    next_id: i64,
}

impl MemoryOutboxStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a row, as a booking transaction would.
    pub fn insert(&self, new: NewOutboxRow, created_at: DateTime<Utc>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.rows.push(OutboxRow {
                id,
                aggregate_id: new.aggregate_id,
                event_type: new.event_type,
                payload: new.payload,
                headers: new.headers,
                created_at,
                sent_at: None,
                attempts: 0,
                next_retry_at: None,
                last_error: None,
            });
        }
    }

    /// Snapshot of every row, for assertions.
    #[must_use]
    pub fn rows(&self) -> Vec<OutboxRow> {
        self.inner.lock().map(|i| i.rows.clone()).unwrap_or_default()
    }

    /// Rows of one event type, for assertions.
    #[must_use]
    pub fn rows_of_type(&self, event_type: &str) -> Vec<OutboxRow> {
        self.rows()
            .into_iter()
            .filter(|r| r.event_type == event_type)
            .collect()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, DomainError> {
        self.inner
            .lock()
            .map_err(|_| DomainError::Internal("outbox store poisoned".to_string()))
    }
}

impl OutboxStore for MemoryOutboxStore {
    fn claim_batch(
        &self,
        batch_size: u32,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, Vec<OutboxRow>> {
        Box::pin(async move {
            let mut inner = self.lock()?;
            let lease_until = now + chrono::Duration::from_std(lease).unwrap_or_default();

            let mut due: Vec<usize> = inner
                .rows
                .iter()
                .enumerate()
                .filter(|(_, r)| {
                    r.sent_at.is_none() && r.next_retry_at.is_none_or(|t| t < now)
                })
                .map(|(i, _)| i)
                .collect();
            due.sort_by_key(|&i| (inner.rows[i].created_at, inner.rows[i].id));
            due.truncate(batch_size as usize);

            let mut claimed = Vec::with_capacity(due.len());
            for i in due {
                inner.rows[i].next_retry_at = Some(lease_until);
                claimed.push(inner.rows[i].clone());
            }
            Ok(claimed)
        })
    }

    fn mark_sent(&self, id: i64, now: DateTime<Utc>) -> RepoFuture<'_, ()> {
        Box::pin(async move {
            let mut inner = self.lock()?;
            if let Some(row) = inner.rows.iter_mut().find(|r| r.id == id) {
                row.sent_at = Some(now);
            }
            Ok(())
        })
    }

    fn mark_failed(
        &self,
        id: i64,
        error: &str,
        next_retry_at: DateTime<Utc>,
    ) -> RepoFuture<'_, ()> {
        let error = error.to_string();
        Box::pin(async move {
            let mut inner = self.lock()?;
            if let Some(row) = inner.rows.iter_mut().find(|r| r.id == id) {
                row.attempts += 1;
                row.last_error = Some(error);
                row.next_retry_at = Some(next_retry_at);
            }
            Ok(())
        })
    }

    fn delete_sent_before(&self, cutoff: DateTime<Utc>) -> RepoFuture<'_, u64> {
        Box::pin(async move {
            let mut inner = self.lock()?;
            let before = inner.rows.len();
            inner
                .rows
                .retain(|r| r.sent_at.is_none_or(|sent| sent >= cutoff));
            Ok((before - inner.rows.len()) as u64)
        })
    }

    fn pending_count(&self) -> RepoFuture<'_, i64> {
        Box::pin(async move {
            let inner = self.lock()?;
            Ok(inner.rows.iter().filter(|r| r.sent_at.is_none()).count() as i64)
        })
    }
}
