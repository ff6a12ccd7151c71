//! In-memory idempotency backend.

use chrono::{DateTime, Utc};
use rushtix_core::idempotency::{
    BeginOutcome, IdempotencyBackend, IdempotencyRecord, IdempotencyStatus,
};
use rushtix_core::repository::RepoFuture;
use rushtix_core::DomainError;
use std::collections::HashMap;
use std::sync::Mutex;

/// Idempotency records in a map (no TTL simulation; tests drive the
/// lifecycle explicitly).
#[derive(Default)]
pub struct MemoryIdempotency {
    records: Mutex<HashMap<String, IdempotencyRecord>>,
}

impl MemoryIdempotency {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one record, for assertions.
    #[must_use]
    pub fn record(&self, key: &str) -> Option<IdempotencyRecord> {
        self.records.lock().ok()?.get(key).cloned()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, IdempotencyRecord>>, DomainError> {
        self.records
            .lock()
            .map_err(|_| DomainError::Internal("idempotency store poisoned".to_string()))
    }
}

impl IdempotencyBackend for MemoryIdempotency {
    fn begin(&self, key: &str, request_hash: &str) -> RepoFuture<'_, BeginOutcome> {
        let key = key.to_string();
        let request_hash = request_hash.to_string();
        Box::pin(async move {
            let mut records = self.lock()?;

            if let Some(existing) = records.get(&key) {
                if existing.request_hash != request_hash {
                    return Ok(BeginOutcome::Mismatch);
                }
                return Ok(match existing.status {
                    IdempotencyStatus::Processing => BeginOutcome::InProgress,
                    IdempotencyStatus::Completed => BeginOutcome::Replay(existing.clone()),
                });
            }

            records.insert(
                key,
                IdempotencyRecord {
                    status: IdempotencyStatus::Processing,
                    request_hash,
                    response_code: None,
                    response_body: None,
                    completed_at: None,
                },
            );
            Ok(BeginOutcome::Started)
        })
    }

    fn complete(
        &self,
        key: &str,
        request_hash: &str,
        response_code: u16,
        response_body: &str,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, ()> {
        let key = key.to_string();
        let request_hash = request_hash.to_string();
        let response_body = response_body.to_string();
        Box::pin(async move {
            self.lock()?.insert(
                key,
                IdempotencyRecord {
                    status: IdempotencyStatus::Completed,
                    request_hash,
                    response_code: Some(response_code),
                    response_body: Some(response_body),
                    completed_at: Some(now),
                },
            );
            Ok(())
        })
    }

    fn abandon(&self, key: &str) -> RepoFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move {
            self.lock()?.remove(&key);
            Ok(())
        })
    }
}
