//! Idempotency records for mutating requests.
//!
//! A client retrying a mutating request with the same `X-Idempotency-Key`
//! must observe the original response bytes and never trigger the effect
//! twice. The record lives in Redis under a dual TTL: 60 seconds while
//! `processing` (so a crashed handler unblocks retries quickly), 24 hours
//! once `completed` (the replay window).

use crate::keys;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use rushtix_core::idempotency::{BeginOutcome, IdempotencyBackend, IdempotencyRecord, IdempotencyStatus};
use rushtix_core::repository::RepoFuture;
use rushtix_core::DomainError;

/// TTL of a record still being processed.
pub const PROCESSING_TTL_SECS: u64 = 60;

/// TTL of a completed record (the replay window).
pub const COMPLETED_TTL_SECS: u64 = 24 * 60 * 60;

/// Redis-backed idempotency store.
#[derive(Clone)]
pub struct IdempotencyStore {
    conn: ConnectionManager,
}

impl IdempotencyStore {
    /// Create the store over the shared connection manager.
    #[must_use]
    pub const fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Try to claim the key for this request.
    ///
    /// Atomically writes a `processing` record with `SET NX EX`; if a
    /// record already exists, classifies it into one of the conflict
    /// outcomes.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::DependencyUnavailable`] on Redis failure.
    pub async fn begin(&self, key: &str, request_hash: &str) -> Result<BeginOutcome, DomainError> {
        let record_key = keys::idempotency(key);
        let record = IdempotencyRecord {
            status: IdempotencyStatus::Processing,
            request_hash: request_hash.to_string(),
            response_code: None,
            response_body: None,
            completed_at: None,
        };
        let payload = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();

        let claimed: Option<String> = redis::cmd("SET")
            .arg(&record_key)
            .arg(&payload)
            .arg("NX")
            .arg("EX")
            .arg(PROCESSING_TTL_SECS)
            .query_async(&mut conn)
            .await
            .map_err(|e| crate::dependency_error("idempotency claim failed", &e))?;

        if claimed.is_some() {
            return Ok(BeginOutcome::Started);
        }

        let existing: Option<String> = redis::cmd("GET")
            .arg(&record_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| crate::dependency_error("idempotency read failed", &e))?;

        // The record can expire between SET NX and GET; treat that window
        // as a fresh claim on the retry path rather than failing the call.
        let Some(existing) = existing else {
            return Ok(BeginOutcome::InProgress);
        };

        let existing: IdempotencyRecord = serde_json::from_str(&existing)?;

        if existing.request_hash != request_hash {
            metrics::counter!("idempotency.mismatch").increment(1);
            return Ok(BeginOutcome::Mismatch);
        }

        match existing.status {
            IdempotencyStatus::Processing => Ok(BeginOutcome::InProgress),
            IdempotencyStatus::Completed => {
                metrics::counter!("idempotency.replayed").increment(1);
                Ok(BeginOutcome::Replay(existing))
            }
        }
    }

    /// Cache the response for the replay window.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::DependencyUnavailable`] on Redis failure.
    pub async fn complete(
        &self,
        key: &str,
        request_hash: &str,
        response_code: u16,
        response_body: &str,
        now: DateTime<Utc>,
    ) -> Result<(), DomainError> {
        let record = IdempotencyRecord {
            status: IdempotencyStatus::Completed,
            request_hash: request_hash.to_string(),
            response_code: Some(response_code),
            response_body: Some(response_body.to_string()),
            completed_at: Some(now),
        };
        let payload = serde_json::to_string(&record)?;
        let mut conn = self.conn.clone();

        let () = redis::cmd("SET")
            .arg(keys::idempotency(key))
            .arg(&payload)
            .arg("EX")
            .arg(COMPLETED_TTL_SECS)
            .query_async(&mut conn)
            .await
            .map_err(|e| crate::dependency_error("idempotency complete failed", &e))?;

        Ok(())
    }

    /// Drop the claim after a 5xx so the client's retry can run the
    /// handler again instead of replaying a server failure.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::DependencyUnavailable`] on Redis failure.
    pub async fn abandon(&self, key: &str) -> Result<(), DomainError> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("DEL")
            .arg(keys::idempotency(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| crate::dependency_error("idempotency abandon failed", &e))?;
        Ok(())
    }
}

impl IdempotencyBackend for IdempotencyStore {
    fn begin(&self, key: &str, request_hash: &str) -> RepoFuture<'_, BeginOutcome> {
        let key = key.to_string();
        let request_hash = request_hash.to_string();
        Box::pin(async move { Self::begin(self, &key, &request_hash).await })
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
            Self::complete(self, &key, &request_hash, response_code, &response_body, now).await
        })
    }

    fn abandon(&self, key: &str) -> RepoFuture<'_, ()> {
        let key = key.to_string();
        Box::pin(async move { Self::abandon(self, &key).await })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn record_serde_round_trips() {
        let record = IdempotencyRecord {
            status: IdempotencyStatus::Completed,
            request_hash: "abc".to_string(),
            response_code: Some(202),
            response_body: Some("{\"ok\":true}".to_string()),
            completed_at: Some(Utc::now()),
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: IdempotencyRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert!(json.contains("\"completed\""));
    }
}
