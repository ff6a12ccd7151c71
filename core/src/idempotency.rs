//! Idempotency contract.
//!
//! Dedupe for mutating requests: a retry with the same key must observe
//! the original response bytes and never re-run the effect.
//! `rushtix-redis` implements the backend with `SET NX EX` and a dual
//! TTL; `rushtix-testing` keeps records in memory.

use crate::repository::RepoFuture;
use crate::types::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Processing state of an idempotency record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    /// The original request is still running
    Processing,
    /// The original request finished; response cached
    Completed,
}

/// The stored record for one idempotency key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    /// Processing state
    pub status: IdempotencyStatus,
    /// Hash of the original request (method ∥ path ∥ user ∥ body)
    pub request_hash: String,
    /// Cached response status, once completed
    pub response_code: Option<u16>,
    /// Cached response body, once completed
    pub response_body: Option<String>,
    /// When the original request finished
    pub completed_at: Option<DateTime<Utc>>,
}

/// What the ingress should do with a keyed request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BeginOutcome {
    /// First sighting of this key: run the handler
    Started,
    /// Same key, different request bytes
    Mismatch,
    /// Original request still running
    InProgress,
    /// Finished earlier: replay the cached response byte-for-byte
    Replay(IdempotencyRecord),
}

/// Idempotency record storage.
pub trait IdempotencyBackend: Send + Sync {
    /// Try to claim `key` for a request with this fingerprint.
    fn begin(&self, key: &str, request_hash: &str) -> RepoFuture<'_, BeginOutcome>;

    /// Cache the response for the replay window.
    fn complete(
        &self,
        key: &str,
        request_hash: &str,
        response_code: u16,
        response_body: &str,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, ()>;

    /// Drop the claim after a server failure so the client's retry can
    /// run the handler again.
    fn abandon(&self, key: &str) -> RepoFuture<'_, ()>;
}

/// Hash a request into its dedupe fingerprint:
/// `SHA256(method ∥ path ∥ user_id ∥ body)`, hex-encoded.
#[must_use]
pub fn request_hash(method: &str, path: &str, user_id: UserId, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(method.as_bytes());
    hasher.update(path.as_bytes());
    hasher.update(user_id.to_string().as_bytes());
    hasher.update(body);
    let digest = hasher.finalize();

    use std::fmt::Write;
    digest.iter().fold(String::with_capacity(64), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
