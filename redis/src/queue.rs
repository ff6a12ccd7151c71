//! Virtual waiting room.
//!
//! Users joining a flash sale land in a per-event sorted set scored by
//! join time. A ticker pops the head of the queue and issues
//! **queue-passes** (the right to attempt a reservation) at a rate that
//! keeps the number of concurrently admitted users under
//! `max_concurrent`.
//!
//! A pass is two things working together:
//!
//! - a signed token (HS256 over `{user_id, event_id, issued_at, pass_id}`)
//!   handed to the client at join time, proving queue membership, and
//! - the Redis key `queuepass:{event_id}:{user_id}` written at release
//!   time with a short TTL, which is the actual admission grant.
//!
//! The reservation endpoint verifies the token and consumes the key with
//! `GETDEL`, so a pass is single-use. Expired passes disappear by TTL.
//!
//! Worker restarts lose nothing: queue positions live entirely in the
//! sorted set.

use crate::keys;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use rushtix_core::queue::{AdmissionQueue, QueuePosition, QueueStatus, ReleaseReport};
use rushtix_core::repository::RepoFuture;
use rushtix_core::{DomainError, EventId, UserId};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use ulid::Ulid;

/// Waiting-room tuning knobs.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    /// Maximum users holding active passes per event
    pub max_concurrent: u32,
    /// Queue-pass TTL
    pub pass_ttl: Duration,
    /// How often the release ticker fires
    pub release_interval: Duration,
    /// Estimated admissions per second, for wait estimates
    pub throughput_estimate: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 500,
            pass_ttl: Duration::from_secs(300),
            release_interval: Duration::from_secs(1),
            throughput_estimate: 50.0,
        }
    }
}

/// Claims inside the signed queue token.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueuePassClaims {
    /// User the token belongs to
    pub sub: UserId,
    /// Event the token admits to
    pub event_id: EventId,
    /// Unique pass id
    pub pass_id: String,
    /// Issued-at (unix seconds)
    pub iat: i64,
    /// Expiry (unix seconds)
    pub exp: i64,
}

/// Queue admission over Redis.
#[derive(Clone)]
pub struct QueueAdmission {
    conn: ConnectionManager,
    config: QueueConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

/// How long a queue token stays decodable. Admission is still gated by
/// the short-TTL Redis pass key; this only bounds how long a queue
/// session can sit idle.
const QUEUE_TOKEN_LIFETIME_SECS: i64 = 24 * 60 * 60;

/// Per-user attempts to write the pass key inside one tick.
const PASS_CREATE_ATTEMPTS: usize = 3;

impl QueueAdmission {
    /// Create the admission store. `secret` is `QUEUE_JWT_SECRET`.
    #[must_use]
    pub fn new(conn: ConnectionManager, config: QueueConfig, secret: &[u8]) -> Self {
        Self {
            conn,
            config,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    /// Join the waiting room for `event_id`.
    ///
    /// Idempotent: a user already queued keeps their original score
    /// (`ZADD NX`) and gets their current position back.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::DependencyUnavailable`] on Redis failure and
    /// [`DomainError::Internal`] if token signing fails.
    pub async fn join(
        &self,
        event_id: EventId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<QueuePosition, DomainError> {
        let queue_key = keys::queue(event_id);
        let member = user_id.to_string();
        let score = now.timestamp_millis();
        let mut conn = self.conn.clone();

        // NX keeps the original join time on replayed joins, so position
        // is stable and simultaneous joins cannot collide.
        let (_added, rank, total): (i64, Option<i64>, u64) = redis::pipe()
            .cmd("ZADD")
            .arg(&queue_key)
            .arg("NX")
            .arg(score)
            .arg(&member)
            .zrank(&queue_key, &member)
            .zcard(&queue_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| crate::dependency_error("queue join failed", &e))?;

        let position = rank.map_or(1, |r| u64::try_from(r).unwrap_or(0) + 1);
        let token = self.sign_token(event_id, user_id, now)?;

        metrics::counter!("queue.joined").increment(1);
        tracing::debug!(event_id = %event_id, user_id = %user_id, position, "queue joined");

        Ok(QueuePosition {
            position,
            total_in_queue: total,
            estimated_wait_seconds: Self::estimate_wait(self.config.throughput_estimate, position),
            token,
        })
    }

    /// Current queue status for a user.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::DependencyUnavailable`] on Redis failure.
    pub async fn status(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<QueueStatus, DomainError> {
        let queue_key = keys::queue(event_id);
        let pass_key = keys::queue_pass(event_id, user_id);
        let member = user_id.to_string();
        let mut conn = self.conn.clone();

        let (rank, total, has_pass): (Option<i64>, u64, bool) = redis::pipe()
            .zrank(&queue_key, &member)
            .zcard(&queue_key)
            .exists(&pass_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| crate::dependency_error("queue status failed", &e))?;

        Ok(QueueStatus {
            position: rank.map(|r| u64::try_from(r).unwrap_or(0) + 1),
            is_open: has_pass,
            total_in_queue: total,
        })
    }

    /// One release tick: admit users from the head of the queue until the
    /// active-pass cap is reached.
    ///
    /// Pass creation is retried [`PASS_CREATE_ATTEMPTS`] times per user;
    /// a user whose pass cannot be written is put back at their original
    /// score and picked up again next tick.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::DependencyUnavailable`] if the tick cannot
    /// read queue state at all (individual pass failures are absorbed).
    pub async fn release_batch(
        &self,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> Result<ReleaseReport, DomainError> {
        let queue_key = keys::queue(event_id);
        let active_key = keys::queue_pass_active(event_id);
        let now_ms = now.timestamp_millis();
        let mut conn = self.conn.clone();

        // Drop passes whose TTL has lapsed from the active set, then see
        // how many slots this tick may fill.
        let (_purged, active): (u64, u64) = redis::pipe()
            .cmd("ZREMRANGEBYSCORE")
            .arg(&active_key)
            .arg("-inf")
            .arg(now_ms)
            .zcard(&active_key)
            .query_async(&mut conn)
            .await
            .map_err(|e| crate::dependency_error("queue release purge failed", &e))?;

        let capacity = u64::from(self.config.max_concurrent).saturating_sub(active);
        if capacity == 0 {
            return Ok(ReleaseReport {
                released: 0,
                active_passes: u32::try_from(active).unwrap_or(u32::MAX),
                requeued: 0,
            });
        }

        let popped: Vec<(String, f64)> = conn
            .zpopmin(&queue_key, isize::try_from(capacity).unwrap_or(isize::MAX))
            .await
            .map_err(|e| crate::dependency_error("queue release pop failed", &e))?;

        let mut report = ReleaseReport {
            released: 0,
            active_passes: u32::try_from(active).unwrap_or(u32::MAX),
            requeued: 0,
        };

        #[allow(clippy::cast_possible_truncation)] // Pass TTLs are seconds-scale
        let pass_ttl_secs = self.config.pass_ttl.as_secs() as i64;
        let pass_expiry_ms = now_ms + pass_ttl_secs * 1000;

        for (member, score) in popped {
            let Ok(user_id) = member.parse::<UserId>() else {
                tracing::warn!(event_id = %event_id, member = %member, "dropping malformed queue member");
                continue;
            };

            if self
                .issue_pass(event_id, user_id, pass_expiry_ms)
                .await
            {
                report.released += 1;
                report.active_passes += 1;
            } else {
                // Keep the user's place: re-add with the original score.
                let _: Result<i64, _> = self
                    .conn
                    .clone()
                    .zadd(&queue_key, &member, score)
                    .await
                    .map_err(|e| {
                        tracing::error!(
                            event_id = %event_id,
                            user_id = %user_id,
                            error = %e,
                            "failed to requeue user after pass failure"
                        );
                        e
                    });
                report.requeued += 1;
            }
        }

        if report.released > 0 {
            metrics::counter!("queue.passes_issued").increment(u64::from(report.released));
            tracing::info!(
                event_id = %event_id,
                released = report.released,
                active = report.active_passes,
                requeued = report.requeued,
                "queue release tick"
            );
        }

        Ok(report)
    }

    /// Consume a pass: deletes the grant so it cannot be reused.
    ///
    /// Returns `true` if an active pass existed.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::DependencyUnavailable`] on Redis failure.
    pub async fn consume_pass(
        &self,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<bool, DomainError> {
        let pass_key = keys::queue_pass(event_id, user_id);
        let active_key = keys::queue_pass_active(event_id);
        let mut conn = self.conn.clone();

        let (existed, _removed): (Option<String>, u64) = redis::pipe()
            .cmd("GETDEL")
            .arg(&pass_key)
            .zrem(&active_key, user_id.to_string())
            .query_async(&mut conn)
            .await
            .map_err(|e| crate::dependency_error("queue pass consume failed", &e))?;

        Ok(existed.is_some())
    }

    /// Verify a queue token's signature and claims.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::Forbidden`] for a token that does not match
    /// the caller or the event, or fails validation.
    pub fn verify_token(
        &self,
        token: &str,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<QueuePassClaims, DomainError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;

        let claims = jsonwebtoken::decode::<QueuePassClaims>(token, &self.decoding_key, &validation)
            .map_err(|_| DomainError::Forbidden)?
            .claims;

        if claims.sub != user_id || claims.event_id != event_id {
            return Err(DomainError::Forbidden);
        }

        Ok(claims)
    }

    /// Events with a non-empty waiting room, for the release ticker.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::DependencyUnavailable`] on Redis failure.
    pub async fn active_events(&self) -> Result<Vec<EventId>, DomainError> {
        let mut conn = self.conn.clone();
        let mut cursor = 0u64;
        let mut events = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg("{*}:queue")
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| crate::dependency_error("queue scan failed", &e))?;

            for key in batch {
                if let Some(event) = Self::event_of_queue_key(&key) {
                    events.push(event);
                }
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(events)
    }

    async fn issue_pass(&self, event_id: EventId, user_id: UserId, expiry_ms: i64) -> bool {
        let pass_key = keys::queue_pass(event_id, user_id);
        let active_key = keys::queue_pass_active(event_id);
        #[allow(clippy::cast_possible_truncation)]
        let ttl_secs = self.config.pass_ttl.as_secs() as i64;

        for attempt in 0..PASS_CREATE_ATTEMPTS {
            let mut conn = self.conn.clone();
            let result: Result<((), i64), _> = redis::pipe()
                .set_ex(&pass_key, Ulid::new().to_string(), u64::try_from(ttl_secs).unwrap_or(300))
                .zadd(&active_key, user_id.to_string(), expiry_ms)
                .query_async(&mut conn)
                .await;

            match result {
                Ok(_) => return true,
                Err(e) => {
                    tracing::warn!(
                        event_id = %event_id,
                        user_id = %user_id,
                        attempt,
                        error = %e,
                        "queue pass creation failed"
                    );
                }
            }
        }

        false
    }

    fn sign_token(
        &self,
        event_id: EventId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<String, DomainError> {
        let claims = QueuePassClaims {
            sub: user_id,
            event_id,
            pass_id: Ulid::new().to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + QUEUE_TOKEN_LIFETIME_SECS,
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| DomainError::Internal(format!("failed to sign queue token: {e}")))
    }

    fn estimate_wait(throughput_estimate: f64, position: u64) -> u64 {
        if throughput_estimate <= 0.0 {
            return 0;
        }
        #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let wait = (position as f64 / throughput_estimate).ceil() as u64;
        wait
    }

    fn event_of_queue_key(key: &str) -> Option<EventId> {
        let inner = key.strip_prefix('{')?.split('}').next()?;
        inner.parse().ok()
    }
}

impl AdmissionQueue for QueueAdmission {
    fn join(
        &self,
        event_id: EventId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, QueuePosition> {
        Box::pin(async move { Self::join(self, event_id, user_id, now).await })
    }

    fn status(&self, event_id: EventId, user_id: UserId) -> RepoFuture<'_, QueueStatus> {
        Box::pin(async move { Self::status(self, event_id, user_id).await })
    }

    fn release_batch(
        &self,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> RepoFuture<'_, ReleaseReport> {
        Box::pin(async move { Self::release_batch(self, event_id, now).await })
    }

    fn consume_pass(&self, event_id: EventId, user_id: UserId) -> RepoFuture<'_, bool> {
        Box::pin(async move { Self::consume_pass(self, event_id, user_id).await })
    }

    fn verify_token(
        &self,
        token: &str,
        event_id: EventId,
        user_id: UserId,
    ) -> Result<(), DomainError> {
        Self::verify_token(self, token, event_id, user_id).map(|_| ())
    }

    fn active_events(&self) -> RepoFuture<'_, Vec<EventId>> {
        Box::pin(async move { Self::active_events(self).await })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn event_parses_out_of_queue_key() {
        let event = EventId::new();
        let key = keys::queue(event);
        assert_eq!(QueueAdmission::event_of_queue_key(&key), Some(event));
        assert_eq!(QueueAdmission::event_of_queue_key("plain:queue"), None);
    }

    #[test]
    fn wait_estimate_rounds_up() {
        assert_eq!(QueueAdmission::estimate_wait(50.0, 1), 1);
        assert_eq!(QueueAdmission::estimate_wait(50.0, 50), 1);
        assert_eq!(QueueAdmission::estimate_wait(50.0, 51), 2);
        assert_eq!(QueueAdmission::estimate_wait(50.0, 1000), 20);
        assert_eq!(QueueAdmission::estimate_wait(0.0, 1000), 0);
    }

    #[test]
    fn token_round_trips_and_rejects_mismatches() {
        // QueueAdmission needs a connection for construction, but signing
        // and verification are pure; build the keys directly instead.
        let secret = b"test-secret";
        let encoding = EncodingKey::from_secret(secret);
        let decoding = DecodingKey::from_secret(secret);

        let user = UserId::new();
        let event = EventId::new();
        let now = Utc::now();
        let claims = QueuePassClaims {
            sub: user,
            event_id: event,
            pass_id: Ulid::new().to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + 3600,
        };
        let token =
            jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &encoding).unwrap();

        let decoded = jsonwebtoken::decode::<QueuePassClaims>(
            &token,
            &decoding,
            &Validation::new(Algorithm::HS256),
        )
        .unwrap()
        .claims;
        assert_eq!(decoded.sub, user);
        assert_eq!(decoded.event_id, event);

        // Tampered secret must fail
        let wrong = DecodingKey::from_secret(b"other-secret");
        assert!(
            jsonwebtoken::decode::<QueuePassClaims>(
                &token,
                &wrong,
                &Validation::new(Algorithm::HS256)
            )
            .is_err()
        );
    }
}
