//! Distributed token-bucket rate limiting.
//!
//! One Lua script per check keeps refill-compare-consume atomic across
//! every ingress replica: `HMGET tokens,last_update → refill → compare →
//! HMSET + EXPIRE 60`. Bucket state idles out of Redis after a minute
//! without traffic.
//!
//! The engine itself reports failures; the *policy* (fail open at the
//! ingress, record the fault on the span) lives with the middleware that
//! calls it.

use crate::keys;
use crate::retry::{RetryPolicy, retry_with_backoff};
use chrono::{DateTime, Utc};
use redis::Script;
use redis::aio::ConnectionManager;
use rushtix_core::DomainError;
use std::time::Duration;

const TOKEN_BUCKET_LUA: &str = r"
local rate = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local cost = tonumber(ARGV[4])
local state = redis.call('HMGET', KEYS[1], 'tokens', 'last_update')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
    tokens = burst
    last = now_ms
end
local elapsed = math.max(0, now_ms - last) / 1000.0
tokens = math.min(burst, tokens + elapsed * rate)
local allowed = 0
if tokens >= cost then
    tokens = tokens - cost
    allowed = 1
end
redis.call('HMSET', KEYS[1], 'tokens', tokens, 'last_update', now_ms)
redis.call('EXPIRE', KEYS[1], 60)
return {allowed, tostring(tokens)}
";

/// Outcome of one rate-limit check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RateLimitDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Whole tokens left in the bucket
    pub remaining: u32,
    /// Steady-state tokens per second (`X-RateLimit-Limit`)
    pub limit: u32,
    /// Bucket capacity (`X-RateLimit-Burst`)
    pub burst: u32,
    /// Seconds until the bucket refills completely (`X-RateLimit-Reset`)
    pub reset_after: Duration,
    /// Wait before retrying, present on rejection (`Retry-After`)
    pub retry_after: Option<Duration>,
}

/// Redis-backed token bucket shared by every ingress replica.
#[derive(Clone)]
pub struct DistributedRateLimiter {
    conn: ConnectionManager,
    script: Script,
    policy: RetryPolicy,
}

impl DistributedRateLimiter {
    /// Create a limiter over the shared connection manager.
    #[must_use]
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            script: Script::new(TOKEN_BUCKET_LUA),
            policy: RetryPolicy::default(),
        }
    }

    /// Take one token from the `{client, rule}` bucket.
    ///
    /// # Errors
    ///
    /// Returns [`DomainError::DependencyUnavailable`] once retries are
    /// exhausted; the caller decides whether that fails open.
    pub async fn check(
        &self,
        client: &str,
        rule: &str,
        rate_per_sec: f64,
        burst: u32,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, DomainError> {
        let key = keys::rate_limit(client, rule);
        let now_ms = now.timestamp_millis();

        let reply: (i64, String) = retry_with_backoff(&self.policy, || {
            let mut conn = self.conn.clone();
            let mut invocation = self.script.prepare_invoke();
            invocation
                .key(&key)
                .arg(rate_per_sec)
                .arg(burst)
                .arg(now_ms)
                .arg(1);
            async move { invocation.invoke_async(&mut conn).await }
        })
        .await
        .map_err(|e| crate::dependency_error("rate limit script failed", &e))?;

        let allowed = reply.0 == 1;
        let tokens: f64 = reply.1.parse().unwrap_or(0.0);

        if !allowed {
            metrics::counter!("rate_limit.rejected", "rule" => rule.to_string()).increment(1);
        }

        Ok(Self::decision(allowed, tokens, rate_per_sec, burst))
    }

    fn decision(allowed: bool, tokens: f64, rate_per_sec: f64, burst: u32) -> RateLimitDecision {
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let remaining = tokens.max(0.0).floor() as u32;

        let reset_after = if rate_per_sec > 0.0 {
            Duration::from_secs_f64((f64::from(burst) - tokens).max(0.0) / rate_per_sec)
        } else {
            Duration::ZERO
        };

        let retry_after = if allowed || rate_per_sec <= 0.0 {
            None
        } else {
            // Seconds until one whole token is available again.
            Some(Duration::from_secs_f64(
                ((1.0 - tokens).max(0.0) / rate_per_sec).max(1.0),
            ))
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let limit = rate_per_sec.ceil() as u32;

        RateLimitDecision {
            allowed,
            remaining,
            limit,
            burst,
            reset_after,
            retry_after,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn allowed_decision_has_no_retry_hint() {
        let d = DistributedRateLimiter::decision(true, 5.0, 10.0, 20);
        assert!(d.allowed);
        assert_eq!(d.remaining, 5);
        assert_eq!(d.limit, 10);
        assert_eq!(d.burst, 20);
        assert!(d.retry_after.is_none());
    }

    #[test]
    fn rejected_decision_computes_retry_after_from_refill() {
        let d = DistributedRateLimiter::decision(false, 0.2, 2.0, 5);
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        let retry = d.retry_after.unwrap();
        // (1 - 0.2) / 2 = 0.4s, floored to the 1s minimum
        assert_eq!(retry, Duration::from_secs(1));
    }

    #[test]
    fn reset_measures_time_to_full_bucket() {
        let d = DistributedRateLimiter::decision(true, 10.0, 5.0, 20);
        // (20 - 10) / 5 = 2s to refill
        assert_eq!(d.reset_after, Duration::from_secs(2));
    }

    #[test]
    fn bucket_script_expires_state() {
        assert!(TOKEN_BUCKET_LUA.contains("'EXPIRE', KEYS[1], 60"));
    }
}
