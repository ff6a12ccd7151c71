//! Token-bucket rate limiting.
//!
//! One bucket per `{client_ip, endpoint_rule}`. Rules match on a path
//! pattern (`*` one segment, `**` the remainder, `:param` one segment)
//! plus methods; first match wins, with a default rule behind them.
//!
//! Two backends share the decision shape:
//!
//! - **Local**: a concurrent map of buckets in this process, swept of
//!   idle entries on an interval
//! - **Distributed**: the atomic Lua script in `rushtix-redis`, shared by
//!   every ingress replica
//!
//! Backend failure fails **open**: a throttling outage must not take the
//! sale down. The fault is recorded on the request span.

use crate::error::ApiError;
use crate::extractors::client_ip;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::{HeaderValue, Method};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use rushtix_core::DomainError;
use rushtix_redis::{DistributedRateLimiter, RateLimitDecision};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use std::sync::Arc;
use tokio::sync::{RwLock, watch};

/// One endpoint rule.
#[derive(Clone, Debug)]
pub struct RateLimitRule {
    /// Rule name (bucket key component and metric label)
    pub name: String,
    /// Path pattern: literal segments, `*`, `**` (tail) or `:param`
    pub pattern: String,
    /// Methods the rule covers; empty covers all
    pub methods: Vec<Method>,
    /// Steady-state tokens per second
    pub requests_per_second: f64,
    /// Bucket capacity
    pub burst: u32,
}

impl RateLimitRule {
    /// Whether this rule covers `{method, path}`.
    #[must_use]
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        if !self.methods.is_empty() && !self.methods.contains(method) {
            return false;
        }
        pattern_matches(&self.pattern, path)
    }
}

/// Match a path against a pattern.
///
/// `*` and `:param` match exactly one segment; `**` matches the rest of
/// the path (and also zero segments).
#[must_use]
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    let mut pattern_segments = pattern.trim_matches('/').split('/');
    let mut path_segments = path.trim_matches('/').split('/').peekable();

    loop {
        match pattern_segments.next() {
            None => return path_segments.peek().is_none(),
            Some("**") => return true,
            Some(expected) => {
                let Some(actual) = path_segments.next() else {
                    return false;
                };
                let wildcard = expected == "*" || expected.starts_with(':');
                if !wildcard && expected != actual {
                    return false;
                }
            }
        }
    }
}

/// Local token bucket state for one `{client, rule}` pair.
struct Bucket {
    tokens: f64,
    last_update: Instant,
    last_seen: Instant,
}

/// Per-process bucket map.
pub struct LocalRateLimiter {
    buckets: RwLock<HashMap<String, Bucket>>,
    /// Idle entries older than this are dropped by the sweeper
    pub entry_ttl: Duration,
    /// Sweep cadence
    pub cleanup_interval: Duration,
}

impl Default for LocalRateLimiter {
    fn default() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            entry_ttl: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl LocalRateLimiter {
    /// Take one token from the `{client, rule}` bucket.
    pub async fn check(
        &self,
        client: &str,
        rule: &str,
        rate_per_sec: f64,
        burst: u32,
    ) -> RateLimitDecision {
        let key = format!("{rule}:{client}");
        let now = Instant::now();
        let mut buckets = self.buckets.write().await;

        let bucket = buckets.entry(key).or_insert_with(|| Bucket {
            tokens: f64::from(burst),
            last_update: now,
            last_seen: now,
        });

        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate_per_sec).min(f64::from(burst));
        bucket.last_update = now;
        bucket.last_seen = now;

        let allowed = bucket.tokens >= 1.0;
        if allowed {
            bucket.tokens -= 1.0;
        }
        let tokens = bucket.tokens;
        drop(buckets);

        decision(allowed, tokens, rate_per_sec, burst)
    }

    /// Drop buckets idle for longer than [`Self::entry_ttl`].
    pub async fn sweep(&self) -> usize {
        let cutoff = Instant::now();
        let mut buckets = self.buckets.write().await;
        let before = buckets.len();
        buckets.retain(|_, b| cutoff.duration_since(b.last_seen) < self.entry_ttl);
        before - buckets.len()
    }

    /// Sweeper loop. Returns when `shutdown` flips to `true`.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                () = tokio::time::sleep(self.cleanup_interval) => {
                    let dropped = self.sweep().await;
                    if dropped > 0 {
                        tracing::debug!(dropped, "rate limit buckets swept");
                    }
                }
            }
        }
    }
}

/// Mirror of the Lua script's refill/compare/consume math for the local
/// backend, producing the same decision shape.
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

/// Which backend holds the buckets.
pub enum RateLimiterBackend {
    /// This process only
    Local(Arc<LocalRateLimiter>),
    /// Shared across replicas via Redis
    Distributed(DistributedRateLimiter),
}

/// Rules plus backend: the complete ingress limiter.
pub struct IngressLimiter {
    rules: Vec<RateLimitRule>,
    default_rule: RateLimitRule,
    backend: RateLimiterBackend,
}

impl IngressLimiter {
    /// Create a limiter.
    #[must_use]
    pub const fn new(
        rules: Vec<RateLimitRule>,
        default_rule: RateLimitRule,
        backend: RateLimiterBackend,
    ) -> Self {
        Self {
            rules,
            default_rule,
            backend,
        }
    }

    /// First matching rule, or the default.
    #[must_use]
    pub fn match_rule(&self, method: &Method, path: &str) -> &RateLimitRule {
        self.rules
            .iter()
            .find(|r| r.matches(method, path))
            .unwrap_or(&self.default_rule)
    }

    /// Run the bucket check for one request.
    ///
    /// # Errors
    ///
    /// Propagates backend failures; the middleware fails open on them.
    pub async fn check(
        &self,
        client: &str,
        method: &Method,
        path: &str,
        now: DateTime<Utc>,
    ) -> Result<RateLimitDecision, DomainError> {
        let rule = self.match_rule(method, path);
        match &self.backend {
            RateLimiterBackend::Local(local) => Ok(local
                .check(client, &rule.name, rule.requests_per_second, rule.burst)
                .await),
            RateLimiterBackend::Distributed(distributed) => {
                distributed
                    .check(client, &rule.name, rule.requests_per_second, rule.burst, now)
                    .await
            }
        }
    }
}

/// The rate-limit middleware.
pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let client = client_ip(request.headers()).to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let now = state.clock.now();

    match state.limiter.check(&client, &method, &path, now).await {
        Ok(decision) if decision.allowed => {
            let mut response = next.run(request).await;
            apply_headers(&mut response, &decision);
            response
        }
        Ok(decision) => {
            tracing::debug!(client = %client, path = %path, "request rate limited");
            let mut response = ApiError::too_many_requests().into_response();
            apply_headers(&mut response, &decision);
            response
        }
        Err(e) => {
            // Fail open: a throttling outage must not stop the sale.
            tracing::warn!(error = %e, rate_limit_degraded = true, "rate limiter unavailable, failing open");
            metrics::counter!("rate_limit.fail_open").increment(1);
            next.run(request).await
        }
    }
}

fn apply_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    let mut set = |name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };

    set("X-RateLimit-Limit", decision.limit.to_string());
    set("X-RateLimit-Remaining", decision.remaining.to_string());
    set("X-RateLimit-Reset", decision.reset_after.as_secs().to_string());
    set("X-RateLimit-Burst", decision.burst.to_string());
    if let Some(retry) = decision.retry_after {
        set("Retry-After", retry.as_secs().max(1).to_string());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn pattern_segments() {
        assert!(pattern_matches("/api/v1/bookings", "/api/v1/bookings"));
        assert!(pattern_matches("/api/v1/bookings/*", "/api/v1/bookings/123"));
        assert!(!pattern_matches("/api/v1/bookings/*", "/api/v1/bookings/123/confirm"));
        assert!(pattern_matches("/api/v1/bookings/:id/confirm", "/api/v1/bookings/123/confirm"));
        assert!(pattern_matches("/api/v1/**", "/api/v1/bookings/123/confirm"));
        assert!(pattern_matches("/api/v1/**", "/api/v1"));
        assert!(!pattern_matches("/api/v1/queue/join", "/api/v1/bookings"));
    }

    #[test]
    fn first_match_wins() {
        let limiter = IngressLimiter::new(
            vec![
                RateLimitRule {
                    name: "bookings".to_string(),
                    pattern: "/api/v1/bookings/**".to_string(),
                    methods: vec![Method::POST],
                    requests_per_second: 2.0,
                    burst: 5,
                },
                RateLimitRule {
                    name: "api".to_string(),
                    pattern: "/api/**".to_string(),
                    methods: vec![],
                    requests_per_second: 10.0,
                    burst: 20,
                },
            ],
            default_rule(),
            RateLimiterBackend::Local(Arc::new(LocalRateLimiter::default())),
        );

        assert_eq!(
            limiter.match_rule(&Method::POST, "/api/v1/bookings").name,
            "bookings"
        );
        // GET is not covered by the bookings rule
        assert_eq!(
            limiter.match_rule(&Method::GET, "/api/v1/bookings/123").name,
            "api"
        );
        assert_eq!(limiter.match_rule(&Method::GET, "/healthz").name, "default");
    }

    #[tokio::test]
    async fn local_bucket_enforces_rps_plus_burst() {
        let limiter = LocalRateLimiter::default();

        // rate 0 tokens/s, burst 3: exactly 3 requests pass.
        for _ in 0..3 {
            assert!(limiter.check("1.2.3.4", "test", 0.0, 3).await.allowed);
        }
        let denied = limiter.check("1.2.3.4", "test", 0.0, 3).await;
        assert!(!denied.allowed);

        // Another client has its own bucket.
        assert!(limiter.check("5.6.7.8", "test", 0.0, 3).await.allowed);
    }

    #[tokio::test]
    async fn sweep_drops_idle_buckets() {
        let limiter = LocalRateLimiter {
            entry_ttl: Duration::ZERO,
            ..LocalRateLimiter::default()
        };
        let _ = limiter.check("1.2.3.4", "test", 1.0, 1).await;
        assert_eq!(limiter.sweep().await, 1);
    }

    fn default_rule() -> RateLimitRule {
        RateLimitRule {
            name: "default".to_string(),
            pattern: "/**".to_string(),
            methods: vec![],
            requests_per_second: 100.0,
            burst: 200,
        }
    }
}
