//! Per-key admission control.
//!
//! This module provides token-bucket rate limiting keyed by API key or client
//! IP, via the governor crate's keyed GCRA limiter. GCRA is an exact
//! token bucket: capacity is the configured burst and the bucket refills at
//! `requests_per_minute / 60` tokens per second. Bucket state lives in a
//! sharded `DashMap`, so concurrent requests for different keys never
//! contend and updates for one key are linearizable.

use axum::http::{request::Parts, HeaderMap};
use governor::{
    clock::{Clock, DefaultClock},
    middleware::StateInformationMiddleware,
    state::keyed::DefaultKeyedStateStore,
    Quota, RateLimiter as GovernorRateLimiter,
};
use nonzero_ext::nonzero;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::time::Duration;

use crate::api::auth::{extract_api_key, hash_key};
use crate::core::config::RateLimitConfig;
use crate::core::error::AppError;
use crate::core::logging::redact;

/// Type alias for the keyed limiter instance
type KeyedLimiter = GovernorRateLimiter<
    String,
    DefaultKeyedStateStore<String>,
    DefaultClock,
    StateInformationMiddleware,
>;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Bucket capacity
    pub limit: u32,
    /// Whole tokens left after this check
    pub remaining: u32,
    /// Time until enough tokens accrue; zero when allowed
    pub retry_after: Duration,
}

/// Rate limiter holding one bucket per key.
pub struct RateLimiter {
    limiter: KeyedLimiter,
    clock: DefaultClock,
    quota: Quota,
}

impl RateLimiter {
    /// Create a rate limiter from configuration.
    ///
    /// Zero values fall back to 60 requests per minute and a burst of 10.
    pub fn new(config: &RateLimitConfig) -> Self {
        let quota = Quota::per_minute(
            NonZeroU32::new(config.requests_per_minute).unwrap_or(nonzero!(60u32)),
        )
        .allow_burst(NonZeroU32::new(config.burst).unwrap_or(nonzero!(10u32)));

        Self {
            limiter: GovernorRateLimiter::keyed(quota)
                .with_middleware::<StateInformationMiddleware>(),
            clock: DefaultClock::default(),
            quota,
        }
    }

    /// Bucket capacity.
    pub fn limit(&self) -> u32 {
        self.quota.burst_size().get()
    }

    /// Check a single-token request for `key`.
    pub fn allow(&self, key: &str) -> RateLimitDecision {
        self.allow_n(key, 1)
    }

    /// Check a request costing `cost` tokens for `key`.
    ///
    /// Buckets are created lazily on first use. A zero cost is always
    /// admitted without touching the bucket, and reports full capacity as
    /// remaining. A cost above capacity can never be admitted and is denied
    /// with the time a full bucket takes to refill.
    pub fn allow_n(&self, key: &str, cost: u32) -> RateLimitDecision {
        let limit = self.limit();
        let Some(cost) = NonZeroU32::new(cost) else {
            return RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit,
                retry_after: Duration::ZERO,
            };
        };

        match self.limiter.check_key_n(&key.to_string(), cost) {
            Ok(Ok(snapshot)) => RateLimitDecision {
                allowed: true,
                limit,
                remaining: snapshot.remaining_burst_capacity(),
                retry_after: Duration::ZERO,
            },
            Ok(Err(not_until)) => RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                retry_after: not_until.wait_time_from(self.clock.now()),
            },
            Err(_insufficient) => RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                retry_after: self.quota.replenish_interval() * limit,
            },
        }
    }

    /// Check a request for `key`, mapping a denial to [`AppError::RateLimitExceeded`].
    pub fn check_rate_limit(&self, key: &str) -> Result<RateLimitDecision, AppError> {
        let decision = self.allow(key);
        if decision.allowed {
            Ok(decision)
        } else {
            tracing::warn!(
                key_prefix = redact(key),
                retry_after_ms = decision.retry_after.as_millis() as u64,
                "Rate limit exceeded"
            );
            Err(AppError::RateLimitExceeded {
                limit: decision.limit,
                retry_after: decision.retry_after,
            })
        }
    }

    /// Drop buckets that have refilled completely; they are
    /// indistinguishable from fresh ones. Returns how many were evicted.
    pub fn evict_idle(&self) -> usize {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        before.saturating_sub(self.limiter.len())
    }

    /// Number of keys currently holding a bucket.
    pub fn tracked_keys(&self) -> usize {
        self.limiter.len()
    }
}

/// Derive the rate-limit identity for a request.
///
/// Hashed API key when one is presented, otherwise the client IP
/// (`X-Forwarded-For` first hop, `X-Real-IP`, then the socket peer).
pub fn rate_limit_key(parts: &Parts) -> String {
    if let Some(api_key) = extract_api_key(&parts.headers) {
        return format!("key:{}", hash_key(api_key));
    }

    let peer = parts
        .extensions
        .get::<axum::extract::ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    match client_ip(&parts.headers, peer) {
        Some(ip) => format!("ip:{}", ip),
        None => "anonymous".to_string(),
    }
}

fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn limiter(rpm: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            enabled: true,
            requests_per_minute: rpm,
            burst,
        })
    }

    #[test]
    fn test_rate_limiter_allows_within_burst() {
        let limiter = limiter(60, 10);
        for i in 0..10 {
            let decision = limiter.allow("test-key");
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 9 - i);
        }
    }

    #[test]
    fn test_rate_limiter_blocks_over_burst() {
        let limiter = limiter(60, 5);
        for _ in 0..5 {
            assert!(limiter.allow("test-key").allowed);
        }

        let denied = limiter.allow("test-key");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after > Duration::ZERO);
        assert!(denied.retry_after <= Duration::from_secs(1));
    }

    #[test]
    fn test_multiple_keys_independent_limits() {
        let limiter = limiter(60, 2);
        assert!(limiter.allow("key1").allowed);
        assert!(limiter.allow("key1").allowed);
        assert!(!limiter.allow("key1").allowed);

        assert!(limiter.allow("key2").allowed);
        assert!(limiter.allow("key2").allowed);
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_zero_cost_always_allowed() {
        let limiter = limiter(60, 1);
        assert!(limiter.allow("k").allowed);
        assert!(limiter.allow_n("k", 0).allowed);
    }

    #[test]
    fn test_cost_above_capacity_denied() {
        let limiter = limiter(60, 3);
        let decision = limiter.allow_n("k", 4);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after, Duration::from_secs(3));
        // Nothing was consumed
        assert!(limiter.allow_n("k", 3).allowed);
    }

    #[test]
    fn test_check_rate_limit_maps_to_error() {
        let limiter = limiter(60, 1);
        assert!(limiter.check_rate_limit("k").is_ok());
        match limiter.check_rate_limit("k") {
            Err(AppError::RateLimitExceeded { limit, retry_after }) => {
                assert_eq!(limit, 1);
                assert!(retry_after > Duration::ZERO);
            }
            other => panic!("expected rate limit error, got {:?}", other),
        }
    }

    #[test]
    fn test_refill_after_retry_after() {
        // 6000 rpm refills one token every 10ms
        let limiter = limiter(6000, 1);
        assert!(limiter.allow("k").allowed);
        let denied = limiter.allow("k");
        assert!(!denied.allowed);

        std::thread::sleep(denied.retry_after + Duration::from_millis(2));
        assert!(limiter.allow("k").allowed);
    }

    #[test]
    fn test_evict_idle_drops_refilled_buckets() {
        let limiter = limiter(60000, 1);
        assert!(limiter.allow("a").allowed);
        assert!(limiter.allow("b").allowed);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(limiter.evict_idle(), 2);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn test_rate_limit_key_prefers_api_key() {
        let (parts, _) = Request::builder()
            .header("authorization", "Bearer sk-123")
            .header("x-forwarded-for", "10.0.0.1")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(rate_limit_key(&parts), format!("key:{}", hash_key("sk-123")));
    }

    #[test]
    fn test_rate_limit_key_uses_forwarded_ip() {
        let (parts, _) = Request::builder()
            .header("x-forwarded-for", "203.0.113.7, 10.0.0.1")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(rate_limit_key(&parts), "ip:203.0.113.7");
    }

    #[test]
    fn test_rate_limit_key_uses_peer_address() {
        let (mut parts, _) = Request::builder().body(()).unwrap().into_parts();
        parts.extensions.insert(axum::extract::ConnectInfo(
            "192.0.2.10:5555".parse::<SocketAddr>().unwrap(),
        ));
        assert_eq!(rate_limit_key(&parts), "ip:192.0.2.10");
    }

    #[test]
    fn test_rate_limit_key_anonymous() {
        let (parts, _) = Request::builder().body(()).unwrap().into_parts();
        assert_eq!(rate_limit_key(&parts), "anonymous");
    }
}
