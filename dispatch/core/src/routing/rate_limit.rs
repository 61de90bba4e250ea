//! Provider Rate Limiting
//!
//! Per-provider token buckets bounding the request rate to each backend.
//!
//! # Design
//!
//! - Each provider has a bucket whose capacity is its requests-per-minute limit
//! - Tokens refill continuously at `limit / 60` per second, capped at capacity
//! - Every admitted request consumes one token
//! - Waiters sleep until the next token is due (at most one second at a time)
//!   and re-check; there is no queue, so the first waiter to observe a token
//!   wins
//!
//! Buckets are created lazily for providers without an explicit limit, using
//! the default limit.

use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::time::Instant;

use super::config::RateLimitSettings;

/// Longest single sleep while waiting for a token
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(1000);

// ============================================================================
// Errors and Status
// ============================================================================

/// No token became available within the caller's timeout
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("Timed out after {timeout_ms}ms waiting for a request token from {provider}")]
pub struct RateLimitTimeout {
    pub provider: String,
    pub timeout_ms: u64,
}

/// Point-in-time view of a provider's bucket
#[derive(Clone, Debug, PartialEq)]
pub struct RateLimitStatus {
    /// Whole tokens available right now
    pub available: u32,
    /// Bucket capacity (requests per minute)
    pub limit: u32,
    /// Fill level, 0.0 - 100.0
    pub percentage: f64,
}

// ============================================================================
// Token Bucket
// ============================================================================

/// A refilling token bucket
///
/// The level always stays within `[0, capacity]`.
#[derive(Clone, Debug)]
pub struct TokenBucket {
    capacity: u32,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket
    pub fn new(capacity: u32, now: Instant) -> Self {
        Self {
            capacity,
            tokens: f64::from(capacity),
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    fn rate_per_second(&self) -> f64 {
        f64::from(self.capacity) / 60.0
    }

    /// Add tokens for the time elapsed since the last refill
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let refilled = self.tokens + elapsed * self.rate_per_second();
        self.tokens = refilled.clamp(0.0, f64::from(self.capacity));
        self.last_refill = now;
    }

    /// Refill, then take one token if available
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one whole token is available, as of the last refill
    pub fn time_until_token(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let rate = self.rate_per_second();
        if rate <= 0.0 {
            return MAX_POLL_INTERVAL;
        }
        let millis = ((1.0 - self.tokens) / rate * 1000.0).ceil();
        Duration::from_millis(millis as u64)
    }

    /// Change capacity, keeping the current level within the new bound
    pub fn set_capacity(&mut self, capacity: u32, now: Instant) {
        self.refill(now);
        self.capacity = capacity;
        self.tokens = self.tokens.min(f64::from(capacity));
    }

    /// Refill to capacity
    pub fn reset(&mut self, now: Instant) {
        self.tokens = f64::from(self.capacity);
        self.last_refill = now;
    }

    fn status(&self) -> RateLimitStatus {
        let percentage = if self.capacity == 0 {
            0.0
        } else {
            self.tokens / f64::from(self.capacity) * 100.0
        };
        RateLimitStatus {
            available: self.tokens.floor() as u32,
            limit: self.capacity,
            percentage,
        }
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Per-provider request rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    /// Configured limits (requests per minute) by provider
    limits: RwLock<HashMap<String, u32>>,
    default_limit: RwLock<u32>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(&RateLimitSettings::default())
    }
}

impl RateLimiter {
    /// Create a limiter with a bucket for every configured provider
    pub fn new(settings: &RateLimitSettings) -> Self {
        let limiter = Self {
            buckets: DashMap::new(),
            limits: RwLock::new(HashMap::new()),
            default_limit: RwLock::new(settings.default_requests_per_minute),
        };
        limiter.apply_settings(settings);
        limiter
    }

    /// Apply a full settings table (hot reload)
    ///
    /// Replaces every configured limit. Live buckets, including ones created
    /// from the old default, take the limit the new table gives them.
    pub fn apply_settings(&self, settings: &RateLimitSettings) {
        *self.default_limit.write() = settings.default_requests_per_minute;
        *self.limits.write() = settings.providers.clone();

        let now = Instant::now();
        for mut entry in self.buckets.iter_mut() {
            let limit = settings.limit_for(entry.key());
            entry.value_mut().set_capacity(limit, now);
        }
        for provider in settings.providers.keys() {
            self.with_bucket(provider, |_, _| ());
        }
        tracing::debug!(
            default_limit = settings.default_requests_per_minute,
            providers = settings.providers.len(),
            "Rate limits applied"
        );
    }

    fn limit_for(&self, provider: &str) -> u32 {
        self.limits
            .read()
            .get(provider)
            .copied()
            .unwrap_or(*self.default_limit.read())
    }

    fn with_bucket<R>(&self, provider: &str, f: impl FnOnce(&mut TokenBucket, Instant) -> R) -> R {
        let now = Instant::now();
        let mut bucket = self
            .buckets
            .entry(provider.to_string())
            .or_insert_with(|| TokenBucket::new(self.limit_for(provider), now));
        f(bucket.value_mut(), now)
    }

    /// Whether a request could be admitted right now
    pub fn can_proceed(&self, provider: &str) -> bool {
        self.with_bucket(provider, |bucket, now| {
            bucket.refill(now);
            bucket.tokens() >= 1.0
        })
    }

    /// Take a token if one is available
    pub fn consume_token(&self, provider: &str) -> bool {
        self.with_bucket(provider, |bucket, now| bucket.try_consume(now))
    }

    /// Wait until a token is available and consume it
    ///
    /// Consumes nothing when the wait times out.
    pub async fn wait_for_token(
        &self,
        provider: &str,
        timeout: Duration,
    ) -> Result<(), RateLimitTimeout> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait = self.with_bucket(provider, |bucket, now| {
                if bucket.try_consume(now) {
                    None
                } else {
                    Some(bucket.time_until_token())
                }
            });
            let Some(wait) = wait else {
                return Ok(());
            };

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(provider = %provider, "Rate limit wait timed out");
                return Err(RateLimitTimeout {
                    provider: provider.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }

            let sleep_for = wait
                .min(MAX_POLL_INTERVAL)
                .min(deadline - now)
                .max(Duration::from_millis(1));
            // Refill pacing
            tokio::time::sleep(sleep_for).await;
        }
    }

    /// Bucket status; a provider without a bucket reports a full one
    pub fn get_status(&self, provider: &str) -> RateLimitStatus {
        let now = Instant::now();
        match self.buckets.get_mut(provider) {
            Some(mut bucket) => {
                bucket.refill(now);
                bucket.status()
            }
            None => TokenBucket::new(self.limit_for(provider), now).status(),
        }
    }

    /// Refill a provider's bucket to capacity
    pub fn reset(&self, provider: &str) {
        self.with_bucket(provider, |bucket, now| bucket.reset(now));
    }

    /// Change a provider's limit, clamping its current level
    pub fn set_limit(&self, provider: &str, limit: u32) {
        self.limits.write().insert(provider.to_string(), limit);
        self.with_bucket(provider, |bucket, now| bucket.set_capacity(limit, now));
        tracing::debug!(provider = %provider, limit, "Rate limit updated");
    }

    /// Providers with a live bucket
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.buckets.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn limiter(provider: &str, limit: u32) -> RateLimiter {
        let mut settings = RateLimitSettings::default();
        settings.providers.insert(provider.to_string(), limit);
        RateLimiter::new(&settings)
    }

    #[tokio::test(start_paused = true)]
    async fn test_bucket_starts_full_and_drains() {
        let limiter = limiter("mcp", 3);
        for _ in 0..3 {
            assert!(limiter.can_proceed("mcp"));
            assert!(limiter.consume_token("mcp"));
        }
        assert!(!limiter.can_proceed("mcp"));
        assert!(!limiter.consume_token("mcp"));

        let status = limiter.get_status("mcp");
        assert_eq!(status.available, 0);
        assert_eq!(status.limit, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_rate() {
        // 60 rpm = one token per second
        let limiter = limiter("mcp", 60);
        for _ in 0..60 {
            assert!(limiter.consume_token("mcp"));
        }
        assert!(!limiter.consume_token("mcp"));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!limiter.can_proceed("mcp"));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.consume_token("mcp"));
        assert!(!limiter.consume_token("mcp"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_never_exceeds_capacity() {
        let limiter = limiter("mcp", 10);
        assert!(limiter.consume_token("mcp"));
        tokio::time::advance(Duration::from_secs(3600)).await;

        let status = limiter.get_status("mcp");
        assert_eq!(status.available, 10);
        assert!((status.percentage - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_token_consumes_exactly_one() {
        let limiter = limiter("mcp", 60);
        for _ in 0..60 {
            assert!(limiter.consume_token("mcp"));
        }

        let start = Instant::now();
        limiter
            .wait_for_token("mcp", Duration::from_secs(5))
            .await
            .expect("token should refill within a second");
        assert!(start.elapsed() >= Duration::from_millis(1000));
        assert!(start.elapsed() < Duration::from_millis(1100));
        assert_eq!(limiter.get_status("mcp").available, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_token_timeout_consumes_nothing() {
        // 6 rpm = one token every ten seconds
        let limiter = limiter("featherless", 6);
        for _ in 0..6 {
            assert!(limiter.consume_token("featherless"));
        }

        let start = Instant::now();
        let err = limiter
            .wait_for_token("featherless", Duration::from_secs(3))
            .await
            .expect_err("should time out");
        assert_eq!(
            err,
            RateLimitTimeout {
                provider: "featherless".to_string(),
                timeout_ms: 3000,
            }
        );
        assert!(start.elapsed() >= Duration::from_secs(3));

        // A level of ~0.3 tokens accrued during the wait must remain untouched
        let bucket_level = limiter.with_bucket("featherless", |b, now| {
            b.refill(now);
            b.tokens()
        });
        assert!((bucket_level - 0.3).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_limit_clamps_level() {
        let limiter = limiter("anthropic", 50);
        limiter.set_limit("anthropic", 5);

        let status = limiter.get_status("anthropic");
        assert_eq!(status.limit, 5);
        assert_eq!(status.available, 5);

        limiter.set_limit("anthropic", 100);
        assert_eq!(limiter.get_status("anthropic").available, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_refills() {
        let limiter = limiter("mcp", 2);
        assert!(limiter.consume_token("mcp"));
        assert!(limiter.consume_token("mcp"));
        limiter.reset("mcp");
        assert_eq!(limiter.get_status("mcp").available, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_provider_uses_default_limit() {
        let settings = RateLimitSettings {
            default_requests_per_minute: 7,
            providers: HashMap::new(),
        };
        let limiter = RateLimiter::new(&settings);
        assert_eq!(limiter.get_status("somebody").limit, 7);
        assert_eq!(limiter.get_status("somebody").available, 7);
        assert!(limiter.providers().is_empty());

        assert!(limiter.consume_token("somebody"));
        assert_eq!(limiter.providers(), vec!["somebody".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_settings_reaches_default_buckets() {
        let limiter = RateLimiter::new(&RateLimitSettings {
            default_requests_per_minute: 60,
            providers: HashMap::new(),
        });
        assert!(limiter.consume_token("openrouter"));
        assert_eq!(limiter.get_status("openrouter").limit, 60);

        limiter.apply_settings(&RateLimitSettings {
            default_requests_per_minute: 10,
            providers: HashMap::new(),
        });

        let status = limiter.get_status("openrouter");
        assert_eq!(status.limit, 10);
        assert_eq!(status.available, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_settings_drops_removed_provider_limit() {
        let limiter = limiter("featherless", 5);
        assert_eq!(limiter.get_status("featherless").limit, 5);

        limiter.apply_settings(&RateLimitSettings {
            default_requests_per_minute: 60,
            providers: HashMap::new(),
        });
        assert_eq!(limiter.get_status("featherless").limit, 60);
        // The clamped level refills at the new rate
        assert_eq!(limiter.get_status("featherless").available, 5);
    }

    proptest! {
        #[test]
        fn prop_bucket_level_stays_in_bounds(
            capacity in 0u32..500,
            steps in proptest::collection::vec((0u64..120_000, any::<bool>()), 1..64),
        ) {
            let start = Instant::now();
            let mut now = start;
            let mut bucket = TokenBucket::new(capacity, now);
            for (advance_ms, consume) in steps {
                now += Duration::from_millis(advance_ms);
                if consume {
                    bucket.try_consume(now);
                } else {
                    bucket.refill(now);
                }
                prop_assert!(bucket.tokens() >= 0.0);
                prop_assert!(bucket.tokens() <= f64::from(bucket.capacity()));
            }
        }
    }
}
