//! Client-side token bucket that paces outbound requests.

use crate::errors::parse_retry_after;
use http::HeaderMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

const REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RESET_HEADER: &str = "x-ratelimit-reset";

/// Reset values above this are treated as Unix timestamps rather than deltas
const EPOCH_THRESHOLD: u64 = 1_000_000_000;

/// Rate limit configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    /// Whether pacing is applied at all
    pub enabled: bool,
    /// Sustained request rate
    pub requests_per_second: f64,
    /// Bucket capacity
    pub burst_limit: u32,
    /// Pause the bucket when the platform reports exhaustion
    pub respect_server_limits: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 10.0,
            burst_limit: 20,
            respect_server_limits: true,
        }
    }
}

impl RateLimitConfig {
    /// Create new config
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable pacing
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set sustained rate
    pub fn requests_per_second(mut self, rps: f64) -> Self {
        self.requests_per_second = rps;
        self
    }

    /// Set bucket capacity
    pub fn burst_limit(mut self, burst: u32) -> Self {
        self.burst_limit = burst;
        self
    }

    /// Honour platform rate-limit headers
    pub fn respect_server_limits(mut self, respect: bool) -> Self {
        self.respect_server_limits = respect;
        self
    }

    /// Check the configuration for values the bucket cannot use
    pub fn validate(&self) -> Result<(), crate::errors::ConfigurationError> {
        if !self.enabled {
            return Ok(());
        }
        if !self.requests_per_second.is_finite() || self.requests_per_second <= 0.0 {
            return Err(crate::errors::ConfigurationError::InvalidValue {
                field: "rate_limit.requests_per_second".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
        if self.burst_limit == 0 {
            return Err(crate::errors::ConfigurationError::InvalidValue {
                field: "rate_limit.burst_limit".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// Diagnostic view of the limiter
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterSnapshot {
    /// Whether pacing is applied
    pub enabled: bool,
    /// Whole tokens available right now
    pub available_tokens: u32,
    /// Bucket capacity
    pub burst_limit: u32,
    /// Sustained rate
    pub requests_per_second: f64,
    /// Milliseconds left on a server-imposed pause
    pub paused_for_ms: Option<u64>,
}

/// Token bucket state. `tokens` goes negative while callers hold
/// reservations, and `last_refill` may sit in the future during a pause.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            tokens: f64::from(capacity),
            capacity: f64::from(capacity),
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Takes one token and returns how long the caller must wait before using it
    fn reserve(&mut self, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= 1.0;

        let pause = self.last_refill.saturating_duration_since(now);
        if self.tokens >= 0.0 {
            return pause;
        }
        pause + Duration::from_secs_f64(-self.tokens / self.refill_rate)
    }

    fn pause_until(&mut self, until: Instant) {
        self.tokens = self.tokens.min(0.0);
        if until > self.last_refill {
            self.last_refill = until;
        }
    }
}

/// Paces requests from every caller of one client
pub struct RateLimiter {
    config: RateLimitConfig,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Create a new rate limiter with a full bucket
    pub fn new(config: RateLimitConfig) -> Self {
        let bucket = TokenBucket::new(
            config.burst_limit.max(1),
            config.requests_per_second.max(f64::MIN_POSITIVE),
        );
        Self {
            config,
            bucket: Mutex::new(bucket),
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Wait until a request may be sent
    pub async fn acquire(&self) {
        if !self.config.enabled {
            return;
        }

        let wait = self.bucket.lock().reserve(Instant::now());
        if !wait.is_zero() {
            debug!(wait_ms = wait.as_millis() as u64, "Rate limited, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Whole tokens available without waiting
    pub fn available_tokens(&self) -> u32 {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        bucket.refill(now);
        if bucket.last_refill > now {
            return 0;
        }
        bucket.tokens.max(0.0).floor() as u32
    }

    /// Stop handing out tokens for `duration`
    pub fn pause_for(&self, duration: Duration) {
        if !self.config.enabled || duration.is_zero() {
            return;
        }
        info!(pause_ms = duration.as_millis() as u64, "Pausing outbound requests");
        self.bucket.lock().pause_until(Instant::now() + duration);
    }

    /// Apply the platform's rate-limit headers from a response
    pub fn observe_server_limits(&self, status: u16, headers: &HeaderMap) {
        if !self.config.respect_server_limits {
            return;
        }

        if status == 429 {
            if let Some(wait) = parse_retry_after(headers) {
                self.pause_for(wait);
                return;
            }
        }

        let remaining = header_u64(headers, REMAINING_HEADER);
        if remaining == Some(0) {
            if let Some(reset) = header_u64(headers, RESET_HEADER) {
                self.pause_for(reset_delay(reset));
            }
        }
    }

    /// Diagnostic snapshot
    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let now = Instant::now();
        let paused_for = {
            let bucket = self.bucket.lock();
            bucket.last_refill.checked_duration_since(now).filter(|d| !d.is_zero())
        };
        RateLimiterSnapshot {
            enabled: self.config.enabled,
            available_tokens: self.available_tokens(),
            burst_limit: self.config.burst_limit,
            requests_per_second: self.config.requests_per_second,
            paused_for_ms: paused_for.map(|d| d.as_millis() as u64),
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .finish()
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

fn reset_delay(reset: u64) -> Duration {
    if reset < EPOCH_THRESHOLD {
        return Duration::from_secs(reset);
    }
    let now = chrono::Utc::now().timestamp().max(0) as u64;
    Duration::from_secs(reset.saturating_sub(now))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn limiter(rps: f64, burst: u32) -> RateLimiter {
        RateLimiter::new(
            RateLimitConfig::new()
                .requests_per_second(rps)
                .burst_limit(burst),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_immediate() {
        let limiter = limiter(5.0, 4);
        let start = Instant::now();

        for _ in 0..4 {
            limiter.acquire().await;
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(limiter.available_tokens(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_past_burst_waits_one_interval() {
        let limiter = limiter(5.0, 2);
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        assert_eq!(start.elapsed(), Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_refill_over_time() {
        let limiter = limiter(10.0, 10);
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.available_tokens(), 0);

        tokio::time::advance(Duration::from_millis(500)).await;

        assert_eq!(limiter.available_tokens(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_never_waits() {
        let limiter = RateLimiter::new(
            RateLimitConfig::new()
                .enabled(false)
                .requests_per_second(1.0)
                .burst_limit(1),
        );
        let start = Instant::now();

        for _ in 0..50 {
            limiter.acquire().await;
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_exhaustion_pauses_bucket() {
        let limiter = limiter(100.0, 100);
        let mut headers = HeaderMap::new();
        headers.insert(REMAINING_HEADER, HeaderValue::from_static("0"));
        headers.insert(RESET_HEADER, HeaderValue::from_static("3"));

        limiter.observe_server_limits(200, &headers);
        assert_eq!(limiter.snapshot().paused_for_ms, Some(3_000));

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_on_429_pauses_bucket() {
        let limiter = limiter(100.0, 100);
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RETRY_AFTER, HeaderValue::from_static("2"));

        limiter.observe_server_limits(429, &headers);

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_limits_ignored_when_not_respected() {
        let limiter = RateLimiter::new(RateLimitConfig::new().respect_server_limits(false));
        let mut headers = HeaderMap::new();
        headers.insert(REMAINING_HEADER, HeaderValue::from_static("0"));
        headers.insert(RESET_HEADER, HeaderValue::from_static("30"));

        limiter.observe_server_limits(200, &headers);

        assert_eq!(limiter.snapshot().paused_for_ms, None);
    }

    #[test]
    fn test_validate() {
        assert!(RateLimitConfig::new().requests_per_second(0.0).validate().is_err());
        assert!(RateLimitConfig::new().burst_limit(0).validate().is_err());
        assert!(RateLimitConfig::new()
            .enabled(false)
            .requests_per_second(0.0)
            .validate()
            .is_ok());
    }
}
