//! Retry logic with exponential backoff for transient failures.

use crate::errors::{MarketingError, MarketingResult, NetworkErrorKind};
use parking_lot::RwLock;
use rand::Rng;
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub exponential_base: f64,
    /// Whether to randomize delays
    pub jitter: bool,
    /// HTTP statuses that are retried in addition to 429 and 5xx
    pub retryable_status_codes: BTreeSet<u16>,
    /// Connection-level failures that are retried
    pub retryable_error_kinds: HashSet<NetworkErrorKind>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
            retryable_status_codes: [408, 429, 500, 502, 503, 504].into_iter().collect(),
            retryable_error_kinds: [
                NetworkErrorKind::ConnectionReset,
                NetworkErrorKind::ConnectionRefused,
                NetworkErrorKind::ConnectionAborted,
                NetworkErrorKind::DnsFailure,
                NetworkErrorKind::Timeout,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum retries
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Set the first retry delay
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff growth factor
    pub fn exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = base;
        self
    }

    /// Enable or disable jitter
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Replace the retryable status set
    pub fn retryable_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.retryable_status_codes = codes.into_iter().collect();
        self
    }

    /// Replace the retryable network kinds
    pub fn retryable_error_kinds(mut self, kinds: impl IntoIterator<Item = NetworkErrorKind>) -> Self {
        self.retryable_error_kinds = kinds.into_iter().collect();
        self
    }

    /// Check the configuration for values the backoff formula cannot use
    pub fn validate(&self) -> Result<(), crate::errors::ConfigurationError> {
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            return Err(crate::errors::ConfigurationError::InvalidValue {
                field: "retry.exponential_base".to_string(),
                message: "must be a finite number >= 1.0".to_string(),
            });
        }
        if self.base_delay > self.max_delay {
            return Err(crate::errors::ConfigurationError::InvalidValue {
                field: "retry.base_delay".to_string(),
                message: "must not exceed max_delay".to_string(),
            });
        }
        Ok(())
    }

    /// Un-jittered delay before retry number `retry` (0 for the first retry)
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let raw = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        let capped = raw.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    /// Delay before retry number `retry`, with jitter applied when enabled
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let delay = self.backoff_delay(retry);
        if !self.jitter {
            return delay;
        }
        let factor = 0.5 + rand::thread_rng().gen::<f64>() * 0.5;
        delay.mul_f64(factor)
    }
}

/// Retries operations under a runtime-replaceable [`RetryConfig`]
pub struct RetryManager {
    config: RwLock<RetryConfig>,
}

impl RetryManager {
    /// Create a manager with the given configuration
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config: RwLock::new(config),
        }
    }

    /// Current configuration
    pub fn get_config(&self) -> RetryConfig {
        self.config.read().clone()
    }

    /// Replace the configuration; calls already in progress keep their snapshot
    pub fn update_config(&self, config: RetryConfig) {
        debug!(
            max_retries = config.max_retries,
            base_delay_ms = config.base_delay.as_millis() as u64,
            "Retry configuration updated"
        );
        *self.config.write() = config;
    }

    /// Whether a failure of the 0-based `attempt` should be retried
    pub fn should_retry(&self, error: &MarketingError, attempt: u32) -> bool {
        let config = self.config.read();
        attempt < config.max_retries && is_retryable(error, &config)
    }

    /// Run `operation`, retrying transient failures with backoff.
    ///
    /// Non-retryable errors are returned untouched on the first failure.
    /// When the budget runs out the last error comes back wrapped in
    /// [`MarketingError::RetriesExhausted`].
    pub async fn execute_with_retry<F, Fut, T>(&self, context: &str, mut operation: F) -> MarketingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MarketingResult<T>>,
    {
        let config = self.get_config();
        let mut attempt: u32 = 0;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(context, attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    if !is_retryable(&error, &config) {
                        return Err(error);
                    }

                    if attempt >= config.max_retries {
                        warn!(
                            context,
                            attempts = attempt + 1,
                            error = %error,
                            "Retry budget exhausted"
                        );
                        return Err(MarketingError::RetriesExhausted {
                            attempts: attempt + 1,
                            source: Box::new(error),
                        });
                    }

                    let delay = retry_delay(&config, &error, attempt);
                    warn!(
                        context,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("config", &*self.config.read())
            .finish()
    }
}

/// Classifies an error against a retry configuration, ignoring the budget
pub fn is_retryable(error: &MarketingError, config: &RetryConfig) -> bool {
    match error {
        MarketingError::Authentication { .. }
        | MarketingError::Configuration(_)
        | MarketingError::CircuitOpen { .. }
        | MarketingError::QueueClosed
        | MarketingError::NotImplemented { .. }
        | MarketingError::Response { .. }
        | MarketingError::RetriesExhausted { .. } => false,
        MarketingError::Timeout { .. } => true,
        MarketingError::Network(err) => config.retryable_error_kinds.contains(&err.kind),
        MarketingError::RateLimit { .. } | MarketingError::Server { .. } => true,
        MarketingError::Client { status, .. } => config.retryable_status_codes.contains(status),
    }
}

/// Server-provided wait when present, otherwise computed backoff; both capped
fn retry_delay(config: &RetryConfig, error: &MarketingError, attempt: u32) -> Duration {
    match error.retry_after() {
        Some(server_delay) => server_delay.min(config.max_delay),
        None => config.delay_for_retry(attempt),
    }
}
