//! Configuration management for the email-marketing client.
//!
//! Supports configuration via:
//! - Explicit values
//! - Environment variables
//! - Builder pattern
//! - JSON override documents for retry and rate-limit tuning

use crate::auth::TokenManagerConfig;
use crate::errors::{ConfigurationError, MarketingError, MarketingResult, NetworkErrorKind};
use crate::resilience::{CircuitBreakerConfig, RateLimitConfig, RequestQueueConfig, RetryConfig};
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use secrecy::SecretString;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

/// How the client authenticates against the token endpoint
#[derive(Clone)]
pub enum Credentials {
    /// Resource-owner password grant
    Password {
        /// Account login
        username: String,
        /// Account password
        password: SecretString,
    },
    /// Long-lived API key used directly as the bearer credential
    ApiKey(SecretString),
}

impl Credentials {
    /// Username/password credentials
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Password {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }

    /// API key credentials
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey(SecretString::new(key.into()))
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        use secrecy::ExposeSecret;
        let blank = match self {
            Self::Password { username, password } => {
                username.trim().is_empty() || password.expose_secret().is_empty()
            }
            Self::ApiKey(key) => key.expose_secret().trim().is_empty(),
        };
        if blank {
            Err(ConfigurationError::MissingCredentials)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password { username, .. } => f
                .debug_struct("Password")
                .field("username", username)
                .field("password", &"[REDACTED]")
                .finish(),
            Self::ApiKey(_) => write!(f, "ApiKey([REDACTED])"),
        }
    }
}

/// Configuration for the email-marketing client
#[derive(Clone)]
pub struct MarketingConfig {
    pub(crate) credentials: Credentials,
    /// Base URL for API requests
    pub base_url: Url,
    /// Path of the token endpoint, relative to the base URL
    pub token_path: String,
    /// Deadline for a single network attempt
    pub timeout: Duration,
    /// User-Agent header value
    pub user_agent: String,
    /// Headers added to every request
    pub default_headers: HeaderMap,
    /// Account used for scoped requests when none is given explicitly
    pub default_account_id: Option<String>,
    /// Log request and response bodies
    pub debug: bool,
    /// Retry policy
    pub retry: RetryConfig,
    /// Client-side pacing
    pub rate_limit: RateLimitConfig,
    /// Breaker thresholds
    pub circuit_breaker: CircuitBreakerConfig,
    /// Concurrency bound
    pub queue: RequestQueueConfig,
    /// Token lifetime handling
    pub token: TokenManagerConfig,
}

impl std::fmt::Debug for MarketingConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketingConfig")
            .field("credentials", &self.credentials)
            .field("base_url", &self.base_url.as_str())
            .field("token_path", &self.token_path)
            .field("timeout", &self.timeout)
            .field("default_account_id", &self.default_account_id)
            .field("debug", &self.debug)
            .field("retry", &self.retry)
            .field("rate_limit", &self.rate_limit)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("queue", &self.queue)
            .finish()
    }
}

impl MarketingConfig {
    /// Create a new configuration builder
    pub fn builder() -> MarketingConfigBuilder {
        MarketingConfigBuilder::new()
    }

    /// Create configuration from `MARKETING_API_*` environment variables
    pub fn from_env() -> MarketingResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> MarketingResult<Self> {
        let mut builder = MarketingConfigBuilder::new();

        if let Some(url) = lookup("MARKETING_API_BASE_URL") {
            builder = builder.base_url(&url)?;
        }

        if let Some(key) = lookup("MARKETING_API_KEY") {
            builder = builder.credentials(Credentials::api_key(key));
        } else if let (Some(username), Some(password)) = (
            lookup("MARKETING_API_USERNAME"),
            lookup("MARKETING_API_PASSWORD"),
        ) {
            builder = builder.credentials(Credentials::password(username, password));
        }

        if let Some(account) = lookup("MARKETING_API_ACCOUNT_ID") {
            builder = builder.default_account_id(account);
        }

        if let Some(secs) = lookup("MARKETING_API_TIMEOUT").and_then(|v| v.parse::<u64>().ok()) {
            builder = builder.timeout(Duration::from_secs(secs));
        }

        if let Some(flag) = lookup("MARKETING_API_DEBUG") {
            builder = builder.debug(matches!(flag.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));
        }

        if let Some(n) = lookup("MARKETING_API_MAX_RETRIES").and_then(|v| v.parse::<u32>().ok()) {
            builder.retry.max_retries = n;
        }

        if let Some(rps) = lookup("MARKETING_API_RATE_LIMIT").and_then(|v| v.parse::<f64>().ok()) {
            builder.rate_limit.requests_per_second = rps;
        }

        if let Some(burst) = lookup("MARKETING_API_BURST").and_then(|v| v.parse::<u32>().ok()) {
            builder.rate_limit.burst_limit = burst;
        }

        if let Some(n) = lookup("MARKETING_API_MAX_CONCURRENT").and_then(|v| v.parse::<usize>().ok()) {
            builder.queue.max_concurrent = n;
        }

        if let Some(json) = lookup("MARKETING_API_OVERRIDES") {
            let overrides = ConfigOverrides::from_json(&json)?;
            builder = builder.overrides(&overrides)?;
        }

        builder.build()
    }

    /// Credentials in use
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Build the full URL for an endpoint
    pub fn build_url(&self, endpoint: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        let path = endpoint.trim_start_matches('/');
        format!("{}/{}", base, path)
    }

    /// Full URL of the token endpoint
    pub fn token_url(&self) -> String {
        self.build_url(&self.token_path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> MarketingResult<()> {
        self.credentials.validate()?;

        if !matches!(self.base_url.scheme(), "http" | "https") {
            return Err(ConfigurationError::InvalidBaseUrl {
                message: format!("unsupported scheme {}", self.base_url.scheme()),
            }
            .into());
        }

        if self.timeout.is_zero() {
            return Err(ConfigurationError::InvalidValue {
                field: "timeout".to_string(),
                message: "must be greater than zero".to_string(),
            }
            .into());
        }

        self.retry.validate()?;
        self.rate_limit.validate()?;

        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "circuit_breaker.failure_threshold".to_string(),
                message: "must be at least 1".to_string(),
            }
            .into());
        }

        if self.queue.max_concurrent == 0 {
            return Err(ConfigurationError::InvalidValue {
                field: "queue.max_concurrent".to_string(),
                message: "must be at least 1".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

/// Builder for MarketingConfig
pub struct MarketingConfigBuilder {
    credentials: Option<Credentials>,
    base_url: Option<Url>,
    token_path: String,
    timeout: Duration,
    user_agent: String,
    default_headers: HeaderMap,
    default_account_id: Option<String>,
    debug: bool,
    retry: RetryConfig,
    rate_limit: RateLimitConfig,
    circuit_breaker: CircuitBreakerConfig,
    queue: RequestQueueConfig,
    token: TokenManagerConfig,
}

impl Default for MarketingConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl MarketingConfigBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self {
            credentials: None,
            base_url: None,
            token_path: crate::DEFAULT_TOKEN_PATH.to_string(),
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECS),
            user_agent: crate::DEFAULT_USER_AGENT.to_string(),
            default_headers: HeaderMap::new(),
            default_account_id: None,
            debug: false,
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            queue: RequestQueueConfig::default(),
            token: TokenManagerConfig::default(),
        }
    }

    /// Set credentials
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    /// Authenticate with username and password
    pub fn username_password(self, username: &str, password: &str) -> Self {
        self.credentials(Credentials::password(username, password))
    }

    /// Authenticate with an API key
    pub fn api_key(self, key: &str) -> Self {
        self.credentials(Credentials::api_key(key))
    }

    /// Set the base URL
    pub fn base_url(mut self, url: &str) -> Result<Self, ConfigurationError> {
        let parsed = Url::parse(url).map_err(|e| ConfigurationError::InvalidBaseUrl {
            message: format!("{}: {}", url, e),
        })?;
        self.base_url = Some(parsed);
        Ok(self)
    }

    /// Set the token endpoint path
    pub fn token_path(mut self, path: impl Into<String>) -> Self {
        self.token_path = path.into();
        self
    }

    /// Set the per-attempt timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the User-Agent
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Add a default header
    pub fn default_header(mut self, name: &str, value: &str) -> Result<Self, ConfigurationError> {
        let header_name = name
            .parse::<HeaderName>()
            .map_err(|_| ConfigurationError::InvalidHeader { name: name.to_string() })?;
        let header_value = value
            .parse::<HeaderValue>()
            .map_err(|_| ConfigurationError::InvalidHeader { name: name.to_string() })?;
        self.default_headers.insert(header_name, header_value);
        Ok(self)
    }

    /// Set the account used for scoped requests
    pub fn default_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.default_account_id = Some(account_id.into());
        self
    }

    /// Enable body logging
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Set the retry policy
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    /// Set client-side pacing
    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    /// Set breaker thresholds
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    /// Set the concurrency bound
    pub fn queue(mut self, config: RequestQueueConfig) -> Self {
        self.queue = config;
        self
    }

    /// Set token lifetime handling
    pub fn token(mut self, config: TokenManagerConfig) -> Self {
        self.token = config;
        self
    }

    /// Apply a parsed override document on top of the current values
    pub fn overrides(mut self, overrides: &ConfigOverrides) -> Result<Self, ConfigurationError> {
        if let Some(retry) = &overrides.retry {
            self.retry = retry.apply(&self.retry)?;
        }
        if let Some(rate_limit) = &overrides.rate_limit {
            self.rate_limit = rate_limit.apply(&self.rate_limit)?;
        }
        if let Some(debug) = overrides.debug {
            self.debug = debug;
        }
        if let Some(ms) = overrides.timeout_ms {
            self.timeout = Duration::from_millis(ms);
        }
        if let Some(n) = overrides.max_concurrent {
            self.queue.max_concurrent = n;
        }
        if let Some(n) = overrides.failure_threshold {
            self.circuit_breaker.failure_threshold = n;
        }
        if let Some(ms) = overrides.reset_timeout_ms {
            self.circuit_breaker.reset_timeout = Duration::from_millis(ms);
        }
        Ok(self)
    }

    /// Build the configuration
    pub fn build(self) -> MarketingResult<MarketingConfig> {
        let credentials = self
            .credentials
            .ok_or(MarketingError::Configuration(ConfigurationError::MissingCredentials))?;
        let base_url = self
            .base_url
            .ok_or(MarketingError::Configuration(ConfigurationError::MissingBaseUrl))?;

        let config = MarketingConfig {
            credentials,
            base_url,
            token_path: self.token_path,
            timeout: self.timeout,
            user_agent: self.user_agent,
            default_headers: self.default_headers,
            default_account_id: self.default_account_id,
            debug: self.debug,
            retry: self.retry,
            rate_limit: self.rate_limit,
            circuit_breaker: self.circuit_breaker,
            queue: self.queue,
            token: self.token,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Partial retry configuration, as supplied by operators or tool calls
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryOverrides {
    /// Maximum retries
    #[serde(alias = "max_retries")]
    pub max_retries: Option<u32>,
    /// First retry delay in milliseconds
    #[serde(alias = "base_delay_ms", alias = "baseDelay")]
    pub base_delay_ms: Option<u64>,
    /// Delay cap in milliseconds
    #[serde(alias = "max_delay_ms", alias = "maxDelay")]
    pub max_delay_ms: Option<u64>,
    /// Backoff growth factor
    #[serde(alias = "exponential_base")]
    pub exponential_base: Option<f64>,
    /// Randomize delays
    pub jitter: Option<bool>,
    /// Retried HTTP statuses
    #[serde(alias = "retryable_status_codes")]
    pub retryable_status_codes: Option<Vec<u16>>,
    /// Retried connection failures
    #[serde(alias = "retryable_errors")]
    pub retryable_errors: Option<Vec<NetworkErrorKind>>,
}

impl RetryOverrides {
    /// Produce a new validated config with these overrides applied to `base`
    pub fn apply(&self, base: &RetryConfig) -> Result<RetryConfig, ConfigurationError> {
        let mut config = base.clone();
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if let Some(ms) = self.base_delay_ms {
            config.base_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = self.max_delay_ms {
            config.max_delay = Duration::from_millis(ms);
        }
        if let Some(base) = self.exponential_base {
            config.exponential_base = base;
        }
        if let Some(jitter) = self.jitter {
            config.jitter = jitter;
        }
        if let Some(codes) = &self.retryable_status_codes {
            config.retryable_status_codes = codes.iter().copied().collect();
        }
        if let Some(kinds) = &self.retryable_errors {
            config.retryable_error_kinds = kinds.iter().copied().collect();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Partial rate-limit configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RateLimitOverrides {
    /// Enable pacing
    pub enabled: Option<bool>,
    /// Sustained rate
    #[serde(alias = "requests_per_second")]
    pub requests_per_second: Option<f64>,
    /// Bucket capacity
    #[serde(alias = "burst_limit")]
    pub burst_limit: Option<u32>,
    /// Honour platform headers
    #[serde(alias = "respect_server_limits")]
    pub respect_server_limits: Option<bool>,
}

impl RateLimitOverrides {
    /// Produce a new validated config with these overrides applied to `base`
    pub fn apply(&self, base: &RateLimitConfig) -> Result<RateLimitConfig, ConfigurationError> {
        let mut config = base.clone();
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(rps) = self.requests_per_second {
            config.requests_per_second = rps;
        }
        if let Some(burst) = self.burst_limit {
            config.burst_limit = burst;
        }
        if let Some(respect) = self.respect_server_limits {
            config.respect_server_limits = respect;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Top-level override document
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConfigOverrides {
    /// Retry tuning
    pub retry: Option<RetryOverrides>,
    /// Rate-limit tuning
    #[serde(alias = "rate_limit")]
    pub rate_limit: Option<RateLimitOverrides>,
    /// Body logging
    pub debug: Option<bool>,
    /// Per-attempt timeout in milliseconds
    #[serde(alias = "timeout_ms")]
    pub timeout_ms: Option<u64>,
    /// Concurrency bound
    #[serde(alias = "max_concurrent")]
    pub max_concurrent: Option<usize>,
    /// Breaker threshold
    #[serde(alias = "failure_threshold")]
    pub failure_threshold: Option<u32>,
    /// Breaker cooldown in milliseconds
    #[serde(alias = "reset_timeout_ms")]
    pub reset_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Parse an override document
    pub fn from_json(json: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(json).map_err(|e| ConfigurationError::InvalidOverrides(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_builder() -> MarketingConfigBuilder {
        MarketingConfigBuilder::new()
            .base_url("https://api.mailer.test/v3")
            .unwrap()
            .username_password("ops@example.com", "hunter2")
    }

    #[test]
    fn test_config_builder() {
        let config = base_builder()
            .timeout(Duration::from_secs(10))
            .default_account_id("acct-1")
            .build()
            .unwrap();

        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.default_account_id.as_deref(), Some("acct-1"));
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_build_url() {
        let config = base_builder().build().unwrap();

        assert_eq!(config.build_url("/campaigns"), "https://api.mailer.test/v3/campaigns");
        assert_eq!(config.build_url("lists/7"), "https://api.mailer.test/v3/lists/7");
        assert_eq!(config.token_url(), "https://api.mailer.test/v3/oauth/token");
    }

    #[test]
    fn test_missing_credentials() {
        let result = MarketingConfigBuilder::new()
            .base_url("https://api.mailer.test")
            .unwrap()
            .build();
        assert!(matches!(
            result,
            Err(MarketingError::Configuration(ConfigurationError::MissingCredentials))
        ));

        let blank = base_builder().username_password("", "").build();
        assert!(blank.is_err());
    }

    #[test]
    fn test_missing_base_url() {
        let result = MarketingConfigBuilder::new().api_key("k-123").build();
        assert!(matches!(
            result,
            Err(MarketingError::Configuration(ConfigurationError::MissingBaseUrl))
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = base_builder().build().unwrap();
        let rendered = format!("{:?}", config);

        assert!(rendered.contains("ops@example.com"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn test_retry_overrides_apply() {
        let overrides: RetryOverrides =
            serde_json::from_str(r#"{"maxRetries": 5, "baseDelayMs": 250, "jitter": false, "unknown": 1}"#)
                .unwrap();

        let config = overrides.apply(&RetryConfig::default()).unwrap();

        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_delay, Duration::from_millis(250));
        assert!(!config.jitter);
        assert_eq!(config.max_delay, Duration::from_secs(30));
    }

    #[test]
    fn test_invalid_overrides_rejected() {
        let overrides = RetryOverrides {
            exponential_base: Some(0.1),
            ..Default::default()
        };
        assert!(overrides.apply(&RetryConfig::default()).is_err());
        assert!(ConfigOverrides::from_json("{not json").is_err());
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("MARKETING_API_BASE_URL", "https://api.mailer.test/v3"),
            ("MARKETING_API_KEY", "key-abc"),
            ("MARKETING_API_ACCOUNT_ID", "42"),
            ("MARKETING_API_TIMEOUT", "12"),
            ("MARKETING_API_DEBUG", "true"),
            ("MARKETING_API_MAX_CONCURRENT", "4"),
            ("MARKETING_API_OVERRIDES", r#"{"rateLimit": {"requestsPerSecond": 2.5}}"#),
        ]
        .into_iter()
        .collect();

        let config = MarketingConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert!(matches!(config.credentials(), Credentials::ApiKey(_)));
        assert_eq!(config.default_account_id.as_deref(), Some("42"));
        assert_eq!(config.timeout, Duration::from_secs(12));
        assert!(config.debug);
        assert_eq!(config.queue.max_concurrent, 4);
        assert_eq!(config.rate_limit.requests_per_second, 2.5);
    }

    #[test]
    fn test_invalid_default_header() {
        assert!(base_builder().default_header("bad header", "x").is_err());
        assert!(base_builder().default_header("X-Team", "growth").is_ok());
    }
}
