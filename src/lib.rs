//! Email-Marketing Platform Client
//!
//! Resilient API client for an email-marketing platform, built to back the
//! tool handlers of an agent tool server:
//! - Password and refresh-token authentication with proactive refresh
//! - Account-scoped requests for multi-account tokens
//! - Resilience patterns (retry, circuit breaker, rate limiting, bounded concurrency)
//! - Offset, cursor and token pagination
//! - Token and resilience diagnostics as JSON tool results
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use email_marketing_client::{MarketingConfig, RequestOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = email_marketing_client::create_client_from_env()?;
//!
//!     let campaigns = client
//!         .make_request("campaigns", RequestOptions::get().account_scoped())
//!         .await?;
//!
//!     println!("{}", campaigns);
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `rustls` - TLS through rustls (default)
//! - `native-tls` - TLS through the platform library

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core modules
pub mod auth;
pub mod client;
pub mod config;
pub mod errors;
pub mod transport;

// Request handling
pub mod pagination;
pub mod resilience;

// Services and tool handlers
pub mod services;
pub mod tools;

// Testing utilities
pub mod mocks;

// Re-exports for convenience
pub use auth::{AccessToken, RefreshOutcome, TokenManager, TokenManagerConfig, TokenScopes, TokenStatus};
pub use client::{MarketingClient, RequestOptions, ACCOUNT_ID_HEADER, REQUEST_ID_HEADER};
pub use config::{ConfigOverrides, Credentials, MarketingConfig, MarketingConfigBuilder};
pub use errors::{ConfigurationError, MarketingError, MarketingResult, NetworkError, NetworkErrorKind};
pub use pagination::{Page, PageIterator, PaginationStrategy};
pub use resilience::{
    CircuitBreakerConfig, CircuitState, RateLimitConfig, RequestQueueConfig, RetryConfig,
};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};

/// Default path of the token endpoint, relative to the base URL
pub const DEFAULT_TOKEN_PATH: &str = "oauth/token";

/// Default per-attempt timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default `User-Agent` header
pub const DEFAULT_USER_AGENT: &str = concat!("email-marketing-client/", env!("CARGO_PKG_VERSION"));

/// Create a client with the given configuration
pub fn create_client(config: MarketingConfig) -> MarketingResult<MarketingClient> {
    MarketingClient::new(config)
}

/// Create a client from environment variables
///
/// Reads:
/// - `MARKETING_API_BASE_URL` - Platform API root (required)
/// - `MARKETING_API_KEY` - API key, used instead of username and password
/// - `MARKETING_API_USERNAME` / `MARKETING_API_PASSWORD` - Password grant credentials
/// - `MARKETING_API_ACCOUNT_ID` - Default account for scoped requests
/// - `MARKETING_API_OVERRIDES` - JSON resilience overrides
pub fn create_client_from_env() -> MarketingResult<MarketingClient> {
    let config = MarketingConfig::from_env()?;
    create_client(config)
}
