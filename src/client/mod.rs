//! Email-marketing client implementation.
//!
//! [`MarketingClient::make_request`] is the single path to the platform.
//! Each call resolves a token, waits for a queue slot, passes the circuit
//! breaker, and then runs paced, time-boxed attempts under the retry policy.

mod options;

pub use options::RequestOptions;

use crate::auth::{
    AccessToken, RefreshOutcome, TokenManager, TokenScopes, TokenStatus, TokenValidation,
};
use crate::config::MarketingConfig;
use crate::errors::{ConfigurationError, MarketingError, MarketingResult};
use crate::pagination::{PageIterator, PaginationStrategy};
use crate::resilience::{
    CircuitBreaker, CircuitBreakerSnapshot, QueueStats, RateLimiter, RateLimiterSnapshot, RequestQueue,
    RetryConfig, RetryManager,
};
use crate::transport::{send_with_timeout, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::HeaderMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use url::Url;
use uuid::Uuid;

/// Header carrying the account a request acts on
pub const ACCOUNT_ID_HEADER: &str = "x-account-id";

/// Header carrying the per-call correlation id
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Resilient client for the email-marketing platform.
///
/// Cloning is cheap and clones share token, breaker, limiter and queue
/// state, so a clone is the same logical client.
#[derive(Clone)]
pub struct MarketingClient {
    config: Arc<MarketingConfig>,
    transport: Arc<dyn HttpTransport>,
    tokens: Arc<TokenManager>,
    retry: Arc<RetryManager>,
    circuit_breaker: Arc<CircuitBreaker>,
    rate_limiter: Arc<RateLimiter>,
    queue: Arc<RequestQueue>,
}

impl MarketingClient {
    /// Create a client that talks HTTP through reqwest
    pub fn new(config: MarketingConfig) -> MarketingResult<Self> {
        let transport = Arc::new(ReqwestTransport::new(config.timeout)?);
        Ok(Self::with_transport(config, transport))
    }

    /// Create a client on top of a custom transport
    pub fn with_transport(config: MarketingConfig, transport: Arc<dyn HttpTransport>) -> Self {
        let retry = Arc::new(RetryManager::new(config.retry.clone()));
        let tokens = Arc::new(TokenManager::new(&config, transport.clone(), retry.clone()));
        let circuit_breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let queue = Arc::new(RequestQueue::new(config.queue.clone()));

        Self {
            config: Arc::new(config),
            transport,
            tokens,
            retry,
            circuit_breaker,
            rate_limiter,
            queue,
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &MarketingConfig {
        &self.config
    }

    /// Token manager of this client
    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Send a request through the full pipeline and return the decoded body.
    ///
    /// Empty bodies decode to `Value::Null`. A 401 leads to exactly one
    /// token refresh and resend before the failure is returned.
    #[instrument(skip(self, options), fields(method = %options.method))]
    pub async fn make_request(&self, endpoint: &str, options: RequestOptions) -> MarketingResult<Value> {
        if let Some(message) = &options.body_error {
            return Err(ConfigurationError::InvalidValue {
                field: "body".to_string(),
                message: message.clone(),
            }
            .into());
        }

        let url = self.build_url(endpoint, &options.query)?;
        let body = match &options.body {
            Some(value) => Some(Bytes::from(serde_json::to_vec(value)?)),
            None => None,
        };
        let request_id = Uuid::new_v4().to_string();

        let (token, generation) = self.tokens.acquire().await?;
        let account_id = self.resolve_account(&options);
        let headers = self.build_headers(
            &token,
            &options,
            account_id.as_deref(),
            &request_id,
            body.is_some(),
        )?;

        if self.config.debug {
            debug!(request_id = %request_id, url = %url, body = ?options.body, "Sending request");
        }

        let mut request = HttpRequest {
            method: options.method.clone(),
            url,
            headers,
            body,
        };

        let response = match self.dispatch(endpoint, &request).await {
            Err(err) if err.is_unauthorized() => {
                warn!(request_id = %request_id, "Access token rejected, refreshing once");
                let token = self.tokens.refresh_after_rejection(generation).await?;
                set_authorization(&mut request.headers, &token)?;
                self.dispatch(endpoint, &request).await?
            }
            other => other?,
        };

        self.decode(&request_id, response)
    }

    /// [`MarketingClient::make_request`] decoding into `T`
    pub async fn request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> MarketingResult<T> {
        let value = self.make_request(endpoint, options).await?;
        serde_json::from_value(value).map_err(|e| MarketingError::Response {
            message: e.to_string(),
            body: None,
        })
    }

    /// Iterate over the pages of a list endpoint
    pub fn paginate(&self, endpoint: impl Into<String>, strategy: PaginationStrategy) -> PageIterator {
        PageIterator::new(self.clone(), endpoint, strategy)
    }

    /// Account for scoped requests: the configured default, else the token's first
    pub fn get_current_account_id(&self) -> Option<String> {
        self.config
            .default_account_id
            .clone()
            .or_else(|| self.tokens.current_account_id())
    }

    /// Lifetime report for the current token
    pub fn get_token_status(&self) -> TokenStatus {
        self.tokens.get_token_status()
    }

    /// Accounts and permissions of the current token
    pub fn get_token_scopes(&self) -> TokenScopes {
        self.tokens.get_token_scopes()
    }

    /// Refresh the token now
    pub async fn force_refresh_token(&self) -> MarketingResult<RefreshOutcome> {
        self.tokens.force_refresh_token().await
    }

    /// Check that the credentials yield a usable token
    pub async fn validate_token(&self) -> MarketingResult<TokenValidation> {
        self.tokens.validate_token().await
    }

    /// Retry policy in effect
    pub fn get_retry_config(&self) -> RetryConfig {
        self.retry.get_config()
    }

    /// Replace the retry policy for subsequent calls
    pub fn update_retry_config(&self, config: RetryConfig) -> MarketingResult<()> {
        config.validate()?;
        self.retry.update_config(config);
        Ok(())
    }

    /// Breaker state
    pub fn circuit_breaker_state(&self) -> CircuitBreakerSnapshot {
        self.circuit_breaker.snapshot()
    }

    /// Force the breaker closed
    pub fn reset_circuit_breaker(&self) {
        self.circuit_breaker.reset();
    }

    /// Queue occupancy
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Limiter state
    pub fn rate_limiter_state(&self) -> RateLimiterSnapshot {
        self.rate_limiter.snapshot()
    }

    /// Stop admitting requests; calls already running finish normally
    pub fn shutdown(&self) {
        self.queue.close();
    }

    fn resolve_account(&self, options: &RequestOptions) -> Option<String> {
        if let Some(account) = &options.account_id {
            return Some(account.clone());
        }
        if options.account_scoped {
            return self.get_current_account_id();
        }
        None
    }

    async fn dispatch(&self, endpoint: &str, request: &HttpRequest) -> MarketingResult<HttpResponse> {
        self.queue
            .add(|| {
                self.circuit_breaker.execute(endpoint, || {
                    self.retry
                        .execute_with_retry(endpoint, || self.attempt(request.clone()))
                })
            })
            .await
    }

    async fn attempt(&self, request: HttpRequest) -> MarketingResult<HttpResponse> {
        self.rate_limiter.acquire().await;

        let response = send_with_timeout(self.transport.as_ref(), request, self.config.timeout).await?;
        self.rate_limiter
            .observe_server_limits(response.status, &response.headers);

        if self.config.debug {
            debug!(
                status = response.status,
                body = %String::from_utf8_lossy(&response.body),
                "Received response"
            );
        }

        response.error_for_status()
    }

    fn decode(&self, request_id: &str, response: HttpResponse) -> MarketingResult<Value> {
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&response.body).map_err(|e| {
            warn!(request_id, error = %e, "Response body is not valid JSON");
            MarketingError::Response {
                message: e.to_string(),
                body: Some(String::from_utf8_lossy(&response.body).to_string()),
            }
        })
    }

    fn build_url(&self, endpoint: &str, query: &[(String, String)]) -> MarketingResult<String> {
        let raw = self.config.build_url(endpoint);
        if query.is_empty() {
            return Ok(raw);
        }
        let mut url = Url::parse(&raw).map_err(|e| ConfigurationError::InvalidBaseUrl {
            message: format!("{}: {}", raw, e),
        })?;
        url.query_pairs_mut()
            .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        Ok(url.into())
    }

    fn build_headers(
        &self,
        token: &AccessToken,
        options: &RequestOptions,
        account_id: Option<&str>,
        request_id: &str,
        has_body: bool,
    ) -> MarketingResult<HeaderMap> {
        let mut headers = self.config.default_headers.clone();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if has_body {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        headers.insert(USER_AGENT, header_value("user-agent", &self.config.user_agent)?);
        headers.insert(
            HeaderName::from_static(REQUEST_ID_HEADER),
            header_value(REQUEST_ID_HEADER, request_id)?,
        );
        if let Some(account) = account_id {
            headers.insert(
                HeaderName::from_static(ACCOUNT_ID_HEADER),
                header_value(ACCOUNT_ID_HEADER, account)?,
            );
        }
        for (name, value) in &options.headers {
            let header_name = name
                .parse::<HeaderName>()
                .map_err(|_| ConfigurationError::InvalidHeader { name: name.clone() })?;
            headers.insert(header_name, header_value(name, value)?);
        }
        set_authorization(&mut headers, token)?;
        Ok(headers)
    }
}

impl std::fmt::Debug for MarketingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketingClient")
            .field("config", &self.config)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, ConfigurationError> {
    HeaderValue::from_str(value).map_err(|_| ConfigurationError::InvalidHeader { name: name.to_string() })
}

fn set_authorization(headers: &mut HeaderMap, token: &AccessToken) -> Result<(), ConfigurationError> {
    let mut value = header_value("authorization", &token.authorization())?;
    value.set_sensitive(true);
    headers.insert(AUTHORIZATION, value);
    Ok(())
}
