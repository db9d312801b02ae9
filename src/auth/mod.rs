//! Token acquisition and refresh.
//!
//! [`TokenManager`] owns the access token for one client. Refreshes are
//! serialized: callers that find the token stale queue on a single lock,
//! and whoever arrives after a refresh completed reuses its result.

mod token;

pub use token::{AccessToken, RefreshOutcome, TokenResponse, TokenScopes, TokenStatus, TokenValidation};

use crate::config::{Credentials, MarketingConfig};
use crate::errors::{MarketingError, MarketingResult};
use crate::resilience::RetryManager;
use crate::transport::{send_with_timeout, HttpRequest, HttpResponse, HttpTransport};
use bytes::Bytes;
use chrono::Utc;
use http::header::{HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, Method};
use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Token lifetime handling
#[derive(Debug, Clone, PartialEq)]
pub struct TokenManagerConfig {
    /// Remaining lifetime below which a token is refreshed before use
    pub refresh_margin: Duration,
}

impl Default for TokenManagerConfig {
    fn default() -> Self {
        Self {
            refresh_margin: Duration::from_secs(300),
        }
    }
}

impl TokenManagerConfig {
    /// Set the refresh margin
    pub fn refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }
}

#[derive(Default)]
struct TokenState {
    token: Option<AccessToken>,
    revoked: bool,
    generation: u64,
}

/// Obtains, caches and refreshes the access token of one client
pub struct TokenManager {
    credentials: Credentials,
    token_url: String,
    user_agent: String,
    timeout: Duration,
    config: TokenManagerConfig,
    transport: Arc<dyn HttpTransport>,
    retry: Arc<RetryManager>,
    state: RwLock<TokenState>,
    refresh_lock: tokio::sync::Mutex<()>,
    auth_calls: AtomicU64,
}

impl TokenManager {
    /// Create a token manager for the given configuration
    pub fn new(config: &MarketingConfig, transport: Arc<dyn HttpTransport>, retry: Arc<RetryManager>) -> Self {
        Self {
            credentials: config.credentials().clone(),
            token_url: config.token_url(),
            user_agent: config.user_agent.clone(),
            timeout: config.timeout,
            config: config.token.clone(),
            transport,
            retry,
            state: RwLock::new(TokenState::default()),
            refresh_lock: tokio::sync::Mutex::new(()),
            auth_calls: AtomicU64::new(0),
        }
    }

    /// Return a token that is valid for use, authenticating or refreshing first if needed
    pub async fn ensure_valid_token(&self) -> MarketingResult<AccessToken> {
        self.acquire().await.map(|(token, _)| token)
    }

    /// Like [`TokenManager::ensure_valid_token`], also returning the token generation
    pub(crate) async fn acquire(&self) -> MarketingResult<(AccessToken, u64)> {
        if let Some(found) = self.usable() {
            return Ok(found);
        }

        let _guard = self.refresh_lock.lock().await;
        if let Some(found) = self.usable() {
            debug!("Token renewed by a concurrent caller");
            return Ok(found);
        }

        self.renew().await
    }

    /// Refresh after the API rejected the token of `generation`.
    ///
    /// If a newer token was issued in the meantime it is returned as is.
    pub(crate) async fn refresh_after_rejection(&self, generation: u64) -> MarketingResult<AccessToken> {
        let _guard = self.refresh_lock.lock().await;
        if self.state.read().generation != generation {
            if let Some((token, _)) = self.usable() {
                return Ok(token);
            }
        }

        self.invalidate();
        self.renew().await.map(|(token, _)| token)
    }

    /// Refresh unconditionally, reporting expiry before and after.
    ///
    /// Concurrent calls share one refresh.
    #[instrument(skip(self))]
    pub async fn force_refresh_token(&self) -> MarketingResult<RefreshOutcome> {
        let (previous_expires_at, observed) = {
            let state = self.state.read();
            (state.token.as_ref().and_then(|t| t.expires_at), state.generation)
        };

        let _guard = self.refresh_lock.lock().await;
        let joined = {
            let state = self.state.read();
            if state.generation != observed && !state.revoked {
                state.token.clone()
            } else {
                None
            }
        };

        let (token, coalesced) = match joined {
            Some(token) => (token, true),
            None => (self.renew().await?.0, false),
        };

        Ok(RefreshOutcome {
            previous_expires_at,
            new_expires_at: token.expires_at,
            coalesced,
        })
    }

    /// Discard the current access token; the refresh credential is kept
    pub fn invalidate(&self) {
        let mut state = self.state.write();
        if state.token.is_some() {
            debug!("Access token invalidated");
        }
        state.revoked = true;
    }

    /// Lifetime report for the current token
    pub fn get_token_status(&self) -> TokenStatus {
        let state = self.state.read();
        match &state.token {
            Some(token) => {
                let mut status = token.status_at(Utc::now(), self.config.refresh_margin);
                if state.revoked {
                    status.needs_refresh = true;
                }
                status
            }
            None => TokenStatus::missing(),
        }
    }

    /// Accounts and permissions of the current token
    pub fn get_token_scopes(&self) -> TokenScopes {
        self.state
            .read()
            .token
            .as_ref()
            .map(AccessToken::scopes)
            .unwrap_or_default()
    }

    /// Obtain a token and report whether the credentials work.
    ///
    /// Rejected credentials yield `valid: false`; other failures are errors.
    pub async fn validate_token(&self) -> MarketingResult<TokenValidation> {
        match self.ensure_valid_token().await {
            Ok(token) => Ok(TokenValidation {
                valid: true,
                expires_in_seconds: token.expires_in_at(Utc::now()).map(|d| d.num_seconds()),
                account_ids: token.account_ids.clone(),
                error: None,
            }),
            Err(err) if matches!(err.root(), MarketingError::Authentication { .. }) => {
                Ok(TokenValidation {
                    valid: false,
                    expires_in_seconds: None,
                    account_ids: Vec::new(),
                    error: Some(err.message()),
                })
            }
            Err(err) => Err(err),
        }
    }

    /// First account attached to the current token
    pub fn current_account_id(&self) -> Option<String> {
        self.state
            .read()
            .token
            .as_ref()
            .and_then(|t| t.account_ids.first().cloned())
    }

    /// Number of calls made to the token endpoint
    pub fn authentication_count(&self) -> u64 {
        self.auth_calls.load(Ordering::SeqCst)
    }

    fn usable(&self) -> Option<(AccessToken, u64)> {
        let state = self.state.read();
        let token = state.token.as_ref()?;
        if state.revoked || token.needs_refresh_at(Utc::now(), self.config.refresh_margin) {
            return None;
        }
        Some((token.clone(), state.generation))
    }

    /// Obtain a new token. Callers must hold `refresh_lock`.
    async fn renew(&self) -> MarketingResult<(AccessToken, u64)> {
        let previous_refresh = self
            .state
            .read()
            .token
            .as_ref()
            .and_then(|t| t.refresh_token.clone());

        let mut token = match &self.credentials {
            Credentials::ApiKey(key) => AccessToken::from_api_key(key, Utc::now()),
            Credentials::Password { username, password } => {
                let refreshed = match &previous_refresh {
                    Some(refresh_token) => match self.refresh_grant(refresh_token).await {
                        Ok(token) => Some(token),
                        Err(err) if matches!(err.root(), MarketingError::Authentication { .. }) => {
                            warn!(error = %err, "Refresh token rejected, re-authenticating");
                            None
                        }
                        Err(err) => return Err(err),
                    },
                    None => None,
                };
                match refreshed {
                    Some(token) => token,
                    None => self.password_grant(username, password).await?,
                }
            }
        };

        if token.refresh_token.is_none() {
            token.refresh_token = previous_refresh;
        }

        let generation = {
            let mut state = self.state.write();
            state.token = Some(token.clone());
            state.revoked = false;
            state.generation += 1;
            state.generation
        };

        info!(
            expires_at = ?token.expires_at,
            accounts = token.account_ids.len(),
            generation,
            "Access token renewed"
        );
        Ok((token, generation))
    }

    async fn password_grant(&self, username: &str, password: &SecretString) -> MarketingResult<AccessToken> {
        let body = serde_json::json!({
            "grant_type": "password",
            "username": username,
            "password": password.expose_secret(),
        });
        self.request_token("password", body).await
    }

    async fn refresh_grant(&self, refresh_token: &SecretString) -> MarketingResult<AccessToken> {
        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token.expose_secret(),
        });
        self.request_token("refresh_token", body).await
    }

    async fn request_token(&self, grant: &'static str, body: serde_json::Value) -> MarketingResult<AccessToken> {
        let payload = Bytes::from(serde_json::to_vec(&body)?);
        let headers = self.token_headers();
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        debug!(grant, url = %self.token_url, "Requesting access token");

        let response = self
            .retry
            .execute_with_retry("token", || {
                let request = HttpRequest::new(Method::POST, self.token_url.clone(), headers.clone())
                    .with_body(payload.clone());
                async move {
                    let response = send_with_timeout(self.transport.as_ref(), request, self.timeout).await?;
                    token_error_for_status(response)
                }
            })
            .await?;

        let parsed: TokenResponse =
            serde_json::from_slice(&response.body).map_err(|e| MarketingError::Response {
                message: format!("invalid token response: {}", e),
                body: Some(String::from_utf8_lossy(&response.body).to_string()),
            })?;

        Ok(AccessToken::from_response(parsed, Utc::now()))
    }

    fn token_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Ok(agent) = HeaderValue::from_str(&self.user_agent) {
            headers.insert(USER_AGENT, agent);
        }
        headers
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("credentials", &self.credentials)
            .field("token_url", &self.token_url)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Credential rejections from the token endpoint are authentication failures
fn token_error_for_status(response: HttpResponse) -> MarketingResult<HttpResponse> {
    match response.status {
        200..=299 => Ok(response),
        400 | 401 | 403 => {
            let err = MarketingError::from_response(response.status, &response.headers, &response.body);
            Err(MarketingError::Authentication {
                message: err.message(),
                status_code: Some(response.status),
            })
        }
        _ => Err(MarketingError::from_response(response.status, &response.headers, &response.body)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockHttpTransport, MockResponse};
    use crate::resilience::RetryConfig;
    use serde_json::json;

    const TOKEN_ROUTE: &str = "oauth/token";

    fn manager(transport: Arc<MockHttpTransport>, credentials: Credentials) -> TokenManager {
        let config = MarketingConfig::builder()
            .base_url("https://api.mailer.test/v3")
            .unwrap()
            .credentials(credentials)
            .build()
            .unwrap();
        let retry = Arc::new(RetryManager::new(
            RetryConfig::new().max_retries(2).base_delay(Duration::from_millis(10)).jitter(false),
        ));
        TokenManager::new(&config, transport, retry)
    }

    fn password() -> Credentials {
        Credentials::password("ops@example.com", "hunter2")
    }

    #[tokio::test]
    async fn test_password_grant_on_first_use() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default(
            TOKEN_ROUTE,
            MockResponse::json(200, json!({
                "access_token": "tok-1",
                "expires_in": 3600,
                "refresh_token": "ref-1",
                "accounts": ["77"]
            })),
        );
        let tokens = manager(transport.clone(), password());

        let token = tokens.ensure_valid_token().await.unwrap();

        assert_eq!(token.authorization(), "Bearer tok-1");
        assert_eq!(tokens.current_account_id().as_deref(), Some("77"));
        let requests = transport.requests_matching(TOKEN_ROUTE);
        assert_eq!(requests.len(), 1);
        let body = crate::mocks::json_body(&requests[0]).unwrap();
        assert_eq!(body["grant_type"], "password");
        assert_eq!(body["username"], "ops@example.com");
    }

    #[tokio::test]
    async fn test_cached_token_is_reused() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default(TOKEN_ROUTE, MockResponse::token("tok-1", 3600));
        let tokens = manager(transport.clone(), password());

        tokens.ensure_valid_token().await.unwrap();
        tokens.ensure_valid_token().await.unwrap();

        assert_eq!(tokens.authentication_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_authentication() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default(
            TOKEN_ROUTE,
            MockResponse::token("tok-1", 3600).with_delay(Duration::from_millis(50)),
        );
        let tokens = manager(transport.clone(), password());

        let (a, b) = tokio::join!(tokens.ensure_valid_token(), tokens.ensure_valid_token());

        assert!(a.is_ok() && b.is_ok());
        assert_eq!(tokens.authentication_count(), 1);
        assert_eq!(transport.request_count(TOKEN_ROUTE), 1);
    }

    #[tokio::test]
    async fn test_bad_credentials_are_not_retried() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default(
            TOKEN_ROUTE,
            MockResponse::json(401, json!({"error": "invalid_grant", "error_description": "Bad password"})),
        );
        let tokens = manager(transport.clone(), password());

        let err = tokens.ensure_valid_token().await.unwrap_err();

        assert!(matches!(err, MarketingError::Authentication { status_code: Some(401), .. }));
        assert_eq!(err.message(), "Bad password");
        assert_eq!(transport.request_count(TOKEN_ROUTE), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_during_authentication_are_retried() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.enqueue(TOKEN_ROUTE, MockResponse::text(503, "maintenance"));
        transport.enqueue(TOKEN_ROUTE, MockResponse::token("tok-2", 3600));
        let tokens = manager(transport.clone(), password());

        tokens.ensure_valid_token().await.unwrap();

        assert_eq!(transport.request_count(TOKEN_ROUTE), 2);
        assert_eq!(tokens.authentication_count(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_uses_refresh_grant() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.enqueue(
            TOKEN_ROUTE,
            MockResponse::json(200, json!({"access_token": "tok-1", "expires_in": 600, "refresh_token": "ref-1"})),
        );
        transport.enqueue(
            TOKEN_ROUTE,
            MockResponse::json(200, json!({"access_token": "tok-2", "expires_in": 3600})),
        );
        let tokens = manager(transport.clone(), password());
        tokens.ensure_valid_token().await.unwrap();

        let outcome = tokens.force_refresh_token().await.unwrap();

        assert!(!outcome.coalesced);
        assert!(outcome.new_expires_at > outcome.previous_expires_at);
        let requests = transport.requests_matching(TOKEN_ROUTE);
        let body = crate::mocks::json_body(&requests[1]).unwrap();
        assert_eq!(body["grant_type"], "refresh_token");
        assert_eq!(body["refresh_token"], "ref-1");
        assert!(tokens.get_token_status().has_refresh_token);
    }

    #[tokio::test]
    async fn test_rejected_refresh_falls_back_to_password() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.enqueue(
            TOKEN_ROUTE,
            MockResponse::json(200, json!({"access_token": "tok-1", "expires_in": 600, "refresh_token": "stale"})),
        );
        transport.enqueue(TOKEN_ROUTE, MockResponse::json(400, json!({"error": "invalid_grant"})));
        transport.enqueue(TOKEN_ROUTE, MockResponse::token("tok-3", 3600));
        let tokens = manager(transport.clone(), password());
        tokens.ensure_valid_token().await.unwrap();

        tokens.force_refresh_token().await.unwrap();

        let requests = transport.requests_matching(TOKEN_ROUTE);
        assert_eq!(requests.len(), 3);
        assert_eq!(crate::mocks::json_body(&requests[2]).unwrap()["grant_type"], "password");
        assert_eq!(tokens.ensure_valid_token().await.unwrap().authorization(), "Bearer tok-3");
    }

    #[tokio::test]
    async fn test_api_key_needs_no_endpoint() {
        let transport = Arc::new(MockHttpTransport::new());
        let tokens = manager(transport.clone(), Credentials::api_key("key-9"));

        let token = tokens.ensure_valid_token().await.unwrap();
        let outcome = tokens.force_refresh_token().await.unwrap();

        assert_eq!(token.authorization(), "Bearer key-9");
        assert_eq!(outcome.previous_expires_at, None);
        assert_eq!(outcome.new_expires_at, None);
        assert_eq!(tokens.authentication_count(), 0);
        assert!(transport.requests().is_empty());
    }

    #[tokio::test]
    async fn test_validate_reports_rejection() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default(TOKEN_ROUTE, MockResponse::json(403, json!({"message": "Account suspended"})));
        let tokens = manager(transport, password());

        let validation = tokens.validate_token().await.unwrap();

        assert!(!validation.valid);
        assert_eq!(validation.error.as_deref(), Some("Account suspended"));
    }

    #[tokio::test]
    async fn test_invalidate_forces_renewal() {
        let transport = Arc::new(MockHttpTransport::new());
        transport.set_default(TOKEN_ROUTE, MockResponse::token("tok-1", 3600));
        let tokens = manager(transport.clone(), password());
        tokens.ensure_valid_token().await.unwrap();

        tokens.invalidate();
        assert!(tokens.get_token_status().needs_refresh);
        tokens.ensure_valid_token().await.unwrap();

        assert_eq!(tokens.authentication_count(), 2);
    }

    #[test]
    fn test_status_without_token() {
        let tokens = manager(Arc::new(MockHttpTransport::new()), password());
        let status = tokens.get_token_status();

        assert!(!status.has_token);
        assert!(tokens.get_token_scopes().account_ids.is_empty());
    }

    #[tokio::test]
    async fn test_expired_token_renewed_once_for_concurrent_callers() {
        let transport = Arc::new(MockHttpTransport::new());
        transport
            .enqueue(
                TOKEN_ROUTE,
                MockResponse::json(200, json!({
                    "access_token": "tok-1",
                    "expires_in": 0,
                    "refresh_token": "ref-1"
                })),
            )
            .enqueue(
                TOKEN_ROUTE,
                MockResponse::token("tok-2", 3600).with_delay(Duration::from_millis(50)),
            );
        let tokens = manager(transport.clone(), password());

        tokens.ensure_valid_token().await.unwrap();
        let status = tokens.get_token_status();
        assert!(status.is_expired);
        assert!(status.needs_refresh);

        let results =
            futures::future::join_all((0..5).map(|_| tokens.ensure_valid_token())).await;

        for result in &results {
            assert_eq!(result.as_ref().unwrap().authorization(), "Bearer tok-2");
        }
        assert_eq!(tokens.authentication_count(), 2);
        let requests = transport.requests_matching(TOKEN_ROUTE);
        assert_eq!(requests.len(), 2);
        let body = crate::mocks::json_body(&requests[1]).unwrap();
        assert_eq!(body["grant_type"], "refresh_token");
        assert_eq!(body["refresh_token"], "ref-1");
    }
}
