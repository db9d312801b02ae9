//! HTTP transport layer.
//!
//! The transport only moves bytes: any HTTP status comes back as an
//! [`HttpResponse`], and the client decides what counts as a failure.

use crate::errors::{MarketingError, MarketingResult, NetworkError, NetworkErrorKind};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use reqwest::{Client, ClientBuilder};
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// HTTP transport trait for making API requests
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Send a request and return the raw response, whatever its status
    async fn send(&self, request: HttpRequest) -> MarketingResult<HttpResponse>;
}

/// Outbound request
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute URL
    pub url: String,
    /// Request headers
    pub headers: HeaderMap,
    /// Encoded body
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// Create a request without a body
    pub fn new(method: Method, url: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method,
            url: url.into(),
            headers,
            body: None,
        }
    }

    /// Attach an encoded body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// Raw response
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

impl HttpResponse {
    /// True for 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Turns a non-2xx response into its typed error
    pub fn error_for_status(self) -> MarketingResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(MarketingError::from_response(self.status, &self.headers, &self.body))
        }
    }
}

/// Sends one attempt, failing with [`MarketingError::Timeout`] past `timeout`
pub async fn send_with_timeout(
    transport: &dyn HttpTransport,
    request: HttpRequest,
    timeout: Duration,
) -> MarketingResult<HttpResponse> {
    let url = request.url.clone();
    match tokio::time::timeout(timeout, transport.send(request)).await {
        Ok(result) => result,
        Err(_) => {
            warn!(url = %url, timeout_ms = timeout.as_millis() as u64, "Request timed out");
            Err(MarketingError::Timeout {
                message: format!("no response within {}ms", timeout.as_millis()),
            })
        }
    }
}

/// Default HTTP transport implementation using reqwest
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    /// Create a new transport with the given timeout
    pub fn new(timeout: Duration) -> MarketingResult<Self> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .connect_timeout(timeout)
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| MarketingError::Network(NetworkError::new(NetworkErrorKind::Other, e.to_string())))?;

        Ok(Self { client })
    }

    /// Create a new transport with a pre-built client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl std::fmt::Debug for ReqwestTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqwestTransport").finish_non_exhaustive()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    #[instrument(skip(self, request), fields(method = %request.method, url = %request.url))]
    async fn send(&self, request: HttpRequest) -> MarketingResult<HttpResponse> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);

        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        debug!(status, bytes = body.len(), "Received response");

        Ok(HttpResponse { status, headers, body })
    }
}
