//! Mock implementations for testing.
//!
//! [`MockHttpTransport`] serves scripted responses per URL route and
//! records every request it receives.

use crate::errors::{MarketingError, MarketingResult, NetworkError, NetworkErrorKind};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use async_trait::async_trait;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::HeaderMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

/// Mock response configuration
#[derive(Debug, Clone)]
pub struct MockResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Bytes,
    /// Delay before responding
    pub delay: Option<Duration>,
    /// Connection failure to return instead of a response
    pub failure: Option<NetworkErrorKind>,
}

impl MockResponse {
    /// Response with a JSON body
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(body.to_string()),
            delay: None,
            failure: None,
        }
    }

    /// 200 with a JSON body
    pub fn ok(body: serde_json::Value) -> Self {
        Self::json(200, body)
    }

    /// Response with a raw text body
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::copy_from_slice(body.as_bytes()),
            delay: None,
            failure: None,
        }
    }

    /// Response without a body
    pub fn empty(status: u16) -> Self {
        Self::text(status, "")
    }

    /// Token endpoint success
    pub fn token(access_token: &str, expires_in: u64) -> Self {
        Self::ok(serde_json::json!({
            "access_token": access_token,
            "token_type": "Bearer",
            "expires_in": expires_in,
        }))
    }

    /// Connection failure of the given kind
    pub fn network_error(kind: NetworkErrorKind) -> Self {
        Self {
            status: 0,
            headers: Vec::new(),
            body: Bytes::new(),
            delay: None,
            failure: Some(kind),
        }
    }

    /// Add a response header
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Delay the response
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn into_result(self) -> MarketingResult<HttpResponse> {
        if let Some(kind) = self.failure {
            return Err(MarketingError::Network(NetworkError::new(kind, "mock connection failure")));
        }
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                headers.append(name, value);
            }
        }
        Ok(HttpResponse {
            status: self.status,
            headers,
            body: self.body,
        })
    }
}

#[derive(Debug)]
struct Route {
    pattern: String,
    queue: VecDeque<MockResponse>,
    fallback: Option<MockResponse>,
}

impl Route {
    fn next(&mut self) -> Option<MockResponse> {
        self.queue.pop_front().or_else(|| self.fallback.clone())
    }

    fn has_response(&self) -> bool {
        !self.queue.is_empty() || self.fallback.is_some()
    }
}

/// Mock HTTP transport for testing
#[derive(Debug, Default)]
pub struct MockHttpTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttpTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot response for URLs containing `pattern`
    pub fn enqueue(&self, pattern: &str, response: MockResponse) -> &Self {
        self.with_route(pattern, |route| route.queue.push_back(response));
        self
    }

    /// Response served for `pattern` once its queue is empty
    pub fn set_default(&self, pattern: &str, response: MockResponse) -> &Self {
        self.with_route(pattern, |route| route.fallback = Some(response));
        self
    }

    /// All recorded requests
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Recorded requests whose URL contains `pattern`
    pub fn requests_matching(&self, pattern: &str) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.contains(pattern))
            .cloned()
            .collect()
    }

    /// Number of recorded requests whose URL contains `pattern`
    pub fn request_count(&self, pattern: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url.contains(pattern))
            .count()
    }

    /// Forget recorded requests
    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    fn with_route(&self, pattern: &str, apply: impl FnOnce(&mut Route)) {
        let mut routes = self.routes.lock();
        if let Some(route) = routes.iter_mut().find(|r| r.pattern == pattern) {
            apply(route);
            return;
        }
        let mut route = Route {
            pattern: pattern.to_string(),
            queue: VecDeque::new(),
            fallback: None,
        };
        apply(&mut route);
        routes.push(route);
    }

    /// Longest matching pattern with something to serve wins
    fn next_response(&self, url: &str) -> Option<MockResponse> {
        let mut routes = self.routes.lock();
        routes
            .iter_mut()
            .filter(|r| url.contains(&r.pattern) && r.has_response())
            .max_by_key(|r| r.pattern.len())
            .and_then(Route::next)
    }
}

#[async_trait]
impl HttpTransport for MockHttpTransport {
    async fn send(&self, request: HttpRequest) -> MarketingResult<HttpResponse> {
        let response = self.next_response(&request.url);
        self.requests.lock().push(request);

        let response = response.unwrap_or_else(|| {
            MockResponse::json(404, serde_json::json!({"message": "no mock response configured"}))
        });
        if let Some(delay) = response.delay {
            tokio::time::sleep(delay).await;
        }
        response.into_result()
    }
}

/// Parse a recorded request body as JSON
pub fn json_body(request: &HttpRequest) -> Option<serde_json::Value> {
    request
        .body
        .as_ref()
        .and_then(|body| serde_json::from_slice(body).ok())
}

/// Value of a recorded request header
pub fn header<'a>(request: &'a HttpRequest, name: &str) -> Option<&'a str> {
    request.headers.get(name).and_then(|v| v.to_str().ok())
}
