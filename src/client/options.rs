//! Per-request options.

use http::Method;
use serde::Serialize;
use serde_json::Value;

/// Method, body, query and scoping for one call to [`super::MarketingClient::make_request`]
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// HTTP method
    pub method: Method,
    /// JSON body
    pub body: Option<Value>,
    /// Query parameters, appended in order
    pub query: Vec<(String, String)>,
    /// Extra headers for this request
    pub headers: Vec<(String, String)>,
    /// Account to act on; overrides the current account
    pub account_id: Option<String>,
    /// Attach the current account when no explicit one is given
    pub account_scoped: bool,
    /// Why the body given to [`RequestOptions::body`] could not be encoded
    pub(crate) body_error: Option<String>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            body: None,
            query: Vec::new(),
            headers: Vec::new(),
            account_id: None,
            account_scoped: false,
            body_error: None,
        }
    }
}

impl RequestOptions {
    /// GET request
    pub fn get() -> Self {
        Self::default()
    }

    /// POST with a JSON body
    pub fn post(body: impl Serialize) -> Self {
        Self::with_method(Method::POST).body(body)
    }

    /// PUT with a JSON body
    pub fn put(body: impl Serialize) -> Self {
        Self::with_method(Method::PUT).body(body)
    }

    /// PATCH with a JSON body
    pub fn patch(body: impl Serialize) -> Self {
        Self::with_method(Method::PATCH).body(body)
    }

    /// DELETE request
    pub fn delete() -> Self {
        Self::with_method(Method::DELETE)
    }

    /// Request with the given method and no body
    pub fn with_method(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    /// Set the JSON body.
    ///
    /// A body that fails to encode is kept as an error and makes the call fail
    /// before anything is sent.
    pub fn body(mut self, body: impl Serialize) -> Self {
        match serde_json::to_value(body) {
            Ok(value) => {
                self.body = Some(value);
                self.body_error = None;
            }
            Err(e) => {
                self.body = None;
                self.body_error = Some(e.to_string());
            }
        }
        self
    }

    /// Append a query parameter
    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    /// Append a query parameter when a value is present
    pub fn query_opt(self, name: impl Into<String>, value: Option<impl ToString>) -> Self {
        match value {
            Some(value) => self.query(name, value),
            None => self,
        }
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Act on a specific account
    pub fn account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self.account_scoped = true;
        self
    }

    /// Act on the current account
    pub fn account_scoped(mut self) -> Self {
        self.account_scoped = true;
        self
    }
}
