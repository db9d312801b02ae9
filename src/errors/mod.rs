//! Error types for the email-marketing client.
//!
//! Every failure surfaced by the request pipeline is a [`MarketingError`].
//! HTTP failures keep the status code and the server's own message so the
//! tool layer can tell configuration mistakes apart from transient platform
//! trouble.

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for client operations
pub type MarketingResult<T> = Result<T, MarketingError>;

/// Root error type for the client
#[derive(Error, Debug)]
pub enum MarketingError {
    /// Invalid or missing configuration
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Credentials rejected or token no longer accepted
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Message reported by the server (or a local description)
        message: String,
        /// HTTP status that produced the failure, if any
        status_code: Option<u16>,
    },

    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// HTTP 429
    #[error("Rate limit exceeded: {message}")]
    RateLimit {
        /// Message reported by the server
        message: String,
        /// Server-provided wait, from `Retry-After`
        retry_after: Option<Duration>,
        /// Raw response body
        body: Option<String>,
    },

    /// HTTP 5xx
    #[error("Server error (HTTP {status}): {message}")]
    Server {
        /// HTTP status code
        status: u16,
        /// Message reported by the server
        message: String,
        /// Raw response body
        body: Option<String>,
    },

    /// HTTP 4xx other than 401 and 429
    #[error("Client error (HTTP {status}): {message}")]
    Client {
        /// HTTP status code
        status: u16,
        /// Message reported by the server
        message: String,
        /// Raw response body
        body: Option<String>,
    },

    /// The circuit breaker rejected the call without attempting it
    #[error("Circuit breaker open: service temporarily unavailable")]
    CircuitOpen {
        /// Time left until the breaker lets a trial request through
        retry_in: Option<Duration>,
    },

    /// The request queue was shut down before the call was admitted
    #[error("Request queue is closed")]
    QueueClosed,

    /// A single network attempt exceeded its deadline
    #[error("Request timed out: {message}")]
    Timeout {
        /// Description of the timeout
        message: String,
    },

    /// The response body could not be decoded
    #[error("Response error: {message}")]
    Response {
        /// Decoder message
        message: String,
        /// Raw response body
        body: Option<String>,
    },

    /// Surface that exists in the tool catalogue but has no backing behaviour
    #[error("{operation} is not implemented")]
    NotImplemented {
        /// Name of the unimplemented operation
        operation: String,
    },

    /// A retryable failure persisted through the whole retry budget
    #[error("{source} (Failed after {attempts} attempts)")]
    RetriesExhausted {
        /// Total number of attempts made
        attempts: u32,
        /// The last error observed
        #[source]
        source: Box<MarketingError>,
    },
}

impl MarketingError {
    /// Stable machine-readable code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "MARKETING_CONFIG",
            Self::Authentication { .. } => "MARKETING_AUTH",
            Self::Network(_) => "MARKETING_NETWORK",
            Self::RateLimit { .. } => "MARKETING_RATE_LIMIT",
            Self::Server { .. } => "MARKETING_SERVER",
            Self::Client { .. } => "MARKETING_CLIENT",
            Self::CircuitOpen { .. } => "MARKETING_CIRCUIT_OPEN",
            Self::QueueClosed => "MARKETING_QUEUE_CLOSED",
            Self::Timeout { .. } => "MARKETING_TIMEOUT",
            Self::Response { .. } => "MARKETING_RESPONSE",
            Self::NotImplemented { .. } => "MARKETING_NOT_IMPLEMENTED",
            Self::RetriesExhausted { source, .. } => source.error_code(),
        }
    }

    /// HTTP status code carried by this error, if it came from a response
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Authentication { status_code, .. } => *status_code,
            Self::RateLimit { .. } => Some(429),
            Self::Server { status, .. } | Self::Client { status, .. } => Some(*status),
            Self::RetriesExhausted { source, .. } => source.status_code(),
            _ => None,
        }
    }

    /// The original message, without the variant prefix
    pub fn message(&self) -> String {
        match self {
            Self::Authentication { message, .. }
            | Self::RateLimit { message, .. }
            | Self::Server { message, .. }
            | Self::Client { message, .. }
            | Self::Timeout { message }
            | Self::Response { message, .. } => message.clone(),
            Self::Network(err) => err.message.clone(),
            Self::RetriesExhausted { source, .. } => source.message(),
            other => other.to_string(),
        }
    }

    /// Raw response body, if one was received
    pub fn body(&self) -> Option<&str> {
        match self {
            Self::RateLimit { body, .. }
            | Self::Server { body, .. }
            | Self::Client { body, .. }
            | Self::Response { body, .. } => body.as_deref(),
            Self::RetriesExhausted { source, .. } => source.body(),
            _ => None,
        }
    }

    /// Connection-level kind, used to match the retryable kinds set
    pub fn network_kind(&self) -> Option<NetworkErrorKind> {
        match self {
            Self::Network(err) => Some(err.kind),
            Self::Timeout { .. } => Some(NetworkErrorKind::Timeout),
            _ => None,
        }
    }

    /// Server-provided retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// True for a 401-class rejection of the access token
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Authentication { status_code: Some(401), .. })
    }

    /// True if the failure indicates distress on the remote side and should
    /// count towards opening the circuit
    pub fn trips_circuit(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout { .. } | Self::RateLimit { .. } | Self::Server { .. } => {
                true
            }
            Self::RetriesExhausted { source, .. } => source.trips_circuit(),
            _ => false,
        }
    }

    /// Unwraps retry exhaustion to the last underlying error
    pub fn root(&self) -> &MarketingError {
        match self {
            Self::RetriesExhausted { source, .. } => source.root(),
            other => other,
        }
    }

    /// Builds a local authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            status_code: None,
        }
    }

    /// Synthesizes a typed error from a non-success HTTP response
    pub fn from_response(status: u16, headers: &HeaderMap, body: &[u8]) -> Self {
        let raw = String::from_utf8_lossy(body).to_string();
        let message = extract_error_message(body).unwrap_or_else(|| {
            if raw.trim().is_empty() {
                format!("HTTP {} error", status)
            } else {
                raw.clone()
            }
        });
        let body = if raw.is_empty() { None } else { Some(raw) };

        match status {
            401 => Self::Authentication {
                message,
                status_code: Some(status),
            },
            429 => Self::RateLimit {
                message,
                retry_after: parse_retry_after(headers),
                body,
            },
            500..=599 => Self::Server {
                status,
                message,
                body,
            },
            _ => Self::Client {
                status,
                message,
                body,
            },
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// Neither username/password nor API key supplied
    #[error("Credentials are missing: provide a username and password or an API key")]
    MissingCredentials,

    /// No base URL configured
    #[error("Base URL is missing")]
    MissingBaseUrl,

    /// Base URL failed to parse or uses an unsupported scheme
    #[error("Invalid base URL: {message}")]
    InvalidBaseUrl {
        /// Parser message
        message: String,
    },

    /// A header name or value could not be encoded
    #[error("Invalid header {name}")]
    InvalidHeader {
        /// Offending header name
        name: String,
    },

    /// A configuration value is out of range
    #[error("Invalid value for {field}: {message}")]
    InvalidValue {
        /// Field name
        field: String,
        /// What is wrong with it
        message: String,
    },

    /// Override document could not be parsed
    #[error("Invalid configuration overrides: {0}")]
    InvalidOverrides(String),
}

/// Connection-level failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkErrorKind {
    /// Peer reset the connection
    ConnectionReset,
    /// Peer refused the connection
    ConnectionRefused,
    /// Connection aborted locally or by an intermediary
    ConnectionAborted,
    /// Name resolution failed
    DnsFailure,
    /// No response within the deadline
    Timeout,
    /// TLS handshake or certificate failure
    Tls,
    /// Anything else reported by the HTTP stack
    Other,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ConnectionReset => "connection reset",
            Self::ConnectionRefused => "connection refused",
            Self::ConnectionAborted => "connection aborted",
            Self::DnsFailure => "DNS resolution failed",
            Self::Timeout => "timed out",
            Self::Tls => "TLS failure",
            Self::Other => "transport failure",
        };
        f.write_str(name)
    }
}

/// Network error with its classified kind
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message}")]
pub struct NetworkError {
    /// Failure class
    pub kind: NetworkErrorKind,
    /// Message from the HTTP stack
    pub message: String,
}

impl NetworkError {
    /// Create a network error of the given kind
    pub fn new(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<reqwest::Error> for MarketingError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return MarketingError::Timeout {
                message: err.to_string(),
            };
        }
        MarketingError::Network(NetworkError::new(classify_source_chain(&err), err.to_string()))
    }
}

impl From<serde_json::Error> for MarketingError {
    fn from(err: serde_json::Error) -> Self {
        MarketingError::Response {
            message: err.to_string(),
            body: None,
        }
    }
}

/// Walks the error source chain looking for an I/O kind or a resolver hint
fn classify_source_chain(err: &(dyn std::error::Error + 'static)) -> NetworkErrorKind {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionReset => return NetworkErrorKind::ConnectionReset,
                std::io::ErrorKind::ConnectionRefused => return NetworkErrorKind::ConnectionRefused,
                std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::BrokenPipe => {
                    return NetworkErrorKind::ConnectionAborted
                }
                std::io::ErrorKind::TimedOut => return NetworkErrorKind::Timeout,
                _ => {}
            }
        }
        let text = e.to_string().to_lowercase();
        if text.contains("dns") || text.contains("failed to lookup address") {
            return NetworkErrorKind::DnsFailure;
        }
        if text.contains("certificate") || text.contains("tls") {
            return NetworkErrorKind::Tls;
        }
        current = e.source();
    }
    NetworkErrorKind::Other
}

/// Pulls a human-readable message out of a JSON error body
fn extract_error_message(body: &[u8]) -> Option<String> {
    let json: serde_json::Value = serde_json::from_slice(body).ok()?;
    let candidates = ["/message", "/error_description", "/error/message", "/error", "/errors/0/message"];
    candidates
        .iter()
        .filter_map(|pointer| json.pointer(pointer))
        .find_map(|v| v.as_str().map(str::to_string))
}

/// Parses `Retry-After` as delta-seconds or an HTTP date
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(http::header::RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = date.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.to_std().unwrap_or(Duration::ZERO))
}
