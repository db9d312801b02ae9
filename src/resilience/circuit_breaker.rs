//! Circuit breaker for fail-fast behavior while the platform is unhealthy.

use crate::errors::{MarketingError, MarketingResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing, rejecting requests
    Open,
    /// Testing with a single request
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a trial request
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create new config
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure threshold
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    /// Set reset timeout
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }
}

/// Point-in-time view of the breaker for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerSnapshot {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures counted so far
    pub failure_count: u32,
    /// Threshold that opens the circuit
    pub failure_threshold: u32,
    /// Wall-clock time of the most recent counted failure
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Milliseconds until a trial request is allowed, when open
    pub retry_in_ms: Option<u64>,
    /// Calls admitted since creation
    pub total_calls: u64,
    /// Calls rejected without being attempted
    pub total_rejections: u64,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    last_failure_time: Option<DateTime<Utc>>,
    trial: Option<u64>,
    next_trial_id: u64,
}

enum Admission {
    Normal,
    Trial(u64),
}

/// Circuit breaker shared by every request of one client
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    total_calls: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                last_failure_time: None,
                trial: None,
                next_trial_id: 0,
            }),
            total_calls: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Configuration in effect
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, moving an expired open circuit to half-open
    pub fn get_state(&self) -> CircuitState {
        let mut inner = self.state.lock();
        self.maybe_half_open(&mut inner, Instant::now());
        inner.state
    }

    /// Diagnostic snapshot
    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let mut inner = self.state.lock();
        self.maybe_half_open(&mut inner, now);
        let retry_in = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) => {
                Some(self.config.reset_timeout.saturating_sub(now.duration_since(opened)))
            }
            _ => None,
        };
        CircuitBreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            failure_threshold: self.config.failure_threshold,
            last_failure_time: inner.last_failure_time,
            retry_in_ms: retry_in.map(|d| d.as_millis() as u64),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Force the breaker back to closed with a clean failure count
    pub fn reset(&self) {
        let mut inner = self.state.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial = None;
        info!("Circuit breaker reset");
    }

    /// Run `operation` under the breaker.
    ///
    /// Rejected calls fail with [`MarketingError::CircuitOpen`] and never run.
    /// While half-open exactly one call is let through as the trial.
    pub async fn execute<F, Fut, T>(&self, context: &str, operation: F) -> MarketingResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MarketingResult<T>>,
    {
        let admission = self.admit(context)?;
        let _trial = match admission {
            Admission::Trial(id) => Some(TrialGuard { breaker: self, id }),
            Admission::Normal => None,
        };

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(err) if err.trips_circuit() => self.record_failure(context, err),
            Err(_) => {}
        }
        result
    }

    fn admit(&self, context: &str) -> MarketingResult<Admission> {
        let now = Instant::now();
        let mut inner = self.state.lock();
        self.maybe_half_open(&mut inner, now);

        match inner.state {
            CircuitState::Closed => {
                self.total_calls.fetch_add(1, Ordering::Relaxed);
                Ok(Admission::Normal)
            }
            CircuitState::HalfOpen if inner.trial.is_none() => {
                let id = inner.next_trial_id;
                inner.next_trial_id += 1;
                inner.trial = Some(id);
                self.total_calls.fetch_add(1, Ordering::Relaxed);
                debug!(context, "Circuit half-open, admitting trial request");
                Ok(Admission::Trial(id))
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                let retry_in = inner
                    .opened_at
                    .map(|opened| self.config.reset_timeout.saturating_sub(now.duration_since(opened)));
                debug!(context, state = %inner.state, "Circuit breaker rejected request");
                Err(MarketingError::CircuitOpen { retry_in })
            }
        }
    }

    fn maybe_half_open(&self, inner: &mut BreakerState, now: Instant) {
        if inner.state != CircuitState::Open {
            return;
        }
        if let Some(opened) = inner.opened_at {
            if now.duration_since(opened) >= self.config.reset_timeout {
                inner.state = CircuitState::HalfOpen;
                inner.trial = None;
                info!("Circuit breaker transitioning to half-open");
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.state.lock();
        if inner.state == CircuitState::HalfOpen {
            info!("Trial request succeeded, closing circuit");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.opened_at = None;
        inner.trial = None;
    }

    fn record_failure(&self, context: &str, error: &MarketingError) {
        let mut inner = self.state.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure_time = Some(Utc::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.trial = None;
                warn!(context, error = %error, "Trial request failed, reopening circuit");
            }
            CircuitState::Closed if inner.failure_count >= self.config.failure_threshold => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                warn!(
                    context,
                    failures = inner.failure_count,
                    reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                    "Circuit breaker opened"
                );
            }
            _ => {
                debug!(context, failures = inner.failure_count, "Circuit breaker recorded failure");
            }
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state.lock().state)
            .finish()
    }
}

/// Releases the half-open trial slot if the trial is cancelled mid-flight
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    id: u64,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.breaker.state.lock();
        if inner.trial == Some(self.id) {
            inner.trial = None;
        }
    }
}
