//! Resilience patterns shared by every request of a client.
//!
//! Each client owns one instance of each component, so limits and breaker
//! state apply across all callers of that client.

mod circuit_breaker;
mod queue;
mod rate_limiter;
mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, CircuitState};
pub use queue::{QueueStats, RequestQueue, RequestQueueConfig};
pub use rate_limiter::{RateLimitConfig, RateLimiter, RateLimiterSnapshot};
pub use retry::{is_retryable, RetryConfig, RetryManager};
