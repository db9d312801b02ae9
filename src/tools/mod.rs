//! Tool handlers exposed to an agent tool server.
//!
//! Each handler returns a JSON document. Failures are returned as
//! [`MarketingError`]; [`error_payload`] renders one for the caller.

use crate::client::MarketingClient;
use crate::config::RetryOverrides;
use crate::errors::{ConfigurationError, MarketingError, MarketingResult};
use crate::resilience::RetryConfig;
use serde_json::{json, Value};
use tracing::info;

/// Render an error as a tool result
pub fn error_payload(error: &MarketingError) -> Value {
    json!({
        "error": {
            "code": error.error_code(),
            "message": error.message(),
            "statusCode": error.status_code(),
            "body": error.body(),
        }
    })
}

/// Token inspection and maintenance
#[derive(Debug, Clone)]
pub struct AuthTools {
    client: MarketingClient,
}

impl AuthTools {
    /// Create handlers for a client
    pub fn new(client: MarketingClient) -> Self {
        Self { client }
    }

    /// Expiry and refresh state of the current token
    pub fn token_status(&self) -> MarketingResult<Value> {
        Ok(serde_json::to_value(self.client.get_token_status())?)
    }

    /// Accounts and permissions on the current token
    pub fn token_scopes(&self) -> MarketingResult<Value> {
        let scopes = self.client.get_token_scopes();
        let mut value = serde_json::to_value(&scopes)?;
        value["currentAccountId"] = json!(self.client.get_current_account_id());
        Ok(value)
    }

    /// Refresh the token now
    pub async fn refresh_token(&self) -> MarketingResult<Value> {
        let outcome = self.client.force_refresh_token().await?;
        Ok(serde_json::to_value(outcome)?)
    }

    /// Check that the configured credentials work
    pub async fn validate_token(&self) -> MarketingResult<Value> {
        let validation = self.client.validate_token().await?;
        Ok(serde_json::to_value(validation)?)
    }
}

/// Resilience diagnostics and tuning
#[derive(Debug, Clone)]
pub struct DiagnosticTools {
    client: MarketingClient,
}

impl DiagnosticTools {
    /// Create handlers for a client
    pub fn new(client: MarketingClient) -> Self {
        Self { client }
    }

    /// Retry policy in effect
    pub fn retry_config(&self) -> Value {
        retry_config_json(&self.client.get_retry_config())
    }

    /// Apply a partial retry policy, e.g. `{"maxRetries": 5, "jitter": false}`
    pub fn update_retry_config(&self, overrides: Value) -> MarketingResult<Value> {
        let overrides: RetryOverrides = serde_json::from_value(overrides)
            .map_err(|e| ConfigurationError::InvalidOverrides(e.to_string()))?;
        let updated = overrides.apply(&self.client.get_retry_config())?;
        self.client.update_retry_config(updated.clone())?;
        info!(max_retries = updated.max_retries, "Retry policy updated by tool call");
        Ok(json!({
            "updated": true,
            "config": retry_config_json(&updated),
        }))
    }

    /// Breaker state
    pub fn circuit_breaker(&self) -> MarketingResult<Value> {
        Ok(serde_json::to_value(self.client.circuit_breaker_state())?)
    }

    /// Force the breaker closed
    pub fn reset_circuit_breaker(&self) -> MarketingResult<Value> {
        self.client.reset_circuit_breaker();
        Ok(json!({
            "reset": true,
            "state": serde_json::to_value(self.client.circuit_breaker_state())?,
        }))
    }

    /// Queue occupancy
    pub fn queue(&self) -> MarketingResult<Value> {
        Ok(serde_json::to_value(self.client.queue_stats())?)
    }

    /// Limiter state
    pub fn rate_limiter(&self) -> MarketingResult<Value> {
        Ok(serde_json::to_value(self.client.rate_limiter_state())?)
    }

    /// Request log retrieval
    pub fn logs(&self, _params: Value) -> MarketingResult<Value> {
        Err(MarketingError::NotImplemented {
            operation: "logs".to_string(),
        })
    }
}

fn retry_config_json(config: &RetryConfig) -> Value {
    let mut kinds: Vec<String> = config
        .retryable_error_kinds
        .iter()
        .filter_map(|k| serde_json::to_value(k).ok())
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    kinds.sort();

    json!({
        "maxRetries": config.max_retries,
        "baseDelayMs": config.base_delay.as_millis() as u64,
        "maxDelayMs": config.max_delay.as_millis() as u64,
        "exponentialBase": config.exponential_base,
        "jitter": config.jitter,
        "retryableStatusCodes": config.retryable_status_codes.iter().collect::<Vec<_>>(),
        "retryableErrors": kinds,
    })
}
