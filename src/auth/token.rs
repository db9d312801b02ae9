//! Access token types and lifetime arithmetic.

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token endpoint response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Bearer credential
    pub access_token: String,
    /// Token type, usually `Bearer`
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<u64>,
    /// Credential for the refresh grant
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Space-separated granted scopes
    #[serde(default)]
    pub scope: Option<String>,
    /// Accounts the token may act on
    #[serde(default, alias = "account_ids")]
    pub accounts: Vec<serde_json::Value>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// A usable access token and what it grants
#[derive(Clone)]
pub struct AccessToken {
    secret: SecretString,
    /// Authorization scheme
    pub token_type: String,
    /// When the token was obtained
    pub issued_at: DateTime<Utc>,
    /// Absolute expiry; `None` for credentials that never expire
    pub expires_at: Option<DateTime<Utc>>,
    pub(crate) refresh_token: Option<SecretString>,
    /// Account identifiers attached to the token
    pub account_ids: Vec<String>,
    /// Raw scope string
    pub scope: Option<String>,
}

impl AccessToken {
    /// Build a token from an endpoint response received at `issued_at`
    pub fn from_response(response: TokenResponse, issued_at: DateTime<Utc>) -> Self {
        let expires_at = response.expires_in.and_then(|secs| {
            let secs = i64::try_from(secs).ok()?;
            issued_at.checked_add_signed(chrono::Duration::try_seconds(secs)?)
        });
        Self {
            secret: SecretString::new(response.access_token),
            token_type: response.token_type,
            issued_at,
            expires_at,
            refresh_token: response.refresh_token.map(SecretString::new),
            account_ids: response.accounts.iter().filter_map(account_id).collect(),
            scope: response.scope.filter(|s| !s.trim().is_empty()),
        }
    }

    /// Wrap an API key as a token that never expires
    pub fn from_api_key(key: &SecretString, issued_at: DateTime<Utc>) -> Self {
        Self {
            secret: SecretString::new(key.expose_secret().clone()),
            token_type: "Bearer".to_string(),
            issued_at,
            expires_at: None,
            refresh_token: None,
            account_ids: Vec::new(),
            scope: None,
        }
    }

    /// Value for the `Authorization` header
    pub(crate) fn authorization(&self) -> String {
        format!("{} {}", self.token_type, self.secret.expose_secret())
    }

    /// Whether the token carries a refresh credential
    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token.is_some()
    }

    /// Whether the token is past its expiry at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |exp| now >= exp)
    }

    /// Whether the token is inside its refresh window at `now`.
    ///
    /// The window is `margin`, shrunk to half the token's lifetime for
    /// tokens that live shorter than twice the margin.
    pub fn needs_refresh_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let Some(exp) = self.expires_at else {
            return false;
        };
        let lifetime = exp - self.issued_at;
        let margin = chrono::Duration::from_std(margin).unwrap_or(lifetime);
        let window = margin.min(lifetime / 2);
        now + window >= exp
    }

    /// Remaining lifetime at `now`, clamped at zero
    pub fn expires_in_at(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.expires_at
            .map(|exp| (exp - now).max(chrono::Duration::zero()))
    }

    /// Status report evaluated at `now`
    pub fn status_at(&self, now: DateTime<Utc>, margin: Duration) -> TokenStatus {
        TokenStatus {
            has_token: true,
            is_expired: self.is_expired_at(now),
            needs_refresh: self.needs_refresh_at(now, margin),
            expires_at: self.expires_at,
            expires_in_seconds: self.expires_in_at(now).map(|d| d.num_seconds()),
            token_type: Some(self.token_type.clone()),
            has_refresh_token: self.has_refresh_token(),
        }
    }

    /// Accounts and inferred permissions
    pub fn scopes(&self) -> TokenScopes {
        let permissions = match &self.scope {
            Some(scope) => scope.split_whitespace().map(str::to_string).collect(),
            None if !self.account_ids.is_empty() => vec!["read".to_string(), "write".to_string()],
            None => vec!["read".to_string()],
        };
        TokenScopes {
            account_ids: self.account_ids.clone(),
            permissions,
            multi_account: self.account_ids.len() > 1,
            scope: self.scope.clone(),
        }
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("account_ids", &self.account_ids)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Accepts `"id"`, `42` or `{"id": ...}` account entries
fn account_id(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Object(map) => map.get("id").and_then(account_id),
        _ => None,
    }
}

/// Token lifetime report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenStatus {
    /// A token has been obtained
    pub has_token: bool,
    /// The token is past expiry
    pub is_expired: bool,
    /// The token is inside its refresh window
    pub needs_refresh: bool,
    /// Absolute expiry
    pub expires_at: Option<DateTime<Utc>>,
    /// Seconds until expiry
    pub expires_in_seconds: Option<i64>,
    /// Authorization scheme
    pub token_type: Option<String>,
    /// A refresh credential is held
    pub has_refresh_token: bool,
}

impl TokenStatus {
    /// Status when no token has been obtained yet
    pub fn missing() -> Self {
        Self {
            has_token: false,
            is_expired: false,
            needs_refresh: true,
            expires_at: None,
            expires_in_seconds: None,
            token_type: None,
            has_refresh_token: false,
        }
    }
}

/// Accounts and permissions attached to the token
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenScopes {
    /// Account identifiers
    pub account_ids: Vec<String>,
    /// Granted or inferred permissions
    pub permissions: Vec<String>,
    /// More than one account is attached
    pub multi_account: bool,
    /// Raw scope string, when the server sent one
    pub scope: Option<String>,
}

/// Result of a forced refresh
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshOutcome {
    /// Expiry before the refresh
    pub previous_expires_at: Option<DateTime<Utc>>,
    /// Expiry after the refresh
    pub new_expires_at: Option<DateTime<Utc>>,
    /// Another caller's refresh was reused
    pub coalesced: bool,
}

/// Result of a credential validation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenValidation {
    /// Credentials produced a usable token
    pub valid: bool,
    /// Seconds until expiry
    pub expires_in_seconds: Option<i64>,
    /// Accounts on the token
    pub account_ids: Vec<String>,
    /// Why validation failed
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn issued() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn token(body: serde_json::Value) -> AccessToken {
        let response: TokenResponse = serde_json::from_value(body).unwrap();
        AccessToken::from_response(response, issued())
    }

    #[test]
    fn test_refresh_window() {
        let token = token(serde_json::json!({"access_token": "abc", "expires_in": 3600}));
        let margin = Duration::from_secs(300);

        let early = token.status_at(issued() + chrono::Duration::seconds(1000), margin);
        assert!(!early.needs_refresh);
        assert_eq!(early.expires_in_seconds, Some(2600));

        let late = token.status_at(issued() + chrono::Duration::seconds(3400), margin);
        assert!(late.needs_refresh);
        assert!(!late.is_expired);

        let expired = token.status_at(issued() + chrono::Duration::seconds(3700), margin);
        assert!(expired.is_expired);
        assert_eq!(expired.expires_in_seconds, Some(0));
    }

    #[test]
    fn test_short_lived_token_window_is_halved() {
        let token = token(serde_json::json!({"access_token": "abc", "expires_in": 120}));
        let margin = Duration::from_secs(300);

        assert!(!token.needs_refresh_at(issued() + chrono::Duration::seconds(30), margin));
        assert!(token.needs_refresh_at(issued() + chrono::Duration::seconds(60), margin));
    }

    #[test]
    fn test_api_key_never_expires() {
        let key = SecretString::new("key-1".to_string());
        let token = AccessToken::from_api_key(&key, issued());
        let status = token.status_at(issued() + chrono::Duration::days(365), Duration::from_secs(300));

        assert!(!status.is_expired);
        assert!(!status.needs_refresh);
        assert_eq!(status.expires_in_seconds, None);
        assert_eq!(token.authorization(), "Bearer key-1");
    }

    #[test]
    fn test_scopes_from_scope_string() {
        let token = token(serde_json::json!({
            "access_token": "abc",
            "scope": "campaigns:read contacts:write",
            "accounts": ["11", 12, {"id": "13"}]
        }));

        assert_eq!(
            token.scopes(),
            TokenScopes {
                account_ids: vec!["11".to_string(), "12".to_string(), "13".to_string()],
                permissions: vec!["campaigns:read".to_string(), "contacts:write".to_string()],
                multi_account: true,
                scope: Some("campaigns:read contacts:write".to_string()),
            }
        );
    }

    #[test]
    fn test_inferred_permissions() {
        let with_account = token(serde_json::json!({"access_token": "a", "accounts": ["1"]}));
        assert_eq!(with_account.scopes().permissions, vec!["read", "write"]);
        assert!(!with_account.scopes().multi_account);

        let bare = token(serde_json::json!({"access_token": "a"}));
        assert_eq!(bare.scopes().permissions, vec!["read"]);
    }

    #[test]
    fn test_debug_redacts_token() {
        let token = token(serde_json::json!({"access_token": "very-secret", "refresh_token": "r"}));
        assert!(!format!("{:?}", token).contains("very-secret"));
    }
}
