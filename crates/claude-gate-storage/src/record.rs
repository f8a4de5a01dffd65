//! The persisted credential unit.

use serde::{Deserialize, Serialize};

/// Seconds before expiry at which an OAuth token is proactively refreshed.
pub const REFRESH_BUFFER_SECS: i64 = 300;

/// Which kind of credential a [`TokenRecord`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenKind {
    #[serde(rename = "oauth")]
    OAuth,
    #[serde(rename = "api", alias = "api_key")]
    ApiKey,
}

/// One provider's credential: an OAuth token pair or an API key.
///
/// Serialized with the short field names used by the auth file
/// (`type`, `refresh`, `access`, `expires`, `key`); empty fields are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(rename = "type")]
    pub kind: TokenKind,

    #[serde(rename = "refresh", default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,

    #[serde(rename = "access", default, skip_serializing_if = "String::is_empty")]
    pub access_token: String,

    /// Expiry in epoch seconds. `0` means the record never expires.
    #[serde(rename = "expires", default, skip_serializing_if = "is_zero")]
    pub expires_at: i64,

    #[serde(rename = "key", default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
}

fn is_zero(value: &i64) -> bool {
    *value == 0
}

/// Current time in epoch seconds.
pub fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

impl TokenRecord {
    /// An OAuth record expiring at `expires_at` (epoch seconds).
    pub fn oauth(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: i64,
    ) -> Self {
        Self {
            kind: TokenKind::OAuth,
            refresh_token: refresh_token.into(),
            access_token: access_token.into(),
            expires_at,
            api_key: String::new(),
        }
    }

    /// An API key record. API keys never expire.
    pub fn api_key(key: impl Into<String>) -> Self {
        Self {
            kind: TokenKind::ApiKey,
            refresh_token: String::new(),
            access_token: String::new(),
            expires_at: 0,
            api_key: key.into(),
        }
    }

    pub fn is_oauth(&self) -> bool {
        self.kind == TokenKind::OAuth
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_secs())
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.is_oauth() && self.expires_at != 0 && now >= self.expires_at
    }

    /// True once `now` is inside the refresh window before expiry.
    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh_at(now_secs())
    }

    pub fn needs_refresh_at(&self, now: i64) -> bool {
        self.is_oauth()
            && self.expires_at != 0
            && now >= self.expires_at.saturating_sub(REFRESH_BUFFER_SECS)
    }

    /// Seconds left before expiry, clamped at zero. `None` for records that
    /// never expire.
    pub fn expires_in_secs(&self, now: i64) -> Option<i64> {
        if !self.is_oauth() || self.expires_at == 0 {
            return None;
        }
        Some((self.expires_at - now).max(0))
    }

    /// Human-readable expiry for status output.
    pub fn expires_in_display(&self) -> String {
        match self.expires_in_secs(now_secs()) {
            None => "never".to_string(),
            Some(0) => "Expired (will refresh on next use)".to_string(),
            Some(secs) => {
                let hours = secs / 3600;
                let minutes = (secs % 3600) / 60;
                format!("{}h {}m", hours, minutes)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_expires_when_zero() {
        let oauth = TokenRecord::oauth("a", "r", 0);
        assert!(!oauth.is_expired_at(i64::MAX));
        assert!(!oauth.needs_refresh_at(i64::MAX));

        let key = TokenRecord::api_key("sk-test");
        assert!(!key.is_expired_at(i64::MAX));
        assert!(!key.needs_refresh_at(i64::MAX));
    }

    #[test]
    fn test_api_key_never_expires_even_with_expiry_set() {
        let mut key = TokenRecord::api_key("sk-test");
        key.expires_at = 100;
        assert!(!key.is_expired_at(1_000));
        assert!(!key.needs_refresh_at(1_000));
    }

    #[test]
    fn test_expiry_boundaries() {
        let record = TokenRecord::oauth("a", "r", 10_000);
        assert!(!record.is_expired_at(9_999));
        assert!(record.is_expired_at(10_000));
        assert!(record.is_expired_at(10_001));
    }

    #[test]
    fn test_refresh_window() {
        let record = TokenRecord::oauth("a", "r", 10_000);
        assert!(!record.needs_refresh_at(10_000 - REFRESH_BUFFER_SECS - 1));
        assert!(record.needs_refresh_at(10_000 - REFRESH_BUFFER_SECS));
        // Inside the window but not yet expired.
        assert!(record.needs_refresh_at(9_800));
        assert!(!record.is_expired_at(9_800));
        // Already expired.
        assert!(record.needs_refresh_at(20_000));
    }

    #[test]
    fn test_short_field_names() {
        let record = TokenRecord::oauth("A", "R", 1_700_000_000);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "oauth",
                "refresh": "R",
                "access": "A",
                "expires": 1_700_000_000
            })
        );

        let key = serde_json::to_value(TokenRecord::api_key("sk")).unwrap();
        assert_eq!(key, serde_json::json!({"type": "api", "key": "sk"}));
    }

    #[test]
    fn test_parse_api_key_alias() {
        let record: TokenRecord =
            serde_json::from_str(r#"{"type":"api_key","key":"sk"}"#).unwrap();
        assert_eq!(record.kind, TokenKind::ApiKey);
        assert_eq!(record.api_key, "sk");
    }

    #[test]
    fn test_expires_in_display() {
        let now = now_secs();
        let record = TokenRecord::oauth("a", "r", now + 7200 + 30);
        assert_eq!(record.expires_in_display(), "2h 0m");

        let expired = TokenRecord::oauth("a", "r", now - 10);
        assert!(expired.expires_in_display().contains("Expired"));

        assert_eq!(TokenRecord::api_key("k").expires_in_display(), "never");
    }
}
