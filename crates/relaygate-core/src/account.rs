//! Upstream accounts
//!
//! An [`Account`] is one credential/connection to an upstream LLM provider. The
//! gateway never creates or deletes accounts; it only bumps usage, marks and clears
//! rate-limit windows and rotates OAuth tokens through the [`AccountStore`].
//!
//! [`AccountStore`]: crate::store::AccountStore

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::api_key::Service;

/// Upstream provider kind an account connects to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    /// Claude via OAuth (subscription) credentials
    #[serde(rename = "claude")]
    Claude,
    /// Claude via a Console API key
    #[serde(rename = "claude-console")]
    ClaudeConsole,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "gemini")]
    Gemini,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::Claude,
        Platform::ClaudeConsole,
        Platform::OpenAi,
        Platform::Gemini,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Claude => "claude",
            Platform::ClaudeConsole => "claude-console",
            Platform::OpenAi => "openai",
            Platform::Gemini => "gemini",
        }
    }

    /// Service a caller must be allowed to use for this platform to be eligible
    pub fn service(&self) -> Service {
        match self {
            Platform::Claude | Platform::ClaudeConsole => Service::Claude,
            Platform::OpenAi => Service::OpenAi,
            Platform::Gemini => Service::Gemini,
        }
    }

    /// Whether credentials come from the OAuth refresh flow instead of a static key
    pub fn uses_oauth(&self) -> bool {
        matches!(self, Platform::Claude)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    RateLimited,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Active => "active",
            AccountStatus::RateLimited => "rate_limited",
            AccountStatus::Disabled => "disabled",
        }
    }
}

/// OAuth token set for subscription-backed accounts
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthCredentials {
    pub access_token: String,
    pub refresh_token: String,
    /// Unix epoch seconds; zero means unknown and is treated as expired
    #[serde(default)]
    pub expires_at: i64,
}

impl OAuthCredentials {
    /// True when the access token expires within `skew_secs` of `now` (or expiry is unknown)
    pub fn expires_within(&self, now: DateTime<Utc>, skew_secs: i64) -> bool {
        self.expires_at <= 0 || self.expires_at - now.timestamp() <= skew_secs
    }
}

// Tokens stay out of logs.
impl fmt::Debug for OAuthCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthCredentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Outbound HTTP proxy used for every call made on behalf of an account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Credential/connection descriptor for one upstream provider
#[derive(Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub platform: Platform,
    /// Lower is preferred
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_status")]
    pub status: AccountStatus,
    #[serde(default)]
    pub rate_limited_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: u64,
    /// `source:target` mapping entries or bare model names; empty supports everything
    #[serde(default)]
    pub supported_models: Vec<String>,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub oauth: Option<OAuthCredentials>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Overrides the platform's default upstream base URL
    #[serde(default)]
    pub base_url: Option<String>,
    /// Historical rate-limit window length, used only as a scoring hint
    #[serde(default)]
    pub rate_limit_duration_secs: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

fn default_priority() -> i32 {
    50
}

fn default_status() -> AccountStatus {
    AccountStatus::Active
}

impl Account {
    pub fn new(id: impl Into<String>, platform: Platform) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            platform,
            priority: default_priority(),
            status: AccountStatus::Active,
            rate_limited_until: None,
            last_used_at: None,
            usage_count: 0,
            supported_models: Vec::new(),
            proxy: None,
            oauth: None,
            api_key: None,
            base_url: None,
            rate_limit_duration_secs: 0,
            last_error: None,
        }
    }

    /// An account is available iff it is active and not inside a rate-limit window
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        self.status == AccountStatus::Active
            && self.rate_limited_until.is_none_or(|until| until < now)
    }

    /// Rate-limited account whose window has already elapsed
    pub fn rate_limit_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == AccountStatus::RateLimited
            && self.rate_limited_until.is_none_or(|until| until < now)
    }

    /// Whether any `supported_models` entry accepts `model` (empty list accepts all)
    pub fn supports_model(&self, model: &str) -> bool {
        self.supported_models.is_empty()
            || self
                .supported_models
                .iter()
                .any(|entry| mapping_source(entry).eq_ignore_ascii_case(model))
    }

    /// Substitute `model` with the target of the first matching `source:target` entry
    pub fn map_model(&self, model: &str) -> String {
        self.supported_models
            .iter()
            .filter_map(|entry| entry.split_once(':'))
            .find(|(source, _)| source.trim().eq_ignore_ascii_case(model))
            .map(|(_, target)| target.trim().to_string())
            .filter(|target| !target.is_empty())
            .unwrap_or_else(|| model.to_string())
    }
}

fn mapping_source(entry: &str) -> &str {
    entry.split_once(':').map_or(entry, |(source, _)| source).trim()
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("platform", &self.platform)
            .field("priority", &self.priority)
            .field("status", &self.status)
            .field("rate_limited_until", &self.rate_limited_until)
            .field("last_used_at", &self.last_used_at)
            .field("usage_count", &self.usage_count)
            .field("supported_models", &self.supported_models)
            .field("proxy", &self.proxy)
            .field("oauth", &self.oauth)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_platform_serde_names() {
        assert_eq!(
            serde_json::to_string(&Platform::ClaudeConsole).unwrap(),
            "\"claude-console\""
        );
        let p: Platform = serde_json::from_str("\"openai\"").unwrap();
        assert_eq!(p, Platform::OpenAi);
        assert_eq!(Platform::Gemini.service(), Service::Gemini);
        assert_eq!(Platform::ClaudeConsole.service(), Service::Claude);
    }

    #[test]
    fn test_availability_matrix() {
        let now = now();
        let mut account = Account::new("a", Platform::Claude);
        assert!(account.is_available(now));

        account.rate_limited_until = Some(now + Duration::seconds(1));
        assert!(!account.is_available(now));

        account.rate_limited_until = Some(now - Duration::seconds(1));
        assert!(account.is_available(now));

        // until == now is still inside the window
        account.rate_limited_until = Some(now);
        assert!(!account.is_available(now));

        account.rate_limited_until = None;
        account.status = AccountStatus::RateLimited;
        assert!(!account.is_available(now));

        account.status = AccountStatus::Disabled;
        assert!(!account.is_available(now));
    }

    #[test]
    fn test_availability_over_timestamp_pairs() {
        let base = now();
        for status in [
            AccountStatus::Active,
            AccountStatus::RateLimited,
            AccountStatus::Disabled,
        ] {
            for offset in [-3600i64, -60, -1, 0, 1, 60, 3600] {
                let mut account = Account::new("a", Platform::OpenAi);
                account.status = status;
                account.rate_limited_until = Some(base + Duration::seconds(offset));
                let expected = status == AccountStatus::Active && offset < 0;
                assert_eq!(account.is_available(base), expected, "{status:?} {offset}");
            }
        }
    }

    #[test]
    fn test_rate_limit_expired() {
        let now = now();
        let mut account = Account::new("a", Platform::Claude);
        account.status = AccountStatus::RateLimited;
        account.rate_limited_until = Some(now - Duration::seconds(5));
        assert!(account.rate_limit_expired(now));
        assert!(!account.is_available(now));

        account.rate_limited_until = Some(now + Duration::seconds(5));
        assert!(!account.rate_limit_expired(now));
    }

    #[test]
    fn test_supports_model() {
        let mut account = Account::new("a", Platform::Claude);
        assert!(account.supports_model("anything"));

        account.supported_models = vec![
            "claude-3-5-sonnet:claude-3-5-sonnet-20241022".to_string(),
            "claude-3-haiku".to_string(),
        ];
        assert!(account.supports_model("CLAUDE-3-5-SONNET"));
        assert!(account.supports_model("claude-3-haiku"));
        assert!(!account.supports_model("claude-3-5-sonnet-20241022"));
        assert!(!account.supports_model("gpt-4o"));
    }

    #[test]
    fn test_map_model() {
        let mut account = Account::new("a", Platform::Claude);
        assert_eq!(account.map_model("X"), "X");

        account.supported_models = vec!["X:Y".to_string(), "bare".to_string()];
        assert_eq!(account.map_model("X"), "Y");
        assert_eq!(account.map_model("x"), "Y");
        assert_eq!(account.map_model("bare"), "bare");
        assert_eq!(account.map_model("other"), "other");
    }

    #[test]
    fn test_oauth_expiry_window() {
        let now = now();
        let mut creds = OAuthCredentials {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: 0,
        };
        assert!(creds.expires_within(now, 60));

        creds.expires_at = now.timestamp() + 30;
        assert!(creds.expires_within(now, 60));

        creds.expires_at = now.timestamp() + 3600;
        assert!(!creds.expires_within(now, 60));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let mut account = Account::new("a", Platform::Claude);
        account.api_key = Some("sk-secret".into());
        account.oauth = Some(OAuthCredentials {
            access_token: "at-secret".into(),
            refresh_token: "rt-secret".into(),
            expires_at: 1,
        });
        let rendered = format!("{account:?}");
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_account_deserialize_defaults() {
        let account: Account =
            serde_json::from_str(r#"{"id":"acc-1","platform":"claude-console","api_key":"k"}"#)
                .unwrap();
        assert_eq!(account.priority, 50);
        assert_eq!(account.status, AccountStatus::Active);
        assert!(account.supported_models.is_empty());
        assert_eq!(account.usage_count, 0);
    }
}
