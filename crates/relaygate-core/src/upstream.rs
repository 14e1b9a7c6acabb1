//! Upstream chat client trait
//!
//! Clients are pass-through: the caller's body is forwarded with only the model
//! replaced, and streaming events are surfaced verbatim together with the usage
//! they carried.

use chrono::{DateTime, Duration, Utc};
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use crate::{
    account::{Platform, ProxyConfig},
    usage::{TokenUsage, UsageFragment},
};

/// Request body to forward, with the upstream model already substituted
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub body: Value,
    pub model: String,
    pub stream: bool,
    /// Caller headers forwarded as-is (e.g. `anthropic-version`, `anthropic-beta`)
    pub passthrough_headers: Vec<(String, String)>,
}

/// Account-specific connection details for one upstream call
#[derive(Clone)]
pub struct UpstreamContext {
    pub account_id: String,
    pub platform: Platform,
    /// OAuth access token or static API key
    pub credential: String,
    pub proxy: Option<ProxyConfig>,
    pub base_url: Option<String>,
}

impl std::fmt::Debug for UpstreamContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamContext")
            .field("account_id", &self.account_id)
            .field("platform", &self.platform)
            .field("proxy", &self.proxy)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

/// Buffered upstream response
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub body: Value,
    pub usage: TokenUsage,
    /// Response headers worth relaying to the caller
    pub headers: Vec<(String, String)>,
}

/// One server-sent event from the upstream
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamEvent {
    /// SSE `event:` field; empty for data-only streams
    pub event: String,
    pub data: String,
    pub usage: UsageFragment,
}

impl UpstreamEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        let data = data.into();
        let usage = UsageFragment::from_raw(&data);
        Self {
            event: event.into(),
            data,
            usage,
        }
    }
}

impl UpstreamEvent {
    /// Error frame sent inside an otherwise successful stream
    ///
    /// Claude emits `event: error`; OpenAI-compatible streams send a data-only
    /// `{"error": {...}}` object.
    pub fn is_error(&self) -> bool {
        if self.event == "error" {
            return true;
        }
        if !self.event.is_empty() || !self.data.trim_start().starts_with('{') {
            return false;
        }
        serde_json::from_str::<Value>(&self.data)
            .map(|v| v.get("error").is_some_and(Value::is_object) || v["type"] == "error")
            .unwrap_or(false)
    }

    /// Human-readable message of an error frame
    pub fn error_message(&self) -> String {
        serde_json::from_str::<Value>(&self.data)
            .ok()
            .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
            .unwrap_or_else(|| self.data.clone())
    }
}

pub type UpstreamEventStream = BoxStream<'static, Result<UpstreamEvent, UpstreamError>>;

/// Longest cooldown honoured from an upstream back-off hint
pub const MAX_COOLDOWN_SECS: u64 = 7 * 24 * 3600;

/// End of a cooldown of `secs` starting at `now`, capped at [`MAX_COOLDOWN_SECS`]
pub fn cooldown_until(now: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    let secs = secs.min(MAX_COOLDOWN_SECS) as i64;
    Duration::try_seconds(secs)
        .and_then(|wait| now.checked_add_signed(wait))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// Provider throttled the account
    #[error("Upstream rate limited (retry after {retry_after_secs}s): {message}")]
    RateLimited {
        retry_after_secs: u64,
        limited_until: DateTime<Utc>,
        message: String,
    },

    #[error("Upstream returned HTTP {status_code}: {message}")]
    Status { status_code: u16, message: String },

    #[error("Upstream transport error: {0}")]
    Transport(String),

    #[error("Upstream response parse error: {0}")]
    Parse(String),
}

/// Per-platform chat client
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn complete(
        &self,
        ctx: &UpstreamContext,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError>;

    async fn stream_complete(
        &self,
        ctx: &UpstreamContext,
        request: UpstreamRequest,
    ) -> Result<UpstreamEventStream, UpstreamError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_parses_usage() {
        let event = UpstreamEvent::new(
            "message_delta",
            r#"{"type":"message_delta","usage":{"output_tokens":12}}"#,
        );
        assert_eq!(event.usage.usage().map(|u| u.output_tokens), Some(12));

        let done = UpstreamEvent::new("", "[DONE]");
        assert_eq!(done.usage, UsageFragment::None);
    }

    #[test]
    fn test_error_frames_detected() {
        let claude = UpstreamEvent::new(
            "error",
            r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert!(claude.is_error());
        assert_eq!(claude.error_message(), "Overloaded");

        let openai = UpstreamEvent::new("", r#"{"error":{"message":"server busy"}}"#);
        assert!(openai.is_error());
        assert_eq!(openai.error_message(), "server busy");

        assert!(!UpstreamEvent::new("", "[DONE]").is_error());
        let delta = UpstreamEvent::new("content_block_delta", r#"{"type":"content_block_delta"}"#);
        assert!(!delta.is_error());
        assert!(!UpstreamEvent::new("", r#"{"choices":[],"error":null}"#).is_error());
    }

    #[test]
    fn test_cooldown_until_is_capped() {
        use chrono::TimeZone;
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();

        assert_eq!(cooldown_until(now, 30), now + Duration::seconds(30));
        let cap = now + Duration::seconds(MAX_COOLDOWN_SECS as i64);
        assert_eq!(cooldown_until(now, 10_000_000_000_000), cap);
        assert_eq!(cooldown_until(now, u64::MAX), cap);
        assert_eq!(cooldown_until(DateTime::<Utc>::MAX_UTC, 60), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_context_debug_hides_credential() {
        let ctx = UpstreamContext {
            account_id: "acc".into(),
            platform: Platform::OpenAi,
            credential: "sk-topsecret".into(),
            proxy: None,
            base_url: None,
        };
        assert!(!format!("{ctx:?}").contains("topsecret"));
    }
}
