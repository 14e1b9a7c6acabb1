//! Token usage extraction
//!
//! Upstream responses report usage in one of two places: a top-level `usage`
//! object (Anthropic `message_delta`, OpenAI chunks and bodies) or nested under
//! `message.usage` (Anthropic `message_start`). [`UsageFragment::from_event`] is the
//! single place that probes both shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Token counters for one request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    pub fn is_zero(&self) -> bool {
        self.input_tokens == 0
            && self.output_tokens == 0
            && self.cache_creation_tokens == 0
            && self.cache_read_tokens == 0
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens + self.cache_read_tokens
    }

    /// Read counters from a usage object in either Anthropic or OpenAI naming
    pub fn from_usage_object(usage: &Value) -> Option<Self> {
        let obj = usage.as_object()?;
        let field = |name: &str| obj.get(name).and_then(Value::as_u64);

        let cached_prompt = obj
            .get("prompt_tokens_details")
            .and_then(|d| d.get("cached_tokens"))
            .and_then(Value::as_u64);

        Some(Self {
            input_tokens: field("input_tokens")
                .or_else(|| {
                    field("prompt_tokens").map(|p| p.saturating_sub(cached_prompt.unwrap_or(0)))
                })
                .unwrap_or(0),
            output_tokens: field("output_tokens")
                .or_else(|| field("completion_tokens"))
                .unwrap_or(0),
            cache_creation_tokens: field("cache_creation_input_tokens").unwrap_or(0),
            cache_read_tokens: field("cache_read_input_tokens")
                .or(cached_prompt)
                .unwrap_or(0),
        })
    }
}

/// Where, if anywhere, an upstream event carried usage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UsageFragment {
    /// `{"usage": {...}}`
    TopLevel(TokenUsage),
    /// `{"message": {"usage": {...}}}`
    Nested(TokenUsage),
    #[default]
    None,
}

impl UsageFragment {
    /// Classify a parsed event or response body; all-zero usage counts as none
    pub fn from_event(event: &Value) -> Self {
        if let Some(usage) = event.get("usage").and_then(TokenUsage::from_usage_object) {
            if !usage.is_zero() {
                return UsageFragment::TopLevel(usage);
            }
        }

        if let Some(usage) = event
            .get("message")
            .and_then(|m| m.get("usage"))
            .and_then(TokenUsage::from_usage_object)
        {
            if !usage.is_zero() {
                return UsageFragment::Nested(usage);
            }
        }

        UsageFragment::None
    }

    /// Parse raw event data; non-JSON payloads (e.g. `[DONE]`) carry no usage
    pub fn from_raw(data: &str) -> Self {
        serde_json::from_str::<Value>(data)
            .map(|v| Self::from_event(&v))
            .unwrap_or_default()
    }

    pub fn usage(&self) -> Option<TokenUsage> {
        match self {
            UsageFragment::TopLevel(u) | UsageFragment::Nested(u) => Some(*u),
            UsageFragment::None => None,
        }
    }
}

/// Keeps the last non-zero value seen for each counter across a stream
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageAccumulator {
    current: TokenUsage,
    observed: bool,
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, fragment: &UsageFragment) {
        let Some(usage) = fragment.usage() else {
            return;
        };
        self.observed = true;

        if usage.input_tokens > 0 {
            self.current.input_tokens = usage.input_tokens;
        }
        if usage.output_tokens > 0 {
            self.current.output_tokens = usage.output_tokens;
        }
        if usage.cache_creation_tokens > 0 {
            self.current.cache_creation_tokens = usage.cache_creation_tokens;
        }
        if usage.cache_read_tokens > 0 {
            self.current.cache_read_tokens = usage.cache_read_tokens;
        }
    }

    pub fn has_usage(&self) -> bool {
        self.observed
    }

    pub fn usage(&self) -> TokenUsage {
        self.current
    }
}
