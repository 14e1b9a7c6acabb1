//! Pre-flight cost estimation
//!
//! Token counts are approximated from the request body alone: message text
//! length divided by a chars-per-token ratio for input, and a fraction of the
//! requested `max_tokens` (capped) for output.

use relaygate_core::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    BillingError, Result,
    pricing::{ModelPrice, tokens},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimationConfig {
    pub chars_per_token: u64,
    /// Share of `max_tokens` assumed to be generated
    pub output_ratio: Decimal,
    pub output_cap: u64,
    /// Multiplier applied to the priced estimate
    pub safety_margin: Decimal,
    /// Used when the request carries no `max_tokens`
    pub default_max_tokens: u64,
}

impl Default for EstimationConfig {
    fn default() -> Self {
        Self {
            chars_per_token: 4,
            output_ratio: Decimal::new(3, 1),
            output_cap: 1000,
            safety_margin: Decimal::new(12, 1),
            default_max_tokens: 4096,
        }
    }
}

impl EstimationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chars_per_token == 0 {
            return Err(BillingError::InvalidConfig(
                "chars_per_token must be positive".to_string(),
            ));
        }
        if self.output_ratio.is_sign_negative() || self.safety_margin < Decimal::ONE {
            return Err(BillingError::InvalidConfig(
                "output_ratio must be >= 0 and safety_margin >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Approximate token counts and the priced, margin-inflated cost
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CostEstimate {
    pub input_tokens: u64,
    pub output_tokens: Decimal,
    pub cost: Decimal,
}

/// Estimated input tokens across the system prompt and every message
pub fn estimate_input_tokens(body: &Value, config: &EstimationConfig) -> u64 {
    let per_part = |text: &str| text.chars().count() as u64 / config.chars_per_token;

    let system = body.get("system").map(|s| text_parts(s, per_part)).unwrap_or(0);
    let messages = body
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .filter_map(|m| m.get("content"))
                .map(|content| text_parts(content, per_part))
                .sum::<u64>()
        })
        .unwrap_or(0);

    system + messages
}

fn text_parts(content: &Value, count: impl Fn(&str) -> u64 + Copy) -> u64 {
    match content {
        Value::String(text) => count(text),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|block| match block {
                Value::String(text) => Some(text.as_str()),
                other => other.get("text").and_then(Value::as_str),
            })
            .map(count)
            .sum(),
        _ => 0,
    }
}

/// Estimated output tokens: `min(max_tokens * ratio, cap)`
pub fn estimate_output_tokens(body: &Value, config: &EstimationConfig) -> Decimal {
    let max_tokens = body
        .get("max_tokens")
        .or_else(|| body.get("max_completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(config.default_max_tokens);

    (tokens(max_tokens) * config.output_ratio).min(tokens(config.output_cap))
}

pub fn estimate(body: &Value, price: &ModelPrice, config: &EstimationConfig) -> CostEstimate {
    let input_tokens = estimate_input_tokens(body, config);
    let output_tokens = estimate_output_tokens(body, config);
    let cost =
        (price.input * tokens(input_tokens) + price.output * output_tokens) * config.safety_margin;

    CostEstimate {
        input_tokens,
        output_tokens,
        cost,
    }
}
