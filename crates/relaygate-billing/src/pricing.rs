//! Per-token model prices
//!
//! Prices are looked up by exact model name first (case-insensitive), then by the
//! longest configured name that prefixes the requested model, so dated snapshots
//! such as `claude-3-5-sonnet-20241022` inherit the `claude-3-5-sonnet` price.
//! Anything else falls back to the table's default price.

use relaygate_core::{Decimal, TokenUsage};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{BillingError, Result};

/// Price of one token in each billed category
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input: Decimal,
    pub output: Decimal,
    #[serde(default)]
    pub cache_write: Decimal,
    #[serde(default)]
    pub cache_read: Decimal,
}

impl ModelPrice {
    pub fn new(input: Decimal, output: Decimal) -> Self {
        Self {
            input,
            output,
            cache_write: Decimal::ZERO,
            cache_read: Decimal::ZERO,
        }
    }

    pub fn with_cache(mut self, cache_write: Decimal, cache_read: Decimal) -> Self {
        self.cache_write = cache_write;
        self.cache_read = cache_read;
        self
    }

    /// Exact cost of the reported usage
    pub fn cost_of(&self, usage: &TokenUsage) -> Decimal {
        self.input * tokens(usage.input_tokens)
            + self.output * tokens(usage.output_tokens)
            + self.cache_write * tokens(usage.cache_creation_tokens)
            + self.cache_read * tokens(usage.cache_read_tokens)
    }

    fn validate(&self, model: &str) -> Result<()> {
        let negative = [self.input, self.output, self.cache_write, self.cache_read]
            .iter()
            .any(|p| p.is_sign_negative() && !p.is_zero());
        if negative {
            return Err(BillingError::InvalidPrice(model.to_string()));
        }
        Ok(())
    }
}

pub(crate) fn tokens(count: u64) -> Decimal {
    Decimal::from(count)
}

/// Model price lookup
pub trait PricingTable: Send + Sync {
    /// Price for `model`; unknown models get a default price
    fn price(&self, model: &str) -> ModelPrice;
}

/// Fixed price list loaded from configuration
#[derive(Debug, Clone)]
pub struct StaticPricingTable {
    default: ModelPrice,
    // Keys are lowercased.
    models: HashMap<String, ModelPrice>,
}

impl StaticPricingTable {
    pub fn new(default: ModelPrice) -> Result<Self> {
        default.validate("default")?;
        Ok(Self {
            default,
            models: HashMap::new(),
        })
    }

    /// Table seeded with list prices for common models
    pub fn builtin() -> Self {
        let sonnet = ModelPrice::new(Decimal::new(3, 6), Decimal::new(15, 6))
            .with_cache(Decimal::new(375, 8), Decimal::new(3, 7));
        let haiku = ModelPrice::new(Decimal::new(8, 7), Decimal::new(4, 6))
            .with_cache(Decimal::new(1, 6), Decimal::new(8, 8));
        let opus = ModelPrice::new(Decimal::new(15, 6), Decimal::new(75, 6))
            .with_cache(Decimal::new(1875, 8), Decimal::new(15, 7));
        let gpt4o = ModelPrice::new(Decimal::new(25, 7), Decimal::new(1, 5))
            .with_cache(Decimal::ZERO, Decimal::new(125, 8));
        let gpt4o_mini = ModelPrice::new(Decimal::new(15, 8), Decimal::new(6, 7))
            .with_cache(Decimal::ZERO, Decimal::new(75, 9));
        let gemini_flash = ModelPrice::new(Decimal::new(3, 7), Decimal::new(25, 7));
        let gemini_pro = ModelPrice::new(Decimal::new(125, 8), Decimal::new(1, 5));

        let mut models = HashMap::new();
        for (name, price) in [
            ("claude-3-5-sonnet", sonnet),
            ("claude-3-7-sonnet", sonnet),
            ("claude-sonnet-4", sonnet),
            ("claude-3-5-haiku", haiku),
            ("claude-opus-4", opus),
            ("gpt-4o", gpt4o),
            ("gpt-4o-mini", gpt4o_mini),
            ("gemini-2.5-flash", gemini_flash),
            ("gemini-2.5-pro", gemini_pro),
        ] {
            models.insert(name.to_string(), price);
        }

        Self {
            default: sonnet,
            models,
        }
    }

    /// Add or replace one model's price
    pub fn insert(&mut self, model: &str, price: ModelPrice) -> Result<()> {
        price.validate(model)?;
        self.models.insert(model.to_lowercase(), price);
        Ok(())
    }

    pub fn default_price(&self) -> ModelPrice {
        self.default
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

impl PricingTable for StaticPricingTable {
    fn price(&self, model: &str) -> ModelPrice {
        let model = model.to_lowercase();
        if let Some(price) = self.models.get(&model) {
            return *price;
        }

        self.models
            .iter()
            .filter(|(name, _)| model.starts_with(name.as_str()))
            .max_by_key(|(name, _)| name.len())
            .map(|(_, price)| *price)
            .unwrap_or(self.default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn table() -> StaticPricingTable {
        let mut table = StaticPricingTable::new(ModelPrice::new(dec("0.00001"), dec("0.00002")))
            .unwrap();
        table
            .insert("claude-3-5-sonnet", ModelPrice::new(dec("0.000003"), dec("0.000015")))
            .unwrap();
        table
            .insert("claude-3-5", ModelPrice::new(dec("0.000001"), dec("0.000001")))
            .unwrap();
        table
    }

    #[test]
    fn test_exact_match_is_case_insensitive() {
        let price = table().price("Claude-3-5-Sonnet");
        assert_eq!(price.input, dec("0.000003"));
    }

    #[test]
    fn test_longest_prefix_wins() {
        let price = table().price("claude-3-5-sonnet-20241022");
        assert_eq!(price.output, dec("0.000015"));

        let price = table().price("claude-3-5-haiku-latest");
        assert_eq!(price.output, dec("0.000001"));
    }

    #[test]
    fn test_unknown_model_uses_default() {
        let price = table().price("mystery-model");
        assert_eq!(price, ModelPrice::new(dec("0.00001"), dec("0.00002")));
    }

    #[test]
    fn test_cost_of_sums_all_categories() {
        let price = ModelPrice::new(dec("0.000003"), dec("0.000015"))
            .with_cache(dec("0.00000375"), dec("0.0000003"));
        let usage = TokenUsage {
            input_tokens: 1000,
            output_tokens: 100,
            cache_creation_tokens: 200,
            cache_read_tokens: 1000,
        };
        // 0.003 + 0.0015 + 0.00075 + 0.0003
        assert_eq!(price.cost_of(&usage), dec("0.00555"));
    }

    #[test]
    fn test_negative_price_rejected() {
        let mut table = table();
        let err = table
            .insert("bad", ModelPrice::new(dec("-0.1"), Decimal::ZERO))
            .unwrap_err();
        assert!(matches!(err, BillingError::InvalidPrice(model) if model == "bad"));
    }

    #[test]
    fn test_builtin_covers_dated_snapshots() {
        let table = StaticPricingTable::builtin();
        assert_eq!(
            table.price("claude-3-5-sonnet-20241022").input,
            dec("0.000003")
        );
        assert_eq!(table.price("gpt-4o-mini-2024-07-18").output, dec("0.0000006"));
    }
}
