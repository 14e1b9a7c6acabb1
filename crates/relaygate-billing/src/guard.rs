//! Admission checks and settlement for tenant spend

use relaygate_core::{
    ApiKey, ApiKeyStore, Clock, Decimal, LimitKind, TenantId, TokenUsage, Wallet,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::{
    Result,
    estimate::{CostEstimate, EstimationConfig, estimate},
    pricing::PricingTable,
};

/// Result of settling a completed request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Wallet debited; key counters updated on a best-effort basis
    Settled { cost: Decimal },
    /// Nothing to charge
    Free,
    /// The balance no longer covered the cost; nothing was charged
    Declined { cost: Decimal },
}

pub struct QuotaGuard {
    pricing: Arc<dyn PricingTable>,
    wallet: Arc<dyn Wallet>,
    api_keys: Arc<dyn ApiKeyStore>,
    clock: Arc<dyn Clock>,
    estimation: EstimationConfig,
}

impl QuotaGuard {
    pub fn new(
        pricing: Arc<dyn PricingTable>,
        wallet: Arc<dyn Wallet>,
        api_keys: Arc<dyn ApiKeyStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pricing,
            wallet,
            api_keys,
            clock,
            estimation: EstimationConfig::default(),
        }
    }

    pub fn with_estimation(mut self, estimation: EstimationConfig) -> Self {
        self.estimation = estimation;
        self
    }

    pub fn estimate_cost(&self, model: &str, body: &Value) -> CostEstimate {
        let price = self.pricing.price(model);
        let estimate = estimate(body, &price, &self.estimation);
        debug!(
            model,
            input_tokens = estimate.input_tokens,
            output_tokens = %estimate.output_tokens,
            cost = %estimate.cost,
            "Estimated request cost"
        );
        estimate
    }

    pub async fn check_balance(&self, tenant: &TenantId, estimated_cost: Decimal) -> Result<bool> {
        Ok(self
            .wallet
            .has_sufficient_balance(tenant, estimated_cost)
            .await?)
    }

    /// First cost ceiling the key has already reached, if any
    pub fn check_cost_ceilings(&self, api_key: &ApiKey) -> Option<LimitKind> {
        let used = api_key.usage.effective(self.clock.now());
        [
            (LimitKind::Daily, used.daily),
            (LimitKind::Monthly, used.monthly),
            (LimitKind::Total, used.total),
        ]
        .into_iter()
        .find(|(kind, spent)| api_key.limit(*kind).is_some_and(|limit| *spent >= limit))
        .map(|(kind, _)| kind)
    }

    /// Exact cost from reported usage, no margin
    pub fn compute_cost(&self, model: &str, usage: &TokenUsage) -> Decimal {
        self.pricing.price(model).cost_of(usage)
    }

    /// Debit the tenant and record the spend against the key
    pub async fn settle(
        &self,
        api_key: &ApiKey,
        tenant: &TenantId,
        cost: Decimal,
        request_log_id: &str,
    ) -> Result<Settlement> {
        if cost <= Decimal::ZERO {
            return Ok(Settlement::Free);
        }

        let description = format!("API usage ({})", api_key.name);
        let debited = self
            .wallet
            .deduct(tenant, cost, &description, request_log_id)
            .await?;
        if !debited {
            warn!(
                tenant_id = %tenant,
                api_key_id = %api_key.id,
                cost = %cost,
                "Settlement declined, balance no longer covers cost"
            );
            return Ok(Settlement::Declined { cost });
        }

        // The debit stands either way; a lost counter update only under-reports spend.
        if let Err(e) = self
            .api_keys
            .update_usage_counters(&api_key.id, cost, self.clock.now())
            .await
        {
            warn!(
                api_key_id = %api_key.id,
                cost = %cost,
                error = %e,
                "Failed to update API key cost counters after debit"
            );
        }
        info!(tenant_id = %tenant, api_key_id = %api_key.id, cost = %cost, "Settled request");
        Ok(Settlement::Settled { cost })
    }
}
