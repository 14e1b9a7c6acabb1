//! Collaborator store traits
//!
//! Persistence of accounts, API keys, request logs and tenant balances lives
//! outside the gateway. Every mutation is an explicit command performing a single
//! field-level update, so concurrent requests never race through a
//! load-mutate-save cycle.
//!
//! [`crate::memory`] provides in-process implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{
    Result,
    account::{Account, OAuthCredentials, Platform},
    api_key::ApiKey,
    tenant::TenantId,
    usage::TokenUsage,
};

/// Upstream account storage
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn get_by_id(&self, id: &str) -> Result<Option<Account>>;

    /// Accounts on the given platforms that are not disabled
    ///
    /// Rate-limited accounts are included; callers decide availability against
    /// their own clock.
    async fn list_available(&self, platforms: &[Platform]) -> Result<Vec<Account>>;

    /// Set `last_used_at`, optionally incrementing `usage_count`
    async fn update_last_used(&self, id: &str, at: DateTime<Utc>, increment_usage: bool)
    -> Result<()>;

    /// Atomically set status=rate_limited, the window end and the last error
    async fn mark_rate_limited(
        &self,
        id: &str,
        until: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Result<()>;

    /// Return a rate-limited account to active if its window ended before `now`
    ///
    /// Returns `true` when the stored record was changed. A window extended by a
    /// concurrent mark is left untouched.
    async fn clear_rate_limit(&self, id: &str, now: DateTime<Utc>) -> Result<bool>;

    /// Persist a rotated OAuth token set
    async fn update_oauth_token(&self, id: &str, tokens: OAuthCredentials) -> Result<()>;
}

/// Tenant API key storage
#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    /// Look up a key by its secret value, bumping `last_used_at` to `now`
    async fn get_by_value(&self, key: &str, now: DateTime<Utc>) -> Result<Option<ApiKey>>;

    /// Add settled cost to the daily/monthly/total counters
    async fn update_usage_counters(&self, id: &str, cost: Decimal, now: DateTime<Utc>)
    -> Result<()>;
}

/// Tenant balance ledger
#[async_trait]
pub trait Wallet: Send + Sync {
    async fn has_sufficient_balance(&self, tenant: &TenantId, amount: Decimal) -> Result<bool>;

    /// Debit `amount`; returns `false` without debiting when the balance is short
    async fn deduct(
        &self,
        tenant: &TenantId,
        amount: Decimal,
        description: &str,
        request_log_id: &str,
    ) -> Result<bool>;
}

/// Final state of a logged request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Pending,
    Success,
    Failed,
    RateLimited,
    Canceled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Success => "success",
            RequestStatus::Failed => "failed",
            RequestStatus::RateLimited => "rate_limited",
            RequestStatus::Canceled => "canceled",
        }
    }
}

/// Row written once an account has been chosen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRequestLog {
    pub request_id: String,
    pub api_key_id: String,
    pub tenant_id: TenantId,
    pub account_id: String,
    pub platform: Platform,
    pub requested_model: String,
    pub upstream_model: String,
    pub stream: bool,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogCompletion {
    pub status: RequestStatus,
    pub usage: TokenUsage,
    pub cost: Decimal,
    pub http_status: u16,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Request log storage; each created row is completed exactly once
#[async_trait]
pub trait RequestLogStore: Send + Sync {
    async fn create(&self, entry: NewRequestLog) -> Result<String>;

    async fn complete(&self, log_id: &str, completion: RequestLogCompletion) -> Result<()>;
}
