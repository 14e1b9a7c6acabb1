//! In-memory collaborator backends
//!
//! `DashMap`-backed implementations of the store traits. Every command mutates a
//! single entry under its shard lock, which gives the field-level atomicity the
//! traits promise. Used by the file-backed configuration and by tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::{
    Error, Result,
    account::{Account, AccountStatus, OAuthCredentials, Platform},
    api_key::ApiKey,
    store::{
        AccountStore, ApiKeyStore, NewRequestLog, RequestLogCompletion, RequestLogStore, Wallet,
    },
    tenant::TenantId,
};

#[derive(Debug, Default)]
pub struct InMemoryAccountStore {
    accounts: DashMap<String, Account>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_accounts(accounts: impl IntoIterator<Item = Account>) -> Self {
        let store = Self::new();
        for account in accounts {
            store.insert(account);
        }
        store
    }

    pub fn insert(&self, account: Account) {
        self.accounts.insert(account.id.clone(), account);
    }

    /// Snapshot of an account, for inspection
    pub fn get(&self, id: &str) -> Option<Account> {
        self.accounts.get(id).map(|a| a.clone())
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Snapshot of every account
    pub fn all(&self) -> Vec<Account> {
        self.accounts.iter().map(|a| a.value().clone()).collect()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<Account>> {
        Ok(self.get(id))
    }

    async fn list_available(&self, platforms: &[Platform]) -> Result<Vec<Account>> {
        let mut accounts: Vec<Account> = self
            .accounts
            .iter()
            .filter(|a| a.status != AccountStatus::Disabled && platforms.contains(&a.platform))
            .map(|a| a.value().clone())
            .collect();
        accounts.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(accounts)
    }

    async fn update_last_used(
        &self,
        id: &str,
        at: DateTime<Utc>,
        increment_usage: bool,
    ) -> Result<()> {
        let mut account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| Error::AccountNotFound(id.to_string()))?;
        account.last_used_at = Some(at);
        if increment_usage {
            account.usage_count = account.usage_count.saturating_add(1);
        }
        Ok(())
    }

    async fn mark_rate_limited(
        &self,
        id: &str,
        until: DateTime<Utc>,
        last_error: Option<String>,
    ) -> Result<()> {
        let mut account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| Error::AccountNotFound(id.to_string()))?;
        account.status = AccountStatus::RateLimited;
        account.rate_limited_until = Some(until);
        account.last_error = last_error;
        debug!(account_id = %id, until = %until, "Account marked rate limited");
        Ok(())
    }

    async fn clear_rate_limit(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| Error::AccountNotFound(id.to_string()))?;
        if !account.rate_limit_expired(now) {
            return Ok(false);
        }
        account.status = AccountStatus::Active;
        account.rate_limited_until = None;
        debug!(account_id = %id, "Rate limit window cleared");
        Ok(true)
    }

    async fn update_oauth_token(&self, id: &str, tokens: OAuthCredentials) -> Result<()> {
        let mut account = self
            .accounts
            .get_mut(id)
            .ok_or_else(|| Error::AccountNotFound(id.to_string()))?;
        account.oauth = Some(tokens);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryApiKeyStore {
    /// Keyed by the secret value
    keys: DashMap<String, ApiKey>,
    /// id -> secret value
    ids: DashMap<String, String>,
}

impl InMemoryApiKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keys(keys: impl IntoIterator<Item = ApiKey>) -> Self {
        let store = Self::new();
        for key in keys {
            store.insert(key);
        }
        store
    }

    pub fn insert(&self, key: ApiKey) {
        self.ids.insert(key.id.clone(), key.key.clone());
        self.keys.insert(key.key.clone(), key);
    }

    pub fn get_by_id(&self, id: &str) -> Option<ApiKey> {
        let value = self.ids.get(id)?;
        self.keys.get(value.as_str()).map(|k| k.clone())
    }
}

#[async_trait]
impl ApiKeyStore for InMemoryApiKeyStore {
    async fn get_by_value(&self, key: &str, now: DateTime<Utc>) -> Result<Option<ApiKey>> {
        Ok(self.keys.get_mut(key).map(|mut k| {
            k.last_used_at = Some(now);
            k.clone()
        }))
    }

    async fn update_usage_counters(
        &self,
        id: &str,
        cost: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let value = self
            .ids
            .get(id)
            .map(|v| v.clone())
            .ok_or_else(|| Error::ApiKeyNotFound(id.to_string()))?;
        let mut key = self
            .keys
            .get_mut(&value)
            .ok_or_else(|| Error::ApiKeyNotFound(id.to_string()))?;
        key.usage = key.usage.add(cost, now);
        Ok(())
    }
}

/// One successful wallet debit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalletDebit {
    pub id: String,
    pub amount: Decimal,
    pub description: String,
    pub request_log_id: String,
}

#[derive(Debug, Default)]
struct TenantLedger {
    balance: Decimal,
    debits: Vec<WalletDebit>,
}

#[derive(Debug, Default)]
pub struct InMemoryWallet {
    tenants: DashMap<TenantId, TenantLedger>,
}

impl InMemoryWallet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_balance(&self, tenant: TenantId, balance: Decimal) {
        self.tenants.entry(tenant).or_default().balance = balance;
    }

    pub fn balance(&self, tenant: &TenantId) -> Option<Decimal> {
        self.tenants.get(tenant).map(|l| l.balance)
    }

    pub fn debits(&self, tenant: &TenantId) -> Vec<WalletDebit> {
        self.tenants
            .get(tenant)
            .map(|l| l.debits.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Wallet for InMemoryWallet {
    async fn has_sufficient_balance(&self, tenant: &TenantId, amount: Decimal) -> Result<bool> {
        let ledger = self
            .tenants
            .get(tenant)
            .ok_or_else(|| Error::TenantNotFound(tenant.to_string()))?;
        Ok(ledger.balance >= amount)
    }

    async fn deduct(
        &self,
        tenant: &TenantId,
        amount: Decimal,
        description: &str,
        request_log_id: &str,
    ) -> Result<bool> {
        let mut ledger = self
            .tenants
            .get_mut(tenant)
            .ok_or_else(|| Error::TenantNotFound(tenant.to_string()))?;
        if ledger.balance < amount {
            return Ok(false);
        }
        ledger.balance -= amount;
        ledger.debits.push(WalletDebit {
            id: Uuid::new_v4().to_string(),
            amount,
            description: description.to_string(),
            request_log_id: request_log_id.to_string(),
        });
        Ok(true)
    }
}

/// Stored request log row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogRecord {
    pub id: String,
    pub entry: NewRequestLog,
    pub completion: Option<RequestLogCompletion>,
}

#[derive(Debug, Default)]
pub struct InMemoryRequestLogStore {
    records: DashMap<String, RequestLogRecord>,
}

impl InMemoryRequestLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<RequestLogRecord> {
        self.records.get(id).map(|r| r.clone())
    }

    /// All records ordered by start time
    pub fn all(&self) -> Vec<RequestLogRecord> {
        let mut records: Vec<_> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.entry.started_at);
        records
    }
}

#[async_trait]
impl RequestLogStore for InMemoryRequestLogStore {
    async fn create(&self, entry: NewRequestLog) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        self.records.insert(
            id.clone(),
            RequestLogRecord {
                id: id.clone(),
                entry,
                completion: None,
            },
        );
        Ok(id)
    }

    async fn complete(&self, log_id: &str, completion: RequestLogCompletion) -> Result<()> {
        let mut record = self
            .records
            .get_mut(log_id)
            .ok_or_else(|| Error::Store(format!("request log {log_id} not found")))?;
        if record.completion.is_some() {
            return Err(Error::Store(format!("request log {log_id} already completed")));
        }
        record.completion = Some(completion);
        Ok(())
    }
}
