//! Account pool
//!
//! Resolution order for one request:
//! 1. the key's bound account, when available;
//! 2. the session's sticky account, when available (evicted otherwise);
//! 3. the lowest-scoring available candidate that serves the requested model.
//!
//! The pool works on a snapshot read from the store and never holds a lock across
//! scoring, so an account may be chosen moments before another request marks it
//! rate limited.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use relaygate_core::{Account, AccountStore, ApiKey, Clock, Platform};

use crate::affinity::SessionAffinityCache;
use crate::rate_limit::RateLimitController;
use crate::scoring::{ScoringWeights, score};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("{}", no_account_message(model.as_deref(), *filtered_by_model))]
    NoAvailableAccount {
        model: Option<String>,
        /// Candidates existed but none supports the requested model
        filtered_by_model: bool,
    },

    #[error(transparent)]
    Store(#[from] relaygate_core::Error),
}

fn no_account_message(model: Option<&str>, filtered_by_model: bool) -> String {
    match (model, filtered_by_model) {
        (Some(model), true) => format!("No available account supports model '{model}'"),
        _ => "No available accounts".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// How an account was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SelectionSource {
    Bound,
    Sticky,
    Scored,
}

impl SelectionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SelectionSource::Bound => "bound",
            SelectionSource::Sticky => "sticky",
            SelectionSource::Scored => "scored",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub account: Account,
    pub source: SelectionSource,
    /// Set for scored selections
    pub score: Option<f64>,
}

#[derive(Clone)]
pub struct AccountPool {
    store: Arc<dyn AccountStore>,
    affinity: SessionAffinityCache,
    rate_limits: RateLimitController,
    clock: Arc<dyn Clock>,
    weights: ScoringWeights,
}

impl AccountPool {
    pub fn new(
        store: Arc<dyn AccountStore>,
        affinity: SessionAffinityCache,
        rate_limits: RateLimitController,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            affinity,
            rate_limits,
            clock,
            weights: ScoringWeights::default(),
        }
    }

    pub fn with_weights(mut self, weights: ScoringWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn rate_limits(&self) -> &RateLimitController {
        &self.rate_limits
    }

    /// Select across every platform the key may use
    pub async fn select(
        &self,
        api_key: &ApiKey,
        session_hash: Option<&str>,
        model: Option<&str>,
    ) -> Result<Selection> {
        self.select_within(api_key, &Platform::ALL, session_hash, model)
            .await
    }

    /// Select among accounts on `platforms` that the key's services permit
    pub async fn select_within(
        &self,
        api_key: &ApiKey,
        platforms: &[Platform],
        session_hash: Option<&str>,
        model: Option<&str>,
    ) -> Result<Selection> {
        let now = self.clock.now();
        let session_hash = session_hash.filter(|h| !h.is_empty());
        let eligible = |account: &Account| {
            platforms.contains(&account.platform)
                && api_key.services.permits(account.platform.service())
        };

        if let Some(bound_id) = api_key.bound_account_id.as_deref() {
            if let Some(account) = self.usable(bound_id, now, &eligible).await? {
                debug!(account_id = %account.id, api_key_id = %api_key.id, "Using bound account");
                return self.finish(account, SelectionSource::Bound, None, now).await;
            }
            debug!(account_id = %bound_id, "Bound account unavailable, falling back to pool");
        }

        if let Some(hash) = session_hash {
            if let Some(account_id) = self.affinity.get(hash).await {
                match self.usable(&account_id, now, &eligible).await? {
                    Some(account) => {
                        debug!(account_id = %account.id, session_hash = %hash, "Using sticky account");
                        return self.finish(account, SelectionSource::Sticky, None, now).await;
                    }
                    None => self.affinity.evict(hash).await,
                }
            }
        }

        let allowed: Vec<Platform> = platforms
            .iter()
            .copied()
            .filter(|p| api_key.services.permits(p.service()))
            .collect();

        let mut available = Vec::new();
        for mut account in self.store.list_available(&allowed).await? {
            self.rate_limits.recover_if_expired(&mut account, now).await;
            if RateLimitController::is_available(&account, now) {
                available.push(account);
            }
        }

        let had_available = !available.is_empty();
        let mut candidates: Vec<(f64, Account)> = available
            .into_iter()
            .filter(|a| model.is_none_or(|m| a.supports_model(m)))
            .map(|a| (score(&a, now, &self.weights), a))
            .collect();

        if candidates.is_empty() {
            let filtered_by_model = had_available && model.is_some();
            warn!(
                model = model.unwrap_or(""),
                filtered_by_model,
                "No available account for request"
            );
            return Err(PoolError::NoAvailableAccount {
                model: model.map(str::to_string),
                filtered_by_model,
            });
        }

        candidates.sort_by(|(sa, a), (sb, b)| {
            sa.total_cmp(sb)
                .then_with(|| a.priority.cmp(&b.priority))
                .then_with(|| a.id.cmp(&b.id))
        });
        let (best_score, account) = candidates.swap_remove(0);

        if let Some(hash) = session_hash {
            self.affinity.set(hash, &account.id).await;
        }

        debug!(
            account_id = %account.id,
            score = best_score,
            model = model.unwrap_or(""),
            "Selected account by score"
        );
        self.finish(account, SelectionSource::Scored, Some(best_score), now)
            .await
    }

    /// Fetch an account and return it only if it can serve this request
    async fn usable(
        &self,
        id: &str,
        now: DateTime<Utc>,
        eligible: &impl Fn(&Account) -> bool,
    ) -> Result<Option<Account>> {
        let Some(mut account) = self.store.get_by_id(id).await? else {
            return Ok(None);
        };
        if !eligible(&account) {
            return Ok(None);
        }
        self.rate_limits.recover_if_expired(&mut account, now).await;
        Ok(RateLimitController::is_available(&account, now).then_some(account))
    }

    async fn finish(
        &self,
        mut account: Account,
        source: SelectionSource,
        score: Option<f64>,
        now: DateTime<Utc>,
    ) -> Result<Selection> {
        let increment = source == SelectionSource::Scored;
        self.store
            .update_last_used(&account.id, now, increment)
            .await?;
        account.last_used_at = Some(now);
        if increment {
            account.usage_count = account.usage_count.saturating_add(1);
        }
        Ok(Selection {
            account,
            source,
            score,
        })
    }
}
