//! Tenant-facing API keys
//!
//! The gateway reads keys, bumps `last_used_at` on lookup, and adds settled cost to
//! the running counters. Daily and monthly counters roll over lazily: a counter
//! last updated on an earlier UTC day (or month) is read as zero.

use chrono::{DateTime, Datelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::tenant::TenantId;

/// Upstream service family a key may be allowed to reach
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Claude,
    Gemini,
    #[serde(rename = "openai")]
    OpenAi,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Claude => "claude",
            Service::Gemini => "gemini",
            Service::OpenAi => "openai",
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability flags derived from the key's configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedServices {
    #[serde(default = "enabled")]
    pub claude: bool,
    #[serde(default = "enabled")]
    pub gemini: bool,
    #[serde(default = "enabled")]
    pub openai: bool,
}

fn enabled() -> bool {
    true
}

impl Default for AllowedServices {
    fn default() -> Self {
        Self {
            claude: true,
            gemini: true,
            openai: true,
        }
    }
}

impl AllowedServices {
    pub fn permits(&self, service: Service) -> bool {
        match service {
            Service::Claude => self.claude,
            Service::Gemini => self.gemini,
            Service::OpenAi => self.openai,
        }
    }
}

/// Which cost ceiling was breached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitKind {
    Daily,
    Monthly,
    Total,
}

impl LimitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitKind::Daily => "daily",
            LimitKind::Monthly => "monthly",
            LimitKind::Total => "total",
        }
    }
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Running cost counters for one key
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostCounters {
    #[serde(default)]
    pub daily: Decimal,
    #[serde(default)]
    pub monthly: Decimal,
    #[serde(default)]
    pub total: Decimal,
    /// Instant of the last counter update, drives lazy rollover
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl CostCounters {
    /// Counters as they read at `now`, with daily/monthly reset on a UTC boundary
    pub fn effective(&self, now: DateTime<Utc>) -> CostCounters {
        let Some(updated_at) = self.updated_at else {
            return self.clone();
        };

        let same_month = updated_at.year() == now.year() && updated_at.month() == now.month();
        let same_day = same_month && updated_at.day() == now.day();

        CostCounters {
            daily: if same_day { self.daily } else { Decimal::ZERO },
            monthly: if same_month { self.monthly } else { Decimal::ZERO },
            total: self.total,
            updated_at: Some(updated_at),
        }
    }

    /// Add `cost` to every counter after applying rollover
    pub fn add(&self, cost: Decimal, now: DateTime<Utc>) -> CostCounters {
        let current = self.effective(now);
        CostCounters {
            daily: current.daily + cost,
            monthly: current.monthly + cost,
            total: current.total + cost,
            updated_at: Some(now),
        }
    }
}

/// Tenant-facing credential
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    /// The secret value callers present
    pub key: String,
    #[serde(default)]
    pub name: String,
    pub owner_id: TenantId,
    #[serde(default = "enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub services: AllowedServices,
    /// Case-insensitive allow-list; empty allows every model
    #[serde(default)]
    pub allowed_models: Vec<String>,
    /// Replaces the requested model before selection
    #[serde(default)]
    pub model_override: Option<String>,
    /// Pins every request to one account, bypassing the pool
    #[serde(default)]
    pub bound_account_id: Option<String>,
    #[serde(default)]
    pub daily_cost_limit: Option<Decimal>,
    #[serde(default)]
    pub monthly_cost_limit: Option<Decimal>,
    #[serde(default)]
    pub total_cost_limit: Option<Decimal>,
    #[serde(default)]
    pub usage: CostCounters,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
    /// Declared for an external limiter; the dispatch core does not enforce it
    #[serde(default)]
    pub concurrency_limit: Option<u32>,
}

impl ApiKey {
    pub fn new(id: impl Into<String>, key: impl Into<String>, owner_id: TenantId) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            key: key.into(),
            owner_id,
            enabled: true,
            expires_at: None,
            services: AllowedServices::default(),
            allowed_models: Vec::new(),
            model_override: None,
            bound_account_id: None,
            daily_cost_limit: None,
            monthly_cost_limit: None,
            total_cost_limit: None,
            usage: CostCounters::default(),
            last_used_at: None,
            concurrency_limit: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn permits_model(&self, model: &str) -> bool {
        self.allowed_models.is_empty()
            || self
                .allowed_models
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(model))
    }

    /// Configured limit for a ceiling kind, ignoring non-positive values
    pub fn limit(&self, kind: LimitKind) -> Option<Decimal> {
        let limit = match kind {
            LimitKind::Daily => self.daily_cost_limit,
            LimitKind::Monthly => self.monthly_cost_limit,
            LimitKind::Total => self.total_cost_limit,
        };
        limit.filter(|l| *l > Decimal::ZERO)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiKey")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("enabled", &self.enabled)
            .field("expires_at", &self.expires_at)
            .field("services", &self.services)
            .field("allowed_models", &self.allowed_models)
            .field("model_override", &self.model_override)
            .field("bound_account_id", &self.bound_account_id)
            .field("usage", &self.usage)
            .finish_non_exhaustive()
    }
}
