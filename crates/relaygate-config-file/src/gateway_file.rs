//! Gateway file loading
//!
//! A gateway file seeds the in-memory collaborators with upstream accounts,
//! tenant API keys, tenant balances and model prices. YAML and TOML are both
//! accepted; the format is picked from the file extension.

use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

use relaygate_billing::{ModelPrice, StaticPricingTable};
use relaygate_core::{
    Account, ApiKey, Decimal, Error, InMemoryAccountStore, InMemoryApiKeyStore,
    InMemoryRequestLogStore, InMemoryWallet, Result, TenantId,
};

/// Opening balance of one tenant
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TenantBalance {
    pub id: TenantId,
    #[serde(default)]
    pub balance: Decimal,
}

/// Optional price overrides
///
/// Without a `default`, the built-in price list is used as the base and
/// `models` entries are layered on top of it.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PricingSection {
    pub default: Option<ModelPrice>,
    pub models: HashMap<String, ModelPrice>,
}

/// Parsed contents of a gateway file
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayFile {
    pub accounts: Vec<Account>,
    pub api_keys: Vec<ApiKey>,
    pub tenants: Vec<TenantBalance>,
    pub pricing: Option<PricingSection>,
}

/// Collaborator backends seeded from a gateway file
#[derive(Debug, Clone)]
pub struct GatewayBackends {
    pub accounts: Arc<InMemoryAccountStore>,
    pub api_keys: Arc<InMemoryApiKeyStore>,
    pub wallet: Arc<InMemoryWallet>,
    pub request_logs: Arc<InMemoryRequestLogStore>,
    pub pricing: Arc<StaticPricingTable>,
}

impl GatewayFile {
    /// Read, parse and validate a gateway file
    ///
    /// # Errors
    /// - `Error::ConfigNotFound` if the file doesn't exist
    /// - `Error::Io` if it can't be read
    /// - `Error::Config` if it isn't valid YAML/TOML
    /// - `Error::ConfigValidation` if the contents are inconsistent
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = expand_tilde(path.as_ref())?;
        if !path.exists() {
            return Err(Error::ConfigNotFound);
        }

        let contents = std::fs::read_to_string(&path).map_err(|e| {
            error!("Failed to read gateway file: {}", e);
            Error::Io(e)
        })?;

        let file = match path.extension().and_then(|s| s.to_str()) {
            Some("toml") => Self::from_toml(&contents)?,
            _ => Self::from_yaml(&contents)?,
        };
        file.validate()?;

        info!(
            path = %path.display(),
            accounts = file.accounts.len(),
            api_keys = file.api_keys.len(),
            tenants = file.tenants.len(),
            "Loaded gateway file"
        );
        Ok(file)
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).map_err(|e| {
            error!("Failed to parse YAML gateway file: {}", e);
            Error::Config(format!("Invalid YAML: {}", e))
        })
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| {
            error!("Failed to parse TOML gateway file: {}", e);
            Error::Config(format!("Invalid TOML: {}", e))
        })
    }

    /// Check cross-references and value ranges
    pub fn validate(&self) -> Result<()> {
        let mut account_ids = HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                return Err(invalid("account id must not be empty"));
            }
            if !account_ids.insert(account.id.as_str()) {
                return Err(invalid(format!("duplicate account id '{}'", account.id)));
            }
            for entry in &account.supported_models {
                validate_model_entry(&account.id, entry)?;
            }
            if account.platform.uses_oauth() {
                if account.oauth.is_none() {
                    return Err(invalid(format!(
                        "account '{}' on platform {} needs oauth credentials",
                        account.id, account.platform
                    )));
                }
            } else if account.api_key.as_deref().is_none_or(|k| k.trim().is_empty()) {
                return Err(invalid(format!(
                    "account '{}' on platform {} needs an api_key",
                    account.id, account.platform
                )));
            }
        }

        let mut tenant_ids = HashSet::new();
        for tenant in &self.tenants {
            if tenant.id.as_str().trim().is_empty() {
                return Err(invalid("tenant id must not be empty"));
            }
            if !tenant_ids.insert(tenant.id.as_str()) {
                return Err(invalid(format!("duplicate tenant id '{}'", tenant.id)));
            }
            if tenant.balance < Decimal::ZERO {
                return Err(invalid(format!("tenant '{}' has a negative balance", tenant.id)));
            }
        }

        let mut key_ids = HashSet::new();
        let mut key_values = HashSet::new();
        for key in &self.api_keys {
            if key.id.trim().is_empty() || key.key.trim().is_empty() {
                return Err(invalid("api key id and value must not be empty"));
            }
            if !key_ids.insert(key.id.as_str()) {
                return Err(invalid(format!("duplicate api key id '{}'", key.id)));
            }
            if !key_values.insert(key.key.as_str()) {
                return Err(invalid(format!("api key '{}' reuses another key's value", key.id)));
            }
            if !tenant_ids.contains(key.owner_id.as_str()) {
                return Err(invalid(format!(
                    "api key '{}' is owned by unknown tenant '{}'",
                    key.id, key.owner_id
                )));
            }
            if let Some(bound) = &key.bound_account_id
                && !account_ids.contains(bound.as_str())
            {
                return Err(invalid(format!(
                    "api key '{}' is bound to unknown account '{}'",
                    key.id, bound
                )));
            }
            let limits = [
                key.daily_cost_limit,
                key.monthly_cost_limit,
                key.total_cost_limit,
            ];
            if limits.iter().flatten().any(|limit| *limit < Decimal::ZERO) {
                return Err(invalid(format!("api key '{}' has a negative cost limit", key.id)));
            }
        }

        self.pricing_table()?;
        debug!("Gateway file validation passed");
        Ok(())
    }

    /// Price table described by the `pricing` section
    pub fn pricing_table(&self) -> Result<StaticPricingTable> {
        let Some(section) = &self.pricing else {
            return Ok(StaticPricingTable::builtin());
        };

        let mut table = match section.default {
            Some(default) => StaticPricingTable::new(default).map_err(|e| invalid(e.to_string()))?,
            None => StaticPricingTable::builtin(),
        };
        for (model, price) in &section.models {
            if model.trim().is_empty() {
                return Err(invalid("pricing model name must not be empty"));
            }
            table
                .insert(model, *price)
                .map_err(|e| invalid(e.to_string()))?;
        }
        Ok(table)
    }

    /// Seed fresh in-memory backends with this file's contents
    pub fn build(self) -> Result<GatewayBackends> {
        let pricing = self.pricing_table()?;

        let wallet = InMemoryWallet::new();
        for tenant in self.tenants {
            wallet.set_balance(tenant.id, tenant.balance);
        }

        Ok(GatewayBackends {
            accounts: Arc::new(InMemoryAccountStore::with_accounts(self.accounts)),
            api_keys: Arc::new(InMemoryApiKeyStore::with_keys(self.api_keys)),
            wallet: Arc::new(wallet),
            request_logs: Arc::new(InMemoryRequestLogStore::new()),
            pricing: Arc::new(pricing),
        })
    }
}

fn validate_model_entry(account_id: &str, entry: &str) -> Result<()> {
    let well_formed = match entry.split_once(':') {
        Some((source, target)) => !source.trim().is_empty() && !target.trim().is_empty(),
        None => !entry.trim().is_empty(),
    };
    if well_formed {
        Ok(())
    } else {
        Err(invalid(format!(
            "account '{}' has malformed model entry '{}'",
            account_id, entry
        )))
    }
}

fn expand_tilde(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(dirs::home_dir()
            .ok_or_else(|| Error::Config("Could not determine home directory".to_string()))?
            .join(rest)),
        Err(_) => Ok(path.to_path_buf()),
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation(message.into())
}
