//! Credential refresher
//!
//! Hands out a usable upstream credential for an account. OAuth accounts whose
//! access token expires within the skew window are refreshed first; concurrent
//! callers for the same account wait on one refresh and re-read the stored token.
//! A failed refresh falls back to the existing access token when there is one.

use dashmap::DashMap;
use relaygate_core::{Account, AccountStore, Clock, OAuthCredentials};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::oauth::{MAX_EXPIRES_IN_SECS, TokenRefresher};

/// Default refresh skew in seconds
pub const DEFAULT_REFRESH_SKEW_SECS: i64 = 60;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("No valid credential for account {0}")]
    NoValidCredential(String),

    #[error(transparent)]
    Store(#[from] relaygate_core::Error),
}

/// How the returned credential was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOutcome {
    /// Static API key
    Static,
    /// OAuth token that did not need refreshing
    Fresh,
    Refreshed,
    /// Refresh failed; the previous access token is used
    StaleFallback,
}

impl CredentialOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialOutcome::Static => "static",
            CredentialOutcome::Fresh => "fresh",
            CredentialOutcome::Refreshed => "refreshed",
            CredentialOutcome::StaleFallback => "stale_fallback",
        }
    }
}

#[derive(Clone)]
pub struct ValidCredential {
    pub token: String,
    pub outcome: CredentialOutcome,
}

impl std::fmt::Debug for ValidCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidCredential")
            .field("outcome", &self.outcome)
            .finish_non_exhaustive()
    }
}

pub struct CredentialRefresher {
    store: Arc<dyn AccountStore>,
    refresher: Arc<dyn TokenRefresher>,
    clock: Arc<dyn Clock>,
    skew_secs: i64,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl CredentialRefresher {
    pub fn new(
        store: Arc<dyn AccountStore>,
        refresher: Arc<dyn TokenRefresher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            refresher,
            clock,
            skew_secs: DEFAULT_REFRESH_SKEW_SECS,
            locks: DashMap::new(),
        }
    }

    pub fn with_skew_secs(mut self, skew_secs: i64) -> Self {
        self.skew_secs = skew_secs;
        self
    }

    /// Credential to present upstream for `account`
    pub async fn get_valid_token(
        &self,
        account: &Account,
    ) -> Result<ValidCredential, CredentialError> {
        let credential = match (account.platform.uses_oauth(), account.oauth.as_ref()) {
            (true, Some(oauth)) => self.oauth_token(account, oauth).await?,
            _ => ValidCredential {
                token: account.api_key.clone().unwrap_or_default(),
                outcome: CredentialOutcome::Static,
            },
        };

        if credential.token.is_empty() {
            return Err(CredentialError::NoValidCredential(account.id.clone()));
        }

        self.store
            .update_last_used(&account.id, self.clock.now(), true)
            .await?;
        Ok(credential)
    }

    async fn oauth_token(
        &self,
        account: &Account,
        oauth: &OAuthCredentials,
    ) -> Result<ValidCredential, CredentialError> {
        if !oauth.expires_within(self.clock.now(), self.skew_secs) {
            return Ok(ValidCredential {
                token: oauth.access_token.clone(),
                outcome: CredentialOutcome::Fresh,
            });
        }

        let lock = self
            .locks
            .entry(account.id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another waiter may have refreshed while we queued.
        let current = self
            .store
            .get_by_id(&account.id)
            .await?
            .and_then(|a| a.oauth)
            .unwrap_or_else(|| oauth.clone());
        let now = self.clock.now();
        if !current.expires_within(now, self.skew_secs) {
            debug!(account_id = %account.id, "Token already refreshed by a concurrent request");
            return Ok(ValidCredential {
                token: current.access_token,
                outcome: CredentialOutcome::Fresh,
            });
        }

        match self
            .refresher
            .refresh(&current.refresh_token, account.proxy.as_ref())
            .await
        {
            Ok(refreshed) => {
                let tokens = OAuthCredentials {
                    access_token: refreshed.access_token,
                    refresh_token: refreshed
                        .refresh_token
                        .unwrap_or_else(|| current.refresh_token.clone()),
                    expires_at: now
                        .timestamp()
                        .saturating_add(refreshed.expires_in_secs.clamp(0, MAX_EXPIRES_IN_SECS)),
                };
                self.store
                    .update_oauth_token(&account.id, tokens.clone())
                    .await?;
                info!(
                    account_id = %account.id,
                    expires_at = tokens.expires_at,
                    "Refreshed OAuth access token"
                );
                Ok(ValidCredential {
                    token: tokens.access_token,
                    outcome: CredentialOutcome::Refreshed,
                })
            }
            Err(e) => {
                warn!(
                    account_id = %account.id,
                    error = %e,
                    "OAuth refresh failed, falling back to existing access token"
                );
                Ok(ValidCredential {
                    token: current.access_token,
                    outcome: CredentialOutcome::StaleFallback,
                })
            }
        }
    }
}
