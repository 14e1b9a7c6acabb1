//! OAuth refresh-token grant
//!
//! Exchanges a Claude subscription refresh token for a new access token at the
//! provider's token endpoint, through the account's outbound proxy.

use async_trait::async_trait;
use relaygate_core::ProxyConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use crate::{EgressError, Result, client::ClientPool};

/// Token endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OAuthConfig {
    pub token_url: String,
    pub client_id: String,
    /// Lifetime assumed when the endpoint omits `expires_in`
    pub default_expires_in_secs: i64,
}

impl Default for OAuthConfig {
    fn default() -> Self {
        Self {
            token_url: "https://console.anthropic.com/v1/oauth/token".to_string(),
            client_id: "9d1c250a-e61b-44d9-88ed-5944d1962f5e".to_string(),
            default_expires_in_secs: 3600,
        }
    }
}

/// Longest token lifetime accepted from the token endpoint
pub const MAX_EXPIRES_IN_SECS: i64 = 30 * 24 * 3600;

/// Result of a successful refresh grant
#[derive(Clone, PartialEq, Eq)]
pub struct RefreshedToken {
    pub access_token: String,
    /// Rotated refresh token, when the endpoint issued one
    pub refresh_token: Option<String>,
    pub expires_in_secs: i64,
}

impl std::fmt::Debug for RefreshedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshedToken")
            .field("expires_in_secs", &self.expires_in_secs)
            .finish_non_exhaustive()
    }
}

/// Performs the refresh grant
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(
        &self,
        refresh_token: &str,
        proxy: Option<&ProxyConfig>,
    ) -> Result<RefreshedToken>;
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
    client_id: &'a str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// [`TokenRefresher`] that POSTs a JSON refresh grant
pub struct HttpTokenRefresher {
    config: OAuthConfig,
    clients: Arc<ClientPool>,
}

impl HttpTokenRefresher {
    pub fn new(config: OAuthConfig, clients: Arc<ClientPool>) -> Self {
        Self { config, clients }
    }

    /// Lifetime to store for a granted token
    ///
    /// Missing or non-positive values fall back to the configured default;
    /// everything is capped at [`MAX_EXPIRES_IN_SECS`].
    fn token_lifetime(&self, expires_in: Option<i64>) -> i64 {
        match expires_in {
            Some(secs) if secs > 0 => secs.min(MAX_EXPIRES_IN_SECS),
            Some(secs) => {
                warn!(expires_in = secs, "Ignoring non-positive expires_in from token endpoint");
                self.config.default_expires_in_secs
            }
            None => self.config.default_expires_in_secs,
        }
        .clamp(0, MAX_EXPIRES_IN_SECS)
    }
}

#[async_trait]
impl TokenRefresher for HttpTokenRefresher {
    #[instrument(skip_all, fields(token_url = %self.config.token_url))]
    async fn refresh(
        &self,
        refresh_token: &str,
        proxy: Option<&ProxyConfig>,
    ) -> Result<RefreshedToken> {
        if refresh_token.is_empty() {
            return Err(EgressError::ConfigError(
                "account has no refresh token".to_string(),
            ));
        }

        let client = self.clients.client_for(proxy)?;
        let response = client
            .post(&self.config.token_url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .json(&RefreshRequest {
                grant_type: "refresh_token",
                refresh_token,
                client_id: &self.config.client_id,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error body".to_string());
            return Err(EgressError::ProviderError {
                status_code: status.as_u16(),
                message,
            });
        }

        let body: RefreshResponse = response
            .json()
            .await
            .map_err(|e| EgressError::ParseError(format!("Invalid token response: {}", e)))?;

        if body.access_token.is_empty() {
            return Err(EgressError::ParseError(
                "token response carried an empty access_token".to_string(),
            ));
        }

        debug!(expires_in = ?body.expires_in, "Refresh grant succeeded");
        Ok(RefreshedToken {
            access_token: body.access_token,
            refresh_token: body.refresh_token.filter(|t| !t.is_empty()),
            expires_in_secs: self.token_lifetime(body.expires_in),
        })
    }
}
