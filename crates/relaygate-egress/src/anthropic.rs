//! Claude egress connector
//!
//! Serves both Claude platforms: subscription accounts authenticate with an OAuth
//! bearer token plus the OAuth beta flag, Console accounts with `x-api-key`. The
//! caller's Messages API body is forwarded unchanged apart from the model.

use async_trait::async_trait;
use relaygate_core::{
    Platform, UpstreamClient, UpstreamContext, UpstreamError, UpstreamEventStream,
    UpstreamRequest, UpstreamResponse,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::{
    EgressError,
    client::{ClientPool, with_retry},
    upstream::{
        RateLimitPolicy, buffered_response, error_from_response, event_stream, prepare_body,
        should_forward_header, transport_error,
    },
};

/// Beta flag required for OAuth bearer tokens
pub const OAUTH_BETA: &str = "oauth-2025-04-20";

/// Claude connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    /// Base URL for the Anthropic API (default: https://api.anthropic.com)
    pub base_url: String,

    /// Anthropic API version sent when the caller does not send one
    pub api_version: String,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.anthropic.com".to_string(),
            api_version: "2023-06-01".to_string(),
        }
    }
}

impl AnthropicConfig {
    /// Set the base URL (for custom endpoints)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

pub struct ClaudeClient {
    config: AnthropicConfig,
    clients: Arc<ClientPool>,
    rate_limits: RateLimitPolicy,
}

impl ClaudeClient {
    pub fn new(
        config: AnthropicConfig,
        clients: Arc<ClientPool>,
        rate_limits: RateLimitPolicy,
    ) -> Self {
        Self {
            config,
            clients,
            rate_limits,
        }
    }

    fn messages_url(&self, ctx: &UpstreamContext) -> String {
        let base = ctx.base_url.as_deref().unwrap_or(&self.config.base_url);
        format!("{}/v1/messages", base.trim_end_matches('/'))
    }

    fn build_request(
        &self,
        ctx: &UpstreamContext,
        request: &UpstreamRequest,
    ) -> Result<reqwest::RequestBuilder, UpstreamError> {
        let client = self
            .clients
            .client_for(ctx.proxy.as_ref())
            .map_err(transport_error)?;

        let mut builder = client
            .post(self.messages_url(ctx))
            .header("Content-Type", "application/json");

        let mut has_version = false;
        let mut beta: Option<String> = None;
        for (name, value) in &request.passthrough_headers {
            if !should_forward_header(name) {
                continue;
            }
            if name.eq_ignore_ascii_case("anthropic-beta") {
                beta = Some(value.clone());
                continue;
            }
            if name.eq_ignore_ascii_case("anthropic-version") {
                has_version = true;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !has_version {
            builder = builder.header("anthropic-version", &self.config.api_version);
        }

        if ctx.platform == Platform::Claude {
            let beta = match beta {
                Some(existing) if existing.split(',').any(|b| b.trim() == OAUTH_BETA) => existing,
                Some(existing) => format!("{existing},{OAUTH_BETA}"),
                None => OAUTH_BETA.to_string(),
            };
            builder = builder
                .header("Authorization", format!("Bearer {}", ctx.credential))
                .header("anthropic-beta", beta);
        } else {
            if let Some(beta) = beta {
                builder = builder.header("anthropic-beta", beta);
            }
            builder = builder.header("x-api-key", &ctx.credential);
        }

        if request.stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        Ok(builder.json(&prepare_body(request)))
    }
}

#[async_trait]
impl UpstreamClient for ClaudeClient {
    #[instrument(skip_all, fields(account_id = %ctx.account_id, model = %request.model))]
    async fn complete(
        &self,
        ctx: &UpstreamContext,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError> {
        debug!("Sending pass-through request to Claude");
        let max_retries = self.clients.config().max_retries;
        let response = with_retry(max_retries, || {
            let built = self.build_request(ctx, &request);
            async move {
                let builder = built.map_err(|e| EgressError::ConfigError(e.to_string()))?;
                Ok(builder.send().await?)
            }
        })
        .await
        .map_err(transport_error)?;

        if !response.status().is_success() {
            return Err(error_from_response(response, &self.rate_limits).await);
        }
        buffered_response(response).await
    }

    #[instrument(skip_all, fields(account_id = %ctx.account_id, model = %request.model))]
    async fn stream_complete(
        &self,
        ctx: &UpstreamContext,
        request: UpstreamRequest,
    ) -> Result<UpstreamEventStream, UpstreamError> {
        debug!("Sending pass-through streaming request to Claude");
        let response = self
            .build_request(ctx, &request)?
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(error_from_response(response, &self.rate_limits).await);
        }
        Ok(event_stream(response))
    }
}
