//! OpenAI-compatible egress connector
//!
//! Serves OpenAI accounts and Gemini accounts (through Gemini's OpenAI-compatible
//! endpoint). Both authenticate with a bearer key. Streaming requests ask for a
//! final usage chunk so token accounting works.

use async_trait::async_trait;
use relaygate_core::{
    Platform, UpstreamClient, UpstreamContext, UpstreamError, UpstreamEventStream,
    UpstreamRequest, UpstreamResponse,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
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

/// OpenAI-compatible connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    /// Base URL including the version segment for OpenAI accounts
    pub openai_base_url: String,

    /// Base URL of Gemini's OpenAI-compatible surface
    pub gemini_base_url: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            openai_base_url: "https://api.openai.com/v1".to_string(),
            gemini_base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
        }
    }
}

pub struct OpenAiCompatClient {
    config: OpenAiConfig,
    clients: Arc<ClientPool>,
    rate_limits: RateLimitPolicy,
}

impl OpenAiCompatClient {
    pub fn new(
        config: OpenAiConfig,
        clients: Arc<ClientPool>,
        rate_limits: RateLimitPolicy,
    ) -> Self {
        Self {
            config,
            clients,
            rate_limits,
        }
    }

    fn completions_url(&self, ctx: &UpstreamContext) -> String {
        let default = match ctx.platform {
            Platform::Gemini => &self.config.gemini_base_url,
            _ => &self.config.openai_base_url,
        };
        let base = ctx.base_url.as_deref().unwrap_or(default);
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    fn prepare(&self, request: &UpstreamRequest) -> Value {
        let mut body = prepare_body(request);
        if request.stream {
            if let Some(obj) = body.as_object_mut() {
                let options = obj
                    .entry("stream_options")
                    .or_insert_with(|| json!({}));
                if let Some(options) = options.as_object_mut() {
                    options
                        .entry("include_usage")
                        .or_insert(Value::Bool(true));
                }
            }
        }
        body
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
            .post(self.completions_url(ctx))
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {}", ctx.credential));

        for (name, value) in &request.passthrough_headers {
            if should_forward_header(name) {
                builder = builder.header(name.as_str(), value.as_str());
            }
        }
        if request.stream {
            builder = builder.header("Accept", "text/event-stream");
        }

        Ok(builder.json(&self.prepare(request)))
    }
}

#[async_trait]
impl UpstreamClient for OpenAiCompatClient {
    #[instrument(skip_all, fields(account_id = %ctx.account_id, platform = %ctx.platform, model = %request.model))]
    async fn complete(
        &self,
        ctx: &UpstreamContext,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError> {
        debug!("Sending pass-through chat completion");
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

    #[instrument(skip_all, fields(account_id = %ctx.account_id, platform = %ctx.platform, model = %request.model))]
    async fn stream_complete(
        &self,
        ctx: &UpstreamContext,
        request: UpstreamRequest,
    ) -> Result<UpstreamEventStream, UpstreamError> {
        debug!("Sending pass-through streaming chat completion");
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
