//! Shared upstream plumbing
//!
//! Response classification, SSE decoding and the per-platform dispatcher that
//! implements [`UpstreamClient`] over the Claude and OpenAI-compatible clients.

use async_trait::async_trait;
use eventsource_stream::EventStream;
use futures::StreamExt;
use relaygate_core::{
    Clock, MAX_COOLDOWN_SECS, Platform, UpstreamClient, UpstreamContext, UpstreamError,
    UpstreamEvent, UpstreamEventStream, UpstreamRequest, UpstreamResponse, UsageFragment,
    cooldown_until,
};
use reqwest::header::HeaderMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    EgressError, anthropic::ClaudeClient, openai::OpenAiCompatClient,
    retry_after::retry_after_from_headers,
};

/// Response headers relayed back to the caller
const RELAYED_HEADERS: &[&str] = &["request-id", "x-request-id", "openai-processing-ms"];

/// Caller headers that must never reach the upstream verbatim
const BLOCKED_PASSTHROUGH: &[&str] = &[
    "authorization",
    "x-api-key",
    "host",
    "content-length",
    "content-type",
    "accept-encoding",
];

/// Turns throttling responses into a cooldown window
#[derive(Clone)]
pub struct RateLimitPolicy {
    clock: Arc<dyn Clock>,
    fallback_cooldown_secs: u64,
}

impl RateLimitPolicy {
    pub fn new(clock: Arc<dyn Clock>, fallback_cooldown_secs: u64) -> Self {
        Self {
            clock,
            fallback_cooldown_secs,
        }
    }

    pub fn rate_limited(&self, headers: &HeaderMap, message: String) -> UpstreamError {
        let now = self.clock.now();
        let retry_after_secs = retry_after_from_headers(headers, now)
            .unwrap_or(self.fallback_cooldown_secs)
            .min(MAX_COOLDOWN_SECS);
        UpstreamError::RateLimited {
            retry_after_secs,
            limited_until: cooldown_until(now, retry_after_secs),
            message,
        }
    }
}

pub(crate) fn should_forward_header(name: &str) -> bool {
    !BLOCKED_PASSTHROUGH
        .iter()
        .any(|blocked| name.eq_ignore_ascii_case(blocked))
}

pub(crate) fn transport_error(e: EgressError) -> UpstreamError {
    match e {
        EgressError::ProviderError {
            status_code,
            message,
        } => UpstreamError::Status {
            status_code,
            message,
        },
        EgressError::ParseError(message) => UpstreamError::Parse(message),
        other => UpstreamError::Transport(other.to_string()),
    }
}

/// Classify a non-success response
pub(crate) async fn error_from_response(
    response: reqwest::Response,
    policy: &RateLimitPolicy,
) -> UpstreamError {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let message = response
        .text()
        .await
        .unwrap_or_else(|_| "Unable to read error body".to_string());

    if status == 429 {
        let error = policy.rate_limited(&headers, message);
        warn!(error = %error, "Upstream signalled rate limit");
        error
    } else {
        UpstreamError::Status {
            status_code: status,
            message,
        }
    }
}

pub(crate) fn relayed_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            RELAYED_HEADERS.contains(&name.as_str())
                || name.as_str().starts_with("anthropic-ratelimit-")
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.to_string(), v.to_string()))
        })
        .collect()
}

/// Read a buffered JSON body and the usage it reports
pub(crate) async fn buffered_response(
    response: reqwest::Response,
) -> Result<UpstreamResponse, UpstreamError> {
    let status = response.status().as_u16();
    let headers = relayed_headers(response.headers());
    let body: Value = response
        .json()
        .await
        .map_err(|e| UpstreamError::Parse(format!("Failed to parse upstream response: {}", e)))?;
    let usage = UsageFragment::from_event(&body).usage().unwrap_or_default();
    debug!(status, ?usage, "Buffered upstream response");
    Ok(UpstreamResponse {
        status,
        body,
        usage,
        headers,
    })
}

/// Decode an SSE body into events, keeping payloads verbatim
pub(crate) fn event_stream(response: reqwest::Response) -> UpstreamEventStream {
    let stream = EventStream::new(response.bytes_stream()).map(|result| match result {
        Ok(event) => {
            // Data-only streams surface as the default "message" event.
            let name = if event.event == "message" {
                String::new()
            } else {
                event.event
            };
            Ok(UpstreamEvent::new(name, event.data))
        }
        Err(e) => Err(UpstreamError::Transport(format!("SSE stream error: {}", e))),
    });
    Box::pin(stream)
}

/// Replace the model (and stream flag) in a pass-through body
pub(crate) fn prepare_body(request: &UpstreamRequest) -> Value {
    let mut body = request.body.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::String(request.model.clone()));
        obj.insert("stream".to_string(), Value::Bool(request.stream));
    }
    body
}

/// Routes each call to the client for the account's platform
pub struct PlatformClients {
    claude: ClaudeClient,
    openai: OpenAiCompatClient,
}

impl PlatformClients {
    pub fn new(claude: ClaudeClient, openai: OpenAiCompatClient) -> Self {
        Self { claude, openai }
    }

    fn client_for(&self, platform: Platform) -> &dyn UpstreamClient {
        match platform {
            Platform::Claude | Platform::ClaudeConsole => &self.claude,
            Platform::OpenAi | Platform::Gemini => &self.openai,
        }
    }
}

#[async_trait]
impl UpstreamClient for PlatformClients {
    async fn complete(
        &self,
        ctx: &UpstreamContext,
        request: UpstreamRequest,
    ) -> Result<UpstreamResponse, UpstreamError> {
        self.client_for(ctx.platform).complete(ctx, request).await
    }

    async fn stream_complete(
        &self,
        ctx: &UpstreamContext,
        request: UpstreamRequest,
    ) -> Result<UpstreamEventStream, UpstreamError> {
        self.client_for(ctx.platform)
            .stream_complete(ctx, request)
            .await
    }
}
