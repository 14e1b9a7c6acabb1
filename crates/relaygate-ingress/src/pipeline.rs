//! Request dispatch pipeline
//!
//! `Validating -> QuotaChecking -> Selecting -> Dispatching -> {Streaming | Buffered}
//! -> Settling -> Done`. Every rejection is a [`DispatchError`]. Once a request log
//! row exists it is completed exactly once, including when the caller goes away
//! mid-flight.

use futures::{StreamExt, stream::BoxStream};
use relaygate_billing::{QuotaGuard, Settlement};
use relaygate_core::{
    Account, ApiKey, ApiKeyStore, Clock, Decimal, NewRequestLog, Platform, RequestLogCompletion,
    RequestLogStore, RequestStatus, TokenUsage, UpstreamClient, UpstreamContext, UpstreamError,
    UpstreamEvent, UpstreamEventStream, UpstreamRequest, UsageAccumulator,
};
use relaygate_egress::CredentialRefresher;
use relaygate_observability::Metrics;
use relaygate_routing::AccountPool;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{DispatchError, DispatchResult};

/// Inbound API surface a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// `/v1/messages`
    Messages,
    /// `/v1/chat/completions`
    ChatCompletions,
}

impl Endpoint {
    /// Endpoint served at `path`, if any
    pub fn from_path(path: &str) -> Option<Self> {
        match path.trim_end_matches('/') {
            "/v1/messages" => Some(Endpoint::Messages),
            "/v1/chat/completions" => Some(Endpoint::ChatCompletions),
            _ => None,
        }
    }

    /// Account platforms that can serve this endpoint
    pub fn platforms(&self) -> &'static [Platform] {
        match self {
            Endpoint::Messages => &[Platform::Claude, Platform::ClaudeConsole],
            Endpoint::ChatCompletions => &[Platform::OpenAi, Platform::Gemini],
        }
    }

    /// Service label used in logs, metrics and error messages
    pub fn service_label(&self) -> &'static str {
        match self {
            Endpoint::Messages => "claude",
            Endpoint::ChatCompletions => "openai",
        }
    }

    /// Whether the key may use at least one platform behind this endpoint
    pub fn permits(&self, api_key: &ApiKey) -> bool {
        self.platforms()
            .iter()
            .any(|p| api_key.services.permits(p.service()))
    }
}

/// One chat request as handed over by the HTTP layer
#[derive(Clone)]
pub struct InboundRequest {
    pub request_id: String,
    pub endpoint: Endpoint,
    pub api_key: Option<String>,
    pub session_hash: Option<String>,
    pub body: Value,
    /// Caller headers to forward upstream
    pub passthrough_headers: Vec<(String, String)>,
}

/// Fully buffered upstream reply
#[derive(Debug, Clone)]
pub struct BufferedReply {
    pub status: u16,
    pub body: Value,
    pub headers: Vec<(String, String)>,
    pub usage: TokenUsage,
    /// Amount actually charged
    pub cost: Decimal,
}

/// Upstream events forwarded one by one
pub type ReplyStream = BoxStream<'static, Result<UpstreamEvent, DispatchError>>;

pub enum DispatchOutcome {
    Buffered(BufferedReply),
    Stream(ReplyStream),
}

impl std::fmt::Debug for DispatchOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchOutcome::Buffered(reply) => f.debug_tuple("Buffered").field(reply).finish(),
            DispatchOutcome::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Collaborators the pipeline runs against
pub struct PipelineComponents {
    pub api_keys: Arc<dyn ApiKeyStore>,
    pub pool: AccountPool,
    pub credentials: Arc<CredentialRefresher>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub quota: Arc<QuotaGuard>,
    pub request_logs: Arc<dyn RequestLogStore>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Option<Arc<Metrics>>,
}

#[derive(Clone)]
pub struct DispatchPipeline {
    inner: Arc<PipelineComponents>,
}

/// State carried from admission into dispatch
struct Admission {
    api_key: ApiKey,
    account: Account,
    upstream_model: String,
    stream: bool,
    log_id: String,
}

impl DispatchPipeline {
    pub fn new(components: PipelineComponents) -> Self {
        Self {
            inner: Arc::new(components),
        }
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.inner.metrics.as_ref()
    }

    /// Run one chat request end to end
    ///
    /// `cancel` aborts the upstream call or stream read; an aborted request is
    /// logged as canceled with zero cost.
    #[instrument(skip_all, fields(request_id = %request.request_id, service = request.endpoint.service_label()))]
    pub async fn handle_chat_request(
        &self,
        request: InboundRequest,
        cancel: CancellationToken,
    ) -> DispatchResult<DispatchOutcome> {
        let started = Instant::now();
        let service = request.endpoint.service_label();

        let admission = match self.admit(&request).await {
            Ok(admission) => admission,
            Err(err) => {
                info!(error = %err, status = err.status_code().as_u16(), "Request rejected");
                if let Some(metrics) = &self.inner.metrics {
                    metrics.record_request(service, err.outcome(), started.elapsed().as_secs_f64());
                }
                return Err(err);
            }
        };

        let Admission {
            api_key,
            account,
            upstream_model,
            stream,
            log_id,
        } = admission;

        let flight = InFlight {
            inner: self.inner.clone(),
            api_key,
            account_id: account.id.clone(),
            upstream_model: upstream_model.clone(),
            log_id,
            service,
            stream,
            started,
            finalized: false,
        };

        let credential = match self.inner.credentials.get_valid_token(&account).await {
            Ok(credential) => credential,
            Err(e) => {
                let err = DispatchError::from(e);
                flight.fail(&err).await;
                return Err(err);
            }
        };
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_credential(credential.outcome.as_str());
        }

        let ctx = UpstreamContext {
            account_id: account.id.clone(),
            platform: account.platform,
            credential: credential.token,
            proxy: account.proxy.clone(),
            base_url: account.base_url.clone(),
        };
        let upstream_request = UpstreamRequest {
            body: request.body,
            model: upstream_model,
            stream,
            passthrough_headers: request.passthrough_headers,
        };

        if stream {
            self.dispatch_stream(flight, ctx, upstream_request, cancel)
                .await
        } else {
            self.dispatch_buffered(flight, ctx, upstream_request, cancel)
                .await
        }
    }

    async fn admit(&self, request: &InboundRequest) -> DispatchResult<Admission> {
        let inner = &self.inner;
        let now = inner.clock.now();

        let key_value = request
            .api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| DispatchError::Authentication("Missing API key".to_string()))?;
        let api_key = inner
            .api_keys
            .get_by_value(key_value, now)
            .await?
            .ok_or_else(|| DispatchError::Authentication("Invalid API key".to_string()))?;

        if !api_key.enabled {
            return Err(DispatchError::Authorization(
                "API key is disabled".to_string(),
            ));
        }
        if api_key.is_expired(now) {
            return Err(DispatchError::Authentication(
                "API key has expired".to_string(),
            ));
        }
        if !request.endpoint.permits(&api_key) {
            return Err(DispatchError::Authorization(format!(
                "API key is not permitted to use the {} service",
                request.endpoint.service_label()
            )));
        }

        let requested_model = request
            .body
            .get("model")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| DispatchError::InvalidRequest("missing 'model'".to_string()))?;
        if !api_key.permits_model(requested_model) {
            return Err(DispatchError::Authorization(format!(
                "Model '{requested_model}' is not allowed for this API key"
            )));
        }
        let model = api_key
            .model_override
            .clone()
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| requested_model.to_string());
        let stream = request
            .body
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if let Some(kind) = inner.quota.check_cost_ceilings(&api_key) {
            return Err(DispatchError::QuotaExceeded(kind));
        }
        let estimate = inner.quota.estimate_cost(&model, &request.body);
        if !inner
            .quota
            .check_balance(&api_key.owner_id, estimate.cost)
            .await?
        {
            return Err(DispatchError::InsufficientBalance {
                estimated_cost: estimate.cost,
            });
        }

        let selection = inner
            .pool
            .select_within(
                &api_key,
                request.endpoint.platforms(),
                request.session_hash.as_deref(),
                Some(&model),
            )
            .await?;
        if let Some(metrics) = &inner.metrics {
            metrics.record_selection(
                selection.account.platform.as_str(),
                selection.source.as_str(),
            );
        }

        let account = selection.account;
        let upstream_model = account.map_model(&model);
        let log_id = inner
            .request_logs
            .create(NewRequestLog {
                request_id: request.request_id.clone(),
                api_key_id: api_key.id.clone(),
                tenant_id: api_key.owner_id.clone(),
                account_id: account.id.clone(),
                platform: account.platform,
                requested_model: requested_model.to_string(),
                upstream_model: upstream_model.clone(),
                stream,
                started_at: now,
            })
            .await?;

        info!(
            log_id = %log_id,
            api_key_id = %api_key.id,
            account_id = %account.id,
            platform = %account.platform,
            source = selection.source.as_str(),
            model = %upstream_model,
            stream,
            "Dispatching request"
        );

        Ok(Admission {
            api_key,
            account,
            upstream_model,
            stream,
            log_id,
        })
    }

    async fn dispatch_buffered(
        &self,
        flight: InFlight,
        ctx: UpstreamContext,
        request: UpstreamRequest,
        cancel: CancellationToken,
    ) -> DispatchResult<DispatchOutcome> {
        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                flight.fail(&DispatchError::Canceled).await;
                return Err(DispatchError::Canceled);
            }
            result = self.inner.upstream.complete(&ctx, request) => result,
        };

        match result {
            Ok(response) => {
                let cost = flight.succeed(response.usage, response.status).await;
                Ok(DispatchOutcome::Buffered(BufferedReply {
                    status: response.status,
                    body: response.body,
                    headers: response.headers,
                    usage: response.usage,
                    cost,
                }))
            }
            Err(e) => Err(flight.upstream_failed(e).await),
        }
    }

    async fn dispatch_stream(
        &self,
        flight: InFlight,
        ctx: UpstreamContext,
        request: UpstreamRequest,
        cancel: CancellationToken,
    ) -> DispatchResult<DispatchOutcome> {
        let opened = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                flight.fail(&DispatchError::Canceled).await;
                return Err(DispatchError::Canceled);
            }
            opened = self.inner.upstream.stream_complete(&ctx, request) => opened,
        };

        match opened {
            Ok(upstream) => Ok(DispatchOutcome::Stream(relay(RelayState {
                upstream,
                cancel,
                usage: UsageAccumulator::new(),
                flight: Some(flight),
            }))),
            Err(e) => Err(flight.upstream_failed(e).await),
        }
    }
}

struct RelayState {
    upstream: UpstreamEventStream,
    cancel: CancellationToken,
    usage: UsageAccumulator,
    /// Taken once the request has been finalized
    flight: Option<InFlight>,
}

/// Forward upstream events, settling when the stream ends
fn relay(state: RelayState) -> ReplyStream {
    futures::stream::unfold(state, |mut state| async move {
        let flight = state.flight.take()?;

        tokio::select! {
            biased;

            _ = state.cancel.cancelled() => {
                flight.abort_stream().await;
                Some((Err(DispatchError::Canceled), state))
            }
            next = state.upstream.next() => match next {
                // Relayed so the caller sees the provider's error; nothing is charged.
                Some(Ok(event)) if event.is_error() => {
                    let message = event.error_message();
                    warn!(error = %message, "Upstream sent an error event mid-stream");
                    flight.fail(&DispatchError::Upstream(message)).await;
                    Some((Ok(event), state))
                }
                Some(Ok(event)) => {
                    state.usage.observe(&event.usage);
                    state.flight = Some(flight);
                    Some((Ok(event), state))
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Upstream stream failed mid-response");
                    let err = DispatchError::Upstream(e.to_string());
                    flight.fail(&err).await;
                    Some((Err(err), state))
                }
                None => {
                    if !state.usage.has_usage() {
                        debug!("Stream ended without reporting usage");
                    }
                    flight.succeed(state.usage.usage(), 200).await;
                    None
                }
            }
        }
    })
    .boxed()
}

/// A request with an open log row
///
/// Dropping it unfinalized (caller disconnected, handler future dropped) spawns
/// a canceled completion onto the current runtime.
struct InFlight {
    inner: Arc<PipelineComponents>,
    api_key: ApiKey,
    account_id: String,
    upstream_model: String,
    log_id: String,
    service: &'static str,
    stream: bool,
    started: Instant,
    finalized: bool,
}

impl InFlight {
    /// Price the usage, settle it and complete the log; returns the charged cost
    async fn succeed(mut self, usage: TokenUsage, http_status: u16) -> Decimal {
        let inner = self.inner.clone();
        let cost = inner.quota.compute_cost(&self.upstream_model, &usage);

        let (status, charged, error) = match inner
            .quota
            .settle(&self.api_key, &self.api_key.owner_id, cost, &self.log_id)
            .await
        {
            Ok(Settlement::Settled { cost }) => (RequestStatus::Success, cost, None),
            Ok(Settlement::Free) => (RequestStatus::Success, Decimal::ZERO, None),
            Ok(Settlement::Declined { cost }) => (
                RequestStatus::Failed,
                Decimal::ZERO,
                Some(format!("Insufficient balance to settle cost {cost}")),
            ),
            Err(e) => {
                warn!(log_id = %self.log_id, error = %e, "Settlement failed");
                (
                    RequestStatus::Failed,
                    Decimal::ZERO,
                    Some(format!("Settlement failed: {e}")),
                )
            }
        };

        if let Some(metrics) = &inner.metrics {
            metrics.record_tokens(
                &self.upstream_model,
                usage.input_tokens,
                usage.output_tokens,
                usage.cache_creation_tokens,
                usage.cache_read_tokens,
            );
            metrics.record_settled_cost(
                &self.upstream_model,
                f64::try_from(charged).unwrap_or_default(),
            );
        }

        self.complete(status, usage, charged, http_status, error)
            .await;
        charged
    }

    /// Record an upstream failure, putting the account into cooldown when throttled
    async fn upstream_failed(self, error: UpstreamError) -> DispatchError {
        if let UpstreamError::RateLimited {
            limited_until,
            message,
            ..
        } = &error
        {
            match self
                .inner
                .pool
                .rate_limits()
                .mark_limited(&self.account_id, *limited_until, Some(message.clone()))
                .await
            {
                Ok(()) => {
                    if let Some(metrics) = &self.inner.metrics {
                        metrics.record_rate_limit_mark(&self.account_id);
                    }
                }
                Err(e) => warn!(
                    account_id = %self.account_id,
                    error = %e,
                    "Failed to mark account rate limited"
                ),
            }
        }

        let err = DispatchError::from(error);
        self.fail(&err).await;
        err
    }

    async fn abort_stream(self) {
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_stream_aborted(self.service);
        }
        self.fail(&DispatchError::Canceled).await;
    }

    async fn fail(mut self, err: &DispatchError) {
        let status = match err {
            DispatchError::RateLimited { .. } => RequestStatus::RateLimited,
            DispatchError::Canceled => RequestStatus::Canceled,
            _ => RequestStatus::Failed,
        };
        self.complete(
            status,
            TokenUsage::default(),
            Decimal::ZERO,
            err.status_code().as_u16(),
            Some(err.to_string()),
        )
        .await;
    }

    async fn complete(
        &mut self,
        status: RequestStatus,
        usage: TokenUsage,
        cost: Decimal,
        http_status: u16,
        error_message: Option<String>,
    ) {
        self.finalized = true;
        let elapsed = self.started.elapsed();
        let completion = RequestLogCompletion {
            status,
            usage,
            cost,
            http_status,
            error_message,
            duration_ms: elapsed.as_millis() as u64,
            completed_at: self.inner.clock.now(),
        };

        if let Err(e) = self
            .inner
            .request_logs
            .complete(&self.log_id, completion)
            .await
        {
            warn!(log_id = %self.log_id, error = %e, "Failed to finalize request log");
        }

        info!(
            log_id = %self.log_id,
            account_id = %self.account_id,
            model = %self.upstream_model,
            status = status.as_str(),
            http_status,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            cost = %cost,
            duration_ms = elapsed.as_millis() as u64,
            "Request finished"
        );
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_request(self.service, status.as_str(), elapsed.as_secs_f64());
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }

        let elapsed = self.started.elapsed();
        warn!(log_id = %self.log_id, account_id = %self.account_id, "Request abandoned by caller");
        if let Some(metrics) = &self.inner.metrics {
            metrics.record_request(
                self.service,
                RequestStatus::Canceled.as_str(),
                elapsed.as_secs_f64(),
            );
            if self.stream {
                metrics.record_stream_aborted(self.service);
            }
        }

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(log_id = %self.log_id, "No runtime available to finalize abandoned request");
            return;
        };

        let completion = RequestLogCompletion {
            status: RequestStatus::Canceled,
            usage: TokenUsage::default(),
            cost: Decimal::ZERO,
            http_status: DispatchError::Canceled.status_code().as_u16(),
            error_message: Some("Client disconnected".to_string()),
            duration_ms: elapsed.as_millis() as u64,
            completed_at: self.inner.clock.now(),
        };
        let request_logs = self.inner.request_logs.clone();
        let log_id = std::mem::take(&mut self.log_id);
        handle.spawn(async move {
            if let Err(e) = request_logs.complete(&log_id, completion).await {
                warn!(log_id = %log_id, error = %e, "Failed to finalize abandoned request log");
            }
        });
    }
}
