//! HTTP surface
//!
//! `POST /v1/messages` serves Claude accounts and `POST /v1/chat/completions`
//! serves OpenAI-compatible accounts. Bodies pass through untouched apart from
//! the model name; streaming replies are relayed event by event.

use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::post,
};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::error::DispatchError;
use crate::middleware::{RequestContext, body_size_limit_middleware, request_context_middleware};
use crate::pipeline::{
    BufferedReply, DispatchOutcome, DispatchPipeline, Endpoint, InboundRequest, ReplyStream,
};
use crate::session::derive_session_hash;

/// Header prefixes relayed to the upstream
const PASSTHROUGH_PREFIXES: [&str; 2] = ["anthropic-", "openai-"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngressConfig {
    /// Largest accepted request body
    pub max_body_bytes: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Clone)]
struct IngressState {
    pipeline: DispatchPipeline,
    shutdown: CancellationToken,
}

/// Build the ingress router
///
/// Each request gets a child of `shutdown`, so cancelling it aborts every
/// in-flight upstream call and stream.
pub fn router(
    pipeline: DispatchPipeline,
    shutdown: CancellationToken,
    config: &IngressConfig,
) -> Router {
    let max_body = config.max_body_bytes;
    Router::new()
        .route("/v1/messages", post(messages))
        .route("/v1/chat/completions", post(chat_completions))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(middleware::from_fn(move |req, next| {
            body_size_limit_middleware(req, next, max_body)
        }))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(TraceLayer::new_for_http())
        .with_state(IngressState { pipeline, shutdown })
}

async fn messages(
    State(state): State<IngressState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state, Endpoint::Messages, ctx, headers, body).await
}

async fn chat_completions(
    State(state): State<IngressState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    dispatch(state, Endpoint::ChatCompletions, ctx, headers, body).await
}

async fn dispatch(
    state: IngressState,
    endpoint: Endpoint,
    ctx: RequestContext,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let body: Value = match serde_json::from_slice(&body) {
        Ok(value @ Value::Object(_)) => value,
        Ok(_) => {
            return DispatchError::InvalidRequest("request body must be a JSON object".to_string())
                .into_response_for(endpoint);
        }
        Err(e) => {
            return DispatchError::InvalidRequest(format!("malformed JSON body: {e}"))
                .into_response_for(endpoint);
        }
    };

    let request = InboundRequest {
        request_id: ctx.request_id,
        endpoint,
        api_key: extract_api_key(&headers),
        session_hash: derive_session_hash(&headers, &body),
        passthrough_headers: passthrough_headers(&headers),
        body,
    };

    match state
        .pipeline
        .handle_chat_request(request, state.shutdown.child_token())
        .await
    {
        Ok(DispatchOutcome::Buffered(reply)) => buffered_response(reply),
        Ok(DispatchOutcome::Stream(stream)) => sse_response(stream),
        Err(err) => err.into_response_for(endpoint),
    }
}

/// `x-api-key`, else an `Authorization: Bearer` token
pub fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(key) = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        return Some(key.to_string());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
        })
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
}

/// Provider-specific caller headers such as `anthropic-version` and `anthropic-beta`
pub fn passthrough_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| {
            PASSTHROUGH_PREFIXES
                .iter()
                .any(|prefix| name.as_str().starts_with(prefix))
        })
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn buffered_response(reply: BufferedReply) -> Response {
    let status = StatusCode::from_u16(reply.status).unwrap_or(StatusCode::OK);
    let mut response = (status, Json(reply.body)).into_response();
    for (name, value) in reply.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => warn!(header = %name, "Dropping unrepresentable upstream header"),
        }
    }
    response
}

fn sse_response(stream: ReplyStream) -> Response {
    let events = stream.map(|item| {
        Ok::<_, std::convert::Infallible>(match item {
            Ok(upstream) => {
                let mut event = Event::default();
                if !upstream.event.is_empty() {
                    event = event.event(upstream.event);
                }
                event.data(upstream.data)
            }
            Err(err) => Event::default()
                .event("error")
                .data(err.body().to_string()),
        })
    });

    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}
