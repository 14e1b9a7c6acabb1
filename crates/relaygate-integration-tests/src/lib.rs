//! End-to-end harness for RelayGate
//!
//! Wires a real gateway (egress clients, account pool, billing guard and
//! ingress router) against a `wiremock` server standing in for every upstream
//! platform and the OAuth token endpoint. Time is pinned with a manual clock.

use axum::{
    Router,
    body::Body,
    http::{Request, Response},
};
use chrono::{DateTime, TimeZone, Utc};
use relaygate_config_file::{GatewayBackends, GatewayFile};
use relaygate_core::{Decimal, ManualClock};
use relaygate_observability::Metrics;
use relaygate_server::{ServerConfig, build_gateway};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use wiremock::MockServer;

/// 2025-06-01T12:00:00Z
pub const START_TS: i64 = 1_748_779_200;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
}

pub fn dec(s: &str) -> Decimal {
    Decimal::from_str(s).unwrap()
}

pub struct TestGateway {
    pub upstream: MockServer,
    pub router: Router,
    pub backends: GatewayBackends,
    pub clock: Arc<ManualClock>,
    pub metrics: Arc<Metrics>,
    pub shutdown: CancellationToken,
}

impl TestGateway {
    /// Gateway seeded from a YAML gateway file, all upstreams pointed at one mock server
    pub async fn start(gateway_yaml: &str) -> Self {
        let upstream = MockServer::start().await;

        let mut config = ServerConfig::default();
        config.upstream.anthropic.base_url = upstream.uri();
        config.upstream.openai.openai_base_url = format!("{}/v1", upstream.uri());
        config.upstream.openai.gemini_base_url = format!("{}/gemini", upstream.uri());
        config.upstream.oauth.token_url = format!("{}/v1/oauth/token", upstream.uri());
        config.upstream.http.max_retries = 0;

        let backends = GatewayFile::from_yaml(gateway_yaml)
            .and_then(|file| {
                file.validate()?;
                file.build()
            })
            .unwrap();
        let clock = Arc::new(ManualClock::new(start()));
        let shutdown = CancellationToken::new();
        let gateway = build_gateway(&config, &backends, clock.clone(), shutdown.clone()).unwrap();

        Self {
            upstream,
            router: gateway.router,
            backends,
            clock,
            metrics: gateway.metrics,
            shutdown,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    /// Account id recorded on the most recent request log
    pub fn last_account(&self) -> String {
        let logs = self.backends.request_logs.all();
        logs.last().unwrap().entry.account_id.clone()
    }
}

pub fn messages_request(api_key: &str, body: &Value, session: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/messages")
        .header("content-type", "application/json")
        .header("x-api-key", api_key)
        .header("anthropic-version", "2023-06-01");
    if let Some(session) = session {
        builder = builder.header("x-session-id", session);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

pub fn chat_request(api_key: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {api_key}"))
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn body_string(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_str(&body_string(response).await).unwrap()
}
