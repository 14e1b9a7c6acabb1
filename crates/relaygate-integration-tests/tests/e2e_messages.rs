//! End-to-end `/v1/messages` flows against a mocked Claude API

use axum::http::{StatusCode, header};
use chrono::Duration;
use relaygate_core::{AccountStatus, RequestStatus, TenantId};
use relaygate_integration_tests::*;
use serde_json::{Value, json};
use wiremock::{
    Mock, ResponseTemplate,
    matchers::{body_partial_json, header as header_eq, method, path},
};

const CONSOLE_POOL: &str = r#"
accounts:
  - {id: console-a, platform: claude-console, api_key: sk-ant-a, priority: 1}
  - {id: console-b, platform: claude-console, api_key: sk-ant-b, priority: 2}
tenants:
  - {id: acme, balance: "10"}
api_keys:
  - {id: key-1, key: rg-acme, owner_id: acme}
pricing:
  default: {input: "0.000003", output: "0.000015"}
"#;

fn body(stream: bool) -> Value {
    json!({
        "model": "claude-3-5-sonnet",
        "max_tokens": 256,
        "stream": stream,
        "messages": [{"role": "user", "content": "Summarise the borrow checker in one line"}]
    })
}

fn acme() -> TenantId {
    TenantId::new("acme").unwrap()
}

#[tokio::test]
async fn test_stream_relayed_and_final_usage_settled() {
    let gateway = TestGateway::start(CONSOLE_POOL).await;

    let sse = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":10,\"output_tokens\":1}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Ownership, checked.\"}}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":57}}\n\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header_eq("x-api-key", "sk-ant-a"))
        .and(body_partial_json(json!({"stream": true, "model": "claude-3-5-sonnet"})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse),
        )
        .expect(1)
        .mount(&gateway.upstream)
        .await;

    let response = gateway
        .send(messages_request("rg-acme", &body(true), None))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let text = body_string(response).await;
    assert!(text.contains("event: message_start"));
    assert!(text.contains("Ownership, checked."));
    assert!(text.contains("event: message_delta"));

    let record = gateway.backends.request_logs.all().pop().unwrap();
    assert_eq!(record.entry.account_id, "console-a");
    assert!(record.entry.stream);
    let done = record.completion.unwrap();
    assert_eq!(done.status, RequestStatus::Success);
    assert_eq!(done.usage.input_tokens, 10);
    assert_eq!(done.usage.output_tokens, 57);
    // 10 * 0.000003 + 57 * 0.000015
    assert_eq!(done.cost, dec("0.000885"));
    assert_eq!(gateway.backends.wallet.balance(&acme()), Some(dec("9.999115")));
}

#[tokio::test]
async fn test_buffered_reply_settles_and_counts_usage() {
    let gateway = TestGateway::start(CONSOLE_POOL).await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header_eq("anthropic-version", "2023-06-01"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_2",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "Ownership, checked."}],
            "usage": {"input_tokens": 100, "output_tokens": 20}
        })))
        .expect(1)
        .mount(&gateway.upstream)
        .await;

    let response = gateway
        .send(messages_request("rg-acme", &body(false), None))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["id"], "msg_2");

    // 100 * 0.000003 + 20 * 0.000015
    assert_eq!(gateway.backends.wallet.balance(&acme()), Some(dec("9.9994")));
    let key = gateway.backends.api_keys.get_by_id("key-1").unwrap();
    assert_eq!(key.usage.daily, dec("0.0006"));

    let account = gateway.backends.accounts.get("console-a").unwrap();
    assert!(account.usage_count >= 1);
    assert_eq!(account.last_used_at, Some(start()));
}

#[tokio::test]
async fn test_upstream_429_cools_account_and_next_request_fails_over() {
    let gateway = TestGateway::start(CONSOLE_POOL).await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header_eq("x-api-key", "sk-ant-a"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("retry-after", "30")
                .set_body_string(r#"{"type":"error","error":{"type":"rate_limit_error"}}"#),
        )
        .expect(1)
        .mount(&gateway.upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header_eq("x-api-key", "sk-ant-b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_b",
            "usage": {"input_tokens": 5, "output_tokens": 5}
        })))
        .expect(1)
        .mount(&gateway.upstream)
        .await;

    let response = gateway
        .send(messages_request("rg-acme", &body(false), None))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "30");
    let json = body_json(response).await;
    assert_eq!(json["type"], "error");
    assert_eq!(json["error"]["type"], "rate_limit_error");

    let limited = gateway.backends.accounts.get("console-a").unwrap();
    assert_eq!(limited.status, AccountStatus::RateLimited);
    assert_eq!(limited.rate_limited_until, Some(start() + Duration::seconds(30)));

    let record = gateway.backends.request_logs.all().pop().unwrap();
    let done = record.completion.unwrap();
    assert_eq!(done.status, RequestStatus::RateLimited);
    assert_eq!(done.cost, dec("0"));
    assert!(gateway.backends.wallet.debits(&acme()).is_empty());

    gateway.clock.advance(Duration::seconds(1));
    let response = gateway
        .send(messages_request("rg-acme", &body(false), None))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(gateway.last_account(), "console-b");
}

#[tokio::test]
async fn test_rate_limited_account_recovers_after_window() {
    let gateway = TestGateway::start(CONSOLE_POOL).await;

    let mut limited = gateway.backends.accounts.get("console-a").unwrap();
    limited.status = AccountStatus::RateLimited;
    limited.rate_limited_until = Some(start() - Duration::seconds(1));
    gateway.backends.accounts.insert(limited);

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header_eq("x-api-key", "sk-ant-a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_a",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        })))
        .expect(1)
        .mount(&gateway.upstream)
        .await;

    let response = gateway
        .send(messages_request("rg-acme", &body(false), None))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let recovered = gateway.backends.accounts.get("console-a").unwrap();
    assert_eq!(recovered.status, AccountStatus::Active);
    assert_eq!(recovered.rate_limited_until, None);
}

#[tokio::test]
async fn test_expired_oauth_token_refreshed_before_dispatch() {
    let gateway = TestGateway::start(&format!(
        r#"
accounts:
  - id: max-1
    platform: claude
    oauth:
      access_token: at-stale
      refresh_token: rt-1
      expires_at: {}
tenants:
  - {{id: acme, balance: "10"}}
api_keys:
  - {{id: key-1, key: rg-acme, owner_id: acme}}
"#,
        START_TS - 10
    ))
    .await;

    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .and(body_partial_json(json!({
            "grant_type": "refresh_token",
            "refresh_token": "rt-1"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-fresh",
            "refresh_token": "rt-2",
            "expires_in": 3600
        })))
        .expect(1)
        .mount(&gateway.upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header_eq("authorization", "Bearer at-fresh"))
        .and(header_eq("anthropic-beta", "oauth-2025-04-20"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_oauth",
            "usage": {"input_tokens": 3, "output_tokens": 2}
        })))
        .expect(1)
        .mount(&gateway.upstream)
        .await;

    let response = gateway
        .send(messages_request("rg-acme", &body(false), None))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let oauth = gateway.backends.accounts.get("max-1").unwrap().oauth.unwrap();
    assert_eq!(oauth.access_token, "at-fresh");
    assert_eq!(oauth.refresh_token, "rt-2");
    assert_eq!(oauth.expires_at, START_TS + 3600);
}

#[tokio::test]
async fn test_failed_refresh_falls_back_to_existing_token() {
    let gateway = TestGateway::start(&format!(
        r#"
accounts:
  - id: max-1
    platform: claude
    oauth: {{access_token: at-stale, refresh_token: rt-revoked, expires_at: {}}}
tenants:
  - {{id: acme, balance: "10"}}
api_keys:
  - {{id: key-1, key: rg-acme, owner_id: acme}}
"#,
        START_TS - 10
    ))
    .await;

    Mock::given(method("POST"))
        .and(path("/v1/oauth/token"))
        .respond_with(ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#))
        .expect(1)
        .mount(&gateway.upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header_eq("authorization", "Bearer at-stale"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_stale",
            "usage": {"input_tokens": 1, "output_tokens": 1}
        })))
        .expect(1)
        .mount(&gateway.upstream)
        .await;

    let response = gateway
        .send(messages_request("rg-acme", &body(false), None))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let oauth = gateway.backends.accounts.get("max-1").unwrap().oauth.unwrap();
    assert_eq!(oauth.access_token, "at-stale");
    assert_eq!(oauth.refresh_token, "rt-revoked");
}

#[tokio::test]
async fn test_metrics_record_request_outcome() {
    let gateway = TestGateway::start(CONSOLE_POOL).await;

    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "msg_m",
            "usage": {"input_tokens": 4, "output_tokens": 6}
        })))
        .mount(&gateway.upstream)
        .await;

    let response = gateway
        .send(messages_request("rg-acme", &body(false), None))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let gathered = gateway.metrics.registry().gather();
    let requests = gathered
        .iter()
        .find(|m| m.name() == "relaygate_requests_total")
        .unwrap();
    let total: f64 = requests
        .metric
        .iter()
        .map(|m| m.counter.as_ref().unwrap().value.unwrap())
        .sum();
    assert_eq!(total, 1.0);

    let tokens = gathered
        .iter()
        .find(|m| m.name() == "relaygate_tokens_total")
        .unwrap();
    assert!(!tokens.metric.is_empty());
}
