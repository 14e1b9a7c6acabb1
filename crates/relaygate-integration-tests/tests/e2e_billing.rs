//! Admission and settlement through the full stack

use axum::http::StatusCode;
use relaygate_core::{RequestStatus, TenantId};
use relaygate_integration_tests::*;
use serde_json::{Value, json};
use wiremock::{
    Mock, ResponseTemplate,
    matchers::{body_partial_json, header, method, path},
};

const GATEWAY: &str = r#"
accounts:
  - {id: openai-1, platform: openai, api_key: sk-openai-1}
  - {id: console-a, platform: claude-console, api_key: sk-ant-a}
tenants:
  - {id: acme, balance: "2"}
  - {id: broke, balance: "0"}
api_keys:
  - {id: key-acme, key: rg-acme, owner_id: acme}
  - {id: key-broke, key: rg-broke, owner_id: broke}
  - id: key-capped
    key: rg-capped
    owner_id: acme
    daily_cost_limit: "1"
    usage: {daily: "1", monthly: "1", total: "1", updated_at: "2025-06-01T08:00:00Z"}
  - id: key-mini
    key: rg-mini
    owner_id: acme
    allowed_models: [gpt-4o, gpt-4o-mini]
    model_override: gpt-4o-mini
  - id: key-expired
    key: rg-expired
    owner_id: acme
    expires_at: "2025-05-31T00:00:00Z"
pricing:
  default: {input: "0.000003", output: "0.000015"}
  models:
    gpt-4o: {input: "0.0000025", output: "0.00001"}
    gpt-4o-mini: {input: "0.00000015", output: "0.0000006"}
"#;

fn chat_body(model: &str) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": "Name three Rust web frameworks"}]
    })
}

fn acme() -> TenantId {
    TenantId::new("acme").unwrap()
}

async fn mount_chat_completion(gateway: &TestGateway, model: &str, prompt: u64, completion: u64) {
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-openai-1"))
        .and(body_partial_json(json!({"model": model})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "axum, actix-web, rocket"},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": prompt, "completion_tokens": completion, "total_tokens": prompt + completion}
        })))
        .expect(1)
        .mount(&gateway.upstream)
        .await;
}

#[tokio::test]
async fn test_chat_completion_priced_by_model() {
    let gateway = TestGateway::start(GATEWAY).await;
    mount_chat_completion(&gateway, "gpt-4o", 200, 50).await;

    let response = gateway.send(chat_request("rg-acme", &chat_body("gpt-4o"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["choices"][0]["message"]["content"], "axum, actix-web, rocket");

    let done = gateway.backends.request_logs.all().pop().unwrap().completion.unwrap();
    assert_eq!(done.status, RequestStatus::Success);
    // 200 * 0.0000025 + 50 * 0.00001
    assert_eq!(done.cost, dec("0.001"));
    assert_eq!(gateway.backends.wallet.balance(&acme()), Some(dec("1.999")));

    let debits = gateway.backends.wallet.debits(&acme());
    assert_eq!(debits.len(), 1);
    assert_eq!(debits[0].amount, dec("0.001"));
}

#[tokio::test]
async fn test_model_override_replaces_requested_model() {
    let gateway = TestGateway::start(GATEWAY).await;
    mount_chat_completion(&gateway, "gpt-4o-mini", 1000, 1000).await;

    let response = gateway.send(chat_request("rg-mini", &chat_body("gpt-4o"))).await;
    assert_eq!(response.status(), StatusCode::OK);

    let record = gateway.backends.request_logs.all().pop().unwrap();
    assert_eq!(record.entry.upstream_model, "gpt-4o-mini");
    // 1000 * 0.00000015 + 1000 * 0.0000006
    assert_eq!(record.completion.unwrap().cost, dec("0.00075"));
}

#[tokio::test]
async fn test_model_outside_allow_list_is_forbidden() {
    let gateway = TestGateway::start(GATEWAY).await;

    let response = gateway
        .send(chat_request("rg-mini", &chat_body("o1-preview")))
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(gateway.backends.request_logs.all().is_empty());
}

#[tokio::test]
async fn test_empty_wallet_is_payment_required() {
    let gateway = TestGateway::start(GATEWAY).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&gateway.upstream)
        .await;

    let response = gateway.send(chat_request("rg-broke", &chat_body("gpt-4o"))).await;
    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "billing_error");
    assert_eq!(json["error"]["code"], "insufficient_balance");
    assert!(gateway.backends.request_logs.all().is_empty());
}

#[tokio::test]
async fn test_daily_ceiling_reached_is_rejected() {
    let gateway = TestGateway::start(GATEWAY).await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&gateway.upstream)
        .await;

    let response = gateway
        .send(messages_request(
            "rg-capped",
            &json!({
                "model": "claude-3-5-sonnet",
                "max_tokens": 16,
                "messages": [{"role": "user", "content": "hi"}]
            }),
            None,
        ))
        .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "daily_cost_limit_exceeded");
}

#[tokio::test]
async fn test_expired_and_unknown_keys_are_unauthorized() {
    let gateway = TestGateway::start(GATEWAY).await;

    for key in ["rg-expired", "rg-nope"] {
        let response = gateway.send(chat_request(key, &chat_body("gpt-4o"))).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "key {key}");
    }
    assert!(gateway.backends.request_logs.all().is_empty());
}
