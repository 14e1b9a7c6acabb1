//! Shared ingress middleware

use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::pipeline::Endpoint;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Per-request metadata stored in request extensions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub request_id: String,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        // Honour a caller-supplied id when it is short and printable.
        let request_id = header_str(headers, REQUEST_ID_HEADER)
            .filter(|id| !id.is_empty() && id.len() <= 128)
            .filter(|id| id.chars().all(|c| c.is_ascii_graphic()))
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let client_ip = header_str(headers, "x-forwarded-for")
            .and_then(|list| list.split(',').next())
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty())
            .or_else(|| header_str(headers, "x-real-ip").map(str::to_string));

        Self {
            request_id,
            client_ip,
            user_agent: header_str(headers, header::USER_AGENT.as_str()).map(str::to_string),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// Attach a [`RequestContext`] and echo its id in the response
pub async fn request_context_middleware(mut req: Request, next: Next) -> Response {
    let context = RequestContext::from_headers(req.headers());
    let request_id = context.request_id.clone();
    req.extensions_mut().insert(context);

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Reject bodies whose declared length exceeds `max_size`
pub async fn body_size_limit_middleware(req: Request, next: Next, max_size: usize) -> Response {
    let declared = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());

    if declared.is_some_and(|length| length > max_size) {
        let err = DispatchError::InvalidRequest(format!(
            "request body exceeds {max_size} bytes"
        ));
        let mut response = match Endpoint::from_path(req.uri().path()) {
            Some(endpoint) => err.into_response_for(endpoint),
            None => err.into_response(),
        };
        *response.status_mut() = StatusCode::PAYLOAD_TOO_LARGE;
        return response;
    }

    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Extension, Router, body::Body, middleware, routing::{get, post}};
    use tower::ServiceExt;

    async fn echo_id(Extension(ctx): Extension<RequestContext>) -> String {
        ctx.request_id
    }

    #[tokio::test]
    async fn test_request_id_generated() {
        let app = Router::new()
            .route("/test", get(echo_id))
            .layer(middleware::from_fn(request_context_middleware));

        let response = app
            .oneshot(Request::builder().uri("/test").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers().get(REQUEST_ID_HEADER).unwrap();
        assert!(Uuid::parse_str(id.to_str().unwrap()).is_ok());
    }

    #[tokio::test]
    async fn test_request_id_propagated() {
        let app = Router::new()
            .route("/test", get(echo_id))
            .layer(middleware::from_fn(request_context_middleware));

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/test")
                    .header(REQUEST_ID_HEADER, "trace-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers().get(REQUEST_ID_HEADER).unwrap(), "trace-123");
    }

    #[test]
    fn test_client_ip_and_user_agent() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.1, 10.0.0.2"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("claude-cli/1.0"));
        let ctx = RequestContext::from_headers(&headers);
        assert_eq!(ctx.client_ip.as_deref(), Some("10.0.0.1"));
        assert_eq!(ctx.user_agent.as_deref(), Some("claude-cli/1.0"));

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("192.168.1.9"));
        assert_eq!(
            RequestContext::from_headers(&headers).client_ip.as_deref(),
            Some("192.168.1.9")
        );
    }

    #[tokio::test]
    async fn test_body_size_limit() {
        let max_size = 1024;
        let app = Router::new()
            .route("/test", get(|| async { "OK" }))
            .layer(middleware::from_fn(move |req, next| {
                body_size_limit_middleware(req, next, max_size)
            }));

        let within = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/test")
                    .header(header::CONTENT_LENGTH, "512")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(within.status(), StatusCode::OK);

        let over = app
            .oneshot(
                Request::builder()
                    .uri("/test")
                    .header(header::CONTENT_LENGTH, "2048")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(over.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_oversized_messages_body_uses_anthropic_envelope() {
        let app = Router::new()
            .route("/v1/messages", post(|| async { "OK" }))
            .layer(middleware::from_fn(|req, next| body_size_limit_middleware(req, next, 16)));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/messages")
                    .header(header::CONTENT_LENGTH, "64")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["type"], "invalid_request_error");
    }
}
