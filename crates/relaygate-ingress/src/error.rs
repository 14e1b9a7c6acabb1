//! Dispatch error taxonomy and its HTTP mapping

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use relaygate_billing::BillingError;
use relaygate_core::{Decimal, LimitKind, UpstreamError};
use relaygate_egress::CredentialError;
use relaygate_routing::PoolError;
use serde_json::{Value, json};
use thiserror::Error;

use crate::pipeline::Endpoint;

/// Every way a dispatched request can be rejected or fail
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Authorization(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("{} cost limit reached", limit_label(.0))]
    QuotaExceeded(LimitKind),

    #[error("Insufficient balance: estimated cost {estimated_cost}")]
    InsufficientBalance { estimated_cost: Decimal },

    #[error("{0}")]
    NoAvailableAccount(String),

    #[error("Upstream rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        retry_after_secs: u64,
        message: String,
    },

    #[error("No valid credential for account {0}")]
    NoValidCredential(String),

    #[error("{0}")]
    Upstream(String),

    #[error("Request canceled")]
    Canceled,

    #[error("Internal error: {0}")]
    Internal(String),
}

fn limit_label(kind: &LimitKind) -> &'static str {
    match kind {
        LimitKind::Daily => "Daily",
        LimitKind::Monthly => "Monthly",
        LimitKind::Total => "Total",
    }
}

impl DispatchError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchError::Authentication(_) => StatusCode::UNAUTHORIZED,
            DispatchError::Authorization(_) | DispatchError::NoAvailableAccount(_) => {
                StatusCode::FORBIDDEN
            }
            DispatchError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            DispatchError::QuotaExceeded(_) | DispatchError::RateLimited { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            DispatchError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
            // Client closed request
            DispatchError::Canceled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST)
            }
            DispatchError::NoValidCredential(_)
            | DispatchError::Upstream(_)
            | DispatchError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Error family, in the style of provider error bodies
    pub fn error_type(&self) -> &'static str {
        match self {
            DispatchError::Authentication(_) => "authentication_error",
            DispatchError::Authorization(_) => "permission_error",
            DispatchError::InvalidRequest(_) => "invalid_request_error",
            DispatchError::QuotaExceeded(_) => "quota_exceeded_error",
            DispatchError::InsufficientBalance { .. } => "billing_error",
            DispatchError::NoAvailableAccount(_) => "permission_error",
            DispatchError::RateLimited { .. } => "rate_limit_error",
            DispatchError::NoValidCredential(_) => "credential_error",
            DispatchError::Upstream(_) => "api_error",
            DispatchError::Canceled => "canceled",
            DispatchError::Internal(_) => "api_error",
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::Authentication(_) => "invalid_api_key",
            DispatchError::Authorization(_) => "forbidden",
            DispatchError::InvalidRequest(_) => "invalid_request",
            DispatchError::QuotaExceeded(LimitKind::Daily) => "daily_cost_limit_exceeded",
            DispatchError::QuotaExceeded(LimitKind::Monthly) => "monthly_cost_limit_exceeded",
            DispatchError::QuotaExceeded(LimitKind::Total) => "total_cost_limit_exceeded",
            DispatchError::InsufficientBalance { .. } => "insufficient_balance",
            DispatchError::NoAvailableAccount(_) => "no_available_account",
            DispatchError::RateLimited { .. } => "rate_limited",
            DispatchError::NoValidCredential(_) => "no_valid_credential",
            DispatchError::Upstream(_) => "upstream_error",
            DispatchError::Canceled => "canceled",
            DispatchError::Internal(_) => "internal_error",
        }
    }

    /// `{"error": {"message", "type", "code"}}`
    pub fn body(&self) -> Value {
        json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": self.code(),
            }
        })
    }

    /// Error body in the format clients of `endpoint` parse
    ///
    /// `/v1/messages` gets the Anthropic envelope
    /// `{"type": "error", "error": {"type", "message"}}`, with `code` alongside.
    pub fn body_for(&self, endpoint: Endpoint) -> Value {
        match endpoint {
            Endpoint::Messages => json!({
                "type": "error",
                "error": {
                    "type": self.error_type(),
                    "message": self.to_string(),
                    "code": self.code(),
                }
            }),
            Endpoint::ChatCompletions => self.body(),
        }
    }

    /// HTTP response with the body shaped for `endpoint`
    pub fn into_response_for(self, endpoint: Endpoint) -> Response {
        let body = self.body_for(endpoint);
        self.respond_with(body)
    }

    fn respond_with(self, body: Value) -> Response {
        let mut response = (self.status_code(), Json(body)).into_response();
        if let DispatchError::RateLimited {
            retry_after_secs, ..
        } = &self
        {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(*retry_after_secs));
        }
        response
    }

    /// Outcome label for metrics
    pub fn outcome(&self) -> &'static str {
        match self {
            DispatchError::RateLimited { .. } => "rate_limited",
            DispatchError::Canceled => "canceled",
            DispatchError::Upstream(_) | DispatchError::NoValidCredential(_) => "failed",
            _ => "rejected",
        }
    }
}

impl From<PoolError> for DispatchError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::NoAvailableAccount { .. } => {
                DispatchError::NoAvailableAccount(e.to_string())
            }
            PoolError::Store(err) => DispatchError::Internal(err.to_string()),
        }
    }
}

impl From<relaygate_core::Error> for DispatchError {
    fn from(e: relaygate_core::Error) -> Self {
        DispatchError::Internal(e.to_string())
    }
}

impl From<CredentialError> for DispatchError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::NoValidCredential(account_id) => {
                DispatchError::NoValidCredential(account_id)
            }
            CredentialError::Store(err) => DispatchError::Internal(err.to_string()),
        }
    }
}

impl From<BillingError> for DispatchError {
    fn from(e: BillingError) -> Self {
        DispatchError::Internal(e.to_string())
    }
}

impl From<UpstreamError> for DispatchError {
    fn from(e: UpstreamError) -> Self {
        match e {
            UpstreamError::RateLimited {
                retry_after_secs,
                message,
                ..
            } => DispatchError::RateLimited {
                retry_after_secs,
                message,
            },
            other => DispatchError::Upstream(other.to_string()),
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let body = self.body();
        self.respond_with(body)
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
