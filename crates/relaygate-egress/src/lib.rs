//! RelayGate Egress Connectors
//!
//! This crate talks to upstream LLM providers on behalf of accounts:
//! - HTTP client construction with per-account outbound proxies
//! - `Retry-After` / rate-limit reset header parsing
//! - OAuth refresh-token grant and the credential refresher
//! - Pass-through chat clients for Claude, Claude Console, OpenAI and Gemini

pub mod anthropic;
pub mod client;
pub mod credentials;
pub mod oauth;
pub mod openai;
pub mod retry_after;
pub mod upstream;

pub use anthropic::{AnthropicConfig, ClaudeClient};
pub use client::{ClientPool, HttpClientConfig, create_client};
pub use credentials::{CredentialError, CredentialOutcome, CredentialRefresher, ValidCredential};
pub use oauth::{HttpTokenRefresher, OAuthConfig, RefreshedToken, TokenRefresher};
pub use openai::{OpenAiCompatClient, OpenAiConfig};
pub use retry_after::{parse_retry_after, retry_after_from_headers};
pub use upstream::{PlatformClients, RateLimitPolicy};

use thiserror::Error;

/// Egress errors
#[derive(Debug, Error)]
pub enum EgressError {
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Provider returned error status {status_code}: {message}")]
    ProviderError { status_code: u16, message: String },

    #[error("Failed to parse provider response: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ConfigError(String),
}

pub type Result<T> = std::result::Result<T, EgressError>;
