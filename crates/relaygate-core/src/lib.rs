//! RelayGate Core Types and Traits
//!
//! This crate provides the fundamental types and traits used throughout RelayGate:
//! - Upstream accounts, tenant API keys and token usage
//! - Collaborator traits (account/key stores, wallet, request log, upstream client)
//! - In-memory collaborator backends
//! - Core error types

pub mod account;
pub mod api_key;
pub mod clock;
pub mod error;
pub mod memory;
pub mod store;
pub mod tenant;
pub mod upstream;
pub mod usage;

pub use account::{Account, AccountStatus, OAuthCredentials, Platform, ProxyConfig};
pub use api_key::{AllowedServices, ApiKey, CostCounters, LimitKind, Service};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use memory::{
    InMemoryAccountStore, InMemoryApiKeyStore, InMemoryRequestLogStore, InMemoryWallet,
    RequestLogRecord, WalletDebit,
};
pub use store::{
    AccountStore, ApiKeyStore, NewRequestLog, RequestLogCompletion, RequestLogStore,
    RequestStatus, Wallet,
};
pub use tenant::TenantId;
pub use upstream::{
    MAX_COOLDOWN_SECS, UpstreamClient, UpstreamContext, UpstreamError, UpstreamEvent,
    UpstreamEventStream, UpstreamRequest, UpstreamResponse, cooldown_until,
};
pub use usage::{TokenUsage, UsageAccumulator, UsageFragment};

// Re-exported so downstream crates agree on the money type.
pub use rust_decimal::Decimal;
