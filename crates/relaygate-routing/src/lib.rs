//! RelayGate Routing Engine
//!
//! This crate decides which upstream account serves a request:
//! - Session affinity (sticky sessions over a TTL cache)
//! - Rate-limit cooldown marking and lazy recovery
//! - Account scoring
//! - The account pool that ties them together

pub mod affinity;
pub mod pool;
pub mod rate_limit;
pub mod scoring;

// Re-export commonly used types
pub use affinity::{AffinityConfig, InMemoryTtlCache, SessionAffinityCache, TtlCache};
pub use pool::{AccountPool, PoolError, Selection, SelectionSource};
pub use rate_limit::{DEFAULT_COOLDOWN_SECS, RateLimitController};
pub use scoring::{ScoringWeights, score};
