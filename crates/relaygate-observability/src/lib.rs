//! RelayGate Observability
//!
//! This crate provides observability features:
//! - Metrics collection (Prometheus)
//! - Structured logging
//! - Health endpoints

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{HealthState, PlatformStatus, ReadinessChecker, health_router};
pub use logging::{LoggingConfig, init_tracing};
pub use metrics::Metrics;
