//! RelayGate server
//!
//! Configuration loading and the wiring that turns a gateway file plus a
//! server config into a running HTTP application.

pub mod app;
pub mod config;

pub use app::{AccountReadiness, Gateway, build_gateway};
pub use config::ServerConfig;
