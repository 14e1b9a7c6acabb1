//! File-backed seeding for single-node RelayGate deployments
//!
//! Loads a gateway file (YAML or TOML) describing upstream accounts, tenant API
//! keys, tenant balances and model prices, validates it and builds the
//! in-memory collaborator backends the dispatch pipeline runs against.
//!
//! # Example
//! ```no_run
//! # use relaygate_config_file::GatewayFile;
//! # fn example() -> relaygate_core::Result<()> {
//! let backends = GatewayFile::load("~/.relaygate/gateway.yaml")?.build()?;
//! println!("{} accounts", backends.accounts.len());
//! # Ok(())
//! # }
//! ```

mod gateway_file;

pub use gateway_file::{GatewayBackends, GatewayFile, PricingSection, TenantBalance};
