//! RelayGate Billing
//!
//! Pricing, pre-flight cost estimation, cost ceilings and wallet settlement.

pub mod estimate;
pub mod guard;
pub mod pricing;

pub use estimate::{CostEstimate, EstimationConfig};
pub use guard::{QuotaGuard, Settlement};
pub use pricing::{ModelPrice, PricingTable, StaticPricingTable};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Invalid price for model '{0}'")]
    InvalidPrice(String),

    #[error("Invalid estimation config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Store(#[from] relaygate_core::Error),
}

pub type Result<T> = std::result::Result<T, BillingError>;
