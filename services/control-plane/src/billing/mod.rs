//! Metered billing.
//!
//! - [`meter`]: whole-hour charge computation
//! - [`BillingEngine`]: settlement, suspension, resumption, spending alerts
//! - [`BillingWorker`]: the periodic driver

mod engine;
pub mod meter;
mod worker;

pub use engine::{
    BillingConfig, BillingEngine, BillingError, BillingResult, BillingStats, INSUFFICIENT_FUNDS,
    PROVIDER_FAILURE,
};
pub use worker::BillingWorker;
