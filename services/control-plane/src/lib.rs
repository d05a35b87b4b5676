//! Fleet control plane library.
//!
//! This crate primarily ships a `fleet-control-plane` binary, but the engine
//! is exposed as a library for integration testing and embedding:
//!
//! - [`nodes`]: registration, heartbeats, liveness, placement
//! - [`dispatch`]: per-node task delivery
//! - [`scheduler`]: deployments and lifecycle tasks
//! - [`billing`]: hourly metering, suspension, resumption
//! - [`backup`]: backup policies and their schedule
//! - [`webhook`]: Git push deployments
//! - [`store`]: persistence seams, Postgres and in-memory

pub mod api;
pub mod backup;
pub mod billing;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dispatch;
pub mod nodes;
pub mod notify;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod webhook;
