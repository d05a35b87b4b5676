//! # fleet-events
//!
//! Shared vocabulary between the control plane and the worker nodes it
//! drives.
//!
//! ## Statuses
//!
//! Lifecycle enums for nodes (`NodeStatus`), billable resources
//! (`ResourceStatus`), and builds (`BuildStatus`). All of them serialize as
//! `snake_case` strings and round-trip through `as_str` / `FromStr`, which is
//! also how they are persisted.
//!
//! ## Tasks
//!
//! `TaskEnvelope` is the JSON frame written to a node's dispatch connection.
//! `task_id` is globally unique and is the receiver's idempotency key.
//!
//! ## Alerts
//!
//! `Alert` payloads describe conditions operators and tenants are notified
//! about: node capacity pressure, failed charges, spending thresholds.

mod alert;
mod error;
mod task;
mod types;

pub use alert::*;
pub use error::EventError;
pub use task::*;
pub use types::*;
