//! # fleet-id
//!
//! Typed identifiers for every record the fleet control plane touches.
//!
//! Each identifier is `{prefix}_{ulid}`:
//!
//! - `org_01HV4Z2WQXKJNM8GPQY6VBKC3D` (tenant organization)
//! - `node_01HV4Z3MXNKPQR9HSTZ7WCLD4E` (worker node)
//! - `task_01HV4Z4NYPLTRS0JTUA8XDME5F` (dispatched task, idempotency key)
//!
//! The prefix keeps a node id from being passed where an application id is
//! expected, and the ULID keeps ids time-ordered.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
