//! Worker node lifecycle, health, and placement.

pub mod health;
mod liveness;
pub mod placement;
mod registry;

pub use liveness::{LivenessConfig, LivenessWorker};
pub use registry::{
    HeartbeatMetrics, IssuedToken, NodeRegistry, Registration, RegistryConfig, RegistryError,
    RegistryResult,
};
