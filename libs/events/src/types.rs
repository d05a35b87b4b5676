//! Status enums shared across the fleet.
//!
//! Every enum here is persisted as its `as_str` form, so renaming a variant
//! is a schema change.

use serde::{Deserialize, Serialize};

use crate::EventError;

macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = EventError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(EventError::UnknownVariant {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

// =============================================================================
// Nodes
// =============================================================================

/// Worker node lifecycle.
///
/// `pending` until the registration token is redeemed, `offline` until the
/// first heartbeat, then `online`/`degraded` while heartbeats keep arriving.
/// `draining` and `disabled` are operator holds and survive heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Offline,
    Online,
    Degraded,
    Draining,
    Disabled,
}

string_enum!(NodeStatus, "node status", {
    Pending => "pending",
    Offline => "offline",
    Online => "online",
    Degraded => "degraded",
    Draining => "draining",
    Disabled => "disabled",
});

impl NodeStatus {
    /// Statuses whose liveness depends on a fresh heartbeat.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Online | Self::Degraded)
    }

    /// Only online nodes receive new placements.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Online)
    }

    /// Operator-imposed statuses that heartbeats never overwrite.
    pub fn is_operator_hold(&self) -> bool {
        matches!(self, Self::Draining | Self::Disabled)
    }

    /// Statuses a node may report about itself in a heartbeat.
    pub fn is_self_reportable(&self) -> bool {
        matches!(self, Self::Online | Self::Degraded | Self::Offline)
    }
}

/// Capacity dimensions tracked per node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityDimension {
    Cpu,
    Memory,
    Disk,
}

string_enum!(CapacityDimension, "capacity dimension", {
    Cpu => "cpu",
    Memory => "memory",
    Disk => "disk",
});

// =============================================================================
// Workloads
// =============================================================================

/// Kind of billable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Application,
    Database,
}

string_enum!(ResourceKind, "resource kind", {
    Application => "application",
    Database => "database",
});

/// Lifecycle of an application or database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    Building,
    Deploying,
    Running,
    Stopped,
    Suspended,
    Failed,
}

string_enum!(ResourceStatus, "resource status", {
    Building => "building",
    Deploying => "deploying",
    Running => "running",
    Stopped => "stopped",
    Suspended => "suspended",
    Failed => "failed",
});

impl ResourceStatus {
    /// Statuses evaluated by the metering loop. Suspended resources stay in
    /// the set so they can resume once the wallet covers the charge.
    pub fn is_billable(&self) -> bool {
        matches!(self, Self::Running | Self::Suspended)
    }
}

/// Build lifecycle as far as the control plane observes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Dispatched,
    Failed,
}

string_enum!(BuildStatus, "build status", {
    Queued => "queued",
    Dispatched => "dispatched",
    Failed => "failed",
});

/// What started a build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildTrigger {
    Manual,
    Webhook,
}

string_enum!(BuildTrigger, "build trigger", {
    Manual => "manual",
    Webhook => "webhook",
});

/// Audit status of a dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Accepted by the node's connection outbox.
    Queued,
    /// The node was not connected (or its outbox was full).
    Undeliverable,
    /// Dropped from the outbox before it was written to the node.
    Cancelled,
}

string_enum!(TaskStatus, "task status", {
    Queued => "queued",
    Undeliverable => "undeliverable",
    Cancelled => "cancelled",
});
