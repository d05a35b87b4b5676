//! Alert payloads handed to the notifier.

use chrono::{DateTime, Utc};
use fleet_id::{NodeId, OrgId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{CapacityDimension, ResourceKind};

/// A single dimension over the capacity alert ratio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapacityBreach {
    pub dimension: CapacityDimension,
    pub used: f64,
    pub total: f64,
    pub ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    /// A node crossed the capacity alert ratio. Addressed to fleet admins.
    NodeCapacity {
        node_id: NodeId,
        node_name: String,
        region: String,
        breaches: Vec<CapacityBreach>,
        at: DateTime<Utc>,
    },

    /// A charge could not be collected; the resource is being suspended.
    ChargeFailed {
        org_id: OrgId,
        resource_kind: ResourceKind,
        resource_id: String,
        amount: Decimal,
        balance: Option<Decimal>,
        reason: String,
        at: DateTime<Utc>,
    },

    /// The wallet balance dropped below the organization's alert threshold.
    SpendingThreshold {
        org_id: OrgId,
        threshold: Decimal,
        balance: Decimal,
        at: DateTime<Utc>,
    },
}

impl Alert {
    pub fn kind(&self) -> &'static str {
        match self {
            Alert::NodeCapacity { .. } => "node_capacity",
            Alert::ChargeFailed { .. } => "charge_failed",
            Alert::SpendingThreshold { .. } => "spending_threshold",
        }
    }

    /// The organization the alert concerns, if any. Node alerts go to fleet
    /// admins only.
    pub fn org_id(&self) -> Option<OrgId> {
        match self {
            Alert::NodeCapacity { .. } => None,
            Alert::ChargeFailed { org_id, .. } | Alert::SpendingThreshold { org_id, .. } => {
                Some(*org_id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_tagged_serialization() {
        let org_id = OrgId::new();
        let alert = Alert::SpendingThreshold {
            org_id,
            threshold: Decimal::new(500, 2),
            balance: Decimal::new(499, 2),
            at: Utc::now(),
        };

        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["kind"], "spending_threshold");
        assert_eq!(json["threshold"], "5.00");
        assert_eq!(alert.org_id(), Some(org_id));
        assert_eq!(alert.kind(), "spending_threshold");
    }
}
