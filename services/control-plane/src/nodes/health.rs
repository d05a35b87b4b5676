//! Health derivation from a node's capacity snapshot.

use fleet_events::{CapacityBreach, CapacityDimension, NodeStatus};

use crate::store::WorkerNode;

/// Utilization of every dimension whose total is known and positive.
pub fn utilization(node: &WorkerNode) -> Vec<CapacityBreach> {
    let dims = [
        (CapacityDimension::Cpu, node.cpu_used, node.cpu_total),
        (
            CapacityDimension::Memory,
            node.memory_used_mb as f64,
            node.memory_total_mb.map(|t| t as f64),
        ),
        (
            CapacityDimension::Disk,
            node.disk_used_mb as f64,
            node.disk_total_mb.map(|t| t as f64),
        ),
    ];

    dims.into_iter()
        .filter_map(|(dimension, used, total)| {
            let total = total.filter(|t| *t > 0.0)?;
            Some(CapacityBreach {
                dimension,
                used,
                total,
                ratio: used / total,
            })
        })
        .collect()
}

/// Dimensions at or above `alert_ratio`.
pub fn capacity_breaches(node: &WorkerNode, alert_ratio: f64) -> Vec<CapacityBreach> {
    utilization(node)
        .into_iter()
        .filter(|u| u.ratio >= alert_ratio)
        .collect()
}

/// Status implied by a fresh heartbeat.
///
/// Operator holds survive; otherwise an explicit override wins, then
/// `degraded` if any dimension breached, else `online`.
pub fn derive_status(
    current: NodeStatus,
    requested: Option<NodeStatus>,
    breached: bool,
) -> NodeStatus {
    if current.is_operator_hold() {
        return current;
    }
    match requested {
        Some(status) => status,
        None if breached => NodeStatus::Degraded,
        None => NodeStatus::Online,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn node(cpu: (f64, Option<f64>), mem: (i64, Option<i64>)) -> WorkerNode {
        let now = Utc::now();
        let mut n = WorkerNode::pending("n", "r", "h", String::new(), now, now);
        n.cpu_used = cpu.0;
        n.cpu_total = cpu.1;
        n.memory_used_mb = mem.0;
        n.memory_total_mb = mem.1;
        n
    }

    #[test]
    fn test_unknown_totals_are_skipped() {
        let n = node((3.0, None), (100, Some(1000)));
        let u = utilization(&n);
        assert_eq!(u.len(), 1);
        assert_eq!(u[0].dimension, CapacityDimension::Memory);
    }

    #[test]
    fn test_breach_at_exact_ratio() {
        let n = node((9.0, Some(10.0)), (100, Some(1000)));
        let b = capacity_breaches(&n, 0.90);
        assert_eq!(b.len(), 1);
        assert_eq!(b[0].dimension, CapacityDimension::Cpu);
    }

    #[test]
    fn test_derive_status() {
        assert_eq!(
            derive_status(NodeStatus::Offline, None, true),
            NodeStatus::Degraded
        );
        assert_eq!(
            derive_status(NodeStatus::Degraded, None, false),
            NodeStatus::Online
        );
        assert_eq!(
            derive_status(NodeStatus::Online, Some(NodeStatus::Degraded), false),
            NodeStatus::Degraded
        );
        assert_eq!(
            derive_status(NodeStatus::Draining, None, false),
            NodeStatus::Draining
        );
        assert_eq!(
            derive_status(NodeStatus::Disabled, Some(NodeStatus::Online), false),
            NodeStatus::Disabled
        );
    }
}
