//! First-fit node placement.
//!
//! Candidates are the schedulable nodes of one region, ordered by ascending
//! load (CPU ratio plus memory ratio, ties broken by node id). The first
//! node whose spare CPU and memory both cover the envelope wins. A node that
//! has not reported its totals yet never fits.

use std::cmp::Ordering;

use crate::store::{ResourceEnvelope, WorkerNode};

/// Spare CPU and memory, if both totals are known.
pub fn spare(node: &WorkerNode) -> Option<(f64, i64)> {
    let cpu = node.cpu_total? - node.cpu_used;
    let memory = node.memory_total_mb? - node.memory_used_mb;
    Some((cpu, memory))
}

/// Whether the node's spare capacity covers the envelope.
pub fn fits(node: &WorkerNode, envelope: &ResourceEnvelope) -> bool {
    spare(node).is_some_and(|(cpu, memory)| cpu >= envelope.cpu && memory >= envelope.memory_mb)
}

/// Sum of the CPU and memory utilization ratios. Unknown totals sort last.
pub fn load(node: &WorkerNode) -> f64 {
    let cpu = match node.cpu_total {
        Some(total) if total > 0.0 => node.cpu_used / total,
        _ => return f64::INFINITY,
    };
    let memory = match node.memory_total_mb {
        Some(total) if total > 0 => node.memory_used_mb as f64 / total as f64,
        _ => return f64::INFINITY,
    };
    cpu + memory
}

/// Order candidates least-loaded first.
pub fn order_by_load(nodes: &mut [WorkerNode]) {
    nodes.sort_by(|a, b| {
        load(a)
            .partial_cmp(&load(b))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Pick the first schedulable node, in load order, that fits the envelope.
pub fn first_fit(mut nodes: Vec<WorkerNode>, envelope: &ResourceEnvelope) -> Option<WorkerNode> {
    nodes.retain(|n| n.status.is_schedulable());
    order_by_load(&mut nodes);
    nodes.into_iter().find(|n| fits(n, envelope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_events::NodeStatus;
    use proptest::prelude::*;

    fn node(total: (f64, i64), used: (f64, i64)) -> WorkerNode {
        let now = Utc::now();
        let mut n = WorkerNode::pending("n", "eu", "h", String::new(), now, now);
        n.status = NodeStatus::Online;
        n.cpu_total = Some(total.0);
        n.memory_total_mb = Some(total.1);
        n.cpu_used = used.0;
        n.memory_used_mb = used.1;
        n
    }

    #[test]
    fn test_cpu_headroom_too_small() {
        let a = node((4.0, 8192), (3.0, 6000));
        let envelope = ResourceEnvelope {
            cpu: 2.0,
            memory_mb: 1000,
        };
        assert!(!fits(&a, &envelope));
        assert!(first_fit(vec![a], &envelope).is_none());
    }

    #[test]
    fn test_falls_through_to_next_node() {
        let busy = node((4.0, 8192), (3.0, 6000));
        let idle = node((2.0, 2048), (0.0, 0));
        let envelope = ResourceEnvelope {
            cpu: 2.0,
            memory_mb: 1000,
        };
        let picked = first_fit(vec![busy, idle.clone()], &envelope).unwrap();
        assert_eq!(picked.id, idle.id);
    }

    #[test]
    fn test_least_loaded_first() {
        let half = node((8.0, 8192), (4.0, 4096));
        let quarter = node((8.0, 8192), (2.0, 2048));
        let envelope = ResourceEnvelope {
            cpu: 1.0,
            memory_mb: 512,
        };
        let picked = first_fit(vec![half, quarter.clone()], &envelope).unwrap();
        assert_eq!(picked.id, quarter.id);
    }

    #[test]
    fn test_unreported_node_never_fits() {
        let now = Utc::now();
        let mut n = WorkerNode::pending("n", "eu", "h", String::new(), now, now);
        n.status = NodeStatus::Online;
        assert!(!fits(&n, &ResourceEnvelope::DATABASE_DEFAULT));
        assert_eq!(load(&n), f64::INFINITY);
    }

    #[test]
    fn test_only_online_nodes_are_candidates() {
        let mut degraded = node((8.0, 8192), (0.0, 0));
        degraded.status = NodeStatus::Degraded;
        let mut draining = node((8.0, 8192), (0.0, 0));
        draining.status = NodeStatus::Draining;
        assert!(first_fit(vec![degraded, draining], &ResourceEnvelope::DATABASE_DEFAULT).is_none());
    }

    proptest! {
        #[test]
        fn prop_selected_node_always_fits(
            specs in prop::collection::vec((1u32..64, 1i64..65536, 0u32..64, 0i64..65536), 0..8),
            want_cpu in 0u32..16,
            want_mem in 0i64..16384,
        ) {
            let nodes: Vec<_> = specs
                .into_iter()
                .map(|(ct, mt, cu, mu)| node((ct as f64, mt), (cu.min(ct) as f64, mu.min(mt))))
                .collect();
            let envelope = ResourceEnvelope { cpu: want_cpu as f64, memory_mb: want_mem };
            let any_fit = nodes.iter().any(|n| fits(n, &envelope));

            match first_fit(nodes, &envelope) {
                Some(picked) => {
                    prop_assert!(picked.cpu_total.unwrap() - picked.cpu_used >= envelope.cpu);
                    prop_assert!(picked.memory_total_mb.unwrap() - picked.memory_used_mb >= envelope.memory_mb);
                }
                None => prop_assert!(!any_fit),
            }
        }
    }
}
