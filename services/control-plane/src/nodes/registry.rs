//! Worker node registry.
//!
//! Owns the node lifecycle: token issue and redemption, heartbeats and the
//! health derived from them, the offline sweep, operator holds, and the
//! capacity queries placement runs on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fleet_events::{Alert, NodeStatus};
use fleet_id::NodeId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::{health, placement};
use crate::crypto::{generate_node_secret, generate_registration_token, hash_token};
use crate::dispatch::DispatchChannel;
use crate::notify::Notifier;
use crate::store::{HeartbeatUpdate, ResourceEnvelope, Store, StoreError, WorkerNode};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("node not found: {0}")]
    NotFound(NodeId),

    #[error("registration token is unknown or expired")]
    InvalidToken,

    #[error("node secret is invalid")]
    InvalidSecret,

    #[error("node {0} has not completed registration")]
    NotRegistered(NodeId),

    #[error("node {node_id} still has {bound} bound workloads")]
    NodeInUse { node_id: NodeId, bound: i64 },

    #[error("a node cannot report status {0}")]
    InvalidStatus(NodeStatus),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub registration_token_ttl: Duration,
    pub offline_threshold: Duration,
    pub capacity_alert_ratio: f64,
    pub capacity_alert_cooldown: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            registration_token_ttl: Duration::from_secs(30 * 60),
            offline_threshold: Duration::from_secs(90),
            capacity_alert_ratio: 0.90,
            capacity_alert_cooldown: Duration::from_secs(15 * 60),
        }
    }
}

fn delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

/// A freshly issued registration token. The plaintext is never stored.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub node_id: NodeId,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of redeeming a token: the node and its long-lived secret.
#[derive(Debug, Clone)]
pub struct Registration {
    pub node: WorkerNode,
    pub node_secret: String,
}

/// Snapshot reported by a node. Absent fields keep their previous value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    pub cpu_total: Option<f64>,
    pub memory_total_mb: Option<i64>,
    pub disk_total_mb: Option<i64>,
    pub cpu_used: Option<f64>,
    pub memory_used_mb: Option<i64>,
    pub disk_used_mb: Option<i64>,
    pub container_count: Option<i32>,
    /// Explicit status override from the node: `online`, `degraded` or
    /// `offline`.
    pub status: Option<NodeStatus>,
}

impl HeartbeatMetrics {
    fn apply(&self, node: &mut WorkerNode) {
        if let Some(v) = self.cpu_total {
            node.cpu_total = Some(v);
        }
        if let Some(v) = self.memory_total_mb {
            node.memory_total_mb = Some(v);
        }
        if let Some(v) = self.disk_total_mb {
            node.disk_total_mb = Some(v);
        }
        if let Some(v) = self.cpu_used {
            node.cpu_used = v;
        }
        if let Some(v) = self.memory_used_mb {
            node.memory_used_mb = v;
        }
        if let Some(v) = self.disk_used_mb {
            node.disk_used_mb = v;
        }
        if let Some(v) = self.container_count {
            node.container_count = v;
        }
    }
}

pub struct NodeRegistry {
    store: Arc<dyn Store>,
    channel: Arc<DispatchChannel>,
    notifier: Arc<dyn Notifier>,
    config: RegistryConfig,
}

impl NodeRegistry {
    pub fn new(
        store: Arc<dyn Store>,
        channel: Arc<DispatchChannel>,
        notifier: Arc<dyn Notifier>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            store,
            channel,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub async fn get_node(&self, node_id: NodeId) -> RegistryResult<WorkerNode> {
        self.store
            .get_node(node_id)
            .await?
            .ok_or(RegistryError::NotFound(node_id))
    }

    // -------------------------------------------------------------------------
    // Registration
    // -------------------------------------------------------------------------

    pub async fn issue_registration_token(
        &self,
        name: &str,
        region: &str,
        host_address: &str,
    ) -> RegistryResult<IssuedToken> {
        self.issue_registration_token_at(name, region, host_address, Utc::now())
            .await
    }

    /// Create a `pending` node holding a single-use token.
    pub async fn issue_registration_token_at(
        &self,
        name: &str,
        region: &str,
        host_address: &str,
        now: DateTime<Utc>,
    ) -> RegistryResult<IssuedToken> {
        let token = generate_registration_token();
        let expires_at = now + delta(self.config.registration_token_ttl);
        let node = WorkerNode::pending(
            name,
            region,
            host_address,
            hash_token(&token),
            expires_at,
            now,
        );
        self.store.insert_node(&node).await?;

        info!(node_id = %node.id, name, region, "issued registration token");

        Ok(IssuedToken {
            node_id: node.id,
            token,
            expires_at,
        })
    }

    pub async fn redeem_token(
        &self,
        token: &str,
        host_address: Option<&str>,
    ) -> RegistryResult<Registration> {
        self.redeem_token_at(token, host_address, Utc::now()).await
    }

    /// Consume a token, mint the node secret, and move the node to `offline`.
    /// Concurrent redemptions of one token yield exactly one registration.
    pub async fn redeem_token_at(
        &self,
        token: &str,
        host_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> RegistryResult<Registration> {
        let node_secret = generate_node_secret();
        let node = self
            .store
            .redeem_registration(
                &hash_token(token),
                &hash_token(&node_secret),
                host_address.filter(|h| !h.is_empty()),
                now,
            )
            .await?
            .ok_or_else(|| {
                warn!("registration token unknown, expired or already used");
                RegistryError::InvalidToken
            })?;

        info!(node_id = %node.id, host = %node.host_address, "node registered");

        Ok(Registration { node, node_secret })
    }

    /// Verify a per-node secret.
    pub async fn authenticate(&self, node_id: NodeId, secret: &str) -> RegistryResult<WorkerNode> {
        let node = self
            .store
            .get_node(node_id)
            .await?
            .ok_or(RegistryError::InvalidSecret)?;

        match node.secret_hash.as_deref() {
            Some(stored) if stored == hash_token(secret) => Ok(node),
            _ => Err(RegistryError::InvalidSecret),
        }
    }

    // -------------------------------------------------------------------------
    // Heartbeats and liveness
    // -------------------------------------------------------------------------

    pub async fn heartbeat(
        &self,
        node_id: NodeId,
        metrics: &HeartbeatMetrics,
    ) -> RegistryResult<WorkerNode> {
        self.heartbeat_at(node_id, metrics, Utc::now()).await
    }

    /// Replace the node's metrics, derive its health, and raise a capacity
    /// alert if one is due. An operator hold placed while the heartbeat is
    /// in flight is kept.
    pub async fn heartbeat_at(
        &self,
        node_id: NodeId,
        metrics: &HeartbeatMetrics,
        now: DateTime<Utc>,
    ) -> RegistryResult<WorkerNode> {
        if let Some(status) = metrics.status.filter(|s| !s.is_self_reportable()) {
            return Err(RegistryError::InvalidStatus(status));
        }

        let mut node = self.get_node(node_id).await?;
        if node.status == NodeStatus::Pending {
            return Err(RegistryError::NotRegistered(node_id));
        }

        let previous = node.status;
        metrics.apply(&mut node);

        let breaches = health::capacity_breaches(&node, self.config.capacity_alert_ratio);
        node.status = health::derive_status(previous, metrics.status, !breaches.is_empty());

        let alert_due = !breaches.is_empty()
            && node
                .last_capacity_alert_at
                .is_none_or(|at| now - at >= delta(self.config.capacity_alert_cooldown));
        if alert_due {
            node.last_capacity_alert_at = Some(now);
        }

        let node = self
            .store
            .record_heartbeat(node_id, &HeartbeatUpdate::from_node(&node, now))
            .await?
            .ok_or(RegistryError::NotFound(node_id))?;

        if previous != node.status {
            info!(node_id = %node_id, from = %previous, to = %node.status, "node status changed");
        }

        if alert_due {
            warn!(node_id = %node_id, breaches = breaches.len(), "node over capacity");
            self.notifier
                .notify(Alert::NodeCapacity {
                    node_id,
                    node_name: node.name.clone(),
                    region: node.region.clone(),
                    breaches,
                    at: now,
                })
                .await;
        }

        Ok(node)
    }

    pub async fn mark_offline_nodes(&self) -> RegistryResult<usize> {
        self.mark_offline_nodes_at(Utc::now()).await
    }

    /// Move every live node whose heartbeat is at least the offline threshold
    /// old to `offline`, and drop its dispatch connection.
    #[instrument(skip(self))]
    pub async fn mark_offline_nodes_at(&self, now: DateTime<Utc>) -> RegistryResult<usize> {
        let cutoff = now - delta(self.config.offline_threshold);
        let moved = self.store.mark_offline_before(cutoff, now).await?;

        for node_id in &moved {
            self.channel.evict(*node_id);
            warn!(node_id = %node_id, "node missed heartbeats, marked offline");
        }

        Ok(moved.len())
    }

    // -------------------------------------------------------------------------
    // Capacity
    // -------------------------------------------------------------------------

    /// Whether the node's spare CPU and memory cover the request. Unknown
    /// nodes have no capacity.
    pub async fn has_capacity(
        &self,
        node_id: NodeId,
        cpu: f64,
        memory_mb: i64,
    ) -> RegistryResult<bool> {
        Ok(self
            .store
            .get_node(node_id)
            .await?
            .is_some_and(|node| placement::fits(&node, &ResourceEnvelope { cpu, memory_mb })))
    }

    /// First-fit over the region's online nodes, least loaded first.
    pub async fn select_node(
        &self,
        region: &str,
        envelope: &ResourceEnvelope,
    ) -> RegistryResult<Option<WorkerNode>> {
        let nodes = self.store.list_nodes_in_region(region).await?;
        Ok(placement::first_fit(nodes, envelope))
    }

    // -------------------------------------------------------------------------
    // Operator actions
    // -------------------------------------------------------------------------

    pub async fn drain(&self, node_id: NodeId) -> RegistryResult<WorkerNode> {
        self.set_status(node_id, NodeStatus::Draining).await
    }

    pub async fn disable(&self, node_id: NodeId) -> RegistryResult<WorkerNode> {
        let node = self.set_status(node_id, NodeStatus::Disabled).await?;
        self.channel.evict(node_id);
        Ok(node)
    }

    /// Lift an operator hold. The node is `offline` until its next heartbeat.
    pub async fn enable(&self, node_id: NodeId) -> RegistryResult<WorkerNode> {
        self.set_status(node_id, NodeStatus::Offline).await
    }

    async fn set_status(&self, node_id: NodeId, status: NodeStatus) -> RegistryResult<WorkerNode> {
        let previous = self.get_node(node_id).await?.status;
        let node = self
            .store
            .set_node_status(node_id, status, Utc::now())
            .await?
            .ok_or(RegistryError::NotRegistered(node_id))?;

        info!(node_id = %node_id, from = %previous, to = %status, "node status set by operator");
        Ok(node)
    }

    /// Delete a node that has no bound workloads.
    pub async fn remove_node(&self, node_id: NodeId) -> RegistryResult<()> {
        let bound = self.store.count_bound_workloads(node_id).await?;
        if bound > 0 {
            return Err(RegistryError::NodeInUse { node_id, bound });
        }

        if !self.store.delete_node(node_id).await? {
            return Err(RegistryError::NotFound(node_id));
        }
        self.channel.evict(node_id);

        info!(node_id = %node_id, "node removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::MemoryNotifier;
    use crate::store::MemoryStore;

    fn registry() -> (NodeRegistry, Arc<MemoryNotifier>, Arc<DispatchChannel>) {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let channel = Arc::new(DispatchChannel::new(store.clone()));
        let notifier = Arc::new(MemoryNotifier::new());
        let registry = NodeRegistry::new(
            store,
            channel.clone(),
            notifier.clone(),
            RegistryConfig::default(),
        );
        (registry, notifier, channel)
    }

    #[tokio::test]
    async fn test_token_is_single_use() {
        let (registry, _, _) = registry();
        let issued = registry
            .issue_registration_token("n1", "eu", "10.0.0.1")
            .await
            .unwrap();

        let reg = registry
            .redeem_token(&issued.token, Some("10.0.0.2"))
            .await
            .unwrap();
        assert_eq!(reg.node.status, NodeStatus::Offline);
        assert_eq!(reg.node.host_address, "10.0.0.2");

        assert!(matches!(
            registry.redeem_token(&issued.token, None).await,
            Err(RegistryError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_redemptions_register_once() {
        let (registry, _, _) = registry();
        let issued = registry
            .issue_registration_token("n1", "eu", "10.0.0.1")
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            registry.redeem_token(&issued.token, None),
            registry.redeem_token(&issued.token, None),
        );
        let winners: Vec<_> = [a, b].into_iter().filter_map(Result::ok).collect();
        assert_eq!(winners.len(), 1);

        assert!(registry
            .authenticate(issued.node_id, &winners[0].node_secret)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected() {
        let (registry, _, _) = registry();
        let t0 = Utc::now();
        let issued = registry
            .issue_registration_token_at("n1", "eu", "10.0.0.1", t0)
            .await
            .unwrap();

        assert!(matches!(
            registry
                .redeem_token_at(&issued.token, None, t0 + TimeDelta::minutes(30))
                .await,
            Err(RegistryError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_node_cannot_report_registry_statuses() {
        let (registry, _, _) = registry();
        let issued = registry
            .issue_registration_token("n1", "eu", "10.0.0.1")
            .await
            .unwrap();
        registry.redeem_token(&issued.token, None).await.unwrap();

        for status in [NodeStatus::Pending, NodeStatus::Draining, NodeStatus::Disabled] {
            let metrics = HeartbeatMetrics {
                status: Some(status),
                ..Default::default()
            };
            assert!(matches!(
                registry.heartbeat(issued.node_id, &metrics).await,
                Err(RegistryError::InvalidStatus(s)) if s == status
            ));
        }

        // Nothing was written, and the node can still heartbeat.
        let node = registry
            .heartbeat(issued.node_id, &HeartbeatMetrics::default())
            .await
            .unwrap();
        assert_eq!(node.status, NodeStatus::Online);

        let metrics = HeartbeatMetrics {
            status: Some(NodeStatus::Degraded),
            ..Default::default()
        };
        let node = registry.heartbeat(issued.node_id, &metrics).await.unwrap();
        assert_eq!(node.status, NodeStatus::Degraded);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_missing_fields() {
        let (registry, _, _) = registry();
        let issued = registry
            .issue_registration_token("n1", "eu", "10.0.0.1")
            .await
            .unwrap();
        registry.redeem_token(&issued.token, None).await.unwrap();

        let first = HeartbeatMetrics {
            cpu_total: Some(8.0),
            memory_total_mb: Some(16384),
            cpu_used: Some(1.0),
            ..Default::default()
        };
        registry.heartbeat(issued.node_id, &first).await.unwrap();

        let second = HeartbeatMetrics {
            cpu_used: Some(2.0),
            ..Default::default()
        };
        let node = registry.heartbeat(issued.node_id, &second).await.unwrap();
        assert_eq!(node.cpu_total, Some(8.0));
        assert_eq!(node.memory_total_mb, Some(16384));
        assert_eq!(node.cpu_used, 2.0);
        assert_eq!(node.status, NodeStatus::Online);
    }

    #[tokio::test]
    async fn test_pending_node_cannot_heartbeat() {
        let (registry, _, _) = registry();
        let issued = registry
            .issue_registration_token("n1", "eu", "10.0.0.1")
            .await
            .unwrap();
        assert!(matches!(
            registry
                .heartbeat(issued.node_id, &HeartbeatMetrics::default())
                .await,
            Err(RegistryError::NotRegistered(_))
        ));
    }

    #[tokio::test]
    async fn test_authenticate() {
        let (registry, _, _) = registry();
        let issued = registry
            .issue_registration_token("n1", "eu", "10.0.0.1")
            .await
            .unwrap();
        let reg = registry.redeem_token(&issued.token, None).await.unwrap();

        assert!(registry
            .authenticate(issued.node_id, &reg.node_secret)
            .await
            .is_ok());
        assert!(matches!(
            registry.authenticate(issued.node_id, "flt_node_wrong").await,
            Err(RegistryError::InvalidSecret)
        ));
    }
}
