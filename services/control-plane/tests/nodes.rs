//! Node registration, heartbeats, liveness and operator actions.

mod common;

use chrono::{DateTime, Duration, TimeZone, Utc};
use common::Fleet;
use fleet_control_plane::nodes::{HeartbeatMetrics, RegistryError};
use fleet_control_plane::store::NodeStore;
use fleet_events::{NodeStatus, ResourceStatus};
use fleet_id::{NodeId, OrgId};
use rust_decimal_macros::dec;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap()
}

fn busy() -> HeartbeatMetrics {
    HeartbeatMetrics {
        cpu_total: Some(4.0),
        memory_total_mb: Some(8192),
        cpu_used: Some(3.8),
        memory_used_mb: Some(1024),
        ..Default::default()
    }
}

fn idle() -> HeartbeatMetrics {
    HeartbeatMetrics {
        cpu_total: Some(4.0),
        memory_total_mb: Some(8192),
        cpu_used: Some(0.5),
        memory_used_mb: Some(1024),
        ..Default::default()
    }
}

async fn registered_at(fleet: &Fleet, now: DateTime<Utc>) -> NodeId {
    let issued = fleet
        .registry
        .issue_registration_token_at("worker-1", "eu", "10.0.0.1", now)
        .await
        .unwrap();
    fleet
        .registry
        .redeem_token_at(&issued.token, None, now)
        .await
        .unwrap()
        .node
        .id
}

#[tokio::test]
async fn test_token_expires_after_ttl() {
    let fleet = Fleet::new();
    let issued = fleet
        .registry
        .issue_registration_token_at("worker-1", "eu", "10.0.0.1", t0())
        .await
        .unwrap();
    assert_eq!(issued.expires_at, t0() + Duration::minutes(30));

    let err = fleet
        .registry
        .redeem_token_at(&issued.token, None, t0() + Duration::minutes(31))
        .await
        .unwrap_err();
    assert!(matches!(err, RegistryError::InvalidToken));

    let node = fleet.store.get_node(issued.node_id).await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Pending);
}

#[tokio::test]
async fn test_token_redeems_once_within_ttl() {
    let fleet = Fleet::new();
    let issued = fleet
        .registry
        .issue_registration_token_at("worker-1", "eu", "10.0.0.1", t0())
        .await
        .unwrap();

    let registration = fleet
        .registry
        .redeem_token_at(
            &issued.token,
            Some("192.168.1.20"),
            t0() + Duration::minutes(29),
        )
        .await
        .unwrap();
    assert_eq!(registration.node.id, issued.node_id);
    assert_eq!(registration.node.status, NodeStatus::Offline);
    assert_eq!(registration.node.host_address, "192.168.1.20");
    assert!(!registration.node_secret.is_empty());

    let again = fleet
        .registry
        .redeem_token_at(&issued.token, None, t0() + Duration::minutes(29))
        .await;
    assert!(matches!(again, Err(RegistryError::InvalidToken)));
}

#[tokio::test]
async fn test_wrong_secret_is_rejected() {
    let fleet = Fleet::new();
    let issued = fleet
        .registry
        .issue_registration_token("worker-1", "eu", "10.0.0.1")
        .await
        .unwrap();
    let registration = fleet.registry.redeem_token(&issued.token, None).await.unwrap();

    assert!(fleet
        .registry
        .authenticate(issued.node_id, &registration.node_secret)
        .await
        .is_ok());
    assert!(matches!(
        fleet.registry.authenticate(issued.node_id, "nope").await,
        Err(RegistryError::InvalidSecret)
    ));
    assert!(matches!(
        fleet
            .registry
            .authenticate(NodeId::new(), &registration.node_secret)
            .await,
        Err(RegistryError::InvalidSecret)
    ));
}

#[tokio::test]
async fn test_capacity_alert_respects_cooldown() {
    let fleet = Fleet::new();
    let node_id = registered_at(&fleet, t0()).await;

    let node = fleet
        .registry
        .heartbeat_at(node_id, &busy(), t0())
        .await
        .unwrap();
    assert_eq!(node.status, NodeStatus::Degraded);
    assert_eq!(fleet.notifier.count("node_capacity"), 1);

    fleet
        .registry
        .heartbeat_at(node_id, &busy(), t0() + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(fleet.notifier.count("node_capacity"), 1);

    fleet
        .registry
        .heartbeat_at(node_id, &busy(), t0() + Duration::minutes(16))
        .await
        .unwrap();
    assert_eq!(fleet.notifier.count("node_capacity"), 2);
}

#[tokio::test]
async fn test_recovered_node_returns_online() {
    let fleet = Fleet::new();
    let node_id = registered_at(&fleet, t0()).await;

    fleet
        .registry
        .heartbeat_at(node_id, &busy(), t0())
        .await
        .unwrap();
    let node = fleet
        .registry
        .heartbeat_at(node_id, &idle(), t0() + Duration::seconds(30))
        .await
        .unwrap();
    assert_eq!(node.status, NodeStatus::Online);
}

#[tokio::test]
async fn test_liveness_threshold_boundary() {
    let fleet = Fleet::new();
    let node_id = registered_at(&fleet, t0()).await;
    fleet
        .registry
        .heartbeat_at(node_id, &idle(), t0())
        .await
        .unwrap();
    let _session = fleet.channel.attach(node_id);
    assert!(fleet.channel.is_online(node_id));

    let moved = fleet
        .registry
        .mark_offline_nodes_at(t0() + Duration::seconds(89))
        .await
        .unwrap();
    assert_eq!(moved, 0);
    assert!(fleet.channel.is_online(node_id));

    let moved = fleet
        .registry
        .mark_offline_nodes_at(t0() + Duration::seconds(90))
        .await
        .unwrap();
    assert_eq!(moved, 1);
    assert!(!fleet.channel.is_online(node_id));

    let node = fleet.store.get_node(node_id).await.unwrap().unwrap();
    assert_eq!(node.status, NodeStatus::Offline);
}

#[tokio::test]
async fn test_heartbeat_brings_offline_node_back() {
    let fleet = Fleet::new();
    let node_id = registered_at(&fleet, t0()).await;
    fleet
        .registry
        .heartbeat_at(node_id, &idle(), t0())
        .await
        .unwrap();
    fleet
        .registry
        .mark_offline_nodes_at(t0() + Duration::minutes(5))
        .await
        .unwrap();

    let node = fleet
        .registry
        .heartbeat_at(node_id, &idle(), t0() + Duration::minutes(6))
        .await
        .unwrap();
    assert_eq!(node.status, NodeStatus::Online);
}

#[tokio::test]
async fn test_drain_survives_heartbeats() {
    let fleet = Fleet::new();
    let node_id = fleet.registered_node("eu", (4.0, 8192), (0.5, 512)).await;

    fleet.registry.drain(node_id).await.unwrap();
    let node = fleet.registry.heartbeat(node_id, &idle()).await.unwrap();
    assert_eq!(node.status, NodeStatus::Draining);

    let reported = HeartbeatMetrics {
        status: Some(NodeStatus::Online),
        ..Default::default()
    };
    let node = fleet.registry.heartbeat(node_id, &reported).await.unwrap();
    assert_eq!(node.status, NodeStatus::Draining);

    fleet.registry.enable(node_id).await.unwrap();
    let node = fleet.registry.heartbeat(node_id, &idle()).await.unwrap();
    assert_eq!(node.status, NodeStatus::Online);
}

#[tokio::test]
async fn test_disable_drops_connection() {
    let fleet = Fleet::new();
    let (node_id, session) = fleet.online_node("eu", (4.0, 8192), (0.5, 512)).await;

    let node = fleet.registry.disable(node_id).await.unwrap();
    assert_eq!(node.status, NodeStatus::Disabled);
    assert!(!fleet.channel.is_online(node_id));
    assert!(session.next_task().await.is_none());
}

#[tokio::test]
async fn test_remove_node_with_bound_workloads_is_refused() {
    let fleet = Fleet::new();
    let node_id = fleet.registered_node("eu", (4.0, 8192), (0.5, 512)).await;
    fleet
        .running_app(OrgId::new(), dec!(0.01), Some(node_id), Utc::now())
        .await;

    let err = fleet.registry.remove_node(node_id).await.unwrap_err();
    assert!(matches!(err, RegistryError::NodeInUse { bound: 1, .. }));
    assert!(fleet.store.get_node(node_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_remove_idle_node() {
    let fleet = Fleet::new();
    let node_id = fleet.registered_node("eu", (4.0, 8192), (0.5, 512)).await;

    fleet.registry.remove_node(node_id).await.unwrap();
    assert!(fleet.store.get_node(node_id).await.unwrap().is_none());
    assert!(matches!(
        fleet.registry.remove_node(node_id).await,
        Err(RegistryError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_stopped_database_still_counts_as_bound() {
    let fleet = Fleet::new();
    let node_id = fleet.registered_node("eu", (4.0, 8192), (0.5, 512)).await;
    fleet
        .database(
            OrgId::new(),
            "eu",
            ResourceStatus::Stopped,
            Some(node_id),
            Utc::now(),
        )
        .await;

    assert!(matches!(
        fleet.registry.remove_node(node_id).await,
        Err(RegistryError::NodeInUse { .. })
    ));
}
