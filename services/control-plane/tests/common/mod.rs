//! Shared fixture: the whole engine wired over the in-memory store.

#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use fleet_control_plane::{
    backup::{BackupConfig, BackupScheduler},
    billing::{BillingConfig, BillingEngine},
    crypto::{aad, SecretBox},
    dispatch::{DispatchChannel, NodeSession},
    nodes::{HeartbeatMetrics, NodeRegistry, RegistryConfig},
    notify::MemoryNotifier,
    scheduler::FleetScheduler,
    state::AppState,
    store::{
        Application, DatabaseEngine, DatabaseResource, GitSource, MemoryStore, Plan, Runtime,
        Store, WorkloadStore,
    },
    webhook::WebhookIngest,
};
use fleet_events::ResourceStatus;
use fleet_id::{AppId, DatabaseId, NodeId, OrgId, PlanId, RuntimeId};
use rust_decimal::Decimal;

pub struct Fleet {
    pub store: Arc<MemoryStore>,
    pub channel: Arc<DispatchChannel>,
    pub notifier: Arc<MemoryNotifier>,
    pub registry: Arc<NodeRegistry>,
    pub scheduler: Arc<FleetScheduler>,
    pub billing: BillingEngine,
    pub backups: BackupScheduler,
    pub webhooks: Arc<WebhookIngest>,
    pub secrets: SecretBox,
}

impl Fleet {
    pub fn new() -> Self {
        Self::with_billing(BillingConfig::default())
    }

    pub fn with_billing(billing: BillingConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let dyn_store: Arc<dyn Store> = store.clone();
        let channel = Arc::new(DispatchChannel::new(dyn_store.clone()));
        let notifier = Arc::new(MemoryNotifier::new());
        let secrets = SecretBox::ephemeral();

        let registry = Arc::new(NodeRegistry::new(
            dyn_store.clone(),
            channel.clone(),
            notifier.clone(),
            RegistryConfig::default(),
        ));
        let scheduler = Arc::new(FleetScheduler::new(
            dyn_store.clone(),
            registry.clone(),
            channel.clone(),
            secrets.clone(),
        ));
        let billing = BillingEngine::new(
            dyn_store.clone(),
            channel.clone(),
            notifier.clone(),
            billing,
        );
        let backups = BackupScheduler::new(
            dyn_store.clone(),
            channel.clone(),
            BackupConfig::default(),
        );
        let webhooks = Arc::new(WebhookIngest::new(
            dyn_store,
            scheduler.clone(),
            secrets.clone(),
        ));

        Self {
            store,
            channel,
            notifier,
            registry,
            scheduler,
            billing,
            backups,
            webhooks,
            secrets,
        }
    }

    /// HTTP state over the same components.
    pub fn state(&self) -> AppState {
        AppState::new(
            None,
            self.registry.clone(),
            self.channel.clone(),
            self.scheduler.clone(),
            self.webhooks.clone(),
        )
    }

    /// Register a node and report capacity, without a dispatch connection.
    pub async fn registered_node(
        &self,
        region: &str,
        total: (f64, i64),
        used: (f64, i64),
    ) -> NodeId {
        let issued = self
            .registry
            .issue_registration_token("worker", region, "10.0.0.10")
            .await
            .unwrap();
        let registration = self.registry.redeem_token(&issued.token, None).await.unwrap();
        let node_id = registration.node.id;

        self.registry
            .heartbeat(
                node_id,
                &HeartbeatMetrics {
                    cpu_total: Some(total.0),
                    memory_total_mb: Some(total.1),
                    disk_total_mb: Some(100_000),
                    cpu_used: Some(used.0),
                    memory_used_mb: Some(used.1),
                    disk_used_mb: Some(0),
                    container_count: Some(0),
                    status: None,
                },
            )
            .await
            .unwrap();
        node_id
    }

    /// Register a node and open its dispatch connection.
    pub async fn online_node(
        &self,
        region: &str,
        total: (f64, i64),
        used: (f64, i64),
    ) -> (NodeId, NodeSession) {
        let node_id = self.registered_node(region, total, used).await;
        (node_id, self.channel.attach(node_id))
    }

    pub async fn plan(&self, cpu: f64, memory_mb: i64, hourly_rate: Decimal) -> Plan {
        let plan = Plan {
            id: PlanId::new(),
            name: "standard".into(),
            cpu,
            memory_mb,
            hourly_rate,
        };
        self.store.insert_plan(&plan).await.unwrap();
        plan
    }

    pub async fn runtime(&self) -> Runtime {
        let runtime = Runtime {
            id: RuntimeId::new(),
            name: "node20".into(),
            image: "node:20-alpine".into(),
            build_command: Some("npm ci && npm run build".into()),
            start_command: Some("npm start".into()),
            port: Some(3000),
        };
        self.store.insert_runtime(&runtime).await.unwrap();
        runtime
    }

    /// An application record with the given status and cursor.
    pub fn app(
        &self,
        org_id: OrgId,
        plan: &Plan,
        runtime: &Runtime,
        region: &str,
        status: ResourceStatus,
        cursor: DateTime<Utc>,
    ) -> Application {
        Application {
            id: AppId::new(),
            org_id,
            name: "web".into(),
            plan_id: plan.id,
            runtime_id: runtime.id,
            region: region.into(),
            instances: 1,
            node_id: None,
            status,
            git: None,
            env_vars: Vec::new(),
            linked_databases: Vec::new(),
            domains: vec!["web.example.com".into()],
            billing_cursor: cursor,
            billing_paused_at: None,
            created_at: cursor,
            updated_at: cursor,
        }
    }

    pub async fn insert_app(&self, app: &Application) {
        self.store.insert_application(app).await.unwrap();
    }

    /// A running application bound to `node_id`, billed from `cursor`.
    pub async fn running_app(
        &self,
        org_id: OrgId,
        rate: Decimal,
        node_id: Option<NodeId>,
        cursor: DateTime<Utc>,
    ) -> Application {
        let plan = self.plan(1.0, 512, rate).await;
        let runtime = self.runtime().await;
        let mut app = self.app(org_id, &plan, &runtime, "eu", ResourceStatus::Running, cursor);
        app.node_id = node_id;
        self.insert_app(&app).await;
        app
    }

    /// A database with a sealed password.
    pub async fn database(
        &self,
        org_id: OrgId,
        region: &str,
        status: ResourceStatus,
        node_id: Option<NodeId>,
        cursor: DateTime<Utc>,
    ) -> DatabaseResource {
        let id = DatabaseId::new();
        let db = DatabaseResource {
            id,
            org_id,
            name: "main".into(),
            engine: DatabaseEngine::Postgres,
            version: "16".into(),
            plan_id: None,
            region: region.into(),
            node_id,
            status,
            port: 5432,
            username: "app".into(),
            sealed_password: self
                .secrets
                .seal("db-pass", &aad::database_password(id))
                .unwrap(),
            database_name: "main".into(),
            billing_cursor: cursor,
            billing_paused_at: None,
            created_at: cursor,
            updated_at: cursor,
        };
        self.store.insert_database(&db).await.unwrap();
        db
    }

    /// A Git source with a sealed webhook secret.
    pub fn git_source(&self, app_id: AppId, secret: &str, auto_deploy: bool) -> GitSource {
        GitSource {
            repository: "acme/web".into(),
            branch: "main".into(),
            sealed_oauth_token: None,
            sealed_webhook_secret: Some(
                self.secrets
                    .seal(secret, &aad::webhook_secret(app_id))
                    .unwrap(),
            ),
            auto_deploy,
        }
    }
}
