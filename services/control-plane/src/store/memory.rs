//! Process-local store.
//!
//! A single `RwLock` guards all tables, so every trait method is atomic with
//! respect to every other. That is the same guarantee the Postgres store
//! gets from its transactions and row locks.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_events::{BuildStatus, NodeStatus, ResourceStatus, TaskStatus};
use fleet_id::{
    AppId, BackupPolicyId, BuildId, DatabaseId, NodeId, OrgId, PlanId, RuntimeId, TaskId,
};
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use super::{
    Application, BackupPolicy, BackupStore, BillableResource, BillingClock, BillingStore, Build,
    Charge, DatabaseResource, DueBackup, HeartbeatUpdate, LedgerEntry, NodeStore, Plan,
    ResourceRef, Runtime, Settlement, SpendingAlert, StoreResult, TaskRecord, TaskStore,
    WorkerNode, WorkloadStore,
};

#[derive(Default)]
struct Tables {
    nodes: HashMap<NodeId, WorkerNode>,
    plans: HashMap<PlanId, Plan>,
    runtimes: HashMap<RuntimeId, Runtime>,
    applications: HashMap<AppId, Application>,
    databases: HashMap<DatabaseId, DatabaseResource>,
    builds: HashMap<BuildId, Build>,
    ledger: Vec<LedgerEntry>,
    wallets: HashMap<OrgId, Decimal>,
    spending_alerts: HashMap<OrgId, SpendingAlert>,
    policies: HashMap<BackupPolicyId, BackupPolicy>,
    tasks: Vec<TaskRecord>,
}

impl Tables {
    fn cursor_of(&self, resource: &ResourceRef) -> Option<DateTime<Utc>> {
        match resource {
            ResourceRef::Application(id) => self.applications.get(id).map(|a| a.billing_cursor),
            ResourceRef::Database(id) => self.databases.get(id).map(|d| d.billing_cursor),
        }
    }

    fn set_cursor(&mut self, resource: &ResourceRef, cursor: DateTime<Utc>, now: DateTime<Utc>) {
        match resource {
            ResourceRef::Application(id) => {
                if let Some(app) = self.applications.get_mut(id) {
                    app.billing_cursor = cursor;
                    app.updated_at = now;
                }
            }
            ResourceRef::Database(id) => {
                if let Some(db) = self.databases.get_mut(id) {
                    db.billing_cursor = cursor;
                    db.updated_at = now;
                }
            }
        }
    }

    fn status_fields(&mut self, resource: &ResourceRef) -> Option<StatusFields<'_>> {
        match resource {
            ResourceRef::Application(id) => self.applications.get_mut(id).map(|a| StatusFields {
                status: &mut a.status,
                node_id: &mut a.node_id,
                cursor: &mut a.billing_cursor,
                paused_at: &mut a.billing_paused_at,
                updated_at: &mut a.updated_at,
            }),
            ResourceRef::Database(id) => self.databases.get_mut(id).map(|d| StatusFields {
                status: &mut d.status,
                node_id: &mut d.node_id,
                cursor: &mut d.billing_cursor,
                paused_at: &mut d.billing_paused_at,
                updated_at: &mut d.updated_at,
            }),
        }
    }

    /// Status write shared by `set_status`, its guarded form, and `bind_node`.
    fn change_status(
        &mut self,
        resource: &ResourceRef,
        status: ResourceStatus,
        binding: Option<Option<NodeId>>,
        unless_suspended: bool,
        now: DateTime<Utc>,
    ) -> bool {
        let Some(fields) = self.status_fields(resource) else {
            return false;
        };
        if unless_suspended && *fields.status == ResourceStatus::Suspended {
            return false;
        }

        let clock = BillingClock {
            cursor: *fields.cursor,
            paused_at: *fields.paused_at,
        }
        .after_status_change(*fields.status, status, now);
        *fields.cursor = clock.cursor;
        *fields.paused_at = clock.paused_at;
        *fields.status = status;
        if let Some(node_id) = binding {
            *fields.node_id = node_id;
        }
        *fields.updated_at = now;
        true
    }

    fn billable(&self, org_filter: Option<OrgId>) -> Vec<BillableResource> {
        let apps = self
            .applications
            .values()
            .filter(|a| a.status.is_billable())
            .filter(|a| org_filter.is_none_or(|org| a.org_id == org))
            .map(|a| BillableResource {
                resource: ResourceRef::Application(a.id),
                org_id: a.org_id,
                plan_id: Some(a.plan_id),
                hourly_rate: self.plans.get(&a.plan_id).map(|p| p.hourly_rate),
                instances: a.instances,
                status: a.status,
                node_id: a.node_id,
                billing_cursor: a.billing_cursor,
            });

        let dbs = self
            .databases
            .values()
            .filter(|d| d.status.is_billable())
            .filter(|d| org_filter.is_none_or(|org| d.org_id == org))
            .map(|d| BillableResource {
                resource: ResourceRef::Database(d.id),
                org_id: d.org_id,
                plan_id: d.plan_id,
                hourly_rate: d
                    .plan_id
                    .and_then(|id| self.plans.get(&id))
                    .map(|p| p.hourly_rate),
                instances: 1,
                status: d.status,
                node_id: d.node_id,
                billing_cursor: d.billing_cursor,
            });

        let mut out: Vec<_> = apps.chain(dbs).collect();
        out.sort_by_key(|r| r.billing_cursor);
        out
    }
}

/// Mutable status columns shared by applications and databases.
struct StatusFields<'a> {
    status: &'a mut ResourceStatus,
    node_id: &'a mut Option<NodeId>,
    cursor: &'a mut DateTime<Utc>,
    paused_at: &'a mut Option<DateTime<Utc>>,
    updated_at: &'a mut DateTime<Utc>,
}

/// In-memory [`Store`](super::Store) implementation.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn insert_node(&self, node: &WorkerNode) -> StoreResult<()> {
        self.tables.write().await.nodes.insert(node.id, node.clone());
        Ok(())
    }

    async fn get_node(&self, id: NodeId) -> StoreResult<Option<WorkerNode>> {
        Ok(self.tables.read().await.nodes.get(&id).cloned())
    }

    async fn redeem_registration(
        &self,
        token_hash: &str,
        secret_hash: &str,
        host_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WorkerNode>> {
        let mut tables = self.tables.write().await;
        let Some(node) = tables.nodes.values_mut().find(|n| {
            n.registration_token_hash.as_deref() == Some(token_hash)
                && n.registration_expires_at.is_some_and(|exp| exp > now)
        }) else {
            return Ok(None);
        };

        node.secret_hash = Some(secret_hash.to_string());
        node.registration_token_hash = None;
        node.registration_expires_at = None;
        node.status = NodeStatus::Offline;
        if let Some(host) = host_address {
            node.host_address = host.to_string();
        }
        node.updated_at = now;
        Ok(Some(node.clone()))
    }

    async fn record_heartbeat(
        &self,
        id: NodeId,
        update: &HeartbeatUpdate,
    ) -> StoreResult<Option<WorkerNode>> {
        let mut tables = self.tables.write().await;
        match tables.nodes.get_mut(&id) {
            Some(node) if node.status != NodeStatus::Pending => {
                update.apply_to(node);
                Ok(Some(node.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn set_node_status(
        &self,
        id: NodeId,
        status: NodeStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WorkerNode>> {
        let mut tables = self.tables.write().await;
        match tables.nodes.get_mut(&id) {
            Some(node) if node.status != NodeStatus::Pending => {
                node.status = status;
                node.updated_at = now;
                Ok(Some(node.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_nodes_in_region(&self, region: &str) -> StoreResult<Vec<WorkerNode>> {
        Ok(self
            .tables
            .read()
            .await
            .nodes
            .values()
            .filter(|n| n.region == region)
            .cloned()
            .collect())
    }

    async fn mark_offline_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<NodeId>> {
        let mut tables = self.tables.write().await;
        let mut moved = Vec::new();
        for node in tables.nodes.values_mut() {
            let stale = node.last_heartbeat.is_none_or(|hb| hb <= cutoff);
            if node.status.is_live() && stale {
                node.status = NodeStatus::Offline;
                node.updated_at = now;
                moved.push(node.id);
            }
        }
        Ok(moved)
    }

    async fn count_bound_workloads(&self, id: NodeId) -> StoreResult<i64> {
        let tables = self.tables.read().await;
        let apps = tables
            .applications
            .values()
            .filter(|a| a.node_id == Some(id))
            .count();
        let dbs = tables
            .databases
            .values()
            .filter(|d| d.node_id == Some(id))
            .count();
        Ok((apps + dbs) as i64)
    }

    async fn delete_node(&self, id: NodeId) -> StoreResult<bool> {
        Ok(self.tables.write().await.nodes.remove(&id).is_some())
    }
}

#[async_trait]
impl WorkloadStore for MemoryStore {
    async fn insert_plan(&self, plan: &Plan) -> StoreResult<()> {
        self.tables.write().await.plans.insert(plan.id, plan.clone());
        Ok(())
    }

    async fn get_plan(&self, id: PlanId) -> StoreResult<Option<Plan>> {
        Ok(self.tables.read().await.plans.get(&id).cloned())
    }

    async fn insert_runtime(&self, runtime: &Runtime) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .runtimes
            .insert(runtime.id, runtime.clone());
        Ok(())
    }

    async fn get_runtime(&self, id: RuntimeId) -> StoreResult<Option<Runtime>> {
        Ok(self.tables.read().await.runtimes.get(&id).cloned())
    }

    async fn insert_application(&self, app: &Application) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .applications
            .insert(app.id, app.clone());
        Ok(())
    }

    async fn get_application(&self, id: AppId) -> StoreResult<Option<Application>> {
        Ok(self.tables.read().await.applications.get(&id).cloned())
    }

    async fn insert_database(&self, db: &DatabaseResource) -> StoreResult<()> {
        self.tables.write().await.databases.insert(db.id, db.clone());
        Ok(())
    }

    async fn get_database(&self, id: DatabaseId) -> StoreResult<Option<DatabaseResource>> {
        Ok(self.tables.read().await.databases.get(&id).cloned())
    }

    async fn set_status(
        &self,
        resource: &ResourceRef,
        status: ResourceStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables.change_status(resource, status, None, false, now))
    }

    async fn set_status_unless_suspended(
        &self,
        resource: &ResourceRef,
        status: ResourceStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables.change_status(resource, status, None, true, now))
    }

    async fn bind_node(
        &self,
        resource: &ResourceRef,
        node_id: Option<NodeId>,
        status: ResourceStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables.change_status(resource, status, Some(node_id), false, now))
    }

    async fn set_instances(&self, id: AppId, instances: i32) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.applications.get_mut(&id) {
            Some(app) => {
                app.instances = instances;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn insert_build(&self, build: &Build) -> StoreResult<()> {
        self.tables
            .write()
            .await
            .builds
            .insert(build.id, build.clone());
        Ok(())
    }

    async fn get_build(&self, id: BuildId) -> StoreResult<Option<Build>> {
        Ok(self.tables.read().await.builds.get(&id).cloned())
    }

    async fn set_build_status(&self, id: BuildId, status: BuildStatus) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.builds.get_mut(&id) {
            Some(build) => {
                build.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_org_databases(&self, org_id: OrgId) -> StoreResult<Vec<DatabaseResource>> {
        Ok(self
            .tables
            .read()
            .await
            .databases
            .values()
            .filter(|d| d.org_id == org_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn list_billable(&self) -> StoreResult<Vec<BillableResource>> {
        Ok(self.tables.read().await.billable(None))
    }

    async fn list_org_billable(&self, org_id: OrgId) -> StoreResult<Vec<BillableResource>> {
        Ok(self.tables.read().await.billable(Some(org_id)))
    }

    async fn settle_charge(
        &self,
        charge: &Charge,
        now: DateTime<Utc>,
    ) -> StoreResult<Settlement> {
        let mut tables = self.tables.write().await;

        if tables.cursor_of(&charge.resource) != Some(charge.period_start) {
            return Ok(Settlement::Stale);
        }

        let balance = tables
            .wallets
            .get(&charge.org_id)
            .copied()
            .unwrap_or(Decimal::ZERO);

        let settlement = if balance >= charge.amount {
            let balance_after = balance - charge.amount;
            tables.wallets.insert(charge.org_id, balance_after);
            Settlement::Charged {
                entry: charge.ledger_entry(true, None, now),
                balance_after,
            }
        } else {
            Settlement::InsufficientFunds {
                entry: charge.ledger_entry(
                    false,
                    Some(crate::billing::INSUFFICIENT_FUNDS.to_string()),
                    now,
                ),
                balance,
            }
        };

        if let Settlement::Charged { entry, .. } | Settlement::InsufficientFunds { entry, .. } =
            &settlement
        {
            tables.ledger.push(entry.clone());
        }
        tables.set_cursor(&charge.resource, charge.period_end, now);

        Ok(settlement)
    }

    async fn record_failed_charge(
        &self,
        charge: &Charge,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LedgerEntry>> {
        let mut tables = self.tables.write().await;

        if tables.cursor_of(&charge.resource) != Some(charge.period_start) {
            return Ok(None);
        }

        let entry = charge.ledger_entry(false, Some(reason.to_string()), now);
        tables.ledger.push(entry.clone());
        tables.set_cursor(&charge.resource, charge.period_end, now);
        Ok(Some(entry))
    }

    async fn ledger_for(&self, resource: &ResourceRef) -> StoreResult<Vec<LedgerEntry>> {
        let kind = resource.kind();
        let id = resource.id_string();
        Ok(self
            .tables
            .read()
            .await
            .ledger
            .iter()
            .filter(|e| e.resource_kind == kind && e.resource_id == id)
            .cloned()
            .collect())
    }

    async fn wallet_balance(&self, org_id: OrgId) -> StoreResult<Decimal> {
        Ok(self
            .tables
            .read()
            .await
            .wallets
            .get(&org_id)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn credit_wallet(&self, org_id: OrgId, amount: Decimal) -> StoreResult<Decimal> {
        let mut tables = self.tables.write().await;
        let balance = tables.wallets.entry(org_id).or_insert(Decimal::ZERO);
        *balance += amount;
        Ok(*balance)
    }

    async fn spending_alert(&self, org_id: OrgId) -> StoreResult<Option<SpendingAlert>> {
        Ok(self
            .tables
            .read()
            .await
            .spending_alerts
            .get(&org_id)
            .cloned())
    }

    async fn set_spending_threshold(&self, org_id: OrgId, threshold: Decimal) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .spending_alerts
            .entry(org_id)
            .and_modify(|a| a.threshold = threshold)
            .or_insert(SpendingAlert {
                org_id,
                threshold,
                last_notified_at: None,
            });
        Ok(())
    }

    async fn mark_spending_alert_notified(
        &self,
        org_id: OrgId,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Some(alert) = self.tables.write().await.spending_alerts.get_mut(&org_id) {
            alert.last_notified_at = Some(at);
        }
        Ok(())
    }
}

#[async_trait]
impl BackupStore for MemoryStore {
    async fn upsert_policy(&self, policy: &BackupPolicy) -> StoreResult<BackupPolicy> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .policies
            .values()
            .find(|p| p.org_id == policy.org_id && p.database_id == policy.database_id)
            .map(|p| (p.id, p.created_at));

        let mut stored = policy.clone();
        if let Some((id, created_at)) = existing {
            stored.id = id;
            stored.created_at = created_at;
        }
        tables.policies.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_policy(&self, id: BackupPolicyId) -> StoreResult<Option<BackupPolicy>> {
        Ok(self.tables.read().await.policies.get(&id).cloned())
    }

    async fn due_backups(&self, now: DateTime<Utc>) -> StoreResult<Vec<DueBackup>> {
        let tables = self.tables.read().await;
        let mut due = Vec::new();
        for policy in tables
            .policies
            .values()
            .filter(|p| p.active && p.next_run_at <= now)
        {
            for db in tables.databases.values().filter(|d| {
                d.org_id == policy.org_id
                    && policy.database_id.is_none_or(|id| id == d.id)
                    && d.status == ResourceStatus::Running
                    && d.node_id.is_some()
            }) {
                due.push(DueBackup {
                    policy: policy.clone(),
                    database: db.clone(),
                });
            }
        }
        due.sort_by_key(|d| (d.policy.next_run_at, d.policy.id, d.database.id));
        Ok(due)
    }

    async fn due_policies(&self, now: DateTime<Utc>) -> StoreResult<Vec<BackupPolicy>> {
        let mut due: Vec<_> = self
            .tables
            .read()
            .await
            .policies
            .values()
            .filter(|p| p.active && p.next_run_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|p| (p.next_run_at, p.id));
        Ok(due)
    }

    async fn advance_policy(
        &self,
        id: BackupPolicyId,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.policies.get_mut(&id) {
            Some(policy) => {
                policy.next_run_at = next_run_at;
                policy.updated_at = now;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn record_task(&self, task: &TaskRecord) -> StoreResult<()> {
        self.tables.write().await.tasks.push(task.clone());
        Ok(())
    }

    async fn cancel_tasks(&self, task_ids: &[TaskId]) -> StoreResult<u64> {
        let mut cancelled = 0;
        for task in self.tables.write().await.tasks.iter_mut() {
            if task.status == TaskStatus::Queued && task_ids.contains(&task.task_id) {
                task.status = TaskStatus::Cancelled;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn tasks_for(&self, resource: &ResourceRef) -> StoreResult<Vec<TaskRecord>> {
        let kind = resource.kind();
        let id = resource.id_string();
        Ok(self
            .tables
            .read()
            .await
            .tasks
            .iter()
            .filter(|t| t.resource_kind == kind && t.resource_id == id)
            .cloned()
            .collect())
    }
}
