//! Persistence seams for the control plane.
//!
//! The engine never talks to a database directly. It consumes the traits in
//! this module, which describe a transactional row store with row-level
//! locking:
//!
//! - [`NodeStore`]: worker node records and liveness sweeps
//! - [`WorkloadStore`]: plans, runtimes, applications, databases, builds
//! - [`BillingStore`]: billable views, wallet settlement, the ledger
//! - [`BackupStore`]: backup policies and their due pairings
//! - [`TaskStore`]: the dispatch audit log
//!
//! Two implementations ship: [`PgStore`] (Postgres via SQLx) and
//! [`MemoryStore`] (process-local, used by tests and dev mode).

mod memory;
pub mod models;
mod postgres;

pub use memory::MemoryStore;
pub use models::*;
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_events::{BuildStatus, NodeStatus, ResourceStatus};
use fleet_id::{
    AppId, BackupPolicyId, BuildId, DatabaseId, NodeId, OrgId, PlanId, RuntimeId, TaskId,
};
use rust_decimal::Decimal;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A persisted value could not be decoded into its domain type.
    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<fleet_events::EventError> for StoreError {
    fn from(err: fleet_events::EventError) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

impl From<fleet_id::IdError> for StoreError {
    fn from(err: fleet_id::IdError) -> Self {
        StoreError::Corrupt(err.to_string())
    }
}

#[async_trait]
pub trait NodeStore: Send + Sync {
    async fn insert_node(&self, node: &WorkerNode) -> StoreResult<()>;

    async fn get_node(&self, id: NodeId) -> StoreResult<Option<WorkerNode>>;

    /// Consume an unexpired registration token in one conditional write: clear
    /// the token, store the secret hash, move the node to `offline`, and
    /// replace the host address when one is given. Returns `None` when no
    /// node holds the token or it expired at or before `now`, so at most one
    /// caller ever redeems a token.
    async fn redeem_registration(
        &self,
        token_hash: &str,
        secret_hash: &str,
        host_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WorkerNode>>;

    /// Write a heartbeat onto a registered node (see [`HeartbeatUpdate`]).
    /// An operator hold in place at write time is kept. Returns the stored
    /// node, or `None` if it does not exist or is still `pending`.
    async fn record_heartbeat(
        &self,
        id: NodeId,
        update: &HeartbeatUpdate,
    ) -> StoreResult<Option<WorkerNode>>;

    /// Set the status of a registered node without touching its metrics.
    /// Returns `None` if the node does not exist or is still `pending`.
    async fn set_node_status(
        &self,
        id: NodeId,
        status: NodeStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WorkerNode>>;

    /// Nodes in a region, in no particular order.
    async fn list_nodes_in_region(&self, region: &str) -> StoreResult<Vec<WorkerNode>>;

    /// Atomically move every `online`/`degraded` node whose last heartbeat is
    /// at or before `cutoff` to `offline`. Returns the nodes moved.
    async fn mark_offline_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<NodeId>>;

    /// Number of applications and databases bound to the node.
    async fn count_bound_workloads(&self, id: NodeId) -> StoreResult<i64>;

    async fn delete_node(&self, id: NodeId) -> StoreResult<bool>;
}

#[async_trait]
pub trait WorkloadStore: Send + Sync {
    async fn insert_plan(&self, plan: &Plan) -> StoreResult<()>;

    async fn get_plan(&self, id: PlanId) -> StoreResult<Option<Plan>>;

    async fn insert_runtime(&self, runtime: &Runtime) -> StoreResult<()>;

    async fn get_runtime(&self, id: RuntimeId) -> StoreResult<Option<Runtime>>;

    async fn insert_application(&self, app: &Application) -> StoreResult<()>;

    async fn get_application(&self, id: AppId) -> StoreResult<Option<Application>>;

    async fn insert_database(&self, db: &DatabaseResource) -> StoreResult<()>;

    async fn get_database(&self, id: DatabaseId) -> StoreResult<Option<DatabaseResource>>;

    /// Set a resource's status and move its billing clock accordingly
    /// (see [`BillingClock::after_status_change`]). Returns false if not
    /// found.
    async fn set_status(
        &self,
        resource: &ResourceRef,
        status: ResourceStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// [`set_status`](Self::set_status), unless the resource is `suspended`
    /// when the write lands. Returns false if not found or suspended.
    async fn set_status_unless_suspended(
        &self,
        resource: &ResourceRef,
        status: ResourceStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    /// Bind (or unbind) a resource to a node and set its status in one write.
    async fn bind_node(
        &self,
        resource: &ResourceRef,
        node_id: Option<NodeId>,
        status: ResourceStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;

    async fn set_instances(&self, id: AppId, instances: i32) -> StoreResult<bool>;

    async fn insert_build(&self, build: &Build) -> StoreResult<()>;

    async fn get_build(&self, id: BuildId) -> StoreResult<Option<Build>>;

    async fn set_build_status(&self, id: BuildId, status: BuildStatus) -> StoreResult<bool>;

    async fn list_org_databases(&self, org_id: OrgId) -> StoreResult<Vec<DatabaseResource>>;
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    /// Every application and database whose status is billable.
    async fn list_billable(&self) -> StoreResult<Vec<BillableResource>>;

    /// Billable resources of one organization.
    async fn list_org_billable(&self, org_id: OrgId) -> StoreResult<Vec<BillableResource>>;

    /// Settle a charge in a single transaction:
    ///
    /// 1. lock the organization's wallet row
    /// 2. lock the resource row and check its cursor equals
    ///    `charge.period_start` (otherwise return [`Settlement::Stale`])
    /// 3. if the balance covers `charge.amount`, debit it and write a
    ///    successful ledger row; otherwise write a failed ledger row
    /// 4. advance the cursor to `charge.period_end`
    ///
    /// An organization without a wallet has a balance of zero.
    async fn settle_charge(&self, charge: &Charge, now: DateTime<Utc>)
        -> StoreResult<Settlement>;

    /// Write a failed ledger row and advance the cursor without touching the
    /// wallet. Used when settlement itself errored. Returns `None` if the
    /// cursor had already moved past `charge.period_start`.
    async fn record_failed_charge(
        &self,
        charge: &Charge,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LedgerEntry>>;

    /// Ledger rows for a resource, oldest first.
    async fn ledger_for(&self, resource: &ResourceRef) -> StoreResult<Vec<LedgerEntry>>;

    async fn wallet_balance(&self, org_id: OrgId) -> StoreResult<Decimal>;

    /// Add funds to a wallet, creating it if needed. Returns the new balance.
    async fn credit_wallet(&self, org_id: OrgId, amount: Decimal) -> StoreResult<Decimal>;

    async fn spending_alert(&self, org_id: OrgId) -> StoreResult<Option<SpendingAlert>>;

    async fn set_spending_threshold(&self, org_id: OrgId, threshold: Decimal) -> StoreResult<()>;

    async fn mark_spending_alert_notified(
        &self,
        org_id: OrgId,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait BackupStore: Send + Sync {
    /// Create or replace the policy for `(org_id, database_id)`. The stored
    /// policy keeps the id of any policy it replaces.
    async fn upsert_policy(&self, policy: &BackupPolicy) -> StoreResult<BackupPolicy>;

    async fn get_policy(&self, id: BackupPolicyId) -> StoreResult<Option<BackupPolicy>>;

    /// Active policies with `next_run_at <= now`, each paired with every
    /// running, node-bound database it covers.
    async fn due_backups(&self, now: DateTime<Utc>) -> StoreResult<Vec<DueBackup>>;

    /// Active policies with `next_run_at <= now`, whether or not any database
    /// currently qualifies.
    async fn due_policies(&self, now: DateTime<Utc>) -> StoreResult<Vec<BackupPolicy>>;

    async fn advance_policy(
        &self,
        id: BackupPolicyId,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool>;
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn record_task(&self, task: &TaskRecord) -> StoreResult<()>;

    /// Mark the given tasks cancelled if they are still queued.
    async fn cancel_tasks(&self, task_ids: &[TaskId]) -> StoreResult<u64>;

    async fn tasks_for(&self, resource: &ResourceRef) -> StoreResult<Vec<TaskRecord>>;
}

/// Everything the engine needs from storage.
pub trait Store: NodeStore + WorkloadStore + BillingStore + BackupStore + TaskStore {}

impl<T> Store for T where T: NodeStore + WorkloadStore + BillingStore + BackupStore + TaskStore {}
