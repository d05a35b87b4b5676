//! Records persisted by the control plane.

use chrono::{DateTime, TimeDelta, Utc};
use fleet_events::{
    BuildStatus, BuildTrigger, NodeStatus, ResourceKind, ResourceStatus, TaskStatus, TaskType,
};
use fleet_id::{
    AppId, BackupPolicyId, BuildId, DatabaseId, LedgerEntryId, NodeId, OrgId, PlanId, RuntimeId,
    TaskId,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Nodes
// =============================================================================

/// A worker machine. Capacity fields stay `None` until the first heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerNode {
    pub id: NodeId,
    pub name: String,
    pub region: String,
    pub host_address: String,
    pub status: NodeStatus,

    pub cpu_total: Option<f64>,
    pub memory_total_mb: Option<i64>,
    pub disk_total_mb: Option<i64>,

    pub cpu_used: f64,
    pub memory_used_mb: i64,
    pub disk_used_mb: i64,
    pub container_count: i32,

    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_capacity_alert_at: Option<DateTime<Utc>>,

    /// SHA-256 of the outstanding registration token, cleared on redemption.
    #[serde(skip)]
    pub registration_token_hash: Option<String>,
    pub registration_expires_at: Option<DateTime<Utc>>,

    /// SHA-256 of the per-node secret minted on redemption.
    #[serde(skip)]
    pub secret_hash: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkerNode {
    /// A freshly issued node waiting for its token to be redeemed.
    pub fn pending(
        name: impl Into<String>,
        region: impl Into<String>,
        host_address: impl Into<String>,
        token_hash: String,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: NodeId::new(),
            name: name.into(),
            region: region.into(),
            host_address: host_address.into(),
            status: NodeStatus::Pending,
            cpu_total: None,
            memory_total_mb: None,
            disk_total_mb: None,
            cpu_used: 0.0,
            memory_used_mb: 0,
            disk_used_mb: 0,
            container_count: 0,
            last_heartbeat: None,
            last_capacity_alert_at: None,
            registration_token_hash: Some(token_hash),
            registration_expires_at: Some(expires_at),
            secret_hash: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// What one heartbeat writes to a node record.
///
/// `status` is not applied over an operator hold (`draining`, `disabled`)
/// that is in place when the write lands.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatUpdate {
    pub cpu_total: Option<f64>,
    pub memory_total_mb: Option<i64>,
    pub disk_total_mb: Option<i64>,
    pub cpu_used: f64,
    pub memory_used_mb: i64,
    pub disk_used_mb: i64,
    pub container_count: i32,
    pub status: NodeStatus,
    pub last_capacity_alert_at: Option<DateTime<Utc>>,
    pub at: DateTime<Utc>,
}

impl HeartbeatUpdate {
    /// Take the metrics, status and alert timestamp from a merged record.
    pub fn from_node(node: &WorkerNode, at: DateTime<Utc>) -> Self {
        Self {
            cpu_total: node.cpu_total,
            memory_total_mb: node.memory_total_mb,
            disk_total_mb: node.disk_total_mb,
            cpu_used: node.cpu_used,
            memory_used_mb: node.memory_used_mb,
            disk_used_mb: node.disk_used_mb,
            container_count: node.container_count,
            status: node.status,
            last_capacity_alert_at: node.last_capacity_alert_at,
            at,
        }
    }

    /// Write onto a stored record, keeping an operator hold.
    pub fn apply_to(&self, node: &mut WorkerNode) {
        node.cpu_total = self.cpu_total;
        node.memory_total_mb = self.memory_total_mb;
        node.disk_total_mb = self.disk_total_mb;
        node.cpu_used = self.cpu_used;
        node.memory_used_mb = self.memory_used_mb;
        node.disk_used_mb = self.disk_used_mb;
        node.container_count = self.container_count;
        if !node.status.is_operator_hold() {
            node.status = self.status;
        }
        node.last_capacity_alert_at = self.last_capacity_alert_at;
        node.last_heartbeat = Some(self.at);
        node.updated_at = self.at;
    }
}

/// CPU and memory a workload asks for.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceEnvelope {
    pub cpu: f64,
    pub memory_mb: i64,
}

impl ResourceEnvelope {
    /// Used for databases created without a plan.
    pub const DATABASE_DEFAULT: Self = Self {
        cpu: 0.5,
        memory_mb: 512,
    };
}

// =============================================================================
// Workloads
// =============================================================================

/// A plan fixes the envelope and the hourly rate of one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    pub cpu: f64,
    pub memory_mb: i64,
    pub hourly_rate: Decimal,
}

impl Plan {
    pub fn envelope(&self) -> ResourceEnvelope {
        ResourceEnvelope {
            cpu: self.cpu,
            memory_mb: self.memory_mb,
        }
    }
}

/// How an application is built and started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runtime {
    pub id: RuntimeId,
    pub name: String,
    pub image: String,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub port: Option<i32>,
}

/// A Git-hosted application source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GitSource {
    /// `owner/name` as the provider reports it in push payloads.
    pub repository: String,
    pub branch: String,
    pub sealed_oauth_token: Option<String>,
    pub sealed_webhook_secret: Option<String>,
    pub auto_deploy: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvVar {
    pub key: String,
    pub sealed_value: String,
}

/// A database whose connection settings are injected as `{prefix}_*`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseLink {
    pub database_id: DatabaseId,
    pub prefix: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub id: AppId,
    pub org_id: OrgId,
    pub name: String,
    pub plan_id: PlanId,
    pub runtime_id: RuntimeId,
    pub region: String,
    pub instances: i32,
    pub node_id: Option<NodeId>,
    pub status: ResourceStatus,
    pub git: Option<GitSource>,
    pub env_vars: Vec<EnvVar>,
    pub linked_databases: Vec<DatabaseLink>,
    pub domains: Vec<String>,
    /// End of the last wall-clock window already charged.
    pub billing_cursor: DateTime<Utc>,
    /// When the application last left a billable status, while it stays out.
    pub billing_paused_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseEngine {
    Postgres,
    Mysql,
    Redis,
    Mongodb,
}

impl DatabaseEngine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Mysql => "mysql",
            Self::Redis => "redis",
            Self::Mongodb => "mongodb",
        }
    }

    pub fn url_scheme(&self) -> &'static str {
        match self {
            Self::Postgres => "postgresql",
            Self::Mysql => "mysql",
            Self::Redis => "redis",
            Self::Mongodb => "mongodb",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "postgres" => Some(Self::Postgres),
            "mysql" => Some(Self::Mysql),
            "redis" => Some(Self::Redis),
            "mongodb" => Some(Self::Mongodb),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseResource {
    pub id: DatabaseId,
    pub org_id: OrgId,
    pub name: String,
    pub engine: DatabaseEngine,
    pub version: String,
    pub plan_id: Option<PlanId>,
    pub region: String,
    pub node_id: Option<NodeId>,
    pub status: ResourceStatus,
    pub port: i32,
    pub username: String,
    pub sealed_password: String,
    pub database_name: String,
    pub billing_cursor: DateTime<Utc>,
    pub billing_paused_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Reference to either kind of billable resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ResourceRef {
    Application(AppId),
    Database(DatabaseId),
}

impl ResourceRef {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Application(_) => ResourceKind::Application,
            Self::Database(_) => ResourceKind::Database,
        }
    }

    pub fn id_string(&self) -> String {
        match self {
            Self::Application(id) => id.to_string(),
            Self::Database(id) => id.to_string(),
        }
    }

    pub fn parse(kind: ResourceKind, id: &str) -> Option<Self> {
        match kind {
            ResourceKind::Application => id.parse().ok().map(Self::Application),
            ResourceKind::Database => id.parse().ok().map(Self::Database),
        }
    }
}

impl std::fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Application(id) => write!(f, "{id}"),
            Self::Database(id) => write!(f, "{id}"),
        }
    }
}

/// Where a resource stands on the billing clock.
///
/// `cursor` is the end of the last charged window. `paused_at` is set while
/// the resource sits in a non-billable status after having been billable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingClock {
    pub cursor: DateTime<Utc>,
    pub paused_at: Option<DateTime<Utc>>,
}

impl BillingClock {
    /// Clock after a status change.
    ///
    /// Leaving a billable status starts a pause. Re-entering one shifts the
    /// cursor forward by the length of the pause, so running time not yet
    /// charged carries over and paused time is never charged. A resource that
    /// was never billable starts its clock at `now`. The cursor never moves
    /// backward.
    pub fn after_status_change(
        self,
        from: ResourceStatus,
        to: ResourceStatus,
        now: DateTime<Utc>,
    ) -> Self {
        match (from.is_billable(), to.is_billable()) {
            (true, false) => Self {
                cursor: self.cursor,
                paused_at: Some(now),
            },
            (false, true) => {
                let cursor = match self.paused_at {
                    Some(paused_at) => self.cursor + (now - paused_at).max(TimeDelta::zero()),
                    None => self.cursor.max(now),
                };
                Self {
                    cursor,
                    paused_at: None,
                }
            }
            _ => self,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub app_id: AppId,
    pub node_id: NodeId,
    pub git_commit: Option<String>,
    pub trigger: BuildTrigger,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Billing
// =============================================================================

/// A resource as the metering loop sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct BillableResource {
    pub resource: ResourceRef,
    pub org_id: OrgId,
    pub plan_id: Option<PlanId>,
    /// Plan rate per instance-hour; `None` for databases without a plan.
    pub hourly_rate: Option<Decimal>,
    pub instances: i32,
    pub status: ResourceStatus,
    pub node_id: Option<NodeId>,
    pub billing_cursor: DateTime<Utc>,
}

/// A computed charge for one whole-hour window `[period_start, period_end)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Charge {
    pub resource: ResourceRef,
    pub org_id: OrgId,
    pub plan_id: Option<PlanId>,
    pub instances: i32,
    pub hourly_rate: Decimal,
    pub hours: i64,
    pub amount: Decimal,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

impl Charge {
    pub fn ledger_entry(
        &self,
        succeeded: bool,
        failure_reason: Option<String>,
        now: DateTime<Utc>,
    ) -> LedgerEntry {
        LedgerEntry {
            id: LedgerEntryId::new(),
            org_id: self.org_id,
            resource_kind: self.resource.kind(),
            resource_id: self.resource.id_string(),
            plan_id: self.plan_id,
            instances: self.instances,
            hourly_rate: self.hourly_rate,
            hours: self.hours,
            amount: self.amount,
            period_start: self.period_start,
            period_end: self.period_end,
            succeeded,
            failure_reason,
            created_at: now,
        }
    }
}

/// Append-only billing record. Failed attempts are recorded too.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub org_id: OrgId,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub plan_id: Option<PlanId>,
    pub instances: i32,
    pub hourly_rate: Decimal,
    pub hours: i64,
    pub amount: Decimal,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub succeeded: bool,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of settling a charge against the wallet.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    /// Funds moved, a successful ledger row was written, the cursor advanced.
    Charged {
        entry: LedgerEntry,
        balance_after: Decimal,
    },
    /// No funds moved, a failed ledger row was written, the cursor advanced.
    InsufficientFunds { entry: LedgerEntry, balance: Decimal },
    /// The cursor no longer matches the charge's period start: another pass
    /// already billed this window. Nothing was written.
    Stale,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpendingAlert {
    pub org_id: OrgId,
    pub threshold: Decimal,
    pub last_notified_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Backups
// =============================================================================

/// A backup schedule. `database_id = None` covers every database of the org.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupPolicy {
    pub id: BackupPolicyId,
    pub org_id: OrgId,
    pub database_id: Option<DatabaseId>,
    pub frequency_minutes: i32,
    pub retention_days: i32,
    pub next_run_at: DateTime<Utc>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A due policy paired with the database it applies to.
#[derive(Debug, Clone, PartialEq)]
pub struct DueBackup {
    pub policy: BackupPolicy,
    pub database: DatabaseResource,
}

// =============================================================================
// Tasks
// =============================================================================

/// Audit record of one dispatch decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub task_type: TaskType,
    pub resource_kind: ResourceKind,
    pub resource_id: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn clock(cursor: DateTime<Utc>, paused_at: Option<DateTime<Utc>>) -> BillingClock {
        BillingClock { cursor, paused_at }
    }

    #[test]
    fn test_leaving_billable_starts_a_pause() {
        let t0 = Utc::now();
        let next = clock(t0, None).after_status_change(
            ResourceStatus::Running,
            ResourceStatus::Stopped,
            t0 + Duration::minutes(55),
        );
        assert_eq!(next, clock(t0, Some(t0 + Duration::minutes(55))));
    }

    #[test]
    fn test_resume_shifts_cursor_by_pause_length() {
        let t0 = Utc::now();
        let next = clock(t0, Some(t0 + Duration::minutes(55))).after_status_change(
            ResourceStatus::Stopped,
            ResourceStatus::Running,
            t0 + Duration::minutes(70),
        );
        assert_eq!(next, clock(t0 + Duration::minutes(15), None));
    }

    #[test]
    fn test_short_stop_start_cycles_still_accrue() {
        let t0 = Utc::now();
        let mut c = clock(t0, None);
        for (stop, start) in [(55, 56), (111, 112)] {
            c = c.after_status_change(
                ResourceStatus::Running,
                ResourceStatus::Stopped,
                t0 + Duration::minutes(stop),
            );
            c = c.after_status_change(
                ResourceStatus::Stopped,
                ResourceStatus::Running,
                t0 + Duration::minutes(start),
            );
        }
        // Two minutes paused; the rest is running time still owed.
        assert_eq!(c, clock(t0 + Duration::minutes(2), None));
    }

    #[test]
    fn test_never_billable_starts_at_now() {
        let created = Utc::now() - Duration::minutes(10);
        let now = Utc::now();
        let next = clock(created, None).after_status_change(
            ResourceStatus::Building,
            ResourceStatus::Running,
            now,
        );
        assert_eq!(next, clock(now, None));
    }

    #[test]
    fn test_clock_untouched_between_billable_statuses() {
        let cursor = Utc::now() - Duration::hours(3);
        let c = clock(cursor, None);
        assert_eq!(
            c.after_status_change(ResourceStatus::Suspended, ResourceStatus::Running, Utc::now()),
            c
        );
    }

    #[test]
    fn test_cursor_never_moves_backward() {
        let now = Utc::now();
        let cursor = now + Duration::hours(1);
        let next = clock(cursor, None).after_status_change(
            ResourceStatus::Stopped,
            ResourceStatus::Running,
            now,
        );
        assert_eq!(next.cursor, cursor);
    }

    #[test]
    fn test_resource_ref_parse() {
        let id = AppId::new();
        let parsed = ResourceRef::parse(ResourceKind::Application, &id.to_string());
        assert_eq!(parsed, Some(ResourceRef::Application(id)));
        assert_eq!(ResourceRef::parse(ResourceKind::Database, &id.to_string()), None);
    }
}
