//! Postgres-backed store.
//!
//! Queries are built at runtime (no compile-time checking), and rows are
//! decoded by hand with `try_get`. Settlement holds `FOR UPDATE` locks on the
//! wallet row and the resource row for the length of one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_events::{BuildStatus, NodeStatus, ResourceStatus};
use fleet_id::{
    AppId, BackupPolicyId, BuildId, DatabaseId, NodeId, OrgId, PlanId, RuntimeId, TaskId,
};
use rust_decimal::Decimal;
use sqlx::{
    postgres::{PgPool, PgRow},
    types::Json,
    Postgres, Row, Transaction,
};

use super::{
    Application, BackupPolicy, BackupStore, BillableResource, BillingClock, BillingStore, Build,
    Charge, DatabaseEngine, DatabaseLink, DatabaseResource, DueBackup, EnvVar, GitSource,
    HeartbeatUpdate, LedgerEntry, NodeStore, Plan, ResourceRef, Runtime, Settlement,
    SpendingAlert, StoreError, StoreResult, TaskRecord, TaskStore, WorkerNode, WorkloadStore,
};

/// [`Store`](super::Store) implementation over a Postgres pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Status write shared by `set_status`, its guarded form, and
    /// `bind_node`. The row is locked while the billing clock is moved.
    async fn change_status(
        &self,
        resource: &ResourceRef,
        status: ResourceStatus,
        binding: Option<Option<NodeId>>,
        unless_suspended: bool,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let (table, id_col) = table_for(resource);
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!(
            "SELECT status, node_id, billing_cursor, billing_paused_at FROM {table} \
             WHERE {id_col} = $1 FOR UPDATE"
        ))
        .bind(resource.id_string())
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(false);
        };
        let from: ResourceStatus = parse_col(&row, "status")?;
        if unless_suspended && from == ResourceStatus::Suspended {
            return Ok(false);
        }
        let clock = BillingClock {
            cursor: row.try_get("billing_cursor")?,
            paused_at: row.try_get("billing_paused_at")?,
        }
        .after_status_change(from, status, now);
        let node_id = match binding {
            Some(node_id) => node_id,
            None => parse_opt_col(&row, "node_id")?,
        };

        sqlx::query(&format!(
            "UPDATE {table} SET status = $2, node_id = $3, billing_cursor = $4, \
             billing_paused_at = $5, updated_at = $6 WHERE {id_col} = $1"
        ))
        .bind(resource.id_string())
        .bind(status.as_str())
        .bind(node_id.map(|id| id.to_string()))
        .bind(clock.cursor)
        .bind(clock.paused_at)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}

fn table_for(resource: &ResourceRef) -> (&'static str, &'static str) {
    match resource {
        ResourceRef::Application(_) => ("applications", "app_id"),
        ResourceRef::Database(_) => ("databases", "database_id"),
    }
}

fn parse_col<T>(row: &PgRow, col: &str) -> StoreResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = row.try_get(col)?;
    raw.parse()
        .map_err(|e: T::Err| StoreError::Corrupt(format!("{col}: {e}")))
}

fn parse_opt_col<T>(row: &PgRow, col: &str) -> StoreResult<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw: Option<String> = row.try_get(col)?;
    raw.map(|s| {
        s.parse()
            .map_err(|e: T::Err| StoreError::Corrupt(format!("{col}: {e}")))
    })
    .transpose()
}

// =============================================================================
// Row decoding
// =============================================================================

const NODE_COLUMNS: &str = "node_id, name, region, host_address, status, cpu_total, \
     memory_total_mb, disk_total_mb, cpu_used, memory_used_mb, disk_used_mb, container_count, \
     last_heartbeat, last_capacity_alert_at, registration_token_hash, registration_expires_at, \
     secret_hash, created_at, updated_at";

fn node_from_row(row: &PgRow) -> StoreResult<WorkerNode> {
    Ok(WorkerNode {
        id: parse_col(row, "node_id")?,
        name: row.try_get("name")?,
        region: row.try_get("region")?,
        host_address: row.try_get("host_address")?,
        status: parse_col(row, "status")?,
        cpu_total: row.try_get("cpu_total")?,
        memory_total_mb: row.try_get("memory_total_mb")?,
        disk_total_mb: row.try_get("disk_total_mb")?,
        cpu_used: row.try_get("cpu_used")?,
        memory_used_mb: row.try_get("memory_used_mb")?,
        disk_used_mb: row.try_get("disk_used_mb")?,
        container_count: row.try_get("container_count")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        last_capacity_alert_at: row.try_get("last_capacity_alert_at")?,
        registration_token_hash: row.try_get("registration_token_hash")?,
        registration_expires_at: row.try_get("registration_expires_at")?,
        secret_hash: row.try_get("secret_hash")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn plan_from_row(row: &PgRow) -> StoreResult<Plan> {
    Ok(Plan {
        id: parse_col(row, "plan_id")?,
        name: row.try_get("name")?,
        cpu: row.try_get("cpu")?,
        memory_mb: row.try_get("memory_mb")?,
        hourly_rate: row.try_get("hourly_rate")?,
    })
}

fn runtime_from_row(row: &PgRow) -> StoreResult<Runtime> {
    Ok(Runtime {
        id: parse_col(row, "runtime_id")?,
        name: row.try_get("name")?,
        image: row.try_get("image")?,
        build_command: row.try_get("build_command")?,
        start_command: row.try_get("start_command")?,
        port: row.try_get("port")?,
    })
}

const APP_COLUMNS: &str = "app_id, org_id, name, plan_id, runtime_id, region, instances, \
     node_id, status, git, env_vars, linked_databases, domains, billing_cursor, \
     billing_paused_at, created_at, updated_at";

fn app_from_row(row: &PgRow) -> StoreResult<Application> {
    let git: Option<Json<GitSource>> = row.try_get("git")?;
    let env_vars: Json<Vec<EnvVar>> = row.try_get("env_vars")?;
    let linked_databases: Json<Vec<DatabaseLink>> = row.try_get("linked_databases")?;
    let domains: Json<Vec<String>> = row.try_get("domains")?;

    Ok(Application {
        id: parse_col(row, "app_id")?,
        org_id: parse_col(row, "org_id")?,
        name: row.try_get("name")?,
        plan_id: parse_col(row, "plan_id")?,
        runtime_id: parse_col(row, "runtime_id")?,
        region: row.try_get("region")?,
        instances: row.try_get("instances")?,
        node_id: parse_opt_col(row, "node_id")?,
        status: parse_col(row, "status")?,
        git: git.map(|j| j.0),
        env_vars: env_vars.0,
        linked_databases: linked_databases.0,
        domains: domains.0,
        billing_cursor: row.try_get("billing_cursor")?,
        billing_paused_at: row.try_get("billing_paused_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

const DB_COLUMNS: &str = "database_id, org_id, name, engine, version, plan_id, region, \
     node_id, status, port, username, sealed_password, database_name, billing_cursor, \
     billing_paused_at, created_at, updated_at";

fn database_from_row(row: &PgRow) -> StoreResult<DatabaseResource> {
    let engine: String = row.try_get("engine")?;
    Ok(DatabaseResource {
        id: parse_col(row, "database_id")?,
        org_id: parse_col(row, "org_id")?,
        name: row.try_get("name")?,
        engine: DatabaseEngine::parse(&engine)
            .ok_or_else(|| StoreError::Corrupt(format!("engine: {engine}")))?,
        version: row.try_get("version")?,
        plan_id: parse_opt_col(row, "plan_id")?,
        region: row.try_get("region")?,
        node_id: parse_opt_col(row, "node_id")?,
        status: parse_col(row, "status")?,
        port: row.try_get("port")?,
        username: row.try_get("username")?,
        sealed_password: row.try_get("sealed_password")?,
        database_name: row.try_get("database_name")?,
        billing_cursor: row.try_get("billing_cursor")?,
        billing_paused_at: row.try_get("billing_paused_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn build_from_row(row: &PgRow) -> StoreResult<Build> {
    Ok(Build {
        id: parse_col(row, "build_id")?,
        app_id: parse_col(row, "app_id")?,
        node_id: parse_col(row, "node_id")?,
        git_commit: row.try_get("git_commit")?,
        trigger: parse_col(row, "trigger")?,
        status: parse_col(row, "status")?,
        created_at: row.try_get("created_at")?,
    })
}

fn ledger_from_row(row: &PgRow) -> StoreResult<LedgerEntry> {
    Ok(LedgerEntry {
        id: parse_col(row, "entry_id")?,
        org_id: parse_col(row, "org_id")?,
        resource_kind: parse_col(row, "resource_kind")?,
        resource_id: row.try_get("resource_id")?,
        plan_id: parse_opt_col(row, "plan_id")?,
        instances: row.try_get("instances")?,
        hourly_rate: row.try_get("hourly_rate")?,
        hours: row.try_get("hours")?,
        amount: row.try_get("amount")?,
        period_start: row.try_get("period_start")?,
        period_end: row.try_get("period_end")?,
        succeeded: row.try_get("succeeded")?,
        failure_reason: row.try_get("failure_reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn billable_from_row(row: &PgRow) -> StoreResult<BillableResource> {
    let kind = parse_col(row, "resource_kind")?;
    let id: String = row.try_get("resource_id")?;
    let resource = ResourceRef::parse(kind, &id)
        .ok_or_else(|| StoreError::Corrupt(format!("resource_id: {id}")))?;

    Ok(BillableResource {
        resource,
        org_id: parse_col(row, "org_id")?,
        plan_id: parse_opt_col(row, "plan_id")?,
        hourly_rate: row.try_get("hourly_rate")?,
        instances: row.try_get("instances")?,
        status: parse_col(row, "status")?,
        node_id: parse_opt_col(row, "node_id")?,
        billing_cursor: row.try_get("billing_cursor")?,
    })
}

fn policy_from_row(row: &PgRow) -> StoreResult<BackupPolicy> {
    Ok(BackupPolicy {
        id: parse_col(row, "policy_id")?,
        org_id: parse_col(row, "org_id")?,
        database_id: parse_opt_col(row, "database_id")?,
        frequency_minutes: row.try_get("frequency_minutes")?,
        retention_days: row.try_get("retention_days")?,
        next_run_at: row.try_get("next_run_at")?,
        active: row.try_get("active")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn task_from_row(row: &PgRow) -> StoreResult<TaskRecord> {
    Ok(TaskRecord {
        task_id: parse_col(row, "task_id")?,
        node_id: parse_col(row, "node_id")?,
        task_type: parse_col(row, "task_type")?,
        resource_kind: parse_col(row, "resource_kind")?,
        resource_id: row.try_get("resource_id")?,
        status: parse_col(row, "status")?,
        created_at: row.try_get("created_at")?,
    })
}

const BILLABLE_SQL: &str = "
    SELECT 'application' AS resource_kind, a.app_id AS resource_id, a.org_id, a.plan_id,
           p.hourly_rate, a.instances, a.status, a.node_id, a.billing_cursor
      FROM applications a
      LEFT JOIN plans p ON p.plan_id = a.plan_id
     WHERE a.status IN ('running', 'suspended') AND ($1::TEXT IS NULL OR a.org_id = $1)
    UNION ALL
    SELECT 'database', d.database_id, d.org_id, d.plan_id,
           p.hourly_rate, 1, d.status, d.node_id, d.billing_cursor
      FROM databases d
      LEFT JOIN plans p ON p.plan_id = d.plan_id
     WHERE d.status IN ('running', 'suspended') AND ($1::TEXT IS NULL OR d.org_id = $1)
    ORDER BY billing_cursor";

async fn insert_ledger(
    tx: &mut Transaction<'_, Postgres>,
    entry: &LedgerEntry,
) -> StoreResult<()> {
    sqlx::query(
        "INSERT INTO billing_ledger (entry_id, org_id, resource_kind, resource_id, plan_id, \
         instances, hourly_rate, hours, amount, period_start, period_end, succeeded, \
         failure_reason, created_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
    )
    .bind(entry.id.to_string())
    .bind(entry.org_id.to_string())
    .bind(entry.resource_kind.as_str())
    .bind(&entry.resource_id)
    .bind(entry.plan_id.map(|id| id.to_string()))
    .bind(entry.instances)
    .bind(entry.hourly_rate)
    .bind(entry.hours)
    .bind(entry.amount)
    .bind(entry.period_start)
    .bind(entry.period_end)
    .bind(entry.succeeded)
    .bind(&entry.failure_reason)
    .bind(entry.created_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Lock the resource row and return its cursor.
async fn lock_cursor(
    tx: &mut Transaction<'_, Postgres>,
    resource: &ResourceRef,
) -> StoreResult<Option<DateTime<Utc>>> {
    let (table, id_col) = table_for(resource);
    let cursor = sqlx::query_scalar::<_, DateTime<Utc>>(&format!(
        "SELECT billing_cursor FROM {table} WHERE {id_col} = $1 FOR UPDATE"
    ))
    .bind(resource.id_string())
    .fetch_optional(&mut **tx)
    .await?;
    Ok(cursor)
}

async fn advance_cursor(
    tx: &mut Transaction<'_, Postgres>,
    resource: &ResourceRef,
    cursor: DateTime<Utc>,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let (table, id_col) = table_for(resource);
    sqlx::query(&format!(
        "UPDATE {table} SET billing_cursor = $2, updated_at = $3 WHERE {id_col} = $1"
    ))
    .bind(resource.id_string())
    .bind(cursor)
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[async_trait]
impl NodeStore for PgStore {
    async fn insert_node(&self, node: &WorkerNode) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO nodes ({NODE_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)"
        ))
        .bind(node.id.to_string())
        .bind(&node.name)
        .bind(&node.region)
        .bind(&node.host_address)
        .bind(node.status.as_str())
        .bind(node.cpu_total)
        .bind(node.memory_total_mb)
        .bind(node.disk_total_mb)
        .bind(node.cpu_used)
        .bind(node.memory_used_mb)
        .bind(node.disk_used_mb)
        .bind(node.container_count)
        .bind(node.last_heartbeat)
        .bind(node.last_capacity_alert_at)
        .bind(&node.registration_token_hash)
        .bind(node.registration_expires_at)
        .bind(&node.secret_hash)
        .bind(node.created_at)
        .bind(node.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_node(&self, id: NodeId) -> StoreResult<Option<WorkerNode>> {
        sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE node_id = $1"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(node_from_row)
            .transpose()
    }

    async fn redeem_registration(
        &self,
        token_hash: &str,
        secret_hash: &str,
        host_address: Option<&str>,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WorkerNode>> {
        sqlx::query(&format!(
            "UPDATE nodes SET secret_hash = $3, registration_token_hash = NULL, \
             registration_expires_at = NULL, status = 'offline', \
             host_address = COALESCE($4, host_address), updated_at = $2 \
             WHERE registration_token_hash = $1 AND registration_expires_at > $2 \
             RETURNING {NODE_COLUMNS}"
        ))
        .bind(token_hash)
        .bind(now)
        .bind(secret_hash)
        .bind(host_address)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(node_from_row)
        .transpose()
    }

    async fn record_heartbeat(
        &self,
        id: NodeId,
        update: &HeartbeatUpdate,
    ) -> StoreResult<Option<WorkerNode>> {
        sqlx::query(&format!(
            "UPDATE nodes SET cpu_total = $2, memory_total_mb = $3, disk_total_mb = $4, \
             cpu_used = $5, memory_used_mb = $6, disk_used_mb = $7, container_count = $8, \
             status = CASE WHEN status IN ('draining', 'disabled') THEN status ELSE $9 END, \
             last_capacity_alert_at = $10, last_heartbeat = $11, updated_at = $11 \
             WHERE node_id = $1 AND status <> 'pending' \
             RETURNING {NODE_COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(update.cpu_total)
        .bind(update.memory_total_mb)
        .bind(update.disk_total_mb)
        .bind(update.cpu_used)
        .bind(update.memory_used_mb)
        .bind(update.disk_used_mb)
        .bind(update.container_count)
        .bind(update.status.as_str())
        .bind(update.last_capacity_alert_at)
        .bind(update.at)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(node_from_row)
        .transpose()
    }

    async fn set_node_status(
        &self,
        id: NodeId,
        status: NodeStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<WorkerNode>> {
        sqlx::query(&format!(
            "UPDATE nodes SET status = $2, updated_at = $3 \
             WHERE node_id = $1 AND status <> 'pending' \
             RETURNING {NODE_COLUMNS}"
        ))
        .bind(id.to_string())
        .bind(status.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(node_from_row)
        .transpose()
    }

    async fn list_nodes_in_region(&self, region: &str) -> StoreResult<Vec<WorkerNode>> {
        sqlx::query(&format!("SELECT {NODE_COLUMNS} FROM nodes WHERE region = $1"))
            .bind(region)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(node_from_row)
            .collect()
    }

    async fn mark_offline_before(
        &self,
        cutoff: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<NodeId>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "UPDATE nodes SET status = 'offline', updated_at = $2 \
             WHERE status IN ('online', 'degraded') \
               AND (last_heartbeat IS NULL OR last_heartbeat <= $1) \
             RETURNING node_id",
        )
        .bind(cutoff)
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        ids.iter()
            .map(|s| NodeId::parse(s).map_err(StoreError::from))
            .collect()
    }

    async fn count_bound_workloads(&self, id: NodeId) -> StoreResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT (SELECT COUNT(*) FROM applications WHERE node_id = $1) \
                  + (SELECT COUNT(*) FROM databases WHERE node_id = $1)",
        )
        .bind(id.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn delete_node(&self, id: NodeId) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM nodes WHERE node_id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl WorkloadStore for PgStore {
    async fn insert_plan(&self, plan: &Plan) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO plans (plan_id, name, cpu, memory_mb, hourly_rate) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(plan.id.to_string())
        .bind(&plan.name)
        .bind(plan.cpu)
        .bind(plan.memory_mb)
        .bind(plan.hourly_rate)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_plan(&self, id: PlanId) -> StoreResult<Option<Plan>> {
        sqlx::query("SELECT plan_id, name, cpu, memory_mb, hourly_rate FROM plans WHERE plan_id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .as_ref()
            .map(plan_from_row)
            .transpose()
    }

    async fn insert_runtime(&self, runtime: &Runtime) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO runtimes (runtime_id, name, image, build_command, start_command, port) \
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(runtime.id.to_string())
        .bind(&runtime.name)
        .bind(&runtime.image)
        .bind(&runtime.build_command)
        .bind(&runtime.start_command)
        .bind(runtime.port)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_runtime(&self, id: RuntimeId) -> StoreResult<Option<Runtime>> {
        sqlx::query(
            "SELECT runtime_id, name, image, build_command, start_command, port \
             FROM runtimes WHERE runtime_id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(runtime_from_row)
        .transpose()
    }

    async fn insert_application(&self, app: &Application) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO applications ({APP_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(app.id.to_string())
        .bind(app.org_id.to_string())
        .bind(&app.name)
        .bind(app.plan_id.to_string())
        .bind(app.runtime_id.to_string())
        .bind(&app.region)
        .bind(app.instances)
        .bind(app.node_id.map(|id| id.to_string()))
        .bind(app.status.as_str())
        .bind(app.git.as_ref().map(Json))
        .bind(Json(&app.env_vars))
        .bind(Json(&app.linked_databases))
        .bind(Json(&app.domains))
        .bind(app.billing_cursor)
        .bind(app.billing_paused_at)
        .bind(app.created_at)
        .bind(app.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_application(&self, id: AppId) -> StoreResult<Option<Application>> {
        sqlx::query(&format!(
            "SELECT {APP_COLUMNS} FROM applications WHERE app_id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(app_from_row)
        .transpose()
    }

    async fn insert_database(&self, db: &DatabaseResource) -> StoreResult<()> {
        sqlx::query(&format!(
            "INSERT INTO databases ({DB_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
        ))
        .bind(db.id.to_string())
        .bind(db.org_id.to_string())
        .bind(&db.name)
        .bind(db.engine.as_str())
        .bind(&db.version)
        .bind(db.plan_id.map(|id| id.to_string()))
        .bind(&db.region)
        .bind(db.node_id.map(|id| id.to_string()))
        .bind(db.status.as_str())
        .bind(db.port)
        .bind(&db.username)
        .bind(&db.sealed_password)
        .bind(&db.database_name)
        .bind(db.billing_cursor)
        .bind(db.billing_paused_at)
        .bind(db.created_at)
        .bind(db.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_database(&self, id: DatabaseId) -> StoreResult<Option<DatabaseResource>> {
        sqlx::query(&format!(
            "SELECT {DB_COLUMNS} FROM databases WHERE database_id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(database_from_row)
        .transpose()
    }

    async fn set_status(
        &self,
        resource: &ResourceRef,
        status: ResourceStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.change_status(resource, status, None, false, now).await
    }

    async fn set_status_unless_suspended(
        &self,
        resource: &ResourceRef,
        status: ResourceStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.change_status(resource, status, None, true, now).await
    }

    async fn bind_node(
        &self,
        resource: &ResourceRef,
        node_id: Option<NodeId>,
        status: ResourceStatus,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        self.change_status(resource, status, Some(node_id), false, now)
            .await
    }

    async fn set_instances(&self, id: AppId, instances: i32) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE applications SET instances = $2 WHERE app_id = $1")
            .bind(id.to_string())
            .bind(instances)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_build(&self, build: &Build) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO builds (build_id, app_id, node_id, git_commit, trigger, status, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(build.id.to_string())
        .bind(build.app_id.to_string())
        .bind(build.node_id.to_string())
        .bind(&build.git_commit)
        .bind(build.trigger.as_str())
        .bind(build.status.as_str())
        .bind(build.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_build(&self, id: BuildId) -> StoreResult<Option<Build>> {
        sqlx::query(
            "SELECT build_id, app_id, node_id, git_commit, trigger, status, created_at \
             FROM builds WHERE build_id = $1",
        )
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(build_from_row)
        .transpose()
    }

    async fn set_build_status(&self, id: BuildId, status: BuildStatus) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE builds SET status = $2 WHERE build_id = $1")
            .bind(id.to_string())
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_org_databases(&self, org_id: OrgId) -> StoreResult<Vec<DatabaseResource>> {
        sqlx::query(&format!(
            "SELECT {DB_COLUMNS} FROM databases WHERE org_id = $1 ORDER BY created_at"
        ))
        .bind(org_id.to_string())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(database_from_row)
        .collect()
    }
}

#[async_trait]
impl BillingStore for PgStore {
    async fn list_billable(&self) -> StoreResult<Vec<BillableResource>> {
        sqlx::query(BILLABLE_SQL)
            .bind(None::<String>)
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(billable_from_row)
            .collect()
    }

    async fn list_org_billable(&self, org_id: OrgId) -> StoreResult<Vec<BillableResource>> {
        sqlx::query(BILLABLE_SQL)
            .bind(Some(org_id.to_string()))
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(billable_from_row)
            .collect()
    }

    async fn settle_charge(
        &self,
        charge: &Charge,
        now: DateTime<Utc>,
    ) -> StoreResult<Settlement> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO org_wallets (org_id, balance, updated_at) VALUES ($1, 0, $2) \
             ON CONFLICT (org_id) DO NOTHING",
        )
        .bind(charge.org_id.to_string())
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let balance: Decimal =
            sqlx::query_scalar("SELECT balance FROM org_wallets WHERE org_id = $1 FOR UPDATE")
                .bind(charge.org_id.to_string())
                .fetch_one(&mut *tx)
                .await?;

        if lock_cursor(&mut tx, &charge.resource).await? != Some(charge.period_start) {
            tx.rollback().await?;
            return Ok(Settlement::Stale);
        }

        let settlement = if balance >= charge.amount {
            let balance_after = balance - charge.amount;
            sqlx::query("UPDATE org_wallets SET balance = $2, updated_at = $3 WHERE org_id = $1")
                .bind(charge.org_id.to_string())
                .bind(balance_after)
                .bind(now)
                .execute(&mut *tx)
                .await?;

            let entry = charge.ledger_entry(true, None, now);
            insert_ledger(&mut tx, &entry).await?;
            Settlement::Charged {
                entry,
                balance_after,
            }
        } else {
            let entry = charge.ledger_entry(
                false,
                Some(crate::billing::INSUFFICIENT_FUNDS.to_string()),
                now,
            );
            insert_ledger(&mut tx, &entry).await?;
            Settlement::InsufficientFunds { entry, balance }
        };

        advance_cursor(&mut tx, &charge.resource, charge.period_end, now).await?;
        tx.commit().await?;
        Ok(settlement)
    }

    async fn record_failed_charge(
        &self,
        charge: &Charge,
        reason: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<LedgerEntry>> {
        let mut tx = self.pool.begin().await?;

        if lock_cursor(&mut tx, &charge.resource).await? != Some(charge.period_start) {
            tx.rollback().await?;
            return Ok(None);
        }

        let entry = charge.ledger_entry(false, Some(reason.to_string()), now);
        insert_ledger(&mut tx, &entry).await?;
        advance_cursor(&mut tx, &charge.resource, charge.period_end, now).await?;
        tx.commit().await?;
        Ok(Some(entry))
    }

    async fn ledger_for(&self, resource: &ResourceRef) -> StoreResult<Vec<LedgerEntry>> {
        sqlx::query(
            "SELECT entry_id, org_id, resource_kind, resource_id, plan_id, instances, \
             hourly_rate, hours, amount, period_start, period_end, succeeded, failure_reason, \
             created_at \
             FROM billing_ledger WHERE resource_kind = $1 AND resource_id = $2 \
             ORDER BY period_start",
        )
        .bind(resource.kind().as_str())
        .bind(resource.id_string())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(ledger_from_row)
        .collect()
    }

    async fn wallet_balance(&self, org_id: OrgId) -> StoreResult<Decimal> {
        let balance: Option<Decimal> =
            sqlx::query_scalar("SELECT balance FROM org_wallets WHERE org_id = $1")
                .bind(org_id.to_string())
                .fetch_optional(&self.pool)
                .await?;
        Ok(balance.unwrap_or(Decimal::ZERO))
    }

    async fn credit_wallet(&self, org_id: OrgId, amount: Decimal) -> StoreResult<Decimal> {
        let balance: Decimal = sqlx::query_scalar(
            "INSERT INTO org_wallets (org_id, balance, updated_at) VALUES ($1, $2, now()) \
             ON CONFLICT (org_id) DO UPDATE \
                SET balance = org_wallets.balance + EXCLUDED.balance, updated_at = now() \
             RETURNING balance",
        )
        .bind(org_id.to_string())
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;
        Ok(balance)
    }

    async fn spending_alert(&self, org_id: OrgId) -> StoreResult<Option<SpendingAlert>> {
        let row = sqlx::query(
            "SELECT org_id, threshold, last_notified_at FROM spending_alerts WHERE org_id = $1",
        )
        .bind(org_id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(SpendingAlert {
                org_id: parse_col(&row, "org_id")?,
                threshold: row.try_get("threshold")?,
                last_notified_at: row.try_get("last_notified_at")?,
            })
        })
        .transpose()
    }

    async fn set_spending_threshold(&self, org_id: OrgId, threshold: Decimal) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO spending_alerts (org_id, threshold) VALUES ($1, $2) \
             ON CONFLICT (org_id) DO UPDATE SET threshold = EXCLUDED.threshold",
        )
        .bind(org_id.to_string())
        .bind(threshold)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_spending_alert_notified(
        &self,
        org_id: OrgId,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE spending_alerts SET last_notified_at = $2 WHERE org_id = $1")
            .bind(org_id.to_string())
            .bind(at)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

const POLICY_COLUMNS: &str = "policy_id, org_id, database_id, frequency_minutes, \
     retention_days, next_run_at, active, created_at, updated_at";

#[async_trait]
impl BackupStore for PgStore {
    async fn upsert_policy(&self, policy: &BackupPolicy) -> StoreResult<BackupPolicy> {
        let row = sqlx::query(&format!(
            "INSERT INTO backup_policies ({POLICY_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (org_id, (COALESCE(database_id, ''))) DO UPDATE SET \
                frequency_minutes = EXCLUDED.frequency_minutes, \
                retention_days = EXCLUDED.retention_days, \
                next_run_at = EXCLUDED.next_run_at, \
                active = EXCLUDED.active, \
                updated_at = EXCLUDED.updated_at \
             RETURNING {POLICY_COLUMNS}"
        ))
        .bind(policy.id.to_string())
        .bind(policy.org_id.to_string())
        .bind(policy.database_id.map(|id| id.to_string()))
        .bind(policy.frequency_minutes)
        .bind(policy.retention_days)
        .bind(policy.next_run_at)
        .bind(policy.active)
        .bind(policy.created_at)
        .bind(policy.updated_at)
        .fetch_one(&self.pool)
        .await?;
        policy_from_row(&row)
    }

    async fn get_policy(&self, id: BackupPolicyId) -> StoreResult<Option<BackupPolicy>> {
        sqlx::query(&format!(
            "SELECT {POLICY_COLUMNS} FROM backup_policies WHERE policy_id = $1"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?
        .as_ref()
        .map(policy_from_row)
        .transpose()
    }

    async fn due_backups(&self, now: DateTime<Utc>) -> StoreResult<Vec<DueBackup>> {
        let policies = self.due_policies(now).await?;
        let mut due = Vec::new();

        for policy in policies {
            let rows = sqlx::query(&format!(
                "SELECT {DB_COLUMNS} FROM databases \
                 WHERE org_id = $1 AND ($2::TEXT IS NULL OR database_id = $2) \
                   AND status = 'running' AND node_id IS NOT NULL \
                 ORDER BY database_id"
            ))
            .bind(policy.org_id.to_string())
            .bind(policy.database_id.map(|id| id.to_string()))
            .fetch_all(&self.pool)
            .await?;

            for row in &rows {
                due.push(DueBackup {
                    policy: policy.clone(),
                    database: database_from_row(row)?,
                });
            }
        }

        Ok(due)
    }

    async fn due_policies(&self, now: DateTime<Utc>) -> StoreResult<Vec<BackupPolicy>> {
        sqlx::query(&format!(
            "SELECT {POLICY_COLUMNS} FROM backup_policies \
             WHERE active AND next_run_at <= $1 ORDER BY next_run_at, policy_id"
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(policy_from_row)
        .collect()
    }

    async fn advance_policy(
        &self,
        id: BackupPolicyId,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE backup_policies SET next_run_at = $2, updated_at = $3 WHERE policy_id = $1",
        )
        .bind(id.to_string())
        .bind(next_run_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl TaskStore for PgStore {
    async fn record_task(&self, task: &TaskRecord) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO task_log (task_id, node_id, task_type, resource_kind, resource_id, \
             status, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(task.task_id.to_string())
        .bind(task.node_id.to_string())
        .bind(task.task_type.as_str())
        .bind(task.resource_kind.as_str())
        .bind(&task.resource_id)
        .bind(task.status.as_str())
        .bind(task.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_tasks(&self, task_ids: &[TaskId]) -> StoreResult<u64> {
        if task_ids.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = task_ids.iter().map(|id| id.to_string()).collect();
        let result = sqlx::query(
            "UPDATE task_log SET status = 'cancelled' \
             WHERE task_id = ANY($1) AND status = 'queued'",
        )
        .bind(&ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn tasks_for(&self, resource: &ResourceRef) -> StoreResult<Vec<TaskRecord>> {
        sqlx::query(
            "SELECT task_id, node_id, task_type, resource_kind, resource_id, status, created_at \
             FROM task_log WHERE resource_kind = $1 AND resource_id = $2 ORDER BY created_at",
        )
        .bind(resource.kind().as_str())
        .bind(resource.id_string())
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(task_from_row)
        .collect()
    }
}
