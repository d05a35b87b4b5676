//! Backup scheduling.
//!
//! On every tick, each active policy whose `next_run_at` has passed
//! dispatches a `backup` task for every running database it covers whose
//! node is connected, then moves `next_run_at` forward by one frequency.
//! The policy advances whether or not anything was dispatched, so an
//! offline node delays a backup to the policy's next slot instead of
//! keeping the policy permanently due.

mod worker;

pub use worker::BackupWorker;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use fleet_events::{EventError, ResourceKind, ResourceStatus, TaskEnvelope, TaskType};
use fleet_id::{BackupId, BackupPolicyId, DatabaseId, NodeId, OrgId, TaskId};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::dispatch::{DispatchChannel, DispatchError};
use crate::store::{BackupPolicy, DueBackup, Store, StoreError};

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("invalid backup policy: {0}")]
    InvalidPolicy(&'static str),

    #[error("database not found: {0}")]
    DatabaseNotFound(DatabaseId),

    #[error("database {0} not found or not deployed")]
    NotDeployed(DatabaseId),

    #[error("node {0} is unreachable")]
    NodeUnreachable(NodeId),

    #[error(transparent)]
    Payload(#[from] EventError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type BackupResult<T> = Result<T, BackupError>;

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub interval: Duration,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
        }
    }
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BackupStats {
    pub dispatched: usize,
    pub node_offline: usize,
    pub policies_advanced: usize,
}

/// Type-specific fields of a `backup` task.
#[derive(Debug, Clone, Serialize)]
struct BackupPayload<'a> {
    policy_id: BackupPolicyId,
    engine: &'a str,
    database_name: &'a str,
    retention_days: i32,
}

/// The run after `next_run_at`. Missed runs are not replayed: if one
/// frequency step still lands in the past, the next run is a full frequency
/// from `now`.
pub fn next_run_after(
    next_run_at: DateTime<Utc>,
    frequency_minutes: i32,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let step = TimeDelta::minutes(i64::from(frequency_minutes.max(1)));
    let next = next_run_at + step;
    if next <= now {
        now + step
    } else {
        next
    }
}

pub struct BackupScheduler {
    store: Arc<dyn Store>,
    channel: Arc<DispatchChannel>,
    config: BackupConfig,
}

impl BackupScheduler {
    pub fn new(store: Arc<dyn Store>, channel: Arc<DispatchChannel>, config: BackupConfig) -> Self {
        Self {
            store,
            channel,
            config,
        }
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub async fn upsert_policy(
        &self,
        org_id: OrgId,
        database_id: Option<DatabaseId>,
        frequency_minutes: i32,
        retention_days: i32,
    ) -> BackupResult<BackupPolicy> {
        self.upsert_policy_at(org_id, database_id, frequency_minutes, retention_days, Utc::now())
            .await
    }

    /// Create or replace the policy for `(org_id, database_id)`. The policy
    /// is due immediately.
    pub async fn upsert_policy_at(
        &self,
        org_id: OrgId,
        database_id: Option<DatabaseId>,
        frequency_minutes: i32,
        retention_days: i32,
        now: DateTime<Utc>,
    ) -> BackupResult<BackupPolicy> {
        if frequency_minutes < 1 {
            return Err(BackupError::InvalidPolicy("frequency must be at least one minute"));
        }
        if retention_days < 1 {
            return Err(BackupError::InvalidPolicy("retention must be at least one day"));
        }
        if let Some(db_id) = database_id {
            match self.store.get_database(db_id).await? {
                Some(db) if db.org_id == org_id => {}
                _ => return Err(BackupError::DatabaseNotFound(db_id)),
            }
        }

        let policy = self
            .store
            .upsert_policy(&BackupPolicy {
                id: BackupPolicyId::new(),
                org_id,
                database_id,
                frequency_minutes,
                retention_days,
                next_run_at: now,
                active: true,
                created_at: now,
                updated_at: now,
            })
            .await?;

        info!(
            org_id = %org_id,
            policy_id = %policy.id,
            frequency_minutes,
            retention_days,
            "backup policy saved"
        );
        Ok(policy)
    }

    pub async fn tick(&self) -> BackupResult<BackupStats> {
        self.tick_at(Utc::now()).await
    }

    #[instrument(skip(self))]
    pub async fn tick_at(&self, now: DateTime<Utc>) -> BackupResult<BackupStats> {
        let mut stats = BackupStats::default();

        for due in self.store.due_backups(now).await? {
            if self.dispatch_backup(&due).await? {
                stats.dispatched += 1;
            } else {
                stats.node_offline += 1;
            }
        }

        for policy in self.store.due_policies(now).await? {
            let next = next_run_after(policy.next_run_at, policy.frequency_minutes, now);
            if self.store.advance_policy(policy.id, next, now).await? {
                stats.policies_advanced += 1;
                debug!(policy_id = %policy.id, next_run_at = %next, "backup policy advanced");
            }
        }

        if stats != BackupStats::default() {
            info!(
                dispatched = stats.dispatched,
                node_offline = stats.node_offline,
                policies_advanced = stats.policies_advanced,
                "backup tick complete"
            );
        }
        Ok(stats)
    }

    async fn dispatch_backup(&self, due: &DueBackup) -> BackupResult<bool> {
        let db = &due.database;
        let Some(node_id) = db.node_id else {
            return Ok(false);
        };
        if !self.channel.is_online(node_id) {
            warn!(database_id = %db.id, node_id = %node_id, "backup skipped, node offline");
            return Ok(false);
        }

        let task = TaskEnvelope::new(TaskType::Backup, ResourceKind::Database, db.id)
            .with_payload(&BackupPayload {
                policy_id: due.policy.id,
                engine: db.engine.as_str(),
                database_name: &db.database_name,
                retention_days: due.policy.retention_days,
            })?;
        Ok(self.channel.dispatch(node_id, task).await?)
    }

    /// Restore a running database from one of its backups.
    pub async fn schedule_restore(
        &self,
        database_id: DatabaseId,
        backup_id: BackupId,
    ) -> BackupResult<TaskId> {
        let db = self
            .store
            .get_database(database_id)
            .await?
            .ok_or(BackupError::NotDeployed(database_id))?;
        let node_id = match (db.node_id, db.status) {
            (Some(node_id), status) if status != ResourceStatus::Failed => node_id,
            _ => return Err(BackupError::NotDeployed(database_id)),
        };

        let task = TaskEnvelope::new(TaskType::Restore, ResourceKind::Database, database_id)
            .with_payload(&json!({ "backup_id": backup_id }))?;
        let task_id = task.task_id;

        if !self.channel.dispatch(node_id, task).await? {
            return Err(BackupError::NodeUnreachable(node_id));
        }
        info!(database_id = %database_id, backup_id = %backup_id, "restore dispatched");
        Ok(task_id)
    }
}
