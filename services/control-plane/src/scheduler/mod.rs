//! Fleet scheduler.
//!
//! Turns user and webhook actions into placement decisions and tasks:
//! - picks a node for new deployments and databases (first-fit, see
//!   [`crate::nodes::placement`])
//! - records builds and binds resources to nodes
//! - dispatches lifecycle tasks to the bound node
//!
//! Placement is not re-validated against the dispatch channel: a node that
//! goes away between selection and send surfaces as
//! [`SchedulerError::NodeUnreachable`], which callers may retry.
//!
//! Suspended resources only leave suspension through billing. Every call
//! except delete refuses them, and node reports never overwrite the status.

mod payload;

pub use payload::{
    connection_url, linked_database_env, DatabasePayload, DeployPayload, GitCheckout,
};

use std::sync::Arc;

use chrono::Utc;
use fleet_events::{
    BuildStatus, BuildTrigger, EventError, ResourceKind, ResourceStatus, TaskEnvelope, TaskReport,
    TaskType,
};
use fleet_id::{AppId, BuildId, DatabaseId, NodeId, TaskId};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::crypto::{CryptoError, SecretBox};
use crate::dispatch::{DispatchChannel, DispatchError};
use crate::nodes::{NodeRegistry, RegistryError};
use crate::store::{
    Application, Build, DatabaseResource, ResourceEnvelope, ResourceRef, Store, StoreError,
};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{0} not found or not deployed")]
    NotDeployed(String),

    #[error("no available nodes in region {region}")]
    NoAvailableNodes { region: String },

    #[error("node {0} is unreachable")]
    NodeUnreachable(NodeId),

    #[error("{0} is suspended for non-payment")]
    Suspended(String),

    #[error("instance count must be at least 1, got {0}")]
    InvalidInstances(i32),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Payload(#[from] EventError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SchedulerError {
    fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Whether the same call may succeed later without any change.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::NoAvailableNodes { .. } | Self::NodeUnreachable(_)
        )
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// A deployment that reached the node's outbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledDeployment {
    pub build_id: BuildId,
    pub node_id: NodeId,
    pub task_id: TaskId,
}

/// A task that reached the node's outbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduledTask {
    pub node_id: NodeId,
    pub task_id: TaskId,
}

pub struct FleetScheduler {
    store: Arc<dyn Store>,
    registry: Arc<NodeRegistry>,
    channel: Arc<DispatchChannel>,
    secrets: SecretBox,
}

impl FleetScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<NodeRegistry>,
        channel: Arc<DispatchChannel>,
        secrets: SecretBox,
    ) -> Self {
        Self {
            store,
            registry,
            channel,
            secrets,
        }
    }

    async fn load_app(&self, app_id: AppId) -> SchedulerResult<Application> {
        self.store
            .get_application(app_id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("application", app_id))
    }

    async fn load_database(&self, db_id: DatabaseId) -> SchedulerResult<DatabaseResource> {
        self.store
            .get_database(db_id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("database", db_id))
    }

    /// Load an application that is bound to a node.
    async fn load_deployed_app(&self, app_id: AppId) -> SchedulerResult<(Application, NodeId)> {
        match self.store.get_application(app_id).await? {
            Some(app) => match app.node_id {
                Some(node_id) => Ok((app, node_id)),
                None => Err(SchedulerError::NotDeployed(app_id.to_string())),
            },
            None => Err(SchedulerError::NotDeployed(app_id.to_string())),
        }
    }

    /// Load a deployed application that is not suspended.
    async fn load_active_app(&self, app_id: AppId) -> SchedulerResult<(Application, NodeId)> {
        let (app, node_id) = self.load_deployed_app(app_id).await?;
        refuse_suspended(app.status, app_id)?;
        Ok((app, node_id))
    }

    async fn load_deployed_database(
        &self,
        db_id: DatabaseId,
    ) -> SchedulerResult<(DatabaseResource, NodeId)> {
        match self.store.get_database(db_id).await? {
            Some(db) => match db.node_id {
                Some(node_id) => Ok((db, node_id)),
                None => Err(SchedulerError::NotDeployed(db_id.to_string())),
            },
            None => Err(SchedulerError::NotDeployed(db_id.to_string())),
        }
    }

    /// Dispatch one task, mapping a refused delivery to `NodeUnreachable`.
    async fn send(&self, node_id: NodeId, task: TaskEnvelope) -> SchedulerResult<ScheduledTask> {
        let task_id = task.task_id;
        if self.channel.dispatch(node_id, task).await? {
            Ok(ScheduledTask { node_id, task_id })
        } else {
            Err(SchedulerError::NodeUnreachable(node_id))
        }
    }

    // -------------------------------------------------------------------------
    // Applications
    // -------------------------------------------------------------------------

    /// Place and deploy an application.
    #[instrument(skip(self), fields(app_id = %app_id))]
    pub async fn schedule_deployment(
        &self,
        app_id: AppId,
        git_commit: Option<String>,
        trigger: BuildTrigger,
    ) -> SchedulerResult<ScheduledDeployment> {
        let app = self.load_app(app_id).await?;
        refuse_suspended(app.status, app_id)?;
        let plan = self
            .store
            .get_plan(app.plan_id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("plan", app.plan_id))?;
        let runtime = self
            .store
            .get_runtime(app.runtime_id)
            .await?
            .ok_or_else(|| SchedulerError::not_found("runtime", app.runtime_id))?;

        let node = self
            .registry
            .select_node(&app.region, &plan.envelope())
            .await?
            .ok_or_else(|| {
                warn!(region = %app.region, "no node fits deployment");
                SchedulerError::NoAvailableNodes {
                    region: app.region.clone(),
                }
            })?;

        let now = Utc::now();
        let build = Build {
            id: BuildId::new(),
            app_id,
            node_id: node.id,
            git_commit: git_commit.clone(),
            trigger,
            status: BuildStatus::Queued,
            created_at: now,
        };
        self.store.insert_build(&build).await?;

        let resource = ResourceRef::Application(app_id);
        self.store
            .bind_node(&resource, Some(node.id), ResourceStatus::Building, now)
            .await?;

        let task = match payload::deploy_payload(
            self.store.as_ref(),
            &self.secrets,
            &app,
            &plan,
            &runtime,
            build.id,
            git_commit,
        )
        .await
        .and_then(|p| {
            TaskEnvelope::new(TaskType::Deploy, ResourceKind::Application, app_id)
                .with_payload(&p)
                .map_err(SchedulerError::from)
        }) {
            Ok(task) => task,
            Err(e) => {
                self.fail_build(&build, &resource).await?;
                return Err(e);
            }
        };

        match self.send(node.id, task).await {
            Ok(sent) => {
                self.store
                    .set_build_status(build.id, BuildStatus::Dispatched)
                    .await?;
                info!(build_id = %build.id, node_id = %node.id, ?trigger, "deployment dispatched");
                Ok(ScheduledDeployment {
                    build_id: build.id,
                    node_id: node.id,
                    task_id: sent.task_id,
                })
            }
            Err(e) => {
                self.fail_build(&build, &resource).await?;
                Err(e)
            }
        }
    }

    async fn fail_build(&self, build: &Build, resource: &ResourceRef) -> SchedulerResult<()> {
        self.store
            .set_build_status(build.id, BuildStatus::Failed)
            .await?;
        self.store
            .set_status(resource, ResourceStatus::Failed, Utc::now())
            .await?;
        warn!(build_id = %build.id, node_id = %build.node_id, "build failed before reaching node");
        Ok(())
    }

    pub async fn schedule_restart(&self, app_id: AppId) -> SchedulerResult<ScheduledTask> {
        let (_, node_id) = self.load_active_app(app_id).await?;
        self.send(
            node_id,
            TaskEnvelope::new(TaskType::Restart, ResourceKind::Application, app_id),
        )
        .await
    }

    /// Mark the application stopped, then tell its node.
    pub async fn schedule_stop(&self, app_id: AppId) -> SchedulerResult<ScheduledTask> {
        let (_, node_id) = self.load_active_app(app_id).await?;
        if !self
            .store
            .set_status_unless_suspended(
                &ResourceRef::Application(app_id),
                ResourceStatus::Stopped,
                Utc::now(),
            )
            .await?
        {
            return Err(SchedulerError::Suspended(app_id.to_string()));
        }
        self.send(
            node_id,
            TaskEnvelope::new(TaskType::Stop, ResourceKind::Application, app_id),
        )
        .await
    }

    /// Tell the node to start the application, then mark it running.
    pub async fn schedule_start(&self, app_id: AppId) -> SchedulerResult<ScheduledTask> {
        let (_, node_id) = self.load_active_app(app_id).await?;
        let sent = self
            .send(
                node_id,
                TaskEnvelope::new(TaskType::Start, ResourceKind::Application, app_id),
            )
            .await?;
        let marked = self
            .store
            .set_status_unless_suspended(
                &ResourceRef::Application(app_id),
                ResourceStatus::Running,
                Utc::now(),
            )
            .await?;
        if !marked {
            // Suspended by billing after the check above.
            warn!(app_id = %app_id, "application suspended while starting");
            return Err(SchedulerError::Suspended(app_id.to_string()));
        }
        Ok(sent)
    }

    /// Persist the new instance count, then tell the node.
    pub async fn schedule_scale(
        &self,
        app_id: AppId,
        instances: i32,
    ) -> SchedulerResult<ScheduledTask> {
        if instances < 1 {
            return Err(SchedulerError::InvalidInstances(instances));
        }
        let (_, node_id) = self.load_active_app(app_id).await?;
        self.store.set_instances(app_id, instances).await?;

        let task = TaskEnvelope::new(TaskType::Scale, ResourceKind::Application, app_id)
            .with_payload(&json!({ "instances": instances }))?;
        self.send(node_id, task).await
    }

    /// Cancel queued tasks, tell the node to delete, and unbind.
    pub async fn schedule_delete(&self, app_id: AppId) -> SchedulerResult<ScheduledTask> {
        let (_, node_id) = self.load_deployed_app(app_id).await?;
        self.delete_on_node(ResourceRef::Application(app_id), node_id)
            .await
    }

    async fn delete_on_node(
        &self,
        resource: ResourceRef,
        node_id: NodeId,
    ) -> SchedulerResult<ScheduledTask> {
        let resource_id = resource.id_string();
        self.channel
            .cancel_resource(node_id, resource.kind(), &resource_id)
            .await?;

        let sent = self
            .send(
                node_id,
                TaskEnvelope::new(TaskType::Delete, resource.kind(), &resource_id),
            )
            .await?;

        self.store
            .bind_node(&resource, None, ResourceStatus::Stopped, Utc::now())
            .await?;
        info!(resource_id = %resource_id, node_id = %node_id, "resource deleted from node");
        Ok(sent)
    }

    // -------------------------------------------------------------------------
    // Databases
    // -------------------------------------------------------------------------

    async fn database_envelope(&self, db: &DatabaseResource) -> SchedulerResult<ResourceEnvelope> {
        match db.plan_id {
            Some(plan_id) => Ok(self
                .store
                .get_plan(plan_id)
                .await?
                .ok_or_else(|| SchedulerError::not_found("plan", plan_id))?
                .envelope()),
            None => Ok(ResourceEnvelope::DATABASE_DEFAULT),
        }
    }

    /// Place a database and tell its node to provision it.
    #[instrument(skip(self), fields(database_id = %db_id))]
    pub async fn schedule_database_creation(
        &self,
        db_id: DatabaseId,
    ) -> SchedulerResult<ScheduledTask> {
        let db = self.load_database(db_id).await?;
        refuse_suspended(db.status, db_id)?;
        let envelope = self.database_envelope(&db).await?;

        let node = self
            .registry
            .select_node(&db.region, &envelope)
            .await?
            .ok_or_else(|| SchedulerError::NoAvailableNodes {
                region: db.region.clone(),
            })?;

        let resource = ResourceRef::Database(db_id);
        self.store
            .bind_node(&resource, Some(node.id), ResourceStatus::Deploying, Utc::now())
            .await?;

        let payload = payload::database_payload(&self.secrets, &db, envelope)?;
        let task = TaskEnvelope::new(TaskType::Deploy, ResourceKind::Database, db_id)
            .with_payload(&payload)?;

        match self.send(node.id, task).await {
            Ok(sent) => {
                info!(node_id = %node.id, engine = db.engine.as_str(), "database provisioning dispatched");
                Ok(sent)
            }
            Err(e) => {
                self.store
                    .set_status(&resource, ResourceStatus::Failed, Utc::now())
                    .await?;
                Err(e)
            }
        }
    }

    pub async fn schedule_database_delete(
        &self,
        db_id: DatabaseId,
    ) -> SchedulerResult<ScheduledTask> {
        let (_, node_id) = self.load_deployed_database(db_id).await?;
        self.delete_on_node(ResourceRef::Database(db_id), node_id)
            .await
    }

    // -------------------------------------------------------------------------
    // Reports
    // -------------------------------------------------------------------------

    /// Apply a task outcome reported by a node. Reports for resources not
    /// bound to the reporting node, or currently suspended, are ignored.
    pub async fn apply_report(&self, node_id: NodeId, report: &TaskReport) -> SchedulerResult<bool> {
        let Some(resource) = ResourceRef::parse(report.resource_kind, &report.resource_id) else {
            warn!(node_id = %node_id, resource_id = %report.resource_id, "report for malformed resource id");
            return Ok(false);
        };

        let bound = match resource {
            ResourceRef::Application(id) => self.store.get_application(id).await?.and_then(|a| a.node_id),
            ResourceRef::Database(id) => self.store.get_database(id).await?.and_then(|d| d.node_id),
        };
        if bound != Some(node_id) {
            warn!(node_id = %node_id, resource_id = %resource, "report from node not bound to resource");
            return Ok(false);
        }

        let status = report.status.resource_status();
        if !self
            .store
            .set_status_unless_suspended(&resource, status, Utc::now())
            .await?
        {
            warn!(node_id = %node_id, resource_id = %resource, reported = %status, "report for suspended resource ignored");
            return Ok(false);
        }
        info!(
            node_id = %node_id,
            task_id = %report.task_id,
            resource_id = %resource,
            status = %status,
            "task report applied"
        );
        Ok(true)
    }
}

fn refuse_suspended(status: ResourceStatus, id: impl ToString) -> SchedulerResult<()> {
    if status == ResourceStatus::Suspended {
        return Err(SchedulerError::Suspended(id.to_string()));
    }
    Ok(())
}
