//! Task payloads for deploys and database provisioning.
//!
//! Secrets are opened here, at the last moment before dispatch, and only
//! ever travel inside a task frame.

use std::collections::BTreeMap;

use fleet_id::BuildId;
use serde::Serialize;
use tracing::warn;

use crate::crypto::{aad, SecretBox};
use crate::store::{
    Application, DatabaseEngine, DatabaseResource, Plan, ResourceEnvelope, Runtime, Store,
};

use super::SchedulerError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GitCheckout {
    pub repository: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_token: Option<String>,
}

/// Type-specific fields of a `deploy` task for an application.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeployPayload {
    pub build_id: BuildId,
    pub app_name: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub git: Option<GitCheckout>,
    pub env: BTreeMap<String, String>,
    pub cpu: f64,
    pub memory_mb: i64,
    pub instances: i32,
    pub domains: Vec<String>,
}

/// Type-specific fields of a `deploy` task for a database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabasePayload {
    pub name: String,
    pub engine: DatabaseEngine,
    pub version: String,
    pub port: i32,
    pub username: String,
    pub password: String,
    pub database_name: String,
    pub cpu: f64,
    pub memory_mb: i64,
}

/// `{scheme}://{user}:{password}@{host}:{port}/{name}`
pub fn connection_url(
    engine: DatabaseEngine,
    username: &str,
    password: &str,
    host: &str,
    port: i32,
    database_name: &str,
) -> String {
    format!(
        "{}://{username}:{password}@{host}:{port}/{database_name}",
        engine.url_scheme()
    )
}

/// The six `{PREFIX}_*` variables injected for a linked database.
pub fn linked_database_env(
    prefix: &str,
    db: &DatabaseResource,
    host: &str,
    password: &str,
) -> Vec<(String, String)> {
    let prefix = prefix.trim_end_matches('_').to_ascii_uppercase();
    vec![
        (
            format!("{prefix}_URL"),
            connection_url(
                db.engine,
                &db.username,
                password,
                host,
                db.port,
                &db.database_name,
            ),
        ),
        (format!("{prefix}_HOST"), host.to_string()),
        (format!("{prefix}_PORT"), db.port.to_string()),
        (format!("{prefix}_USER"), db.username.clone()),
        (format!("{prefix}_PASSWORD"), password.to_string()),
        (format!("{prefix}_NAME"), db.database_name.clone()),
    ]
}

pub(crate) async fn deploy_payload(
    store: &dyn Store,
    secrets: &SecretBox,
    app: &Application,
    plan: &Plan,
    runtime: &Runtime,
    build_id: BuildId,
    commit: Option<String>,
) -> Result<DeployPayload, SchedulerError> {
    let mut env = BTreeMap::new();

    for var in &app.env_vars {
        let value = secrets.open(&var.sealed_value, &aad::env_var(app.id, &var.key))?;
        env.insert(var.key.clone(), value);
    }

    // Linked databases are applied after plain variables and win on conflict.
    for link in &app.linked_databases {
        let Some(db) = store.get_database(link.database_id).await? else {
            warn!(app_id = %app.id, database_id = %link.database_id, "linked database missing");
            continue;
        };
        let Some(node_id) = db.node_id else {
            warn!(app_id = %app.id, database_id = %db.id, "linked database not placed");
            continue;
        };
        let Some(node) = store.get_node(node_id).await? else {
            warn!(app_id = %app.id, node_id = %node_id, "linked database node missing");
            continue;
        };

        let password = secrets.open(&db.sealed_password, &aad::database_password(db.id))?;
        env.extend(linked_database_env(
            &link.prefix,
            &db,
            &node.host_address,
            &password,
        ));
    }

    let git = match &app.git {
        Some(source) => Some(GitCheckout {
            repository: source.repository.clone(),
            branch: source.branch.clone(),
            commit,
            oauth_token: source
                .sealed_oauth_token
                .as_deref()
                .map(|sealed| secrets.open(sealed, &aad::git_oauth_token(app.id)))
                .transpose()?,
        }),
        None => None,
    };

    let envelope = plan.envelope();
    Ok(DeployPayload {
        build_id,
        app_name: app.name.clone(),
        image: runtime.image.clone(),
        build_command: runtime.build_command.clone(),
        start_command: runtime.start_command.clone(),
        port: runtime.port,
        git,
        env,
        cpu: envelope.cpu,
        memory_mb: envelope.memory_mb,
        instances: app.instances,
        domains: app.domains.clone(),
    })
}

pub(crate) fn database_payload(
    secrets: &SecretBox,
    db: &DatabaseResource,
    envelope: ResourceEnvelope,
) -> Result<DatabasePayload, SchedulerError> {
    Ok(DatabasePayload {
        name: db.name.clone(),
        engine: db.engine,
        version: db.version.clone(),
        port: db.port,
        username: db.username.clone(),
        password: secrets.open(&db.sealed_password, &aad::database_password(db.id))?,
        database_name: db.database_name.clone(),
        cpu: envelope.cpu,
        memory_mb: envelope.memory_mb,
    })
}
