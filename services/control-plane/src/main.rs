//! Fleet control plane
//!
//! Registers worker nodes, places applications and databases on them,
//! dispatches lifecycle tasks over per-node connections, and bills running
//! resources by the hour.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use fleet_control_plane::{
    api,
    backup::{BackupScheduler, BackupWorker},
    billing::{BillingEngine, BillingWorker},
    config,
    crypto::SecretBox,
    db::Database,
    dispatch::DispatchChannel,
    nodes::{LivenessWorker, NodeRegistry},
    notify::{LogNotifier, Notifier},
    scheduler::FleetScheduler,
    state::AppState,
    store::{MemoryStore, Store},
    webhook::WebhookIngest,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to FLEET_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet control plane");
    info!(listen_addr = %config.listen_addr, dev_mode = config.dev_mode, "Configuration loaded");

    // Storage: Postgres when configured, otherwise the in-memory store in dev mode
    let (store, db): (Arc<dyn Store>, Option<Database>) = match &config.database {
        Some(db_config) => {
            let db = match Database::connect(db_config).await {
                Ok(db) => {
                    info!("Database connection established");
                    db
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };

            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }

            let store: Arc<dyn Store> = Arc::new(db.store());
            (store, Some(db))
        }
        None if config.dev_mode => {
            warn!("DATABASE_URL not set, using in-memory store");
            let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
            (store, None)
        }
        None => bail!("DATABASE_URL must be set outside dev mode"),
    };

    let secrets = match SecretBox::from_env() {
        Ok(secrets) => secrets,
        Err(e) if config.dev_mode => {
            warn!(error = %e, "Using an ephemeral secrets key (dev mode)");
            SecretBox::ephemeral()
        }
        Err(e) => return Err(e.into()),
    };

    // Engine components
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    let channel = Arc::new(DispatchChannel::new(store.clone()));
    let registry = Arc::new(NodeRegistry::new(
        store.clone(),
        channel.clone(),
        notifier.clone(),
        config.registry.clone(),
    ));
    let scheduler = Arc::new(FleetScheduler::new(
        store.clone(),
        registry.clone(),
        channel.clone(),
        secrets.clone(),
    ));
    let webhooks = Arc::new(WebhookIngest::new(
        store.clone(),
        scheduler.clone(),
        secrets,
    ));
    let billing = Arc::new(BillingEngine::new(
        store.clone(),
        channel.clone(),
        notifier,
        config.billing.clone(),
    ));
    let backups = Arc::new(BackupScheduler::new(
        store,
        channel.clone(),
        config.backup.clone(),
    ));

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers: Vec<(&str, JoinHandle<()>)> = Vec::new();

    let liveness_worker = LivenessWorker::new(registry.clone(), config.liveness.clone());
    workers.push((
        "liveness",
        tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move { liveness_worker.run(shutdown_rx).await }
        }),
    ));

    let billing_worker = BillingWorker::new(billing);
    workers.push((
        "billing",
        tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move { billing_worker.run(shutdown_rx).await }
        }),
    ));

    let backup_worker = BackupWorker::new(backups);
    workers.push((
        "backup",
        tokio::spawn({
            let shutdown_rx = shutdown_rx.clone();
            async move { backup_worker.run(shutdown_rx).await }
        }),
    ));

    // Create application state
    let state = AppState::new(db, registry, channel, scheduler, webhooks);

    // Build and run the server
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    // Spawn the server with graceful shutdown
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    // Signal shutdown to all workers
    let _ = shutdown_tx.send(true);

    // Wait for workers to finish
    info!("Waiting for workers to shut down...");
    let shutdown_timeout = Duration::from_secs(10);

    for (name, handle) in workers {
        if let Err(e) = tokio::time::timeout(shutdown_timeout, handle).await {
            warn!(worker = name, error = %e, "Worker did not shut down in time");
        }
    }

    info!("Control plane shutdown complete");
    Ok(())
}
