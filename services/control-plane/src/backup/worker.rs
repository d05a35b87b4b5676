//! Backup background worker.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::BackupScheduler;

/// Runs [`BackupScheduler::tick`] on the configured interval until shutdown
/// is signaled.
pub struct BackupWorker {
    scheduler: Arc<BackupScheduler>,
}

impl BackupWorker {
    pub fn new(scheduler: Arc<BackupScheduler>) -> Self {
        Self { scheduler }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.scheduler.config().interval;
        info!(interval_secs = period.as_secs(), "Starting backup worker");

        let mut interval = tokio::time::interval(period);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.scheduler.tick().await {
                        error!(error = %e, "Backup tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Backup worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
