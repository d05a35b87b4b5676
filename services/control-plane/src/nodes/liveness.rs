//! Liveness background worker.
//!
//! Sweeps for nodes whose heartbeats stopped on a fixed interval.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::NodeRegistry;

#[derive(Debug, Clone)]
pub struct LivenessConfig {
    pub sweep_interval: Duration,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
        }
    }
}

/// Runs [`NodeRegistry::mark_offline_nodes`] until shutdown is signaled.
pub struct LivenessWorker {
    registry: Arc<NodeRegistry>,
    config: LivenessConfig,
}

impl LivenessWorker {
    pub fn new(registry: Arc<NodeRegistry>, config: LivenessConfig) -> Self {
        Self { registry, config }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.sweep_interval.as_secs(),
            offline_threshold_secs = self.registry.config().offline_threshold.as_secs(),
            "Starting liveness worker"
        );

        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Liveness worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    async fn sweep(&self) {
        match self.registry.mark_offline_nodes().await {
            Ok(0) => {}
            Ok(count) => info!(marked_offline = count, "Liveness sweep complete"),
            Err(e) => error!(error = %e, "Liveness sweep failed"),
        }
    }
}
