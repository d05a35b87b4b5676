//! Billing background worker.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::BillingEngine;

/// Runs [`BillingEngine::run_pass`] on the configured interval until
/// shutdown is signaled.
pub struct BillingWorker {
    engine: Arc<BillingEngine>,
}

impl BillingWorker {
    pub fn new(engine: Arc<BillingEngine>) -> Self {
        Self { engine }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let period = self.engine.config().interval;
        info!(interval_secs = period.as_secs(), "Starting billing worker");

        let mut interval = tokio::time::interval(period);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.engine.run_pass().await {
                        error!(error = %e, "Billing pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Billing worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
