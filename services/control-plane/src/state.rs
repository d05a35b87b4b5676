//! Application state shared across request handlers.

use std::sync::Arc;

use crate::db::Database;
use crate::dispatch::DispatchChannel;
use crate::nodes::NodeRegistry;
use crate::scheduler::FleetScheduler;
use crate::webhook::WebhookIngest;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    db: Option<Database>,
    registry: Arc<NodeRegistry>,
    channel: Arc<DispatchChannel>,
    scheduler: Arc<FleetScheduler>,
    webhooks: Arc<WebhookIngest>,
}

impl AppState {
    pub fn new(
        db: Option<Database>,
        registry: Arc<NodeRegistry>,
        channel: Arc<DispatchChannel>,
        scheduler: Arc<FleetScheduler>,
        webhooks: Arc<WebhookIngest>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                db,
                registry,
                channel,
                scheduler,
                webhooks,
            }),
        }
    }

    /// The Postgres pool, when not running on the in-memory store.
    pub fn db(&self) -> Option<&Database> {
        self.inner.db.as_ref()
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.inner.registry
    }

    pub fn channel(&self) -> &DispatchChannel {
        &self.inner.channel
    }

    pub fn scheduler(&self) -> &FleetScheduler {
        &self.inner.scheduler
    }

    pub fn webhooks(&self) -> &WebhookIngest {
        &self.inner.webhooks
    }
}
