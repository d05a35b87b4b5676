//! Alert delivery.
//!
//! Components raise [`Alert`]s through a [`Notifier`]. Delivery is
//! fire-and-forget: a notifier never fails the operation that raised the
//! alert.

use std::sync::Mutex;

use async_trait::async_trait;
use fleet_events::Alert;
use tracing::warn;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: Alert);
}

/// Emits every alert as a structured `warn` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: Alert) {
        let payload = serde_json::to_string(&alert).unwrap_or_default();
        warn!(kind = alert.kind(), alert = %payload, "alert raised");
    }
}

/// Collects alerts in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Alerts raised so far, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().map(|a| a.clone()).unwrap_or_default()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.alerts().iter().filter(|a| a.kind() == kind).count()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, alert: Alert) {
        if let Ok(mut alerts) = self.alerts.lock() {
            alerts.push(alert);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_id::OrgId;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_memory_notifier_collects() {
        let notifier = MemoryNotifier::new();
        notifier
            .notify(Alert::SpendingThreshold {
                org_id: OrgId::new(),
                threshold: Decimal::TEN,
                balance: Decimal::ONE,
                at: Utc::now(),
            })
            .await;
        assert_eq!(notifier.count("spending_threshold"), 1);
        assert_eq!(notifier.count("node_capacity"), 0);
    }
}
