//! Metering and billing passes.
//!
//! Each pass walks every billable resource, charges whole elapsed hours
//! against the organization's wallet, and reacts to the outcome:
//!
//! - charged: resume the resource if it was suspended, then check the
//!   organization's spending threshold
//! - not collected: raise a `ChargeFailed` alert, suspend the resource (and
//!   its running siblings when configured), and stop it on its node
//!
//! Settlement and cursor movement happen in one store transaction. Passes
//! for the same organization are additionally serialized in-process so the
//! suspend/resume side effects of two overlapping passes never interleave.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Datelike, Utc};
use fleet_events::{Alert, ResourceStatus, TaskEnvelope, TaskType};
use fleet_id::OrgId;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use super::meter::compute_charge;
use crate::dispatch::{DispatchChannel, DispatchError};
use crate::notify::Notifier;
use crate::store::{BillableResource, Charge, ResourceRef, Settlement, Store, StoreError};

/// Ledger failure reason when the wallet did not cover the charge.
pub const INSUFFICIENT_FUNDS: &str = "insufficient_funds";

/// Ledger failure reason prefix when settlement itself failed.
pub const PROVIDER_FAILURE: &str = "provider_failure";

#[derive(Debug, Error)]
pub enum BillingError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub interval: Duration,
    /// Hourly rate for databases created without a plan.
    pub default_database_hourly_rate: Decimal,
    /// Suspend every running resource of the organization when one charge
    /// fails, not just the resource that was charged.
    pub suspend_org_on_failed_charge: bool,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            default_database_hourly_rate: Decimal::new(5, 3),
            suspend_org_on_failed_charge: true,
        }
    }
}

/// Counters for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BillingStats {
    pub charged: usize,
    pub skipped: usize,
    pub failed: usize,
    pub suspended: usize,
    pub resumed: usize,
}

pub struct BillingEngine {
    store: Arc<dyn Store>,
    channel: Arc<DispatchChannel>,
    notifier: Arc<dyn Notifier>,
    config: BillingConfig,
    org_locks: Mutex<HashMap<OrgId, Arc<tokio::sync::Mutex<()>>>>,
}

impl BillingEngine {
    pub fn new(
        store: Arc<dyn Store>,
        channel: Arc<DispatchChannel>,
        notifier: Arc<dyn Notifier>,
        config: BillingConfig,
    ) -> Self {
        Self {
            store,
            channel,
            notifier,
            config,
            org_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BillingConfig {
        &self.config
    }

    fn org_lock(&self, org_id: OrgId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .org_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(org_id).or_default().clone()
    }

    /// Drop the organization's lock entry once nobody holds or awaits it.
    fn release_org_lock(&self, org_id: OrgId, lock: Arc<tokio::sync::Mutex<()>>) {
        drop(lock);
        let mut locks = self
            .org_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if locks
            .get(&org_id)
            .is_some_and(|l| Arc::strong_count(l) == 1)
        {
            locks.remove(&org_id);
        }
    }

    #[cfg(test)]
    fn tracked_org_locks(&self) -> usize {
        self.org_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub async fn run_pass(&self) -> BillingResult<BillingStats> {
        self.run_pass_at(Utc::now()).await
    }

    /// Bill every resource in a billable status as of `now`.
    #[instrument(skip(self))]
    pub async fn run_pass_at(&self, now: DateTime<Utc>) -> BillingResult<BillingStats> {
        let resources = self.store.list_billable().await?;
        let mut stats = BillingStats::default();

        for resource in resources {
            if let Err(e) = self.bill_resource(&resource, now, &mut stats).await {
                error!(
                    org_id = %resource.org_id,
                    resource_id = %resource.resource,
                    error = %e,
                    "billing failed for resource"
                );
            }
        }

        info!(
            charged = stats.charged,
            skipped = stats.skipped,
            failed = stats.failed,
            suspended = stats.suspended,
            resumed = stats.resumed,
            "billing pass complete"
        );
        Ok(stats)
    }

    async fn bill_resource(
        &self,
        resource: &BillableResource,
        now: DateTime<Utc>,
        stats: &mut BillingStats,
    ) -> BillingResult<()> {
        let Some(charge) =
            compute_charge(resource, self.config.default_database_hourly_rate, now)
        else {
            stats.skipped += 1;
            return Ok(());
        };

        let lock = self.org_lock(resource.org_id);
        let settled = {
            let _guard = lock.lock().await;
            self.settle(resource, &charge, now, stats).await
        };
        self.release_org_lock(resource.org_id, lock);
        settled
    }

    /// Settle one charge and react to the outcome. Runs under the org lock.
    async fn settle(
        &self,
        resource: &BillableResource,
        charge: &Charge,
        now: DateTime<Utc>,
        stats: &mut BillingStats,
    ) -> BillingResult<()> {
        match self.store.settle_charge(charge, now).await {
            Ok(Settlement::Charged {
                entry,
                balance_after,
            }) => {
                stats.charged += 1;
                debug!(
                    org_id = %entry.org_id,
                    resource_id = %entry.resource_id,
                    amount = %entry.amount,
                    hours = entry.hours,
                    "charge settled"
                );
                // Re-read: an earlier failure in this pass may have suspended it.
                let status = self.current_status(&resource.resource).await?;
                if status == Some(ResourceStatus::Suspended) && self.resume(resource, now).await? {
                    stats.resumed += 1;
                }
                self.check_spending(resource.org_id, balance_after, now)
                    .await?;
            }
            Ok(Settlement::InsufficientFunds { balance, .. }) => {
                stats.failed += 1;
                stats.suspended += self
                    .handle_failed_charge(resource, charge, Some(balance), INSUFFICIENT_FUNDS, now)
                    .await?;
            }
            Ok(Settlement::Stale) => {
                stats.skipped += 1;
                debug!(resource_id = %resource.resource, "window already billed");
            }
            Err(e) => {
                let reason = format!("{PROVIDER_FAILURE}: {e}");
                warn!(resource_id = %resource.resource, error = %e, "settlement failed");
                match self.store.record_failed_charge(charge, &reason, now).await? {
                    Some(_) => {
                        stats.failed += 1;
                        stats.suspended += self
                            .handle_failed_charge(resource, charge, None, &reason, now)
                            .await?;
                    }
                    None => stats.skipped += 1,
                }
            }
        }
        Ok(())
    }

    async fn current_status(&self, resource: &ResourceRef) -> BillingResult<Option<ResourceStatus>> {
        Ok(match resource {
            ResourceRef::Application(id) => self.store.get_application(*id).await?.map(|a| a.status),
            ResourceRef::Database(id) => self.store.get_database(*id).await?.map(|d| d.status),
        })
    }

    /// Alert, then suspend and stop the affected resources. Returns how many
    /// resources were newly suspended.
    async fn handle_failed_charge(
        &self,
        resource: &BillableResource,
        charge: &Charge,
        balance: Option<Decimal>,
        reason: &str,
        now: DateTime<Utc>,
    ) -> BillingResult<usize> {
        warn!(
            org_id = %charge.org_id,
            resource_id = %charge.resource,
            amount = %charge.amount,
            reason,
            "charge failed"
        );
        self.notifier
            .notify(Alert::ChargeFailed {
                org_id: charge.org_id,
                resource_kind: charge.resource.kind(),
                resource_id: charge.resource.id_string(),
                amount: charge.amount,
                balance,
                reason: reason.to_string(),
                at: now,
            })
            .await;

        let targets = if self.config.suspend_org_on_failed_charge {
            self.store.list_org_billable(resource.org_id).await?
        } else {
            vec![resource.clone()]
        };

        let mut suspended = 0;
        for target in targets {
            if target.status != ResourceStatus::Running {
                continue;
            }
            self.suspend(&target, now).await?;
            suspended += 1;
        }
        Ok(suspended)
    }

    async fn suspend(&self, target: &BillableResource, now: DateTime<Utc>) -> BillingResult<()> {
        self.store
            .set_status(&target.resource, ResourceStatus::Suspended, now)
            .await?;
        info!(org_id = %target.org_id, resource_id = %target.resource, "resource suspended");

        if let Some(node_id) = target.node_id {
            if self.channel.is_online(node_id) {
                self.channel
                    .dispatch(node_id, stop_task(&target.resource))
                    .await?;
            }
        }
        Ok(())
    }

    /// Restart a suspended resource on its node. A resource whose node
    /// cannot take the task is parked as `stopped` so it stops accruing.
    async fn resume(&self, resource: &BillableResource, now: DateTime<Utc>) -> BillingResult<bool> {
        let delivered = match resource.node_id {
            Some(node_id) => {
                self.channel
                    .dispatch(
                        node_id,
                        TaskEnvelope::new(
                            TaskType::Start,
                            resource.resource.kind(),
                            resource.resource.id_string(),
                        ),
                    )
                    .await?
            }
            None => false,
        };

        if delivered {
            self.store
                .set_status(&resource.resource, ResourceStatus::Running, now)
                .await?;
            info!(org_id = %resource.org_id, resource_id = %resource.resource, "resource resumed");
        } else {
            self.store
                .set_status(&resource.resource, ResourceStatus::Stopped, now)
                .await?;
            warn!(
                org_id = %resource.org_id,
                resource_id = %resource.resource,
                "resume undeliverable, resource stopped"
            );
        }
        Ok(delivered)
    }

    /// Raise a spending alert when the balance fell below the organization's
    /// threshold, at most once per calendar month.
    async fn check_spending(
        &self,
        org_id: OrgId,
        balance: Decimal,
        now: DateTime<Utc>,
    ) -> BillingResult<()> {
        let Some(alert) = self.store.spending_alert(org_id).await? else {
            return Ok(());
        };
        if balance >= alert.threshold {
            return Ok(());
        }
        if alert
            .last_notified_at
            .is_some_and(|at| same_month(at, now))
        {
            return Ok(());
        }

        self.notifier
            .notify(Alert::SpendingThreshold {
                org_id,
                threshold: alert.threshold,
                balance,
                at: now,
            })
            .await;
        self.store.mark_spending_alert_notified(org_id, now).await?;
        info!(org_id = %org_id, threshold = %alert.threshold, balance = %balance, "spending alert sent");
        Ok(())
    }
}

fn stop_task(resource: &ResourceRef) -> TaskEnvelope {
    TaskEnvelope::new(TaskType::Stop, resource.kind(), resource.id_string())
}

fn same_month(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
    a.year() == b.year() && a.month() == b.month()
}
