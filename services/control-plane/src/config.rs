use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;

use crate::backup::BackupConfig;
use crate::billing::BillingConfig;
use crate::db::DbConfig;
use crate::nodes::{LivenessConfig, RegistryConfig};

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    pub dev_mode: bool,
    /// `None` runs against the in-memory store (dev mode only).
    pub database: Option<DbConfig>,
    pub registry: RegistryConfig,
    pub liveness: LivenessConfig,
    pub billing: BillingConfig,
    pub backup: BackupConfig,
}

fn var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

fn secs(name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(var(name, default.as_secs())?))
}

fn mins(name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(var(name, default.as_secs() / 60)? * 60))
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let listen_addr = var("FLEET_LISTEN_ADDR", SocketAddr::from(([127, 0, 0, 1], 8080)))?;

        let log_level = std::env::var("FLEET_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let dev_mode = flag("FLEET_DEV", false);

        let database = DbConfig::from_env();

        let registry_defaults = RegistryConfig::default();
        let registry = RegistryConfig {
            registration_token_ttl: mins(
                "FLEET_REGISTRATION_TOKEN_TTL_MINS",
                registry_defaults.registration_token_ttl,
            )?,
            offline_threshold: secs(
                "FLEET_NODE_OFFLINE_THRESHOLD_SECS",
                registry_defaults.offline_threshold,
            )?,
            capacity_alert_ratio: var(
                "FLEET_CAPACITY_ALERT_RATIO",
                registry_defaults.capacity_alert_ratio,
            )?,
            capacity_alert_cooldown: mins(
                "FLEET_CAPACITY_ALERT_COOLDOWN_MINS",
                registry_defaults.capacity_alert_cooldown,
            )?,
        };

        let liveness = LivenessConfig {
            sweep_interval: secs(
                "FLEET_HEARTBEAT_SWEEP_SECS",
                LivenessConfig::default().sweep_interval,
            )?,
        };

        let billing_defaults = BillingConfig::default();
        let billing = BillingConfig {
            interval: secs("FLEET_BILLING_INTERVAL_SECS", billing_defaults.interval)?,
            default_database_hourly_rate: var::<Decimal>(
                "FLEET_DEFAULT_DATABASE_HOURLY_RATE",
                billing_defaults.default_database_hourly_rate,
            )?,
            suspend_org_on_failed_charge: flag(
                "FLEET_SUSPEND_ORG_ON_FAILED_CHARGE",
                billing_defaults.suspend_org_on_failed_charge,
            ),
        };

        let backup = BackupConfig {
            interval: secs(
                "FLEET_BACKUP_INTERVAL_SECS",
                BackupConfig::default().interval,
            )?,
        };

        Ok(Self {
            listen_addr,
            log_level,
            dev_mode,
            database,
            registry,
            liveness,
            billing,
            backup,
        })
    }
}
