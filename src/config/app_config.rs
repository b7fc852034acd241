use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use super::validation::{parse_bool, parse_duration, validate_bind_address};
use crate::core::cluster::{BackendKind, Identity, LeaseTiming, LockConfig};
use crate::core::logging::LogFormat;
use crate::error::{AppError, Result};
use crate::presentation::ServerBinding;

/// Leader election settings
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    /// Whether to contest a lock before running the descheduler
    pub leader_elect: bool,
    /// Lock backend
    pub resource_lock: BackendKind,
    pub resource_namespace: String,
    pub resource_name: String,
    /// Directory shared by all replicas for the file backend
    pub lock_dir: PathBuf,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        let timing = LeaseTiming::default();
        Self {
            leader_elect: true,
            resource_lock: BackendKind::File,
            resource_namespace: "fleet-system".to_string(),
            resource_name: "fleet-descheduler".to_string(),
            lock_dir: PathBuf::from("/var/run/fleet-descheduler"),
            lease_duration: timing.lease_duration,
            renew_deadline: timing.renew_deadline,
            retry_period: timing.retry_period,
        }
    }
}

impl LeaderElectionConfig {
    pub fn timing(&self) -> LeaseTiming {
        LeaseTiming {
            lease_duration: self.lease_duration,
            renew_deadline: self.renew_deadline,
            retry_period: self.retry_period,
        }
    }

    pub fn lock_config(&self, identity: Identity) -> LockConfig {
        LockConfig {
            kind: self.resource_lock,
            namespace: self.resource_namespace.clone(),
            name: self.resource_name.clone(),
            identity,
        }
    }
}

/// Descheduler process configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub leader_election: LeaderElectionConfig,
    /// `"0"` disables the health listener
    pub health_probe_bind_address: String,
    /// `"0"` disables the metrics listener
    pub metrics_bind_address: String,
    pub descheduling_interval: Duration,
    pub log_format: LogFormat,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            leader_election: LeaderElectionConfig::default(),
            health_probe_bind_address: ":10358".to_string(),
            metrics_bind_address: ":8080".to_string(),
            descheduling_interval: Duration::from_secs(120),
            log_format: LogFormat::Compact,
        }
    }
}

impl AppConfig {
    /// Load from the process environment and validate.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup and validate. Missing keys keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();
        let le = &mut config.leader_election;

        if let Some(value) = lookup("LEADER_ELECT") {
            le.leader_elect = parse_bool("LEADER_ELECT", &value)?;
        }
        if let Some(value) = lookup("LEADER_ELECT_RESOURCE_LOCK") {
            le.resource_lock = value.parse()?;
        }
        if let Some(value) = lookup("LEADER_ELECT_RESOURCE_NAMESPACE") {
            le.resource_namespace = value;
        }
        if let Some(value) = lookup("LEADER_ELECT_RESOURCE_NAME") {
            le.resource_name = value;
        }
        if let Some(value) = lookup("LEADER_ELECT_LOCK_DIR") {
            le.lock_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup("LEADER_ELECT_LEASE_DURATION") {
            le.lease_duration = parse_duration(&value)?;
        }
        if let Some(value) = lookup("LEADER_ELECT_RENEW_DEADLINE") {
            le.renew_deadline = parse_duration(&value)?;
        }
        if let Some(value) = lookup("LEADER_ELECT_RETRY_PERIOD") {
            le.retry_period = parse_duration(&value)?;
        }

        if let Some(value) = lookup("HEALTH_PROBE_BIND_ADDRESS") {
            config.health_probe_bind_address = value;
        }
        if let Some(value) = lookup("METRICS_BIND_ADDRESS") {
            config.metrics_bind_address = value;
        }
        if let Some(value) = lookup("DESCHEDULING_INTERVAL") {
            config.descheduling_interval = parse_duration(&value)?;
        }
        if let Some(value) = lookup("LOG_FORMAT") {
            config.log_format = value.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the whole configuration, reporting every problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        let le = &self.leader_election;

        if le.leader_elect {
            if let Err(e) = le.timing().validate() {
                errors.push(e.to_string());
            }
            if le.resource_namespace.trim().is_empty() {
                errors.push("LEADER_ELECT_RESOURCE_NAMESPACE must not be empty".to_string());
            }
            if le.resource_name.trim().is_empty() {
                errors.push("LEADER_ELECT_RESOURCE_NAME must not be empty".to_string());
            }
        }

        for (key, address) in [
            ("HEALTH_PROBE_BIND_ADDRESS", &self.health_probe_bind_address),
            ("METRICS_BIND_ADDRESS", &self.metrics_bind_address),
        ] {
            if let Err(e) = validate_bind_address(key, address) {
                errors.push(e.to_string());
            }
        }

        if self.descheduling_interval.is_zero() {
            errors.push("DESCHEDULING_INTERVAL must be greater than zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AppError::ConfigError(errors.join("; ")))
        }
    }

    pub fn health_binding(&self) -> ServerBinding {
        ServerBinding::healthz(self.health_probe_bind_address.clone())
    }

    pub fn metrics_binding(&self) -> ServerBinding {
        ServerBinding::metrics(self.metrics_bind_address.clone())
    }

    pub fn log_summary(&self) {
        let le = &self.leader_election;
        info!(
            leader_elect = le.leader_elect,
            resource_lock = %le.resource_lock,
            lease = %format!("{}/{}", le.resource_namespace, le.resource_name),
            lease_duration = ?le.lease_duration,
            renew_deadline = ?le.renew_deadline,
            retry_period = ?le.retry_period,
            health_probe_bind_address = %self.health_probe_bind_address,
            metrics_bind_address = %self.metrics_bind_address,
            descheduling_interval = ?self.descheduling_interval,
            "Loaded configuration"
        );
    }
}
