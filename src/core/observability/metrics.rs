use prometheus::{Encoder, GaugeVec, IntCounter, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use crate::error::{AppError, Result};

static GLOBAL_REGISTRY: OnceLock<Arc<MetricsRegistry>> = OnceLock::new();

/// Process-wide metrics registry
///
/// Wraps a Prometheus registry together with the collectors this process
/// always exposes. Cloning the `Arc` is the only way components share it;
/// scrapes and updates are safe to run concurrently.
pub struct MetricsRegistry {
    registry: Registry,
    leader_status: GaugeVec,
    loop_passes: IntCounter,
}

impl MetricsRegistry {
    /// Create a standalone registry with the default collectors registered.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let build_info = IntGaugeVec::new(
            Opts::new(
                "fleet_descheduler_build_info",
                "A metric with a constant '1' value labeled by the build version.",
            ),
            &["version"],
        )?;
        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1);
        registry.register(Box::new(build_info))?;

        let leader_status = GaugeVec::new(
            Opts::new(
                "leader_election_master_status",
                "Gauge of if the reporting system is master of the relevant lease, \
                 0 indicates backup, 1 indicates master. 'name' is the string used to identify the lease.",
            ),
            &["name"],
        )?;
        registry.register(Box::new(leader_status.clone()))?;

        let loop_passes = IntCounter::new(
            "descheduler_loop_passes_total",
            "Number of completed descheduling passes.",
        )?;
        registry.register(Box::new(loop_passes.clone()))?;

        Ok(Self {
            registry,
            leader_status,
            loop_passes,
        })
    }

    /// Initialize the process-wide registry exactly once and return it.
    pub fn init_global() -> Result<Arc<Self>> {
        if let Some(existing) = GLOBAL_REGISTRY.get() {
            return Ok(existing.clone());
        }

        let created = Arc::new(Self::new()?);
        let registry = GLOBAL_REGISTRY.get_or_init(|| created).clone();
        info!("Metrics registry initialized");
        Ok(registry)
    }

    pub fn set_leader_status(&self, lease_name: &str, leading: bool) {
        let value = if leading { 1.0 } else { 0.0 };
        self.leader_status.with_label_values(&[lease_name]).set(value);
        debug!(lease = lease_name, leading = leading, "Updated leader status gauge");
    }

    pub fn leader_status(&self, lease_name: &str) -> f64 {
        self.leader_status.with_label_values(&[lease_name]).get()
    }

    pub fn record_loop_pass(&self) {
        self.loop_passes.inc();
    }

    pub fn loop_passes(&self) -> u64 {
        self.loop_passes.get()
    }

    /// Snapshot of all metrics in the text exposition format.
    pub fn gather_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;

        String::from_utf8(buffer)
            .map_err(|e| AppError::MetricsError(format!("exposition is not UTF-8: {}", e)))
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}
