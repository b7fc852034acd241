#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleet_descheduler::core::cluster::{
    BackendKind, Identity, LeaderElector, LeaseTiming, LockConfig, ResourceLock,
};

// Test utilities and common setup
pub mod mocks;

pub use mocks::*;

pub const NAMESPACE: &str = "fleet-system";
pub const LEASE_NAME: &str = "fleet-descheduler";

/// Fast timings for tests running against the real clock.
pub fn fast_timing() -> LeaseTiming {
    LeaseTiming {
        lease_duration: Duration::from_millis(1500),
        renew_deadline: Duration::from_millis(1000),
        retry_period: Duration::from_millis(100),
    }
}

pub fn lock_config(kind: BackendKind, host: &str) -> LockConfig {
    LockConfig {
        kind,
        namespace: NAMESPACE.to_string(),
        name: LEASE_NAME.to_string(),
        identity: Identity::for_host(host),
    }
}

pub fn elector(host: &str, timing: LeaseTiming, lock: Arc<dyn ResourceLock>) -> Arc<LeaderElector> {
    let elector = LeaderElector::new(lock_config(BackendKind::Memory, host), timing, lock)
        .expect("valid timing");
    Arc::new(elector)
}
