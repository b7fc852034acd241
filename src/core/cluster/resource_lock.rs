//! Resource lock abstraction contested by leader election
//!
//! A resource lock is a single keyed record `(namespace, name)` living in an
//! external store that supports optimistic concurrency. The elector only ever
//! interprets four outcomes of a backend call: success, conflict, not found
//! and transient failure.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use super::file_lock::FileLock;
use super::identity::Identity;
use super::memory_lock::InMemoryLockStore;
use crate::error::{AppError, Result};

/// Errors reported by a lock backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LockError {
    /// The record changed since it was read, or already exists on create
    #[error("conflicting write on {0}")]
    Conflict(String),

    /// The record does not exist
    #[error("lock record {0} not found")]
    NotFound(String),

    /// Any other backend failure; safe to retry
    #[error("transient backend failure: {0}")]
    Transient(String),
}

pub type LockResult<T> = std::result::Result<T, LockError>;

/// Lock record owned by the backend and contested by all replicas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    /// Identity of the current holder; empty when released
    pub holder_identity: String,
    /// Lease duration the holder declared, in seconds
    pub lease_duration_seconds: u64,
    /// When the current holder acquired the lock
    pub acquire_time: DateTime<Utc>,
    /// Last successful renewal by the current holder
    pub renew_time: DateTime<Utc>,
    /// Number of times the holder changed
    #[serde(default)]
    pub leader_transitions: u32,
}

impl LockRecord {
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_seconds)
    }

    pub fn is_held_by(&self, identity: &Identity) -> bool {
        self.holder_identity == identity.as_str()
    }

    pub fn is_released(&self) -> bool {
        self.holder_identity.is_empty()
    }
}

/// A lock record together with the backend version it was read at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionedRecord {
    pub record: LockRecord,
    pub version: u64,
}

/// Keyed, optimistically-concurrent record store
#[async_trait]
pub trait ResourceLock: Send + Sync {
    /// Read the current record, `None` when absent.
    async fn get(&self) -> LockResult<Option<VersionedRecord>>;

    /// Create the record; `Conflict` when it already exists.
    async fn create(&self, record: &LockRecord) -> LockResult<VersionedRecord>;

    /// Replace the record if it is still at `version`.
    async fn update(&self, record: &LockRecord, version: u64) -> LockResult<VersionedRecord>;

    /// Human readable `namespace/name` of the lock.
    fn describe(&self) -> String;
}

/// Supported lock backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Process-local store, only meaningful for a single replica
    Memory,
    /// JSON record in a directory shared by all replicas
    File,
}

impl FromStr for BackendKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "file" => Ok(BackendKind::File),
            other => Err(AppError::ConfigError(format!(
                "unsupported resource lock type {:?}, expected \"memory\" or \"file\"",
                other
            ))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Memory => f.write_str("memory"),
            BackendKind::File => f.write_str("file"),
        }
    }
}

/// Which lock record this process contests
#[derive(Debug, Clone)]
pub struct LockConfig {
    pub kind: BackendKind,
    pub namespace: String,
    pub name: String,
    pub identity: Identity,
}

impl LockConfig {
    pub fn describe(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

/// Build the resource lock backend selected by `config`.
pub fn new_resource_lock(config: &LockConfig, lock_dir: &Path) -> Result<Arc<dyn ResourceLock>> {
    if config.namespace.is_empty() || config.name.is_empty() {
        return Err(AppError::ConfigError(
            "resource lock namespace and name must not be empty".to_string(),
        ));
    }

    let lock: Arc<dyn ResourceLock> = match config.kind {
        BackendKind::Memory => Arc::new(InMemoryLockStore::new().lock(&config.namespace, &config.name)),
        BackendKind::File => Arc::new(FileLock::new(lock_dir, &config.namespace, &config.name)?),
    };

    Ok(lock)
}
