//! File-backed lock backend
//!
//! The record is stored as JSON at `<dir>/<namespace>/<name>.json`. Every
//! read-check-write sequence runs under an exclusive advisory lock on a
//! sibling `.lock` file, so conditional create and update hold across
//! processes sharing the directory.

use async_trait::async_trait;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::resource_lock::{LockError, LockRecord, LockResult, ResourceLock, VersionedRecord};
use crate::error::{AppError, Result};

/// Pause between attempts to take a contended guard file.
const GUARD_RETRY_INTERVAL: Duration = Duration::from_millis(10);
/// Attempts before a contended guard is reported as a transient failure.
const GUARD_ATTEMPTS: u32 = 50;

/// Lock record persisted in a shared directory
#[derive(Debug, Clone)]
pub struct FileLock {
    record_path: PathBuf,
    guard_path: PathBuf,
    key: String,
}

impl FileLock {
    /// Create a handle for `(namespace, name)` under `dir`, creating the
    /// namespace directory if needed.
    pub fn new(dir: &Path, namespace: &str, name: &str) -> Result<Self> {
        let namespace_dir = dir.join(namespace);
        fs::create_dir_all(&namespace_dir).map_err(|e| {
            AppError::ConfigError(format!(
                "failed to create lock directory '{}': {}",
                namespace_dir.display(),
                e
            ))
        })?;

        Ok(Self {
            record_path: namespace_dir.join(format!("{}.json", name)),
            guard_path: namespace_dir.join(format!("{}.json.lock", name)),
            key: format!("{}/{}", namespace, name),
        })
    }

    pub fn record_path(&self) -> &Path {
        &self.record_path
    }

    /// Run `op` on a blocking thread while holding the exclusive guard.
    async fn with_guard<T, F>(&self, op: F) -> LockResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&FileLock) -> LockResult<T> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || {
            let guard = this.acquire_guard()?;
            let result = op(&this);
            if let Err(e) = FileExt::unlock(&guard) {
                debug!(lock = %this.key, error = %e, "Failed to unlock guard file");
            }
            result
        })
        .await
        .map_err(|e| LockError::Transient(format!("lock task failed: {}", e)))?
    }

    fn acquire_guard(&self) -> LockResult<File> {
        let guard = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.guard_path)
            .map_err(|e| {
                LockError::Transient(format!(
                    "failed to open '{}': {}",
                    self.guard_path.display(),
                    e
                ))
            })?;

        for attempt in 1..=GUARD_ATTEMPTS {
            match guard.try_lock_exclusive() {
                Ok(()) => return Ok(guard),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if attempt < GUARD_ATTEMPTS {
                        std::thread::sleep(GUARD_RETRY_INTERVAL);
                    }
                }
                Err(e) => {
                    return Err(LockError::Transient(format!(
                        "failed to lock '{}': {}",
                        self.guard_path.display(),
                        e
                    )))
                }
            }
        }

        Err(LockError::Transient(format!(
            "'{}' is held by another process",
            self.guard_path.display()
        )))
    }

    fn read_record(&self) -> LockResult<Option<VersionedRecord>> {
        if !self.record_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.record_path).map_err(|e| {
            LockError::Transient(format!(
                "failed to read '{}': {}",
                self.record_path.display(),
                e
            ))
        })?;

        let record = serde_json::from_str(&content).map_err(|e| {
            LockError::Transient(format!(
                "failed to parse '{}': {}",
                self.record_path.display(),
                e
            ))
        })?;

        Ok(Some(record))
    }

    fn write_record(&self, record: &VersionedRecord) -> LockResult<()> {
        let content = serde_json::to_string_pretty(record)
            .map_err(|e| LockError::Transient(format!("failed to encode record: {}", e)))?;

        // Readers never observe a partially written record.
        let staging = self.record_path.with_extension("json.tmp");
        fs::write(&staging, content)
            .and_then(|_| fs::rename(&staging, &self.record_path))
            .map_err(|e| {
                LockError::Transient(format!(
                    "failed to write '{}': {}",
                    self.record_path.display(),
                    e
                ))
            })
    }
}

#[async_trait]
impl ResourceLock for FileLock {
    async fn get(&self) -> LockResult<Option<VersionedRecord>> {
        self.with_guard(|lock| lock.read_record()).await
    }

    async fn create(&self, record: &LockRecord) -> LockResult<VersionedRecord> {
        let record = record.clone();
        self.with_guard(move |lock| {
            if lock.read_record()?.is_some() {
                return Err(LockError::Conflict(lock.key.clone()));
            }

            let stored = VersionedRecord { record, version: 1 };
            lock.write_record(&stored)?;
            Ok(stored)
        })
        .await
    }

    async fn update(&self, record: &LockRecord, version: u64) -> LockResult<VersionedRecord> {
        let record = record.clone();
        self.with_guard(move |lock| {
            let current = lock
                .read_record()?
                .ok_or_else(|| LockError::NotFound(lock.key.clone()))?;

            if current.version != version {
                return Err(LockError::Conflict(lock.key.clone()));
            }

            let stored = VersionedRecord {
                record,
                version: current.version + 1,
            };
            lock.write_record(&stored)?;
            Ok(stored)
        })
        .await
    }

    fn describe(&self) -> String {
        self.key.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn record(holder: &str) -> LockRecord {
        LockRecord {
            holder_identity: holder.to_string(),
            lease_duration_seconds: 15,
            acquire_time: Utc::now(),
            renew_time: Utc::now(),
            leader_transitions: 0,
        }
    }

    #[tokio::test]
    async fn test_file_lock_conditional_writes() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path(), "fleet-system", "descheduler").unwrap();

        assert!(lock.get().await.unwrap().is_none());
        let created = lock.create(&record("a")).await.unwrap();
        assert_eq!(created.version, 1);
        assert!(lock.record_path().exists());

        assert!(matches!(
            lock.create(&record("b")).await,
            Err(LockError::Conflict(_))
        ));

        let updated = lock.update(&record("b"), 1).await.unwrap();
        assert_eq!(updated.version, 2);
        assert!(matches!(
            lock.update(&record("c"), 1).await,
            Err(LockError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_handles_on_same_directory_see_each_other() {
        let dir = TempDir::new().unwrap();
        let first = FileLock::new(dir.path(), "ns", "name").unwrap();
        let second = FileLock::new(dir.path(), "ns", "name").unwrap();

        first.create(&record("a")).await.unwrap();
        let seen = second.get().await.unwrap().unwrap();
        assert_eq!(seen.record.holder_identity, "a");
        assert_eq!(seen.version, 1);
    }

    #[tokio::test]
    async fn test_update_missing_record_is_not_found() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path(), "ns", "name").unwrap();
        assert!(matches!(
            lock.update(&record("a"), 1).await,
            Err(LockError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_record_is_transient() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path(), "ns", "name").unwrap();
        fs::write(lock.record_path(), "not json").unwrap();
        assert!(matches!(lock.get().await, Err(LockError::Transient(_))));
    }

    #[tokio::test]
    async fn test_contended_guard_gives_up_as_transient() {
        let dir = TempDir::new().unwrap();
        let lock = FileLock::new(dir.path(), "ns", "name").unwrap();
        lock.create(&record("a")).await.unwrap();

        let holder = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock.guard_path)
            .unwrap();
        holder.try_lock_exclusive().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), lock.get())
            .await
            .expect("contended guard must not block indefinitely");
        assert!(matches!(result, Err(LockError::Transient(_))));

        FileExt::unlock(&holder).unwrap();
        let seen = lock.get().await.unwrap().unwrap();
        assert_eq!(seen.record.holder_identity, "a");
    }
}
