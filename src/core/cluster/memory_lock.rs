//! In-memory lock backend
//!
//! Records live in a store shared by every handle created from it, which lets
//! several electors inside one process contest the same lock.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::resource_lock::{LockError, LockRecord, LockResult, ResourceLock, VersionedRecord};

type RecordKey = (String, String);

/// Shared in-process record store
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockStore {
    records: Arc<RwLock<HashMap<RecordKey, VersionedRecord>>>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle on the record `(namespace, name)` of this store.
    pub fn lock(&self, namespace: &str, name: &str) -> InMemoryLock {
        InMemoryLock {
            records: self.records.clone(),
            key: (namespace.to_string(), name.to_string()),
        }
    }
}

/// Lock handle backed by an [`InMemoryLockStore`]
#[derive(Debug, Clone)]
pub struct InMemoryLock {
    records: Arc<RwLock<HashMap<RecordKey, VersionedRecord>>>,
    key: RecordKey,
}

#[async_trait]
impl ResourceLock for InMemoryLock {
    async fn get(&self) -> LockResult<Option<VersionedRecord>> {
        let records = self.records.read().await;
        Ok(records.get(&self.key).cloned())
    }

    async fn create(&self, record: &LockRecord) -> LockResult<VersionedRecord> {
        let mut records = self.records.write().await;
        if records.contains_key(&self.key) {
            return Err(LockError::Conflict(self.describe()));
        }

        let stored = VersionedRecord {
            record: record.clone(),
            version: 1,
        };
        records.insert(self.key.clone(), stored.clone());
        Ok(stored)
    }

    async fn update(&self, record: &LockRecord, version: u64) -> LockResult<VersionedRecord> {
        let mut records = self.records.write().await;
        let current = records
            .get_mut(&self.key)
            .ok_or_else(|| LockError::NotFound(self.describe()))?;

        if current.version != version {
            return Err(LockError::Conflict(self.describe()));
        }

        current.record = record.clone();
        current.version += 1;
        Ok(current.clone())
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.key.0, self.key.1)
    }
}
