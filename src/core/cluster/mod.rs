//! Singleton activation across replicas
//!
//! This module contains the process identity, the resource lock abstraction
//! with its backends, and the lease-based leader elector built on top of them.

pub mod file_lock;
pub mod identity;
pub mod leader_election;
pub mod memory_lock;
pub mod resource_lock;

// Re-export commonly used types
pub use file_lock::FileLock;
pub use identity::Identity;
pub use leader_election::{
    ElectionOutcome, LeaderContext, LeaderElector, LeaderState, LeadershipHandler, LeaseTiming,
    StopReason,
};
pub use memory_lock::{InMemoryLock, InMemoryLockStore};
pub use resource_lock::{
    new_resource_lock, BackendKind, LockConfig, LockError, LockRecord, LockResult, ResourceLock,
    VersionedRecord,
};
