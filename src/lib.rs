//! fleet-descheduler - singleton descheduler for a multi-cluster fleet
//!
//! Several replicas of the descheduler run at once; a lease-based leader
//! election makes sure only one of them drives the descheduling loop, while
//! every replica keeps serving liveness and metrics endpoints.

pub mod app;
pub mod config;
pub mod core;
pub mod error;
pub mod presentation;

// Re-export commonly used types
pub use error::{AppError, Result};
