//! Core coordination logic
//!
//! Leader election and its lock backends live in `cluster`; `activation`
//! binds leadership to the descheduler main loop and `shutdown` owns fatal
//! error escalation.

pub mod activation;
pub mod cluster;
pub mod logging;
pub mod observability;
pub mod shutdown;

pub use activation::{run_without_election, Activation, DeschedulerLoop, MainLoop};
pub use cluster::{
    ElectionOutcome, Identity, LeaderElector, LeaderState, LeaseTiming, LeadershipHandler, StopReason,
};
pub use observability::MetricsRegistry;
pub use shutdown::{shutdown_signal, FatalHandle, Supervisor};
