//! Binds leadership transitions to the descheduler main loop
//!
//! The main loop only runs while leadership is held. Losing leadership, or the
//! main loop returning on its own, is reported as fatal; the orchestrator is
//! expected to restart the process, which then re-enters the election.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::core::cluster::{LeaderContext, LeadershipHandler, StopReason};
use crate::core::observability::MetricsRegistry;
use crate::core::shutdown::FatalHandle;
use crate::error::{AppError, Result};

/// The long-running work activated on the leader
#[async_trait]
pub trait MainLoop: Send + Sync + 'static {
    /// Run until `cancel` fires. Returning early is treated as a fault.
    async fn run(&self, cancel: CancellationToken);
}

/// Leadership handler driving a [`MainLoop`]
pub struct Activation {
    main_loop: Arc<dyn MainLoop>,
    fatal: FatalHandle,
}

impl Activation {
    pub fn new(main_loop: Arc<dyn MainLoop>, fatal: FatalHandle) -> Self {
        Self { main_loop, fatal }
    }
}

#[async_trait]
impl LeadershipHandler for Activation {
    async fn on_started_leading(&self, ctx: LeaderContext) {
        info!(identity = %ctx.identity, lease = %ctx.lease, "Started leading, running descheduler");
        self.main_loop.run(ctx.cancel.clone()).await;

        if !ctx.cancel.is_cancelled() {
            self.fatal.escalate(AppError::MainLoopExited);
        }
    }

    fn on_stopped_leading(&self, reason: StopReason) {
        match reason {
            StopReason::Lost => {
                error!("Leader election lost");
                self.fatal.escalate(AppError::LeadershipLost);
            }
            StopReason::Cancelled => {
                info!("Stopped leading after shutdown request");
            }
        }
    }

    fn on_new_leader(&self, identity: &str) {
        debug!(leader = identity, "Leadership observed");
    }
}

/// Run the main loop directly when leader election is disabled.
///
/// The loop is expected to run forever; a return without a shutdown request
/// is an error.
pub async fn run_without_election(main_loop: Arc<dyn MainLoop>, shutdown: CancellationToken) -> Result<()> {
    info!("Leader election disabled, running descheduler directly");
    main_loop.run(shutdown.clone()).await;

    if shutdown.is_cancelled() {
        Ok(())
    } else {
        Err(AppError::MainLoopExited)
    }
}

/// Main loop that performs one descheduling pass per interval
///
/// The eviction decisions themselves belong to the scheduler estimator
/// integration; this loop owns cadence, cancellation and accounting.
pub struct DeschedulerLoop {
    interval: Duration,
    metrics: Arc<MetricsRegistry>,
}

impl DeschedulerLoop {
    pub fn new(interval: Duration, metrics: Arc<MetricsRegistry>) -> Self {
        Self { interval, metrics }
    }
}

#[async_trait]
impl MainLoop for DeschedulerLoop {
    async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Descheduler stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.metrics.record_loop_pass();
                    debug!(passes = self.metrics.loop_passes(), "Descheduling pass completed");
                }
            }
        }
    }
}
