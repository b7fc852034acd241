//! Process wiring
//!
//! Starts the health and metrics listeners, then either contests the leader
//! lease or runs the main loop directly, and finally blocks until a fatal
//! error or a shutdown signal arrives.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::core::activation::{run_without_election, Activation, MainLoop};
use crate::core::cluster::{new_resource_lock, Identity, LeaderElector, LeadershipHandler};
use crate::core::observability::MetricsRegistry;
use crate::core::shutdown::Supervisor;
use crate::error::Result;
use crate::presentation::ObservabilityServer;

/// Extra time on top of the renew deadline for in-flight work to wind down.
const SHUTDOWN_SLACK: Duration = Duration::from_secs(1);

/// Run the descheduler until `signal` resolves or an unrecoverable error is
/// reported.
///
/// Returns `Ok(())` on a clean shutdown and the fatal error otherwise; the
/// caller maps it to an exit code.
pub async fn run<F>(
    config: AppConfig,
    metrics: Arc<MetricsRegistry>,
    main_loop: Arc<dyn MainLoop>,
    signal: F,
) -> Result<()>
where
    F: Future<Output = ()>,
{
    let grace_period = config.leader_election.renew_deadline + SHUTDOWN_SLACK;
    let mut supervisor = Supervisor::new(grace_period);
    let shutdown = supervisor.shutdown_token();
    let fatal = supervisor.handle();

    let server = ObservabilityServer::new(metrics.clone(), shutdown.clone(), fatal.clone());
    let listeners = match server
        .serve(&config.health_binding(), &config.metrics_binding())
        .await
    {
        Ok(listeners) => listeners,
        Err(e) => {
            shutdown.cancel();
            return Err(e);
        }
    };

    let worker = if config.leader_election.leader_elect {
        match start_election(&config, metrics, main_loop, &supervisor) {
            Ok(worker) => worker,
            Err(e) => {
                shutdown.cancel();
                return Err(e);
            }
        }
    } else {
        start_without_election(main_loop, &supervisor)
    };

    let outcome = supervisor.wait(signal).await;

    if tokio::time::timeout(supervisor.grace_period(), worker).await.is_err() {
        warn!(grace_period = ?supervisor.grace_period(), "Timed out waiting for leader election to stop");
    }
    for listener in listeners {
        if tokio::time::timeout(supervisor.grace_period(), listener.join()).await.is_err() {
            warn!("Timed out waiting for listener to stop");
        }
    }

    match outcome {
        Some(err) => Err(err),
        None => {
            info!("Shutdown complete");
            Ok(())
        }
    }
}

fn start_election(
    config: &AppConfig,
    metrics: Arc<MetricsRegistry>,
    main_loop: Arc<dyn MainLoop>,
    supervisor: &Supervisor,
) -> Result<JoinHandle<()>> {
    let le = &config.leader_election;
    let identity = Identity::generate()?;
    let lock_config = le.lock_config(identity);
    let lock = new_resource_lock(&lock_config, &le.lock_dir)?;
    let elector = LeaderElector::new(lock_config, le.timing(), lock)?.with_metrics(metrics);

    info!(
        identity = %elector.identity(),
        backend = %le.resource_lock,
        "Leader election enabled"
    );

    let fatal = supervisor.handle();
    let handler: Arc<dyn LeadershipHandler> = Arc::new(Activation::new(main_loop, fatal.clone()));
    let cancel = supervisor.shutdown_token();

    Ok(tokio::spawn(async move {
        match elector.run(cancel, handler).await {
            Ok(outcome) => debug!(outcome = ?outcome, "Leader election finished"),
            Err(e) => {
                fatal.escalate(e);
            }
        }
    }))
}

fn start_without_election(main_loop: Arc<dyn MainLoop>, supervisor: &Supervisor) -> JoinHandle<()> {
    let fatal = supervisor.handle();
    let cancel = supervisor.shutdown_token();

    tokio::spawn(async move {
        if let Err(e) = run_without_election(main_loop, cancel).await {
            fatal.escalate(e);
        }
    })
}
