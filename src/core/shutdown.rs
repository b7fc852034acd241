//! Unrecoverable error escalation
//!
//! Every fatal path (listener failure, lost leadership, unexpected main loop
//! return) reports through a [`FatalHandle`]. The [`Supervisor`] owns the root
//! cancellation token and turns the first report, or an external shutdown
//! request, into an orderly stop. Only `main` terminates the process.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{AppError, EXIT_OK};

/// Cloneable reporter for unrecoverable errors
#[derive(Debug, Clone)]
pub struct FatalHandle {
    sender: mpsc::UnboundedSender<AppError>,
    fired: Arc<AtomicBool>,
    escalations: Arc<AtomicUsize>,
}

impl FatalHandle {
    /// Report an unrecoverable error. Returns `true` for the first report;
    /// later ones are logged and dropped.
    pub fn escalate(&self, err: AppError) -> bool {
        self.escalations.fetch_add(1, Ordering::SeqCst);

        if self.fired.swap(true, Ordering::SeqCst) {
            warn!(error = %err, "Fatal error reported after shutdown already started");
            return false;
        }

        error!(error = %err, exit_code = err.exit_code(), "Unrecoverable error, shutting down");
        if self.sender.send(err).is_err() {
            warn!("Supervisor is gone, fatal error dropped");
        }
        true
    }

    /// Total number of reports, including dropped ones.
    pub fn escalations(&self) -> usize {
        self.escalations.load(Ordering::SeqCst)
    }
}

/// Single top-level handler for fatal errors and shutdown requests
pub struct Supervisor {
    shutdown: CancellationToken,
    handle: FatalHandle,
    receiver: mpsc::UnboundedReceiver<AppError>,
    grace_period: Duration,
}

impl Supervisor {
    /// `grace_period` bounds how long cleanup (lock release) may take once
    /// shutdown begins.
    pub fn new(grace_period: Duration) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            shutdown: CancellationToken::new(),
            handle: FatalHandle {
                sender,
                fired: Arc::new(AtomicBool::new(false)),
                escalations: Arc::new(AtomicUsize::new(0)),
            },
            receiver,
            grace_period,
        }
    }

    pub fn handle(&self) -> FatalHandle {
        self.handle.clone()
    }

    /// Root token; cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// Wait for the first fatal error or for `signal`, then cancel the root
    /// token. Returns the fatal error, if that is what ended the wait.
    pub async fn wait<F>(&mut self, signal: F) -> Option<AppError>
    where
        F: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            err = self.receiver.recv() => err,
            _ = signal => {
                info!("Shutdown requested");
                None
            }
        };

        self.shutdown.cancel();
        outcome
    }

    /// Exit status for the outcome of [`Supervisor::wait`].
    pub fn exit_code(outcome: Option<&AppError>) -> i32 {
        outcome.map_or(EXIT_OK, AppError::exit_code)
    }
}

/// Resolves on SIGINT or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
