//! Health and metrics listeners
//!
//! Listeners are started before leader election and live for the whole
//! process, so standby replicas stay observable. Which listeners exist is a
//! pure function of the two bind addresses, see [`plan_listeners`].

use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::routes::{observability_router, Route};
use crate::core::observability::MetricsRegistry;
use crate::core::shutdown::FatalHandle;
use crate::error::{AppError, Result};

/// Bind address meaning "do not start this listener".
pub const DISABLED_ADDRESS: &str = "0";

/// Time allowed to read request headers; bounds slowloris-style clients.
pub const READ_HEADER_TIMEOUT: Duration = Duration::from_secs(32);
/// Time allowed to read the request body.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5 * 60);
/// Time allowed to produce the response.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Connection timeouts enforced by every listener
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerTimeouts {
    pub read_header: Duration,
    pub read: Duration,
    pub write: Duration,
}

impl Default for ServerTimeouts {
    fn default() -> Self {
        Self {
            read_header: READ_HEADER_TIMEOUT,
            read: READ_TIMEOUT,
            write: WRITE_TIMEOUT,
        }
    }
}

/// An address and the route it was configured for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerBinding {
    pub address: String,
    pub role: Route,
}

impl ServerBinding {
    pub fn healthz(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            role: Route::Healthz,
        }
    }

    pub fn metrics(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            role: Route::Metrics,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.address == DISABLED_ADDRESS
    }
}

/// One listener to start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerPlan {
    pub name: &'static str,
    pub address: String,
    pub routes: Vec<Route>,
}

/// Decide which listeners to start for the given bindings.
///
/// Equal addresses share one listener serving both routes; otherwise each
/// enabled binding gets its own listener.
pub fn plan_listeners(health: &ServerBinding, metrics: &ServerBinding) -> Vec<ListenerPlan> {
    if health.address == metrics.address {
        if health.is_disabled() {
            return Vec::new();
        }
        return vec![ListenerPlan {
            name: "healthz and metrics",
            address: health.address.clone(),
            routes: vec![Route::Healthz, Route::Metrics],
        }];
    }

    let mut plans = Vec::new();
    if !health.is_disabled() {
        plans.push(ListenerPlan {
            name: "healthz",
            address: health.address.clone(),
            routes: vec![Route::Healthz],
        });
    }
    if !metrics.is_disabled() {
        plans.push(ListenerPlan {
            name: "metrics",
            address: metrics.address.clone(),
            routes: vec![Route::Metrics],
        });
    }
    plans
}

/// Check the `host:port` shape of a bind address and fill in the host; a bare
/// `:port` binds every interface.
///
/// Host names are resolved when the listener binds, not here.
pub fn normalize_address(address: &str) -> Result<String> {
    let invalid = |reason: &str| {
        AppError::ConfigError(format!("invalid bind address {:?}: {}", address, reason))
    };

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("expected host:port"))?;
    port.parse::<u16>().map_err(|_| invalid("port must be a number between 0 and 65535"))?;

    if host.is_empty() {
        Ok(format!("0.0.0.0:{}", port))
    } else {
        Ok(address.to_string())
    }
}

/// A started listener
#[derive(Debug)]
pub struct RunningListener {
    pub name: &'static str,
    pub local_addr: SocketAddr,
    pub routes: Vec<Route>,
    handle: JoinHandle<()>,
}

impl RunningListener {
    /// Wait for the accept loop to end.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!(listener = self.name, error = %e, "Listener task failed");
        }
    }
}

/// Starts the health and metrics listeners
pub struct ObservabilityServer {
    metrics: Arc<MetricsRegistry>,
    timeouts: ServerTimeouts,
    shutdown: CancellationToken,
    fatal: FatalHandle,
}

impl ObservabilityServer {
    pub fn new(metrics: Arc<MetricsRegistry>, shutdown: CancellationToken, fatal: FatalHandle) -> Self {
        Self {
            metrics,
            timeouts: ServerTimeouts::default(),
            shutdown,
            fatal,
        }
    }

    pub fn with_timeouts(mut self, timeouts: ServerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Bind every planned listener and spawn its accept loop.
    ///
    /// Bind failures are returned; failures while serving are escalated as
    /// fatal. Listeners stop accepting once the shutdown token fires.
    pub async fn serve(
        &self,
        health: &ServerBinding,
        metrics: &ServerBinding,
    ) -> Result<Vec<RunningListener>> {
        let mut running = Vec::new();

        for plan in plan_listeners(health, metrics) {
            let failed = |reason: String| AppError::ListenerFailed {
                name: plan.name.to_string(),
                address: plan.address.clone(),
                reason,
            };

            let addr = normalize_address(&plan.address)?;
            let listener = TcpListener::bind(addr.as_str())
                .await
                .map_err(|e| failed(e.to_string()))?;
            let local_addr = listener.local_addr().map_err(|e| failed(e.to_string()))?;

            info!(listener = plan.name, address = %local_addr, "Starting server");

            let app = observability_router(
                &plan.routes,
                self.metrics.clone(),
                self.timeouts.read,
                self.timeouts.write,
            );
            let timeouts = self.timeouts;
            let shutdown = self.shutdown.clone();
            let fatal = self.fatal.clone();
            let name = plan.name;
            let address = plan.address.clone();

            let handle = tokio::spawn(async move {
                if let Err(e) = accept_loop(listener, app, timeouts, shutdown).await {
                    fatal.escalate(AppError::ListenerFailed {
                        name: name.to_string(),
                        address,
                        reason: e.to_string(),
                    });
                }
            });

            running.push(RunningListener {
                name: plan.name,
                local_addr,
                routes: plan.routes,
                handle,
            });
        }

        if running.is_empty() {
            info!("Health and metrics listeners are disabled");
        }

        Ok(running)
    }
}

async fn accept_loop(
    listener: TcpListener,
    app: Router,
    timeouts: ServerTimeouts,
    shutdown: CancellationToken,
) -> io::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) if is_connection_error(&e) => {
                    debug!(error = %e, "Dropped connection during accept");
                    continue;
                }
                Err(e) => return Err(e),
            },
        };

        let service = TowerToHyperService::new(app.clone());
        tokio::spawn(async move {
            let mut builder = http1::Builder::new();
            builder
                .timer(TokioTimer::new())
                .header_read_timeout(timeouts.read_header);

            if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
                debug!(peer = %peer, error = %e, "Connection closed with error");
            }
        });
    }
}

fn is_connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}
