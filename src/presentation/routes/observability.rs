//! Liveness and metrics routes
//!
//! `/healthz` is a pure liveness check: it answers `ok` as long as the
//! listener is up, whatever the leadership state. `/metrics` renders the
//! shared registry in the Prometheus text format.

use axum::{
    extract::State,
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    timeout::{RequestBodyTimeoutLayer, TimeoutLayer},
    trace::TraceLayer,
};

use crate::core::observability::MetricsRegistry;
use crate::error::AppError;

/// Routes a listener can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Healthz,
    Metrics,
}

impl Route {
    pub fn path(&self) -> &'static str {
        match self {
            Route::Healthz => "/healthz",
            Route::Metrics => "/metrics",
        }
    }
}

/// Build the router for the given routes.
///
/// `read_timeout` bounds reading the request body and `write_timeout` bounds
/// producing the response.
pub fn observability_router(
    routes: &[Route],
    metrics: Arc<MetricsRegistry>,
    read_timeout: Duration,
    write_timeout: Duration,
) -> Router {
    let mut router = Router::new();

    for route in routes {
        router = match route {
            Route::Healthz => router.route(route.path(), get(healthz_handler)),
            Route::Metrics => router.route(route.path(), get(metrics_handler)),
        };
    }

    router
        .with_state(metrics)
        .layer(TimeoutLayer::new(write_timeout))
        .layer(RequestBodyTimeoutLayer::new(read_timeout))
        .layer(TraceLayer::new_for_http())
}

async fn healthz_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(metrics): State<Arc<MetricsRegistry>>) -> Result<Response, AppError> {
    let body = metrics.gather_text()?;
    Ok(([(CONTENT_TYPE, metrics.content_type())], body).into_response())
}
