use dotenv::dotenv;
use std::sync::Arc;
use tracing::{debug, error, info};

use fleet_descheduler::app;
use fleet_descheduler::config::AppConfig;
use fleet_descheduler::core::logging::{init_logging, LogFormat};
use fleet_descheduler::core::{shutdown_signal, DeschedulerLoop, MetricsRegistry};
use fleet_descheduler::error::{AppError, EXIT_INTERNAL, EXIT_OK};

#[tokio::main]
async fn main() {
    let code = match start().await {
        Ok(()) => EXIT_OK,
        Err(err) => {
            error!(error = %err, "fleet-descheduler terminated");
            err.downcast_ref::<AppError>()
                .map_or(EXIT_INTERNAL, AppError::exit_code)
        }
    };

    std::process::exit(code);
}

async fn start() -> anyhow::Result<()> {
    let dotenv_loaded = dotenv().is_ok();

    // An invalid LOG_FORMAT is reported by configuration validation below.
    let log_format: LogFormat = std::env::var("LOG_FORMAT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or_default();
    if let Err(e) = init_logging(log_format) {
        eprintln!("{}", e);
    }

    if dotenv_loaded {
        info!("Loaded .env file");
    } else {
        debug!("No .env file found, using system environment variables");
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting fleet-descheduler");

    let config = AppConfig::from_env()?;
    config.log_summary();

    let metrics = MetricsRegistry::init_global()?;
    let main_loop = Arc::new(DeschedulerLoop::new(config.descheduling_interval, metrics.clone()));

    app::run(config, metrics, main_loop, shutdown_signal()).await?;
    Ok(())
}
