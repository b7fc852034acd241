use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Process exit code for a clean shutdown.
pub const EXIT_OK: i32 = 0;
/// Process exit code for errors without a dedicated code.
pub const EXIT_INTERNAL: i32 = 5;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to serve {name} on {address}: {reason}")]
    ListenerFailed {
        name: String,
        address: String,
        reason: String,
    },

    #[error("Leader election lost")]
    LeadershipLost,

    #[error("Descheduler exited")]
    MainLoopExited,

    #[error("Metrics error: {0}")]
    MetricsError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Non-zero status the process terminates with when this error escalates.
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::ConfigError(_) => 1,
            AppError::ListenerFailed { .. } => 2,
            AppError::LeadershipLost => 3,
            AppError::MainLoopExited => 4,
            AppError::MetricsError(_) | AppError::InternalError(_) => EXIT_INTERNAL,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::InternalError(format!("IO error: {}", err))
    }
}

impl From<prometheus::Error> for AppError {
    fn from(err: prometheus::Error) -> Self {
        AppError::MetricsError(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::ConfigError(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, self.to_string()).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
