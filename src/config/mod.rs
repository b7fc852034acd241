//! Process configuration
//!
//! Settings come from environment variables, optionally seeded from a `.env`
//! file. Everything is validated up front so that a bad value fails the
//! process before any listener is bound or lock contested.

pub mod app_config;
pub mod validation;

pub use app_config::{AppConfig, LeaderElectionConfig};
pub use validation::{parse_bool, parse_duration, validate_bind_address};
