use std::time::Duration;

use crate::error::{AppError, Result};
use crate::presentation::{normalize_address, DISABLED_ADDRESS};

/// Parse a duration such as `500ms`, `10s`, `2m` or `1h`.
///
/// A bare number is taken as seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    let invalid = || AppError::ConfigError(format!("invalid duration {:?}", value));

    let (number, unit) = match value.find(|c: char| !c.is_ascii_digit()) {
        Some(0) => return Err(invalid()),
        Some(idx) => value.split_at(idx),
        None => (value, "s"),
    };
    let amount: u64 = number.parse().map_err(|_| invalid())?;

    let seconds_per_unit = match unit {
        "ms" => return Ok(Duration::from_millis(amount)),
        "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        _ => return Err(invalid()),
    };

    amount
        .checked_mul(seconds_per_unit)
        .map(Duration::from_secs)
        .ok_or_else(|| AppError::ConfigError(format!("duration {:?} is out of range", value)))
}

pub fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::ConfigError(format!(
            "{} must be a boolean, got {:?}",
            key, value
        ))),
    }
}

/// A bind address is either the disabled sentinel or `host:port`.
pub fn validate_bind_address(key: &str, address: &str) -> Result<()> {
    if address == DISABLED_ADDRESS {
        return Ok(());
    }
    normalize_address(address)
        .map(|_| ())
        .map_err(|e| AppError::ConfigError(format!("{}: {}", key, e)))
}
