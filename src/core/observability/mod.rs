//! Prometheus metrics shared by the election and the listeners

pub mod metrics;

pub use metrics::MetricsRegistry;
