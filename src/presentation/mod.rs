//! HTTP surface: liveness and metrics listeners

pub mod routes;
pub mod server;

pub use routes::Route;
pub use server::{
    normalize_address, plan_listeners, ListenerPlan, ObservabilityServer, RunningListener,
    ServerBinding, ServerTimeouts, DISABLED_ADDRESS,
};
