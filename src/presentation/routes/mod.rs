// Route modules for the observability endpoints
pub mod observability;

// Re-export main router creation functions
pub use observability::{observability_router, Route};
