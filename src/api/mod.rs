//! API layer
//!
//! HTTP handlers for the operations surface:
//! - Liveness and health report
//! - Admin (cache, fallback sync, connection status)
//! - Metrics (Prometheus)

mod admin;
mod health;
pub mod metrics;
mod middleware;

pub use admin::admin_router;
pub use health::health_router;
pub use metrics::metrics_router;
pub use middleware::track_requests;
