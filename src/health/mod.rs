//! Service health
//!
//! - Running request aggregates
//! - Periodic liveness, resource and housekeeping cycle
//! - Metrics snapshot file

mod monitor;
mod system;

pub use monitor::{HealthMetrics, HealthMonitor, HealthReport, HealthStatus, evaluate};
pub use system::{ResourceSampler, ResourceUsage, prune_stale_files};
