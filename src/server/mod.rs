//! Local HTTP status server and controller plumbing
//!
//! - `/healthz` - Liveness check (process is running)
//! - `/readyz` - Readiness check (initial reconciliation done)
//! - `/metrics` - Prometheus metrics
//! - `/clusters` - Cluster listing, plus create/destroy/switch routes

mod api;
mod health;
mod metrics;
mod shutdown;

pub use api::CreateRequest;
pub use health::{run_health_server, ReadinessState};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, ShutdownSignal, ShutdownTrigger};

#[cfg(test)]
#[path = "health_test.rs"]
mod tests;

#[cfg(test)]
#[path = "metrics_test.rs"]
mod metrics_tests;
