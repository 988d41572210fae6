//! Logging setup
//!
//! Everything goes to stderr through `tracing`. `RUST_LOG` picks the
//! filter; without it we log at `info`, which shows every cluster
//! operation and reconciliation pass but not the k3d output lines.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "info";

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber; later calls are ignored
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(filter())
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .try_init();
}
