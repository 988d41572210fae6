//! kehto: a controller for local k3d clusters
//!
//! Creates, lists and destroys k3d clusters, keeps one unified kubeconfig
//! with every cluster in it, and tracks which cluster is active.

pub mod chart;
pub mod cluster;
pub mod config;
pub mod context;
pub mod controller;
pub mod docker;
pub mod events;
pub mod hook;
pub mod k3d;
pub mod kubeconfig;
pub mod notify;
pub mod process;
pub mod server;
pub mod telemetry;

#[cfg(test)]
pub mod testing;

pub use crate::cluster::{Cluster, ClusterError, ClusterSpec, ClusterStatus};
pub use crate::config::Settings;
pub use crate::context::Context;
pub use crate::controller::{ClusterRegistry, RegistryError};
pub use crate::events::{ClusterEvent, EventBus};
