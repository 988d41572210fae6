//! The cluster controller
//!
//! [`ClusterRegistry`] is the only owner of the cluster map and the active
//! cluster pointer. Both are rebuilt from ground truth by reconciliation
//! passes, which are serialized against each other.

mod registry;

pub use registry::{ClusterRegistry, RegistryError};
