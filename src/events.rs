//! Change events for a single consumer
//!
//! Producers (background create/destroy tasks, reconciliation passes) publish
//! without blocking; one designated consumer drains the receiving end.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ClusterEvent {
    /// A cluster finished provisioning
    Created(String),
    /// A cluster was torn down
    Destroyed(String),
    /// The set of known clusters changed; carries the new count
    ClustersChanged(usize),
    /// The active cluster changed (`None`: no active cluster)
    ActiveChanged(Option<String>),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<ClusterEvent>,
}

pub type EventReceiver = mpsc::UnboundedReceiver<ClusterEvent>;

impl EventBus {
    pub fn new() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish `event`; dropped silently when nobody is listening anymore
    pub fn publish(&self, event: ClusterEvent) {
        trace!(event = ?event, "Publishing event");
        let _ = self.tx.send(event);
    }
}
