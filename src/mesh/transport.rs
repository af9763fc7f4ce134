//! Outbound status transports.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::status::NodeStatus;
use crate::error::{AdmissionError, Result};
use crate::ratelimit::DistributedCoordinator;

/// Outbound side of the peer exchange.
///
/// Implementations wrap whatever carries statuses between nodes: a network
/// gossip layer, a pub/sub topic, or an in-process channel.
#[async_trait]
pub trait StatusPublisher: Send + Sync {
    /// Hand a status to the transport. Must not block on slow peers.
    async fn publish(&self, status: NodeStatus) -> Result<()>;
}

/// Publishes into a bounded channel, dropping statuses when it is full.
///
/// The receiving half is typically drained by the embedding application and
/// forwarded to its real transport.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<NodeStatus>,
}

impl ChannelPublisher {
    /// Create a publisher and the receiver it feeds.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<NodeStatus>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StatusPublisher for ChannelPublisher {
    async fn publish(&self, status: NodeStatus) -> Result<()> {
        match self.tx.try_send(status) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(status)) => {
                debug!(node_id = %status.node_id, "Outbound status channel full, dropping");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(AdmissionError::Transport(
                "status channel closed".to_string(),
            )),
        }
    }
}

/// In-process mesh that delivers each published status to every other
/// registered coordinator.
#[derive(Debug, Default)]
pub struct LocalMesh {
    nodes: RwLock<Vec<Arc<DistributedCoordinator>>>,
}

impl LocalMesh {
    /// Create an empty mesh.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a coordinator to the mesh.
    pub fn register(&self, coordinator: Arc<DistributedCoordinator>) {
        self.nodes.write().push(coordinator);
    }

    /// Number of registered coordinators.
    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    /// Whether no coordinator is registered.
    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

#[async_trait]
impl StatusPublisher for LocalMesh {
    async fn publish(&self, status: NodeStatus) -> Result<()> {
        let nodes = self.nodes.read().clone();
        for node in nodes.iter().filter(|n| n.node_id() != status.node_id) {
            let delivered = node.receive_status(status.clone());
            trace!(
                from = %status.node_id,
                to = %node.node_id(),
                delivered = delivered,
                "Delivered status"
            );
        }
        Ok(())
    }
}
