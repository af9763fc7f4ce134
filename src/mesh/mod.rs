//! Peer status exchange for the distributed coordinator.
//!
//! The coordinator never talks to the network itself. It hands its own
//! [`NodeStatus`] to an injected [`StatusPublisher`] and accepts peer
//! statuses through `DistributedCoordinator::receive_status`. This module
//! holds the message type and the in-process transports.

mod status;
mod transport;

pub use status::NodeStatus;
pub use transport::{ChannelPublisher, LocalMesh, StatusPublisher};
