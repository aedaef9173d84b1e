use async_trait::async_trait;
use sentinel_common::NodeId;

use crate::error::NetworkError;
use crate::message::ClusterMessage;

#[async_trait]
pub trait Network: Send + Sync {
    /// Sends a message to a specific peer.
    async fn send_to(&self, peer: NodeId, message: ClusterMessage) -> Result<(), NetworkError>;

    /// Broadcasts a message to all connected peers. The local node is not a
    /// peer of itself.
    async fn broadcast(&self, message: ClusterMessage) -> Result<(), NetworkError>;

    /// Returns a list of connected peers.
    async fn connected_peers(&self) -> Vec<NodeId>;
}
