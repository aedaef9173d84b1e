use serde::{Deserialize, Serialize};
use sentinel_common::NodeId;

/// What travels between nodes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterMessage {
    /// A consensus message in wire form, see [`crate::codec`].
    Pbft(Vec<u8>),
    /// Liveness ping from an external membership layer.
    Heartbeat { from: NodeId, timestamp: u64 },
}
