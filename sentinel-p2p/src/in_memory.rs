use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use sentinel_common::NodeId;
use tokio::sync::mpsc::{self, Receiver, Sender};
use tracing::warn;

use crate::error::NetworkError;
use crate::message::ClusterMessage;
use crate::traits::Network;

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Process-local transport: every node owns a bounded inbox and holds the
/// senders of the peers it is wired to.
#[derive(Clone)]
pub struct InMemoryNetwork {
    pub id: NodeId,
    peers: Arc<RwLock<HashMap<NodeId, Sender<ClusterMessage>>>>,
}

impl InMemoryNetwork {
    pub fn new(id: NodeId) -> (Self, Sender<ClusterMessage>, Receiver<ClusterMessage>) {
        Self::with_capacity(id, DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(id: NodeId, capacity: usize) -> (Self, Sender<ClusterMessage>, Receiver<ClusterMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        (Self {
            id,
            peers: Arc::new(RwLock::new(HashMap::new())),
        }, tx, rx)
    }

    pub fn add_peer(&self, peer_id: NodeId, sender: Sender<ClusterMessage>) {
        if peer_id == self.id {
            return;
        }
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer_id, sender);
    }

    /// Wires every network in `nodes` to every other one.
    pub fn connect_all(nodes: &[(InMemoryNetwork, Sender<ClusterMessage>)]) {
        for (net, _) in nodes {
            for (peer, tx) in nodes {
                net.add_peer(peer.id.clone(), tx.clone());
            }
        }
    }

    fn sender_for(&self, peer: &NodeId) -> Option<Sender<ClusterMessage>> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .cloned()
    }
}

#[async_trait]
impl Network for InMemoryNetwork {
    async fn send_to(&self, peer: NodeId, message: ClusterMessage) -> Result<(), NetworkError> {
        match self.sender_for(&peer) {
            Some(sender) => sender
                .send(message)
                .await
                .map_err(|_| NetworkError::SendError(peer.0)),
            None => Err(NetworkError::PeerNotFound(peer.0)),
        }
    }

    async fn broadcast(&self, message: ClusterMessage) -> Result<(), NetworkError> {
        let peers: Vec<(NodeId, Sender<ClusterMessage>)> = {
            let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
            peers.iter().map(|(id, tx)| (id.clone(), tx.clone())).collect()
        };

        for (peer_id, sender) in peers {
            if sender.send(message.clone()).await.is_err() {
                warn!("{} -> {}: inbox closed, message dropped", self.id, peer_id);
            }
        }
        Ok(())
    }

    async fn connected_peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self
            .peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        peers.sort();
        peers
    }
}
