use std::time::Duration;

use sentinel_common::NodeId;
use sentinel_p2p::{ClusterMessage, InMemoryNetwork, Network, NetworkError};

fn heartbeat(from: &NodeId) -> ClusterMessage {
    ClusterMessage::Heartbeat { from: from.clone(), timestamp: 1 }
}

#[tokio::test]
async fn test_in_memory_network() {
    let node_a_id = NodeId::from("node-A");
    let node_b_id = NodeId::from("node-B");
    let node_c_id = NodeId::from("node-C");

    let (net_a, tx_a, _rx_a) = InMemoryNetwork::new(node_a_id.clone());
    let (net_b, tx_b, mut rx_b) = InMemoryNetwork::new(node_b_id.clone());
    let (net_c, tx_c, mut rx_c) = InMemoryNetwork::new(node_c_id.clone());

    InMemoryNetwork::connect_all(&[
        (net_a.clone(), tx_a),
        (net_b.clone(), tx_b),
        (net_c.clone(), tx_c),
    ]);

    assert_eq!(net_a.connected_peers().await, vec![node_b_id.clone(), node_c_id.clone()]);

    net_a.send_to(node_b_id.clone(), heartbeat(&node_a_id)).await.expect("Failed to send to B");
    let got = tokio::time::timeout(Duration::from_millis(200), rx_b.recv()).await.unwrap();
    assert!(matches!(got, Some(ClusterMessage::Heartbeat { .. })));

    net_a.broadcast(ClusterMessage::Pbft(b"frame".to_vec())).await.expect("Failed to broadcast");

    for rx in [&mut rx_b, &mut rx_c] {
        match tokio::time::timeout(Duration::from_millis(200), rx.recv()).await.unwrap() {
            Some(ClusterMessage::Pbft(frame)) => assert_eq!(frame, b"frame".to_vec()),
            other => panic!("unexpected message: {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_self_is_never_a_peer() {
    let id = NodeId::from("solo");
    let (net, tx, _rx) = InMemoryNetwork::new(id.clone());
    net.add_peer(id, tx);
    assert!(net.connected_peers().await.is_empty());
}

#[tokio::test]
async fn test_unwired_peer_is_unreachable() {
    let (net_a, _tx_a, _rx_a) = InMemoryNetwork::new(NodeId::from("a"));

    let err = net_a
        .send_to(NodeId::from("b"), heartbeat(&NodeId::from("a")))
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::PeerNotFound(_)));
}
