//! End-to-end scenarios that exercise the handshake, the controller/worker
//! request-reply round trip, and registry persistence over a real transport
//! (two in-process nodes talking over loopback WebSockets).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use overlay_node::capabilities::{InMemoryMinerManager, InMemoryProfileManager, MinerManager, ProfileManager};
use overlay_node::identity::Role;
use overlay_node::registry::Peer;
use overlay_node::transport::TransportConfig;
use overlay_node::{Controller, Dispatcher, NodeManager, PeerRegistry, Transport, Worker};
use tempfile::tempdir;

struct Node {
    manager: Arc<NodeManager>,
    registry: Arc<PeerRegistry>,
    transport: Arc<Transport>,
    controller: Arc<Controller>,
}

async fn spin_up_node(name: &str, listen_addr: SocketAddr, data_dir: &std::path::Path) -> Node {
    let manager = Arc::new(
        NodeManager::generate(name, Role::Dual, data_dir.join("private.key"), data_dir.join("node.json")).unwrap(),
    );
    let registry = PeerRegistry::open(data_dir.join("peers.json")).unwrap();

    let config = TransportConfig {
        listen_addr,
        ws_path: "/ws".to_string(),
        max_connections: 16,
        max_message_size: 1024 * 1024,
    };
    let (transport, inbound_rx) = Transport::new(manager.clone(), registry.clone(), config);
    let controller = Controller::new(manager.clone(), registry.clone(), transport.clone());

    let miner_manager: Arc<dyn MinerManager> = Arc::new(InMemoryMinerManager::new());
    let profile_manager: Arc<dyn ProfileManager> = Arc::new(InMemoryProfileManager::new());
    let worker = Arc::new(Worker::new(manager.clone(), &miner_manager, &profile_manager, data_dir.join("miners")));

    Dispatcher::spawn(transport.clone(), controller.clone(), worker, inbound_rx);

    let serve_transport = transport.clone();
    tokio::spawn(async move {
        let _ = serve_transport.serve().await;
    });
    // Give the listener a moment to bind before a peer dials it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    Node { manager, registry, transport, controller }
}

#[tokio::test]
async fn handshake_then_ping_round_trips() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();

    let addr_b: SocketAddr = "127.0.0.1:19191".parse().unwrap();
    let node_b = spin_up_node("node-b", addr_b, dir_b.path()).await;
    let node_a = spin_up_node("node-a", "127.0.0.1:19192".parse().unwrap(), dir_a.path()).await;

    let peer_b = Peer::new(node_b.manager.id(), "node-b", node_b.manager.public_key_base64(), addr_b.to_string(), Role::Dual);
    node_a.registry.add_peer(peer_b).await.unwrap();

    let rtt = node_a.controller.ping_peer(node_b.manager.id()).await.unwrap();
    assert!(rtt < Duration::from_secs(1));

    // The responder auto-registers the dialing peer during the handshake.
    assert!(node_b.registry.get(node_a.manager.id()).await.is_some());

    node_a.transport.stop().await;
    node_b.transport.stop().await;
}

#[tokio::test]
async fn get_stats_reflects_worker_side_miners() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();

    let addr_b: SocketAddr = "127.0.0.1:19193".parse().unwrap();
    let node_b = spin_up_node("node-b", addr_b, dir_b.path()).await;
    let node_a = spin_up_node("node-a", "127.0.0.1:19194".parse().unwrap(), dir_a.path()).await;

    let peer_b = Peer::new(node_b.manager.id(), "node-b", node_b.manager.public_key_base64(), addr_b.to_string(), Role::Dual);
    node_a.registry.add_peer(peer_b).await.unwrap();

    let ack = node_a
        .controller
        .start_miner(node_b.manager.id(), "xmrig", None, Some(serde_json::json!({"pool": "p.example:3333"})))
        .await
        .unwrap();
    assert!(ack.success);
    let miner_name = ack.miner_name.unwrap();

    let stats = node_a.controller.get_stats(node_b.manager.id()).await.unwrap();
    assert_eq!(stats.node_id, node_b.manager.id());
    assert_eq!(stats.miners.len(), 1);
    assert_eq!(stats.miners[0].name, miner_name);

    let stop_ack = node_a.controller.stop_miner(node_b.manager.id(), &miner_name).await.unwrap();
    assert!(stop_ack.success);

    let stats = node_a.controller.get_stats(node_b.manager.id()).await.unwrap();
    assert!(stats.miners.is_empty());

    node_a.transport.stop().await;
    node_b.transport.stop().await;
}

#[tokio::test]
async fn ping_unknown_peer_is_not_found() {
    let dir_a = tempdir().unwrap();
    let node_a = spin_up_node("node-a", "127.0.0.1:19195".parse().unwrap(), dir_a.path()).await;

    let err = node_a.controller.ping_peer("no-such-peer").await.unwrap_err();
    assert!(matches!(err, overlay_node::NodeError::NotFound(_)));

    node_a.transport.stop().await;
}

#[tokio::test]
async fn allowlist_mode_rejects_unapproved_peer() {
    let dir_a = tempdir().unwrap();
    let dir_b = tempdir().unwrap();

    let addr_b: SocketAddr = "127.0.0.1:19196".parse().unwrap();
    let node_b = spin_up_node("node-b", addr_b, dir_b.path()).await;
    node_b.registry.set_auth_mode(overlay_node::registry::AuthMode::Allowlist).await;

    let node_a = spin_up_node("node-a", "127.0.0.1:19197".parse().unwrap(), dir_a.path()).await;
    let peer_b = Peer::new(node_b.manager.id(), "node-b", node_b.manager.public_key_base64(), addr_b.to_string(), Role::Dual);
    node_a.registry.add_peer(peer_b).await.unwrap();

    let err = node_a.controller.ping_peer(node_b.manager.id()).await.unwrap_err();
    assert!(matches!(err, overlay_node::NodeError::Io(_)) || matches!(err, overlay_node::NodeError::Protocol(_)));

    node_a.transport.stop().await;
    node_b.transport.stop().await;
}

#[tokio::test]
async fn registry_debounced_persistence_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("peers.json");
    let registry = PeerRegistry::open_with_debounce(&path, Duration::from_millis(50)).unwrap();

    let peer = Peer::new("peer-1", "node-one", "pubkey", "127.0.0.1:9091", Role::Worker);
    registry.add_peer(peer).await.unwrap();

    // Immediately after the mutation, the flush hasn't fired yet.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let reopened_early = PeerRegistry::open(&path).unwrap();
    assert!(reopened_early.get("peer-1").await.is_none());

    // After the debounce interval elapses, the write has landed on disk.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let reopened_late = PeerRegistry::open(&path).unwrap();
    assert!(reopened_late.get("peer-1").await.is_some());
}
