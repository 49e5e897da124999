//! Network integration tests
//!
//! Real nodes on loopback sockets: bootstrapping, peer exchange, broadcast
//! and peers remembered across restarts.

use peerwire::{
    Endpoint, MessageType, NetworkConfig, NetworkEvent, NetworkServer, NodeKey, PeerDatabase,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::tempdir;

const TIMEOUT: Duration = Duration::from_secs(15);

fn node_config(bootnodes: Vec<String>) -> NetworkConfig {
    NetworkConfig {
        listen_host: "127.0.0.1".to_string(),
        listen_port: 0,
        bootnodes,
        persist_peers: false,
        reconnect_delay_ms: 50,
        ..NetworkConfig::default()
    }
}

fn start(config: &NetworkConfig) -> NetworkServer {
    NetworkServer::start(config, Arc::new(NodeKey::generate().unwrap())).unwrap()
}

fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(25));
    }
    false
}

/// Wait for the next application message, skipping connection events
fn next_message(node: &NetworkServer) -> (Endpoint, u8, Vec<u8>) {
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match node.events().recv_timeout(remaining).unwrap() {
            NetworkEvent::MessageReceived {
                endpoint, message, ..
            } => return (endpoint, message.msg_type, message.payload),
            _ => continue,
        }
    }
}

#[test]
fn test_bootstrap_peer_exchange_and_broadcast() {
    let a = start(&node_config(Vec::new()));
    let a_addr = a.local_addr().to_string();

    // B bootstraps from A on its first maintenance cycle
    let b = start(&node_config(vec![a_addr.clone()]));
    assert!(wait_until(|| a.peer_count() == 1 && b.peer_count() == 1));

    // C bootstraps from A and learns about B through peer exchange
    let c = start(&node_config(vec![a_addr]));
    let b_endpoint = Endpoint::new("127.0.0.1", b.local_addr().port());
    assert!(wait_until(|| {
        c.pool().find_peer(Some(&b_endpoint), None).is_some() && b.peer_count() == 2
    }));
    assert_eq!(a.peer_count(), 2);

    a.broadcast_block(b"block-1".to_vec()).unwrap();
    for node in [&b, &c] {
        let (from, msg_type, payload) = next_message(node);
        assert_eq!(from.port(), a.local_addr().port());
        assert_eq!(msg_type, MessageType::Block.tag());
        assert_eq!(payload, b"block-1".to_vec());
    }

    // Large payloads are chunked on the wire and arrive whole
    let big = vec![0xAB; 300 * 1024];
    c.broadcast_transaction(big.clone()).unwrap();
    let (_, msg_type, payload) = next_message(&b);
    assert_eq!(msg_type, MessageType::Transaction.tag());
    assert_eq!(payload, big);

    c.stop();
    assert!(wait_until(|| a.peer_count() == 1 && b.peer_count() == 1));
}

#[test]
fn test_peers_remembered_across_restart() {
    let a = start(&node_config(Vec::new()));
    let dir = tempdir().unwrap();
    let config = NetworkConfig {
        data_dir: dir.path().to_path_buf(),
        persist_peers: true,
        peers: vec![a.local_addr().to_string()],
        ..node_config(Vec::new())
    };

    let b = start(&config);
    assert!(wait_until(|| a.peer_count() == 1 && b.peer_count() == 1));
    b.stop();
    drop(b);
    assert!(wait_until(|| a.peer_count() == 0));

    {
        let db = PeerDatabase::open(&config.peer_db_path()).unwrap();
        let stored = db.endpoints().unwrap();
        assert_eq!(stored, vec![Endpoint::new("127.0.0.1", a.local_addr().port())]);
    }

    // No static peers this time: only the database knows about A
    let restarted = start(&NetworkConfig {
        peers: Vec::new(),
        ..config
    });
    assert!(wait_until(|| a.peer_count() == 1 && restarted.peer_count() == 1));
}
