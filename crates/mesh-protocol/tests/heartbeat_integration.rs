//! Integration tests: heartbeat manager over LocalNode + multiplexer.
//!
//! Paused tokio clock; `sleep` auto-advances it, so the timing assertions
//! are exact. Defaults: 2 s period, 5 keepalives, kill on the 6th tick.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{init_tracing, Ignore, MeshNode};
use mesh_protocol::DisconnectWatcher;
use mesh_transport::{message_writer, ConnectivityService, LocalNetwork, MeshConfig, MessageService};

fn config() -> MeshConfig {
    MeshConfig::builtin()
}

async fn sleep_ms(ms: u64) {
    tokio::time::sleep(Duration::from_millis(ms)).await;
}

/// A peer that never answers is killed exactly at 6 × 2 s = 12 s.
#[tokio::test(start_paused = true)]
async fn silent_peer_is_disconnected_after_max_keepalives() {
    init_tracing();
    let network = LocalNetwork::new();
    let a = MeshNode::live(&network, &config(), Arc::new(Ignore));
    let b = MeshNode::silent(&network, &config(), Arc::new(Ignore));
    network.connect(a.id(), b.id()).unwrap();
    let watcher = DisconnectWatcher::new(a.node.as_ref(), b.id());

    sleep_ms(11_000).await;
    assert!(a.node.is_peer_connected(&b.id()));
    assert!(!watcher.fired());
    assert_eq!(a.heartbeat().missed_count(b.id()).await.unwrap(), Some(5));

    sleep_ms(2_000).await;
    assert!(!a.node.is_peer_connected(&b.id()));
    assert!(!b.node.is_peer_connected(&a.id()));
    assert!(watcher.fired());

    let stats = a.heartbeat().stats();
    assert_eq!(stats.keepalives_sent, 5);
    assert_eq!(stats.forced_disconnects, 1);
    assert_eq!(stats.tracked_peers, 0);
}

/// Two nodes that both run heartbeats keep each other alive indefinitely.
#[tokio::test(start_paused = true)]
async fn live_peers_stay_connected() {
    init_tracing();
    let network = LocalNetwork::new();
    let a = MeshNode::live(&network, &config(), Arc::new(Ignore));
    let b = MeshNode::live(&network, &config(), Arc::new(Ignore));
    network.connect(a.id(), b.id()).unwrap();

    sleep_ms(120_000).await;
    assert!(a.node.is_peer_connected(&b.id()));
    assert!(b.node.is_peer_connected(&a.id()));

    for node in [&a, &b] {
        let stats = node.heartbeat().stats();
        assert_eq!(stats.forced_disconnects, 0);
        assert!(stats.keepalives_sent >= 50);
        assert!(stats.resets >= 50);
    }
}

/// Application traffic alone keeps a peer alive; the timeout starts over
/// from the last message.
#[tokio::test(start_paused = true)]
async fn application_traffic_counts_as_liveness() {
    init_tracing();
    let network = LocalNetwork::new();
    let a = MeshNode::live(&network, &config(), Arc::new(Ignore));
    let b = MeshNode::silent(&network, &config(), Arc::new(Ignore));
    network.connect(a.id(), b.id()).unwrap();

    // 10 messages, 4 s apart, on odd seconds so they never race a tick.
    sleep_ms(1_000).await;
    for _ in 0..10 {
        b.app.send_message(a.id(), message_writer(|out| out.extend_from_slice(b"ping")));
        sleep_ms(4_000).await;
    }
    assert!(a.node.is_peer_connected(&b.id()));

    // Last message at t = 37 s. Ticks at 38..46 s count 1..5, 48 s kills.
    sleep_ms(6_000).await;
    assert!(a.node.is_peer_connected(&b.id()));
    sleep_ms(2_000).await;
    assert!(!a.node.is_peer_connected(&b.id()));
}

/// A killed peer that reconnects is tracked again from zero.
#[tokio::test(start_paused = true)]
async fn reconnect_after_kill_starts_fresh() {
    init_tracing();
    let network = LocalNetwork::new();
    let a = MeshNode::live(&network, &config(), Arc::new(Ignore));
    let b = MeshNode::silent(&network, &config(), Arc::new(Ignore));
    network.connect(a.id(), b.id()).unwrap();

    sleep_ms(13_000).await;
    assert!(!a.node.is_peer_connected(&b.id()));
    assert_eq!(a.heartbeat().missed_count(b.id()).await.unwrap(), None);

    network.connect(a.id(), b.id()).unwrap();
    assert_eq!(a.heartbeat().missed_count(b.id()).await.unwrap(), Some(0));
    assert_eq!(a.heartbeat().stats().tracked_peers, 1);

    sleep_ms(13_000).await;
    assert!(!a.node.is_peer_connected(&b.id()));
    assert_eq!(a.heartbeat().stats().forced_disconnects, 2);
}

/// Shorter periods from config are honored.
#[tokio::test(start_paused = true)]
async fn configured_period_and_limit() {
    init_tracing();
    let config = MeshConfig::builtin()
        .heartbeat_interval(Duration::from_millis(100))
        .max_keepalives(2);
    let network = LocalNetwork::new();
    let a = MeshNode::live(&network, &config, Arc::new(Ignore));
    let b = MeshNode::silent(&network, &config, Arc::new(Ignore));
    network.connect(a.id(), b.id()).unwrap();

    // Kill on the 3rd tick, at 300 ms.
    sleep_ms(250).await;
    assert!(a.node.is_peer_connected(&b.id()));
    sleep_ms(100).await;
    assert!(!a.node.is_peer_connected(&b.id()));
}
