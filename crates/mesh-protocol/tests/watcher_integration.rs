//! Integration tests: DisconnectWatcher against a LocalNetwork.

use std::sync::Arc;
use std::time::Duration;

use mesh_protocol::DisconnectWatcher;
use mesh_transport::{ConnectionControl, LocalNetwork, LocalNode, MeshConfig, PeerId};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("warn").try_init();
}

fn pair() -> (LocalNetwork, Arc<LocalNode>, Arc<LocalNode>) {
    let network = LocalNetwork::new();
    let a = LocalNode::bind(&network, MeshConfig::builtin()).unwrap();
    let b = LocalNode::bind(&network, MeshConfig::builtin()).unwrap();
    (network, a, b)
}

#[tokio::test]
async fn fires_for_never_connected_peer() {
    init_tracing();
    let (_network, a, _b) = pair();
    let w = DisconnectWatcher::new(a.as_ref(), PeerId::random());
    assert!(w.fired());
    assert!(w.wait_timeout(Duration::from_millis(1)).await);
}

#[tokio::test]
async fn fires_when_the_remote_side_goes_away() {
    init_tracing();
    let (network, a, b) = pair();
    network.connect(a.id(), b.id()).unwrap();
    let w = DisconnectWatcher::new(a.as_ref(), b.id());
    assert!(!w.wait_timeout(Duration::from_millis(20)).await);

    let b_id = b.id();
    let waiter = tokio::spawn(async move {
        w.wait().await;
        w.peer()
    });
    // b kills the link from its side; a's watcher still fires.
    b.kill_connection(a.id());

    let fired_for = tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .expect("watcher never fired")
        .unwrap();
    assert_eq!(fired_for, b_id);
}

#[tokio::test]
async fn fires_when_the_peer_shuts_down() {
    init_tracing();
    let (network, a, b) = pair();
    network.connect(a.id(), b.id()).unwrap();
    let w = DisconnectWatcher::new(a.as_ref(), b.id());

    drop(b);
    assert!(w.fired());
}

#[tokio::test]
async fn dropped_wait_is_cancelled_cleanly() {
    init_tracing();
    let (network, a, b) = pair();
    network.connect(a.id(), b.id()).unwrap();
    let w = DisconnectWatcher::new(a.as_ref(), b.id());

    // Time out (dropping the wait future) a few times, then fire.
    for _ in 0..3 {
        assert!(!w.wait_timeout(Duration::from_millis(5)).await);
    }
    network.disconnect(a.id(), b.id());
    assert!(w.wait_timeout(Duration::from_secs(1)).await);
}

#[tokio::test]
async fn watchers_are_independent_per_peer() {
    init_tracing();
    let network = LocalNetwork::new();
    let a = LocalNode::bind(&network, MeshConfig::builtin()).unwrap();
    let b = LocalNode::bind(&network, MeshConfig::builtin()).unwrap();
    let c = LocalNode::bind(&network, MeshConfig::builtin()).unwrap();
    network.connect_all();

    let wb = DisconnectWatcher::new(a.as_ref(), b.id());
    let wc = DisconnectWatcher::new(a.as_ref(), c.id());
    network.disconnect(a.id(), c.id());
    assert!(!wb.fired());
    assert!(wc.fired());

    // A watcher made after a reconnect starts unfired.
    network.connect(a.id(), c.id()).unwrap();
    let wc2 = DisconnectWatcher::new(a.as_ref(), c.id());
    assert!(!wc2.fired());
    assert!(wc.fired());
}
