//! DisconnectWatcher: fires once when a given peer is (or becomes)
//! disconnected.

use std::sync::Arc;
use std::time::Duration;

use mesh_transport::{ConnectivityService, PeerId, PeersListListener, PeersListSubscription};
use tokio::sync::watch;

struct DisconnectLatch {
    peer: PeerId,
    tx: watch::Sender<bool>,
}

impl DisconnectLatch {
    fn pulse(&self) {
        let first = self.tx.send_if_modified(|fired| !std::mem::replace(fired, true));
        if first {
            tracing::debug!(peer = %self.peer, "disconnect watcher fired");
        }
    }
}

impl PeersListListener for DisconnectLatch {
    fn on_connect(&self, _peer: PeerId) {}

    fn on_disconnect(&self, peer: PeerId) {
        if peer == self.peer {
            self.pulse();
        }
    }
}

/// One-shot latch that is set once `peer` is not connected.
///
/// Set at construction if the peer is already gone, otherwise on the next
/// disconnect of exactly that peer. Later reconnects and disconnects change
/// nothing.
pub struct DisconnectWatcher {
    peer: PeerId,
    rx: watch::Receiver<bool>,
    _subscription: PeersListSubscription,
}

impl DisconnectWatcher {
    /// # Panics
    ///
    /// When called from inside a membership notification.
    pub fn new(connectivity: &dyn ConnectivityService, peer: PeerId) -> Self {
        let (tx, rx) = watch::channel(false);
        let latch = Arc::new(DisconnectLatch { peer, tx });
        let mut subscription = PeersListSubscription::new(latch.clone());

        let freeze = connectivity.membership().freeze();
        if freeze.is_connected(&peer) {
            subscription.reset_to(&freeze);
        } else {
            latch.pulse();
        }
        drop(freeze);

        Self {
            peer,
            rx,
            _subscription: subscription,
        }
    }

    /// The watched peer.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// True once the peer has been seen disconnected. Never goes back.
    pub fn fired(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the watcher has fired. Cancel by dropping the future.
    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in the latch, which our own subscription keeps alive.
        let _ = rx.wait_for(|fired| *fired).await;
    }

    /// Wait at most `timeout`. Returns whether the watcher fired.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl std::fmt::Debug for DisconnectWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisconnectWatcher")
            .field("peer", &self.peer)
            .field("fired", &self.fired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_transport::Membership;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 16])
    }

    #[test]
    fn fires_immediately_for_absent_peer() {
        let m = Membership::new(peer(1));
        let w = DisconnectWatcher::new(&m, peer(2));
        assert!(w.fired());
        assert_eq!(m.subscriber_count(), 0);
    }

    #[test]
    fn fires_on_disconnect_of_that_peer_only() {
        let m = Membership::new(peer(1));
        m.connect(peer(2));
        m.connect(peer(3));
        let w = DisconnectWatcher::new(&m, peer(2));
        assert!(!w.fired());

        m.disconnect(&peer(3));
        assert!(!w.fired());

        m.disconnect(&peer(2));
        assert!(w.fired());

        // Reconnecting does not un-fire it.
        m.connect(peer(2));
        assert!(w.fired());
    }

    #[test]
    fn dropping_unsubscribes() {
        let m = Membership::new(peer(1));
        m.connect(peer(2));
        let w = DisconnectWatcher::new(&m, peer(2));
        assert_eq!(m.subscriber_count(), 1);
        drop(w);
        assert_eq!(m.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn wait_resolves_after_disconnect() {
        let m = Arc::new(Membership::new(peer(1)));
        m.connect(peer(2));
        let w = DisconnectWatcher::new(m.as_ref(), peer(2));
        assert!(!w.wait_timeout(Duration::from_millis(10)).await);

        let m2 = m.clone();
        let churn = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            m2.disconnect(&peer(2));
        });

        assert!(w.wait_timeout(Duration::from_secs(1)).await);
        churn.await.unwrap();
        // Waiting again returns at once.
        w.wait().await;
    }

    #[test]
    fn fires_once_across_churn() {
        let m = Membership::new(peer(1));
        m.connect(peer(2));
        let w = DisconnectWatcher::new(&m, peer(2));
        let mut rx = w.rx.clone();
        let mut changes = 0;

        for _ in 0..3 {
            m.disconnect(&peer(2));
            if rx.has_changed().unwrap_or(false) {
                changes += 1;
                let _ = rx.borrow_and_update();
            }
            m.connect(peer(2));
        }
        assert_eq!(changes, 1);
    }
}
