use std::collections::BTreeSet;

use crate::membership::Membership;
use crate::{ConnectionSessionId, PeerId, TransportError};

/// Read-only view of who is currently connected.
///
/// Every method has a default that reads the backing [`Membership`], so an
/// implementation only has to say where its membership lives.
pub trait ConnectivityService: Send + Sync {
    /// The publisher behind this view. Take freezes and install
    /// subscriptions through it.
    fn membership(&self) -> &Membership;

    /// The local node. Constant for the lifetime of the service.
    fn me(&self) -> PeerId {
        self.membership().me()
    }

    /// Snapshot of reachable peers, always including [`me`](Self::me).
    fn peers_list(&self) -> BTreeSet<PeerId> {
        self.membership().peers_list()
    }

    /// Same answer as `peers_list().contains(peer)` at every instant.
    fn is_peer_connected(&self, peer: &PeerId) -> bool {
        self.membership().is_peer_connected(peer)
    }

    /// Session of the current connection to `peer`.
    ///
    /// Errors with [`TransportError::PeerNotConnected`] when the peer is not
    /// connected. Check first, or call it from the `on_connect` notification
    /// for `peer`, where it is the session that was just opened.
    fn connection_session_id(&self, peer: &PeerId) -> Result<ConnectionSessionId, TransportError> {
        self.membership().connection_session_id(peer)
    }
}

impl ConnectivityService for Membership {
    fn membership(&self) -> &Membership {
        self
    }
}
