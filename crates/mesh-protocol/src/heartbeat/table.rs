//! HeartbeatTable: per-peer missed-keepalive counters.
//!
//! Pure state machine: no timers, no I/O. The worker feeds it membership
//! events and inbound traffic, calls `tick()` once per heartbeat period and
//! executes the returned effects.
use std::collections::BTreeMap;

use mesh_transport::PeerId;

/// Action requested by a tick. Executed by the caller after `tick()` returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEffect {
    /// Send an empty keepalive to the peer.
    SendKeepalive(PeerId),
    /// The peer has been silent for too long; tear the connection down.
    ForceDisconnect(PeerId),
}

#[derive(Debug, Default, Clone, Copy)]
struct PeerLiveness {
    missed: u32,
    /// A forced disconnect has been requested for this connection. Only a
    /// reconnect clears it.
    kill_requested: bool,
}

/// Missed-keepalive counters for the connected remote peers.
#[derive(Debug)]
pub struct HeartbeatTable {
    peers: BTreeMap<PeerId, PeerLiveness>,
    max_keepalives: u32,
}

impl HeartbeatTable {
    /// Empty table; a peer is killed after `max_keepalives` silent ticks.
    pub fn new(max_keepalives: u32) -> Self {
        Self {
            peers: BTreeMap::new(),
            max_keepalives,
        }
    }

    /// Silent ticks tolerated before a forced disconnect.
    pub fn max_keepalives(&self) -> u32 {
        self.max_keepalives
    }

    /// Start tracking `peer` at zero. Returns true if it is the only
    /// tracked peer (the timer should start).
    pub fn on_connect(&mut self, peer: PeerId) -> bool {
        self.peers.insert(peer, PeerLiveness::default());
        self.peers.len() == 1
    }

    /// Stop tracking `peer`. Returns true if nothing is tracked any more
    /// (the timer should stop).
    pub fn on_disconnect(&mut self, peer: &PeerId) -> bool {
        self.peers.remove(peer);
        self.peers.is_empty()
    }

    /// Inbound traffic from `peer`. Returns true if the peer is tracked and
    /// its counter was reset.
    pub fn on_message(&mut self, peer: &PeerId) -> bool {
        match self.peers.get_mut(peer) {
            Some(liveness) => {
                liveness.missed = 0;
                true
            }
            None => false,
        }
    }

    /// Advance every tracked peer by one heartbeat period.
    pub fn tick(&mut self) -> Vec<HeartbeatEffect> {
        let mut effects = Vec::with_capacity(self.peers.len());
        for (&peer, liveness) in self.peers.iter_mut() {
            if liveness.kill_requested {
                continue;
            }
            if liveness.missed >= self.max_keepalives {
                liveness.kill_requested = true;
                effects.push(HeartbeatEffect::ForceDisconnect(peer));
            } else {
                liveness.missed += 1;
                effects.push(HeartbeatEffect::SendKeepalive(peer));
            }
        }
        effects
    }

    /// Current missed count, or `None` if `peer` is not tracked.
    pub fn missed(&self, peer: &PeerId) -> Option<u32> {
        self.peers.get(peer).map(|l| l.missed)
    }

    /// True while `peer` is tracked.
    pub fn contains(&self, peer: &PeerId) -> bool {
        self.peers.contains_key(peer)
    }

    /// Number of tracked peers.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// True when no peer is tracked.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 16])
    }

    #[test]
    fn connect_tick_message_tick() {
        let mut table = HeartbeatTable::new(5);
        assert!(table.on_connect(peer(2)));
        assert_eq!(table.missed(&peer(2)), Some(0));

        assert_eq!(table.tick(), vec![HeartbeatEffect::SendKeepalive(peer(2))]);
        assert_eq!(table.missed(&peer(2)), Some(1));

        assert!(table.on_message(&peer(2)));
        assert_eq!(table.missed(&peer(2)), Some(0));

        table.tick();
        assert_eq!(table.missed(&peer(2)), Some(1));
    }

    #[test]
    fn silent_peer_is_killed_once_on_tick_max_plus_one() {
        let mut table = HeartbeatTable::new(5);
        table.on_connect(peer(2));

        for _ in 0..5 {
            assert_eq!(table.tick(), vec![HeartbeatEffect::SendKeepalive(peer(2))]);
        }
        assert_eq!(table.tick(), vec![HeartbeatEffect::ForceDisconnect(peer(2))]);
        // Still tracked until the disconnect arrives, but never killed twice.
        assert!(table.tick().is_empty());
        assert!(table.tick().is_empty());

        assert!(table.on_disconnect(&peer(2)));
        assert!(table.on_connect(peer(2)));
        assert_eq!(table.missed(&peer(2)), Some(0));
    }

    #[test]
    fn message_postpones_timeout_by_full_window() {
        let mut table = HeartbeatTable::new(3);
        table.on_connect(peer(2));
        table.tick();
        table.tick();
        table.on_message(&peer(2));

        for _ in 0..3 {
            assert_eq!(table.tick(), vec![HeartbeatEffect::SendKeepalive(peer(2))]);
        }
        assert_eq!(table.tick(), vec![HeartbeatEffect::ForceDisconnect(peer(2))]);
    }

    #[test]
    fn first_and_last_peer_drive_the_timer() {
        let mut table = HeartbeatTable::new(5);
        assert!(table.on_connect(peer(2)));
        assert!(!table.on_connect(peer(3)));
        assert!(!table.on_disconnect(&peer(2)));
        assert!(table.on_disconnect(&peer(3)));
        assert!(table.is_empty());
    }

    #[test]
    fn untracked_traffic_is_ignored() {
        let mut table = HeartbeatTable::new(5);
        assert!(!table.on_message(&peer(9)));
        assert_eq!(table.missed(&peer(9)), None);
        assert!(table.tick().is_empty());
    }

    #[test]
    fn peers_tick_independently() {
        let mut table = HeartbeatTable::new(1);
        table.on_connect(peer(2));
        table.on_connect(peer(3));
        table.tick();
        table.on_message(&peer(3));

        let effects = table.tick();
        assert_eq!(
            effects,
            vec![
                HeartbeatEffect::ForceDisconnect(peer(2)),
                HeartbeatEffect::SendKeepalive(peer(3)),
            ]
        );
    }
}
