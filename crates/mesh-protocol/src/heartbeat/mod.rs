//! Heartbeat manager: detects dead connections.
//!
//! Every connected remote peer gets a missed-keepalive counter. Each period
//! the counter goes up by one and a keepalive is sent; any inbound message
//! from the peer resets it. A peer that stays silent for `max_keepalives`
//! periods is disconnected through [`ConnectionControl`], which shows up to
//! everyone as an ordinary disconnect.
//!
//! ```text
//! membership ──on_connect/on_disconnect──┐
//! handler()/observe() ──Message(peer)────┼──▶ worker task ──keepalive──▶ MessageService
//!                                        │        │
//!                       timer tick ──────┘        └──kill────▶ ConnectionControl
//! ```

mod table;
mod worker;

pub use table::{HeartbeatEffect, HeartbeatTable};

use std::sync::Arc;

use bytes::{Buf, Bytes};
use mesh_metrics::{Counter, Gauge};
use mesh_transport::{
    ConnectionControl, MeshConfig, MessageHandler, MessageService, PeerId, PeersListListener,
    PeersListSubscription, ProtocolError, TransportError,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use worker::{HeartbeatCommand, HeartbeatWorker};

#[derive(Default)]
pub(crate) struct HeartbeatCounters {
    keepalives_sent: Counter,
    resets: Counter,
    forced_disconnects: Counter,
    tracked_peers: Gauge,
}

/// Snapshot of heartbeat activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeartbeatStats {
    pub keepalives_sent: u64,
    /// Inbound messages that reset a tracked peer's counter.
    pub resets: u64,
    pub forced_disconnects: u64,
    pub tracked_peers: u64,
}

/// Feeds membership changes and inbound traffic to the worker.
#[derive(Clone)]
struct HeartbeatInbox {
    me: PeerId,
    tx: mpsc::UnboundedSender<HeartbeatCommand>,
}

impl HeartbeatInbox {
    fn send(&self, command: HeartbeatCommand) {
        // Closed only after shutdown, when nobody cares any more.
        let _ = self.tx.send(command);
    }
}

impl PeersListListener for HeartbeatInbox {
    fn on_connect(&self, peer: PeerId) {
        if peer != self.me {
            self.send(HeartbeatCommand::Connected(peer));
        }
    }

    fn on_disconnect(&self, peer: PeerId) {
        self.send(HeartbeatCommand::Disconnected(peer));
    }
}

/// Handler for the heartbeat sub-protocol: keepalives carry no payload.
struct KeepaliveHandler {
    inbox: HeartbeatInbox,
}

impl MessageHandler for KeepaliveHandler {
    fn on_message(&self, source: PeerId, payload: &mut Bytes) -> Result<(), ProtocolError> {
        if payload.has_remaining() {
            tracing::debug!(%source, len = payload.remaining(), "ignoring keepalive payload");
            payload.advance(payload.remaining());
        }
        self.inbox.send(HeartbeatCommand::Message(source));
        Ok(())
    }
}

/// Counts any inbound message as liveness, then forwards it.
struct LivenessTap {
    inbox: HeartbeatInbox,
    next: Arc<dyn MessageHandler>,
}

impl MessageHandler for LivenessTap {
    fn on_message(&self, source: PeerId, payload: &mut Bytes) -> Result<(), ProtocolError> {
        self.inbox.send(HeartbeatCommand::Message(source));
        self.next.on_message(source, payload)
    }
}

/// Owns the heartbeat worker task and its membership subscription.
///
/// Dropping the manager stops the worker; [`shutdown`](Self::shutdown)
/// does the same and waits for it.
pub struct HeartbeatManager {
    inbox: HeartbeatInbox,
    counters: Arc<HeartbeatCounters>,
    task: Option<JoinHandle<()>>,
    _subscription: PeersListSubscription,
}

impl std::fmt::Debug for HeartbeatManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatManager")
            .field("me", &self.inbox.me)
            .field("stats", &self.stats())
            .finish()
    }
}

impl HeartbeatManager {
    /// Start monitoring every peer connected through `service`.
    ///
    /// Keepalives go out through `service` (normally the [`MuxClient`] for
    /// [`HEARTBEAT_TAG`]); silent peers are killed through `control`.
    ///
    /// # Errors
    ///
    /// [`TransportError::Config`] when `config` does not validate. Nothing is
    /// spawned or subscribed then.
    ///
    /// # Panics
    ///
    /// Outside a tokio runtime, or from inside a membership notification.
    ///
    /// [`MuxClient`]: crate::MuxClient
    /// [`HEARTBEAT_TAG`]: crate::HEARTBEAT_TAG
    pub fn spawn(
        service: Arc<dyn MessageService>,
        control: Arc<dyn ConnectionControl>,
        config: &MeshConfig,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let me = service.connectivity().me();
        let inbox = HeartbeatInbox { me, tx };
        let counters = Arc::new(HeartbeatCounters::default());

        let mut subscription = PeersListSubscription::new(Arc::new(inbox.clone()));
        {
            let freeze = service.connectivity().membership().freeze();
            for peer in freeze.peers() {
                if peer != me {
                    inbox.send(HeartbeatCommand::Connected(peer));
                }
            }
            subscription.reset_to(&freeze);
        }

        let worker = HeartbeatWorker {
            me,
            table: HeartbeatTable::new(config.get_max_keepalives()),
            service,
            control,
            period: config.get_heartbeat_interval(),
            counters: counters.clone(),
        };
        let task = tokio::spawn(worker.run(rx));

        Ok(Self {
            inbox,
            counters,
            task: Some(task),
            _subscription: subscription,
        })
    }

    /// The local node, never tracked.
    pub fn me(&self) -> PeerId {
        self.inbox.me
    }

    /// Handler for the heartbeat tag. Install it with
    /// [`MuxClient::run`](crate::MuxClient::run).
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        Arc::new(KeepaliveHandler {
            inbox: self.inbox.clone(),
        })
    }

    /// Wrap `next` so every message it receives also resets the sender's
    /// counter. Wrap the multiplexer's handler to count all traffic.
    pub fn observe(&self, next: Arc<dyn MessageHandler>) -> Arc<dyn MessageHandler> {
        Arc::new(LivenessTap {
            inbox: self.inbox.clone(),
            next,
        })
    }

    /// Missed count of `peer` once the worker has caught up with everything
    /// sent to it so far. `Ok(None)` if the peer is not tracked.
    pub async fn missed_count(&self, peer: PeerId) -> Result<Option<u32>, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.inbox
            .tx
            .send(HeartbeatCommand::Query { peer, reply })
            .map_err(|_| TransportError::Shutdown)?;
        rx.await.map_err(|_| TransportError::Shutdown)
    }

    /// Counter snapshot; readable without a round trip to the worker.
    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            keepalives_sent: self.counters.keepalives_sent.get(),
            resets: self.counters.resets.get(),
            forced_disconnects: self.counters.forced_disconnects.get(),
            tracked_peers: self.counters.tracked_peers.get(),
        }
    }

    /// Stop the worker and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.inbox.send(HeartbeatCommand::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(me = %self.inbox.me, "heartbeat worker ended abnormally: {e}");
            }
        }
    }
}

impl Drop for HeartbeatManager {
    fn drop(&mut self) {
        if self.task.is_some() {
            self.inbox.send(HeartbeatCommand::Shutdown);
        }
    }
}
