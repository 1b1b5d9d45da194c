use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::connectivity::ConnectivityService;
use crate::membership::Membership;
use crate::message::{ConnectionControl, MessageHandler, MessageService, MessageWriter};
use crate::network::{Inbound, LocalNetwork, NodeLink};
use crate::{PeerId, TransportError};

/// A cluster node on a [`LocalNetwork`]: bind, link, send, receive.
///
/// Implements [`MessageService`], [`ConnectivityService`] and
/// [`ConnectionControl`]. Inbound messages queue up until
/// [`run`](Self::run) attaches a handler, then are delivered in arrival
/// order by one task.
///
/// The node leaves the network on [`shutdown`](Self::shutdown), when its
/// [`NodeRun`] is dropped, or when the last handle to an idle node is
/// dropped. A running handler usually holds the node itself (through a
/// multiplexer, say), so for a running node the [`NodeRun`] is what decides.
pub struct LocalNode {
    id: PeerId,
    membership: Arc<Membership>,
    network: LocalNetwork,
    inbox: Mutex<Option<mpsc::Receiver<Inbound>>>,
    config: MeshConfig,
}

impl fmt::Debug for LocalNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNode").field("id", &self.id).finish()
    }
}

impl LocalNode {
    /// Bind a node with a fresh random identity.
    pub fn bind(network: &LocalNetwork, config: MeshConfig) -> Result<Arc<Self>, TransportError> {
        Self::bind_as(network, PeerId::random(), config)
    }

    /// Bind a node with a chosen identity.
    pub fn bind_as(
        network: &LocalNetwork,
        id: PeerId,
        config: MeshConfig,
    ) -> Result<Arc<Self>, TransportError> {
        config.validate()?;
        if id.is_nil() {
            return Err(TransportError::InvalidPeerId(id.to_string()));
        }

        let membership = Arc::new(Membership::new(id));
        let (inbox_tx, inbox_rx) = mpsc::channel(config.get_inbox_buffer());
        network.register(
            id,
            NodeLink {
                membership: membership.clone(),
                inbox: inbox_tx,
            },
        )?;
        tracing::debug!(%id, "node bound");

        Ok(Arc::new(Self {
            id,
            membership,
            network: network.clone(),
            inbox: Mutex::new(Some(inbox_rx)),
            config,
        }))
    }

    /// This node's identity.
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// The validated config this node was bound with.
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// The network this node is bound to.
    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    /// Link this node to `peer`.
    pub fn connect_to(&self, peer: PeerId) -> Result<(), TransportError> {
        self.network.connect(self.id, peer)
    }

    /// Start delivering inbound messages to `handler`.
    ///
    /// A handler error is logged and the link to the offending peer is torn
    /// down. Dropping the returned [`NodeRun`] stops delivery and shuts the
    /// node down.
    ///
    /// # Panics
    ///
    /// When called twice, or outside a tokio runtime.
    pub fn run(&self, handler: Arc<dyn MessageHandler>) -> NodeRun {
        let inbox = self.inbox.lock().take();
        let Some(inbox) = inbox else {
            panic!("LocalNode {} is already running", self.id);
        };
        let task = tokio::spawn(delivery_loop(
            self.id,
            self.membership.clone(),
            self.network.clone(),
            inbox,
            handler,
        ));
        NodeRun {
            id: self.id,
            membership: self.membership.clone(),
            network: self.network.clone(),
            task,
        }
    }

    /// Disconnect from every peer and leave the network. Idempotent.
    pub fn shutdown(&self) {
        leave(self.id, &self.membership, &self.network);
    }
}

fn leave(id: PeerId, membership: &Membership, network: &LocalNetwork) {
    for peer in membership.peers_list() {
        network.disconnect(id, peer);
    }
    if network.unregister(&id).is_some() {
        tracing::debug!(%id, "node shut down");
    }
}

impl Drop for LocalNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl ConnectivityService for LocalNode {
    fn membership(&self) -> &Membership {
        &self.membership
    }
}

impl MessageService for LocalNode {
    fn send_message(&self, dest: PeerId, writer: MessageWriter) {
        if !self.membership.is_peer_connected(&dest) {
            tracing::debug!(me = %self.id, %dest, "dropping message for unconnected peer");
            return;
        }
        let Some(link) = self.network.link(&dest) else {
            tracing::debug!(me = %self.id, %dest, "dropping message for unbound peer");
            return;
        };
        // The receiver stamps the session it knows us by; a reconnect in
        // between makes the message stale on arrival.
        let Ok(session) = link.membership.connection_session_id(&self.id) else {
            tracing::debug!(me = %self.id, %dest, "dropping message, link is half open");
            return;
        };

        let mut payload = BytesMut::new();
        writer(&mut payload);
        let inbound = Inbound {
            source: self.id,
            session,
            payload: payload.freeze(),
        };
        if let Err(e) = link.inbox.try_send(inbound) {
            tracing::warn!(me = %self.id, %dest, "dropping message: {e}");
        }
    }

    fn connectivity(&self) -> &dyn ConnectivityService {
        self
    }
}

impl ConnectionControl for LocalNode {
    fn kill_connection(&self, peer: PeerId) {
        if peer == self.id {
            tracing::warn!(me = %self.id, "refusing to kill the connection to ourselves");
            return;
        }
        tracing::info!(me = %self.id, %peer, "killing connection");
        self.network.disconnect(self.id, peer);
    }
}

/// Delivery task of a running [`LocalNode`].
///
/// Dropping it stops delivery and takes the node off the network, like
/// [`LocalNode::shutdown`].
pub struct NodeRun {
    id: PeerId,
    membership: Arc<Membership>,
    network: LocalNetwork,
    task: JoinHandle<()>,
}

impl fmt::Debug for NodeRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRun")
            .field("id", &self.id)
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl NodeRun {
    /// True once the delivery task has ended: the node was shut down and
    /// everything queued before that has been delivered.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for NodeRun {
    fn drop(&mut self) {
        self.task.abort();
        leave(self.id, &self.membership, &self.network);
    }
}

async fn delivery_loop(
    me: PeerId,
    membership: Arc<Membership>,
    network: LocalNetwork,
    mut inbox: mpsc::Receiver<Inbound>,
    handler: Arc<dyn MessageHandler>,
) {
    while let Some(Inbound {
        source,
        session,
        mut payload,
    }) = inbox.recv().await
    {
        match membership.connection_session_id(&source) {
            Ok(current) if current == session => {}
            _ => {
                tracing::debug!(%me, %source, "discarding message from a closed session");
                continue;
            }
        }

        if let Err(e) = handler.on_message(source, &mut payload) {
            tracing::warn!(%me, %source, "protocol error, dropping connection: {e}");
            network.disconnect(me, source);
        }
    }
    tracing::debug!(%me, "delivery loop finished");
}
