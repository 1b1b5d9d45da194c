use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::membership::Membership;
use crate::{ConnectionSessionId, PeerId, TransportError};

/// A message queued for a node, stamped with the receiver-side session of
/// the link it travelled on.
pub(crate) struct Inbound {
    pub source: PeerId,
    pub session: ConnectionSessionId,
    pub payload: Bytes,
}

/// What the network knows about a bound node.
#[derive(Clone)]
pub(crate) struct NodeLink {
    pub membership: Arc<Membership>,
    pub inbox: mpsc::Sender<Inbound>,
}

/// In-process cluster: the set of bound [`LocalNode`](crate::LocalNode)s
/// and the links between them.
///
/// Cheap to clone; clones share the same nodes. Links are symmetric and
/// created or torn down explicitly, standing in for the sockets a real
/// transport would manage.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    nodes: Arc<RwLock<HashMap<PeerId, NodeLink>>>,
}

impl fmt::Debug for LocalNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalNetwork")
            .field("nodes", &self.nodes.read().len())
            .finish()
    }
}

impl LocalNetwork {
    /// An empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Link `a` and `b`. Both sides publish a connect; already linked sides
    /// publish nothing.
    pub fn connect(&self, a: PeerId, b: PeerId) -> Result<(), TransportError> {
        if a == b {
            return Ok(());
        }
        let (link_a, link_b) = {
            let nodes = self.nodes.read();
            let link_a = nodes.get(&a).cloned().ok_or(TransportError::UnknownNode(a))?;
            let link_b = nodes.get(&b).cloned().ok_or(TransportError::UnknownNode(b))?;
            (link_a, link_b)
        };
        link_a.membership.connect(b);
        link_b.membership.connect(a);
        Ok(())
    }

    /// Link every pair of bound nodes.
    pub fn connect_all(&self) {
        let ids = self.node_ids();
        for (i, a) in ids.iter().enumerate() {
            for b in ids.iter().skip(i + 1) {
                // Both ids came from the map; a concurrent unbind is the only failure.
                if let Err(e) = self.connect(*a, *b) {
                    tracing::debug!("connect_all skipped {a} <-> {b}: {e}");
                }
            }
        }
    }

    /// Tear down the link between `a` and `b` on both sides.
    pub fn disconnect(&self, a: PeerId, b: PeerId) {
        if a == b {
            return;
        }
        let (link_a, link_b) = {
            let nodes = self.nodes.read();
            (nodes.get(&a).cloned(), nodes.get(&b).cloned())
        };
        if let Some(link) = link_a {
            link.membership.disconnect(&b);
        }
        if let Some(link) = link_b {
            link.membership.disconnect(&a);
        }
    }

    /// Ids of all bound nodes, in `PeerId` order.
    pub fn node_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<_> = self.nodes.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub(crate) fn register(&self, id: PeerId, link: NodeLink) -> Result<(), TransportError> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&id) {
            return Err(TransportError::Config(format!("peer {id} is already bound")));
        }
        nodes.insert(id, link);
        Ok(())
    }

    pub(crate) fn unregister(&self, id: &PeerId) -> Option<NodeLink> {
        self.nodes.write().remove(id)
    }

    pub(crate) fn link(&self, id: &PeerId) -> Option<NodeLink> {
        self.nodes.read().get(id).cloned()
    }
}
