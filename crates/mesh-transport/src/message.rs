use bytes::{Bytes, BytesMut};

use crate::connectivity::ConnectivityService;
use crate::{PeerId, ProtocolError};

/// Serializes one outbound message.
///
/// Invoked by the transport, possibly later and on another thread, with the
/// buffer that becomes the message body.
pub type MessageWriter = Box<dyn FnOnce(&mut BytesMut) + Send>;

/// Box a closure as a [`MessageWriter`], letting the closure's argument type
/// be inferred.
pub fn message_writer<F>(write: F) -> MessageWriter
where
    F: FnOnce(&mut BytesMut) + Send + 'static,
{
    Box::new(write)
}

/// Sends messages to connected peers.
pub trait MessageService: Send + Sync {
    /// Queue a message for `dest`. Fire-and-forget: no acknowledgement, and
    /// ordering is whatever the transport provides (FIFO per peer for
    /// [`LocalNode`](crate::LocalNode)). Messages to peers that are not
    /// connected are dropped.
    fn send_message(&self, dest: PeerId, writer: MessageWriter);

    /// Membership view that decides who `send_message` can reach.
    fn connectivity(&self) -> &dyn ConnectivityService;
}

/// Receives messages from peers.
pub trait MessageHandler: Send + Sync {
    /// Handle one message from `source`.
    ///
    /// Consume the prefix of `payload` this handler owns. Must not block. An
    /// error aborts this message; the transport decides what happens to the
    /// connection.
    fn on_message(&self, source: PeerId, payload: &mut Bytes) -> Result<(), ProtocolError>;
}

/// Forced teardown of connections.
pub trait ConnectionControl: Send + Sync {
    /// Drop the connection to `peer`. Subscribers see an ordinary
    /// disconnect. No-op if the peer is not connected.
    fn kill_connection(&self, peer: PeerId);
}
