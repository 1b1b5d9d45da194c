use crate::PeerId;

/// Errors returned by the mesh transport layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer {0} is not connected")]
    PeerNotConnected(PeerId),

    #[error("no node bound for peer {0}")]
    UnknownNode(PeerId),

    #[error("invalid peer id: {0}")]
    InvalidPeerId(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("node is shut down")]
    Shutdown,
}

/// Failure to process one inbound message.
///
/// Aborts handling of that message only. The transport that invoked the
/// handler decides whether the whole connection goes down with it.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("message truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("incompatible peer {source_peer}: no client registered for tag {tag}")]
    IncompatiblePeer { tag: u8, source_peer: PeerId },

    #[error("payload encoding failed: {0}")]
    Encode(String),

    #[error("payload decoding failed: {0}")]
    Decode(String),

    #[error("handler rejected message: {0}")]
    Handler(String),
}
