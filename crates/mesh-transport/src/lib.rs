//! Mesh cluster transport layer.
//!
//! Defines who the nodes of a cluster are ([`PeerId`]), who is reachable
//! right now ([`ConnectivityService`], [`Membership`]), and how bytes move
//! between them ([`MessageService`], [`MessageHandler`]).
//!
//! Membership changes are published through [`Membership`]. Consumers take a
//! [`PeersListFreeze`] to read the current peer set and install a
//! [`PeersListSubscription`] in the same step, so no connect or disconnect
//! can slip between the two.
//!
//! [`LocalNetwork`] / [`LocalNode`] implement the contracts in-process.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use mesh_transport::{message_writer, LocalNetwork, LocalNode, MeshConfig, MessageService};
//!
//! # async fn example() -> Result<(), mesh_transport::TransportError> {
//! let network = LocalNetwork::new();
//! let a = LocalNode::bind(&network, MeshConfig::new())?;
//! let b = LocalNode::bind(&network, MeshConfig::new())?;
//! network.connect(a.id(), b.id())?;
//!
//! a.send_message(b.id(), message_writer(|out| out.extend_from_slice(b"hello")));
//! # Ok(())
//! # }
//! ```

mod config;
mod connectivity;
mod error;
mod membership;
mod message;
mod network;
mod node;

pub use config::{MeshConfig, HEARTBEAT_INTERVAL_MS, MAX_KEEPALIVES, MAX_TAG};
pub use connectivity::ConnectivityService;
pub use error::{ProtocolError, TransportError};
pub use membership::{Membership, PeersListFreeze, PeersListListener, PeersListSubscription};
pub use message::{message_writer, ConnectionControl, MessageHandler, MessageService, MessageWriter};
pub use network::LocalNetwork;
pub use node::{LocalNode, NodeRun};

// Re-exported so handler implementations share one `bytes` version.
pub use bytes;

use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

/// Identity of a cluster node.
///
/// Wraps a 128-bit UUID. Ordering and equality are those of the UUID bytes.
/// The nil id stands for "no peer".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PeerId(Uuid);

impl PeerId {
    /// Fresh random identity, generated once per node.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The "no peer" id.
    pub const fn nil() -> Self {
        Self(Uuid::nil())
    }

    /// True for the all-zero id.
    pub fn is_nil(&self) -> bool {
        self.0.is_nil()
    }

    /// Wrap an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Build an id from raw bytes; handy for fixed ids in tests.
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The raw 16 bytes, in the order that defines `Ord`.
    pub fn as_bytes(&self) -> [u8; 16] {
        *self.0.as_bytes()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "PeerId({}...)", &simple[..8])
    }
}

impl FromStr for PeerId {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uuid = Uuid::parse_str(s).map_err(|_| TransportError::InvalidPeerId(s.to_string()))?;
        Ok(Self(uuid))
    }
}

impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifies one connection to a peer.
///
/// Minted on every connect, so a peer that drops and comes back gets a new
/// session id. Lets consumers tell "same peer, new connection" apart.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct ConnectionSessionId(Uuid);

impl ConnectionSessionId {
    /// A fresh random session id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConnectionSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
