//! Mesh cluster protocol layer.
//!
//! Built on the `mesh-transport` contracts:
//! - [`DisconnectWatcher`]: one-shot latch for "this peer went away".
//! - [`MessageMultiplexer`]: independent sub-protocols over one transport,
//!   told apart by a one-byte tag.
//! - [`HeartbeatManager`]: keepalives and forced disconnects for silent peers.
//!
//! Wire format: `[tag: u8][sub-protocol bytes]`. Sub-protocol payloads that
//! carry structured values use MessagePack (see [`codec`]).

pub mod codec;
pub mod heartbeat;
pub mod mux;
pub mod watcher;

pub use heartbeat::{HeartbeatEffect, HeartbeatManager, HeartbeatStats, HeartbeatTable};
pub use mux::{ClientRun, MessageMultiplexer, MuxClient, MuxRun, MuxStats, Tag, TagStats};
pub use watcher::DisconnectWatcher;

/// Multiplexer tag reserved for heartbeat keepalives.
pub const HEARTBEAT_TAG: Tag = 0;
