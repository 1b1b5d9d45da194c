//! Tag-based message multiplexer.
//!
//! Many sub-protocols share one [`MessageService`]. Each registers a
//! [`MuxClient`] on its own tag; outbound messages are prefixed with the tag
//! byte and inbound ones are routed to the handler registered for it.
//!
//! Lifecycle, enforced with panics:
//! 1. register clients with [`MessageMultiplexer::client`],
//! 2. attach a handler to each with [`MuxClient::run`],
//! 3. start dispatch with [`MessageMultiplexer::run`] and install
//!    [`MuxRun::handler`] on the transport,
//! 4. tear down in reverse order.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes};
use mesh_metrics::Counter;
use mesh_transport::{
    message_writer, ConnectivityService, MeshConfig, MessageHandler, MessageService, MessageWriter,
    PeerId, ProtocolError, TransportError, MAX_TAG,
};
use parking_lot::RwLock;
use serde::Serialize;

/// Sub-protocol identifier, the first byte of every multiplexed message.
pub type Tag = u8;

struct Slot {
    client_id: u64,
    handler: Option<Arc<dyn MessageHandler>>,
}

#[derive(Default)]
struct TagCounters {
    sent: Counter,
    received: Counter,
}

struct MuxShared {
    service: Arc<dyn MessageService>,
    slots: RwLock<Vec<Option<Slot>>>,
    running: AtomicBool,
    next_client_id: AtomicU64,
    counters: Vec<TagCounters>,
    rejected: Counter,
}

/// Routes messages between one transport and up to `max_tag` sub-protocols.
pub struct MessageMultiplexer {
    shared: Arc<MuxShared>,
}

impl fmt::Debug for MessageMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageMultiplexer")
            .field("max_tag", &self.max_tag())
            .field("running", &self.is_running())
            .finish()
    }
}

impl MessageMultiplexer {
    /// # Panics
    ///
    /// When `max_tag` is not in `1..=256`.
    pub fn new(service: Arc<dyn MessageService>, max_tag: usize) -> Self {
        assert!(
            (1..=MAX_TAG).contains(&max_tag),
            "max_tag must be in 1..={MAX_TAG}, got {max_tag}"
        );
        let slots = (0..max_tag).map(|_| None).collect();
        let counters = (0..max_tag).map(|_| TagCounters::default()).collect();
        Self {
            shared: Arc::new(MuxShared {
                service,
                slots: RwLock::new(slots),
                running: AtomicBool::new(false),
                next_client_id: AtomicU64::new(0),
                counters,
                rejected: Counter::new(),
            }),
        }
    }

    /// Tag space taken from `config`, which must validate.
    pub fn from_config(
        service: Arc<dyn MessageService>,
        config: &MeshConfig,
    ) -> Result<Self, TransportError> {
        config.validate()?;
        Ok(Self::new(service, config.get_max_tag()))
    }

    /// Size of the tag space; valid tags are `0..max_tag`.
    pub fn max_tag(&self) -> usize {
        self.shared.counters.len()
    }

    /// True while a [`MuxRun`] is alive.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Register the sub-protocol for `tag`. Dropping the client frees the tag.
    ///
    /// # Panics
    ///
    /// When `tag` is out of range or taken, or the multiplexer is running.
    pub fn client(&self, tag: Tag) -> MuxClient {
        let mut slots = self.shared.slots.write();
        assert!(
            !self.shared.running.load(Ordering::Acquire),
            "mux client for tag {tag} registered while the multiplexer is running"
        );
        let max_tag = slots.len();
        let Some(slot) = slots.get_mut(usize::from(tag)) else {
            panic!("tag {tag} out of range (max_tag = {max_tag})");
        };
        assert!(slot.is_none(), "tag {tag} already has a client");

        let client_id = self.shared.next_client_id.fetch_add(1, Ordering::Relaxed);
        *slot = Some(Slot {
            client_id,
            handler: None,
        });
        tracing::debug!(tag, "mux client registered");

        MuxClient {
            shared: self.shared.clone(),
            tag,
            client_id,
        }
    }

    /// Start dispatching inbound messages.
    ///
    /// # Panics
    ///
    /// When already running, or when a registered client has no active
    /// [`ClientRun`].
    pub fn run(&self) -> MuxRun {
        let slots = self.shared.slots.write();
        for (tag, slot) in slots.iter().enumerate() {
            if let Some(slot) = slot {
                assert!(
                    slot.handler.is_some(),
                    "mux client for tag {tag} has no active run"
                );
            }
        }
        let was_running = self.shared.running.swap(true, Ordering::AcqRel);
        assert!(!was_running, "multiplexer is already running");
        drop(slots);

        tracing::debug!("multiplexer running");
        MuxRun {
            dispatch: Arc::new(MuxDispatch {
                shared: self.shared.clone(),
            }),
        }
    }

    /// Per-tag traffic so far.
    pub fn stats(&self) -> MuxStats {
        let tags = self
            .shared
            .counters
            .iter()
            .enumerate()
            .filter_map(|(tag, c)| {
                let (sent, received) = (c.sent.get(), c.received.get());
                (sent > 0 || received > 0).then(|| TagStats {
                    tag: tag as Tag,
                    sent,
                    received,
                })
            })
            .collect();
        MuxStats {
            tags,
            rejected: self.shared.rejected.get(),
        }
    }
}

/// Snapshot of multiplexer traffic. Only tags that saw traffic are listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MuxStats {
    pub tags: Vec<TagStats>,
    /// Inbound messages refused for an unregistered tag.
    pub rejected: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagStats {
    pub tag: Tag,
    pub sent: u64,
    pub received: u64,
}

/// The sub-protocol registered on one tag. Sends through the multiplexer.
pub struct MuxClient {
    shared: Arc<MuxShared>,
    tag: Tag,
    client_id: u64,
}

impl fmt::Debug for MuxClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxClient").field("tag", &self.tag).finish()
    }
}

impl MuxClient {
    /// The tag this client sends and receives on.
    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// Deliver this tag's inbound messages to `handler` until the returned
    /// [`ClientRun`] is dropped.
    ///
    /// # Panics
    ///
    /// When this client already has an active run.
    pub fn run(&self, handler: Arc<dyn MessageHandler>) -> ClientRun {
        let mut slots = self.shared.slots.write();
        let slot = slots
            .get_mut(usize::from(self.tag))
            .and_then(Option::as_mut)
            .filter(|slot| slot.client_id == self.client_id);
        let Some(slot) = slot else {
            panic!("mux client for tag {} is not registered", self.tag);
        };
        assert!(
            slot.handler.is_none(),
            "mux client for tag {} already has an active run",
            self.tag
        );
        slot.handler = Some(handler);

        ClientRun {
            shared: self.shared.clone(),
            tag: self.tag,
            client_id: self.client_id,
        }
    }
}

impl MessageService for MuxClient {
    fn send_message(&self, dest: PeerId, writer: MessageWriter) {
        let tag = self.tag;
        self.shared.counters[usize::from(tag)].sent.inc();
        self.shared.service.send_message(
            dest,
            message_writer(move |out| {
                out.put_u8(tag);
                writer(out);
            }),
        );
    }

    fn connectivity(&self) -> &dyn ConnectivityService {
        self.shared.service.connectivity()
    }
}

impl Drop for MuxClient {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(
                !self.shared.running.load(Ordering::Acquire),
                "mux client for tag {} dropped while the multiplexer is running",
                self.tag
            );
        }
        let mut slots = self.shared.slots.write();
        if let Some(slot) = slots.get_mut(usize::from(self.tag)) {
            if slot.as_ref().is_some_and(|s| s.client_id == self.client_id) {
                *slot = None;
                tracing::debug!(tag = self.tag, "mux client released");
            }
        }
    }
}

/// Active handler attachment of a [`MuxClient`].
pub struct ClientRun {
    shared: Arc<MuxShared>,
    tag: Tag,
    client_id: u64,
}

impl fmt::Debug for ClientRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRun").field("tag", &self.tag).finish()
    }
}

impl Drop for ClientRun {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            assert!(
                !self.shared.running.load(Ordering::Acquire),
                "client run for tag {} dropped while the multiplexer is running",
                self.tag
            );
        }
        let mut slots = self.shared.slots.write();
        if let Some(Some(slot)) = slots.get_mut(usize::from(self.tag)) {
            if slot.client_id == self.client_id {
                slot.handler = None;
            }
        }
    }
}

/// The running multiplexer. Dispatch stops when it is dropped.
///
/// Install [`handler`](Self::handler) on the transport. The handle may
/// outlive this guard (a transport task can drop it late); messages that
/// reach it afterwards are discarded.
pub struct MuxRun {
    dispatch: Arc<MuxDispatch>,
}

impl fmt::Debug for MuxRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MuxRun").finish_non_exhaustive()
    }
}

impl MuxRun {
    /// Inbound handler to install on the underlying transport.
    pub fn handler(&self) -> Arc<dyn MessageHandler> {
        self.dispatch.clone()
    }
}

impl MessageHandler for MuxRun {
    fn on_message(&self, source: PeerId, payload: &mut Bytes) -> Result<(), ProtocolError> {
        self.dispatch.on_message(source, payload)
    }
}

impl Drop for MuxRun {
    fn drop(&mut self) {
        // Taken under the slot lock so no dispatch sees a half-torn-down table.
        let _slots = self.dispatch.shared.slots.write();
        self.dispatch.shared.running.store(false, Ordering::Release);
        tracing::debug!("multiplexer stopped");
    }
}

struct MuxDispatch {
    shared: Arc<MuxShared>,
}

impl MessageHandler for MuxDispatch {
    fn on_message(&self, source: PeerId, payload: &mut Bytes) -> Result<(), ProtocolError> {
        if payload.is_empty() {
            return Err(ProtocolError::Truncated {
                needed: 1,
                remaining: 0,
            });
        }
        let tag = payload.get_u8();

        let handler = {
            let slots = self.shared.slots.read();
            if !self.shared.running.load(Ordering::Acquire) {
                tracing::debug!(%source, tag, "multiplexer stopped, message discarded");
                return Ok(());
            }
            slots
                .get(usize::from(tag))
                .and_then(Option::as_ref)
                .and_then(|slot| slot.handler.clone())
        };

        let Some(handler) = handler else {
            self.shared.rejected.inc();
            tracing::error!(%source, tag, "message for a tag with no client, incompatible peer");
            return Err(ProtocolError::IncompatiblePeer {
                tag,
                source_peer: source,
            });
        };
        self.shared.counters[usize::from(tag)].received.inc();
        handler.on_message(source, payload)
    }
}
