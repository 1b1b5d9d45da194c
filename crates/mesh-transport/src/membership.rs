//! Peers-list publisher.
//!
//! [`Membership`] owns the connected-peers set and the list of listeners
//! that want to hear about changes. A change is applied under the write half
//! of one reader/writer lock, which is then downgraded to a read and held
//! until every listener has been called; a [`PeersListFreeze`] holds the
//! read half. A consumer that reads state through a freeze and attaches a
//! [`PeersListSubscription`] before dropping it sees every later change
//! exactly once.
//!
//! Two thread-local rules back this up and fail loudly when broken:
//! no change may be published on a thread that holds a freeze, and no freeze
//! may be taken (nor change published) from inside a notification. Plain
//! reads (`peers_list`, `is_peer_connected`, `connection_session_id`) are
//! fine anywhere, and inside a notification they already include the change
//! being delivered.

use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{ConnectionSessionId, PeerId, TransportError};

thread_local! {
    static FREEZE_DEPTH: Cell<usize> = const { Cell::new(0) };
    static DISPATCHING: Cell<bool> = const { Cell::new(false) };
}

/// Receives membership changes.
///
/// Called synchronously while the change is being published, so it must not
/// block, take a [`PeersListFreeze`], or publish changes of its own. Forward
/// the event to a task if real work is needed.
///
/// Reading the membership from a callback is allowed: in `on_connect` the
/// peer is already connected and its session id is available, in
/// `on_disconnect` it is already gone.
pub trait PeersListListener: Send + Sync {
    fn on_connect(&self, peer: PeerId);
    fn on_disconnect(&self, peer: PeerId);
}

struct MembershipState {
    peers: BTreeMap<PeerId, ConnectionSessionId>,
}

#[derive(Default)]
struct ListenerRegistry {
    next_id: u64,
    listeners: BTreeMap<u64, Arc<dyn PeersListListener>>,
}

/// The authoritative connected-peers set plus its subscribers.
pub struct Membership {
    me: PeerId,
    state: RwLock<MembershipState>,
    registry: Arc<Mutex<ListenerRegistry>>,
}

impl fmt::Debug for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Membership")
            .field("me", &self.me)
            .field("listeners", &self.registry.lock().listeners.len())
            .finish_non_exhaustive()
    }
}

impl Membership {
    /// Start with only the local node connected.
    pub fn new(me: PeerId) -> Self {
        let mut peers = BTreeMap::new();
        peers.insert(me, ConnectionSessionId::random());
        Self {
            me,
            state: RwLock::new(MembershipState { peers }),
            registry: Arc::new(Mutex::new(ListenerRegistry::default())),
        }
    }

    /// The local node.
    pub fn me(&self) -> PeerId {
        self.me
    }

    /// Connected peers, including the local node.
    pub fn peers_list(&self) -> BTreeSet<PeerId> {
        self.read().peers.keys().copied().collect()
    }

    /// True while `peer` is connected; the local node always is.
    pub fn is_peer_connected(&self, peer: &PeerId) -> bool {
        self.read().peers.contains_key(peer)
    }

    /// Session of the current connection to `peer`. Inside an `on_connect`
    /// notification for `peer` this is the session just opened.
    pub fn connection_session_id(
        &self,
        peer: &PeerId,
    ) -> Result<ConnectionSessionId, TransportError> {
        session_of(&self.read(), peer)
    }

    // Recursive, so it also works on a thread that is delivering a change.
    fn read(&self) -> RwLockReadGuard<'_, MembershipState> {
        self.state.read_recursive()
    }

    /// Block membership changes until the returned freeze is dropped.
    ///
    /// # Panics
    ///
    /// When called from inside a membership notification.
    pub fn freeze(&self) -> PeersListFreeze<'_> {
        assert!(
            !DISPATCHING.with(Cell::get),
            "PeersListFreeze taken from inside a membership notification"
        );
        // Recursive read: a second freeze on this thread must not queue behind a waiting writer.
        let state = self.state.read_recursive();
        PeersListFreeze {
            membership: self,
            state,
            _depth: FreezeDepth::enter(),
        }
    }

    /// Attach `listener` under `freeze`. Shorthand for
    /// [`PeersListSubscription::new`] followed by
    /// [`reset_to`](PeersListSubscription::reset_to).
    pub fn subscribe(
        &self,
        freeze: &PeersListFreeze<'_>,
        listener: Arc<dyn PeersListListener>,
    ) -> PeersListSubscription {
        freeze.assert_is_holding(self);
        let mut subscription = PeersListSubscription::new(listener);
        subscription.reset_to(freeze);
        subscription
    }

    /// Record a new connection to `peer` and notify listeners.
    ///
    /// Returns the new session id, or `None` if the peer was already
    /// connected (nothing is published then).
    ///
    /// # Panics
    ///
    /// When a freeze is held on this thread, when called from a notification,
    /// or when `peer` is the local node.
    pub fn connect(&self, peer: PeerId) -> Option<ConnectionSessionId> {
        assert_ne!(peer, self.me, "the local node is always connected");
        assert_publish_allowed();

        let mut state = self.state.write();
        if state.peers.contains_key(&peer) {
            tracing::debug!(me = %self.me, %peer, "connect for already connected peer ignored");
            return None;
        }
        let session = ConnectionSessionId::random();
        state.peers.insert(peer, session);
        tracing::debug!(me = %self.me, %peer, %session, "peer connected");
        self.dispatch(state, |listener| listener.on_connect(peer));
        Some(session)
    }

    /// Drop the connection to `peer` and notify listeners.
    ///
    /// Returns the session that ended, or `None` if the peer was not
    /// connected.
    ///
    /// # Panics
    ///
    /// Same conditions as [`connect`](Self::connect).
    pub fn disconnect(&self, peer: &PeerId) -> Option<ConnectionSessionId> {
        assert_ne!(*peer, self.me, "the local node cannot disconnect from itself");
        assert_publish_allowed();

        let mut state = self.state.write();
        let session = state.peers.remove(peer)?;
        tracing::debug!(me = %self.me, %peer, %session, "peer disconnected");
        self.dispatch(state, |listener| listener.on_disconnect(*peer));
        Some(session)
    }

    /// Number of attached subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.registry.lock().listeners.len()
    }

    // Listeners are collected while writes and freezes are still locked out,
    // so one attached later only sees the change through its snapshot. The
    // read half stays held until delivery is done.
    fn dispatch(
        &self,
        state: RwLockWriteGuard<'_, MembershipState>,
        notify: impl Fn(&dyn PeersListListener),
    ) {
        let listeners: Vec<_> = self.registry.lock().listeners.values().cloned().collect();
        let _state = RwLockWriteGuard::downgrade(state);
        let _dispatching = DispatchScope::enter();
        for listener in &listeners {
            notify(listener.as_ref());
        }
    }

    fn register(&self, listener: Arc<dyn PeersListListener>) -> Registration {
        let mut registry = self.registry.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.insert(id, listener);
        tracing::trace!(me = %self.me, subscription = id, "subscription attached");
        Registration {
            registry: Arc::downgrade(&self.registry),
            id,
        }
    }
}

fn session_of(
    state: &MembershipState,
    peer: &PeerId,
) -> Result<ConnectionSessionId, TransportError> {
    state
        .peers
        .get(peer)
        .copied()
        .ok_or(TransportError::PeerNotConnected(*peer))
}

fn assert_publish_allowed() {
    assert_eq!(
        FREEZE_DEPTH.with(Cell::get),
        0,
        "membership change published while a PeersListFreeze is held on this thread"
    );
    assert!(
        !DISPATCHING.with(Cell::get),
        "membership change published from inside a membership notification"
    );
}

/// Counts live freezes on the current thread. Pinned to its thread.
struct FreezeDepth(PhantomData<*const ()>);

impl FreezeDepth {
    fn enter() -> Self {
        FREEZE_DEPTH.with(|depth| depth.set(depth.get() + 1));
        Self(PhantomData)
    }
}

impl Drop for FreezeDepth {
    fn drop(&mut self) {
        FREEZE_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

struct DispatchScope {
    previous: bool,
}

impl DispatchScope {
    fn enter() -> Self {
        Self {
            previous: DISPATCHING.with(|d| d.replace(true)),
        }
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        DISPATCHING.with(|d| d.set(self.previous));
    }
}

/// Proof that no membership change can be applied while it is alive.
///
/// A change already applied may still be reaching listeners that were
/// attached before it; a subscription made under this freeze never sees
/// that change, only the state that includes it.
///
/// Holds a read acquisition of the membership lock. It is `!Send`, so it
/// cannot be carried across an `.await` in a spawned task; keep it to a
/// short, non-suspending section.
pub struct PeersListFreeze<'a> {
    membership: &'a Membership,
    state: RwLockReadGuard<'a, MembershipState>,
    _depth: FreezeDepth,
}

impl fmt::Debug for PeersListFreeze<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeersListFreeze")
            .field("me", &self.membership.me)
            .field("peers", &self.state.peers.len())
            .finish()
    }
}

impl<'a> PeersListFreeze<'a> {
    /// Connected peers as of this freeze, including the local node.
    pub fn peers(&self) -> BTreeSet<PeerId> {
        self.state.peers.keys().copied().collect()
    }

    /// Same as `peers().contains(peer)`.
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.state.peers.contains_key(peer)
    }

    /// Session of `peer` as of this freeze.
    pub fn connection_session_id(
        &self,
        peer: &PeerId,
    ) -> Result<ConnectionSessionId, TransportError> {
        session_of(&self.state, peer)
    }

    /// The membership this freeze guards.
    pub fn membership(&self) -> &'a Membership {
        self.membership
    }

    /// # Panics
    ///
    /// When this freeze guards a different membership.
    pub fn assert_is_holding(&self, membership: &Membership) {
        assert!(
            std::ptr::eq(self.membership, membership),
            "PeersListFreeze guards a different membership"
        );
        debug_assert!(FREEZE_DEPTH.with(Cell::get) > 0);
    }
}

struct Registration {
    registry: Weak<Mutex<ListenerRegistry>>,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().listeners.remove(&self.id);
            tracing::trace!(subscription = self.id, "subscription detached");
        }
    }
}

/// A listener plus, while attached, its registration with a [`Membership`].
///
/// The subscription owns the listener through an `Arc`, and dropping the
/// subscription detaches it, so a publisher never outlives what it calls.
/// A notification already in flight on another thread may still reach the
/// listener right after a detach.
pub struct PeersListSubscription {
    listener: Arc<dyn PeersListListener>,
    registration: Option<Registration>,
}

impl fmt::Debug for PeersListSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeersListSubscription")
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl PeersListSubscription {
    /// A detached subscription. Nothing is delivered until
    /// [`reset_to`](Self::reset_to).
    pub fn new(listener: Arc<dyn PeersListListener>) -> Self {
        Self {
            listener,
            registration: None,
        }
    }

    /// Detach. No further notifications are started for this listener.
    pub fn reset(&mut self) {
        self.registration = None;
    }

    /// Attach to the membership guarded by `freeze`, detaching from any
    /// previous one first. The listener hears every change published after
    /// `freeze` is released.
    pub fn reset_to(&mut self, freeze: &PeersListFreeze<'_>) {
        self.reset();
        self.registration = Some(freeze.membership.register(self.listener.clone()));
    }

    /// True while attached to a membership that still exists.
    pub fn is_attached(&self) -> bool {
        self.registration
            .as_ref()
            .is_some_and(|r| r.registry.strong_count() > 0)
    }

    /// The listener this subscription delivers to.
    pub fn listener(&self) -> &Arc<dyn PeersListListener> {
        &self.listener
    }
}
