//! The synchronization engine: one owner-scoped collection kept consistent
//! with the remote store through two uncoordinated channels.
//!
//! - The [mutation coordinator](coordinator) applies the user's deletes
//!   optimistically, inserts created items once the store has assigned their
//!   id, and falls back to a full resync when a delete fails.
//! - The [feed subscriber](feed) applies pushed changes from every session of
//!   the owner, this one included.
//!
//! Both go through the same [`Reconciler`], whose idempotent rule is what
//! makes their arrival order irrelevant.
//!
//! # Threading
//!
//! Everything runs on one cooperative event loop. State lives in a `RefCell`
//! and no borrow is ever held across an `.await`; remote calls and feed
//! delivery are the only suspension points.
//!
//! # Lifecycle
//!
//! [`SyncEngine::activate`] takes a [`Session`] and returns the [`FeedTask`]
//! the host spawns. [`SyncEngine::teardown`] drops the subscription, aborts
//! the task, and hands the session back. Calls still in flight when their
//! session ends complete without touching the store.

pub mod coordinator;
pub mod feed;
mod listeners;

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use futures::future::{AbortHandle, AbortRegistration};
use tracing::info;

use crate::config::EngineConfig;
use crate::error::SyncError;
use crate::model::{ChangeEvent, ChangeKind, Item, ItemId, MutationKind, OwnerId, PendingMutation};
use crate::reconcile::{Applied, Reconciler};
use crate::remote::{FeedStream, RemoteStore};

pub use feed::{FeedExit, FeedTask};
pub use listeners::ListenerKey;

use listeners::Listeners;

/// Explicit handle for the signed-in owner, passed in at activation and
/// returned at teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    owner: OwnerId,
}

impl Session {
    #[must_use]
    pub const fn new(owner: OwnerId) -> Self {
        Self { owner }
    }

    #[must_use]
    pub const fn owner(&self) -> &OwnerId {
        &self.owner
    }
}

struct ActiveSession {
    session: Session,
    generation: u64,
    reconciler: Reconciler,
    pending: BTreeMap<u64, PendingMutation>,
    feed: Option<FeedStream>,
    feed_abort: Option<AbortHandle>,
}

impl ActiveSession {
    fn pending_deletes(&self) -> Vec<ItemId> {
        self.pending
            .values()
            .filter(|pending| pending.kind == MutationKind::Delete)
            .filter_map(|pending| pending.target.clone())
            .collect()
    }
}

#[derive(Default)]
struct EngineState {
    generation: u64,
    next_token: u64,
    active: Option<ActiveSession>,
}

/// Owner-scoped sync engine over a [`RemoteStore`].
///
/// Cloning is cheap and every clone drives the same state.
pub struct SyncEngine<R> {
    remote: Rc<R>,
    config: Rc<EngineConfig>,
    state: Rc<RefCell<EngineState>>,
    listeners: Rc<RefCell<Listeners>>,
}

impl<R> Clone for SyncEngine<R> {
    fn clone(&self) -> Self {
        Self {
            remote: Rc::clone(&self.remote),
            config: Rc::clone(&self.config),
            state: Rc::clone(&self.state),
            listeners: Rc::clone(&self.listeners),
        }
    }
}

impl<R: RemoteStore + 'static> SyncEngine<R> {
    #[must_use]
    pub fn new(remote: R, config: EngineConfig) -> Self {
        Self {
            remote: Rc::new(remote),
            config: Rc::new(config),
            state: Rc::new(RefCell::new(EngineState::default())),
            listeners: Rc::new(RefCell::new(Listeners::default())),
        }
    }

    #[must_use]
    pub fn remote(&self) -> &R {
        &self.remote
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Start a session: release any previous one, open the owner's feed, then
    /// load the initial snapshot.
    ///
    /// The feed is opened before the snapshot is fetched so no change can
    /// fall between the two; whatever overlaps is deduplicated.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Feed`] if the subscription cannot be opened,
    /// [`SyncError::Remote`] if the snapshot fetch fails, and
    /// [`SyncError::SessionChanged`] if another activation or a teardown
    /// happened meanwhile. On error no session is left active.
    pub async fn activate(&self, session: Session) -> Result<FeedTask, SyncError> {
        if let Some(previous) = self.teardown() {
            info!(owner = %previous.owner(), "released previous session");
        }

        let owner = session.owner().clone();
        let (abort, registration) = AbortHandle::new_pair();
        let generation = {
            let mut state = self.state.borrow_mut();
            state.generation += 1;
            let generation = state.generation;
            state.active = Some(ActiveSession {
                session,
                generation,
                reconciler: Reconciler::new(
                    owner.clone(),
                    self.config.reconcile.tombstone_capacity,
                ),
                pending: BTreeMap::new(),
                feed: None,
                feed_abort: Some(abort),
            });
            generation
        };
        info!(owner = %owner, generation, "session activating");

        let stream = match self.remote.subscribe(&owner, &ChangeKind::ALL).await {
            Ok(stream) => stream,
            Err(err) => {
                self.teardown_generation(generation);
                return Err(err.into());
            }
        };
        if !self.install_feed(generation, stream) {
            return Err(SyncError::SessionChanged);
        }

        if let Err(err) = self.resync_generation(generation).await {
            self.teardown_generation(generation);
            return Err(err);
        }

        info!(owner = %owner, generation, "session active");
        Ok(self.feed_task(generation, registration))
    }

    /// End the current session, releasing its subscription.
    ///
    /// Returns the session handle, or `None` if no session was active.
    pub fn teardown(&self) -> Option<Session> {
        let active = self.state.borrow_mut().active.take()?;
        let ActiveSession {
            session,
            generation,
            feed,
            feed_abort,
            ..
        } = active;

        drop(feed);
        if let Some(abort) = feed_abort {
            abort.abort();
        }
        info!(owner = %session.owner(), generation, "session torn down");
        self.notify();
        Some(session)
    }

    fn teardown_generation(&self, generation: u64) {
        if self.is_current(generation) {
            self.teardown();
        }
    }

    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.state
            .borrow()
            .active
            .as_ref()
            .map(|active| active.session.clone())
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.borrow().active.is_some()
    }

    /// Whether a push subscription is currently open.
    #[must_use]
    pub fn has_feed(&self) -> bool {
        self.state
            .borrow()
            .active
            .as_ref()
            .is_some_and(|active| active.feed.is_some())
    }

    /// Snapshot of the visible collection, newest first. Empty when inactive.
    #[must_use]
    pub fn current_items(&self) -> Vec<Item> {
        self.state
            .borrow()
            .active
            .as_ref()
            .map(|active| active.reconciler.items().to_vec())
            .unwrap_or_default()
    }

    /// Mutations awaiting their remote round-trip, oldest first.
    #[must_use]
    pub fn pending_mutations(&self) -> Vec<PendingMutation> {
        self.state
            .borrow()
            .active
            .as_ref()
            .map(|active| active.pending.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Call `listener` with the visible collection after every change to it.
    ///
    /// Listeners run after the engine has released its state, so they may
    /// read from or call into the engine.
    pub fn register_listener(&self, listener: impl FnMut(&[Item]) + 'static) -> ListenerKey {
        self.listeners.borrow_mut().register(Box::new(listener))
    }

    pub fn unregister_listener(&self, key: ListenerKey) {
        self.listeners.borrow_mut().unregister(key);
    }

    fn notify(&self) {
        let snapshot = self.current_items();
        Listeners::notify(&self.listeners, &snapshot);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state
            .borrow()
            .active
            .as_ref()
            .is_some_and(|active| active.generation == generation)
    }

    /// Run `f` against the session of `generation` if it is still the active one.
    fn with_active<T>(&self, generation: u64, f: impl FnOnce(&mut ActiveSession) -> T) -> Option<T> {
        let mut state = self.state.borrow_mut();
        let active = state
            .active
            .as_mut()
            .filter(|active| active.generation == generation)?;
        Some(f(active))
    }

    /// The active generation and owner, or [`SyncError::Inactive`].
    fn current(&self) -> Result<(u64, OwnerId), SyncError> {
        self.state
            .borrow()
            .active
            .as_ref()
            .map(|active| (active.generation, active.session.owner().clone()))
            .ok_or(SyncError::Inactive)
    }

    /// Apply a change through the reconciler and notify on visible change.
    ///
    /// Returns `None` if `generation` is no longer active.
    fn apply_change(&self, generation: u64, change: &ChangeEvent) -> Option<Applied> {
        let applied = self.with_active(generation, |active| active.reconciler.apply(change))?;
        if applied.changed() {
            self.notify();
        }
        Some(applied)
    }

    /// Like [`apply_change`](Self::apply_change) for a change the store has
    /// not acknowledged; it is kept out of any resync replay.
    fn apply_unconfirmed(&self, generation: u64, change: &ChangeEvent) -> Option<Applied> {
        let applied =
            self.with_active(generation, |active| active.reconciler.apply_unconfirmed(change))?;
        if applied.changed() {
            self.notify();
        }
        Some(applied)
    }

    fn track(&self, generation: u64, kind: MutationKind, target: Option<ItemId>) -> Option<u64> {
        let mut state = self.state.borrow_mut();
        let token = state.next_token;
        state.next_token += 1;
        let active = state
            .active
            .as_mut()
            .filter(|active| active.generation == generation)?;
        active.pending.insert(
            token,
            PendingMutation {
                token,
                kind,
                target,
                issued_at: chrono::Utc::now(),
            },
        );
        Some(token)
    }

    fn untrack(&self, generation: u64, token: Option<u64>) {
        if let Some(token) = token {
            self.with_active(generation, |active| active.pending.remove(&token));
        }
    }

    /// Install a freshly opened stream. Drops it if the session has moved on.
    fn install_feed(&self, generation: u64, stream: FeedStream) -> bool {
        self.with_active(generation, |active| active.feed = Some(stream))
            .is_some()
    }

    fn feed_task(&self, generation: u64, registration: AbortRegistration) -> FeedTask {
        FeedTask::new(self.clone(), generation, registration)
    }
}
