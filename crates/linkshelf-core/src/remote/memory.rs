//! In-memory authoritative store.
//!
//! A [`MemoryBackend`] plays the hosted store for tests, the simulator, and
//! local demos. Several [`MemoryRemote`] clients (browser tabs, devices) can
//! share one backend; each carries the caller identity the backend enforces.
//! Committed changes are pushed to every live subscription of the owner, the
//! committing client's own included.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use futures::StreamExt;
use futures::channel::mpsc::{self, UnboundedSender};
use tracing::debug;

use super::{FeedStream, RemoteStore};
use crate::error::{FeedError, RemoteError, RemoteErrorKind};
use crate::model::{ChangeEvent, ChangeKind, Item, ItemId, NewItem, OwnerId};

/// Remote calls that can have a failure injected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOp {
    Create,
    Delete,
    List,
}

#[derive(Debug)]
struct Subscriber {
    owner: OwnerId,
    kinds: Vec<ChangeKind>,
    tx: UnboundedSender<Result<ChangeEvent, FeedError>>,
}

#[derive(Debug)]
struct BackendState {
    items: BTreeMap<ItemId, Item>,
    id_prefix: String,
    next_id: u64,
    clock: DateTime<Utc>,
    tick: Duration,
    subscribers: Vec<Subscriber>,
    failures: VecDeque<(RemoteOp, RemoteErrorKind)>,
    subscribe_failures: usize,
}

impl BackendState {
    fn take_failure(&mut self, op: RemoteOp) -> Option<RemoteError> {
        let at = self.failures.iter().position(|(queued, _)| *queued == op)?;
        let (_, kind) = self.failures.remove(at)?;
        Some(RemoteError::new(kind, format!("injected {op:?} failure")))
    }

    fn publish(&mut self, event: &ChangeEvent) {
        self.subscribers.retain(|sub| !sub.tx.is_closed());
        for sub in &self.subscribers {
            if &sub.owner == event.owner_id() && sub.kinds.contains(&event.kind()) {
                // A receiver closed since the retain above just misses the event.
                let _ = sub.tx.unbounded_send(Ok(event.clone()));
            }
        }
    }
}

/// Shared authoritative state. Cloning shares the same store.
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    state: Rc<RefCell<BackendState>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Empty store assigning ids `a1`, `a2`, ... one second apart from a fixed epoch.
    #[must_use]
    pub fn new() -> Self {
        let start = Utc
            .timestamp_opt(1_700_000_000, 0)
            .single()
            .unwrap_or_else(Utc::now);
        Self {
            state: Rc::new(RefCell::new(BackendState {
                items: BTreeMap::new(),
                id_prefix: "a".to_string(),
                next_id: 1,
                clock: start,
                tick: Duration::seconds(1),
                subscribers: Vec::new(),
                failures: VecDeque::new(),
                subscribe_failures: 0,
            })),
        }
    }

    #[must_use]
    pub fn with_id_prefix(self, prefix: &str) -> Self {
        prefix.clone_into(&mut self.state.borrow_mut().id_prefix);
        self
    }

    #[must_use]
    pub fn with_start(self, start: DateTime<Utc>) -> Self {
        self.state.borrow_mut().clock = start;
        self
    }

    /// A client handle authenticated as `caller`.
    #[must_use]
    pub fn client(&self, caller: OwnerId) -> MemoryRemote {
        MemoryRemote {
            backend: self.clone(),
            caller,
        }
    }

    /// Authoritative items of `owner`, newest first.
    #[must_use]
    pub fn items_for(&self, owner: &OwnerId) -> Vec<Item> {
        let state = self.state.borrow();
        let mut items: Vec<Item> = state
            .items
            .values()
            .filter(|item| &item.owner_id == owner)
            .cloned()
            .collect();
        items.sort_by(Item::display_cmp);
        items
    }

    /// Make the next call of kind `op` fail with `kind` without committing.
    pub fn fail_next(&self, op: RemoteOp, kind: RemoteErrorKind) {
        self.state.borrow_mut().failures.push_back((op, kind));
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: usize) {
        self.state.borrow_mut().subscribe_failures += count;
    }

    /// Close every live subscription of `owner` with an error. Returns how many.
    pub fn drop_feeds(&self, owner: &OwnerId) -> usize {
        let mut state = self.state.borrow_mut();
        let (dropped, kept): (Vec<_>, Vec<_>) = state
            .subscribers
            .drain(..)
            .partition(|sub| &sub.owner == owner);
        state.subscribers = kept;

        let mut count = 0;
        for sub in dropped {
            if sub.tx.is_closed() {
                continue;
            }
            let _ = sub
                .tx
                .unbounded_send(Err(FeedError::Closed("subscription dropped by server".into())));
            count += 1;
        }
        count
    }

    /// Live subscriptions of `owner`, pruning ones whose stream was dropped.
    #[must_use]
    pub fn live_subscriptions(&self, owner: &OwnerId) -> usize {
        let mut state = self.state.borrow_mut();
        state.subscribers.retain(|sub| !sub.tx.is_closed());
        state.subscribers.iter().filter(|sub| &sub.owner == owner).count()
    }

    /// Commit an item directly, bypassing clients (seeding existing data).
    pub fn seed(&self, owner: &OwnerId, title: &str, location: &str) -> Item {
        let mut state = self.state.borrow_mut();
        let item = commit_item(&mut state, owner, title, location);
        state.publish(&ChangeEvent::insert(item.clone()));
        item
    }
}

fn commit_item(state: &mut BackendState, owner: &OwnerId, title: &str, location: &str) -> Item {
    let item = Item {
        id: ItemId::new(format!("{}{}", state.id_prefix, state.next_id)),
        owner_id: owner.clone(),
        title: title.to_string(),
        location: location.to_string(),
        created_at: state.clock,
    };
    state.next_id += 1;
    state.clock += state.tick;
    state.items.insert(item.id.clone(), item.clone());
    item
}

/// One authenticated client of a [`MemoryBackend`].
#[derive(Debug, Clone)]
pub struct MemoryRemote {
    backend: MemoryBackend,
    caller: OwnerId,
}

impl MemoryRemote {
    #[must_use]
    pub const fn caller(&self) -> &OwnerId {
        &self.caller
    }

    #[must_use]
    pub const fn backend(&self) -> &MemoryBackend {
        &self.backend
    }
}

#[async_trait(?Send)]
impl RemoteStore for MemoryRemote {
    async fn create_item(&self, owner: &OwnerId, draft: &NewItem) -> Result<Item, RemoteError> {
        let mut state = self.backend.state.borrow_mut();
        if let Some(err) = state.take_failure(RemoteOp::Create) {
            return Err(err);
        }
        if owner != &self.caller {
            return Err(RemoteError::rejected(format!(
                "caller {} may not create items for {owner}",
                self.caller
            )));
        }

        let item = commit_item(&mut state, owner, draft.title(), draft.location());
        debug!(id = %item.id, owner = %owner, "memory backend committed create");
        state.publish(&ChangeEvent::insert(item.clone()));
        Ok(item)
    }

    async fn delete_item(&self, id: &ItemId) -> Result<(), RemoteError> {
        let mut state = self.backend.state.borrow_mut();
        if let Some(err) = state.take_failure(RemoteOp::Delete) {
            return Err(err);
        }

        let Some(existing) = state.items.get(id) else {
            return Ok(());
        };
        if existing.owner_id != self.caller {
            return Err(RemoteError::rejected(format!(
                "caller {} may not delete {id}",
                self.caller
            )));
        }

        let owner = existing.owner_id.clone();
        state.items.remove(id);
        debug!(id = %id, owner = %owner, "memory backend committed delete");
        state.publish(&ChangeEvent::delete(owner, id.clone()));
        Ok(())
    }

    async fn list_items(&self, owner: &OwnerId) -> Result<Vec<Item>, RemoteError> {
        if let Some(err) = self.backend.state.borrow_mut().take_failure(RemoteOp::List) {
            return Err(err);
        }
        if owner != &self.caller {
            return Err(RemoteError::rejected(format!(
                "caller {} may not list items of {owner}",
                self.caller
            )));
        }
        Ok(self.backend.items_for(owner))
    }

    async fn subscribe(
        &self,
        owner: &OwnerId,
        kinds: &[ChangeKind],
    ) -> Result<FeedStream, FeedError> {
        let mut state = self.backend.state.borrow_mut();
        if state.subscribe_failures > 0 {
            state.subscribe_failures -= 1;
            return Err(FeedError::Unavailable("injected subscribe failure".into()));
        }
        if owner != &self.caller {
            return Err(FeedError::Unavailable(format!(
                "caller {} may not subscribe to {owner}",
                self.caller
            )));
        }

        let (tx, rx) = mpsc::unbounded();
        state.subscribers.push(Subscriber {
            owner: owner.clone(),
            kinds: kinds.to_vec(),
            tx,
        });
        Ok(rx.boxed_local())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;

    fn owner(raw: &str) -> OwnerId {
        OwnerId::new(raw)
    }

    fn draft(title: &str) -> NewItem {
        NewItem::parse(title, "https://example.com").expect("valid draft")
    }

    #[test]
    fn create_assigns_sequential_ids_and_increasing_timestamps() {
        let backend = MemoryBackend::new();
        let client = backend.client(owner("u1"));
        let first = block_on(client.create_item(&owner("u1"), &draft("one"))).expect("create");
        let second = block_on(client.create_item(&owner("u1"), &draft("two"))).expect("create");
        assert_eq!(first.id.as_str(), "a1");
        assert_eq!(second.id.as_str(), "a2");
        assert!(second.created_at > first.created_at);

        let listed = backend.items_for(&owner("u1"));
        assert_eq!(listed, vec![second, first]);
    }

    #[test]
    fn create_for_other_owner_is_rejected() {
        let backend = MemoryBackend::new();
        let client = backend.client(owner("u1"));
        let err = block_on(client.create_item(&owner("u2"), &draft("x"))).expect_err("reject");
        assert_eq!(err.kind, RemoteErrorKind::Rejected);
        assert!(backend.items_for(&owner("u2")).is_empty());
    }

    #[test]
    fn delete_of_foreign_item_is_rejected() {
        let backend = MemoryBackend::new();
        let item = backend.seed(&owner("u1"), "mine", "https://example.com");
        let intruder = backend.client(owner("u2"));
        let err = block_on(intruder.delete_item(&item.id)).expect_err("reject");
        assert_eq!(err.kind, RemoteErrorKind::Rejected);
        assert_eq!(backend.items_for(&owner("u1")).len(), 1);
    }

    #[test]
    fn delete_of_unknown_id_succeeds() {
        let backend = MemoryBackend::new();
        let client = backend.client(owner("u1"));
        assert!(block_on(client.delete_item(&ItemId::new("nope"))).is_ok());
    }

    #[test]
    fn injected_failure_is_consumed_once_and_commits_nothing() {
        let backend = MemoryBackend::new();
        let client = backend.client(owner("u1"));
        backend.fail_next(RemoteOp::Create, RemoteErrorKind::Unavailable);

        let err = block_on(client.create_item(&owner("u1"), &draft("x"))).expect_err("fail");
        assert_eq!(err.kind, RemoteErrorKind::Unavailable);
        assert!(backend.items_for(&owner("u1")).is_empty());

        assert!(block_on(client.create_item(&owner("u1"), &draft("x"))).is_ok());
    }

    #[test]
    fn feed_is_scoped_to_owner_and_kinds() {
        let backend = MemoryBackend::new();
        let u1 = backend.client(owner("u1"));
        let u2 = backend.client(owner("u2"));

        let mut inserts_only =
            block_on(u1.subscribe(&owner("u1"), &[ChangeKind::Insert])).expect("subscribe");
        let created = block_on(u1.create_item(&owner("u1"), &draft("x"))).expect("create");
        block_on(u2.create_item(&owner("u2"), &draft("y"))).expect("create");
        block_on(u1.delete_item(&created.id)).expect("delete");
        assert_eq!(backend.drop_feeds(&owner("u1")), 1);

        let received: Vec<_> = block_on(async {
            let mut out = Vec::new();
            while let Some(next) = inserts_only.next().await {
                out.push(next);
            }
            out
        });
        assert_eq!(received.len(), 2);
        assert_eq!(received[0], Ok(ChangeEvent::insert(created)));
        assert!(matches!(received[1], Err(FeedError::Closed(_))));
    }

    #[test]
    fn dropped_stream_releases_subscription() {
        let backend = MemoryBackend::new();
        let client = backend.client(owner("u1"));
        let feed = block_on(client.subscribe(&owner("u1"), &ChangeKind::ALL)).expect("subscribe");
        assert_eq!(backend.live_subscriptions(&owner("u1")), 1);
        drop(feed);
        assert_eq!(backend.live_subscriptions(&owner("u1")), 0);
    }

    #[test]
    fn subscribe_for_other_owner_fails() {
        let backend = MemoryBackend::new();
        let client = backend.client(owner("u1"));
        let result = block_on(client.subscribe(&owner("u2"), &ChangeKind::ALL));
        assert!(matches!(result, Err(FeedError::Unavailable(_))));
    }
}
