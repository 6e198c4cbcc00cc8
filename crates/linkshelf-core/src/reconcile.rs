//! Reconciliation policy shared by the mutation coordinator and the feed subscriber.
//!
//! # Rule
//!
//! Apply-if-absent for inserts, remove-if-present for deletes, keyed by id.
//! Applying the same change twice, or receiving an optimistic result and its
//! feed echo in either order, converges to the same state. This is what lets
//! the direct-response path and the push path run without a lock or sequence
//! number.
//!
//! # Tombstones
//!
//! Ids are assigned by the store and never reused, so once an id has been
//! removed any later insert for it is stale (a delayed echo of the original
//! create). Removed ids are remembered in a bounded FIFO and such inserts are
//! dropped, which makes an insert and a delete of the same id commute.
//!
//! # Resync window
//!
//! A full resync replaces the collection with a listing fetched at some
//! point during the round-trip. Changes applied while the fetch is in flight
//! may not be reflected in it, so they are recorded and replayed on top of the
//! listing. Replaying is safe because every change is idempotent.
//!
//! Optimistic deletes are not recorded when applied: the store may still
//! refuse them. While outstanding they reach a listing as `pending_deletes`;
//! once acknowledged they are recorded through [`Reconciler::confirm`], and
//! a refused one gives its tombstone back through [`Reconciler::refuse`].
//!
//! # Ownership
//!
//! Changes and listed items for any owner other than the session owner are
//! dropped, even though the store filters upstream.

use std::collections::{HashSet, VecDeque};

use tracing::debug;

use crate::collection::LocalCollection;
use crate::model::{ChangeEvent, Item, ItemId, OwnerId};

/// Default number of removed ids remembered by a [`Reconciler`].
pub const DEFAULT_TOMBSTONE_CAPACITY: usize = 1024;

/// What applying one change did to the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Removed,
    /// Insert for an id already present.
    Duplicate,
    /// Delete for an id not present.
    Absent,
    /// Insert for an id that was already removed.
    Tombstoned,
    /// Change for another owner; ignored.
    ForeignOwner,
}

impl Applied {
    /// Whether the visible collection changed.
    #[must_use]
    pub const fn changed(self) -> bool {
        matches!(self, Self::Inserted | Self::Removed)
    }
}

/// Summary of a completed resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResyncOutcome {
    /// Items taken from the authoritative listing.
    pub listed: usize,
    /// Listed items dropped for belonging to another owner.
    pub foreign: usize,
    /// Recorded changes replayed on top of the listing.
    pub replayed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Tombstones {
    order: VecDeque<ItemId>,
    set: HashSet<ItemId>,
    capacity: usize,
}

impl Tombstones {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity,
        }
    }

    fn insert(&mut self, id: &ItemId) {
        if self.capacity == 0 || !self.set.insert(id.clone()) {
            return;
        }
        self.order.push_back(id.clone());
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.set.remove(&evicted);
            }
        }
    }

    fn forget(&mut self, id: &ItemId) {
        if self.set.remove(id) {
            self.order.retain(|existing| existing != id);
        }
    }

    fn contains(&self, id: &ItemId) -> bool {
        self.set.contains(id)
    }
}

/// Owner-scoped collection plus the merge rule that guards it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciler {
    owner: OwnerId,
    collection: LocalCollection,
    tombstones: Tombstones,
    resyncs_in_flight: usize,
    window: Vec<ChangeEvent>,
}

impl Reconciler {
    #[must_use]
    pub fn new(owner: OwnerId, tombstone_capacity: usize) -> Self {
        Self {
            owner,
            collection: LocalCollection::new(),
            tombstones: Tombstones::new(tombstone_capacity),
            resyncs_in_flight: 0,
            window: Vec::new(),
        }
    }

    #[must_use]
    pub const fn owner(&self) -> &OwnerId {
        &self.owner
    }

    #[must_use]
    pub const fn collection(&self) -> &LocalCollection {
        &self.collection
    }

    #[must_use]
    pub fn items(&self) -> &[Item] {
        self.collection.items()
    }

    /// Whether `id` has been removed and will reject late inserts.
    #[must_use]
    pub fn is_tombstoned(&self, id: &ItemId) -> bool {
        self.tombstones.contains(id)
    }

    #[must_use]
    pub const fn resync_in_flight(&self) -> bool {
        self.resyncs_in_flight > 0
    }

    /// Apply one change from either write path.
    pub fn apply(&mut self, change: &ChangeEvent) -> Applied {
        let applied = self.apply_inner(change);
        if applied != Applied::ForeignOwner && self.resync_in_flight() {
            self.window.push(change.clone());
        }
        applied
    }

    /// Apply a local change the store has not acknowledged yet.
    ///
    /// Not recorded for replay; see [`confirm`](Self::confirm).
    pub fn apply_unconfirmed(&mut self, change: &ChangeEvent) -> Applied {
        self.apply_inner(change)
    }

    /// Record an acknowledged local change for any listing still in flight.
    pub fn confirm(&mut self, change: &ChangeEvent) {
        if self.resync_in_flight() && change.owner_id() == &self.owner {
            self.window.push(change.clone());
        }
    }

    /// Drop the tombstone left by a local delete the store refused.
    ///
    /// The item itself comes back with the next listing.
    pub fn refuse(&mut self, change: &ChangeEvent) {
        if let ChangeEvent::Delete { owner_id, id } = change
            && owner_id == &self.owner
        {
            self.tombstones.forget(id);
        }
    }

    fn apply_inner(&mut self, change: &ChangeEvent) -> Applied {
        if change.owner_id() != &self.owner {
            debug!(
                owner = %change.owner_id(),
                id = %change.id(),
                "dropping change for foreign owner"
            );
            return Applied::ForeignOwner;
        }

        let applied = match change {
            ChangeEvent::Insert { item, .. } => {
                if item.owner_id != self.owner {
                    Applied::ForeignOwner
                } else if self.tombstones.contains(&item.id) {
                    Applied::Tombstoned
                } else if self.collection.insert(item.clone()) {
                    Applied::Inserted
                } else {
                    Applied::Duplicate
                }
            }
            ChangeEvent::Delete { id, .. } => {
                self.tombstones.insert(id);
                if self.collection.remove(id) {
                    Applied::Removed
                } else {
                    Applied::Absent
                }
            }
        };

        debug!(kind = ?change.kind(), id = %change.id(), ?applied, "applied change");
        applied
    }

    /// Mark a full resync as started; changes are recorded until it finishes.
    pub fn begin_resync(&mut self) {
        self.resyncs_in_flight += 1;
    }

    /// Install an authoritative listing and replay what raced it.
    ///
    /// `pending_deletes` are optimistic removals still awaiting their remote
    /// acknowledgment; the listing may predate them, so they are re-applied.
    pub fn finish_resync(&mut self, listing: Vec<Item>, pending_deletes: &[ItemId]) -> ResyncOutcome {
        let total = listing.len();
        let owned: Vec<Item> = listing
            .into_iter()
            .filter(|item| item.owner_id == self.owner)
            .collect();
        let foreign = total - owned.len();
        if foreign > 0 {
            debug!(foreign, "dropping listed items for foreign owner");
        }

        for item in &owned {
            self.tombstones.forget(&item.id);
        }
        let listed = owned.len();
        self.collection.replace_all(owned);

        let recorded = std::mem::take(&mut self.window);
        for change in &recorded {
            self.apply_inner(change);
        }
        for id in pending_deletes {
            self.apply_inner(&ChangeEvent::delete(self.owner.clone(), id.clone()));
        }
        let replayed = recorded.len();
        self.end_resync(recorded);

        ResyncOutcome {
            listed,
            foreign,
            replayed,
        }
    }

    /// Mark a resync as abandoned (the listing call failed).
    pub fn abort_resync(&mut self) {
        let recorded = std::mem::take(&mut self.window);
        self.end_resync(recorded);
    }

    fn end_resync(&mut self, recorded: Vec<ChangeEvent>) {
        self.resyncs_in_flight = self.resyncs_in_flight.saturating_sub(1);
        if self.resync_in_flight() {
            // An older listing may still land; keep the record for it.
            self.window = recorded;
        }
    }
}
