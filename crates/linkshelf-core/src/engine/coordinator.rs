//! Mutation coordinator: drives create, delete, and resync round-trips.
//!
//! Create waits for the store-assigned id before touching the collection;
//! there is no temporary id to swap out later. Delete is applied the moment
//! it is issued and, if the store refuses it, the whole collection is
//! re-fetched because local and remote state have diverged in an unknown way.

use tracing::{debug, info, warn};

use super::SyncEngine;
use crate::error::{RemoteError, RemoteErrorKind, SyncError};
use crate::model::{ChangeEvent, Item, ItemId, MutationKind, NewItem};
use crate::reconcile::{Applied, ResyncOutcome};
use crate::remote::RemoteStore;

impl<R: RemoteStore + 'static> SyncEngine<R> {
    /// Validate and create an item; it is inserted once the store returns it.
    ///
    /// If the session ends while the call is in flight the item is still
    /// returned but the collection is left alone.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Validation`] for an empty title or location, or a
    ///   location that is not an absolute URL. Nothing is sent.
    /// - [`SyncError::Inactive`] when no session is active.
    /// - [`SyncError::Remote`] when the store fails or rejects the call, or
    ///   returns an item for another owner. The collection is untouched.
    pub async fn create(&self, title: &str, location: &str) -> Result<Item, SyncError> {
        let draft = NewItem::parse(title, location)?;
        let (generation, owner) = self.current()?;

        let token = self.track(generation, MutationKind::Create, None);
        debug!(owner = %owner, title = draft.title(), "create issued");
        let result = self.remote.create_item(&owner, &draft).await;
        self.untrack(generation, token);

        let item = result.inspect_err(|err| {
            warn!(owner = %owner, error = %err, "create failed");
        })?;

        match self.apply_change(generation, &ChangeEvent::insert(item.clone())) {
            Some(Applied::ForeignOwner) => {
                warn!(id = %item.id, owner = %item.owner_id, "store returned item for another owner");
                return Err(RemoteError::new(
                    RemoteErrorKind::Malformed,
                    format!("created item {} belongs to {}", item.id, item.owner_id),
                )
                .into());
            }
            Some(applied) => debug!(id = %item.id, ?applied, "create applied"),
            None => debug!(id = %item.id, "create completed after session ended"),
        }
        Ok(item)
    }

    /// Remove an item optimistically, then confirm with the store.
    ///
    /// # Errors
    ///
    /// - [`SyncError::Inactive`] when no session is active.
    /// - [`SyncError::Remote`] when the store fails or rejects the call. A
    ///   full resync has been attempted by the time this is returned, so the
    ///   item reappears if it still exists remotely.
    pub async fn delete(&self, id: &ItemId) -> Result<(), SyncError> {
        let (generation, owner) = self.current()?;

        let change = ChangeEvent::delete(owner.clone(), id.clone());
        let token = self.track(generation, MutationKind::Delete, Some(id.clone()));
        self.apply_unconfirmed(generation, &change);
        debug!(owner = %owner, id = %id, "delete issued");

        let result = self.remote.delete_item(id).await;
        self.untrack(generation, token);

        let Err(err) = result else {
            self.with_active(generation, |active| active.reconciler.confirm(&change));
            return Ok(());
        };

        self.with_active(generation, |active| active.reconciler.refuse(&change));
        warn!(id = %id, error = %err, "delete failed; resynchronizing");
        if self.is_current(generation) {
            if let Err(resync_err) = self.resync_generation(generation).await {
                warn!(error = %resync_err, "resync after failed delete also failed");
            }
        } else {
            debug!(id = %id, "delete failed after session ended; skipping resync");
        }
        Err(err.into())
    }

    /// Discard local state and re-fetch the owner's full collection.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Inactive`] with no session,
    /// [`SyncError::Remote`] if the listing fails (local state is kept), or
    /// [`SyncError::SessionChanged`] if the session ended meanwhile.
    pub async fn resync(&self) -> Result<ResyncOutcome, SyncError> {
        let (generation, _) = self.current()?;
        self.resync_generation(generation).await
    }

    pub(super) async fn resync_generation(
        &self,
        generation: u64,
    ) -> Result<ResyncOutcome, SyncError> {
        let owner = self
            .with_active(generation, |active| {
                active.reconciler.begin_resync();
                active.session.owner().clone()
            })
            .ok_or(SyncError::SessionChanged)?;

        let listing = match self.remote.list_items(&owner).await {
            Ok(listing) => listing,
            Err(err) => {
                warn!(owner = %owner, error = %err, "resync listing failed");
                self.with_active(generation, |active| active.reconciler.abort_resync());
                return Err(err.into());
            }
        };

        let outcome = self
            .with_active(generation, |active| {
                let pending = active.pending_deletes();
                active.reconciler.finish_resync(listing, &pending)
            })
            .ok_or(SyncError::SessionChanged)?;

        info!(
            owner = %owner,
            listed = outcome.listed,
            replayed = outcome.replayed,
            foreign = outcome.foreign,
            "resync complete"
        );
        self.notify();
        Ok(outcome)
    }
}
