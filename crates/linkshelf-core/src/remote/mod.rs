//! Boundary to the hosted storage/identity collaborator.
//!
//! The engine never talks to a concrete backend; it is handed something that
//! implements [`RemoteStore`]. Everything here is single-threaded: futures are
//! polled on the UI/event thread, so the trait is `?Send`.

pub mod memory;

use async_trait::async_trait;
use futures::stream::LocalBoxStream;

use crate::error::{FeedError, RemoteError};
use crate::model::{ChangeEvent, ChangeKind, Item, ItemId, NewItem, OwnerId};

/// Push feed for one owner. The subscription is released when the stream is
/// dropped; a stream that ends or yields an error has dropped on its own.
pub type FeedStream = LocalBoxStream<'static, Result<ChangeEvent, FeedError>>;

#[async_trait(?Send)]
pub trait RemoteStore {
    /// Commit a new item. The store assigns `id` and `created_at` and rejects
    /// an `owner` that is not the caller's authenticated identity.
    async fn create_item(&self, owner: &OwnerId, draft: &NewItem) -> Result<Item, RemoteError>;

    /// Delete an item the caller owns. Deleting an unknown id succeeds.
    async fn delete_item(&self, id: &ItemId) -> Result<(), RemoteError>;

    /// Every item of `owner`, newest first.
    async fn list_items(&self, owner: &OwnerId) -> Result<Vec<Item>, RemoteError>;

    /// Open a push subscription filtered server-side to `owner` and `kinds`.
    async fn subscribe(&self, owner: &OwnerId, kinds: &[ChangeKind])
    -> Result<FeedStream, FeedError>;
}
