//! Data model shared by the store, the reconciler, and the engine.

pub mod change;
pub mod item;

pub use change::{ChangeEvent, ChangeKind, MutationKind, PendingMutation};
pub use item::{Item, ItemId, NewItem, OwnerId};
