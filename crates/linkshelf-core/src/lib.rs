//! linkshelf-core library.
//!
//! An owner-scoped bookmark collection kept consistent with a hosted store.
//! Local deletes are optimistic, creates are applied once the store assigns
//! an id, and the store's change feed is reconciled idempotently against both.
//!
//! # Conventions
//!
//! - **Errors**: typed errors from [`error`] on the engine surface, each with
//!   a stable [`ErrorCode`](error::ErrorCode); `anyhow::Result` for config
//!   loading.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `error!`, `debug!`).
//!   The library never installs a subscriber.
//! - **Threading**: single-threaded; futures are `!Send` and run on a local
//!   executor.

pub mod collection;
pub mod config;
pub mod engine;
pub mod error;
pub mod model;
pub mod reconcile;
pub mod remote;

pub use collection::LocalCollection;
pub use config::EngineConfig;
pub use engine::{FeedExit, FeedTask, ListenerKey, Session, SyncEngine};
pub use error::{ErrorCode, FeedError, RemoteError, SyncError, ValidationError};
pub use model::{ChangeEvent, ChangeKind, Item, ItemId, NewItem, OwnerId};
pub use reconcile::{Applied, Reconciler, ResyncOutcome};
pub use remote::RemoteStore;
