//! Shared fixtures for engine integration tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use async_trait::async_trait;
use futures::channel::oneshot;
use futures::executor::LocalPool;
use futures::task::LocalSpawnExt;

use linkshelf_core::error::{FeedError, RemoteError};
use linkshelf_core::remote::FeedStream;
use linkshelf_core::remote::memory::{MemoryBackend, MemoryRemote};
use linkshelf_core::{
    ChangeKind, EngineConfig, FeedExit, FeedTask, Item, ItemId, NewItem, OwnerId, RemoteStore,
    Session, SyncEngine,
};

pub fn owner(raw: &str) -> OwnerId {
    OwnerId::new(raw)
}

pub fn ids(items: &[Item]) -> Vec<String> {
    items.iter().map(|item| item.id.to_string()).collect()
}

/// Holds calls until released, counts listings, and can slip extra items
/// into listings.
#[derive(Default)]
pub struct Controls {
    gates: RefCell<VecDeque<oneshot::Receiver<()>>>,
    listing_gates: RefCell<VecDeque<oneshot::Receiver<()>>>,
    extra_listing: RefCell<Vec<Item>>,
    listings: Cell<usize>,
}

impl Controls {
    /// Block the next create or delete call until the returned sender fires.
    pub fn hold_next(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.borrow_mut().push_back(rx);
        tx
    }

    /// Hold the reply of the next listing until the returned sender fires.
    /// The listing itself is taken before waiting.
    pub fn hold_next_listing(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.listing_gates.borrow_mut().push_back(rx);
        tx
    }

    /// Listing calls made so far.
    pub fn listings(&self) -> usize {
        self.listings.get()
    }

    pub fn leak_into_listing(&self, item: Item) {
        self.extra_listing.borrow_mut().push(item);
    }

    async fn wait(&self) {
        let gate = self.gates.borrow_mut().pop_front();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
    }

    async fn wait_listing(&self) {
        let gate = self.listing_gates.borrow_mut().pop_front();
        if let Some(gate) = gate {
            let _ = gate.await;
        }
    }
}

pub struct TestRemote {
    inner: MemoryRemote,
    controls: Rc<Controls>,
}

impl TestRemote {
    pub fn new(inner: MemoryRemote) -> (Self, Rc<Controls>) {
        let controls = Rc::new(Controls::default());
        (
            Self {
                inner,
                controls: Rc::clone(&controls),
            },
            controls,
        )
    }
}

#[async_trait(?Send)]
impl RemoteStore for TestRemote {
    async fn create_item(&self, owner: &OwnerId, draft: &NewItem) -> Result<Item, RemoteError> {
        self.controls.wait().await;
        self.inner.create_item(owner, draft).await
    }

    async fn delete_item(&self, id: &ItemId) -> Result<(), RemoteError> {
        self.controls.wait().await;
        self.inner.delete_item(id).await
    }

    async fn list_items(&self, owner: &OwnerId) -> Result<Vec<Item>, RemoteError> {
        self.controls.listings.set(self.controls.listings.get() + 1);
        let mut items = self.inner.list_items(owner).await?;
        items.extend(self.controls.extra_listing.borrow().iter().cloned());
        self.controls.wait_listing().await;
        Ok(items)
    }

    async fn subscribe(
        &self,
        owner: &OwnerId,
        kinds: &[ChangeKind],
    ) -> Result<FeedStream, FeedError> {
        self.inner.subscribe(owner, kinds).await
    }
}

/// Where a spawned feed task reports how it ended.
pub type ExitSlot = Rc<RefCell<Option<FeedExit>>>;

pub fn spawn_feed(pool: &LocalPool, task: FeedTask) -> ExitSlot {
    let slot: ExitSlot = Rc::new(RefCell::new(None));
    let report = Rc::clone(&slot);
    pool.spawner()
        .spawn_local(async move {
            let exit = task.await;
            *report.borrow_mut() = Some(exit);
        })
        .expect("spawn feed task");
    slot
}

/// Activate `engine` for `owner`, spawn its feed, and settle.
pub fn activate<R: RemoteStore + 'static>(
    pool: &mut LocalPool,
    engine: &SyncEngine<R>,
    owner_id: &OwnerId,
) -> ExitSlot {
    let task = pool
        .run_until(engine.activate(Session::new(owner_id.clone())))
        .expect("activate");
    let slot = spawn_feed(pool, task);
    pool.run_until_stalled();
    slot
}

pub fn memory_engine(
    backend: &MemoryBackend,
    owner_id: &OwnerId,
    config: EngineConfig,
) -> SyncEngine<MemoryRemote> {
    SyncEngine::new(backend.client(owner_id.clone()), config)
}
