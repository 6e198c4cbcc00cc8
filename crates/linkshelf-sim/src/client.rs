//! One simulated session: a [`SyncEngine`] plus the user driving it.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use futures::executor::LocalSpawner;
use futures::task::LocalSpawnExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use linkshelf_core::{EngineConfig, FeedExit, Item, ItemId, OwnerId, Session, SyncEngine, SyncError};

use crate::network::ClientId;
use crate::rng::DeterministicRng;
use crate::server::{SimRemote, SimServer};
use crate::trace::ClientAction;

/// Outcome counters for one client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientStats {
    pub creates_ok: u64,
    pub creates_failed: u64,
    pub validation_rejected: u64,
    pub deletes_ok: u64,
    pub deletes_failed: u64,
    pub resyncs_ok: u64,
    pub resyncs_failed: u64,
    pub activations: u64,
    pub activation_failures: u64,
    pub restarts: u64,
}

impl ClientStats {
    pub const fn absorb(&mut self, other: &Self) {
        self.creates_ok += other.creates_ok;
        self.creates_failed += other.creates_failed;
        self.validation_rejected += other.validation_rejected;
        self.deletes_ok += other.deletes_ok;
        self.deletes_failed += other.deletes_failed;
        self.resyncs_ok += other.resyncs_ok;
        self.resyncs_failed += other.resyncs_failed;
        self.activations += other.activations;
        self.activation_failures += other.activation_failures;
        self.restarts += other.restarts;
    }
}

/// Final view of one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSnapshot {
    pub client: ClientId,
    pub owner: OwnerId,
    pub active: bool,
    pub has_feed: bool,
    pub items: Vec<Item>,
}

pub struct SimClient {
    id: ClientId,
    owner: OwnerId,
    engine: SyncEngine<SimRemote>,
    activating: Rc<Cell<bool>>,
    exits: Rc<RefCell<Vec<FeedExit>>>,
    stats: Rc<RefCell<ClientStats>>,
}

impl SimClient {
    #[must_use]
    pub fn new(id: ClientId, owner: OwnerId, server: &SimServer, config: EngineConfig) -> Self {
        let remote = server.client(id, owner.clone());
        Self {
            id,
            owner,
            engine: SyncEngine::new(remote, config),
            activating: Rc::new(Cell::new(false)),
            exits: Rc::new(RefCell::new(Vec::new())),
            stats: Rc::new(RefCell::new(ClientStats::default())),
        }
    }

    #[must_use]
    pub const fn id(&self) -> ClientId {
        self.id
    }

    #[must_use]
    pub const fn owner(&self) -> &OwnerId {
        &self.owner
    }

    #[must_use]
    pub const fn engine(&self) -> &SyncEngine<SimRemote> {
        &self.engine
    }

    #[must_use]
    pub fn is_activating(&self) -> bool {
        self.activating.get()
    }

    /// Active, not mid-activation, and listening.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.is_activating() && self.engine.is_active() && self.engine.has_feed()
    }

    #[must_use]
    pub fn stats(&self) -> ClientStats {
        *self.stats.borrow()
    }

    /// Feed exits observed since the last call.
    pub fn take_exits(&self) -> Vec<FeedExit> {
        std::mem::take(&mut *self.exits.borrow_mut())
    }

    #[must_use]
    pub fn snapshot(&self) -> ClientSnapshot {
        ClientSnapshot {
            client: self.id,
            owner: self.owner.clone(),
            active: self.engine.is_active(),
            has_feed: self.engine.has_feed(),
            items: self.engine.current_items(),
        }
    }

    /// Activate a session and, once it is up, spawn its feed task.
    pub fn start(&self, spawner: &LocalSpawner) {
        if self.activating.replace(true) {
            return;
        }
        let engine = self.engine.clone();
        let owner = self.owner.clone();
        let activating = Rc::clone(&self.activating);
        let exits = Rc::clone(&self.exits);
        let stats = Rc::clone(&self.stats);
        let feed_spawner = spawner.clone();
        let client = self.id;

        spawn(spawner, async move {
            let result = engine.activate(Session::new(owner)).await;
            activating.set(false);
            match result {
                Ok(task) => {
                    stats.borrow_mut().activations += 1;
                    spawn(&feed_spawner, async move {
                        let exit = task.await;
                        exits.borrow_mut().push(exit);
                    });
                }
                Err(err) => {
                    stats.borrow_mut().activation_failures += 1;
                    debug!(client, error = %err, "activation failed");
                }
            }
        });
    }

    /// Tear the session down and start a new one.
    pub fn restart(&self, spawner: &LocalSpawner) {
        if self.is_activating() {
            return;
        }
        self.engine.teardown();
        self.stats.borrow_mut().restarts += 1;
        self.start(spawner);
    }

    /// Pick and start one user operation.
    pub fn act(&self, rng: &mut DeterministicRng, spawner: &LocalSpawner) -> Option<ClientAction> {
        if self.is_activating() {
            return None;
        }
        if !self.engine.is_active() {
            self.start(spawner);
            return Some(ClientAction::Activate);
        }

        let roll = rng.next_bounded(100);
        let visible = self.engine.current_items();
        let action = match roll {
            0..45 => ClientAction::Create,
            45..75 => match rng.choose(&visible) {
                Some(item) => ClientAction::Delete {
                    id: item.id.to_string(),
                },
                None => ClientAction::Create,
            },
            75..85 => ClientAction::Resync,
            85..96 => ClientAction::CreateInvalid,
            _ => ClientAction::Restart,
        };

        match &action {
            ClientAction::Create => {
                let title = format!("link {}", rng.next_bounded(10_000));
                let location = format!("https://example.com/{}", rng.next_bounded(10_000));
                self.spawn_create(spawner, title, location);
            }
            ClientAction::CreateInvalid => {
                let (title, location) = if rng.hit_rate_percent(50) {
                    (String::new(), "https://example.com/".to_string())
                } else {
                    ("no scheme".to_string(), "example.com/path".to_string())
                };
                self.spawn_create(spawner, title, location);
            }
            ClientAction::Delete { id } => self.spawn_delete(spawner, ItemId::new(id.as_str())),
            ClientAction::Resync => self.spawn_resync(spawner),
            ClientAction::Restart => self.restart(spawner),
            ClientAction::Activate => self.start(spawner),
        }
        Some(action)
    }

    pub fn spawn_resync(&self, spawner: &LocalSpawner) {
        let engine = self.engine.clone();
        let stats = Rc::clone(&self.stats);
        spawn(spawner, async move {
            match engine.resync().await {
                Ok(_) => stats.borrow_mut().resyncs_ok += 1,
                Err(_) => stats.borrow_mut().resyncs_failed += 1,
            }
        });
    }

    fn spawn_create(&self, spawner: &LocalSpawner, title: String, location: String) {
        let engine = self.engine.clone();
        let stats = Rc::clone(&self.stats);
        spawn(spawner, async move {
            match engine.create(&title, &location).await {
                Ok(_) => stats.borrow_mut().creates_ok += 1,
                Err(SyncError::Validation(_)) => stats.borrow_mut().validation_rejected += 1,
                Err(_) => stats.borrow_mut().creates_failed += 1,
            }
        });
    }

    fn spawn_delete(&self, spawner: &LocalSpawner, id: ItemId) {
        let engine = self.engine.clone();
        let stats = Rc::clone(&self.stats);
        spawn(spawner, async move {
            match engine.delete(&id).await {
                Ok(()) => stats.borrow_mut().deletes_ok += 1,
                Err(_) => stats.borrow_mut().deletes_failed += 1,
            }
        });
    }
}

fn spawn(spawner: &LocalSpawner, future: impl std::future::Future<Output = ()> + 'static) {
    if let Err(err) = spawner.spawn_local(future) {
        warn!(error = %err, "local executor refused a task");
    }
}
