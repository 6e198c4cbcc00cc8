//! linkshelf-sim library.
//!
//! Deterministic, seed-driven simulation of many sessions syncing against
//! one store. Every source of nondeterminism (user actions, call failures,
//! network delay, loss, duplication, reordering, server-side disconnects)
//! is drawn from a [`DeterministicRng`], so a failing seed replays exactly.
//!
//! # Conventions
//!
//! - **Errors**: `anyhow::Result` for return types.
//! - **Logging**: `tracing` macros (`info!`, `warn!`, `debug!`).

pub mod campaign;
pub mod client;
pub mod network;
pub mod oracle;
pub mod rng;
pub mod server;
pub mod trace;

use std::collections::BTreeMap;

use anyhow::{Result, bail};
use futures::executor::LocalPool;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use linkshelf_core::config::{EngineConfig, FeedRecovery};
use linkshelf_core::reconcile::DEFAULT_TOMBSTONE_CAPACITY;
use linkshelf_core::{ChangeEvent, FeedExit, Item, OwnerId};

use crate::client::{ClientSnapshot, ClientStats, SimClient};
use crate::network::{ClientId, FaultConfig, SimulatedNetwork};
use crate::oracle::{ConvergenceOracle, InvariantViolation};
use crate::rng::DeterministicRng;
use crate::server::SimServer;
use crate::trace::{TraceEvent, TraceEventKind};

/// Rounds allowed for in-flight work to finish after the run settles.
const SETTLE_ROUNDS_PER_DELAY: u64 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub seed: u64,
    /// Sessions, spread round-robin over `owners`.
    pub clients: usize,
    pub owners: usize,
    pub rounds: u64,
    /// Chance per round that a client starts an operation.
    pub action_percent: u8,
    pub fault: FaultConfig,
    pub recovery: FeedRecovery,
    pub tombstone_capacity: usize,
    /// Resync every client after settling even when nothing was lost.
    pub final_resync: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            seed: 0,
            clients: 4,
            owners: 2,
            rounds: 32,
            action_percent: 40,
            fault: FaultConfig::default(),
            recovery: FeedRecovery::Reconnect,
            tombstone_capacity: DEFAULT_TOMBSTONE_CAPACITY,
            final_resync: false,
        }
    }
}

impl SimulationConfig {
    /// # Errors
    ///
    /// Returns an error if a parameter is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.clients == 0 {
            bail!("clients must be > 0");
        }
        if self.owners == 0 {
            bail!("owners must be > 0");
        }
        if self.owners > self.clients {
            bail!("owners ({}) must not exceed clients ({})", self.owners, self.clients);
        }
        if self.rounds == 0 {
            bail!("rounds must be > 0");
        }
        for (name, percent) in [
            ("action_percent", self.action_percent),
            ("drop_rate_percent", self.fault.drop_rate_percent),
            ("duplicate_rate_percent", self.fault.duplicate_rate_percent),
            ("reorder_rate_percent", self.fault.reorder_rate_percent),
            ("remote_failure_percent", self.fault.remote_failure_percent),
            ("list_failure_percent", self.fault.list_failure_percent),
            ("feed_drop_percent", self.fault.feed_drop_percent),
            ("leak_percent", self.fault.leak_percent),
        ] {
            if percent > 100 {
                bail!("{name} must be within 0..=100, got {percent}");
            }
        }
        Ok(())
    }

    /// Whether state can be lost in a way only a final resync repairs: a
    /// dropped feed event, an ignored disconnect or a failed listing.
    /// Failed creates and deletes repair themselves.
    #[must_use]
    pub const fn needs_final_resync(&self) -> bool {
        self.final_resync
            || self.fault.drop_rate_percent > 0
            || self.fault.list_failure_percent > 0
            || (self.fault.feed_drop_percent > 0 && matches!(self.recovery, FeedRecovery::Ignore))
    }

    #[must_use]
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        config.feed.recovery = self.recovery;
        config.reconcile.tombstone_capacity = self.tombstone_capacity;
        config
    }

    fn owner_of(&self, client: ClientId) -> OwnerId {
        OwnerId::new(format!("u{}", client % self.owners))
    }
}

/// Aggregate counters for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimStats {
    #[serde(flatten)]
    pub clients: ClientStats,
    pub feed_drops: u64,
    pub leaks: u64,
    pub reorders: u64,
    pub feed_exits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimulationResult {
    pub seed: u64,
    /// Rounds driven, settling included.
    pub rounds_run: u64,
    pub clients: Vec<ClientSnapshot>,
    pub authoritative: BTreeMap<OwnerId, Vec<Item>>,
    pub feed_logs: BTreeMap<ClientId, Vec<ChangeEvent>>,
    pub structural_violations: Vec<InvariantViolation>,
    pub trace: Vec<TraceEvent>,
    pub stats: SimStats,
    pub final_resync: bool,
    /// A failed delete, a server-side disconnect, or a reordered batch happened.
    pub interesting_state_reached: bool,
}

pub struct Simulator {
    config: SimulationConfig,
    pool: LocalPool,
    server: SimServer,
    network: SimulatedNetwork,
    rng: DeterministicRng,
    clients: Vec<SimClient>,
    round: u64,
    trace: Vec<TraceEvent>,
    structural_violations: Vec<InvariantViolation>,
    stats: SimStats,
}

impl Simulator {
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: SimulationConfig) -> Result<Self> {
        config.validate()?;
        let server = SimServer::new(
            config.fault.remote_failure_percent,
            config.fault.list_failure_percent,
        );
        let engine_config = config.engine_config();
        let clients = (0..config.clients)
            .map(|id| SimClient::new(id, config.owner_of(id), &server, engine_config.clone()))
            .collect();

        Ok(Self {
            pool: LocalPool::new(),
            network: SimulatedNetwork::new(config.fault),
            rng: DeterministicRng::new(config.seed),
            server,
            clients,
            round: 0,
            trace: Vec::new(),
            structural_violations: Vec::new(),
            stats: SimStats::default(),
            config,
        })
    }

    /// Drive every client for the configured rounds, settle, and collect.
    ///
    /// # Errors
    ///
    /// Returns an error if the run fails to settle.
    pub fn run(&mut self) -> Result<SimulationResult> {
        info!(
            seed = self.config.seed,
            clients = self.config.clients,
            rounds = self.config.rounds,
            "simulation starting"
        );
        let spawner = self.pool.spawner();
        for client in &self.clients {
            client.start(&spawner);
        }

        for _ in 0..self.config.rounds {
            self.step(true);
        }

        self.settle()?;

        let result = self.collect();
        info!(
            seed = result.seed,
            rounds_run = result.rounds_run,
            structural_violations = result.structural_violations.len(),
            "simulation complete"
        );
        Ok(result)
    }

    fn step(&mut self, acting: bool) {
        let round = self.round;
        let spawner = self.pool.spawner();

        if acting {
            for client in &self.clients {
                if !self.rng.hit_rate_percent(self.config.action_percent) {
                    continue;
                }
                if let Some(action) = client.act(&mut self.rng, &spawner) {
                    self.trace.push(TraceEvent {
                        round,
                        kind: TraceEventKind::Action {
                            client: client.id(),
                            action,
                        },
                    });
                }
            }
        }
        self.pool.run_until_stalled();

        self.server
            .process_calls(round, &mut self.network, &mut self.rng, &mut self.trace);

        if acting {
            self.inject_feed_faults(round);
        }

        let outcome = self.network.deliver_ready(round, &mut self.rng);
        if !outcome.delivered.is_empty() {
            self.trace.push(TraceEvent {
                round,
                kind: TraceEventKind::Deliver {
                    delivered: outcome.delivered.len(),
                    reordered: outcome.reordered,
                },
            });
        }
        if outcome.reordered {
            self.stats.reorders += 1;
        }
        for message in outcome.delivered {
            self.server.deliver(message);
        }
        self.pool.run_until_stalled();

        for client in &self.clients {
            for exit in client.take_exits() {
                self.stats.feed_exits += 1;
                debug!(client = client.id(), ?exit, "feed task finished");
                self.trace.push(TraceEvent {
                    round,
                    kind: TraceEventKind::FeedExit {
                        client: client.id(),
                        exit: describe_exit(&exit),
                    },
                });
            }
            self.structural_violations
                .extend(ConvergenceOracle::check_structure(
                    round,
                    client.id(),
                    client.owner(),
                    &client.engine().current_items(),
                ));
        }

        self.round += 1;
    }

    fn inject_feed_faults(&mut self, round: u64) {
        let fault = self.config.fault;
        if self.rng.hit_rate_percent(fault.feed_drop_percent)
            && let Some(client) = self.server.drop_random_feed(&mut self.rng)
        {
            self.stats.feed_drops += 1;
            self.trace.push(TraceEvent {
                round,
                kind: TraceEventKind::FeedDropped { client },
            });
        }
        if self.rng.hit_rate_percent(fault.leak_percent)
            && let Some(client) =
                self.server
                    .leak_foreign_event(round, &mut self.network, &mut self.rng)
        {
            self.stats.leaks += 1;
            self.trace.push(TraceEvent {
                round,
                kind: TraceEventKind::Leak { client },
            });
        }
    }

    /// Stop faults, let in-flight work finish, bring every client back to a
    /// live session, and resync if anything may have been lost.
    fn settle(&mut self) -> Result<()> {
        self.network.settle();
        self.server.settle();
        self.trace.push(TraceEvent {
            round: self.round,
            kind: TraceEventKind::Settle,
        });

        self.drain()?;

        let spawner = self.pool.spawner();
        for client in &self.clients {
            if client.is_live() {
                continue;
            }
            if client.engine().is_active() {
                client.restart(&spawner);
            } else {
                client.start(&spawner);
            }
        }
        self.drain()?;

        if self.config.needs_final_resync() {
            for client in &self.clients {
                client.spawn_resync(&spawner);
            }
            self.drain()?;
        }
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        let budget = (u64::from(self.config.fault.max_delay_rounds) + 1) * SETTLE_ROUNDS_PER_DELAY;
        for _ in 0..budget {
            self.step(false);
            if self.is_quiet() {
                return Ok(());
            }
        }
        bail!(
            "seed {}: simulation did not settle within {budget} rounds",
            self.config.seed
        )
    }

    fn is_quiet(&self) -> bool {
        self.network.pending_len() == 0
            && self.server.queued_calls() == 0
            && self.clients.iter().all(|client| {
                !client.is_activating() && client.engine().pending_mutations().is_empty()
            })
    }

    fn collect(&self) -> SimulationResult {
        let mut stats = self.stats;
        for client in &self.clients {
            stats.clients.absorb(&client.stats());
        }

        let clients: Vec<ClientSnapshot> = self.clients.iter().map(SimClient::snapshot).collect();
        let authoritative = (0..self.config.owners)
            .map(|index| {
                let owner = self.config.owner_of(index);
                let items = self.server.items_for(&owner);
                (owner, items)
            })
            .collect();
        let feed_logs = self
            .clients
            .iter()
            .map(|client| (client.id(), self.server.feed_log(client.id())))
            .collect();

        SimulationResult {
            seed: self.config.seed,
            rounds_run: self.round,
            clients,
            authoritative,
            feed_logs,
            structural_violations: self.structural_violations.clone(),
            trace: self.trace.clone(),
            interesting_state_reached: stats.clients.deletes_failed > 0
                || stats.feed_drops > 0
                || stats.reorders > 0,
            stats,
            final_resync: self.config.needs_final_resync(),
        }
    }
}

fn describe_exit(exit: &FeedExit) -> String {
    match exit {
        FeedExit::TornDown => "torn down".to_string(),
        FeedExit::Dropped(err) => format!("dropped: {err}"),
        FeedExit::Exhausted { attempts } => format!("gave up after {attempts} attempts"),
    }
}
