//! Campaign runner: many seeds, one report.
//!
//! Each seed is an independent [`Simulator`] run checked by the full oracle
//! suite. The first failing seed is reported for replay.

use std::ops::Range;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use linkshelf_core::config::FeedRecovery;
use linkshelf_core::reconcile::DEFAULT_TOMBSTONE_CAPACITY;

use crate::network::FaultConfig;
use crate::oracle::{ConvergenceOracle, InvariantViolation, OracleResult};
use crate::rng::DeterministicRng;
use crate::{SimulationConfig, SimulationResult, Simulator};

/// Salt separating the oracle's shuffles from the run's own stream.
const ORACLE_SALT: u64 = 0x0AC1_E5EE_D000_0001;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignConfig {
    pub seed_range: Range<u64>,
    pub clients: usize,
    pub owners: usize,
    pub rounds: u64,
    pub action_percent: u8,
    pub fault: FaultConfig,
    pub recovery: FeedRecovery,
    pub tombstone_capacity: usize,
    pub final_resync: bool,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        let sim = SimulationConfig::default();
        Self {
            seed_range: 0..100,
            clients: sim.clients,
            owners: sim.owners,
            rounds: sim.rounds,
            action_percent: sim.action_percent,
            fault: sim.fault,
            recovery: sim.recovery,
            tombstone_capacity: DEFAULT_TOMBSTONE_CAPACITY,
            final_resync: false,
        }
    }
}

impl CampaignConfig {
    #[must_use]
    pub fn sim_config_for_seed(&self, seed: u64) -> SimulationConfig {
        SimulationConfig {
            seed,
            clients: self.clients,
            owners: self.owners,
            rounds: self.rounds,
            action_percent: self.action_percent,
            fault: self.fault,
            recovery: self.recovery,
            tombstone_capacity: self.tombstone_capacity,
            final_resync: self.final_resync,
        }
    }

    /// # Errors
    ///
    /// Returns an error if the seed range is empty or the per-seed
    /// configuration is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.seed_range.is_empty() {
            bail!("seed_range must not be empty");
        }
        self.sim_config_for_seed(self.seed_range.start).validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedFailure {
    pub seed: u64,
    pub violations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CampaignReport {
    pub seeds_run: usize,
    pub seeds_passed: usize,
    /// First failing seed, for replay.
    pub first_failure: Option<u64>,
    pub failures: Vec<SeedFailure>,
    /// Seeds that hit a failed delete, a disconnect, or a reordered batch.
    pub interesting_states_reached: usize,
}

impl CampaignReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.failures.is_empty()
    }
}

/// One seed's run and its oracle verdict.
#[derive(Debug, Clone)]
pub struct DetailedTrace {
    pub result: SimulationResult,
    pub oracle: OracleResult,
}

/// Run every seed in the range.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or a run fails to settle.
pub fn run_campaign(config: &CampaignConfig) -> Result<CampaignReport> {
    config.validate()?;

    let mut report = CampaignReport {
        seeds_run: 0,
        seeds_passed: 0,
        first_failure: None,
        failures: Vec::new(),
        interesting_states_reached: 0,
    };

    for seed in config.seed_range.clone() {
        let trace = run_seed(seed, config)?;
        report.seeds_run += 1;
        if trace.result.interesting_state_reached {
            report.interesting_states_reached += 1;
        }

        if trace.oracle.passed {
            report.seeds_passed += 1;
        } else {
            warn!(seed, violations = trace.oracle.violations.len(), "seed failed");
            report.first_failure.get_or_insert(seed);
            report.failures.push(SeedFailure {
                seed,
                violations: trace.oracle.violations.iter().map(format_violation).collect(),
            });
        }
    }

    info!(
        seeds_run = report.seeds_run,
        seeds_passed = report.seeds_passed,
        "campaign complete"
    );
    Ok(report)
}

/// Run one seed: `Ok(())` when every invariant holds, the violations otherwise.
///
/// # Errors
///
/// The outer error is reserved for runs that could not complete.
pub fn run_single_seed(
    seed: u64,
    config: &CampaignConfig,
) -> Result<std::result::Result<(), Vec<InvariantViolation>>> {
    let trace = run_seed(seed, config)?;
    if trace.oracle.passed {
        Ok(Ok(()))
    } else {
        Ok(Err(trace.oracle.violations))
    }
}

/// Replay one seed with its full trace.
///
/// # Errors
///
/// Returns an error if the configuration is invalid or the run fails to settle.
pub fn replay_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    config.validate()?;
    run_seed(seed, config)
}

fn run_seed(seed: u64, config: &CampaignConfig) -> Result<DetailedTrace> {
    let mut simulator = Simulator::new(config.sim_config_for_seed(seed))?;
    let result = simulator.run()?;
    let mut oracle_rng = DeterministicRng::new(seed).fork(ORACLE_SALT);
    let oracle = ConvergenceOracle::check_all(&result, config.tombstone_capacity, &mut oracle_rng);
    Ok(DetailedTrace { result, oracle })
}

/// One-line description of a violation.
#[must_use]
pub fn format_violation(violation: &InvariantViolation) -> String {
    match violation {
        InvariantViolation::Convergence {
            client,
            owner,
            missing,
            extra,
            misordered,
        } => {
            if *misordered {
                format!("Convergence: client {client} ({owner}) holds the right items in the wrong order")
            } else {
                format!(
                    "Convergence: client {client} ({owner}) diverges from the store \
                     (missing={}, extra={})",
                    join(missing),
                    join(extra)
                )
            }
        }
        InvariantViolation::DuplicateId { round, client, id } => {
            format!("Structure: client {client} shows {id} twice at round {round}")
        }
        InvariantViolation::Unsorted {
            round,
            client,
            earlier,
            later,
        } => format!(
            "Structure: client {client} lists {earlier} before newer {later} at round {round}"
        ),
        InvariantViolation::ForeignItem {
            round,
            client,
            id,
            owner,
        } => format!("Structure: client {client} shows {id} of {owner} at round {round}"),
        InvariantViolation::Commutativity {
            client,
            permutation_index,
            missing,
            extra,
        } => format!(
            "Commutativity: client {client} feed log, permutation {permutation_index} diverges \
             (missing={}, extra={})",
            join(missing),
            join(extra)
        ),
        InvariantViolation::Idempotence {
            client,
            event_index,
            before,
            after_dup,
        } => format!(
            "Idempotence: client {client} re-applying event {event_index} changed state \
             ({} items before, {} after)",
            before.len(),
            after_dup.len()
        ),
    }
}

fn join<T: std::fmt::Display>(values: &[T]) -> String {
    let parts: Vec<String> = values.iter().map(ToString::to_string).collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use linkshelf_core::{ItemId, OwnerId};

    fn calm_campaign(seeds: Range<u64>) -> CampaignConfig {
        CampaignConfig {
            seed_range: seeds,
            clients: 3,
            owners: 2,
            rounds: 16,
            fault: FaultConfig::calm(2),
            ..CampaignConfig::default()
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(CampaignConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_seed_range_rejected() {
        let config = CampaignConfig {
            seed_range: 5..5,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_sim_parameters_rejected() {
        let config = CampaignConfig {
            rounds: 0,
            ..CampaignConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn sim_config_carries_seed_and_parameters() {
        let config = CampaignConfig::default();
        let sim = config.sim_config_for_seed(42);
        assert_eq!(sim.seed, 42);
        assert_eq!(sim.clients, config.clients);
        assert_eq!(sim.fault, config.fault);
    }

    #[test]
    fn calm_seed_passes() {
        let result = run_single_seed(0, &calm_campaign(0..1)).expect("sim should not error");
        assert!(result.is_ok(), "seed 0 should pass: {result:?}");
    }

    #[test]
    fn faulty_campaign_passes_every_seed() {
        let config = CampaignConfig {
            seed_range: 0..40,
            clients: 4,
            owners: 2,
            rounds: 24,
            fault: FaultConfig {
                max_delay_rounds: 3,
                drop_rate_percent: 10,
                duplicate_rate_percent: 10,
                reorder_rate_percent: 20,
                remote_failure_percent: 15,
                list_failure_percent: 5,
                feed_drop_percent: 5,
                leak_percent: 5,
            },
            ..CampaignConfig::default()
        };
        let report = run_campaign(&config).expect("campaign should not error");
        assert_eq!(report.seeds_run, 40);
        assert!(
            report.all_passed(),
            "campaign failed: {:?}",
            report.failures.first()
        );
        assert!(report.interesting_states_reached > 0);
    }

    #[test]
    fn failed_calls_converge_without_final_resync() {
        let config = CampaignConfig {
            seed_range: 0..30,
            fault: FaultConfig {
                remote_failure_percent: 30,
                duplicate_rate_percent: 10,
                reorder_rate_percent: 20,
                ..FaultConfig::calm(3)
            },
            ..CampaignConfig::default()
        };
        assert!(!config.sim_config_for_seed(0).needs_final_resync());

        let report = run_campaign(&config).expect("campaign");
        assert!(report.all_passed(), "{:?}", report.failures.first());
    }

    #[test]
    fn ignore_policy_passes_with_final_resync() {
        let config = CampaignConfig {
            seed_range: 0..10,
            recovery: FeedRecovery::Ignore,
            fault: FaultConfig {
                feed_drop_percent: 20,
                ..FaultConfig::calm(2)
            },
            ..CampaignConfig::default()
        };
        let report = run_campaign(&config).expect("campaign");
        assert!(report.all_passed(), "{:?}", report.failures.first());
    }

    #[test]
    fn replay_is_deterministic() {
        let config = CampaignConfig::default();
        let first = replay_seed(7, &config).expect("replay 1");
        let second = replay_seed(7, &config).expect("replay 2");
        assert_eq!(first.result.trace, second.result.trace);
        assert_eq!(first.result.clients, second.result.clients);
        assert_eq!(first.oracle, second.oracle);
    }

    #[test]
    fn report_serializes_to_json() {
        let report = CampaignReport {
            seeds_run: 10,
            seeds_passed: 9,
            first_failure: Some(7),
            failures: vec![SeedFailure {
                seed: 7,
                violations: vec!["Convergence: client 0 (u0) diverges".into()],
            }],
            interesting_states_reached: 5,
        };
        let json = serde_json::to_string(&report).expect("serialize");
        assert!(json.contains("\"seeds_run\":10"));
        assert!(json.contains("\"first_failure\":7"));
    }

    #[test]
    fn format_violation_is_readable() {
        let line = format_violation(&InvariantViolation::Convergence {
            client: 2,
            owner: OwnerId::new("u1"),
            missing: vec![ItemId::new("s4")],
            extra: Vec::new(),
            misordered: false,
        });
        assert!(line.starts_with("Convergence: client 2 (u1)"));
        assert!(line.contains("missing=[s4]"));
        assert!(line.contains("extra=[]"));
    }
}
