//! `shelf sim`: deterministic simulation campaign commands.
//!
//! `shelf sim run` executes a campaign across many seeds.
//! `shelf sim replay` replays a single seed with detailed trace output.

use std::process;

use anyhow::Result;
use clap::{Args, Subcommand, ValueEnum};
use serde::Serialize;

use linkshelf_core::config::FeedRecovery;
use linkshelf_core::reconcile::DEFAULT_TOMBSTONE_CAPACITY;
use linkshelf_sim::campaign::{self, CampaignConfig};
use linkshelf_sim::client::ClientSnapshot;
use linkshelf_sim::network::FaultConfig;
use linkshelf_sim::trace::TraceEvent;
use linkshelf_sim::{SimStats, SimulationConfig};

use crate::output::{OutputMode, pretty_kv, pretty_section};

/// Failure samples shown before truncating.
const FAILURE_SAMPLES: usize = 5;

#[derive(Args, Debug)]
pub struct SimArgs {
    #[command(subcommand)]
    pub command: SimCommand,
}

#[derive(Subcommand, Debug)]
pub enum SimCommand {
    /// Run a campaign across multiple seeds.
    #[command(
        about = "Run a simulation campaign across multiple seeds",
        long_about = "Execute deterministic simulation campaigns with configurable client and\n\
                      owner counts, rounds, fault injection, and seed ranges. Reports pass/fail\n\
                      per seed and identifies the first failure for replay.",
        after_help = "EXAMPLES:\n    # Run 100 seeds with defaults\n    shelf sim run --seeds 100\n\n\
                      # Heavier faults, more clients\n    shelf sim run --seeds 200 --clients 8 --owners 3 --faults 40\n\n\
                      # Machine-readable output\n    shelf sim run --seeds 100 --format json"
    )]
    Run(SimRunArgs),

    /// Replay a single seed with full trace.
    #[command(
        about = "Replay a single seed with detailed trace output",
        long_about = "Replay a specific seed to get client snapshots, oracle results, and\n\
                      violation details. Use after a campaign failure to debug.",
        after_help = "EXAMPLES:\n    # Replay seed 42\n    shelf sim replay --seed 42\n\n\
                      # Include every trace event\n    shelf sim replay --seed 42 --trace --format json"
    )]
    Replay(SimReplayArgs),
}

/// Recovery policy choice on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecoveryArg {
    Reconnect,
    Ignore,
}

impl From<RecoveryArg> for FeedRecovery {
    fn from(arg: RecoveryArg) -> Self {
        match arg {
            RecoveryArg::Reconnect => Self::Reconnect,
            RecoveryArg::Ignore => Self::Ignore,
        }
    }
}

/// Parameters shared by `run` and `replay`.
#[derive(Args, Debug, Clone)]
pub struct SimKnobs {
    /// Number of simulated client sessions.
    #[arg(long, default_value = "4")]
    pub clients: usize,

    /// Number of owners the clients are spread over.
    #[arg(long, default_value = "2")]
    pub owners: usize,

    /// Number of simulation rounds per seed.
    #[arg(long, default_value = "32")]
    pub rounds: u64,

    /// Overall fault percentage (scales drop, dup, reorder, remote failure,
    /// feed drop, and leak rates). Value between 0 and 100.
    #[arg(long, default_value = "20", value_parser = clap::value_parser!(u8).range(0..=100))]
    pub faults: u8,

    /// Maximum delivery delay in rounds.
    #[arg(long, default_value = "2")]
    pub max_delay: u8,

    /// What clients do when their feed drops.
    #[arg(long, value_enum, default_value = "reconnect")]
    pub recovery: RecoveryArg,

    /// Resync every client after settling, even when no fault calls for it.
    #[arg(long)]
    pub final_resync: bool,
}

#[derive(Args, Debug)]
pub struct SimRunArgs {
    /// Number of seeds to run.
    #[arg(long, default_value = "100")]
    pub seeds: u64,

    /// Starting seed value.
    #[arg(long, default_value = "0")]
    pub seed_start: u64,

    #[command(flatten)]
    pub knobs: SimKnobs,
}

#[derive(Args, Debug)]
pub struct SimReplayArgs {
    /// Seed to replay.
    #[arg(long)]
    pub seed: u64,

    /// Include every trace event in the output.
    #[arg(long)]
    pub trace: bool,

    #[command(flatten)]
    pub knobs: SimKnobs,
}

/// JSON output for `shelf sim run`.
#[derive(Debug, Serialize)]
struct RunOutput {
    seeds_run: usize,
    seeds_passed: usize,
    seeds_failed: usize,
    first_failure: Option<u64>,
    interesting_states_reached: usize,
    all_passed: bool,
    failures: Vec<FailureOutput>,
}

#[derive(Debug, Serialize)]
struct FailureOutput {
    seed: u64,
    violations: Vec<String>,
}

/// JSON output for `shelf sim replay`.
#[derive(Debug, Serialize)]
struct ReplayOutput {
    seed: u64,
    rounds_run: u64,
    trace_events: usize,
    final_resync: bool,
    oracle_passed: bool,
    violations: Vec<String>,
    interesting_state_reached: bool,
    stats: SimStats,
    clients: Vec<ClientSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    trace: Option<Vec<TraceEvent>>,
}

fn build_campaign_config(seed_start: u64, seeds: u64, knobs: &SimKnobs) -> CampaignConfig {
    let defaults = SimulationConfig::default();
    CampaignConfig {
        seed_range: seed_start..seed_start.saturating_add(seeds),
        clients: knobs.clients,
        owners: knobs.owners,
        rounds: knobs.rounds,
        action_percent: defaults.action_percent,
        fault: scaled_faults(knobs.faults, knobs.max_delay),
        recovery: knobs.recovery.into(),
        tombstone_capacity: DEFAULT_TOMBSTONE_CAPACITY,
        final_resync: knobs.final_resync,
    }
}

/// Split the overall fault percentage into per-fault rates.
fn scaled_faults(faults: u8, max_delay: u8) -> FaultConfig {
    FaultConfig {
        max_delay_rounds: max_delay,
        drop_rate_percent: scale_fault(faults, 50),
        duplicate_rate_percent: scale_fault(faults, 25),
        reorder_rate_percent: scale_fault(faults, 50),
        remote_failure_percent: scale_fault(faults, 50),
        list_failure_percent: scale_fault(faults, 25),
        feed_drop_percent: scale_fault(faults, 15),
        leak_percent: scale_fault(faults, 15),
    }
}

/// `base` percent weighted by `weight_pct` percent, clamped to 0..=100.
fn scale_fault(base: u8, weight_pct: u8) -> u8 {
    let scaled = u16::from(base) * u16::from(weight_pct) / 100;
    u8::try_from(scaled.min(100)).unwrap_or(100)
}

/// Execute `shelf sim run`.
pub fn run_sim_run(args: &SimRunArgs, output: OutputMode) -> Result<()> {
    let config = build_campaign_config(args.seed_start, args.seeds, &args.knobs);
    let report = campaign::run_campaign(&config)?;

    let out = RunOutput {
        seeds_run: report.seeds_run,
        seeds_passed: report.seeds_passed,
        seeds_failed: report.failures.len(),
        first_failure: report.first_failure,
        interesting_states_reached: report.interesting_states_reached,
        all_passed: report.all_passed(),
        failures: report
            .failures
            .iter()
            .map(|f| FailureOutput {
                seed: f.seed,
                violations: f.violations.clone(),
            })
            .collect(),
    };
    let knobs = &args.knobs;

    match output {
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputMode::Text => {
            println!(
                "campaign seeds_run={} clients={} owners={} rounds={} faults_pct={}",
                out.seeds_run, knobs.clients, knobs.owners, knobs.rounds, knobs.faults
            );
            println!(
                "results passed={} failed={} interesting_states={} all_passed={}",
                out.seeds_passed, out.seeds_failed, out.interesting_states_reached, out.all_passed
            );
            if !out.all_passed {
                for failure in out.failures.iter().take(FAILURE_SAMPLES) {
                    println!(
                        "failure seed={} violations={}",
                        failure.seed,
                        failure.violations.len()
                    );
                }
                if out.failures.len() > FAILURE_SAMPLES {
                    println!("failures_truncated count={}", out.failures.len() - FAILURE_SAMPLES);
                }
                println!(
                    "hint replay_seed={} clients={} owners={} rounds={}",
                    out.first_failure.unwrap_or(0),
                    knobs.clients,
                    knobs.owners,
                    knobs.rounds
                );
            }
        }
        OutputMode::Pretty => {
            let stdout = std::io::stdout();
            let mut w = stdout.lock();
            pretty_section(&mut w, "Simulation Campaign")?;
            pretty_kv(&mut w, "Seeds", out.seeds_run.to_string())?;
            pretty_kv(
                &mut w,
                "Clients",
                format!("{} over {} owners", knobs.clients, knobs.owners),
            )?;
            pretty_kv(&mut w, "Rounds", knobs.rounds.to_string())?;
            pretty_kv(&mut w, "Fault rate", format!("{}%", knobs.faults))?;
            pretty_kv(
                &mut w,
                "Results",
                format!(
                    "{} passed / {} failed ({} interesting states)",
                    out.seeds_passed, out.seeds_failed, out.interesting_states_reached
                ),
            )?;

            if out.all_passed {
                pretty_kv(&mut w, "Status", "all seeds passed")?;
            } else {
                pretty_kv(
                    &mut w,
                    "Status",
                    format!(
                        "{} failures (first at seed {})",
                        out.seeds_failed,
                        out.first_failure.unwrap_or(0)
                    ),
                )?;
                println!();
                pretty_section(&mut w, "Failure Samples")?;
                for failure in out.failures.iter().take(FAILURE_SAMPLES) {
                    println!("seed {:<8} violations={}", failure.seed, failure.violations.len());
                    for violation in &failure.violations {
                        println!("  - {violation}");
                    }
                }
                if out.failures.len() > FAILURE_SAMPLES {
                    println!("... and {} more failures", out.failures.len() - FAILURE_SAMPLES);
                }
                println!();
                pretty_kv(
                    &mut w,
                    "Replay",
                    format!(
                        "shelf sim replay --seed {} --clients {} --owners {} --rounds {}",
                        out.first_failure.unwrap_or(0),
                        knobs.clients,
                        knobs.owners,
                        knobs.rounds
                    ),
                )?;
            }
        }
    }

    // Exit code 1 on any failure for CI integration
    if !report.all_passed() {
        process::exit(1);
    }

    Ok(())
}

/// Execute `shelf sim replay`.
pub fn run_sim_replay(args: &SimReplayArgs, output: OutputMode) -> Result<()> {
    let config = build_campaign_config(args.seed, 1, &args.knobs);
    let detailed = campaign::replay_seed(args.seed, &config)?;
    let result = detailed.result;

    let out = ReplayOutput {
        seed: args.seed,
        rounds_run: result.rounds_run,
        trace_events: result.trace.len(),
        final_resync: result.final_resync,
        oracle_passed: detailed.oracle.passed,
        violations: detailed
            .oracle
            .violations
            .iter()
            .map(campaign::format_violation)
            .collect(),
        interesting_state_reached: result.interesting_state_reached,
        stats: result.stats,
        clients: result.clients,
        trace: args.trace.then_some(result.trace),
    };

    match output {
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        OutputMode::Text => {
            println!(
                "replay seed={} clients={} owners={} rounds={}",
                out.seed, args.knobs.clients, args.knobs.owners, out.rounds_run
            );
            println!(
                "result oracle_passed={} trace_events={} final_resync={} interesting_state_reached={}",
                out.oracle_passed, out.trace_events, out.final_resync, out.interesting_state_reached
            );
            println!(
                "stats feed_drops={} leaks={} reorders={} feed_exits={}",
                out.stats.feed_drops, out.stats.leaks, out.stats.reorders, out.stats.feed_exits
            );
            for violation in &out.violations {
                println!("violation={violation}");
            }
            for client in &out.clients {
                println!(
                    "client id={} owner={} active={} has_feed={} items={}",
                    client.client,
                    client.owner,
                    client.active,
                    client.has_feed,
                    client.items.len()
                );
            }
            if let Some(trace) = &out.trace {
                for event in trace {
                    println!("trace {}", serde_json::to_string(event)?);
                }
            }
        }
        OutputMode::Pretty => {
            let stdout = std::io::stdout();
            let mut w = stdout.lock();
            pretty_section(&mut w, &format!("Replay Seed {}", out.seed))?;
            pretty_kv(
                &mut w,
                "Clients",
                format!("{} over {} owners", args.knobs.clients, args.knobs.owners),
            )?;
            pretty_kv(&mut w, "Rounds", out.rounds_run.to_string())?;
            pretty_kv(&mut w, "Trace events", out.trace_events.to_string())?;
            pretty_kv(&mut w, "Final resync", out.final_resync.to_string())?;
            pretty_kv(
                &mut w,
                "Faults seen",
                format!(
                    "{} feed drops, {} leaks, {} reorders",
                    out.stats.feed_drops, out.stats.leaks, out.stats.reorders
                ),
            )?;
            pretty_kv(&mut w, "Interesting", out.interesting_state_reached.to_string())?;
            pretty_kv(&mut w, "Oracle", out.oracle_passed.to_string())?;

            if !out.oracle_passed {
                println!();
                pretty_section(&mut w, "Invariant Violations")?;
                for violation in &out.violations {
                    println!("- {violation}");
                }
            }

            println!();
            pretty_section(&mut w, "Client Views")?;
            for client in &out.clients {
                let feed = if client.has_feed { "live" } else { "no feed" };
                println!(
                    "client {:<3} {:<6} {:<8} items={}",
                    client.client,
                    client.owner.as_str(),
                    feed,
                    client.items.len()
                );
            }

            if let Some(trace) = &out.trace {
                println!();
                pretty_section(&mut w, "Trace")?;
                for event in trace {
                    println!("round {:<4} {:?}", event.round, event.kind);
                }
            }
        }
    }

    if !detailed.oracle.passed {
        process::exit(1);
    }

    Ok(())
}
