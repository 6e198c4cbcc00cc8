#![forbid(unsafe_code)]

use anyhow::Result;
use linkshelf_sim::oracle::ConvergenceOracle;
use linkshelf_sim::rng::DeterministicRng;
use linkshelf_sim::{SimulationConfig, Simulator};

fn main() -> Result<()> {
    let config = SimulationConfig::default();
    let tombstone_capacity = config.tombstone_capacity;
    let seed = config.seed;
    let mut simulator = Simulator::new(config)?;
    let result = simulator.run()?;
    let oracle = ConvergenceOracle::check_all(
        &result,
        tombstone_capacity,
        &mut DeterministicRng::new(seed),
    );

    println!(
        "simulation complete: trace_events={} rounds={} passed={} interesting={}",
        result.trace.len(),
        result.rounds_run,
        oracle.passed,
        result.interesting_state_reached
    );

    Ok(())
}
