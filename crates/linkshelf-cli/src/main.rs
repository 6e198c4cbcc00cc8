#![forbid(unsafe_code)]

mod cmd;
mod output;

use clap::{Parser, Subcommand};
use output::{OutputMode, resolve_output_mode};
use std::env;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    name = "shelf",
    author,
    version,
    about = "shelf: simulation and config tooling for the linkshelf sync engine",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Shorthand for `--format json`.
    #[arg(long, global = true, hide = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn output_mode(&self) -> OutputMode {
        resolve_output_mode(self.format, self.json)
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deterministic simulation campaigns.
    Sim(cmd::sim::SimArgs),

    /// Inspect the engine configuration.
    Config(cmd::config::ConfigArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("SHELF_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "linkshelf=debug,info"
        } else {
            "linkshelf=info,warn"
        })
    });

    let format = env::var("SHELF_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());

    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_root = env::current_dir()?;
    let output = cli.output_mode();
    debug!(?output, root = %project_root.display(), "starting");

    match cli.command {
        Commands::Sim(ref args) => match &args.command {
            cmd::sim::SimCommand::Run(run) => cmd::sim::run_sim_run(run, output),
            cmd::sim::SimCommand::Replay(replay) => cmd::sim::run_sim_replay(replay, output),
        },
        Commands::Config(ref args) => cmd::config::run_config(args, &project_root, output),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_flag_sets_output_mode() {
        let cli = Cli::parse_from(["shelf", "--json", "config", "path"]);
        assert!(cli.json);
        assert!(cli.output_mode().is_json());
    }

    #[test]
    fn format_flag_after_subcommand() {
        let cli = Cli::parse_from(["shelf", "config", "show", "--format", "text"]);
        assert_eq!(cli.format, Some(OutputMode::Text));
        assert_eq!(cli.output_mode(), OutputMode::Text);
    }

    #[test]
    fn verbose_short_flag() {
        let cli = Cli::parse_from(["shelf", "-v", "sim", "replay", "--seed", "3"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Sim(_)));
    }

    #[test]
    fn sim_run_parses_fault_knobs() {
        let cli = Cli::parse_from([
            "shelf", "sim", "run", "--seeds", "5", "--faults", "50", "--max-delay", "1",
        ]);
        let Commands::Sim(args) = cli.command else {
            panic!("expected sim");
        };
        let cmd::sim::SimCommand::Run(run) = args.command else {
            panic!("expected run");
        };
        assert_eq!(run.seeds, 5);
        assert_eq!(run.knobs.max_delay, 1);
        assert_eq!(run.knobs.faults, 50);
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
