use anyhow::{Result, bail};
use clap::{Args, Subcommand};
use linkshelf_core::ErrorCode;
use linkshelf_core::config::{
    ConfigSource, EffectiveConfig, FeedRecovery, project_config_path, resolve_config,
    user_config_path,
};
use serde::Serialize;
use std::path::{Path, PathBuf};

use crate::output::{CliError, OutputMode, pretty_kv, pretty_section, render_error};

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Show the resolved engine configuration and where it came from
    Show,
    /// Show the config file locations that are searched
    Path,
}

pub fn run_config(args: &ConfigArgs, project_root: &Path, output: OutputMode) -> Result<()> {
    match args.command {
        ConfigCommand::Show => run_show(project_root, output),
        ConfigCommand::Path => run_path(project_root, output),
    }
}

fn run_show(project_root: &Path, output: OutputMode) -> Result<()> {
    let effective = match resolve_config(project_root) {
        Ok(effective) => effective,
        Err(err) => {
            let code = if err.chain().any(|cause| cause.is::<toml::de::Error>()) {
                ErrorCode::ConfigParseError
            } else {
                ErrorCode::InternalUnexpected
            };
            render_error(output, &CliError::from_code(code, format!("{err:#}")))?;
            bail!("{}", code.message());
        }
    };
    print_effective(&effective, output)
}

#[derive(Debug, Serialize)]
struct PathEntry {
    scope: &'static str,
    path: PathBuf,
    exists: bool,
}

fn run_path(project_root: &Path, output: OutputMode) -> Result<()> {
    let mut entries = vec![entry("project", project_config_path(project_root))];
    if let Some(user) = user_config_path() {
        entries.push(entry("user", user));
    }

    match output {
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputMode::Text => {
            for e in &entries {
                println!("{}={} exists={}", e.scope, e.path.display(), e.exists);
            }
        }
        OutputMode::Pretty => {
            let stdout = std::io::stdout();
            let mut w = stdout.lock();
            pretty_section(&mut w, "Config Search Path")?;
            for e in &entries {
                let marker = if e.exists { "" } else { " (missing)" };
                pretty_kv(&mut w, e.scope, format!("{}{marker}", e.path.display()))?;
            }
        }
    }
    Ok(())
}

fn entry(scope: &'static str, path: PathBuf) -> PathEntry {
    let exists = path.is_file();
    PathEntry {
        scope,
        path,
        exists,
    }
}

const fn recovery_label(recovery: FeedRecovery) -> &'static str {
    match recovery {
        FeedRecovery::Ignore => "ignore",
        FeedRecovery::Reconnect => "reconnect",
    }
}

fn source_label(source: &ConfigSource) -> String {
    match source {
        ConfigSource::Project(path) => format!("project {}", path.display()),
        ConfigSource::User(path) => format!("user {}", path.display()),
        ConfigSource::Defaults => "defaults".to_string(),
    }
}

fn print_effective(value: &EffectiveConfig, output: OutputMode) -> Result<()> {
    let engine = &value.engine;
    match output {
        OutputMode::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputMode::Text => {
            println!("source={}", source_label(&value.source));
            println!("feed.recovery={}", recovery_label(engine.feed.recovery));
            println!(
                "feed.max_reconnect_attempts={}",
                engine.feed.max_reconnect_attempts
            );
            println!("feed.resync_on_reconnect={}", engine.feed.resync_on_reconnect);
            println!(
                "reconcile.tombstone_capacity={}",
                engine.reconcile.tombstone_capacity
            );
        }
        OutputMode::Pretty => {
            let stdout = std::io::stdout();
            let mut w = stdout.lock();
            pretty_section(&mut w, "Engine Config")?;
            pretty_kv(&mut w, "Source", source_label(&value.source))?;
            pretty_kv(&mut w, "Recovery", recovery_label(engine.feed.recovery))?;
            pretty_kv(
                &mut w,
                "Reconnects",
                format!(
                    "{} attempts, resync {}",
                    engine.feed.max_reconnect_attempts,
                    if engine.feed.resync_on_reconnect { "on" } else { "off" }
                ),
            )?;
            pretty_kv(
                &mut w,
                "Tombstones",
                engine.reconcile.tombstone_capacity.to_string(),
            )?;
        }
    }
    Ok(())
}
