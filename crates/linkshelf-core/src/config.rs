use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::reconcile::DEFAULT_TOMBSTONE_CAPACITY;

/// Project-level config file, relative to the project root.
pub const PROJECT_CONFIG_PATH: &str = ".linkshelf/config.toml";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

/// What the feed subscriber does when its subscription drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedRecovery {
    /// Log the drop and stop listening until the session is reactivated.
    Ignore,
    /// Re-subscribe, optionally followed by a full resync.
    #[default]
    Reconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default)]
    pub recovery: FeedRecovery,
    /// Consecutive failed re-subscribe attempts before giving up.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_true")]
    pub resync_on_reconnect: bool,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            recovery: FeedRecovery::default(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            resync_on_reconnect: default_true(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Removed ids remembered to reject stale inserts. Zero disables tombstones.
    #[serde(default = "default_tombstone_capacity")]
    pub tombstone_capacity: usize,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            tombstone_capacity: default_tombstone_capacity(),
        }
    }
}

/// Where the effective config came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ConfigSource {
    Project(PathBuf),
    User(PathBuf),
    Defaults,
}

#[derive(Debug, Clone, Serialize)]
pub struct EffectiveConfig {
    pub engine: EngineConfig,
    pub source: ConfigSource,
}

/// Parse an engine config from a TOML file; a missing file yields `None`.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_config_file(path: &Path) -> Result<Option<EngineConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    toml::from_str::<EngineConfig>(&content)
        .with_context(|| format!("Failed to parse {}", path.display()))
        .map(Some)
}

#[must_use]
pub fn project_config_path(project_root: &Path) -> PathBuf {
    project_root.join(PROJECT_CONFIG_PATH)
}

#[must_use]
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("linkshelf/config.toml"))
}

/// Resolve the config: project file wins over the user file, then defaults.
///
/// # Errors
///
/// Returns an error if a config file that exists fails to parse.
pub fn resolve_config(project_root: &Path) -> Result<EffectiveConfig> {
    resolve_config_from(&project_config_path(project_root), user_config_path().as_deref())
}

fn resolve_config_from(project: &Path, user: Option<&Path>) -> Result<EffectiveConfig> {
    if let Some(engine) = load_config_file(project)? {
        return Ok(EffectiveConfig {
            engine,
            source: ConfigSource::Project(project.to_path_buf()),
        });
    }

    if let Some(user) = user
        && let Some(engine) = load_config_file(user)?
    {
        return Ok(EffectiveConfig {
            engine,
            source: ConfigSource::User(user.to_path_buf()),
        });
    }

    Ok(EffectiveConfig {
        engine: EngineConfig::default(),
        source: ConfigSource::Defaults,
    })
}

const fn default_true() -> bool {
    true
}

const fn default_max_reconnect_attempts() -> u32 {
    3
}

const fn default_tombstone_capacity() -> usize {
    DEFAULT_TOMBSTONE_CAPACITY
}
