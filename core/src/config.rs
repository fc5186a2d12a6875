//! Replay configuration (~/.config/Statestream/replay.toml)
//!
//! Handles loading, saving, and providing defaults for replay settings.
//! Settings are stored in TOML format in the platform-specific config directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::replay::checkpoint::{CheckpointPolicy, Compression, MAX_COMMIT_INTERVAL, MAX_COMMIT_THRESHOLD};

/// File name of the replay config inside the config directory
pub const CONFIG_FILE: &str = "replay.toml";

/// Replay configuration.
///
/// Contains all user-configurable settings organized into sections.
/// Serialized to/from TOML format for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ReplayConfig {
    /// Checkpoint commit policy
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Frame position index sizing
    #[serde(default)]
    pub index: IndexConfig,
    /// Playback behavior
    #[serde(default)]
    pub playback: PlaybackConfig,
    /// Save/load-state undo behavior
    #[serde(default)]
    pub undo: UndoConfig,
    /// On-screen notification settings
    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Checkpoint commit policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Frames between checkpoint commits (default: 300, 0 = never by interval)
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Changed blocks that force an early commit (default: 256, 0 = never by threshold)
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    /// Compression applied to each commit record (default: lz4)
    #[serde(default = "default_compression")]
    pub compression: Compression,
}

/// Frame position index configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// log2 of the ring capacity (default: 20, i.e. 1M frames; clamped to 4..=24)
    #[serde(default = "default_capacity_log2")]
    pub capacity_log2: u32,
}

/// Playback configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Deserialize checkpoints into the core as they are replayed (default: true)
    #[serde(default = "default_true")]
    pub apply_checkpoints: bool,
}

/// Undo configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UndoConfig {
    /// Let loads and undos overwrite battery-backed save RAM (default: false)
    #[serde(default)]
    pub restore_save_ram: bool,
}

/// Notification configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// How long messages stay on screen (default: 180 frames)
    #[serde(default = "default_duration")]
    pub duration_frames: u32,
    /// Message priority (default: 1)
    #[serde(default = "default_priority")]
    pub priority: u32,
}

fn default_interval() -> u32 {
    300
}
fn default_threshold() -> u32 {
    256
}
fn default_compression() -> Compression {
    Compression::Lz4
}
fn default_capacity_log2() -> u32 {
    20
}
fn default_true() -> bool {
    true
}
fn default_duration() -> u32 {
    180
}
fn default_priority() -> u32 {
    1
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            threshold: default_threshold(),
            compression: default_compression(),
        }
    }
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            capacity_log2: default_capacity_log2(),
        }
    }
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            apply_checkpoints: default_true(),
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            duration_frames: default_duration(),
            priority: default_priority(),
        }
    }
}

impl ReplayConfig {
    /// Commit policy with interval and threshold clamped to what the header can store
    pub fn policy(&self) -> CheckpointPolicy {
        let interval = self.checkpoint.interval.min(MAX_COMMIT_INTERVAL);
        let threshold = self.checkpoint.threshold.min(MAX_COMMIT_THRESHOLD);
        if interval != self.checkpoint.interval || threshold != self.checkpoint.threshold {
            tracing::warn!(
                "[Replay] checkpoint policy clamped to interval={} threshold={}",
                interval,
                threshold
            );
        }
        CheckpointPolicy {
            interval,
            threshold,
            compression: self.checkpoint.compression,
        }
    }

    /// Frame index capacity log2, clamped to a sane range
    pub fn index_capacity_log2(&self) -> u32 {
        self.index.capacity_log2.clamp(4, 24)
    }
}

/// Errors reading a config file
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Returns the platform-specific configuration directory.
///
/// On Windows: `%APPDATA%\Statestream\config`
/// On macOS: `~/Library/Application Support/io.statestream.Statestream`
/// On Linux: `~/.config/Statestream`
///
/// Returns `None` if the home directory cannot be determined.
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("io.statestream", "", "Statestream")
        .map(|dirs| dirs.config_dir().to_path_buf())
}

/// Loads the configuration from disk.
///
/// Reads `replay.toml` from the platform's configuration directory.
/// Returns default values if the file doesn't exist or cannot be parsed.
pub fn load() -> ReplayConfig {
    let Some(path) = config_dir().map(|dir| dir.join(CONFIG_FILE)) else {
        return ReplayConfig::default();
    };
    match load_from(&path) {
        Ok(config) => config,
        Err(ConfigError::Read { .. }) => ReplayConfig::default(),
        Err(e) => {
            tracing::warn!("Ignoring {}: {}", path.display(), e);
            ReplayConfig::default()
        }
    }
}

/// Loads the configuration from an explicit path.
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not valid TOML.
pub fn load_from(path: &Path) -> Result<ReplayConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&content)?)
}

/// Saves the configuration to disk.
///
/// Writes `replay.toml` to the platform's configuration directory.
/// Creates the directory if it doesn't exist.
///
/// # Errors
///
/// Returns an error if the directory cannot be created or the file
/// cannot be written.
pub fn save(config: &ReplayConfig) -> std::io::Result<()> {
    if let Some(dir) = config_dir() {
        save_to(config, &dir.join(CONFIG_FILE))?;
    }
    Ok(())
}

/// Saves the configuration to an explicit path.
pub fn save_to(config: &ReplayConfig, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = toml::to_string_pretty(config).map_err(std::io::Error::other)?;
    std::fs::write(path, content)
}

#[cfg(test)]
mod tests {
    use super::*;

    // =============================================================
    // Default value tests
    // =============================================================

    #[test]
    fn test_config_default() {
        let config = ReplayConfig::default();
        assert_eq!(config.checkpoint.interval, 300);
        assert_eq!(config.checkpoint.threshold, 256);
        assert_eq!(config.checkpoint.compression, Compression::Lz4);
        assert_eq!(config.index.capacity_log2, 20);
        assert!(config.playback.apply_checkpoints);
        assert!(!config.undo.restore_save_ram);
        assert_eq!(config.notify.duration_frames, 180);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: ReplayConfig = toml::from_str(
            r#"
            [checkpoint]
            interval = 60
            compression = "none"
            "#,
        )
        .unwrap();
        assert_eq!(config.checkpoint.interval, 60);
        assert_eq!(config.checkpoint.threshold, 256);
        assert_eq!(config.checkpoint.compression, Compression::None);
        assert_eq!(config.playback, PlaybackConfig::default());
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config: ReplayConfig = toml::from_str("").unwrap();
        assert_eq!(config, ReplayConfig::default());
    }

    // =============================================================
    // Policy clamping
    // =============================================================

    #[test]
    fn test_policy_clamps_to_header_limits() {
        let mut config = ReplayConfig::default();
        config.checkpoint.interval = 1_000_000;
        config.checkpoint.threshold = 100_000;
        let policy = config.policy();
        assert_eq!(policy.interval, MAX_COMMIT_INTERVAL);
        assert_eq!(policy.threshold, MAX_COMMIT_THRESHOLD);
    }

    #[test]
    fn test_index_capacity_clamped() {
        let mut config = ReplayConfig::default();
        config.index.capacity_log2 = 40;
        assert_eq!(config.index_capacity_log2(), 24);
        config.index.capacity_log2 = 0;
        assert_eq!(config.index_capacity_log2(), 4);
    }

    // =============================================================
    // Persistence
    // =============================================================

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let mut config = ReplayConfig::default();
        config.checkpoint.interval = 4;
        config.undo.restore_save_ram = true;
        save_to(&config, &path).unwrap();

        assert_eq!(load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_load_from_reports_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "[checkpoint]\ninterval = \"soon\"\n").unwrap();
        assert!(matches!(load_from(&path), Err(ConfigError::Parse(_))));
    }
}
