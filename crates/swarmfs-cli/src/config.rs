//! Configuration system for the SwarmFS CLI.
//!
//! A `Default`-able struct tree, loaded from TOML with per-field defaults
//! so the file is never required; its fields project into
//! [`swarmfs_core::NodeConfig`].

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use swarmfs_core::{NodeConfig, PeerConfig, StoreConfig, TransferConfig};

/// SwarmFS CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Metadata store location.
    pub store: StoreSection,
    /// Download session tuning.
    pub transfer: TransferSection,
    /// Peer manager tuning.
    pub peer: PeerSection,
    /// Logging configuration.
    pub logging: LoggingSection,
}

/// On-disk data directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Root directory containing `swarmfs.db`, the lock file, and (when a
    /// daemon is present) the IPC socket.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Download session tuning, exposed as the subset a CLI user would
/// plausibly want to override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSection {
    /// Chunk size in bytes for newly-added files.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Maximum outstanding chunk requests per download session.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

/// Peer manager tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSection {
    /// Default per-peer concurrent-request cap.
    #[serde(default = "default_peer_max_concurrent")]
    pub default_max_concurrent: usize,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `tracing_subscriber` env-filter directive (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("swarmfs")
}

fn default_chunk_size() -> u64 {
    swarmfs_files::DEFAULT_CHUNK_SIZE
}

fn default_max_concurrent() -> usize {
    50
}

fn default_peer_max_concurrent() -> usize {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StoreSection {
    fn default() -> Self {
        Self { data_dir: default_data_dir() }
    }
}

impl Default for TransferSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

impl Default for PeerSection {
    fn default() -> Self {
        Self { default_max_concurrent: default_peer_max_concurrent() }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

impl Config {
    /// Load configuration from file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// The default config file path, `$XDG_CONFIG_HOME/swarmfs/config.toml`
    /// (or platform equivalent).
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("swarmfs/config.toml")
    }

    /// Load from the default path, writing a fresh default file if none
    /// exists yet.
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Reject configurations that would fail fast inside the engine
    /// anyway, with a clearer message than the underlying error.
    ///
    /// # Errors
    ///
    /// Returns an error if a value is out of its valid range.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > 16 * 1024 * 1024 {
            anyhow::bail!("chunk size must be between 1 and 16MiB");
        }
        if self.transfer.max_concurrent == 0 || self.transfer.max_concurrent > 1000 {
            anyhow::bail!("max concurrent transfers must be between 1 and 1000");
        }
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }
        Ok(())
    }

    /// Project this CLI configuration into the engine's [`NodeConfig`].
    #[must_use]
    pub fn to_node_config(&self) -> NodeConfig {
        NodeConfig {
            transfer: TransferConfig {
                chunk_size: self.transfer.chunk_size,
                max_concurrent: self.transfer.max_concurrent,
                ..TransferConfig::default()
            },
            peer: PeerConfig {
                default_max_concurrent: self.peer.default_max_concurrent,
                ..PeerConfig::default()
            },
            store: StoreConfig { data_dir: self.store.data_dir.clone() },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn invalid_chunk_size_fails_validation() {
        let mut config = Config::default();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn invalid_log_level_fails_validation() {
        let mut config = Config::default();
        config.logging.level = "shout".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_round_trips() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let back: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.transfer.chunk_size, back.transfer.chunk_size);
        assert_eq!(config.store.data_dir, back.store.data_dir);
    }

    #[test]
    fn node_config_projection_carries_overrides() {
        let mut config = Config::default();
        config.transfer.chunk_size = 4096;
        config.transfer.max_concurrent = 7;
        let node_config = config.to_node_config();
        assert_eq!(node_config.transfer.chunk_size, 4096);
        assert_eq!(node_config.transfer.max_concurrent, 7);
    }
}
