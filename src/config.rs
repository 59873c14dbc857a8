//! Server configuration.
//!
//! Read from a TOML file. Every field has a default, so a missing file (or an
//! empty one) gives a working single-instance server that keeps its registry
//! in a JSON file under the user's data directory.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Unix socket the server listens on (default: see `client::default_socket_path`).
    pub socket_path: Option<PathBuf>,
    /// Directory receiving one `<node>.log` file per console.
    pub log_dir: PathBuf,
    pub storage: StorageConfig,
    pub pool: PoolConfig,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: None,
            log_dir: default_state_dir().join("logs"),
            storage: StorageConfig::default(),
            pool: PoolConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// JSON document on local disk, synchronous writes.
    File,
    /// In-process store shared by peers, not durable.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub kind: StorageKind,
    /// Registry file for the `file` backend.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            kind: StorageKind::File,
            path: default_state_dir().join("nodes.json"),
        }
    }
}

/// What a bulk submission does when the worker queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Wait for a free queue slot.
    #[default]
    Block,
    /// Fail the item immediately with `pool_full`.
    Reject,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    /// Number of concurrent bulk work units (default: 16).
    pub workers: usize,
    /// Pending units accepted before the overflow policy applies (default: 100).
    pub queue_depth: usize,
    pub overflow: OverflowPolicy,
    /// Upper bound for a single bulk item, in milliseconds (default: 30000).
    pub item_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 16,
            queue_depth: 100,
            overflow: OverflowPolicy::Block,
            item_timeout_ms: 30_000,
        }
    }
}

impl PoolConfig {
    #[must_use]
    pub const fn item_timeout(&self) -> Duration {
        Duration::from_millis(self.item_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Deadline for a driver to produce a console, in milliseconds (default: 10000).
    pub spawn_timeout_ms: u64,
    /// How long an on-demand console survives without viewers, in milliseconds (default: 2000).
    pub idle_grace_ms: u64,
    /// Bytes of recent output kept in memory for `tail` (default: 1 MiB).
    pub ring_size: usize,
    /// Output chunks buffered per viewer before it starts losing data (default: 1024).
    pub fanout_capacity: usize,
    /// Terminal rows handed to drivers.
    pub rows: u16,
    /// Terminal columns handed to drivers.
    pub cols: u16,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            spawn_timeout_ms: 10_000,
            idle_grace_ms: 2_000,
            ring_size: 1024 * 1024,
            fanout_capacity: 1024,
            rows: 24,
            cols: 80,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn spawn_timeout(&self) -> Duration {
        Duration::from_millis(self.spawn_timeout_ms)
    }

    #[must_use]
    pub const fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }
}

impl Config {
    /// Load configuration from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the server unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.workers == 0 {
            return Err(ConfigError::Invalid("pool.workers must be at least 1".into()));
        }
        if self.pool.queue_depth == 0 {
            return Err(ConfigError::Invalid("pool.queue_depth must be at least 1".into()));
        }
        if self.session.fanout_capacity == 0 {
            return Err(ConfigError::Invalid(
                "session.fanout_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Base directory for the registry file and console logs.
#[must_use]
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir().map_or_else(|| PathBuf::from("/tmp/congo"), |dir| dir.join("congo"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.storage.kind, StorageKind::File);
        assert_eq!(config.pool.workers, 16);
        assert_eq!(config.pool.queue_depth, 100);
        assert_eq!(config.pool.overflow, OverflowPolicy::Block);
        assert_eq!(config.session.idle_grace(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            log_dir = "/var/log/congo"

            [storage]
            kind = "memory"

            [pool]
            workers = 4
            overflow = "reject"
            "#,
        )
        .expect("parse");
        assert_eq!(config.log_dir, PathBuf::from("/var/log/congo"));
        assert_eq!(config.storage.kind, StorageKind::Memory);
        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.pool.queue_depth, 100);
        assert_eq!(config.pool.overflow, OverflowPolicy::Reject);
    }

    #[test]
    fn test_unknown_storage_kind_is_rejected() {
        let result: Result<Config, _> = toml::from_str("[storage]\nkind = \"etcd\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_workers_is_invalid() {
        let mut config = Config::default();
        config.pool.workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Some(Path::new("/nonexistent/congo.toml")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }
}
