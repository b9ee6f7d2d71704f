//! Configuration for the store

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// Which database backend to open
    pub backend: Backend,

    /// RocksDB configuration
    pub rocksdb: RocksDBConfig,

    /// Snapshot and pruning policy
    #[serde(default)]
    pub pruning: PruningConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/application"),
            backend: Backend::RocksDb,
            rocksdb: RocksDBConfig::default(),
            pruning: PruningConfig::default(),
        }
    }
}

/// Version retention
///
/// Each commit persists only the keys it changed. Every `snapshot_interval`
/// versions a full copy of each partition is written as well, bounding how
/// many change sets a reload replays. With `keep_recent` set, versions older
/// than the newest snapshot at or below `latest - keep_recent` are deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PruningConfig {
    /// Versions that stay loadable behind the latest; 0 keeps everything
    pub keep_recent: u64,

    /// Full snapshot every N versions; 0 disables snapshots
    pub snapshot_interval: u64,
}

impl Default for PruningConfig {
    fn default() -> Self {
        Self {
            keep_recent: 0,
            snapshot_interval: 1000,
        }
    }
}

impl PruningConfig {
    /// Keep every version, never snapshot
    pub fn nothing() -> Self {
        Self {
            keep_recent: 0,
            snapshot_interval: 0,
        }
    }

    /// Reject `keep_recent` without snapshots
    pub fn validate(&self) -> crate::Result<()> {
        if self.keep_recent > 0 && self.snapshot_interval == 0 {
            return Err(crate::Error::Config(
                "pruning.keep_recent requires a non-zero pruning.snapshot_interval".into(),
            ));
        }
        Ok(())
    }
}

/// Database backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Persistent RocksDB database
    RocksDb,
    /// Volatile in-process map (tests, throwaway nodes)
    Memory,
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDBConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Target file size (MB)
    pub target_file_size_mb: u64,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,

    /// Enable statistics
    pub enable_statistics: bool,

    /// fsync every commit batch
    pub sync_writes: bool,
}

impl Default for RocksDBConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            target_file_size_mb: 64,
            max_background_jobs: 4,
            enable_statistics: false,
            sync_writes: true,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// In-memory configuration, used by tests
    pub fn memory() -> Self {
        Self {
            backend: Backend::Memory,
            ..Default::default()
        }
    }
}
