//! Error types for the store

use thiserror::Error;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, Error>;

/// Store errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage backend error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Two partitions requested under the same name
    #[error("Duplicate store key: {0}")]
    DuplicateStoreKey(String),

    /// Partition was never allocated or mounted
    #[error("Unknown store: {0}")]
    UnknownStore(String),

    /// Requested version was never committed
    #[error("Version not found: {0}")]
    VersionNotFound(u64),

    /// Requested version was removed by pruning
    #[error("Version {version} pruned; earliest available: {earliest}")]
    VersionPruned {
        /// Requested version
        version: u64,
        /// Oldest loadable version
        earliest: u64,
    },

    /// Persisted state disagrees with its commit record
    #[error("Corrupted store: {0}")]
    Corrupted(String),

    /// Gas limit exceeded
    #[error("Out of gas in location: {descriptor}; gas limit: {limit}, consumed: {consumed}")]
    OutOfGas {
        /// What was being metered
        descriptor: String,
        /// Installed limit
        limit: u64,
        /// Gas consumed including the failing charge
        consumed: u64,
    },

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
