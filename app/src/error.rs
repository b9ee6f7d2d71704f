//! Error types for the application

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type for application operations
pub type Result<T> = std::result::Result<T, Error>;

/// Application errors
///
/// These abort the call they occur in. Per-transaction failures are
/// reported as [`TxError`] inside the response instead.
#[derive(Error, Debug)]
pub enum Error {
    /// Store error
    #[error("Store error: {0}")]
    Store(#[from] chain_store::Error),

    /// Module error outside a transaction
    #[error("Module error: {0}")]
    Module(#[from] chain_modules::Error),

    /// Genesis could not be applied
    #[error("Genesis error: {0}")]
    Genesis(String),

    /// Lifecycle call out of order
    #[error("Invalid phase: cannot {call} while {phase}")]
    InvalidPhase {
        /// Rejected call
        call: &'static str,
        /// Current phase
        phase: String,
    },

    /// Registered invariant failed
    #[error("Invariant broken: {0}")]
    InvariantBroken(String),

    /// Block header inconsistent with committed state
    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    /// Configured halt height reached
    #[error("Halt height {0} reached")]
    Halted(u64),

    /// Wiring error
    #[error("Wiring error: {0}")]
    Wiring(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Failure of one transaction, reported to the consensus engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxError {
    /// Codespace of `code`
    pub codespace: String,
    /// Non-zero result code
    pub code: u32,
    /// Human-readable reason
    pub log: String,
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.codespace, self.code, self.log)
    }
}

impl std::error::Error for TxError {}

impl From<&chain_modules::Error> for TxError {
    fn from(err: &chain_modules::Error) -> Self {
        Self {
            codespace: err.codespace().to_string(),
            code: err.code(),
            log: err.to_string(),
        }
    }
}

impl From<chain_modules::Error> for TxError {
    fn from(err: chain_modules::Error) -> Self {
        Self::from(&err)
    }
}
