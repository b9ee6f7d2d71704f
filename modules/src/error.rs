//! Error types for the ledger modules
//!
//! Every error maps to a stable `(codespace, code)` pair that is reported in
//! transaction results. The root codespace is `sdk`; module-specific errors
//! carry their module name as codespace.

use thiserror::Error;

/// Result type for module operations
pub type Result<T> = std::result::Result<T, Error>;

/// Root codespace
pub const ROOT_CODESPACE: &str = "sdk";

/// Module errors
#[derive(Error, Debug)]
pub enum Error {
    /// Transaction bytes could not be decoded
    #[error("tx parse error: {0}")]
    Decode(String),

    /// Declared sequence differs from the stored one
    #[error("account sequence mismatch, expected {expected}, got {got}")]
    SequenceMismatch {
        /// Stored sequence
        expected: u64,
        /// Declared sequence
        got: u64,
    },

    /// Signer lacks the authority for the operation
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Signature did not verify
    #[error("signature verification failed: {0}")]
    InvalidSignature(String),

    /// Balance too low
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// No handler for the request
    #[error("unknown request: {0}")]
    UnknownRequest(String),

    /// Malformed address
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Address has no account
    #[error("unknown address: {0}")]
    UnknownAddress(String),

    /// Malformed coin amounts
    #[error("invalid coins: {0}")]
    InvalidCoins(String),

    /// Gas limit exceeded
    #[error("out of gas: {0}")]
    OutOfGas(String),

    /// Memo over the configured limit
    #[error("memo too large: maximum number of characters is {max} but received {got}")]
    MemoTooLarge {
        /// Limit
        max: u64,
        /// Actual length
        got: u64,
    },

    /// Fee below the node's minimum gas prices
    #[error("insufficient fee: {0}")]
    InsufficientFee(String),

    /// More signatures than the configured limit
    #[error("too many signatures: {got} > {max}")]
    TooManySignatures {
        /// Limit
        max: u64,
        /// Actual count
        got: u64,
    },

    /// Transaction carries no signatures
    #[error("no signatures supplied")]
    NoSignatures,

    /// Request is well-formed but not acceptable
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Stateless validation failed
    #[error("invalid transaction: {0}")]
    ValidateBasic(String),

    /// Module-specific failure
    #[error("{message}")]
    Module {
        /// Owning module
        codespace: &'static str,
        /// Code within the codespace
        code: u32,
        /// Description
        message: String,
    },

    /// Parameter subspace registered twice
    #[error("duplicate parameter subspace: {0}")]
    DuplicateSubspace(String),

    /// Parameter subspace requested after wiring
    #[error("parameter subspaces are sealed, cannot create {0}")]
    ParamsSealed(String),

    /// Staking hooks bound twice
    #[error("staking hooks already set")]
    HooksAlreadySet,

    /// Malformed or inconsistent genesis fragment
    #[error("genesis error: {0}")]
    Genesis(String),

    /// Scheduled upgrade reached without a handler
    #[error("UPGRADE \"{name}\" NEEDED at height: {height}")]
    UpgradeRequired {
        /// Plan name
        name: String,
        /// Plan height
        height: u64,
    },

    /// Store failure
    #[error("store error: {0}")]
    Store(chain_store::Error),
}

impl Error {
    /// Module-specific error
    pub fn module(codespace: &'static str, code: u32, message: impl Into<String>) -> Self {
        Error::Module {
            codespace,
            code,
            message: message.into(),
        }
    }

    /// Codespace of the error
    pub fn codespace(&self) -> &'static str {
        match self {
            Error::Module { codespace, .. } => *codespace,
            _ => ROOT_CODESPACE,
        }
    }

    /// Stable error code within the codespace
    pub fn code(&self) -> u32 {
        match self {
            Error::Decode(_) => 2,
            Error::SequenceMismatch { .. } => 3,
            Error::Unauthorized(_) | Error::InvalidSignature(_) => 4,
            Error::InsufficientFunds(_) => 5,
            Error::UnknownRequest(_) => 6,
            Error::InvalidAddress(_) => 7,
            Error::UnknownAddress(_) => 9,
            Error::InvalidCoins(_) => 10,
            Error::OutOfGas(_) => 11,
            Error::MemoTooLarge { .. } => 12,
            Error::InsufficientFee(_) => 13,
            Error::TooManySignatures { .. } => 14,
            Error::NoSignatures => 15,
            Error::InvalidRequest(_) => 18,
            Error::ValidateBasic(_) => 19,
            Error::Module { code, .. } => *code,
            _ => 1,
        }
    }
}

impl From<chain_store::Error> for Error {
    fn from(err: chain_store::Error) -> Self {
        if matches!(err, chain_store::Error::OutOfGas { .. }) {
            Error::OutOfGas(err.to_string())
        } else {
            Error::Store(err)
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Store(chain_store::Error::Serialization(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(Error::SequenceMismatch { expected: 1, got: 0 }.code(), 3);
        assert_eq!(Error::InsufficientFunds("x".into()).code(), 5);
        assert_eq!(Error::NoSignatures.code(), 15);
        assert_eq!(Error::Genesis("bad".into()).code(), 1);

        let err = Error::module("staking", 2, "validator exists");
        assert_eq!(err.codespace(), "staking");
        assert_eq!(err.code(), 2);
        assert_eq!(Error::Decode("x".into()).codespace(), ROOT_CODESPACE);
    }

    #[test]
    fn test_out_of_gas_from_store() {
        let err: Error = chain_store::Error::OutOfGas {
            descriptor: "WriteFlat".into(),
            limit: 10,
            consumed: 2000,
        }
        .into();
        assert_eq!(err.code(), 11);
    }
}
