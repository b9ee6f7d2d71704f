//! Consensus-engine request and response types
//!
//! The engine itself is external. These types are the seam it drives the
//! [`Application`](crate::Application) through. Block-level types shared with
//! the module hooks are re-exported from `chain_modules::abci`.

use crate::error::TxError;
use chain_modules::{abci, Address, H256};
use chain_store::Event;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use chain_modules::abci::{Evidence, EvidenceKind, RequestEndBlock, ValidatorUpdate, VoteInfo};

/// InitChain request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInitChain {
    /// Genesis time
    pub time: DateTime<Utc>,
    /// Chain identifier
    pub chain_id: String,
    /// Validators from the engine's genesis, used when no module sets any
    pub validators: Vec<ValidatorUpdate>,
    /// JSON module fragments
    #[serde(with = "serde_bytes")]
    pub app_state_bytes: Vec<u8>,
}

/// InitChain response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInitChain {
    /// Initial validator set
    pub validators: Vec<ValidatorUpdate>,
}

/// Header fields of the block being begun
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Chain identifier
    pub chain_id: String,
    /// Height
    pub height: u64,
    /// Block time
    pub time: DateTime<Utc>,
}

/// BeginBlock request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBeginBlock {
    /// Block hash
    pub hash: H256,
    /// Block header
    pub header: Header,
    /// Consensus address of the proposer
    pub proposer: Address,
    /// Votes of the previous commit
    pub votes: Vec<VoteInfo>,
    /// Misbehaviour to punish
    pub byzantine_validators: Vec<Evidence>,
}

impl RequestBeginBlock {
    /// Part of the request handed to module hooks
    pub fn module_request(&self) -> abci::RequestBeginBlock {
        abci::RequestBeginBlock {
            hash: self.hash,
            proposer: self.proposer,
            votes: self.votes.clone(),
            byzantine_validators: self.byzantine_validators.clone(),
        }
    }
}

/// BeginBlock response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseBeginBlock {
    /// Events emitted by block-begin hooks
    pub events: Vec<Event>,
}

/// CheckTx and DeliverTx response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseDeliverTx {
    /// 0 on success
    pub code: u32,
    /// Concatenated message results
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Failure reason
    pub log: String,
    /// Gas limit requested
    pub gas_wanted: u64,
    /// Gas consumed
    pub gas_used: u64,
    /// Emitted events
    pub events: Vec<Event>,
    /// Codespace of `code`
    pub codespace: String,
}

/// CheckTx response
pub type ResponseCheckTx = ResponseDeliverTx;

impl ResponseDeliverTx {
    /// Failed response
    pub fn from_error(err: &TxError, gas_wanted: u64, gas_used: u64) -> Self {
        Self {
            code: err.code,
            log: err.log.clone(),
            gas_wanted,
            gas_used,
            codespace: err.codespace.clone(),
            ..Default::default()
        }
    }

    /// True when `code` is 0
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// EndBlock response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEndBlock {
    /// Validator power changes
    pub validator_updates: Vec<ValidatorUpdate>,
    /// Events emitted by block-end hooks
    pub events: Vec<Event>,
}

/// Commit response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseCommit {
    /// Application hash
    pub data: [u8; 32],
    /// Committed height
    pub height: u64,
}

/// Query request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestQuery {
    /// `custom/<route>/...`, `store/<name>/key` or `app/version`
    pub path: String,
    /// Request payload; the raw key for store queries
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Query response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseQuery {
    /// 0 on success
    pub code: u32,
    /// Failure reason
    pub log: String,
    /// Key queried
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,
    /// Result
    #[serde(with = "serde_bytes")]
    pub value: Vec<u8>,
    /// Height of the state queried
    pub height: u64,
    /// Codespace of `code`
    pub codespace: String,
}

impl ResponseQuery {
    /// Failed response
    pub fn from_error(err: &TxError, height: u64) -> Self {
        Self {
            code: err.code,
            log: err.log.clone(),
            height,
            codespace: err.codespace.clone(),
            ..Default::default()
        }
    }
}

/// Info response
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseInfo {
    /// Application name
    pub data: String,
    /// Application version
    pub version: String,
    /// Last committed height
    pub last_block_height: u64,
    /// Last committed hash
    pub last_block_app_hash: [u8; 32],
}
