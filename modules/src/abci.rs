//! Block-level request types passed to module lifecycle hooks
//!
//! The consensus engine identifies validators by consensus address, the
//! address derived from their consensus public key.

use crate::types::{Address, PubKey, H256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Validator power change reported to the consensus engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorUpdate {
    /// Consensus public key
    pub pub_key: PubKey,
    /// New voting power, 0 removes the validator
    pub power: u64,
}

/// Participation of one validator in the previous block's commit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteInfo {
    /// Consensus address
    pub address: Address,
    /// Voting power at that height
    pub power: u64,
    /// Whether its precommit was included
    pub signed_last_block: bool,
}

/// Kind of misbehaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    /// Two conflicting votes at the same height and round
    DuplicateVote,
}

/// Misbehaviour reported by the consensus engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evidence {
    /// Kind
    pub kind: EvidenceKind,
    /// Consensus address of the offender
    pub address: Address,
    /// Height of the infraction
    pub height: u64,
    /// Offender's power at that height
    pub power: u64,
    /// Time of the infraction
    pub time: DateTime<Utc>,
}

/// Input of the block-begin hooks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBeginBlock {
    /// Hash of the block being begun
    pub hash: H256,
    /// Consensus address of the block proposer
    pub proposer: Address,
    /// Votes of the previous block's commit
    pub votes: Vec<VoteInfo>,
    /// Misbehaviour to punish
    pub byzantine_validators: Vec<Evidence>,
}

/// Input of the block-end hooks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEndBlock {
    /// Height being ended
    pub height: u64,
}
