//! Core store types
//!
//! Store keys are opaque handles; the only way to obtain one is through
//! [`StoreRegistry`](crate::registry::StoreRegistry), which guarantees that
//! every partition name has exactly one owner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Lifetime class of a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum StoreKind {
    /// Versioned and persisted on commit
    Persistent,
    /// Block-scoped, cleared on every commit
    Transient,
}

/// Handle binding a module to its exclusive storage partition
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StoreKey {
    kind: StoreKind,
    name: Arc<str>,
}

impl StoreKey {
    pub(crate) fn new(name: &str, kind: StoreKind) -> Self {
        Self {
            kind,
            name: Arc::from(name),
        }
    }

    /// Partition name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Persistent or transient
    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// True for block-scoped partitions
    pub fn is_transient(&self) -> bool {
        self.kind == StoreKind::Transient
    }
}

impl fmt::Debug for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            StoreKind::Persistent => write!(f, "StoreKey({})", self.name),
            StoreKind::Transient => write!(f, "TransientStoreKey({})", self.name),
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Identifies a committed state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommitId {
    /// Version (block height) of the commit
    pub version: u64,
    /// Merkle root over the partition hashes
    pub hash: [u8; 32],
}

/// Block header fields visible to modules
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Chain identifier, bound into every signature
    pub chain_id: String,
    /// Block height (0 during genesis)
    pub height: u64,
    /// Block time
    pub time: DateTime<Utc>,
}

impl BlockHeader {
    /// Header used while applying genesis
    pub fn genesis(chain_id: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            chain_id: chain_id.into(),
            height: 0,
            time,
        }
    }
}

/// Execution mode of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Chain initialization
    Genesis,
    /// Mempool admission; only the ante pipeline runs
    Check,
    /// Block execution
    Deliver,
    /// Read-only query
    Query,
}

/// Key/value attribute of an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    /// Attribute key
    pub key: String,
    /// Attribute value
    pub value: String,
}

/// Typed event emitted during execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event type, e.g. `transfer`
    pub kind: String,
    /// Ordered attributes
    pub attributes: Vec<Attribute>,
}

impl Event {
    /// Create an event without attributes
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: Vec::new(),
        }
    }

    /// Append an attribute
    pub fn attr(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.attributes.push(Attribute {
            key: key.into(),
            value: value.to_string(),
        });
        self
    }

    /// Look up the first attribute with `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }
}
