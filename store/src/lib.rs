//! Chain Store
//!
//! Versioned, partitioned key/value state for the application.
//!
//! # Architecture
//!
//! - **Partitions**: Each module owns one store key, allocated once at startup
//! - **Versioning**: Every commit snapshots dirty partitions under a new version
//! - **Branching**: Execution runs in cache branches that are written or dropped
//! - **Metering**: All store access through a [`Context`] is charged gas
//!
//! # Invariants
//!
//! - Deterministic replay: same writes in the same order give the same app hash
//! - Transient partitions never outlive a block
//! - A failed branch leaves its parent untouched

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod cache;
pub mod config;
pub mod context;
pub mod crypto;
pub mod error;
pub mod gas;
pub mod multistore;
pub mod registry;
pub mod storage;
pub mod trace;
pub mod types;

// Re-exports
pub use cache::{CacheMultiStore, KvStore, WriteSet};
pub use config::{Config, PruningConfig};
pub use context::Context;
pub use error::{Error, Result};
pub use gas::{GasConfig, GasMeter};
pub use multistore::{CommitInfo, CommitMultiStore};
pub use registry::{StoreKeys, StoreRegistry};
pub use storage::{open_database, Database, MemDatabase, RocksDatabase};
pub use trace::Tracer;
pub use types::{BlockHeader, CommitId, Event, ExecMode, StoreKey, StoreKind};
