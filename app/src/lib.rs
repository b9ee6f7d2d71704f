//! Chain Application
//!
//! Composes the ledger modules into one deterministic state machine driven
//! by an external consensus engine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │                  Consensus Engine                    │
//! │  InitChain · BeginBlock · DeliverTx · EndBlock · Commit
//! └────────────────────────┬─────────────────────────────┘
//!                          ↓
//! ┌──────────────────────────────────────────────────────┐
//! │                   Application                        │
//! │  ante pipeline ─> router ─> module handlers          │
//! │  module manager: ordered genesis and block hooks     │
//! └────────────────────────┬─────────────────────────────┘
//!                          ↓
//! ┌──────────────────────────────────────────────────────┐
//! │      Keepers (wired once)  ·  Versioned multistore   │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle Order
//!
//! - **InitChain**: auth, distribution, staking, bank, slashing, mint,
//!   supply, genutil, evm
//! - **BeginBlock**: upgrade check, then evm, mint, distribution, slashing
//! - **EndBlock**: evm, staking
//!
//! # Invariants
//!
//! - Storage partitions and parameter subspaces are unique and fixed at startup
//! - Only permitted module accounts mint, burn or stake
//! - No message handler runs before its transaction passes the ante pipeline
//! - The same blocks applied to the same genesis give the same app hash

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod abci;
pub mod ante;
pub mod app;
pub mod config;
pub mod error;
pub mod genesis;
pub mod manager;
pub mod metrics;
pub mod permissions;
pub mod router;
pub mod tx;
pub mod wiring;

// Re-exports
pub use ante::{AnteHandler, AnteOutcome};
pub use app::{Application, ExportedApp, Phase};
pub use config::Config;
pub use error::{Error, Result, TxError};
pub use genesis::GenesisDoc;
pub use manager::{GenesisState, ModuleManager, ModuleOrders};
pub use metrics::Metrics;
pub use permissions::Permissions;
pub use tx::{EvmTx, StdFee, StdSignature, StdTx, Tx};
pub use wiring::{Keepers, WiringOptions};
