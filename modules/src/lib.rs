//! Chain Modules
//!
//! Ledger types and the module keepers composed by the application.
//!
//! # Architecture
//!
//! - **Keepers**: Cheap `Clone` handles over one store partition each;
//!   collaborators are passed in at construction, never looked up later
//! - **Modules**: [`AppModule`] wraps a keeper for genesis, routing,
//!   queries and invariants; block hooks are optional capabilities
//! - **Messages**: The closed [`Msg`] enum, routed by type identifier
//! - **Permissions**: Module accounts mint, burn and stake only with a
//!   matching entry in the [`PermissionTable`]
//!
//! # Invariants
//!
//! - Total supply equals the sum of all balances
//! - Bonded and not-bonded pool balances equal the tokens of their validators
//! - The staking hook slot is bound at most once
//! - Parameter subspaces are unique and allocated before sealing

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod abci;
pub mod auth;
pub mod bank;
pub mod distribution;
pub mod error;
pub mod evm;
pub mod genutil;
pub mod mint;
pub mod module;
pub mod msgs;
pub mod params;
pub mod slashing;
pub mod staking;
pub mod supply;
pub mod types;
pub mod upgrade;

#[cfg(test)]
pub(crate) mod testutil;

// Re-exports
pub use error::{Error, Result};
pub use module::{AppModule, BeginBlocker, DeliverGenesisTx, EndBlocker, InvariantRegistry};
pub use msgs::{Msg, MsgDefinition};
pub use types::{Address, Coin, Coins, DecCoins, Permission, PermissionTable, PubKey, H256, NATIVE_DENOM};
