//! Module interface
//!
//! Every module implements [`AppModule`]. Block hooks are optional
//! capabilities: a module exposes [`BeginBlocker`] or [`EndBlocker`] through
//! `as_begin_blocker` / `as_end_blocker` only if it has block-level work.

use crate::{
    abci::{RequestBeginBlock, RequestEndBlock, ValidatorUpdate},
    msgs::Msg,
    Error, Result,
};
use chain_store::Context;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Delivers transactions embedded in genesis
pub trait DeliverGenesisTx {
    /// Run the full transaction pipeline on raw bytes in the genesis context
    fn deliver_genesis_tx(&self, ctx: &mut Context<'_>, tx: &[u8]) -> Result<()>;
}

/// A ledger module as seen by the application
pub trait AppModule: Send + Sync {
    /// Unique module name
    fn name(&self) -> &'static str;

    /// Genesis fragment used when none is supplied
    fn default_genesis(&self) -> Value;

    /// Stateless check of a genesis fragment
    fn validate_genesis(&self, genesis: &Value) -> Result<()>;

    /// Apply a genesis fragment, optionally returning the initial validator set
    fn init_genesis(
        &self,
        ctx: &mut Context<'_>,
        genesis: &Value,
        txs: &dyn DeliverGenesisTx,
    ) -> Result<Vec<ValidatorUpdate>>;

    /// Export current state as a genesis fragment
    fn export_genesis(&self, ctx: &mut Context<'_>) -> Result<Value>;

    /// Message type identifiers handled by this module
    fn message_types(&self) -> &'static [&'static str] {
        &[]
    }

    /// Execute one message
    fn handle(&self, _ctx: &mut Context<'_>, msg: &Msg) -> Result<Vec<u8>> {
        Err(Error::UnknownRequest(format!(
            "unrecognized {} message type: {}",
            self.name(),
            msg.type_url()
        )))
    }

    /// Query route served by this module
    fn query_route(&self) -> Option<&'static str> {
        None
    }

    /// Answer a query; `path` excludes the route
    fn query(&self, _ctx: &mut Context<'_>, path: &[&str], _data: &[u8]) -> Result<Value> {
        Err(Error::UnknownRequest(format!(
            "unknown {} query endpoint: {}",
            self.name(),
            path.join("/")
        )))
    }

    /// Register cross-state invariants
    fn register_invariants(&self, _registry: &mut InvariantRegistry) {}

    /// Block-begin capability
    fn as_begin_blocker(&self) -> Option<&dyn BeginBlocker> {
        None
    }

    /// Block-end capability
    fn as_end_blocker(&self) -> Option<&dyn EndBlocker> {
        None
    }
}

/// Work done at the start of every block
pub trait BeginBlocker {
    /// Run block-begin logic
    fn begin_block(&self, ctx: &mut Context<'_>, req: &RequestBeginBlock) -> Result<()>;
}

/// Work done at the end of every block
pub trait EndBlocker {
    /// Run block-end logic, returning validator power changes
    fn end_block(&self, ctx: &mut Context<'_>, req: &RequestEndBlock) -> Result<Vec<ValidatorUpdate>>;
}

/// Invariant check: `Ok(Some(reason))` when broken
pub type Invariant = Arc<dyn Fn(&mut Context<'_>) -> Result<Option<String>> + Send + Sync>;

/// A registered invariant
#[derive(Clone)]
pub struct InvariantRoute {
    /// Owning module
    pub module: &'static str,
    /// Route within the module
    pub route: &'static str,
    /// Check
    pub invariant: Invariant,
}

impl fmt::Debug for InvariantRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.module, self.route)
    }
}

/// A failed invariant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokenInvariant {
    /// `module/route`
    pub route: String,
    /// Reason reported by the check
    pub message: String,
}

/// Invariants collected from every module
#[derive(Debug, Default, Clone)]
pub struct InvariantRegistry {
    routes: Vec<InvariantRoute>,
}

impl InvariantRegistry {
    /// Create empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a check
    pub fn register<F>(&mut self, module: &'static str, route: &'static str, invariant: F)
    where
        F: Fn(&mut Context<'_>) -> Result<Option<String>> + Send + Sync + 'static,
    {
        self.routes.push(InvariantRoute {
            module,
            route,
            invariant: Arc::new(invariant),
        });
    }

    /// Registered checks in registration order
    pub fn routes(&self) -> &[InvariantRoute] {
        &self.routes
    }

    /// Run every check
    pub fn check_all(&self, ctx: &mut Context<'_>) -> Result<Vec<BrokenInvariant>> {
        let mut broken = Vec::new();
        for route in &self.routes {
            if let Some(message) = (route.invariant)(ctx)? {
                broken.push(BrokenInvariant {
                    route: format!("{}/{}", route.module, route.route),
                    message,
                });
            }
        }
        Ok(broken)
    }
}

/// Decode a genesis fragment
pub fn parse_genesis<T: DeserializeOwned>(module: &str, genesis: &Value) -> Result<T> {
    serde_json::from_value(genesis.clone())
        .map_err(|e| Error::Genesis(format!("failed to decode {} genesis: {}", module, e)))
}

/// Encode a genesis fragment or query response
pub fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| Error::Decode(e.to_string()))
}

/// Genesis delivery that rejects every transaction
#[derive(Debug, Default, Clone, Copy)]
pub struct NoGenesisTxs;

impl DeliverGenesisTx for NoGenesisTxs {
    fn deliver_genesis_tx(&self, _ctx: &mut Context<'_>, _tx: &[u8]) -> Result<()> {
        Err(Error::Genesis("genesis transactions are not accepted here".to_string()))
    }
}
