//! Module manager
//!
//! Holds the registered modules and the declared order of every lifecycle
//! callback. Orders are validated at construction: each entry must name a
//! registered module, at most once. Modules missing from the genesis order
//! are not initialised; modules missing from a block order have no hook
//! called.

use crate::{
    router::{QueryRouter, Router},
    Error, Result,
};
use chain_modules::{
    abci::{RequestBeginBlock, RequestEndBlock, ValidatorUpdate},
    AppModule, DeliverGenesisTx, InvariantRegistry,
};
use chain_store::Context;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Map of module name to genesis fragment
pub type GenesisState = BTreeMap<String, Value>;

/// Declared order of each lifecycle callback
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleOrders {
    /// InitChain and export
    pub init_genesis: Vec<&'static str>,
    /// BeginBlock
    pub begin_block: Vec<&'static str>,
    /// EndBlock
    pub end_block: Vec<&'static str>,
}

impl ModuleOrders {
    /// Orders used by the application
    pub fn standard() -> Self {
        use chain_modules::{auth, bank, distribution, evm, genutil, mint, slashing, staking, supply};

        Self {
            init_genesis: vec![
                auth::MODULE_NAME,
                distribution::MODULE_NAME,
                staking::MODULE_NAME,
                bank::MODULE_NAME,
                slashing::MODULE_NAME,
                mint::MODULE_NAME,
                supply::MODULE_NAME,
                genutil::MODULE_NAME,
                evm::MODULE_NAME,
            ],
            begin_block: vec![
                evm::MODULE_NAME,
                mint::MODULE_NAME,
                distribution::MODULE_NAME,
                slashing::MODULE_NAME,
            ],
            end_block: vec![evm::MODULE_NAME, staking::MODULE_NAME],
        }
    }
}

/// Ordered lifecycle dispatch over the registered modules
#[derive(Clone)]
pub struct ModuleManager {
    modules: BTreeMap<&'static str, Arc<dyn AppModule>>,
    orders: ModuleOrders,
}

impl std::fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleManager")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("orders", &self.orders)
            .finish()
    }
}

impl ModuleManager {
    /// Register `modules` and validate `orders` against them
    pub fn new(modules: Vec<Arc<dyn AppModule>>, orders: ModuleOrders) -> Result<Self> {
        let mut registered = BTreeMap::new();
        for module in modules {
            let name = module.name();
            if registered.insert(name, module).is_some() {
                return Err(Error::Wiring(format!("module {} registered twice", name)));
            }
        }

        for (callback, order) in [
            ("init_genesis", &orders.init_genesis),
            ("begin_block", &orders.begin_block),
            ("end_block", &orders.end_block),
        ] {
            let mut seen = BTreeSet::new();
            for name in order {
                let Some(module) = registered.get(name) else {
                    return Err(Error::Wiring(format!("{} order names unknown module {}", callback, name)));
                };
                if !seen.insert(*name) {
                    return Err(Error::Wiring(format!("{} order lists {} twice", callback, name)));
                }
                let capable = match callback {
                    "begin_block" => module.as_begin_blocker().is_some(),
                    "end_block" => module.as_end_blocker().is_some(),
                    _ => true,
                };
                if !capable {
                    return Err(Error::Wiring(format!("module {} has no {} hook", name, callback)));
                }
            }
        }

        Ok(Self {
            modules: registered,
            orders,
        })
    }

    /// Registered module by name
    pub fn module(&self, name: &str) -> Option<&Arc<dyn AppModule>> {
        self.modules.get(name)
    }

    /// Registered module names, sorted
    pub fn module_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.modules.keys().copied()
    }

    /// Declared orders
    pub fn orders(&self) -> &ModuleOrders {
        &self.orders
    }

    /// Message and query routers over every module
    pub fn register_routes(&self) -> Result<(Router, QueryRouter)> {
        let mut router = Router::new();
        let mut queries = QueryRouter::new();
        for module in self.modules.values() {
            router.add_module(Arc::clone(module))?;
            queries.add_module(Arc::clone(module))?;
        }
        Ok((router, queries))
    }

    /// Invariants of every module
    pub fn register_invariants(&self) -> InvariantRegistry {
        let mut registry = InvariantRegistry::new();
        for module in self.modules.values() {
            module.register_invariants(&mut registry);
        }
        registry
    }

    /// Default fragment of every module in the genesis order
    pub fn default_genesis(&self) -> GenesisState {
        self.ordered(&self.orders.init_genesis)
            .map(|module| (module.name().to_string(), module.default_genesis()))
            .collect()
    }

    /// Stateless check of every fragment; unknown fragments are rejected
    pub fn validate_genesis(&self, genesis: &GenesisState) -> Result<()> {
        if let Some(unknown) = genesis.keys().find(|name| !self.modules.contains_key(name.as_str())) {
            return Err(Error::Genesis(format!("genesis names unknown module {}", unknown)));
        }
        for module in self.ordered(&self.orders.init_genesis) {
            if let Some(fragment) = genesis.get(module.name()) {
                module
                    .validate_genesis(fragment)
                    .map_err(|e| Error::Genesis(format!("{}: {}", module.name(), e)))?;
            }
        }
        Ok(())
    }

    /// Apply fragments in genesis order, filling gaps with defaults
    ///
    /// At most one module may return a validator set.
    pub fn init_genesis(
        &self,
        ctx: &mut Context<'_>,
        genesis: &GenesisState,
        txs: &dyn DeliverGenesisTx,
    ) -> Result<Vec<ValidatorUpdate>> {
        let mut validators: Option<(&'static str, Vec<ValidatorUpdate>)> = None;

        for module in self.ordered(&self.orders.init_genesis) {
            let fragment = match genesis.get(module.name()) {
                Some(fragment) => fragment.clone(),
                None => module.default_genesis(),
            };
            let updates = module
                .init_genesis(ctx, &fragment, txs)
                .map_err(|e| Error::Genesis(format!("{}: {}", module.name(), e)))?;
            debug!(module = module.name(), updates = updates.len(), "Initialized module genesis");

            if updates.is_empty() {
                continue;
            }
            if let Some((first, _)) = &validators {
                return Err(Error::Genesis(format!(
                    "validator set returned by both {} and {}",
                    first,
                    module.name()
                )));
            }
            validators = Some((module.name(), updates));
        }

        let updates = validators.map(|(_, updates)| updates).unwrap_or_default();
        info!(validators = updates.len(), "Applied genesis");
        Ok(updates)
    }

    /// Export every module in genesis order
    pub fn export_genesis(&self, ctx: &mut Context<'_>) -> Result<GenesisState> {
        let mut state = GenesisState::new();
        for module in self.ordered(&self.orders.init_genesis) {
            state.insert(module.name().to_string(), module.export_genesis(ctx)?);
        }
        Ok(state)
    }

    /// Run every block-begin hook in order
    pub fn begin_block(&self, ctx: &mut Context<'_>, req: &RequestBeginBlock) -> Result<()> {
        for module in self.ordered(&self.orders.begin_block) {
            if let Some(hook) = module.as_begin_blocker() {
                hook.begin_block(ctx, req)?;
            }
        }
        Ok(())
    }

    /// Run every block-end hook in order
    ///
    /// At most one module may return validator updates.
    pub fn end_block(&self, ctx: &mut Context<'_>, req: &RequestEndBlock) -> Result<Vec<ValidatorUpdate>> {
        let mut validators: Option<(&'static str, Vec<ValidatorUpdate>)> = None;
        for module in self.ordered(&self.orders.end_block) {
            let Some(hook) = module.as_end_blocker() else {
                continue;
            };
            let updates = hook.end_block(ctx, req)?;
            if updates.is_empty() {
                continue;
            }
            if let Some((first, _)) = &validators {
                return Err(Error::Wiring(format!(
                    "validator updates returned by both {} and {}",
                    first,
                    module.name()
                )));
            }
            validators = Some((module.name(), updates));
        }
        Ok(validators.map(|(_, updates)| updates).unwrap_or_default())
    }

    fn ordered<'a>(&'a self, order: &'a [&'static str]) -> impl Iterator<Item = &'a Arc<dyn AppModule>> + 'a {
        order.iter().filter_map(move |name| self.modules.get(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{permissions::Permissions, wiring};
    use chain_modules::module::NoGenesisTxs;

    fn manager(orders: ModuleOrders) -> Result<ModuleManager> {
        let keys = wiring::allocate_stores()?;
        let keepers = wiring::Keepers::new(&keys, &Permissions::standard(), Default::default())?;
        ModuleManager::new(keepers.modules(), orders)
    }

    #[test]
    fn test_standard_orders_validate() {
        let manager = manager(ModuleOrders::standard()).unwrap();
        assert_eq!(manager.module_names().count(), 10);
        assert_eq!(manager.default_genesis().len(), 9);
        let (router, _) = manager.register_routes().unwrap();
        assert_eq!(router.type_urls().count(), chain_modules::Msg::type_urls().len());
    }

    #[test]
    fn test_unknown_module_in_order_rejected() {
        let mut orders = ModuleOrders::standard();
        orders.begin_block.push("gov");
        assert!(matches!(manager(orders), Err(Error::Wiring(_))));
    }

    #[test]
    fn test_duplicate_order_entry_rejected() {
        let mut orders = ModuleOrders::standard();
        orders.init_genesis.push("bank");
        assert!(matches!(manager(orders), Err(Error::Wiring(_))));
    }

    #[test]
    fn test_block_order_requires_hook() {
        let mut orders = ModuleOrders::standard();
        orders.end_block.push("bank");
        assert!(matches!(manager(orders), Err(Error::Wiring(_))));
    }

    #[test]
    fn test_validate_genesis_rejects_unknown_fragment() {
        let manager = manager(ModuleOrders::standard()).unwrap();
        let mut genesis = manager.default_genesis();
        assert!(manager.validate_genesis(&genesis).is_ok());
        genesis.insert("gov".into(), Value::Null);
        assert!(matches!(manager.validate_genesis(&genesis), Err(Error::Genesis(_))));
    }

    #[test]
    fn test_malformed_fragment_aborts_init() {
        let manager = manager(ModuleOrders::standard()).unwrap();
        let keys = wiring::allocate_stores().unwrap();
        let mut store = chain_store::CommitMultiStore::new(Arc::new(chain_store::MemDatabase::new()));
        store.mount_stores(&keys).unwrap();
        let header = chain_store::BlockHeader::genesis("test-chain", Default::default());
        let mut ctx = Context::new(&mut store, header, chain_store::ExecMode::Genesis);

        let mut genesis = GenesisState::new();
        genesis.insert("bank".into(), serde_json::json!({ "balances": 7 }));
        let err = manager.init_genesis(&mut ctx, &genesis, &NoGenesisTxs).unwrap_err();
        assert!(matches!(err, Error::Genesis(msg) if msg.starts_with("bank")));
    }
}
