//! Keeper dependency graph
//!
//! Keepers are built in dependency order. Each constructor takes only the
//! collaborators already built before it, so an out-of-order wiring does
//! not compile:
//!
//! ```text
//! params ─> auth ─> bank ─> supply ─> staking ─┬─> mint
//!                                              ├─> distribution ─┐
//!                                              └─> slashing ─────┴─> staking hooks
//! upgrade (independent)
//! evm (auth, supply)
//! ```
//!
//! The staking hook slot is bound once, after distribution and slashing
//! exist. Parameter subspaces are sealed when wiring ends.

use crate::{permissions::Permissions, Result};
use chain_modules::{
    auth::{self, AccountFactory, AccountKeeper, AuthModule},
    bank::{self, BankKeeper, BankModule},
    distribution::{self, DistributionHooks, DistributionKeeper, DistributionModule},
    evm::{self, EvmKeeper, EvmModule},
    genutil::GenutilModule,
    mint::{self, MintKeeper, MintModule},
    params::{self, ParamsKeeper},
    slashing::{self, SlashingHooks, SlashingKeeper, SlashingModule},
    staking::{self, MultiStakingHooks, StakingKeeper, StakingModule},
    supply::{self, SupplyKeeper, SupplyModule},
    upgrade::{self, UpgradeHandler, UpgradeKeeper, UpgradeModule},
    Address, AppModule,
};
use chain_store::{StoreKeys, StoreRegistry};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Partition holding application metadata
pub const MAIN_STORE: &str = "main";

/// Persistent partitions, one per module that keeps state
pub const PERSISTENT_STORES: &[&str] = &[
    MAIN_STORE,
    auth::STORE_KEY,
    bank::STORE_KEY,
    staking::STORE_KEY,
    supply::STORE_KEY,
    mint::STORE_KEY,
    distribution::STORE_KEY,
    slashing::STORE_KEY,
    params::STORE_KEY,
    upgrade::STORE_KEY,
    evm::STORE_KEY,
];

/// Transient partitions, cleared on every commit
pub const TRANSIENT_STORES: &[&str] = &[params::TSTORE_KEY, staking::TSTORE_KEY, evm::TSTORE_KEY];

/// Allocate every partition the application uses
pub fn allocate_stores() -> Result<StoreKeys> {
    Ok(StoreRegistry::allocate(
        PERSISTENT_STORES.iter().copied(),
        TRANSIENT_STORES.iter().copied(),
    )?)
}

/// Inputs that come from outside the module graph
#[derive(Clone)]
pub struct WiringOptions {
    /// Builds new accounts
    pub account_factory: AccountFactory,
    /// Heights at which upgrades are skipped
    pub skip_upgrade_heights: BTreeSet<u64>,
    /// Account allowed to schedule upgrades
    pub upgrade_authority: Option<Address>,
    /// Migrations known to this binary, by plan name
    pub upgrade_handlers: BTreeMap<String, UpgradeHandler>,
}

impl std::fmt::Debug for WiringOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WiringOptions")
            .field("skip_upgrade_heights", &self.skip_upgrade_heights)
            .field("upgrade_authority", &self.upgrade_authority)
            .field("upgrade_handlers", &self.upgrade_handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for WiringOptions {
    fn default() -> Self {
        Self {
            account_factory: evm::eth_account_factory(),
            skip_upgrade_heights: BTreeSet::new(),
            upgrade_authority: None,
            upgrade_handlers: BTreeMap::new(),
        }
    }
}

/// Every keeper, wired
#[derive(Debug, Clone)]
pub struct Keepers {
    /// Parameter subspaces (sealed)
    pub params: ParamsKeeper,
    /// Accounts
    pub accounts: AccountKeeper,
    /// Balances
    pub bank: BankKeeper,
    /// Supply and module accounts
    pub supply: SupplyKeeper,
    /// Validators and delegations
    pub staking: StakingKeeper,
    /// Inflation
    pub mint: MintKeeper,
    /// Fee and reward distribution
    pub distribution: DistributionKeeper,
    /// Liveness and double-sign punishment
    pub slashing: SlashingKeeper,
    /// Upgrade plans
    pub upgrade: UpgradeKeeper,
    /// VM execution
    pub evm: EvmKeeper,
}

impl Keepers {
    /// Build every keeper in dependency order
    pub fn new(keys: &StoreKeys, permissions: &Permissions, options: WiringOptions) -> Result<Self> {
        let mut params = ParamsKeeper::new(keys.persistent(params::STORE_KEY)?, keys.transient(params::TSTORE_KEY)?);

        let accounts = AccountKeeper::new(
            keys.persistent(auth::STORE_KEY)?,
            params.subspace(auth::MODULE_NAME)?,
            options.account_factory,
        );
        let bank = BankKeeper::new(
            keys.persistent(bank::STORE_KEY)?,
            accounts.clone(),
            params.subspace(bank::MODULE_NAME)?,
            permissions.blocked_receivers(),
        );
        let supply = SupplyKeeper::new(
            keys.persistent(supply::STORE_KEY)?,
            accounts.clone(),
            bank.clone(),
            permissions.table(),
        );
        let staking = StakingKeeper::new(
            keys.persistent(staking::STORE_KEY)?,
            keys.transient(staking::TSTORE_KEY)?,
            supply.clone(),
            params.subspace(staking::MODULE_NAME)?,
        );
        let mint = MintKeeper::new(
            keys.persistent(mint::STORE_KEY)?,
            params.subspace(mint::MODULE_NAME)?,
            staking.clone(),
            supply.clone(),
        );
        let distribution = DistributionKeeper::new(
            keys.persistent(distribution::STORE_KEY)?,
            params.subspace(distribution::MODULE_NAME)?,
            staking.clone(),
            supply.clone(),
        );
        let slashing = SlashingKeeper::new(
            keys.persistent(slashing::STORE_KEY)?,
            params.subspace(slashing::MODULE_NAME)?,
            staking.clone(),
        );

        staking.set_hooks(Arc::new(MultiStakingHooks::new(vec![
            Arc::new(DistributionHooks::new(distribution.clone())),
            Arc::new(SlashingHooks::new(slashing.clone())),
        ])))?;

        let mut upgrade = UpgradeKeeper::new(
            keys.persistent(upgrade::STORE_KEY)?,
            options.skip_upgrade_heights,
            options.upgrade_authority,
        );
        for (name, handler) in options.upgrade_handlers {
            upgrade.set_upgrade_handler(name, move |ctx, plan| handler(ctx, plan));
        }

        let evm = EvmKeeper::new(
            keys.persistent(evm::STORE_KEY)?,
            keys.transient(evm::TSTORE_KEY)?,
            params.subspace(evm::MODULE_NAME)?,
            accounts.clone(),
            supply.clone(),
        );

        params.seal();
        tracing::debug!(subspaces = ?params.subspaces().collect::<Vec<_>>(), "Wired keepers");

        Ok(Self {
            params,
            accounts,
            bank,
            supply,
            staking,
            mint,
            distribution,
            slashing,
            upgrade,
            evm,
        })
    }

    /// One module per keeper, plus genutil
    pub fn modules(&self) -> Vec<Arc<dyn AppModule>> {
        vec![
            Arc::new(AuthModule::new(self.accounts.clone())),
            Arc::new(BankModule::new(self.bank.clone())),
            Arc::new(SupplyModule::new(self.supply.clone())),
            Arc::new(StakingModule::new(self.staking.clone())),
            Arc::new(MintModule::new(self.mint.clone())),
            Arc::new(DistributionModule::new(self.distribution.clone())),
            Arc::new(SlashingModule::new(self.slashing.clone())),
            Arc::new(UpgradeModule::new(self.upgrade.clone())),
            Arc::new(EvmModule::new(self.evm.clone())),
            Arc::new(GenutilModule::new(self.staking.clone())),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_modules::Error as ModuleError;

    #[test]
    fn test_duplicate_store_names_fatal() {
        let err = StoreRegistry::allocate(["acc", "bank", "acc"], std::iter::empty()).unwrap_err();
        assert!(matches!(err, chain_store::Error::DuplicateStoreKey(name) if name == "acc"));
    }

    #[test]
    fn test_wiring_binds_hooks_once_and_seals_params() {
        let keys = allocate_stores().unwrap();
        let mut keepers = Keepers::new(&keys, &Permissions::standard(), WiringOptions::default()).unwrap();

        let again = keepers
            .staking
            .set_hooks(Arc::new(MultiStakingHooks::new(Vec::new())))
            .unwrap_err();
        assert!(matches!(again, ModuleError::HooksAlreadySet));

        assert!(matches!(
            keepers.params.subspace("late"),
            Err(ModuleError::ParamsSealed(_))
        ));
    }

    #[test]
    fn test_every_module_has_distinct_name() {
        let keys = allocate_stores().unwrap();
        let keepers = Keepers::new(&keys, &Permissions::standard(), WiringOptions::default()).unwrap();
        let names: BTreeSet<_> = keepers.modules().iter().map(|m| m.name()).collect();
        assert_eq!(names.len(), 10);
    }
}
