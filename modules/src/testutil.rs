//! Shared fixtures for keeper tests

use crate::{
    auth::{self, base_account_factory, AccountKeeper, FEE_COLLECTOR},
    bank::{self, BankKeeper},
    distribution::{self, DistributionHooks, DistributionKeeper},
    evm::{self, EvmKeeper},
    mint::{self, MintKeeper},
    params::{self, ParamsKeeper},
    slashing::{self, SlashingHooks, SlashingKeeper},
    staking::{self, MultiStakingHooks, StakingKeeper, BONDED_POOL, NOT_BONDED_POOL},
    supply::{self, SupplyKeeper},
    types::{Address, Coins, Permission, PermissionTable, NATIVE_DENOM},
    upgrade,
};
use chain_store::{BlockHeader, CommitMultiStore, Context, ExecMode, MemDatabase, StoreKey, StoreKeys, StoreRegistry};
use chrono::{TimeZone, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;

const PERSISTENT: &[&str] = &[
    "main",
    auth::STORE_KEY,
    bank::STORE_KEY,
    supply::STORE_KEY,
    staking::STORE_KEY,
    mint::STORE_KEY,
    distribution::STORE_KEY,
    slashing::STORE_KEY,
    params::STORE_KEY,
    upgrade::STORE_KEY,
    evm::STORE_KEY,
];

const TRANSIENT: &[&str] = &[staking::TSTORE_KEY, params::TSTORE_KEY, evm::TSTORE_KEY];

/// In-memory store with every partition mounted
pub(crate) struct TestEnv {
    store: CommitMultiStore,
    keys: StoreKeys,
    header: BlockHeader,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        let keys = StoreRegistry::allocate(PERSISTENT.iter().copied(), TRANSIENT.iter().copied()).unwrap();
        let mut store = CommitMultiStore::new(Arc::new(MemDatabase::new()));
        store.mount_stores(&keys).unwrap();
        let header = BlockHeader {
            chain_id: "test-chain".to_string(),
            height: 1,
            time: Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap(),
        };
        Self { store, keys, header }
    }

    /// Persistent or transient partition by name
    pub(crate) fn key(&self, name: &str) -> StoreKey {
        self.keys
            .persistent(name)
            .or_else(|_| self.keys.transient(name))
            .unwrap()
    }

    pub(crate) fn header(&self) -> BlockHeader {
        self.header.clone()
    }

    pub(crate) fn ctx(&mut self) -> Context<'_> {
        let header = self.header.clone();
        self.ctx_at(header)
    }

    pub(crate) fn ctx_at(&mut self, header: BlockHeader) -> Context<'_> {
        Context::new(&mut self.store, header, ExecMode::Deliver)
    }

    fn params_keeper(&self) -> ParamsKeeper {
        ParamsKeeper::new(self.key(params::STORE_KEY), self.key(params::TSTORE_KEY))
    }

    pub(crate) fn account_keeper(&self) -> AccountKeeper {
        let mut params = self.params_keeper();
        AccountKeeper::new(
            self.key(auth::STORE_KEY),
            params.subspace(auth::MODULE_NAME).unwrap(),
            base_account_factory(),
        )
    }

    pub(crate) fn bank_keeper(&self, blocked: BTreeSet<Address>) -> BankKeeper {
        let mut params = self.params_keeper();
        BankKeeper::new(
            self.key(bank::STORE_KEY),
            self.account_keeper(),
            params.subspace(bank::MODULE_NAME).unwrap(),
            blocked,
        )
    }

    pub(crate) fn supply_keeper(&self) -> SupplyKeeper {
        SupplyKeeper::new(
            self.key(supply::STORE_KEY),
            self.account_keeper(),
            self.bank_keeper(BTreeSet::new()),
            Arc::new(test_permissions()),
        )
    }

    pub(crate) fn keepers(&self) -> TestKeepers {
        let mut params = self.params_keeper();
        let mut space = |name: &str| params.subspace(name).unwrap();

        let accounts = AccountKeeper::new(
            self.key(auth::STORE_KEY),
            space(auth::MODULE_NAME),
            base_account_factory(),
        );
        let bank = BankKeeper::new(
            self.key(bank::STORE_KEY),
            accounts.clone(),
            space(bank::MODULE_NAME),
            BTreeSet::new(),
        );
        let supply = SupplyKeeper::new(
            self.key(supply::STORE_KEY),
            accounts.clone(),
            bank.clone(),
            Arc::new(test_permissions()),
        );
        let staking = StakingKeeper::new(
            self.key(staking::STORE_KEY),
            self.key(staking::TSTORE_KEY),
            supply.clone(),
            space(staking::MODULE_NAME),
        );
        let mint = MintKeeper::new(
            self.key(mint::STORE_KEY),
            space(mint::MODULE_NAME),
            staking.clone(),
            supply.clone(),
        );
        let distribution = DistributionKeeper::new(
            self.key(distribution::STORE_KEY),
            space(distribution::MODULE_NAME),
            staking.clone(),
            supply.clone(),
        );
        let slashing = SlashingKeeper::new(
            self.key(slashing::STORE_KEY),
            space(slashing::MODULE_NAME),
            staking.clone(),
        );
        let evm = EvmKeeper::new(
            self.key(evm::STORE_KEY),
            self.key(evm::TSTORE_KEY),
            space(evm::MODULE_NAME),
            accounts.clone(),
            supply.clone(),
        );

        TestKeepers {
            accounts,
            bank,
            supply,
            staking,
            mint,
            distribution,
            slashing,
            evm,
        }
    }
}

fn test_permissions() -> PermissionTable {
    PermissionTable::new([
        (FEE_COLLECTOR, vec![]),
        (distribution::MODULE_NAME, vec![]),
        (mint::MODULE_NAME, vec![Permission::Minter]),
        (BONDED_POOL, vec![Permission::Burner, Permission::Staking]),
        (NOT_BONDED_POOL, vec![Permission::Burner, Permission::Staking]),
        (evm::MODULE_NAME, vec![Permission::Minter, Permission::Burner]),
    ])
}

/// Keepers wired in dependency order over one [`TestEnv`]
#[derive(Debug, Clone)]
pub(crate) struct TestKeepers {
    pub(crate) accounts: AccountKeeper,
    pub(crate) bank: BankKeeper,
    pub(crate) supply: SupplyKeeper,
    pub(crate) staking: StakingKeeper,
    pub(crate) mint: MintKeeper,
    pub(crate) distribution: DistributionKeeper,
    pub(crate) slashing: SlashingKeeper,
    pub(crate) evm: EvmKeeper,
}

impl TestKeepers {
    /// Credit native tokens and grow the recorded supply to match
    pub(crate) fn fund(&self, ctx: &mut Context<'_>, address: Address, amount: u128) {
        let coins = Coins::single(NATIVE_DENOM, amount);
        self.bank.add_coins(ctx, &address, &coins).unwrap();
        let supply = self.supply.supply(ctx).unwrap();
        self.supply.set_supply(ctx, &supply.checked_add(&coins).unwrap()).unwrap();
    }

    /// Bind distribution and slashing to the staking hook slot
    pub(crate) fn bind_hooks(&self) {
        self.staking
            .set_hooks(Arc::new(MultiStakingHooks::new(vec![
                Arc::new(DistributionHooks::new(self.distribution.clone())),
                Arc::new(SlashingHooks::new(self.slashing.clone())),
            ])))
            .unwrap();
    }
}
