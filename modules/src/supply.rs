//! Total supply and module accounts
//!
//! The supply keeper is the only place where tokens are created or
//! destroyed, and the only way funds enter or leave a module account. Every
//! such operation consults the [`PermissionTable`] first:
//!
//! - minting requires [`Permission::Minter`]
//! - burning requires [`Permission::Burner`]
//! - delegating into or undelegating out of a pool requires
//!   [`Permission::Staking`]

use crate::{
    abci::ValidatorUpdate,
    auth::{Account, AccountKeeper, BaseAccount, ModuleAccount},
    bank::BankKeeper,
    module::{parse_genesis, to_json, AppModule, DeliverGenesisTx, InvariantRegistry},
    types::{Address, Coins, Permission, PermissionTable},
    Error, Result,
};
use chain_store::{Context, Event, StoreKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Module name
pub const MODULE_NAME: &str = "supply";

/// Store key name
pub const STORE_KEY: &str = "supply";

const SUPPLY_KEY: &[u8] = &[0x00];

/// Supply keeper
#[derive(Debug, Clone)]
pub struct SupplyKeeper {
    key: StoreKey,
    accounts: AccountKeeper,
    bank: BankKeeper,
    permissions: Arc<PermissionTable>,
}

impl SupplyKeeper {
    /// Create keeper with the module permission table
    pub fn new(
        key: StoreKey,
        accounts: AccountKeeper,
        bank: BankKeeper,
        permissions: Arc<PermissionTable>,
    ) -> Self {
        Self {
            key,
            accounts,
            bank,
            permissions,
        }
    }

    /// Underlying bank keeper
    pub fn bank(&self) -> &BankKeeper {
        &self.bank
    }

    /// Permission table
    pub fn permissions(&self) -> &PermissionTable {
        &self.permissions
    }

    /// Total supply
    pub fn supply(&self, ctx: &mut Context<'_>) -> Result<Coins> {
        Ok(ctx.get_value(&self.key, SUPPLY_KEY)?.unwrap_or_default())
    }

    /// Overwrite total supply
    pub fn set_supply(&self, ctx: &mut Context<'_>, supply: &Coins) -> Result<()> {
        Ok(ctx.set_value(&self.key, SUPPLY_KEY, supply)?)
    }

    /// Address of a permissioned module
    pub fn module_address(&self, module: &str) -> Result<Address> {
        if !self.permissions.contains(module) {
            return Err(Error::UnknownAddress(format!(
                "module account {} does not exist",
                module
            )));
        }
        Ok(Address::for_module(module))
    }

    /// Module account, created on first use
    pub fn module_account(&self, ctx: &mut Context<'_>, module: &str) -> Result<ModuleAccount> {
        let address = self.module_address(module)?;
        let base = match self.accounts.get_account(ctx, &address)? {
            Some(Account::Module(account)) => return Ok(account),
            // funded in genesis before the module account existed
            Some(other) if other.pub_key().is_none() => other.base().clone(),
            Some(_) => {
                return Err(Error::module(
                    MODULE_NAME,
                    2,
                    format!("account {} is not a module account", address),
                ))
            }
            None => BaseAccount {
                address,
                pub_key: None,
                account_number: self.accounts.next_account_number(ctx)?,
                sequence: 0,
            },
        };

        let permissions = self
            .permissions
            .permissions(module)
            .map(|p| p.iter().copied().collect())
            .unwrap_or_default();
        let account = ModuleAccount {
            base,
            name: module.to_string(),
            permissions,
        };
        self.accounts.set_account(ctx, &Account::Module(account.clone()))?;
        tracing::debug!(module, address = %address, "Created module account");
        Ok(account)
    }

    /// Balance of a module account
    pub fn module_balance(&self, ctx: &mut Context<'_>, module: &str) -> Result<Coins> {
        let address = self.module_address(module)?;
        self.bank.balance(ctx, &address)
    }

    fn require(&self, module: &str, permission: Permission, action: &str) -> Result<()> {
        if self.permissions.has(module, permission) {
            Ok(())
        } else {
            Err(Error::Unauthorized(format!(
                "module account {} does not have permissions to {}",
                module, action
            )))
        }
    }

    /// Pay out of a module account
    pub fn send_coins_from_module_to_account(
        &self,
        ctx: &mut Context<'_>,
        module: &str,
        recipient: &Address,
        amount: &Coins,
    ) -> Result<()> {
        let sender = self.module_account(ctx, module)?.base.address;
        self.bank.send_coins(ctx, &sender, recipient, amount)
    }

    /// Pay into a module account
    pub fn send_coins_from_account_to_module(
        &self,
        ctx: &mut Context<'_>,
        sender: &Address,
        module: &str,
        amount: &Coins,
    ) -> Result<()> {
        let recipient = self.module_account(ctx, module)?.base.address;
        self.bank.send_coins(ctx, sender, &recipient, amount)
    }

    /// Move funds between module accounts
    pub fn send_coins_from_module_to_module(
        &self,
        ctx: &mut Context<'_>,
        sender: &str,
        recipient: &str,
        amount: &Coins,
    ) -> Result<()> {
        let from = self.module_account(ctx, sender)?.base.address;
        let to = self.module_account(ctx, recipient)?.base.address;
        self.bank.send_coins(ctx, &from, &to, amount)
    }

    /// Lock delegated tokens in a staking pool
    pub fn delegate_coins_from_account_to_module(
        &self,
        ctx: &mut Context<'_>,
        delegator: &Address,
        module: &str,
        amount: &Coins,
    ) -> Result<()> {
        self.require(module, Permission::Staking, "receive delegated tokens")?;
        self.send_coins_from_account_to_module(ctx, delegator, module, amount)
    }

    /// Release delegated tokens from a staking pool
    pub fn undelegate_coins_from_module_to_account(
        &self,
        ctx: &mut Context<'_>,
        module: &str,
        delegator: &Address,
        amount: &Coins,
    ) -> Result<()> {
        self.require(module, Permission::Staking, "undelegate tokens")?;
        self.send_coins_from_module_to_account(ctx, module, delegator, amount)
    }

    /// Create tokens in a module account
    pub fn mint_coins(&self, ctx: &mut Context<'_>, module: &str, amount: &Coins) -> Result<()> {
        self.require(module, Permission::Minter, "mint tokens")?;
        let address = self.module_account(ctx, module)?.base.address;
        self.bank.add_coins(ctx, &address, amount)?;
        let supply = self.supply(ctx)?.checked_add(amount)?;
        self.set_supply(ctx, &supply)?;

        tracing::debug!(module, amount = %amount, "Minted coins");
        ctx.emit_event(Event::new("mint").attr("module", module).attr("amount", amount));
        Ok(())
    }

    /// Destroy tokens held by a module account
    pub fn burn_coins(&self, ctx: &mut Context<'_>, module: &str, amount: &Coins) -> Result<()> {
        self.require(module, Permission::Burner, "burn tokens")?;
        let address = self.module_account(ctx, module)?.base.address;
        self.bank.subtract_coins(ctx, &address, amount)?;
        let supply = self
            .supply(ctx)?
            .checked_sub(amount)
            .ok_or_else(|| Error::InsufficientFunds(format!("burn {} exceeds total supply", amount)))?;
        self.set_supply(ctx, &supply)?;

        tracing::debug!(module, amount = %amount, "Burned coins");
        ctx.emit_event(Event::new("burn").attr("module", module).attr("amount", amount));
        Ok(())
    }

    /// Sum of every balance
    pub fn sum_of_balances(&self, ctx: &mut Context<'_>) -> Result<Coins> {
        self.bank
            .balances(ctx)?
            .iter()
            .try_fold(Coins::empty(), |acc, b| acc.checked_add(&b.coins))
    }
}

/// Supply genesis fragment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    /// Total supply; empty means "sum of all balances"
    pub supply: Coins,
}

/// Supply module
#[derive(Debug, Clone)]
pub struct SupplyModule {
    keeper: SupplyKeeper,
}

impl SupplyModule {
    /// Wrap keeper
    pub fn new(keeper: SupplyKeeper) -> Self {
        Self { keeper }
    }
}

impl AppModule for SupplyModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn default_genesis(&self) -> Value {
        serde_json::to_value(GenesisState::default()).unwrap_or(Value::Null)
    }

    fn validate_genesis(&self, genesis: &Value) -> Result<()> {
        let state: GenesisState = parse_genesis(MODULE_NAME, genesis)?;
        state
            .supply
            .validate()
            .map_err(|e| Error::Genesis(format!("invalid total supply: {}", e)))
    }

    fn init_genesis(
        &self,
        ctx: &mut Context<'_>,
        genesis: &Value,
        _txs: &dyn DeliverGenesisTx,
    ) -> Result<Vec<ValidatorUpdate>> {
        let state: GenesisState = parse_genesis(MODULE_NAME, genesis)?;
        let balances = self.keeper.sum_of_balances(ctx)?;

        if !state.supply.is_empty() && state.supply != balances {
            return Err(Error::Genesis(format!(
                "total supply {} does not match sum of balances {}",
                state.supply, balances
            )));
        }

        // every permissioned module gets its account at genesis
        let modules: Vec<String> = self.keeper.permissions.modules().map(String::from).collect();
        for module in modules {
            self.keeper.module_account(ctx, &module)?;
        }

        self.keeper.set_supply(ctx, &balances)?;
        tracing::info!(supply = %balances, "Initialized total supply");
        Ok(Vec::new())
    }

    fn export_genesis(&self, ctx: &mut Context<'_>) -> Result<Value> {
        to_json(&GenesisState {
            supply: self.keeper.supply(ctx)?,
        })
    }

    fn query_route(&self) -> Option<&'static str> {
        Some(MODULE_NAME)
    }

    fn query(&self, ctx: &mut Context<'_>, path: &[&str], _data: &[u8]) -> Result<Value> {
        match path {
            ["total"] => to_json(&self.keeper.supply(ctx)?),
            ["total", denom] => to_json(&self.keeper.supply(ctx)?.amount_of(denom).to_string()),
            _ => Err(Error::UnknownRequest(format!(
                "unknown supply query endpoint: {}",
                path.join("/")
            ))),
        }
    }

    fn register_invariants(&self, registry: &mut InvariantRegistry) {
        let keeper = self.keeper.clone();
        registry.register(MODULE_NAME, "total-supply", move |ctx: &mut Context<'_>| {
            let supply = keeper.supply(ctx)?;
            let balances = keeper.sum_of_balances(ctx)?;
            Ok(if supply == balances {
                None
            } else {
                Some(format!(
                    "total supply {} does not equal sum of balances {}",
                    supply, balances
                ))
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::NoGenesisTxs;
    use crate::testutil::TestEnv;

    fn coins(s: &str) -> Coins {
        s.parse().unwrap()
    }

    #[test]
    fn test_mint_requires_permission() {
        let mut env = TestEnv::new();
        let supply = env.supply_keeper();
        let mut ctx = env.ctx();

        supply.mint_coins(&mut ctx, "mint", &coins("100aphoton")).unwrap();
        assert_eq!(supply.supply(&mut ctx).unwrap(), coins("100aphoton"));
        assert_eq!(supply.module_balance(&mut ctx, "mint").unwrap(), coins("100aphoton"));

        let err = supply
            .mint_coins(&mut ctx, "fee_collector", &coins("1aphoton"))
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn test_burn_requires_permission() {
        let mut env = TestEnv::new();
        let supply = env.supply_keeper();
        let mut ctx = env.ctx();

        supply.mint_coins(&mut ctx, "mint", &coins("100aphoton")).unwrap();
        supply
            .send_coins_from_module_to_module(&mut ctx, "mint", "bonded_tokens_pool", &coins("40aphoton"))
            .unwrap();

        assert!(matches!(
            supply.burn_coins(&mut ctx, "mint", &coins("1aphoton")),
            Err(Error::Unauthorized(_))
        ));
        supply
            .burn_coins(&mut ctx, "bonded_tokens_pool", &coins("10aphoton"))
            .unwrap();
        assert_eq!(supply.supply(&mut ctx).unwrap(), coins("90aphoton"));
    }

    #[test]
    fn test_delegate_requires_staking_permission() {
        let mut env = TestEnv::new();
        let supply = env.supply_keeper();
        let mut ctx = env.ctx();
        let alice = Address([1; 20]);
        supply.bank().add_coins(&mut ctx, &alice, &coins("10aphoton")).unwrap();

        assert!(matches!(
            supply.delegate_coins_from_account_to_module(&mut ctx, &alice, "distribution", &coins("5aphoton")),
            Err(Error::Unauthorized(_))
        ));
        supply
            .delegate_coins_from_account_to_module(&mut ctx, &alice, "not_bonded_tokens_pool", &coins("5aphoton"))
            .unwrap();
        assert_eq!(
            supply.module_balance(&mut ctx, "not_bonded_tokens_pool").unwrap(),
            coins("5aphoton")
        );
    }

    #[test]
    fn test_unknown_module_account() {
        let mut env = TestEnv::new();
        let supply = env.supply_keeper();
        let mut ctx = env.ctx();
        assert!(matches!(
            supply.module_account(&mut ctx, "nobody"),
            Err(Error::UnknownAddress(_))
        ));
    }

    #[test]
    fn test_genesis_supply_must_match_balances() {
        let mut env = TestEnv::new();
        let keeper = env.supply_keeper();
        let module = SupplyModule::new(keeper.clone());
        let mut ctx = env.ctx();
        keeper.bank().add_coins(&mut ctx, &Address([1; 20]), &coins("1000aphoton")).unwrap();

        let wrong = serde_json::json!({ "supply": [{ "denom": "aphoton", "amount": "999" }] });
        let err = ctx
            .atomic(|ctx| module.init_genesis(ctx, &wrong, &NoGenesisTxs))
            .unwrap_err();
        assert!(matches!(err, Error::Genesis(_)));

        module
            .init_genesis(&mut ctx, &module.default_genesis(), &NoGenesisTxs)
            .unwrap();
        assert_eq!(keeper.supply(&mut ctx).unwrap(), coins("1000aphoton"));

        let mut registry = InvariantRegistry::new();
        module.register_invariants(&mut registry);
        assert!(registry.check_all(&mut ctx).unwrap().is_empty());
    }
}
