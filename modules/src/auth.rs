//! Accounts
//!
//! Owns the `acc` partition: one record per address plus the global account
//! number counter. Account construction is delegated to an
//! [`AccountFactory`] so that the execution module can substitute accounts
//! that carry contract code.

use crate::{
    abci::ValidatorUpdate,
    module::{parse_genesis, to_json, AppModule, DeliverGenesisTx},
    params::Subspace,
    types::{Address, Permission, PubKey, H256},
    Error, Result,
};
use chain_store::{Context, StoreKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Module name
pub const MODULE_NAME: &str = "auth";

/// Store key name
pub const STORE_KEY: &str = "acc";

/// Module account receiving transaction fees
pub const FEE_COLLECTOR: &str = "fee_collector";

const ACCOUNT_PREFIX: &[u8] = &[0x01];
const GLOBAL_ACCOUNT_NUMBER_KEY: &[u8] = b"global_account_number";
const PARAMS_KEY: &str = "params";

/// Fields common to every account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseAccount {
    /// Address
    pub address: Address,
    /// Public key, set on first signature
    pub pub_key: Option<PubKey>,
    /// Unique, assigned at creation
    pub account_number: u64,
    /// Number of transactions signed
    pub sequence: u64,
}

/// Account owned by a module
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleAccount {
    /// Common fields
    pub base: BaseAccount,
    /// Owning module
    pub name: String,
    /// Capabilities granted to the module
    pub permissions: Vec<Permission>,
}

/// Account able to hold contract code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthAccount {
    /// Common fields
    pub base: BaseAccount,
    /// Hash of the deployed code, hash of empty code for plain accounts
    pub code_hash: H256,
}

/// Stored account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Account {
    /// Plain account
    Base(BaseAccount),
    /// Module account
    Module(ModuleAccount),
    /// Contract-capable account
    Eth(EthAccount),
}

impl Account {
    /// Common fields
    pub fn base(&self) -> &BaseAccount {
        match self {
            Account::Base(base) => base,
            Account::Module(m) => &m.base,
            Account::Eth(e) => &e.base,
        }
    }

    /// Common fields, mutable
    pub fn base_mut(&mut self) -> &mut BaseAccount {
        match self {
            Account::Base(base) => base,
            Account::Module(m) => &mut m.base,
            Account::Eth(e) => &mut e.base,
        }
    }

    /// Address
    pub fn address(&self) -> Address {
        self.base().address
    }

    /// Account number
    pub fn account_number(&self) -> u64 {
        self.base().account_number
    }

    /// Sequence
    pub fn sequence(&self) -> u64 {
        self.base().sequence
    }

    /// Public key, if known
    pub fn pub_key(&self) -> Option<PubKey> {
        self.base().pub_key
    }

    /// Module account view
    pub fn as_module(&self) -> Option<&ModuleAccount> {
        match self {
            Account::Module(m) => Some(m),
            _ => None,
        }
    }
}

/// Builds a new account from its base fields
pub type AccountFactory = Arc<dyn Fn(BaseAccount) -> Account + Send + Sync>;

/// Factory producing plain accounts
pub fn base_account_factory() -> AccountFactory {
    Arc::new(Account::Base)
}

/// Auth parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Longest memo accepted
    pub max_memo_characters: u64,
    /// Most signatures per transaction
    pub tx_sig_limit: u64,
    /// Gas charged per transaction byte
    pub tx_size_cost_per_byte: u64,
    /// Gas charged per ed25519 verification
    pub sig_verify_cost_ed25519: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            max_memo_characters: 256,
            tx_sig_limit: 7,
            tx_size_cost_per_byte: 10,
            sig_verify_cost_ed25519: 590,
        }
    }
}

impl Params {
    fn validate(&self) -> Result<()> {
        if self.max_memo_characters == 0 {
            return Err(Error::Genesis("max_memo_characters must be positive".into()));
        }
        if self.tx_sig_limit == 0 {
            return Err(Error::Genesis("tx_sig_limit must be positive".into()));
        }
        Ok(())
    }
}

/// Account keeper
#[derive(Clone)]
pub struct AccountKeeper {
    key: StoreKey,
    space: Subspace,
    factory: AccountFactory,
}

impl fmt::Debug for AccountKeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccountKeeper")
            .field("key", &self.key)
            .field("space", &self.space.name())
            .finish()
    }
}

fn account_key(address: &Address) -> Vec<u8> {
    [ACCOUNT_PREFIX, address.as_bytes()].concat()
}

impl AccountKeeper {
    /// Create keeper
    pub fn new(key: StoreKey, space: Subspace, factory: AccountFactory) -> Self {
        Self { key, space, factory }
    }

    /// Parameters
    pub fn params(&self, ctx: &mut Context<'_>) -> Result<Params> {
        self.space.get_or_default(ctx, PARAMS_KEY)
    }

    /// Replace parameters
    pub fn set_params(&self, ctx: &mut Context<'_>, params: &Params) -> Result<()> {
        self.space.set(ctx, PARAMS_KEY, params)
    }

    /// Take the next account number
    pub fn next_account_number(&self, ctx: &mut Context<'_>) -> Result<u64> {
        let number: u64 = ctx
            .get_value(&self.key, GLOBAL_ACCOUNT_NUMBER_KEY)?
            .unwrap_or(0);
        ctx.set_value(&self.key, GLOBAL_ACCOUNT_NUMBER_KEY, &(number + 1))?;
        Ok(number)
    }

    /// Build an account through the factory; not stored
    pub fn new_account_with_address(&self, ctx: &mut Context<'_>, address: Address) -> Result<Account> {
        let account_number = self.next_account_number(ctx)?;
        Ok((self.factory)(BaseAccount {
            address,
            pub_key: None,
            account_number,
            sequence: 0,
        }))
    }

    /// Stored account
    pub fn get_account(&self, ctx: &mut Context<'_>, address: &Address) -> Result<Option<Account>> {
        Ok(ctx.get_value(&self.key, &account_key(address))?)
    }

    /// True if an account exists
    pub fn has_account(&self, ctx: &mut Context<'_>, address: &Address) -> Result<bool> {
        Ok(ctx.has(&self.key, &account_key(address))?)
    }

    /// Existing account, or a new stored one
    pub fn get_or_create_account(&self, ctx: &mut Context<'_>, address: Address) -> Result<Account> {
        if let Some(account) = self.get_account(ctx, &address)? {
            return Ok(account);
        }
        let account = self.new_account_with_address(ctx, address)?;
        self.set_account(ctx, &account)?;
        tracing::debug!(address = %address, number = account.account_number(), "Created account");
        Ok(account)
    }

    /// Store an account
    pub fn set_account(&self, ctx: &mut Context<'_>, account: &Account) -> Result<()> {
        Ok(ctx.set_value(&self.key, &account_key(&account.address()), account)?)
    }

    /// Delete an account
    pub fn remove_account(&self, ctx: &mut Context<'_>, address: &Address) -> Result<()> {
        Ok(ctx.delete(&self.key, &account_key(address))?)
    }

    /// Every account, ordered by address
    pub fn accounts(&self, ctx: &mut Context<'_>) -> Result<Vec<Account>> {
        Ok(ctx
            .scan_values::<Account>(&self.key, ACCOUNT_PREFIX)?
            .into_iter()
            .map(|(_, account)| account)
            .collect())
    }

    /// Current sequence of an existing account
    pub fn sequence(&self, ctx: &mut Context<'_>, address: &Address) -> Result<u64> {
        self.get_account(ctx, address)?
            .map(|a| a.sequence())
            .ok_or_else(|| Error::UnknownAddress(format!("account {} does not exist", address)))
    }
}

/// Auth genesis fragment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    /// Parameters
    pub params: Params,
    /// Accounts, numbered in order
    pub accounts: Vec<Account>,
}

impl GenesisState {
    fn validate(&self) -> Result<()> {
        self.params.validate()?;
        let mut seen = BTreeSet::new();
        for account in &self.accounts {
            if !seen.insert(account.address()) {
                return Err(Error::Genesis(format!(
                    "duplicate account in genesis state: {}",
                    account.address()
                )));
            }
        }
        Ok(())
    }
}

/// Auth module
#[derive(Debug, Clone)]
pub struct AuthModule {
    keeper: AccountKeeper,
}

impl AuthModule {
    /// Wrap keeper
    pub fn new(keeper: AccountKeeper) -> Self {
        Self { keeper }
    }
}

impl AppModule for AuthModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn default_genesis(&self) -> Value {
        serde_json::to_value(GenesisState::default()).unwrap_or(Value::Null)
    }

    fn validate_genesis(&self, genesis: &Value) -> Result<()> {
        parse_genesis::<GenesisState>(MODULE_NAME, genesis)?.validate()
    }

    fn init_genesis(
        &self,
        ctx: &mut Context<'_>,
        genesis: &Value,
        _txs: &dyn DeliverGenesisTx,
    ) -> Result<Vec<ValidatorUpdate>> {
        let state: GenesisState = parse_genesis(MODULE_NAME, genesis)?;
        state.validate()?;
        self.keeper.set_params(ctx, &state.params)?;

        for mut account in state.accounts {
            account.base_mut().account_number = self.keeper.next_account_number(ctx)?;
            self.keeper.set_account(ctx, &account)?;
        }

        Ok(Vec::new())
    }

    fn export_genesis(&self, ctx: &mut Context<'_>) -> Result<Value> {
        to_json(&GenesisState {
            params: self.keeper.params(ctx)?,
            accounts: self.keeper.accounts(ctx)?,
        })
    }

    fn query_route(&self) -> Option<&'static str> {
        Some(MODULE_NAME)
    }

    fn query(&self, ctx: &mut Context<'_>, path: &[&str], _data: &[u8]) -> Result<Value> {
        match path {
            ["account", address] => {
                let address = Address::from_hex(address)?;
                let account = self
                    .keeper
                    .get_account(ctx, &address)?
                    .ok_or_else(|| Error::UnknownAddress(format!("account {} does not exist", address)))?;
                to_json(&account)
            }
            ["params"] => to_json(&self.keeper.params(ctx)?),
            _ => Err(Error::UnknownRequest(format!(
                "unknown auth query endpoint: {}",
                path.join("/")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::NoGenesisTxs;
    use crate::testutil::TestEnv;

    #[test]
    fn test_account_numbers_increment() {
        let mut env = TestEnv::new();
        let keeper = env.account_keeper();
        let mut ctx = env.ctx();

        let a = keeper.get_or_create_account(&mut ctx, Address([1; 20])).unwrap();
        let b = keeper.get_or_create_account(&mut ctx, Address([2; 20])).unwrap();
        let a_again = keeper.get_or_create_account(&mut ctx, Address([1; 20])).unwrap();

        assert_eq!(a.account_number(), 0);
        assert_eq!(b.account_number(), 1);
        assert_eq!(a_again, a);
        assert_eq!(keeper.accounts(&mut ctx).unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_sequence() {
        let mut env = TestEnv::new();
        let keeper = env.account_keeper();
        let mut ctx = env.ctx();
        assert!(matches!(
            keeper.sequence(&mut ctx, &Address([9; 20])),
            Err(Error::UnknownAddress(_))
        ));
    }

    #[test]
    fn test_genesis_renumbers_and_exports() {
        let mut env = TestEnv::new();
        let module = AuthModule::new(env.account_keeper());
        let mut ctx = env.ctx();

        let account = |byte: u8, number: u64| {
            Account::Base(BaseAccount {
                address: Address([byte; 20]),
                pub_key: None,
                account_number: number,
                sequence: 3,
            })
        };
        let genesis = serde_json::to_value(GenesisState {
            params: Params::default(),
            accounts: vec![account(1, 40), account(2, 7)],
        })
        .unwrap();

        module.validate_genesis(&genesis).unwrap();
        module.init_genesis(&mut ctx, &genesis, &NoGenesisTxs).unwrap();

        let exported: GenesisState =
            serde_json::from_value(module.export_genesis(&mut ctx).unwrap()).unwrap();
        let numbers: Vec<u64> = exported.accounts.iter().map(|a| a.account_number()).collect();
        assert_eq!(numbers, vec![0, 1]);
        assert_eq!(exported.accounts[0].sequence(), 3);
    }

    #[test]
    fn test_genesis_rejects_duplicates() {
        let env = TestEnv::new();
        let module = AuthModule::new(env.account_keeper());
        let base = BaseAccount {
            address: Address([1; 20]),
            pub_key: None,
            account_number: 0,
            sequence: 0,
        };
        let genesis = serde_json::to_value(GenesisState {
            params: Params::default(),
            accounts: vec![Account::Base(base.clone()), Account::Base(base)],
        })
        .unwrap();
        assert!(matches!(module.validate_genesis(&genesis), Err(Error::Genesis(_))));
    }
}
