//! Token balances and transfers
//!
//! Balances live in the `bank` partition keyed by address. Transfers
//! initiated by users go through [`MsgSend`] / [`MsgMultiSend`] and are
//! refused when any destination is a blocked module address. Module code
//! moves funds with [`BankKeeper::send_coins`], which does not consult the
//! block list.

use crate::{
    abci::ValidatorUpdate,
    auth::AccountKeeper,
    module::{parse_genesis, to_json, AppModule, DeliverGenesisTx, InvariantRegistry},
    msgs::{Msg, MsgDefinition},
    params::Subspace,
    types::{Address, Coins},
    Error, Result,
};
use chain_store::{Context, Event, StoreKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

/// Module name
pub const MODULE_NAME: &str = "bank";

/// Store key name
pub const STORE_KEY: &str = "bank";

const BALANCE_PREFIX: &[u8] = &[0x02];
const PARAMS_KEY: &str = "params";

/// Bank parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Whether user transfers are enabled
    pub send_enabled: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self { send_enabled: true }
    }
}

/// Transfer from one account to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSend {
    /// Sender
    pub from_address: Address,
    /// Recipient
    pub to_address: Address,
    /// Amount
    pub amount: Coins,
}

impl MsgDefinition for MsgSend {
    const ROUTE: &'static str = MODULE_NAME;
    const TYPE_URL: &'static str = "/bank.MsgSend";

    fn validate_basic(&self) -> Result<()> {
        self.amount.validate()?;
        if self.amount.is_empty() {
            return Err(Error::InvalidCoins("send amount must be positive".into()));
        }
        Ok(())
    }

    fn signers(&self) -> Vec<Address> {
        vec![self.from_address]
    }
}

/// One side of a multi-send
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Account
    pub address: Address,
    /// Amount
    pub coins: Coins,
}

/// Transfer from several inputs to several outputs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgMultiSend {
    /// Debited accounts
    pub inputs: Vec<Transfer>,
    /// Credited accounts
    pub outputs: Vec<Transfer>,
}

fn sum_transfers(transfers: &[Transfer]) -> Result<Coins> {
    transfers.iter().try_fold(Coins::empty(), |acc, t| {
        t.coins.validate()?;
        if t.coins.is_empty() {
            return Err(Error::InvalidCoins(format!("empty transfer for {}", t.address)));
        }
        acc.checked_add(&t.coins)
    })
}

impl MsgDefinition for MsgMultiSend {
    const ROUTE: &'static str = MODULE_NAME;
    const TYPE_URL: &'static str = "/bank.MsgMultiSend";

    fn validate_basic(&self) -> Result<()> {
        if self.inputs.is_empty() {
            return Err(Error::ValidateBasic("no inputs to send transaction".into()));
        }
        if self.outputs.is_empty() {
            return Err(Error::ValidateBasic("no outputs to send transaction".into()));
        }
        let total_in = sum_transfers(&self.inputs)?;
        let total_out = sum_transfers(&self.outputs)?;
        if total_in != total_out {
            return Err(Error::InvalidCoins(format!(
                "sum inputs != sum outputs: {} != {}",
                total_in, total_out
            )));
        }
        Ok(())
    }

    fn signers(&self) -> Vec<Address> {
        self.inputs.iter().map(|i| i.address).collect()
    }
}

/// Balance keeper
#[derive(Debug, Clone)]
pub struct BankKeeper {
    key: StoreKey,
    accounts: AccountKeeper,
    space: Subspace,
    blocked: Arc<BTreeSet<Address>>,
}

fn balance_key(address: &Address) -> Vec<u8> {
    [BALANCE_PREFIX, address.as_bytes()].concat()
}

impl BankKeeper {
    /// Create keeper with the addresses barred from receiving user transfers
    pub fn new(
        key: StoreKey,
        accounts: AccountKeeper,
        space: Subspace,
        blocked: BTreeSet<Address>,
    ) -> Self {
        Self {
            key,
            accounts,
            space,
            blocked: Arc::new(blocked),
        }
    }

    /// Parameters
    pub fn params(&self, ctx: &mut Context<'_>) -> Result<Params> {
        self.space.get_or_default(ctx, PARAMS_KEY)
    }

    /// Replace parameters
    pub fn set_params(&self, ctx: &mut Context<'_>, params: &Params) -> Result<()> {
        self.space.set(ctx, PARAMS_KEY, params)
    }

    /// True if user transfers to `address` are refused
    pub fn is_blocked(&self, address: &Address) -> bool {
        self.blocked.contains(address)
    }

    /// Balance of `address`
    pub fn balance(&self, ctx: &mut Context<'_>, address: &Address) -> Result<Coins> {
        Ok(ctx
            .get_value(&self.key, &balance_key(address))?
            .unwrap_or_default())
    }

    fn set_balance(&self, ctx: &mut Context<'_>, address: &Address, coins: &Coins) -> Result<()> {
        if coins.is_empty() {
            ctx.delete(&self.key, &balance_key(address))?;
        } else {
            ctx.set_value(&self.key, &balance_key(address), coins)?;
        }
        Ok(())
    }

    /// Credit `amount`, creating the account if needed
    pub fn add_coins(&self, ctx: &mut Context<'_>, address: &Address, amount: &Coins) -> Result<Coins> {
        amount.validate()?;
        self.accounts.get_or_create_account(ctx, *address)?;
        let balance = self.balance(ctx, address)?.checked_add(amount)?;
        self.set_balance(ctx, address, &balance)?;
        Ok(balance)
    }

    /// Debit `amount`
    pub fn subtract_coins(
        &self,
        ctx: &mut Context<'_>,
        address: &Address,
        amount: &Coins,
    ) -> Result<Coins> {
        amount.validate()?;
        let held = self.balance(ctx, address)?;
        let balance = held.checked_sub(amount).ok_or_else(|| {
            Error::InsufficientFunds(format!("{} is smaller than {}", display_coins(&held), amount))
        })?;
        self.set_balance(ctx, address, &balance)?;
        Ok(balance)
    }

    /// Move `amount` between accounts
    pub fn send_coins(
        &self,
        ctx: &mut Context<'_>,
        from: &Address,
        to: &Address,
        amount: &Coins,
    ) -> Result<()> {
        self.subtract_coins(ctx, from, amount)?;
        self.add_coins(ctx, to, amount)?;
        ctx.emit_event(
            Event::new("transfer")
                .attr("recipient", to)
                .attr("sender", from)
                .attr("amount", amount),
        );
        Ok(())
    }

    /// Debit every input, then credit every output
    pub fn input_output_coins(
        &self,
        ctx: &mut Context<'_>,
        inputs: &[Transfer],
        outputs: &[Transfer],
    ) -> Result<()> {
        for input in inputs {
            self.subtract_coins(ctx, &input.address, &input.coins)?;
        }
        for output in outputs {
            self.add_coins(ctx, &output.address, &output.coins)?;
            ctx.emit_event(
                Event::new("transfer")
                    .attr("recipient", output.address)
                    .attr("amount", &output.coins),
            );
        }
        Ok(())
    }

    /// Every non-empty balance, ordered by address
    pub fn balances(&self, ctx: &mut Context<'_>) -> Result<Vec<Balance>> {
        ctx.scan_values::<Coins>(&self.key, BALANCE_PREFIX)?
            .into_iter()
            .map(|(key, coins)| {
                let bytes: [u8; 20] = key[BALANCE_PREFIX.len()..]
                    .try_into()
                    .map_err(|_| Error::InvalidAddress(hex::encode(&key)))?;
                Ok(Balance {
                    address: Address(bytes),
                    coins,
                })
            })
            .collect()
    }

    fn handle_send(&self, ctx: &mut Context<'_>, msg: &MsgSend) -> Result<Vec<u8>> {
        if !self.params(ctx)?.send_enabled {
            return Err(Error::module(MODULE_NAME, 2, "send transactions are disabled"));
        }
        if self.is_blocked(&msg.to_address) {
            return Err(Error::Unauthorized(format!(
                "{} is not allowed to receive transactions",
                msg.to_address
            )));
        }
        self.send_coins(ctx, &msg.from_address, &msg.to_address, &msg.amount)?;
        ctx.emit_event(
            Event::new("message")
                .attr("module", MODULE_NAME)
                .attr("sender", msg.from_address),
        );
        Ok(Vec::new())
    }

    fn handle_multi_send(&self, ctx: &mut Context<'_>, msg: &MsgMultiSend) -> Result<Vec<u8>> {
        if !self.params(ctx)?.send_enabled {
            return Err(Error::module(MODULE_NAME, 2, "send transactions are disabled"));
        }
        if let Some(out) = msg.outputs.iter().find(|o| self.is_blocked(&o.address)) {
            return Err(Error::Unauthorized(format!(
                "{} is not allowed to receive transactions",
                out.address
            )));
        }
        self.input_output_coins(ctx, &msg.inputs, &msg.outputs)?;
        Ok(Vec::new())
    }
}

fn display_coins(coins: &Coins) -> String {
    if coins.is_empty() {
        "0".to_string()
    } else {
        coins.to_string()
    }
}

/// Balance of one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    /// Account
    pub address: Address,
    /// Held coins
    pub coins: Coins,
}

/// Bank genesis fragment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    /// Parameters
    pub params: Params,
    /// Initial balances, including module pools
    pub balances: Vec<Balance>,
}

impl GenesisState {
    fn validate(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for balance in &self.balances {
            if !seen.insert(balance.address) {
                return Err(Error::Genesis(format!("duplicate balance for {}", balance.address)));
            }
            balance
                .coins
                .validate()
                .map_err(|e| Error::Genesis(format!("balance of {}: {}", balance.address, e)))?;
        }
        Ok(())
    }
}

/// Bank module
#[derive(Debug, Clone)]
pub struct BankModule {
    keeper: BankKeeper,
}

impl BankModule {
    /// Wrap keeper
    pub fn new(keeper: BankKeeper) -> Self {
        Self { keeper }
    }
}

impl AppModule for BankModule {
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
        for balance in &state.balances {
            self.keeper.accounts.get_or_create_account(ctx, balance.address)?;
            self.keeper.set_balance(ctx, &balance.address, &balance.coins)?;
        }
        Ok(Vec::new())
    }

    fn export_genesis(&self, ctx: &mut Context<'_>) -> Result<Value> {
        to_json(&GenesisState {
            params: self.keeper.params(ctx)?,
            balances: self.keeper.balances(ctx)?,
        })
    }

    fn message_types(&self) -> &'static [&'static str] {
        &[MsgSend::TYPE_URL, MsgMultiSend::TYPE_URL]
    }

    fn handle(&self, ctx: &mut Context<'_>, msg: &Msg) -> Result<Vec<u8>> {
        match msg {
            Msg::Send(msg) => self.keeper.handle_send(ctx, msg),
            Msg::MultiSend(msg) => self.keeper.handle_multi_send(ctx, msg),
            other => Err(Error::UnknownRequest(format!(
                "unrecognized bank message type: {}",
                other.type_url()
            ))),
        }
    }

    fn query_route(&self) -> Option<&'static str> {
        Some(MODULE_NAME)
    }

    fn query(&self, ctx: &mut Context<'_>, path: &[&str], _data: &[u8]) -> Result<Value> {
        match path {
            ["balances", address] => to_json(&self.keeper.balance(ctx, &Address::from_hex(address)?)?),
            ["params"] => to_json(&self.keeper.params(ctx)?),
            _ => Err(Error::UnknownRequest(format!(
                "unknown bank query endpoint: {}",
                path.join("/")
            ))),
        }
    }

    fn register_invariants(&self, registry: &mut InvariantRegistry) {
        let keeper = self.keeper.clone();
        registry.register(MODULE_NAME, "nonnegative-outstanding", move |ctx: &mut Context<'_>| {
            let mut broken = Vec::new();
            for balance in keeper.balances(ctx)? {
                if balance.coins.is_empty() || balance.coins.validate().is_err() {
                    broken.push(format!("{}: {:?}", balance.address, balance.coins));
                }
            }
            Ok(if broken.is_empty() {
                None
            } else {
                Some(format!("malformed balances: {}", broken.join("; ")))
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestEnv;

    fn coins(s: &str) -> Coins {
        s.parse().unwrap()
    }

    #[test]
    fn test_send_and_insufficient_funds() {
        let mut env = TestEnv::new();
        let bank = env.bank_keeper(BTreeSet::new());
        let mut ctx = env.ctx();
        let (alice, bob) = (Address([1; 20]), Address([2; 20]));

        bank.add_coins(&mut ctx, &alice, &coins("100aphoton")).unwrap();
        bank.send_coins(&mut ctx, &alice, &bob, &coins("30aphoton")).unwrap();

        assert_eq!(bank.balance(&mut ctx, &alice).unwrap(), coins("70aphoton"));
        assert_eq!(bank.balance(&mut ctx, &bob).unwrap(), coins("30aphoton"));
        assert_eq!(ctx.events()[0].kind, "transfer");

        let err = bank
            .send_coins(&mut ctx, &bob, &alice, &coins("31aphoton"))
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientFunds(_)));
    }

    #[test]
    fn test_blocked_receiver_rejected() {
        let mut env = TestEnv::new();
        let pool = Address::for_module("bonded_tokens_pool");
        let module = BankModule::new(env.bank_keeper([pool].into_iter().collect()));
        let alice = Address([1; 20]);
        let mut ctx = env.ctx();
        module.keeper.add_coins(&mut ctx, &alice, &coins("10aphoton")).unwrap();

        let msg = Msg::Send(MsgSend {
            from_address: alice,
            to_address: pool,
            amount: coins("5aphoton"),
        });
        let err = ctx.atomic(|ctx| module.handle(ctx, &msg)).unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        assert_eq!(module.keeper.balance(&mut ctx, &alice).unwrap(), coins("10aphoton"));
        assert!(module.keeper.balance(&mut ctx, &pool).unwrap().is_empty());
    }

    #[test]
    fn test_send_disabled() {
        let mut env = TestEnv::new();
        let module = BankModule::new(env.bank_keeper(BTreeSet::new()));
        let mut ctx = env.ctx();
        module
            .keeper
            .set_params(&mut ctx, &Params { send_enabled: false })
            .unwrap();

        let msg = Msg::Send(MsgSend {
            from_address: Address([1; 20]),
            to_address: Address([2; 20]),
            amount: coins("1aphoton"),
        });
        let err = module.handle(&mut ctx, &msg).unwrap_err();
        assert_eq!(err.codespace(), MODULE_NAME);
    }

    #[test]
    fn test_multi_send_validate_basic() {
        let a = Address([1; 20]);
        let b = Address([2; 20]);
        let unbalanced = MsgMultiSend {
            inputs: vec![Transfer { address: a, coins: coins("10aphoton") }],
            outputs: vec![Transfer { address: b, coins: coins("9aphoton") }],
        };
        assert!(matches!(unbalanced.validate_basic(), Err(Error::InvalidCoins(_))));

        let balanced = MsgMultiSend {
            inputs: vec![Transfer { address: a, coins: coins("10aphoton") }],
            outputs: vec![
                Transfer { address: b, coins: coins("4aphoton") },
                Transfer { address: a, coins: coins("6aphoton") },
            ],
        };
        balanced.validate_basic().unwrap();
        assert_eq!(balanced.signers(), vec![a]);
    }

    #[test]
    fn test_genesis_balances_roundtrip() {
        let mut env = TestEnv::new();
        let module = BankModule::new(env.bank_keeper(BTreeSet::new()));
        let mut ctx = env.ctx();

        let genesis = serde_json::json!({
            "params": { "send_enabled": true },
            "balances": [
                { "address": Address([1; 20]).to_string(), "coins": [{ "denom": "aphoton", "amount": "1000" }] }
            ]
        });
        module.validate_genesis(&genesis).unwrap();
        module
            .init_genesis(&mut ctx, &genesis, &crate::module::NoGenesisTxs)
            .unwrap();

        let exported: GenesisState =
            serde_json::from_value(module.export_genesis(&mut ctx).unwrap()).unwrap();
        assert_eq!(exported.balances.len(), 1);
        assert_eq!(exported.balances[0].coins, coins("1000aphoton"));
    }
}
