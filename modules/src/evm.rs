//! Virtual-machine execution
//!
//! Contract bytecode is stored opaquely; instruction semantics are supplied
//! by an external interpreter and are not modelled here. The module owns the
//! account-level effects of a VM transaction:
//!
//! - contract creation at `hash(sender || nonce)` with the code hash recorded
//!   on the [`EthAccount`]
//! - value transfer in the VM denomination
//! - gas accounting and the refund of unused gas
//! - receipts, block hashes and per-block gas summaries
//!
//! # Refund boundary
//!
//! The ante gate charges `gas_price * gas_limit` up front and installs an
//! unbounded meter. After execution this module pays
//! `(gas_limit - gas_used) * gas_price` back from the fee collector and
//! leaves a meter reporting exactly `gas_used`. A failed execution returns an
//! error before the refund, so the whole up-front fee is kept.

use crate::{
    abci::{RequestBeginBlock, RequestEndBlock, ValidatorUpdate},
    auth::{Account, AccountFactory, AccountKeeper, BaseAccount, EthAccount, FEE_COLLECTOR},
    module::{parse_genesis, to_json, AppModule, BeginBlocker, DeliverGenesisTx, EndBlocker, InvariantRegistry},
    msgs::{Msg, MsgDefinition},
    params::Subspace,
    supply::SupplyKeeper,
    types::{Address, Coins, H256, NATIVE_DENOM},
    Error, Result,
};
use chain_store::{
    crypto::{address_hash, hash_bytes},
    Context, Event, GasMeter, StoreKey,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Module name
pub const MODULE_NAME: &str = "evm";

/// Store key name
pub const STORE_KEY: &str = "evm";

/// Transient store key name
pub const TSTORE_KEY: &str = "transient_evm";

/// Base cost of every transaction
pub const TX_GAS: u64 = 21_000;
/// Extra base cost of a contract creation
pub const TX_GAS_CONTRACT_CREATION: u64 = 32_000;
/// Per zero byte of payload
pub const TX_DATA_ZERO_GAS: u64 = 4;
/// Per non-zero byte of payload
pub const TX_DATA_NON_ZERO_GAS: u64 = 16;
/// Per byte of deployed code
pub const CREATE_DATA_GAS: u64 = 200;
/// Flat cost of invoking deployed code
pub const CALL_GAS: u64 = 700;

const CODE_PREFIX: &[u8] = &[0x01];
const RECEIPT_PREFIX: &[u8] = &[0x03];
const BLOCK_HASH_PREFIX: &[u8] = &[0x04];
const BLOCK_SUMMARY_PREFIX: &[u8] = &[0x05];

const TX_INDEX_KEY: &[u8] = &[0x01];
const BLOCK_GAS_KEY: &[u8] = &[0x02];

const PARAMS_KEY: &str = "params";

fn code_key(address: &Address) -> Vec<u8> {
    [CODE_PREFIX, address.as_bytes()].concat()
}

fn height_key(prefix: &[u8], height: u64) -> Vec<u8> {
    [prefix, &height.to_be_bytes()[..]].concat()
}

/// Hash of empty code, carried by accounts without a contract
pub fn empty_code_hash() -> H256 {
    H256(hash_bytes(&[]))
}

/// Factory producing contract-capable accounts
pub fn eth_account_factory() -> AccountFactory {
    Arc::new(|base: BaseAccount| {
        Account::Eth(EthAccount {
            base,
            code_hash: empty_code_hash(),
        })
    })
}

/// Address of a contract created by `sender` at `nonce`
pub fn create_address(sender: &Address, nonce: u64) -> Address {
    Address(address_hash(&[sender.as_bytes(), &nonce.to_be_bytes()[..]].concat()))
}

/// Gas charged before any execution
pub fn intrinsic_gas(payload: &[u8], is_create: bool) -> Result<u64> {
    let base = if is_create {
        TX_GAS + TX_GAS_CONTRACT_CREATION
    } else {
        TX_GAS
    };
    let zeros = payload.iter().filter(|b| **b == 0).count() as u64;
    let non_zeros = payload.len() as u64 - zeros;
    zeros
        .checked_mul(TX_DATA_ZERO_GAS)
        .and_then(|z| non_zeros.checked_mul(TX_DATA_NON_ZERO_GAS).and_then(|n| z.checked_add(n)))
        .and_then(|data| data.checked_add(base))
        .ok_or_else(|| Error::OutOfGas("intrinsic gas overflow".into()))
}

/// VM parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Denomination used for value and gas
    pub evm_denom: String,
    /// Whether contract creation is allowed
    pub enable_create: bool,
    /// Whether transfers and calls are allowed
    pub enable_call: bool,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            evm_denom: NATIVE_DENOM.to_string(),
            enable_create: true,
            enable_call: true,
        }
    }
}

/// VM transaction payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgEthereumTx {
    /// Sender
    pub from: Address,
    /// Sender's account sequence
    pub nonce: u64,
    /// Price per unit of gas in the VM denomination
    #[serde(with = "crate::types::amount")]
    pub gas_price: u128,
    /// Maximum gas
    pub gas_limit: u64,
    /// Callee, `None` for contract creation
    pub recipient: Option<Address>,
    /// Transferred value
    #[serde(with = "crate::types::amount")]
    pub value: u128,
    /// Call data, or contract code on creation
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl MsgEthereumTx {
    /// True for contract creation
    pub fn is_create(&self) -> bool {
        self.recipient.is_none()
    }

    /// Gas charged before execution
    pub fn intrinsic_gas(&self) -> Result<u64> {
        intrinsic_gas(&self.payload, self.is_create())
    }

    /// Up-front fee: `gas_price * gas_limit`
    pub fn fee(&self) -> Result<u128> {
        self.gas_price
            .checked_mul(u128::from(self.gas_limit))
            .ok_or_else(|| Error::InvalidCoins("fee overflow".into()))
    }

    /// Transaction hash
    pub fn hash(&self) -> Result<H256> {
        let bytes = bincode::serialize(self).map_err(|e| Error::Decode(e.to_string()))?;
        Ok(H256(hash_bytes(&bytes)))
    }
}

impl MsgDefinition for MsgEthereumTx {
    const ROUTE: &'static str = MODULE_NAME;
    const TYPE_URL: &'static str = "/evm.MsgEthereumTx";

    fn validate_basic(&self) -> Result<()> {
        if self.gas_price == 0 {
            return Err(Error::InsufficientFee("gas price cannot be zero".into()));
        }
        let intrinsic = self.intrinsic_gas()?;
        if self.gas_limit < intrinsic {
            return Err(Error::OutOfGas(format!(
                "gas limit {} below intrinsic gas {}",
                self.gas_limit, intrinsic
            )));
        }
        self.fee()?;
        Ok(())
    }

    fn signers(&self) -> Vec<Address> {
        vec![self.from]
    }
}

/// Outcome of one VM transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Transaction hash
    pub tx_hash: H256,
    /// Block height
    pub height: u64,
    /// Position among the block's VM transactions
    pub tx_index: u64,
    /// Sender
    pub from: Address,
    /// Callee
    pub to: Option<Address>,
    /// Created contract
    pub contract_address: Option<Address>,
    /// Gas charged
    pub gas_used: u64,
    /// Amount refunded to the sender
    #[serde(with = "crate::types::amount")]
    pub refund: u128,
}

/// Per-block VM totals
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    /// Height
    pub height: u64,
    /// Number of VM transactions
    pub tx_count: u64,
    /// Gas used by VM transactions
    pub gas_used: u64,
}

/// VM keeper
#[derive(Debug, Clone)]
pub struct EvmKeeper {
    key: StoreKey,
    tkey: StoreKey,
    space: Subspace,
    accounts: AccountKeeper,
    supply: SupplyKeeper,
}

impl EvmKeeper {
    /// Create keeper
    pub fn new(
        key: StoreKey,
        tkey: StoreKey,
        space: Subspace,
        accounts: AccountKeeper,
        supply: SupplyKeeper,
    ) -> Self {
        Self {
            key,
            tkey,
            space,
            accounts,
            supply,
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

    /// Deployed code
    pub fn code(&self, ctx: &mut Context<'_>, address: &Address) -> Result<Option<Vec<u8>>> {
        Ok(ctx.get(&self.key, &code_key(address))?)
    }

    /// Store code and record its hash on the account
    pub fn set_code(&self, ctx: &mut Context<'_>, address: &Address, code: Vec<u8>) -> Result<()> {
        let code_hash = H256(hash_bytes(&code));
        let account = match self.accounts.get_account(ctx, address)? {
            Some(Account::Eth(mut eth)) => {
                eth.code_hash = code_hash;
                Account::Eth(eth)
            }
            Some(Account::Base(base)) => Account::Eth(EthAccount { base, code_hash }),
            Some(Account::Module(_)) => {
                return Err(Error::module(
                    MODULE_NAME,
                    2,
                    format!("cannot deploy code to module account {}", address),
                ))
            }
            None => return Err(Error::UnknownAddress(format!("account {} does not exist", address))),
        };
        self.accounts.set_account(ctx, &account)?;
        ctx.set(&self.key, &code_key(address), code)?;
        Ok(())
    }

    /// Every deployed contract, ordered by address
    pub fn contracts(&self, ctx: &mut Context<'_>) -> Result<Vec<(Address, Vec<u8>)>> {
        ctx.prefix_scan(&self.key, CODE_PREFIX)?
            .into_iter()
            .map(|(key, code)| {
                let raw: [u8; 20] = key
                    .get(CODE_PREFIX.len()..)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| Error::Decode("malformed code key".into()))?;
                Ok((Address(raw), code))
            })
            .collect()
    }

    /// Stored receipt
    pub fn receipt(&self, ctx: &mut Context<'_>, tx_hash: &H256) -> Result<Option<Receipt>> {
        Ok(ctx.get_value(&self.key, &[RECEIPT_PREFIX, tx_hash.as_bytes()].concat())?)
    }

    /// Consensus hash of a past block
    pub fn block_hash(&self, ctx: &mut Context<'_>, height: u64) -> Result<Option<H256>> {
        Ok(ctx.get_value(&self.key, &height_key(BLOCK_HASH_PREFIX, height))?)
    }

    /// VM totals of a past block
    pub fn block_summary(&self, ctx: &mut Context<'_>, height: u64) -> Result<Option<BlockSummary>> {
        Ok(ctx.get_value(&self.key, &height_key(BLOCK_SUMMARY_PREFIX, height))?)
    }

    fn transient_counter(&self, ctx: &mut Context<'_>, key: &[u8]) -> Result<u64> {
        Ok(ctx.get_value(&self.tkey, key)?.unwrap_or(0))
    }

    /// Execute a VM transaction whose fee was already charged
    pub fn apply_transaction(&self, ctx: &mut Context<'_>, msg: &MsgEthereumTx) -> Result<Receipt> {
        let params = self.params(ctx)?;
        if msg.is_create() && !params.enable_create {
            return Err(Error::module(MODULE_NAME, 3, "contract creation is disabled"));
        }
        if !msg.is_create() && !params.enable_call {
            return Err(Error::module(MODULE_NAME, 3, "calls are disabled"));
        }

        let mut gas_used = msg.intrinsic_gas()?;
        let value = Coins::single(params.evm_denom.clone(), msg.value);

        let (to, contract_address) = match msg.recipient {
            Some(to) => {
                if self.code(ctx, &to)?.is_some() {
                    gas_used = gas_used.saturating_add(CALL_GAS);
                }
                (to, None)
            }
            None => {
                let address = create_address(&msg.from, msg.nonce);
                if self.code(ctx, &address)?.is_some() {
                    return Err(Error::module(
                        MODULE_NAME,
                        5,
                        format!("contract address collision: {}", address),
                    ));
                }
                let deposit = (msg.payload.len() as u64).saturating_mul(CREATE_DATA_GAS);
                gas_used = gas_used.saturating_add(deposit);
                (address, Some(address))
            }
        };

        if gas_used > msg.gas_limit {
            return Err(Error::OutOfGas(format!(
                "out of gas: limit {}, required {}",
                msg.gas_limit, gas_used
            )));
        }

        self.accounts.get_or_create_account(ctx, to)?;
        if contract_address.is_some() {
            self.set_code(ctx, &to, msg.payload.clone())?;
        }
        self.supply.bank().send_coins(ctx, &msg.from, &to, &value)?;

        let refund = u128::from(msg.gas_limit - gas_used)
            .checked_mul(msg.gas_price)
            .ok_or_else(|| Error::InvalidCoins("refund overflow".into()))?;
        self.supply.send_coins_from_module_to_account(
            ctx,
            FEE_COLLECTOR,
            &msg.from,
            &Coins::single(params.evm_denom.clone(), refund),
        )?;

        let tx_index = self.transient_counter(ctx, TX_INDEX_KEY)?;
        let block_gas = self.transient_counter(ctx, BLOCK_GAS_KEY)?;
        ctx.set_value(&self.tkey, TX_INDEX_KEY, &(tx_index + 1))?;
        ctx.set_value(&self.tkey, BLOCK_GAS_KEY, &block_gas.saturating_add(gas_used))?;

        let receipt = Receipt {
            tx_hash: msg.hash()?,
            height: ctx.block_height(),
            tx_index,
            from: msg.from,
            to: msg.recipient,
            contract_address,
            gas_used,
            refund,
        };
        ctx.set_value(&self.key, &[RECEIPT_PREFIX, receipt.tx_hash.as_bytes()].concat(), &receipt)?;

        let mut meter = GasMeter::with_limit(msg.gas_limit);
        meter.consume(gas_used, "evm execution")?;
        ctx.set_gas_meter(meter);

        let mut event = Event::new("ethereum_tx")
            .attr("sender", msg.from)
            .attr("recipient", to)
            .attr("amount", msg.value)
            .attr("gas_used", gas_used)
            .attr("tx_hash", receipt.tx_hash);
        if let Some(address) = contract_address {
            event = event.attr("contract", address);
        }
        ctx.emit_event(event);
        tracing::debug!(
            from = %msg.from,
            to = %to,
            gas_used,
            refund = %refund,
            "Applied VM transaction"
        );
        Ok(receipt)
    }
}

/// Contract code carried in genesis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisContract {
    /// Contract address; the account must already exist
    pub address: Address,
    /// Hex-encoded code
    pub code: String,
}

/// VM genesis fragment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    /// Parameters
    pub params: Params,
    /// Deployed contracts
    #[serde(default)]
    pub contracts: Vec<GenesisContract>,
}

impl GenesisState {
    fn validate(&self) -> Result<()> {
        crate::types::validate_denom(&self.params.evm_denom)?;
        for contract in &self.contracts {
            hex::decode(&contract.code)
                .map_err(|e| Error::Genesis(format!("invalid code for {}: {}", contract.address, e)))?;
        }
        Ok(())
    }
}

/// VM module
#[derive(Debug, Clone)]
pub struct EvmModule {
    keeper: EvmKeeper,
}

impl EvmModule {
    /// Wrap keeper
    pub fn new(keeper: EvmKeeper) -> Self {
        Self { keeper }
    }
}

impl AppModule for EvmModule {
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
        for contract in &state.contracts {
            if !self.keeper.accounts.has_account(ctx, &contract.address)? {
                return Err(Error::Genesis(format!(
                    "account {} not found for contract code",
                    contract.address
                )));
            }
            let code = hex::decode(&contract.code).map_err(|e| Error::Genesis(e.to_string()))?;
            self.keeper.set_code(ctx, &contract.address, code)?;
        }
        Ok(Vec::new())
    }

    fn export_genesis(&self, ctx: &mut Context<'_>) -> Result<Value> {
        let contracts = self
            .keeper
            .contracts(ctx)?
            .into_iter()
            .map(|(address, code)| GenesisContract {
                address,
                code: hex::encode(code),
            })
            .collect();
        to_json(&GenesisState {
            params: self.keeper.params(ctx)?,
            contracts,
        })
    }

    fn message_types(&self) -> &'static [&'static str] {
        &[MsgEthereumTx::TYPE_URL]
    }

    fn handle(&self, ctx: &mut Context<'_>, msg: &Msg) -> Result<Vec<u8>> {
        match msg {
            Msg::EthereumTx(msg) => {
                let receipt = self.keeper.apply_transaction(ctx, msg)?;
                bincode::serialize(&receipt).map_err(|e| Error::Decode(e.to_string()))
            }
            other => Err(Error::UnknownRequest(format!(
                "unrecognized evm message type: {}",
                other.type_url()
            ))),
        }
    }

    fn query_route(&self) -> Option<&'static str> {
        Some(MODULE_NAME)
    }

    fn query(&self, ctx: &mut Context<'_>, path: &[&str], _data: &[u8]) -> Result<Value> {
        match path {
            ["params"] => to_json(&self.keeper.params(ctx)?),
            ["code", address] => {
                let code = self.keeper.code(ctx, &Address::from_hex(address)?)?;
                to_json(&code.map(hex::encode))
            }
            ["receipt", hash] => to_json(&self.keeper.receipt(ctx, &H256::from_hex(hash)?)?),
            ["block_hash", height] => {
                let height = height
                    .parse::<u64>()
                    .map_err(|e| Error::InvalidRequest(format!("invalid height: {}", e)))?;
                to_json(&self.keeper.block_hash(ctx, height)?)
            }
            _ => Err(Error::UnknownRequest(format!(
                "unknown evm query endpoint: {}",
                path.join("/")
            ))),
        }
    }

    fn register_invariants(&self, registry: &mut InvariantRegistry) {
        let keeper = self.keeper.clone();
        registry.register(MODULE_NAME, "code-hash", move |ctx: &mut Context<'_>| {
            let mut broken = Vec::new();
            for (address, code) in keeper.contracts(ctx)? {
                let expected = H256(hash_bytes(&code));
                match keeper.accounts.get_account(ctx, &address)? {
                    Some(Account::Eth(eth)) if eth.code_hash == expected => {}
                    _ => broken.push(address.to_string()),
                }
            }
            Ok(if broken.is_empty() {
                None
            } else {
                Some(format!("code hash mismatch for: {}", broken.join(", ")))
            })
        });
    }

    fn as_begin_blocker(&self) -> Option<&dyn BeginBlocker> {
        Some(self)
    }

    fn as_end_blocker(&self) -> Option<&dyn EndBlocker> {
        Some(self)
    }
}

impl BeginBlocker for EvmModule {
    fn begin_block(&self, ctx: &mut Context<'_>, req: &RequestBeginBlock) -> Result<()> {
        let height = ctx.block_height();
        ctx.set_value(&self.keeper.key, &height_key(BLOCK_HASH_PREFIX, height), &req.hash)?;
        Ok(())
    }
}

impl EndBlocker for EvmModule {
    fn end_block(&self, ctx: &mut Context<'_>, req: &RequestEndBlock) -> Result<Vec<ValidatorUpdate>> {
        let summary = BlockSummary {
            height: req.height,
            tx_count: self.keeper.transient_counter(ctx, TX_INDEX_KEY)?,
            gas_used: self.keeper.transient_counter(ctx, BLOCK_GAS_KEY)?,
        };
        if summary.tx_count > 0 {
            tracing::debug!(height = summary.height, txs = summary.tx_count, gas = summary.gas_used, "VM block summary");
        }
        ctx.set_value(&self.keeper.key, &height_key(BLOCK_SUMMARY_PREFIX, req.height), &summary)?;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestEnv;

    fn transfer(from: Address, nonce: u64, to: Address, value: u128) -> MsgEthereumTx {
        MsgEthereumTx {
            from,
            nonce,
            gas_price: 10,
            gas_limit: 50_000,
            recipient: Some(to),
            value,
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_intrinsic_gas() {
        assert_eq!(intrinsic_gas(&[], false).unwrap(), TX_GAS);
        assert_eq!(intrinsic_gas(&[0, 1, 0], false).unwrap(), TX_GAS + 4 + 16 + 4);
        assert_eq!(intrinsic_gas(&[], true).unwrap(), TX_GAS + TX_GAS_CONTRACT_CREATION);
    }

    #[test]
    fn test_validate_basic_rejects_low_gas_limit() {
        let mut msg = transfer(Address([1; 20]), 0, Address([2; 20]), 1);
        msg.gas_limit = TX_GAS - 1;
        assert!(matches!(msg.validate_basic(), Err(Error::OutOfGas(_))));

        msg.gas_limit = TX_GAS;
        msg.gas_price = 0;
        assert!(matches!(msg.validate_basic(), Err(Error::InsufficientFee(_))));
    }

    #[test]
    fn test_transfer_refunds_unused_gas() {
        let mut env = TestEnv::new();
        let keepers = env.keepers();
        let mut ctx = env.ctx();
        let (alice, bob) = (Address([1; 20]), Address([2; 20]));
        keepers.fund(&mut ctx, alice, 1_000_000);

        let msg = transfer(alice, 0, bob, 100);
        let fee = Coins::single(NATIVE_DENOM, msg.fee().unwrap());
        keepers
            .supply
            .send_coins_from_account_to_module(&mut ctx, &alice, FEE_COLLECTOR, &fee)
            .unwrap();

        let receipt = keepers.evm.apply_transaction(&mut ctx, &msg).unwrap();
        assert_eq!(receipt.gas_used, TX_GAS);
        assert_eq!(receipt.refund, u128::from(50_000 - TX_GAS) * 10);
        // the installed meter holds exactly the execution gas
        assert_eq!(ctx.gas_meter().limit(), Some(50_000));
        assert_eq!(ctx.gas_meter().consumed(), TX_GAS);

        let balance = keepers.bank.balance(&mut ctx, &alice).unwrap();
        assert_eq!(balance.amount_of(NATIVE_DENOM), 1_000_000 - 100 - u128::from(TX_GAS) * 10);
        assert_eq!(keepers.bank.balance(&mut ctx, &bob).unwrap().amount_of(NATIVE_DENOM), 100);
        assert_eq!(keepers.evm.receipt(&mut ctx, &receipt.tx_hash).unwrap(), Some(receipt));
    }

    #[test]
    fn test_create_address_depends_on_sender_and_nonce() {
        let alice = Address([1; 20]);
        let bob = Address([2; 20]);
        assert_eq!(create_address(&alice, 0), create_address(&alice, 0));
        assert_ne!(create_address(&alice, 0), create_address(&alice, 1));
        assert_ne!(create_address(&alice, 0), create_address(&bob, 0));
        let mut preimage = alice.as_bytes().to_vec();
        preimage.extend_from_slice(&7u64.to_be_bytes());
        assert_eq!(create_address(&alice, 7), Address(address_hash(&preimage)));
    }

    #[test]
    fn test_create_deploys_code() {
        let mut env = TestEnv::new();
        let keepers = env.keepers();
        let module = EvmModule::new(keepers.evm.clone());
        let mut ctx = env.ctx();
        let alice = Address([1; 20]);
        keepers.fund(&mut ctx, alice, 10_000_000);
        keepers
            .supply
            .send_coins_from_account_to_module(&mut ctx, &alice, FEE_COLLECTOR, &Coins::single(NATIVE_DENOM, 1_000_000))
            .unwrap();

        let msg = MsgEthereumTx {
            from: alice,
            nonce: 3,
            gas_price: 1,
            gas_limit: 1_000_000,
            recipient: None,
            value: 0,
            payload: vec![0x60, 0x80, 0x00],
        };
        let receipt = keepers.evm.apply_transaction(&mut ctx, &msg).unwrap();
        let contract = create_address(&alice, 3);
        assert_eq!(receipt.contract_address, Some(contract));
        assert_eq!(
            receipt.gas_used,
            TX_GAS + TX_GAS_CONTRACT_CREATION + 16 + 16 + 4 + 3 * CREATE_DATA_GAS
        );
        assert_eq!(keepers.evm.code(&mut ctx, &contract).unwrap(), Some(msg.payload.clone()));

        let account = keepers.accounts.get_account(&mut ctx, &contract).unwrap().unwrap();
        assert!(matches!(account, Account::Eth(eth) if eth.code_hash == H256(hash_bytes(&msg.payload))));

        let mut registry = InvariantRegistry::new();
        module.register_invariants(&mut registry);
        assert!(registry.check_all(&mut ctx).unwrap().is_empty());

        let err = keepers.evm.apply_transaction(&mut ctx, &msg).unwrap_err();
        assert_eq!(err.code(), 5);
    }

    #[test]
    fn test_insufficient_gas_keeps_fee() {
        let mut env = TestEnv::new();
        let keepers = env.keepers();
        let mut ctx = env.ctx();
        let alice = Address([1; 20]);
        keepers.fund(&mut ctx, alice, 1_000_000);

        let msg = MsgEthereumTx {
            from: alice,
            nonce: 0,
            gas_price: 1,
            gas_limit: TX_GAS + TX_GAS_CONTRACT_CREATION + 16,
            recipient: None,
            value: 0,
            payload: vec![0xff],
        };
        let err = keepers.evm.apply_transaction(&mut ctx, &msg).unwrap_err();
        assert!(matches!(err, Error::OutOfGas(_)));
    }

    #[test]
    fn test_block_hooks_record_hash_and_summary() {
        let mut env = TestEnv::new();
        let keepers = env.keepers();
        let module = EvmModule::new(keepers.evm.clone());
        let mut ctx = env.ctx();

        let req = RequestBeginBlock {
            hash: H256([7; 32]),
            ..RequestBeginBlock::default()
        };
        module.begin_block(&mut ctx, &req).unwrap();
        module.end_block(&mut ctx, &RequestEndBlock { height: 1 }).unwrap();

        assert_eq!(keepers.evm.block_hash(&mut ctx, 1).unwrap(), Some(H256([7; 32])));
        let summary = keepers.evm.block_summary(&mut ctx, 1).unwrap().unwrap();
        assert_eq!(summary.tx_count, 0);
    }

    #[test]
    fn test_genesis_requires_existing_account() {
        let mut env = TestEnv::new();
        let keepers = env.keepers();
        let module = EvmModule::new(keepers.evm.clone());
        let mut ctx = env.ctx();
        let contract = Address([9; 20]);

        let genesis = serde_json::json!({
            "params": Params::default(),
            "contracts": [{ "address": contract.to_string(), "code": "6080" }],
        });
        assert!(module.init_genesis(&mut ctx, &genesis, &crate::module::NoGenesisTxs).is_err());

        keepers.accounts.get_or_create_account(&mut ctx, contract).unwrap();
        module.init_genesis(&mut ctx, &genesis, &crate::module::NoGenesisTxs).unwrap();
        let exported: GenesisState = parse_genesis(MODULE_NAME, &module.export_genesis(&mut ctx).unwrap()).unwrap();
        assert_eq!(exported.contracts.len(), 1);
        assert_eq!(exported.contracts[0].code, "6080");
    }
}
