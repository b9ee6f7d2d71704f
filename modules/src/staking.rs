//! Proof-of-stake validator set
//!
//! Validators receive delegations in the bond denomination. At the end of
//! every block the top `max_validators` non-jailed validators by power form
//! the bonded set; power changes against the previous block are returned to
//! the consensus engine as [`ValidatorUpdate`]s.
//!
//! Bonded stake sits in the `bonded_tokens_pool` module account, everything
//! else (unbonded validators, unbonding delegations) in
//! `not_bonded_tokens_pool`.
//!
//! # Hooks
//!
//! Distribution and slashing are constructed after staking but must observe
//! its state changes. They register through [`StakingKeeper::set_hooks`],
//! which binds the shared hook slot exactly once.

use crate::{
    abci::{RequestEndBlock, ValidatorUpdate},
    module::{parse_genesis, to_json, AppModule, DeliverGenesisTx, EndBlocker, InvariantRegistry},
    msgs::{Msg, MsgDefinition},
    params::Subspace,
    supply::SupplyKeeper,
    types::{dec_from_amount, Address, Coin, Coins, PubKey, NATIVE_DENOM},
    Error, Result,
};
use chain_store::{Context, Event, StoreKey};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Module name
pub const MODULE_NAME: &str = "staking";

/// Store key name
pub const STORE_KEY: &str = "staking";

/// Transient store key name
pub const TSTORE_KEY: &str = "transient_staking";

/// Pool holding bonded stake
pub const BONDED_POOL: &str = "bonded_tokens_pool";

/// Pool holding unbonded and unbonding stake
pub const NOT_BONDED_POOL: &str = "not_bonded_tokens_pool";

const LAST_POWER_PREFIX: &[u8] = &[0x11];
const LAST_TOTAL_POWER_KEY: &[u8] = &[0x12];
const VALIDATOR_PREFIX: &[u8] = &[0x21];
const VALIDATOR_BY_CONS_PREFIX: &[u8] = &[0x22];
const DELEGATION_PREFIX: &[u8] = &[0x31];
const UNBONDING_PREFIX: &[u8] = &[0x32];
const UNBONDING_QUEUE_PREFIX: &[u8] = &[0x41];
const VALIDATOR_QUEUE_PREFIX: &[u8] = &[0x43];
const TOUCHED_PREFIX: &[u8] = &[0x01];
const PARAMS_KEY: &str = "params";

const MAX_MONIKER_LEN: usize = 70;
const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 3600;

/// Bonding state of a validator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BondStatus {
    /// Not in the active set, stake withdrawable after unbonding
    Unbonded,
    /// Left the active set, waiting for the unbonding period
    Unbonding,
    /// In the active set
    Bonded,
}

/// Validator record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    /// Operator account
    pub operator: Address,
    /// Consensus key
    pub consensus_pubkey: PubKey,
    /// Excluded from the active set until unjailed
    pub jailed: bool,
    /// Bonding state
    pub status: BondStatus,
    /// Delegated tokens
    #[serde(with = "crate::types::amount")]
    pub tokens: u128,
    /// Total shares issued to delegators
    pub delegator_shares: Decimal,
    /// Display name
    pub moniker: String,
    /// Fraction of rewards kept by the operator
    pub commission_rate: Decimal,
    /// Height unbonding started
    pub unbonding_height: u64,
    /// Time unbonding completes
    pub unbonding_time: DateTime<Utc>,
}

impl Validator {
    /// Consensus address
    pub fn cons_address(&self) -> Address {
        Address::from_public_key(&self.consensus_pubkey)
    }

    /// Voting power
    pub fn power(&self, power_reduction: u128) -> u64 {
        u64::try_from(self.tokens / power_reduction.max(1)).unwrap_or(u64::MAX)
    }

    /// True if in the active set
    pub fn is_bonded(&self) -> bool {
        self.status == BondStatus::Bonded
    }

    /// Shares issued for `amount` tokens at the current exchange rate
    pub fn shares_from_tokens(&self, amount: u128) -> Result<Decimal> {
        let amount = dec_from_amount(amount)?;
        if self.tokens == 0 {
            return Ok(amount);
        }
        let tokens = dec_from_amount(self.tokens)?;
        self.delegator_shares
            .checked_mul(amount)
            .and_then(|v| v.checked_div(tokens))
            .ok_or_else(|| overflow("shares"))
    }

    /// Tokens backing `shares`
    pub fn tokens_from_shares(&self, shares: Decimal) -> Result<u128> {
        if self.delegator_shares.is_zero() {
            return Ok(0);
        }
        let tokens = dec_from_amount(self.tokens)?;
        shares
            .checked_mul(tokens)
            .and_then(|v| v.checked_div(self.delegator_shares))
            .and_then(|v| v.trunc().to_u128())
            .ok_or_else(|| overflow("tokens"))
    }

    fn add_tokens_from_del(&mut self, amount: u128) -> Result<Decimal> {
        let shares = self.shares_from_tokens(amount)?;
        self.tokens = self.tokens.checked_add(amount).ok_or_else(|| overflow("tokens"))?;
        self.delegator_shares = self
            .delegator_shares
            .checked_add(shares)
            .ok_or_else(|| overflow("shares"))?;
        Ok(shares)
    }

    fn remove_del_shares(&mut self, shares: Decimal) -> Result<u128> {
        let remaining = self.delegator_shares - shares;
        let issued = if remaining.is_zero() {
            self.tokens
        } else {
            self.tokens_from_shares(shares)?
        };
        self.delegator_shares = remaining;
        self.tokens = self.tokens.saturating_sub(issued);
        Ok(issued)
    }
}

fn overflow(what: &str) -> Error {
    Error::module(MODULE_NAME, 12, format!("{} overflow", what))
}

/// Stake of one delegator with one validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delegation {
    /// Delegator account
    pub delegator: Address,
    /// Validator operator
    pub validator: Address,
    /// Shares held
    pub shares: Decimal,
}

/// One pending unbonding
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbondingEntry {
    /// Height the unbonding started
    pub creation_height: u64,
    /// Time the tokens become withdrawable
    pub completion_time: DateTime<Utc>,
    /// Tokens at creation
    #[serde(with = "crate::types::amount")]
    pub initial_balance: u128,
    /// Tokens left after slashing
    #[serde(with = "crate::types::amount")]
    pub balance: u128,
}

/// Pending unbondings of one delegator from one validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnbondingDelegation {
    /// Delegator account
    pub delegator: Address,
    /// Validator operator
    pub validator: Address,
    /// Entries in creation order
    pub entries: Vec<UnbondingEntry>,
}

/// Staking parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Unbonding period in seconds
    pub unbonding_time_secs: u64,
    /// Size of the active set
    pub max_validators: u32,
    /// Stake denomination
    pub bond_denom: String,
    /// Tokens per unit of voting power
    #[serde(with = "crate::types::amount")]
    pub power_reduction: u128,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            unbonding_time_secs: 3 * 7 * 24 * 3600,
            max_validators: 100,
            bond_denom: NATIVE_DENOM.to_string(),
            power_reduction: 1,
        }
    }
}

impl Params {
    fn validate(&self) -> Result<()> {
        if self.unbonding_time_secs == 0 || self.unbonding_time_secs > MAX_DURATION_SECS {
            return Err(Error::Genesis("unbonding time out of range".into()));
        }
        if self.max_validators == 0 {
            return Err(Error::Genesis("max validators must be positive".into()));
        }
        if self.power_reduction == 0 {
            return Err(Error::Genesis("power reduction must be positive".into()));
        }
        crate::types::validate_denom(&self.bond_denom)
    }
}

/// Add seconds to a block time
pub(crate) fn time_after(time: DateTime<Utc>, secs: u64) -> Result<DateTime<Utc>> {
    let secs = i64::try_from(secs.min(MAX_DURATION_SECS)).unwrap_or(i64::MAX);
    time.checked_add_signed(chrono::Duration::seconds(secs))
        .ok_or_else(|| Error::InvalidRequest(format!("time overflow adding {}s to {}", secs, time)))
}

fn time_key(time: DateTime<Utc>) -> [u8; 8] {
    u64::try_from(time.timestamp()).unwrap_or(0).to_be_bytes()
}

/// Callbacks fired on staking state changes
///
/// Every method defaults to a no-op.
pub trait StakingHooks: Send + Sync {
    /// A validator was created
    fn after_validator_created(&self, _ctx: &mut Context<'_>, _operator: &Address) -> Result<()> {
        Ok(())
    }

    /// A validator entered the active set
    fn after_validator_bonded(&self, _ctx: &mut Context<'_>, _cons: &Address, _operator: &Address) -> Result<()> {
        Ok(())
    }

    /// A validator left the active set
    fn after_validator_begin_unbonding(
        &self,
        _ctx: &mut Context<'_>,
        _cons: &Address,
        _operator: &Address,
    ) -> Result<()> {
        Ok(())
    }

    /// A validator was deleted
    fn after_validator_removed(&self, _ctx: &mut Context<'_>, _cons: &Address, _operator: &Address) -> Result<()> {
        Ok(())
    }

    /// A delegation is about to be created
    fn before_delegation_created(&self, _ctx: &mut Context<'_>, _delegator: &Address, _validator: &Address) -> Result<()> {
        Ok(())
    }

    /// A delegation's shares are about to change
    fn before_delegation_shares_modified(
        &self,
        _ctx: &mut Context<'_>,
        _delegator: &Address,
        _validator: &Address,
    ) -> Result<()> {
        Ok(())
    }

    /// A delegation is about to be removed
    fn before_delegation_removed(&self, _ctx: &mut Context<'_>, _delegator: &Address, _validator: &Address) -> Result<()> {
        Ok(())
    }

    /// A delegation was created or changed
    fn after_delegation_modified(&self, _ctx: &mut Context<'_>, _delegator: &Address, _validator: &Address) -> Result<()> {
        Ok(())
    }

    /// A validator is about to be slashed by `fraction`
    fn before_validator_slashed(&self, _ctx: &mut Context<'_>, _operator: &Address, _fraction: Decimal) -> Result<()> {
        Ok(())
    }
}

/// Fans every callback out to several hook sets, in order
#[derive(Clone, Default)]
pub struct MultiStakingHooks(Vec<Arc<dyn StakingHooks>>);

impl fmt::Debug for MultiStakingHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MultiStakingHooks({})", self.0.len())
    }
}

impl MultiStakingHooks {
    /// Combine hook sets
    pub fn new(hooks: Vec<Arc<dyn StakingHooks>>) -> Self {
        Self(hooks)
    }
}

impl StakingHooks for MultiStakingHooks {
    fn after_validator_created(&self, ctx: &mut Context<'_>, operator: &Address) -> Result<()> {
        self.0.iter().try_for_each(|h| h.after_validator_created(ctx, operator))
    }

    fn after_validator_bonded(&self, ctx: &mut Context<'_>, cons: &Address, operator: &Address) -> Result<()> {
        self.0.iter().try_for_each(|h| h.after_validator_bonded(ctx, cons, operator))
    }

    fn after_validator_begin_unbonding(&self, ctx: &mut Context<'_>, cons: &Address, operator: &Address) -> Result<()> {
        self.0
            .iter()
            .try_for_each(|h| h.after_validator_begin_unbonding(ctx, cons, operator))
    }

    fn after_validator_removed(&self, ctx: &mut Context<'_>, cons: &Address, operator: &Address) -> Result<()> {
        self.0.iter().try_for_each(|h| h.after_validator_removed(ctx, cons, operator))
    }

    fn before_delegation_created(&self, ctx: &mut Context<'_>, delegator: &Address, validator: &Address) -> Result<()> {
        self.0
            .iter()
            .try_for_each(|h| h.before_delegation_created(ctx, delegator, validator))
    }

    fn before_delegation_shares_modified(
        &self,
        ctx: &mut Context<'_>,
        delegator: &Address,
        validator: &Address,
    ) -> Result<()> {
        self.0
            .iter()
            .try_for_each(|h| h.before_delegation_shares_modified(ctx, delegator, validator))
    }

    fn before_delegation_removed(&self, ctx: &mut Context<'_>, delegator: &Address, validator: &Address) -> Result<()> {
        self.0
            .iter()
            .try_for_each(|h| h.before_delegation_removed(ctx, delegator, validator))
    }

    fn after_delegation_modified(&self, ctx: &mut Context<'_>, delegator: &Address, validator: &Address) -> Result<()> {
        self.0
            .iter()
            .try_for_each(|h| h.after_delegation_modified(ctx, delegator, validator))
    }

    fn before_validator_slashed(&self, ctx: &mut Context<'_>, operator: &Address, fraction: Decimal) -> Result<()> {
        self.0
            .iter()
            .try_for_each(|h| h.before_validator_slashed(ctx, operator, fraction))
    }
}

type HookSlot = Arc<RwLock<Option<Arc<dyn StakingHooks>>>>;

/// Create a validator with a self-delegation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgCreateValidator {
    /// Operator account, also the self-delegator
    pub operator: Address,
    /// Consensus key
    pub pub_key: PubKey,
    /// Display name
    pub moniker: String,
    /// Commission rate in `[0, 1]`
    pub commission_rate: Decimal,
    /// Self-delegation
    pub value: Coin,
}

impl MsgDefinition for MsgCreateValidator {
    const ROUTE: &'static str = MODULE_NAME;
    const TYPE_URL: &'static str = "/staking.MsgCreateValidator";

    fn validate_basic(&self) -> Result<()> {
        if self.value.amount == 0 {
            return Err(Error::InvalidCoins("self delegation must be positive".into()));
        }
        if self.commission_rate.is_sign_negative() || self.commission_rate > Decimal::ONE {
            return Err(Error::module(MODULE_NAME, 9, "commission rate must be between 0 and 1"));
        }
        if self.moniker.len() > MAX_MONIKER_LEN {
            return Err(Error::ValidateBasic(format!(
                "moniker longer than {} characters",
                MAX_MONIKER_LEN
            )));
        }
        Ok(())
    }

    fn signers(&self) -> Vec<Address> {
        vec![self.operator]
    }
}

/// Delegate tokens to a validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgDelegate {
    /// Delegator account
    pub delegator: Address,
    /// Validator operator
    pub validator: Address,
    /// Tokens
    pub amount: Coin,
}

impl MsgDefinition for MsgDelegate {
    const ROUTE: &'static str = MODULE_NAME;
    const TYPE_URL: &'static str = "/staking.MsgDelegate";

    fn validate_basic(&self) -> Result<()> {
        if self.amount.amount == 0 {
            return Err(Error::InvalidCoins("delegation amount must be positive".into()));
        }
        Ok(())
    }

    fn signers(&self) -> Vec<Address> {
        vec![self.delegator]
    }
}

/// Start unbonding tokens from a validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgUndelegate {
    /// Delegator account
    pub delegator: Address,
    /// Validator operator
    pub validator: Address,
    /// Tokens
    pub amount: Coin,
}

impl MsgDefinition for MsgUndelegate {
    const ROUTE: &'static str = MODULE_NAME;
    const TYPE_URL: &'static str = "/staking.MsgUndelegate";

    fn validate_basic(&self) -> Result<()> {
        if self.amount.amount == 0 {
            return Err(Error::InvalidCoins("undelegation amount must be positive".into()));
        }
        Ok(())
    }

    fn signers(&self) -> Vec<Address> {
        vec![self.delegator]
    }
}

/// Staking keeper
#[derive(Clone)]
pub struct StakingKeeper {
    key: StoreKey,
    tkey: StoreKey,
    supply: SupplyKeeper,
    space: Subspace,
    hooks: HookSlot,
}

impl fmt::Debug for StakingKeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StakingKeeper")
            .field("key", &self.key)
            .field("hooks_bound", &self.hooks.read().is_some())
            .finish()
    }
}

fn pair_key(prefix: &[u8], a: &Address, b: &Address) -> Vec<u8> {
    [prefix, a.as_bytes(), b.as_bytes()].concat()
}

fn addr_key(prefix: &[u8], a: &Address) -> Vec<u8> {
    [prefix, a.as_bytes()].concat()
}

fn address_at(bytes: &[u8], offset: usize) -> Result<Address> {
    bytes
        .get(offset..offset + 20)
        .and_then(|s| <[u8; 20]>::try_from(s).ok())
        .map(Address)
        .ok_or_else(|| Error::InvalidAddress(hex::encode(bytes)))
}

fn no_validator(operator: &Address) -> Error {
    Error::module(MODULE_NAME, 4, format!("validator {} does not exist", operator))
}

impl StakingKeeper {
    /// Create keeper; hooks are bound later
    pub fn new(key: StoreKey, tkey: StoreKey, supply: SupplyKeeper, space: Subspace) -> Self {
        Self {
            key,
            tkey,
            supply,
            space,
            hooks: Arc::new(RwLock::new(None)),
        }
    }

    /// Bind the hook slot; fails if already bound
    pub fn set_hooks(&self, hooks: Arc<dyn StakingHooks>) -> Result<()> {
        let mut slot = self.hooks.write();
        if slot.is_some() {
            return Err(Error::HooksAlreadySet);
        }
        *slot = Some(hooks);
        Ok(())
    }

    fn hooks(&self) -> Option<Arc<dyn StakingHooks>> {
        self.hooks.read().clone()
    }

    /// Supply keeper used for pool movements
    pub fn supply(&self) -> &SupplyKeeper {
        &self.supply
    }

    /// Parameters
    pub fn params(&self, ctx: &mut Context<'_>) -> Result<Params> {
        self.space.get_or_default(ctx, PARAMS_KEY)
    }

    /// Replace parameters
    pub fn set_params(&self, ctx: &mut Context<'_>, params: &Params) -> Result<()> {
        self.space.set(ctx, PARAMS_KEY, params)
    }

    // ---- validators ----

    /// Validator by operator
    pub fn validator(&self, ctx: &mut Context<'_>, operator: &Address) -> Result<Option<Validator>> {
        Ok(ctx.get_value(&self.key, &addr_key(VALIDATOR_PREFIX, operator))?)
    }

    fn must_validator(&self, ctx: &mut Context<'_>, operator: &Address) -> Result<Validator> {
        self.validator(ctx, operator)?
            .ok_or_else(|| no_validator(operator))
    }

    /// Validator by consensus address
    pub fn validator_by_cons_addr(&self, ctx: &mut Context<'_>, cons: &Address) -> Result<Option<Validator>> {
        match ctx.get_value::<Address>(&self.key, &addr_key(VALIDATOR_BY_CONS_PREFIX, cons))? {
            Some(operator) => self.validator(ctx, &operator),
            None => Ok(None),
        }
    }

    /// Store a validator and its consensus index
    pub fn set_validator(&self, ctx: &mut Context<'_>, validator: &Validator) -> Result<()> {
        ctx.set_value(&self.key, &addr_key(VALIDATOR_PREFIX, &validator.operator), validator)?;
        ctx.set_value(
            &self.key,
            &addr_key(VALIDATOR_BY_CONS_PREFIX, &validator.cons_address()),
            &validator.operator,
        )?;
        Ok(())
    }

    fn remove_validator(&self, ctx: &mut Context<'_>, validator: &Validator) -> Result<()> {
        let cons = validator.cons_address();
        ctx.delete(&self.key, &addr_key(VALIDATOR_PREFIX, &validator.operator))?;
        ctx.delete(&self.key, &addr_key(VALIDATOR_BY_CONS_PREFIX, &cons))?;
        ctx.delete(&self.key, &addr_key(LAST_POWER_PREFIX, &validator.operator))?;
        if let Some(hooks) = self.hooks() {
            hooks.after_validator_removed(ctx, &cons, &validator.operator)?;
        }
        tracing::debug!(operator = %validator.operator, "Removed validator");
        Ok(())
    }

    /// Every validator, ordered by operator
    pub fn validators(&self, ctx: &mut Context<'_>) -> Result<Vec<Validator>> {
        Ok(ctx
            .scan_values::<Validator>(&self.key, VALIDATOR_PREFIX)?
            .into_iter()
            .map(|(_, v)| v)
            .collect())
    }

    /// Bonded validators, highest power first
    pub fn bonded_validators(&self, ctx: &mut Context<'_>) -> Result<Vec<Validator>> {
        let reduction = self.params(ctx)?.power_reduction;
        let mut bonded: Vec<Validator> = self
            .validators(ctx)?
            .into_iter()
            .filter(Validator::is_bonded)
            .collect();
        bonded.sort_by(|a, b| {
            b.power(reduction)
                .cmp(&a.power(reduction))
                .then_with(|| a.operator.cmp(&b.operator))
        });
        Ok(bonded)
    }

    fn touch(&self, ctx: &mut Context<'_>, operator: &Address) -> Result<()> {
        Ok(ctx.set(&self.tkey, &addr_key(TOUCHED_PREFIX, operator), vec![1])?)
    }

    // ---- delegations ----

    /// Delegation of `delegator` to `validator`
    pub fn delegation(
        &self,
        ctx: &mut Context<'_>,
        delegator: &Address,
        validator: &Address,
    ) -> Result<Option<Delegation>> {
        Ok(ctx.get_value(&self.key, &pair_key(DELEGATION_PREFIX, delegator, validator))?)
    }

    fn set_delegation(&self, ctx: &mut Context<'_>, delegation: &Delegation) -> Result<()> {
        Ok(ctx.set_value(
            &self.key,
            &pair_key(DELEGATION_PREFIX, &delegation.delegator, &delegation.validator),
            delegation,
        )?)
    }

    /// Every delegation, ordered by delegator then validator
    pub fn delegations(&self, ctx: &mut Context<'_>) -> Result<Vec<Delegation>> {
        Ok(ctx
            .scan_values::<Delegation>(&self.key, DELEGATION_PREFIX)?
            .into_iter()
            .map(|(_, d)| d)
            .collect())
    }

    /// Pending unbondings of `delegator` from `validator`
    pub fn unbonding_delegation(
        &self,
        ctx: &mut Context<'_>,
        delegator: &Address,
        validator: &Address,
    ) -> Result<Option<UnbondingDelegation>> {
        Ok(ctx.get_value(&self.key, &pair_key(UNBONDING_PREFIX, delegator, validator))?)
    }

    fn set_unbonding_delegation(&self, ctx: &mut Context<'_>, ubd: &UnbondingDelegation) -> Result<()> {
        let key = pair_key(UNBONDING_PREFIX, &ubd.delegator, &ubd.validator);
        if ubd.entries.is_empty() {
            ctx.delete(&self.key, &key)?;
        } else {
            ctx.set_value(&self.key, &key, ubd)?;
        }
        Ok(())
    }

    /// Every pending unbonding
    pub fn unbonding_delegations(&self, ctx: &mut Context<'_>) -> Result<Vec<UnbondingDelegation>> {
        Ok(ctx
            .scan_values::<UnbondingDelegation>(&self.key, UNBONDING_PREFIX)?
            .into_iter()
            .map(|(_, u)| u)
            .collect())
    }

    // ---- power ----

    /// Power of `operator` at the end of the previous block
    pub fn last_validator_power(&self, ctx: &mut Context<'_>, operator: &Address) -> Result<Option<u64>> {
        Ok(ctx.get_value(&self.key, &addr_key(LAST_POWER_PREFIX, operator))?)
    }

    /// Total power at the end of the previous block
    pub fn last_total_power(&self, ctx: &mut Context<'_>) -> Result<u64> {
        Ok(ctx.get_value(&self.key, LAST_TOTAL_POWER_KEY)?.unwrap_or(0))
    }

    fn last_powers(&self, ctx: &mut Context<'_>) -> Result<BTreeMap<Address, u64>> {
        ctx.scan_values::<u64>(&self.key, LAST_POWER_PREFIX)?
            .into_iter()
            .map(|(key, power)| Ok((address_at(&key, LAST_POWER_PREFIX.len())?, power)))
            .collect()
    }

    /// Tokens in the bonded pool
    pub fn bonded_tokens(&self, ctx: &mut Context<'_>) -> Result<u128> {
        let denom = self.params(ctx)?.bond_denom;
        Ok(self.supply.module_balance(ctx, BONDED_POOL)?.amount_of(&denom))
    }

    /// Bonded share of the total supply of the bond denomination
    pub fn bonded_ratio(&self, ctx: &mut Context<'_>) -> Result<Decimal> {
        let denom = self.params(ctx)?.bond_denom;
        let supply = self.supply.supply(ctx)?.amount_of(&denom);
        if supply == 0 {
            return Ok(Decimal::ZERO);
        }
        let bonded = dec_from_amount(self.bonded_tokens(ctx)?)?;
        bonded
            .checked_div(dec_from_amount(supply)?)
            .ok_or_else(|| overflow("bonded ratio"))
    }

    // ---- state transitions ----

    fn bond_coins(&self, ctx: &mut Context<'_>, amount: u128) -> Result<Coins> {
        Ok(Coins::single(self.params(ctx)?.bond_denom, amount))
    }

    /// Create a validator and self-delegate
    pub fn create_validator(&self, ctx: &mut Context<'_>, msg: &MsgCreateValidator) -> Result<()> {
        let params = self.params(ctx)?;
        if self.validator(ctx, &msg.operator)?.is_some() {
            return Err(Error::module(
                MODULE_NAME,
                2,
                "validator already exist for this operator address",
            ));
        }
        let cons = Address::from_public_key(&msg.pub_key);
        if self.validator_by_cons_addr(ctx, &cons)?.is_some() {
            return Err(Error::module(
                MODULE_NAME,
                3,
                "validator already exist for this pubkey",
            ));
        }
        if msg.value.denom != params.bond_denom {
            return Err(Error::module(
                MODULE_NAME,
                5,
                format!("invalid coin denomination: got {}, expected {}", msg.value.denom, params.bond_denom),
            ));
        }

        let validator = Validator {
            operator: msg.operator,
            consensus_pubkey: msg.pub_key,
            jailed: false,
            status: BondStatus::Unbonded,
            tokens: 0,
            delegator_shares: Decimal::ZERO,
            moniker: msg.moniker.clone(),
            commission_rate: msg.commission_rate,
            unbonding_height: 0,
            unbonding_time: DateTime::<Utc>::default(),
        };
        self.set_validator(ctx, &validator)?;
        if let Some(hooks) = self.hooks() {
            hooks.after_validator_created(ctx, &msg.operator)?;
        }

        self.delegate(ctx, &msg.operator, &msg.operator, msg.value.amount)?;

        ctx.emit_event(
            Event::new("create_validator")
                .attr("validator", msg.operator)
                .attr("amount", &msg.value),
        );
        tracing::info!(operator = %msg.operator, moniker = %msg.moniker, "Created validator");
        Ok(())
    }

    /// Delegate `amount` bond tokens, returning the shares issued
    pub fn delegate(
        &self,
        ctx: &mut Context<'_>,
        delegator: &Address,
        operator: &Address,
        amount: u128,
    ) -> Result<Decimal> {
        let mut validator = self.must_validator(ctx, operator)?;
        let existing = self.delegation(ctx, delegator, operator)?;

        if let Some(hooks) = self.hooks() {
            if existing.is_some() {
                hooks.before_delegation_shares_modified(ctx, delegator, operator)?;
            } else {
                hooks.before_delegation_created(ctx, delegator, operator)?;
            }
        }

        let pool = if validator.is_bonded() { BONDED_POOL } else { NOT_BONDED_POOL };
        let coins = self.bond_coins(ctx, amount)?;
        self.supply
            .delegate_coins_from_account_to_module(ctx, delegator, pool, &coins)?;

        let shares = validator.add_tokens_from_del(amount)?;
        self.set_validator(ctx, &validator)?;

        let mut delegation = existing.unwrap_or(Delegation {
            delegator: *delegator,
            validator: *operator,
            shares: Decimal::ZERO,
        });
        delegation.shares = delegation
            .shares
            .checked_add(shares)
            .ok_or_else(|| overflow("shares"))?;
        self.set_delegation(ctx, &delegation)?;

        if let Some(hooks) = self.hooks() {
            hooks.after_delegation_modified(ctx, delegator, operator)?;
        }
        self.touch(ctx, operator)?;

        ctx.emit_event(
            Event::new("delegate")
                .attr("validator", operator)
                .attr("delegator", delegator)
                .attr("amount", &coins),
        );
        Ok(shares)
    }

    /// Remove `shares` from a delegation, returning the tokens released
    pub fn unbond(
        &self,
        ctx: &mut Context<'_>,
        delegator: &Address,
        operator: &Address,
        shares: Decimal,
    ) -> Result<u128> {
        let mut delegation = self.delegation(ctx, delegator, operator)?.ok_or_else(|| {
            Error::module(MODULE_NAME, 6, "no delegation for (address, validator) tuple")
        })?;
        if shares > delegation.shares {
            return Err(Error::module(
                MODULE_NAME,
                7,
                "not enough delegation shares",
            ));
        }

        if let Some(hooks) = self.hooks() {
            hooks.before_delegation_shares_modified(ctx, delegator, operator)?;
        }

        delegation.shares -= shares;
        if delegation.shares.is_zero() {
            if let Some(hooks) = self.hooks() {
                hooks.before_delegation_removed(ctx, delegator, operator)?;
            }
            ctx.delete(&self.key, &pair_key(DELEGATION_PREFIX, delegator, operator))?;
        } else {
            self.set_delegation(ctx, &delegation)?;
            if let Some(hooks) = self.hooks() {
                hooks.after_delegation_modified(ctx, delegator, operator)?;
            }
        }

        let mut validator = self.must_validator(ctx, operator)?;
        let amount = validator.remove_del_shares(shares)?;
        if validator.delegator_shares.is_zero() && validator.status == BondStatus::Unbonded {
            self.remove_validator(ctx, &validator)?;
        } else {
            self.set_validator(ctx, &validator)?;
        }
        self.touch(ctx, operator)?;
        Ok(amount)
    }

    /// Start unbonding `amount` tokens, returning the completion time
    pub fn undelegate(
        &self,
        ctx: &mut Context<'_>,
        delegator: &Address,
        operator: &Address,
        amount: u128,
    ) -> Result<DateTime<Utc>> {
        let params = self.params(ctx)?;
        let validator = self.must_validator(ctx, operator)?;
        let shares = validator.shares_from_tokens(amount)?;
        let was_bonded = validator.is_bonded();

        let returned = self.unbond(ctx, delegator, operator, shares)?;
        if was_bonded && returned > 0 {
            let coins = Coins::single(params.bond_denom.clone(), returned);
            self.supply
                .send_coins_from_module_to_module(ctx, BONDED_POOL, NOT_BONDED_POOL, &coins)?;
        }

        let completion_time = time_after(ctx.block_time(), params.unbonding_time_secs)?;
        let mut ubd = self
            .unbonding_delegation(ctx, delegator, operator)?
            .unwrap_or(UnbondingDelegation {
                delegator: *delegator,
                validator: *operator,
                entries: Vec::new(),
            });
        ubd.entries.push(UnbondingEntry {
            creation_height: ctx.block_height(),
            completion_time,
            initial_balance: returned,
            balance: returned,
        });
        self.set_unbonding_delegation(ctx, &ubd)?;

        let queue_key = [
            UNBONDING_QUEUE_PREFIX,
            &time_key(completion_time),
            delegator.as_bytes(),
            operator.as_bytes(),
        ]
        .concat();
        ctx.set(&self.key, &queue_key, Vec::new())?;

        ctx.emit_event(
            Event::new("unbond")
                .attr("validator", operator)
                .attr("amount", returned)
                .attr("completion_time", completion_time.to_rfc3339()),
        );
        Ok(completion_time)
    }

    /// Pay out matured unbonding entries
    pub fn complete_unbonding(
        &self,
        ctx: &mut Context<'_>,
        delegator: &Address,
        operator: &Address,
    ) -> Result<Coins> {
        let params = self.params(ctx)?;
        let now = ctx.block_time();
        let mut ubd = match self.unbonding_delegation(ctx, delegator, operator)? {
            Some(ubd) => ubd,
            None => return Ok(Coins::empty()),
        };

        let mut released: u128 = 0;
        ubd.entries.retain(|entry| {
            if entry.completion_time <= now {
                released = released.saturating_add(entry.balance);
                false
            } else {
                true
            }
        });
        self.set_unbonding_delegation(ctx, &ubd)?;

        let coins = Coins::single(params.bond_denom, released);
        if !coins.is_empty() {
            self.supply
                .undelegate_coins_from_module_to_account(ctx, NOT_BONDED_POOL, delegator, &coins)?;
            ctx.emit_event(
                Event::new("complete_unbonding")
                    .attr("validator", operator)
                    .attr("delegator", delegator)
                    .attr("amount", &coins),
            );
        }
        Ok(coins)
    }

    /// Slash the validator owning `cons` by `fraction` of its power at the infraction
    ///
    /// Returns the amount burned. Unknown validators are ignored.
    pub fn slash(
        &self,
        ctx: &mut Context<'_>,
        cons: &Address,
        infraction_height: u64,
        power: u64,
        fraction: Decimal,
    ) -> Result<u128> {
        let params = self.params(ctx)?;
        let mut validator = match self.validator_by_cons_addr(ctx, cons)? {
            Some(v) => v,
            None => {
                tracing::warn!(cons = %cons, "Ignored attempt to slash a nonexistent validator");
                return Ok(0);
            }
        };
        if validator.status == BondStatus::Unbonded && validator.tokens == 0 {
            return Ok(0);
        }

        let power_tokens = dec_from_amount(u128::from(power).saturating_mul(params.power_reduction))?;
        let slash_amount = power_tokens
            .checked_mul(fraction)
            .and_then(|v| v.trunc().to_u128())
            .ok_or_else(|| overflow("slash amount"))?
            .min(validator.tokens);

        if let Some(hooks) = self.hooks() {
            hooks.before_validator_slashed(ctx, &validator.operator, fraction)?;
        }

        let pool = if validator.is_bonded() { BONDED_POOL } else { NOT_BONDED_POOL };
        validator.tokens -= slash_amount;
        self.set_validator(ctx, &validator)?;
        if slash_amount > 0 {
            let coins = Coins::single(params.bond_denom, slash_amount);
            self.supply.burn_coins(ctx, pool, &coins)?;
        }
        self.touch(ctx, &validator.operator)?;

        ctx.emit_event(
            Event::new("slash")
                .attr("validator", validator.operator)
                .attr("infraction_height", infraction_height)
                .attr("burned", slash_amount),
        );
        tracing::info!(
            operator = %validator.operator,
            infraction_height,
            %fraction,
            burned = slash_amount,
            "Slashed validator"
        );
        Ok(slash_amount)
    }

    /// Exclude a validator from the active set
    pub fn jail(&self, ctx: &mut Context<'_>, cons: &Address) -> Result<()> {
        self.set_jailed(ctx, cons, true)
    }

    /// Allow a jailed validator back into the active set
    pub fn unjail(&self, ctx: &mut Context<'_>, cons: &Address) -> Result<()> {
        self.set_jailed(ctx, cons, false)
    }

    fn set_jailed(&self, ctx: &mut Context<'_>, cons: &Address, jailed: bool) -> Result<()> {
        let mut validator = self
            .validator_by_cons_addr(ctx, cons)?
            .ok_or_else(|| no_validator(cons))?;
        if validator.jailed == jailed {
            return Err(Error::module(
                MODULE_NAME,
                8,
                format!("validator {} jailed status already {}", validator.operator, jailed),
            ));
        }
        validator.jailed = jailed;
        self.set_validator(ctx, &validator)?;
        self.touch(ctx, &validator.operator)?;
        ctx.emit_event(
            Event::new(if jailed { "jail" } else { "unjail" }).attr("validator", validator.operator),
        );
        Ok(())
    }

    fn bond_validator(&self, ctx: &mut Context<'_>, validator: &mut Validator) -> Result<()> {
        if validator.status == BondStatus::Unbonding {
            let queue_key = [
                VALIDATOR_QUEUE_PREFIX,
                &time_key(validator.unbonding_time),
                validator.operator.as_bytes(),
            ]
            .concat();
            ctx.delete(&self.key, &queue_key)?;
        }
        if validator.tokens > 0 {
            let coins = self.bond_coins(ctx, validator.tokens)?;
            self.supply
                .send_coins_from_module_to_module(ctx, NOT_BONDED_POOL, BONDED_POOL, &coins)?;
        }
        validator.status = BondStatus::Bonded;
        self.set_validator(ctx, validator)?;
        if let Some(hooks) = self.hooks() {
            hooks.after_validator_bonded(ctx, &validator.cons_address(), &validator.operator)?;
        }
        tracing::debug!(operator = %validator.operator, "Validator bonded");
        Ok(())
    }

    fn begin_unbonding(&self, ctx: &mut Context<'_>, validator: &mut Validator) -> Result<()> {
        let params = self.params(ctx)?;
        if validator.tokens > 0 {
            let coins = Coins::single(params.bond_denom.clone(), validator.tokens);
            self.supply
                .send_coins_from_module_to_module(ctx, BONDED_POOL, NOT_BONDED_POOL, &coins)?;
        }
        validator.status = BondStatus::Unbonding;
        validator.unbonding_height = ctx.block_height();
        validator.unbonding_time = time_after(ctx.block_time(), params.unbonding_time_secs)?;
        self.set_validator(ctx, validator)?;

        let queue_key = [
            VALIDATOR_QUEUE_PREFIX,
            &time_key(validator.unbonding_time),
            validator.operator.as_bytes(),
        ]
        .concat();
        ctx.set(&self.key, &queue_key, Vec::new())?;

        if let Some(hooks) = self.hooks() {
            hooks.after_validator_begin_unbonding(ctx, &validator.cons_address(), &validator.operator)?;
        }
        tracing::debug!(operator = %validator.operator, "Validator began unbonding");
        Ok(())
    }

    /// Recompute the active set and return power changes since the last call
    pub fn apply_and_return_validator_set_updates(&self, ctx: &mut Context<'_>) -> Result<Vec<ValidatorUpdate>> {
        let params = self.params(ctx)?;
        let reduction = params.power_reduction;

        let mut candidates: Vec<Validator> = self
            .validators(ctx)?
            .into_iter()
            .filter(|v| !v.jailed && v.power(reduction) > 0)
            .collect();
        candidates.sort_by(|a, b| {
            b.power(reduction)
                .cmp(&a.power(reduction))
                .then_with(|| a.operator.cmp(&b.operator))
        });
        candidates.truncate(params.max_validators as usize);

        let last = self.last_powers(ctx)?;
        let mut updates = Vec::new();
        let mut active = BTreeSet::new();
        let mut total_power: u64 = 0;

        for mut validator in candidates {
            if !validator.is_bonded() {
                self.bond_validator(ctx, &mut validator)?;
            }
            let power = validator.power(reduction);
            if last.get(&validator.operator) != Some(&power) {
                updates.push(ValidatorUpdate {
                    pub_key: validator.consensus_pubkey,
                    power,
                });
                ctx.set_value(&self.key, &addr_key(LAST_POWER_PREFIX, &validator.operator), &power)?;
            }
            total_power = total_power.saturating_add(power);
            active.insert(validator.operator);
        }

        for operator in last.keys().filter(|op| !active.contains(*op)) {
            let mut validator = self.must_validator(ctx, operator)?;
            if validator.is_bonded() {
                self.begin_unbonding(ctx, &mut validator)?;
            }
            ctx.delete(&self.key, &addr_key(LAST_POWER_PREFIX, operator))?;
            updates.push(ValidatorUpdate {
                pub_key: validator.consensus_pubkey,
                power: 0,
            });
        }

        ctx.set_value(&self.key, LAST_TOTAL_POWER_KEY, &total_power)?;
        Ok(updates)
    }

    fn unbond_matured_validators(&self, ctx: &mut Context<'_>) -> Result<()> {
        let now = time_key(ctx.block_time());
        for (key, _) in ctx.prefix_scan(&self.key, VALIDATOR_QUEUE_PREFIX)? {
            let offset = VALIDATOR_QUEUE_PREFIX.len();
            if key.get(offset..offset + 8).unwrap_or_default() > &now[..] {
                break;
            }
            let operator = address_at(&key, offset + 8)?;
            ctx.delete(&self.key, &key)?;

            if let Some(mut validator) = self.validator(ctx, &operator)? {
                if validator.status != BondStatus::Unbonding {
                    continue;
                }
                validator.status = BondStatus::Unbonded;
                if validator.delegator_shares.is_zero() {
                    self.remove_validator(ctx, &validator)?;
                } else {
                    self.set_validator(ctx, &validator)?;
                }
            }
        }
        Ok(())
    }

    fn complete_matured_unbondings(&self, ctx: &mut Context<'_>) -> Result<()> {
        let now = time_key(ctx.block_time());
        for (key, _) in ctx.prefix_scan(&self.key, UNBONDING_QUEUE_PREFIX)? {
            let offset = UNBONDING_QUEUE_PREFIX.len();
            if key.get(offset..offset + 8).unwrap_or_default() > &now[..] {
                break;
            }
            let delegator = address_at(&key, offset + 8)?;
            let operator = address_at(&key, offset + 28)?;
            ctx.delete(&self.key, &key)?;
            self.complete_unbonding(ctx, &delegator, &operator)?;
        }
        Ok(())
    }
}

/// Staking genesis fragment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    /// Parameters
    pub params: Params,
    /// Validators
    pub validators: Vec<Validator>,
    /// Delegations
    pub delegations: Vec<Delegation>,
    /// Pending unbondings
    #[serde(default)]
    pub unbonding_delegations: Vec<UnbondingDelegation>,
    /// Produced by export; hooks are not fired on import
    #[serde(default)]
    pub exported: bool,
}

impl GenesisState {
    fn validate(&self) -> Result<()> {
        self.params.validate()?;
        let mut operators = BTreeSet::new();
        let mut cons = BTreeSet::new();
        for validator in &self.validators {
            if !operators.insert(validator.operator) || !cons.insert(validator.cons_address()) {
                return Err(Error::Genesis(format!(
                    "duplicate validator in genesis state: {}",
                    validator.operator
                )));
            }
            if validator.jailed && validator.is_bonded() {
                return Err(Error::Genesis(format!(
                    "validator {} is bonded and jailed in genesis state",
                    validator.operator
                )));
            }
            if validator.delegator_shares.is_zero() && validator.status != BondStatus::Unbonding {
                return Err(Error::Genesis(format!(
                    "validator {} has zero delegator shares",
                    validator.operator
                )));
            }
        }
        for delegation in &self.delegations {
            if !operators.contains(&delegation.validator) {
                return Err(Error::Genesis(format!(
                    "delegation to unknown validator {}",
                    delegation.validator
                )));
            }
        }
        Ok(())
    }
}

/// Staking module
#[derive(Debug, Clone)]
pub struct StakingModule {
    keeper: StakingKeeper,
}

impl StakingModule {
    /// Wrap keeper
    pub fn new(keeper: StakingKeeper) -> Self {
        Self { keeper }
    }

    fn check_pools(&self, ctx: &mut Context<'_>) -> Result<Option<String>> {
        let keeper = &self.keeper;
        let denom = keeper.params(ctx)?.bond_denom;
        let mut bonded: u128 = 0;
        let mut not_bonded: u128 = 0;
        for validator in keeper.validators(ctx)? {
            if validator.is_bonded() {
                bonded = bonded.saturating_add(validator.tokens);
            } else {
                not_bonded = not_bonded.saturating_add(validator.tokens);
            }
        }
        for ubd in keeper.unbonding_delegations(ctx)? {
            for entry in &ubd.entries {
                not_bonded = not_bonded.saturating_add(entry.balance);
            }
        }

        let bonded_pool = keeper.supply.module_balance(ctx, BONDED_POOL)?.amount_of(&denom);
        let not_bonded_pool = keeper
            .supply
            .module_balance(ctx, NOT_BONDED_POOL)?
            .amount_of(&denom);

        Ok(if bonded_pool != bonded || not_bonded_pool != not_bonded {
            Some(format!(
                "pool balances mismatch: bonded pool {} vs tokens {}, not bonded pool {} vs tokens {}",
                bonded_pool, bonded, not_bonded_pool, not_bonded
            ))
        } else {
            None
        })
    }
}

impl AppModule for StakingModule {
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
        let keeper = &self.keeper;
        keeper.set_params(ctx, &state.params)?;

        // pool accounts exist before anything is bonded
        keeper.supply.module_account(ctx, BONDED_POOL)?;
        keeper.supply.module_account(ctx, NOT_BONDED_POOL)?;

        for validator in &state.validators {
            keeper.set_validator(ctx, validator)?;
            if validator.status == BondStatus::Unbonding {
                let queue_key = [
                    VALIDATOR_QUEUE_PREFIX,
                    &time_key(validator.unbonding_time),
                    validator.operator.as_bytes(),
                ]
                .concat();
                ctx.set(&keeper.key, &queue_key, Vec::new())?;
            }
            if let Some(hooks) = keeper.hooks().filter(|_| !state.exported) {
                hooks.after_validator_created(ctx, &validator.operator)?;
            }
        }

        for delegation in &state.delegations {
            let hooks = keeper.hooks().filter(|_| !state.exported);
            if let Some(hooks) = &hooks {
                hooks.before_delegation_created(ctx, &delegation.delegator, &delegation.validator)?;
            }
            keeper.set_delegation(ctx, delegation)?;
            if let Some(hooks) = &hooks {
                hooks.after_delegation_modified(ctx, &delegation.delegator, &delegation.validator)?;
            }
        }

        for ubd in &state.unbonding_delegations {
            keeper.set_unbonding_delegation(ctx, ubd)?;
            for entry in &ubd.entries {
                let queue_key = [
                    UNBONDING_QUEUE_PREFIX,
                    &time_key(entry.completion_time),
                    ubd.delegator.as_bytes(),
                    ubd.validator.as_bytes(),
                ]
                .concat();
                ctx.set(&keeper.key, &queue_key, Vec::new())?;
            }
        }

        // pool balances are asserted by the module-accounts invariant after genesis
        let updates = keeper.apply_and_return_validator_set_updates(ctx)?;
        tracing::info!(
            validators = state.validators.len(),
            updates = updates.len(),
            "Initialized staking"
        );
        Ok(updates)
    }

    fn export_genesis(&self, ctx: &mut Context<'_>) -> Result<Value> {
        to_json(&GenesisState {
            params: self.keeper.params(ctx)?,
            validators: self.keeper.validators(ctx)?,
            delegations: self.keeper.delegations(ctx)?,
            unbonding_delegations: self.keeper.unbonding_delegations(ctx)?,
            exported: true,
        })
    }

    fn message_types(&self) -> &'static [&'static str] {
        &[
            MsgCreateValidator::TYPE_URL,
            MsgDelegate::TYPE_URL,
            MsgUndelegate::TYPE_URL,
        ]
    }

    fn handle(&self, ctx: &mut Context<'_>, msg: &Msg) -> Result<Vec<u8>> {
        let denom = self.keeper.params(ctx)?.bond_denom;
        let check_denom = |coin: &Coin| {
            if coin.denom == denom {
                Ok(())
            } else {
                Err(Error::module(
                    MODULE_NAME,
                    5,
                    format!("invalid coin denomination: got {}, expected {}", coin.denom, denom),
                ))
            }
        };

        match msg {
            Msg::CreateValidator(msg) => {
                self.keeper.create_validator(ctx, msg)?;
                Ok(Vec::new())
            }
            Msg::Delegate(msg) => {
                check_denom(&msg.amount)?;
                self.keeper
                    .delegate(ctx, &msg.delegator, &msg.validator, msg.amount.amount)?;
                Ok(Vec::new())
            }
            Msg::Undelegate(msg) => {
                check_denom(&msg.amount)?;
                let completion = self
                    .keeper
                    .undelegate(ctx, &msg.delegator, &msg.validator, msg.amount.amount)?;
                Ok(completion.to_rfc3339().into_bytes())
            }
            other => Err(Error::UnknownRequest(format!(
                "unrecognized staking message type: {}",
                other.type_url()
            ))),
        }
    }

    fn query_route(&self) -> Option<&'static str> {
        Some(MODULE_NAME)
    }

    fn query(&self, ctx: &mut Context<'_>, path: &[&str], _data: &[u8]) -> Result<Value> {
        match path {
            ["validators"] => to_json(&self.keeper.validators(ctx)?),
            ["validator", operator] => {
                let operator = Address::from_hex(operator)?;
                to_json(&self.keeper.must_validator(ctx, &operator)?)
            }
            ["delegation", delegator, validator] => {
                let delegator = Address::from_hex(delegator)?;
                let validator = Address::from_hex(validator)?;
                to_json(&self.keeper.delegation(ctx, &delegator, &validator)?)
            }
            ["pool"] => {
                let denom = self.keeper.params(ctx)?.bond_denom;
                let bonded = self.keeper.bonded_tokens(ctx)?;
                let not_bonded = self
                    .keeper
                    .supply
                    .module_balance(ctx, NOT_BONDED_POOL)?
                    .amount_of(&denom);
                to_json(&serde_json::json!({
                    "bonded_tokens": bonded.to_string(),
                    "not_bonded_tokens": not_bonded.to_string(),
                }))
            }
            ["params"] => to_json(&self.keeper.params(ctx)?),
            _ => Err(Error::UnknownRequest(format!(
                "unknown staking query endpoint: {}",
                path.join("/")
            ))),
        }
    }

    fn register_invariants(&self, registry: &mut InvariantRegistry) {
        let module = self.clone();
        registry.register(MODULE_NAME, "module-accounts", move |ctx: &mut Context<'_>| {
            module.check_pools(ctx)
        });

        let keeper = self.keeper.clone();
        registry.register(MODULE_NAME, "delegator-shares", move |ctx: &mut Context<'_>| {
            let mut shares: BTreeMap<Address, Decimal> = BTreeMap::new();
            for delegation in keeper.delegations(ctx)? {
                *shares.entry(delegation.validator).or_insert(Decimal::ZERO) += delegation.shares;
            }
            for validator in keeper.validators(ctx)? {
                let total = shares.get(&validator.operator).copied().unwrap_or(Decimal::ZERO);
                if total != validator.delegator_shares {
                    return Ok(Some(format!(
                        "validator {} has {} shares but delegations sum to {}",
                        validator.operator, validator.delegator_shares, total
                    )));
                }
            }
            Ok(None)
        });
    }

    fn as_end_blocker(&self) -> Option<&dyn EndBlocker> {
        Some(self)
    }
}

impl EndBlocker for StakingModule {
    fn end_block(&self, ctx: &mut Context<'_>, req: &RequestEndBlock) -> Result<Vec<ValidatorUpdate>> {
        let touched = ctx.prefix_scan(&self.keeper.tkey, TOUCHED_PREFIX)?.len();
        let updates = self.keeper.apply_and_return_validator_set_updates(ctx)?;
        self.keeper.unbond_matured_validators(ctx)?;
        self.keeper.complete_matured_unbondings(ctx)?;

        if !updates.is_empty() || touched > 0 {
            tracing::debug!(height = req.height, touched, updates = updates.len(), "Staking end block");
        }
        Ok(updates)
    }
}
