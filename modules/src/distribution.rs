//! Fee and reward distribution
//!
//! Collected fees (and minted provisions, which mint forwards to the fee
//! collector) are split at the start of the next block: a proposer bonus,
//! a community tax and the rest pro rata to the validators that voted.
//! Each validator's share is further split into commission and delegator
//! rewards.
//!
//! Delegator rewards use cumulative reward-per-token ratios indexed by
//! validator period, so a withdrawal costs O(slashes) instead of O(blocks).
//!
//! # Invariants
//!
//! - The module account holds exactly the truncated sum of the community
//!   pool and every validator's outstanding rewards

use crate::{
    abci::{RequestBeginBlock, ValidatorUpdate},
    auth::FEE_COLLECTOR,
    module::{parse_genesis, to_json, AppModule, BeginBlocker, DeliverGenesisTx, InvariantRegistry},
    msgs::{Msg, MsgDefinition},
    params::Subspace,
    staking::{StakingHooks, StakingKeeper, Validator},
    supply::SupplyKeeper,
    types::{dec_from_amount, Address, Coins, DecCoins},
    Error, Result,
};
use chain_store::{Context, Event, StoreKey};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Module name
pub const MODULE_NAME: &str = "distribution";

/// Store key name
pub const STORE_KEY: &str = "distribution";

const FEE_POOL_KEY: &[u8] = &[0x00];
const PROPOSER_KEY: &[u8] = &[0x01];
const OUTSTANDING_PREFIX: &[u8] = &[0x02];
const STARTING_INFO_PREFIX: &[u8] = &[0x04];
const HISTORICAL_PREFIX: &[u8] = &[0x05];
const CURRENT_PREFIX: &[u8] = &[0x06];
const COMMISSION_PREFIX: &[u8] = &[0x07];
const SLASH_EVENT_PREFIX: &[u8] = &[0x08];
const PARAMS_KEY: &str = "params";

/// Distribution parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Share of fees sent to the community pool
    pub community_tax: Decimal,
    /// Proposer share regardless of votes
    pub base_proposer_reward: Decimal,
    /// Extra proposer share scaled by the fraction of power that voted
    pub bonus_proposer_reward: Decimal,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            community_tax: Decimal::new(2, 2),
            base_proposer_reward: Decimal::new(1, 2),
            bonus_proposer_reward: Decimal::new(4, 2),
        }
    }
}

impl Params {
    fn validate(&self) -> Result<()> {
        let shares = [self.community_tax, self.base_proposer_reward, self.bonus_proposer_reward];
        if shares.iter().any(|d| d.is_sign_negative() || *d > Decimal::ONE) {
            return Err(Error::Genesis("distribution rates must be between 0 and 1".into()));
        }
        if shares.iter().sum::<Decimal>() > Decimal::ONE {
            return Err(Error::Genesis(
                "sum of community tax and proposer rewards cannot exceed one".into(),
            ));
        }
        Ok(())
    }
}

/// Community pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeePool {
    /// Undistributed funds
    pub community_pool: DecCoins,
}

/// Rewards accumulated in the current period of a validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentRewards {
    /// Delegator share accumulated this period
    pub rewards: DecCoins,
    /// Current period number
    pub period: u64,
}

/// Where a delegation's reward accounting starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegatorStartingInfo {
    /// Last period closed before the delegation changed
    pub previous_period: u64,
    /// Tokens backing the delegation at that time
    pub stake: Decimal,
    /// Height of the change
    pub height: u64,
}

/// A slash that closed a validator period
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlashEvent {
    /// Period closed by the slash
    pub validator_period: u64,
    /// Fraction slashed
    pub fraction: Decimal,
}

/// Withdraw rewards of one delegation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgWithdrawDelegatorReward {
    /// Delegator account
    pub delegator: Address,
    /// Validator operator
    pub validator: Address,
}

impl MsgDefinition for MsgWithdrawDelegatorReward {
    const ROUTE: &'static str = MODULE_NAME;
    const TYPE_URL: &'static str = "/distribution.MsgWithdrawDelegatorReward";

    fn validate_basic(&self) -> Result<()> {
        Ok(())
    }

    fn signers(&self) -> Vec<Address> {
        vec![self.delegator]
    }
}

/// Withdraw accumulated commission of a validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgWithdrawValidatorCommission {
    /// Validator operator
    pub validator: Address,
}

impl MsgDefinition for MsgWithdrawValidatorCommission {
    const ROUTE: &'static str = MODULE_NAME;
    const TYPE_URL: &'static str = "/distribution.MsgWithdrawValidatorCommission";

    fn validate_basic(&self) -> Result<()> {
        Ok(())
    }

    fn signers(&self) -> Vec<Address> {
        vec![self.validator]
    }
}

/// Donate to the community pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgFundCommunityPool {
    /// Donor
    pub depositor: Address,
    /// Donation
    pub amount: Coins,
}

impl MsgDefinition for MsgFundCommunityPool {
    const ROUTE: &'static str = MODULE_NAME;
    const TYPE_URL: &'static str = "/distribution.MsgFundCommunityPool";

    fn validate_basic(&self) -> Result<()> {
        if self.amount.is_empty() {
            return Err(Error::InvalidCoins("donation must be positive".into()));
        }
        self.amount.validate()
    }

    fn signers(&self) -> Vec<Address> {
        vec![self.depositor]
    }
}

fn addr_key(prefix: &[u8], a: &Address) -> Vec<u8> {
    [prefix, a.as_bytes()].concat()
}

fn negative(what: &str) -> Error {
    Error::module(MODULE_NAME, 7, format!("negative {}", what))
}

/// Distribution keeper
#[derive(Debug, Clone)]
pub struct DistributionKeeper {
    key: StoreKey,
    space: Subspace,
    staking: StakingKeeper,
    supply: SupplyKeeper,
}

impl DistributionKeeper {
    /// Create keeper
    pub fn new(key: StoreKey, space: Subspace, staking: StakingKeeper, supply: SupplyKeeper) -> Self {
        Self {
            key,
            space,
            staking,
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

    /// Community pool
    pub fn fee_pool(&self, ctx: &mut Context<'_>) -> Result<FeePool> {
        Ok(ctx.get_value(&self.key, FEE_POOL_KEY)?.unwrap_or_default())
    }

    fn set_fee_pool(&self, ctx: &mut Context<'_>, pool: &FeePool) -> Result<()> {
        Ok(ctx.set_value(&self.key, FEE_POOL_KEY, pool)?)
    }

    fn add_to_community_pool(&self, ctx: &mut Context<'_>, amount: &DecCoins) -> Result<()> {
        if amount.is_empty() {
            return Ok(());
        }
        let mut pool = self.fee_pool(ctx)?;
        pool.community_pool = pool.community_pool.checked_add(amount)?;
        self.set_fee_pool(ctx, &pool)
    }

    /// Consensus address of the previous block's proposer
    pub fn previous_proposer(&self, ctx: &mut Context<'_>) -> Result<Option<Address>> {
        Ok(ctx.get_value(&self.key, PROPOSER_KEY)?)
    }

    fn set_previous_proposer(&self, ctx: &mut Context<'_>, cons: &Address) -> Result<()> {
        Ok(ctx.set_value(&self.key, PROPOSER_KEY, cons)?)
    }

    /// Rewards not yet withdrawn from a validator, commission included
    pub fn outstanding_rewards(&self, ctx: &mut Context<'_>, operator: &Address) -> Result<DecCoins> {
        Ok(ctx
            .get_value(&self.key, &addr_key(OUTSTANDING_PREFIX, operator))?
            .unwrap_or_default())
    }

    fn set_outstanding_rewards(&self, ctx: &mut Context<'_>, operator: &Address, rewards: &DecCoins) -> Result<()> {
        Ok(ctx.set_value(&self.key, &addr_key(OUTSTANDING_PREFIX, operator), rewards)?)
    }

    /// Commission accumulated by a validator
    pub fn accumulated_commission(&self, ctx: &mut Context<'_>, operator: &Address) -> Result<DecCoins> {
        Ok(ctx
            .get_value(&self.key, &addr_key(COMMISSION_PREFIX, operator))?
            .unwrap_or_default())
    }

    fn set_accumulated_commission(&self, ctx: &mut Context<'_>, operator: &Address, commission: &DecCoins) -> Result<()> {
        Ok(ctx.set_value(&self.key, &addr_key(COMMISSION_PREFIX, operator), commission)?)
    }

    fn current_rewards(&self, ctx: &mut Context<'_>, operator: &Address) -> Result<CurrentRewards> {
        ctx.get_value(&self.key, &addr_key(CURRENT_PREFIX, operator))?
            .ok_or_else(|| Error::module(MODULE_NAME, 3, format!("no validator distribution info for {}", operator)))
    }

    fn historical_key(operator: &Address, period: u64) -> Vec<u8> {
        [HISTORICAL_PREFIX, operator.as_bytes(), &period.to_be_bytes()].concat()
    }

    fn historical_ratio(&self, ctx: &mut Context<'_>, operator: &Address, period: u64) -> Result<DecCoins> {
        Ok(ctx
            .get_value(&self.key, &Self::historical_key(operator, period))?
            .unwrap_or_default())
    }

    /// Set up reward records for a new validator
    pub fn initialize_validator(&self, ctx: &mut Context<'_>, operator: &Address) -> Result<()> {
        ctx.set_value(&self.key, &Self::historical_key(operator, 0), &DecCoins::empty())?;
        ctx.set_value(
            &self.key,
            &addr_key(CURRENT_PREFIX, operator),
            &CurrentRewards {
                rewards: DecCoins::empty(),
                period: 1,
            },
        )?;
        self.set_accumulated_commission(ctx, operator, &DecCoins::empty())?;
        self.set_outstanding_rewards(ctx, operator, &DecCoins::empty())
    }

    /// Close the current period, returning its number
    pub fn increment_validator_period(&self, ctx: &mut Context<'_>, validator: &Validator) -> Result<u64> {
        let operator = validator.operator;
        let current = self.current_rewards(ctx, &operator)?;

        let ratio = if validator.tokens == 0 {
            // nobody to pay; the accumulated share goes to the community
            let mut outstanding = self.outstanding_rewards(ctx, &operator)?;
            outstanding = outstanding
                .checked_sub(&current.rewards)
                .ok_or_else(|| negative("outstanding rewards"))?;
            self.set_outstanding_rewards(ctx, &operator, &outstanding)?;
            self.add_to_community_pool(ctx, &current.rewards)?;
            DecCoins::empty()
        } else {
            current.rewards.quo_dec(dec_from_amount(validator.tokens)?)?
        };

        let previous = self.historical_ratio(ctx, &operator, current.period - 1)?;
        ctx.set_value(
            &self.key,
            &Self::historical_key(&operator, current.period),
            &previous.checked_add(&ratio)?,
        )?;
        ctx.set_value(
            &self.key,
            &addr_key(CURRENT_PREFIX, &operator),
            &CurrentRewards {
                rewards: DecCoins::empty(),
                period: current.period + 1,
            },
        )?;
        Ok(current.period)
    }

    /// Record the start of a delegation's reward accounting
    pub fn initialize_delegation(&self, ctx: &mut Context<'_>, operator: &Address, delegator: &Address) -> Result<()> {
        let previous_period = self.current_rewards(ctx, operator)?.period - 1;
        let validator = self
            .staking
            .validator(ctx, operator)?
            .ok_or_else(|| Error::module(MODULE_NAME, 3, format!("validator {} does not exist", operator)))?;
        let delegation = self
            .staking
            .delegation(ctx, delegator, operator)?
            .ok_or_else(|| Error::module(MODULE_NAME, 2, "no delegation distribution info"))?;
        let stake = dec_from_amount(validator.tokens_from_shares(delegation.shares)?)?;

        let info = DelegatorStartingInfo {
            previous_period,
            stake,
            height: ctx.block_height(),
        };
        Ok(ctx.set_value(
            &self.key,
            &[STARTING_INFO_PREFIX, delegator.as_bytes(), operator.as_bytes()].concat(),
            &info,
        )?)
    }

    fn starting_info(
        &self,
        ctx: &mut Context<'_>,
        operator: &Address,
        delegator: &Address,
    ) -> Result<DelegatorStartingInfo> {
        ctx.get_value(
            &self.key,
            &[STARTING_INFO_PREFIX, delegator.as_bytes(), operator.as_bytes()].concat(),
        )?
        .ok_or_else(|| Error::module(MODULE_NAME, 2, "no delegation distribution info"))
    }

    fn rewards_between(
        &self,
        ctx: &mut Context<'_>,
        operator: &Address,
        start: u64,
        end: u64,
        stake: Decimal,
    ) -> Result<DecCoins> {
        let starting = self.historical_ratio(ctx, operator, start)?;
        let ending = self.historical_ratio(ctx, operator, end)?;
        ending
            .checked_sub(&starting)
            .ok_or_else(|| negative("reward ratio difference"))?
            .mul_dec(stake)
    }

    fn slash_events(&self, ctx: &mut Context<'_>, operator: &Address) -> Result<Vec<(u64, SlashEvent)>> {
        let prefix = addr_key(SLASH_EVENT_PREFIX, operator);
        ctx.scan_values::<SlashEvent>(&self.key, &prefix)?
            .into_iter()
            .map(|(key, event)| {
                let height = key
                    .get(prefix.len()..prefix.len() + 8)
                    .and_then(|b| <[u8; 8]>::try_from(b).ok())
                    .map(u64::from_be_bytes)
                    .ok_or_else(|| Error::Decode("malformed slash event key".into()))?;
                Ok((height, event))
            })
            .collect()
    }

    /// Rewards owed to a delegation up to `end_period`
    pub fn calculate_delegation_rewards(
        &self,
        ctx: &mut Context<'_>,
        operator: &Address,
        delegator: &Address,
        end_period: u64,
    ) -> Result<DecCoins> {
        let info = self.starting_info(ctx, operator, delegator)?;
        let mut start = info.previous_period;
        let mut stake = info.stake;
        let mut rewards = DecCoins::empty();

        let height = ctx.block_height();
        for (slash_height, event) in self.slash_events(ctx, operator)? {
            if slash_height <= info.height || slash_height > height {
                continue;
            }
            let end = event.validator_period;
            if end > start {
                rewards = rewards.checked_add(&self.rewards_between(ctx, operator, start, end, stake)?)?;
            }
            stake *= Decimal::ONE - event.fraction;
            start = end;
        }

        rewards.checked_add(&self.rewards_between(ctx, operator, start, end_period, stake)?)
    }

    /// Pay out a delegation's rewards; the caller re-initializes the delegation
    pub fn withdraw_delegation_rewards(
        &self,
        ctx: &mut Context<'_>,
        validator: &Validator,
        delegator: &Address,
    ) -> Result<Coins> {
        let operator = validator.operator;
        let end_period = self.increment_validator_period(ctx, validator)?;
        let owed = self.calculate_delegation_rewards(ctx, &operator, delegator, end_period)?;

        let outstanding = self.outstanding_rewards(ctx, &operator)?;
        let rewards = owed.intersect(&outstanding);
        let remaining = outstanding
            .checked_sub(&rewards)
            .ok_or_else(|| negative("outstanding rewards"))?;
        self.set_outstanding_rewards(ctx, &operator, &remaining)?;

        let (coins, change) = rewards.truncate();
        if !coins.is_empty() {
            self.supply
                .send_coins_from_module_to_account(ctx, MODULE_NAME, delegator, &coins)?;
        }
        self.add_to_community_pool(ctx, &change)?;

        ctx.delete(
            &self.key,
            &[STARTING_INFO_PREFIX, delegator.as_bytes(), operator.as_bytes()].concat(),
        )?;

        ctx.emit_event(
            Event::new("withdraw_rewards")
                .attr("validator", operator)
                .attr("delegator", delegator)
                .attr("amount", &coins),
        );
        Ok(coins)
    }

    /// Pay out a validator's commission
    pub fn withdraw_validator_commission(&self, ctx: &mut Context<'_>, operator: &Address) -> Result<Coins> {
        let commission = self.accumulated_commission(ctx, operator)?;
        let (coins, remainder) = commission.truncate();
        if coins.is_empty() {
            return Err(Error::module(MODULE_NAME, 4, "no validator commission to withdraw"));
        }
        self.set_accumulated_commission(ctx, operator, &remainder)?;

        let outstanding = self
            .outstanding_rewards(ctx, operator)?
            .checked_sub(&DecCoins::from_coins(&coins)?)
            .ok_or_else(|| negative("outstanding rewards"))?;
        self.set_outstanding_rewards(ctx, operator, &outstanding)?;

        self.supply
            .send_coins_from_module_to_account(ctx, MODULE_NAME, operator, &coins)?;
        ctx.emit_event(
            Event::new("withdraw_commission")
                .attr("validator", operator)
                .attr("amount", &coins),
        );
        Ok(coins)
    }

    /// Move funds from an account into the community pool
    pub fn fund_community_pool(&self, ctx: &mut Context<'_>, depositor: &Address, amount: &Coins) -> Result<()> {
        self.supply
            .send_coins_from_account_to_module(ctx, depositor, MODULE_NAME, amount)?;
        self.add_to_community_pool(ctx, &DecCoins::from_coins(amount)?)
    }

    /// Credit a validator with rewards, splitting off its commission
    pub fn allocate_tokens_to_validator(
        &self,
        ctx: &mut Context<'_>,
        validator: &Validator,
        tokens: &DecCoins,
    ) -> Result<()> {
        let operator = validator.operator;
        let commission = tokens.mul_dec(validator.commission_rate)?;
        let shared = tokens
            .checked_sub(&commission)
            .ok_or_else(|| negative("shared rewards"))?;

        let accumulated = self.accumulated_commission(ctx, &operator)?.checked_add(&commission)?;
        self.set_accumulated_commission(ctx, &operator, &accumulated)?;

        let mut current = self.current_rewards(ctx, &operator)?;
        current.rewards = current.rewards.checked_add(&shared)?;
        ctx.set_value(&self.key, &addr_key(CURRENT_PREFIX, &operator), &current)?;

        let outstanding = self.outstanding_rewards(ctx, &operator)?.checked_add(tokens)?;
        self.set_outstanding_rewards(ctx, &operator, &outstanding)
    }

    /// Distribute the fee collector balance among the previous block's voters
    pub fn allocate_tokens(
        &self,
        ctx: &mut Context<'_>,
        sum_precommit_power: u64,
        total_power: u64,
        proposer: &Address,
        votes: &[crate::abci::VoteInfo],
    ) -> Result<()> {
        let collected = self.supply.module_balance(ctx, FEE_COLLECTOR)?;
        if collected.is_empty() {
            return Ok(());
        }
        self.supply
            .send_coins_from_module_to_module(ctx, FEE_COLLECTOR, MODULE_NAME, &collected)?;
        let fees = DecCoins::from_coins(&collected)?;

        if total_power == 0 {
            return self.add_to_community_pool(ctx, &fees);
        }

        let params = self.params(ctx)?;
        let total = Decimal::from(total_power);
        let precommit_fraction = Decimal::from(sum_precommit_power) / total;
        let proposer_multiplier = params.base_proposer_reward + params.bonus_proposer_reward * precommit_fraction;

        let mut remaining = fees.clone();
        match self.staking.validator_by_cons_addr(ctx, proposer)? {
            Some(validator) => {
                let reward = fees.mul_dec(proposer_multiplier)?;
                self.allocate_tokens_to_validator(ctx, &validator, &reward)?;
                remaining = remaining
                    .checked_sub(&reward)
                    .ok_or_else(|| negative("remaining fees"))?;
                ctx.emit_event(
                    Event::new("proposer_reward")
                        .attr("validator", validator.operator)
                        .attr("amount", &reward),
                );
            }
            None => {
                tracing::warn!(
                    proposer = %proposer,
                    "Proposer validator not found, its reward goes to the community pool"
                );
            }
        }

        let vote_multiplier = Decimal::ONE - proposer_multiplier - params.community_tax;
        for vote in votes {
            let validator = match self.staking.validator_by_cons_addr(ctx, &vote.address)? {
                Some(v) => v,
                None => continue,
            };
            let power_fraction = Decimal::from(vote.power) / total;
            let reward = fees.mul_dec(vote_multiplier * power_fraction)?;
            self.allocate_tokens_to_validator(ctx, &validator, &reward)?;
            remaining = remaining
                .checked_sub(&reward)
                .ok_or_else(|| negative("remaining fees"))?;
        }

        self.add_to_community_pool(ctx, &remaining)
    }

    fn on_validator_slashed(&self, ctx: &mut Context<'_>, operator: &Address, fraction: Decimal) -> Result<()> {
        let validator = match self.staking.validator(ctx, operator)? {
            Some(v) => v,
            None => return Ok(()),
        };
        let period = self.increment_validator_period(ctx, &validator)?;
        let key = [
            SLASH_EVENT_PREFIX,
            operator.as_bytes(),
            &ctx.block_height().to_be_bytes(),
            &period.to_be_bytes(),
        ]
        .concat();
        Ok(ctx.set_value(
            &self.key,
            &key,
            &SlashEvent {
                validator_period: period,
                fraction,
            },
        )?)
    }

    fn on_validator_removed(&self, ctx: &mut Context<'_>, operator: &Address) -> Result<()> {
        let commission = self.accumulated_commission(ctx, operator)?;
        let leftover = self
            .outstanding_rewards(ctx, operator)?
            .checked_sub(&commission)
            .ok_or_else(|| negative("outstanding rewards"))?;

        let (coins, remainder) = commission.truncate();
        if !coins.is_empty() {
            self.supply
                .send_coins_from_module_to_account(ctx, MODULE_NAME, operator, &coins)?;
        }
        self.add_to_community_pool(ctx, &remainder.checked_add(&leftover)?)?;

        for prefix in [OUTSTANDING_PREFIX, COMMISSION_PREFIX, CURRENT_PREFIX] {
            ctx.delete(&self.key, &addr_key(prefix, operator))?;
        }
        for prefix in [HISTORICAL_PREFIX, SLASH_EVENT_PREFIX] {
            for (key, _) in ctx.prefix_scan(&self.key, &addr_key(prefix, operator))? {
                ctx.delete(&self.key, &key)?;
            }
        }
        Ok(())
    }

    fn module_holdings(&self, ctx: &mut Context<'_>) -> Result<DecCoins> {
        let mut holdings = self.fee_pool(ctx)?.community_pool;
        for (_, rewards) in ctx.scan_values::<DecCoins>(&self.key, OUTSTANDING_PREFIX)? {
            holdings = holdings.checked_add(&rewards)?;
        }
        Ok(holdings)
    }
}

/// Staking hooks keeping reward accounting in step with delegations
#[derive(Debug, Clone)]
pub struct DistributionHooks {
    keeper: DistributionKeeper,
}

impl DistributionHooks {
    /// Wrap keeper
    pub fn new(keeper: DistributionKeeper) -> Self {
        Self { keeper }
    }
}

impl StakingHooks for DistributionHooks {
    fn after_validator_created(&self, ctx: &mut Context<'_>, operator: &Address) -> Result<()> {
        self.keeper.initialize_validator(ctx, operator)
    }

    fn after_validator_removed(&self, ctx: &mut Context<'_>, _cons: &Address, operator: &Address) -> Result<()> {
        self.keeper.on_validator_removed(ctx, operator)
    }

    fn before_delegation_created(&self, ctx: &mut Context<'_>, _delegator: &Address, validator: &Address) -> Result<()> {
        if let Some(validator) = self.keeper.staking.validator(ctx, validator)? {
            self.keeper.increment_validator_period(ctx, &validator)?;
        }
        Ok(())
    }

    fn before_delegation_shares_modified(
        &self,
        ctx: &mut Context<'_>,
        delegator: &Address,
        validator: &Address,
    ) -> Result<()> {
        if let Some(validator) = self.keeper.staking.validator(ctx, validator)? {
            self.keeper.withdraw_delegation_rewards(ctx, &validator, delegator)?;
        }
        Ok(())
    }

    fn after_delegation_modified(&self, ctx: &mut Context<'_>, delegator: &Address, validator: &Address) -> Result<()> {
        self.keeper.initialize_delegation(ctx, validator, delegator)
    }

    fn before_validator_slashed(&self, ctx: &mut Context<'_>, operator: &Address, fraction: Decimal) -> Result<()> {
        self.keeper.on_validator_slashed(ctx, operator, fraction)
    }
}

/// Per-validator reward records in genesis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorRecord {
    /// Validator operator
    pub operator: Address,
    /// Outstanding rewards
    pub outstanding: DecCoins,
    /// Accumulated commission
    pub commission: DecCoins,
    /// Current period
    pub current: CurrentRewards,
    /// Cumulative ratios by period
    pub historical: Vec<(u64, DecCoins)>,
    /// Slash events as `(height, event)`
    pub slashes: Vec<(u64, SlashEvent)>,
}

/// Delegation starting point in genesis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartingInfoRecord {
    /// Delegator
    pub delegator: Address,
    /// Validator operator
    pub validator: Address,
    /// Starting info
    pub info: DelegatorStartingInfo,
}

/// Distribution genesis fragment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    /// Parameters
    pub params: Params,
    /// Community pool
    pub fee_pool: FeePool,
    /// Proposer of the last block
    #[serde(default)]
    pub previous_proposer: Option<Address>,
    /// Validator records
    #[serde(default)]
    pub validators: Vec<ValidatorRecord>,
    /// Delegation records
    #[serde(default)]
    pub starting_infos: Vec<StartingInfoRecord>,
}

/// Distribution module
#[derive(Debug, Clone)]
pub struct DistributionModule {
    keeper: DistributionKeeper,
}

impl DistributionModule {
    /// Wrap keeper
    pub fn new(keeper: DistributionKeeper) -> Self {
        Self { keeper }
    }

    fn check_module_account(&self, ctx: &mut Context<'_>) -> Result<Option<String>> {
        let (expected, _) = self.keeper.module_holdings(ctx)?.truncate();
        let balance = self.keeper.supply.module_balance(ctx, MODULE_NAME)?;
        Ok(if expected != balance {
            Some(format!(
                "distribution module balance {} does not match holdings {}",
                balance, expected
            ))
        } else {
            None
        })
    }
}

impl AppModule for DistributionModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn default_genesis(&self) -> Value {
        serde_json::to_value(GenesisState::default()).unwrap_or(Value::Null)
    }

    fn validate_genesis(&self, genesis: &Value) -> Result<()> {
        parse_genesis::<GenesisState>(MODULE_NAME, genesis)?.params.validate()
    }

    fn init_genesis(
        &self,
        ctx: &mut Context<'_>,
        genesis: &Value,
        _txs: &dyn DeliverGenesisTx,
    ) -> Result<Vec<ValidatorUpdate>> {
        let state: GenesisState = parse_genesis(MODULE_NAME, genesis)?;
        state.params.validate()?;
        let keeper = &self.keeper;
        keeper.set_params(ctx, &state.params)?;
        keeper.set_fee_pool(ctx, &state.fee_pool)?;
        if let Some(proposer) = &state.previous_proposer {
            keeper.set_previous_proposer(ctx, proposer)?;
        }

        for record in &state.validators {
            let op = &record.operator;
            keeper.set_outstanding_rewards(ctx, op, &record.outstanding)?;
            keeper.set_accumulated_commission(ctx, op, &record.commission)?;
            ctx.set_value(&keeper.key, &addr_key(CURRENT_PREFIX, op), &record.current)?;
            for (period, ratio) in &record.historical {
                ctx.set_value(&keeper.key, &DistributionKeeper::historical_key(op, *period), ratio)?;
            }
            for (height, event) in &record.slashes {
                let key = [
                    SLASH_EVENT_PREFIX,
                    op.as_bytes(),
                    &height.to_be_bytes(),
                    &event.validator_period.to_be_bytes(),
                ]
                .concat();
                ctx.set_value(&keeper.key, &key, event)?;
            }
        }
        for record in &state.starting_infos {
            let key = [
                STARTING_INFO_PREFIX,
                record.delegator.as_bytes(),
                record.validator.as_bytes(),
            ]
            .concat();
            ctx.set_value(&keeper.key, &key, &record.info)?;
        }

        keeper.supply.module_account(ctx, MODULE_NAME)?;
        if let Some(reason) = self.check_module_account(ctx)? {
            return Err(Error::Genesis(reason));
        }
        Ok(Vec::new())
    }

    fn export_genesis(&self, ctx: &mut Context<'_>) -> Result<Value> {
        let keeper = &self.keeper;
        let mut validators = Vec::new();
        for (key, current) in ctx.scan_values::<CurrentRewards>(&keeper.key, CURRENT_PREFIX)? {
            let operator = key
                .get(1..21)
                .and_then(|b| <[u8; 20]>::try_from(b).ok())
                .map(Address)
                .ok_or_else(|| Error::Decode("malformed distribution key".into()))?;
            let historical = ctx
                .scan_values::<DecCoins>(&keeper.key, &addr_key(HISTORICAL_PREFIX, &operator))?
                .into_iter()
                .filter_map(|(key, ratio)| {
                    let period = <[u8; 8]>::try_from(key.get(21..29)?).ok()?;
                    Some((u64::from_be_bytes(period), ratio))
                })
                .collect();
            validators.push(ValidatorRecord {
                operator,
                outstanding: keeper.outstanding_rewards(ctx, &operator)?,
                commission: keeper.accumulated_commission(ctx, &operator)?,
                current,
                historical,
                slashes: keeper.slash_events(ctx, &operator)?,
            });
        }

        let starting_infos = ctx
            .scan_values::<DelegatorStartingInfo>(&keeper.key, STARTING_INFO_PREFIX)?
            .into_iter()
            .filter_map(|(key, info)| {
                let delegator = Address(<[u8; 20]>::try_from(key.get(1..21)?).ok()?);
                let validator = Address(<[u8; 20]>::try_from(key.get(21..41)?).ok()?);
                Some(StartingInfoRecord {
                    delegator,
                    validator,
                    info,
                })
            })
            .collect();

        to_json(&GenesisState {
            params: keeper.params(ctx)?,
            fee_pool: keeper.fee_pool(ctx)?,
            previous_proposer: keeper.previous_proposer(ctx)?,
            validators,
            starting_infos,
        })
    }

    fn message_types(&self) -> &'static [&'static str] {
        &[
            MsgWithdrawDelegatorReward::TYPE_URL,
            MsgWithdrawValidatorCommission::TYPE_URL,
            MsgFundCommunityPool::TYPE_URL,
        ]
    }

    fn handle(&self, ctx: &mut Context<'_>, msg: &Msg) -> Result<Vec<u8>> {
        let keeper = &self.keeper;
        match msg {
            Msg::WithdrawDelegatorReward(msg) => {
                let validator = keeper.staking.validator(ctx, &msg.validator)?.ok_or_else(|| {
                    Error::module(MODULE_NAME, 3, format!("validator {} does not exist", msg.validator))
                })?;
                if keeper.staking.delegation(ctx, &msg.delegator, &msg.validator)?.is_none() {
                    return Err(Error::module(MODULE_NAME, 2, "no delegation distribution info"));
                }
                let coins = keeper.withdraw_delegation_rewards(ctx, &validator, &msg.delegator)?;
                keeper.initialize_delegation(ctx, &msg.validator, &msg.delegator)?;
                Ok(coins.to_string().into_bytes())
            }
            Msg::WithdrawValidatorCommission(msg) => {
                let coins = keeper.withdraw_validator_commission(ctx, &msg.validator)?;
                Ok(coins.to_string().into_bytes())
            }
            Msg::FundCommunityPool(msg) => {
                keeper.fund_community_pool(ctx, &msg.depositor, &msg.amount)?;
                Ok(Vec::new())
            }
            other => Err(Error::UnknownRequest(format!(
                "unrecognized distribution message type: {}",
                other.type_url()
            ))),
        }
    }

    fn query_route(&self) -> Option<&'static str> {
        Some(MODULE_NAME)
    }

    fn query(&self, ctx: &mut Context<'_>, path: &[&str], _data: &[u8]) -> Result<Value> {
        let keeper = &self.keeper;
        match path {
            ["params"] => to_json(&keeper.params(ctx)?),
            ["community_pool"] => to_json(&keeper.fee_pool(ctx)?.community_pool),
            ["outstanding_rewards", operator] => {
                let operator = Address::from_hex(operator)?;
                to_json(&keeper.outstanding_rewards(ctx, &operator)?)
            }
            ["commission", operator] => {
                let operator = Address::from_hex(operator)?;
                to_json(&keeper.accumulated_commission(ctx, &operator)?)
            }
            ["delegation_rewards", delegator, operator] => {
                let delegator = Address::from_hex(delegator)?;
                let operator = Address::from_hex(operator)?;
                let validator = keeper.staking.validator(ctx, &operator)?.ok_or_else(|| {
                    Error::module(MODULE_NAME, 3, format!("validator {} does not exist", operator))
                })?;
                // queries run on a discarded branch, closing the period is harmless
                let end = keeper.increment_validator_period(ctx, &validator)?;
                to_json(&keeper.calculate_delegation_rewards(ctx, &operator, &delegator, end)?)
            }
            _ => Err(Error::UnknownRequest(format!(
                "unknown distribution query endpoint: {}",
                path.join("/")
            ))),
        }
    }

    fn register_invariants(&self, registry: &mut InvariantRegistry) {
        let module = self.clone();
        registry.register(MODULE_NAME, "module-account", move |ctx: &mut Context<'_>| {
            module.check_module_account(ctx)
        });

        let keeper = self.keeper.clone();
        registry.register(MODULE_NAME, "nonnegative-outstanding", move |ctx: &mut Context<'_>| {
            for (_, rewards) in ctx.scan_values::<DecCoins>(&keeper.key, OUTSTANDING_PREFIX)? {
                if rewards.iter().any(|(_, amount)| amount.is_sign_negative()) {
                    return Ok(Some(format!("negative outstanding rewards: {}", rewards)));
                }
            }
            Ok(None)
        });
    }

    fn as_begin_blocker(&self) -> Option<&dyn BeginBlocker> {
        Some(self)
    }
}

impl BeginBlocker for DistributionModule {
    fn begin_block(&self, ctx: &mut Context<'_>, req: &RequestBeginBlock) -> Result<()> {
        let total_power: u64 = req.votes.iter().map(|v| v.power).sum();
        let precommit_power: u64 = req
            .votes
            .iter()
            .filter(|v| v.signed_last_block)
            .map(|v| v.power)
            .sum();

        if ctx.block_height() > 1 {
            if let Some(previous) = self.keeper.previous_proposer(ctx)? {
                self.keeper
                    .allocate_tokens(ctx, precommit_power, total_power, &previous, &req.votes)?;
            }
        }
        self.keeper.set_previous_proposer(ctx, &req.proposer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abci::VoteInfo;
    use crate::staking::MsgCreateValidator;
    use crate::testutil::{TestEnv, TestKeepers};
    use crate::types::{Coin, PubKey, NATIVE_DENOM};

    fn setup_validator(keepers: &TestKeepers, ctx: &mut Context<'_>, op: Address, rate: Decimal) -> Address {
        keepers.fund(ctx, op, 1000);
        let msg = MsgCreateValidator {
            operator: op,
            pub_key: PubKey([op.0[0]; 32]),
            moniker: "v".into(),
            commission_rate: rate,
            value: Coin::new(100, NATIVE_DENOM),
        };
        keepers.staking.create_validator(ctx, &msg).unwrap();
        keepers.staking.apply_and_return_validator_set_updates(ctx).unwrap();
        Address::from_public_key(&msg.pub_key)
    }

    #[test]
    fn test_allocate_and_withdraw() {
        let mut env = TestEnv::new();
        let keepers = env.keepers();
        keepers.bind_hooks();
        let mut ctx = env.ctx();

        let op = Address([1; 20]);
        let cons = setup_validator(&keepers, &mut ctx, op, Decimal::new(1, 1));

        keepers.fund(&mut ctx, Address::for_module(FEE_COLLECTOR), 1000);
        let votes = vec![VoteInfo {
            address: cons,
            power: 100,
            signed_last_block: true,
        }];
        keepers
            .distribution
            .allocate_tokens(&mut ctx, 100, 100, &cons, &votes)
            .unwrap();

        // 2% community tax, the rest to the single validator
        let pool = keepers.distribution.fee_pool(&mut ctx).unwrap().community_pool;
        assert_eq!(pool.amount_of(NATIVE_DENOM), Decimal::from(20));
        let outstanding = keepers.distribution.outstanding_rewards(&mut ctx, &op).unwrap();
        assert_eq!(outstanding.amount_of(NATIVE_DENOM), Decimal::from(980));
        let commission = keepers.distribution.accumulated_commission(&mut ctx, &op).unwrap();
        assert_eq!(commission.amount_of(NATIVE_DENOM), Decimal::from(98));

        let validator = keepers.staking.validator(&mut ctx, &op).unwrap().unwrap();
        let paid = keepers
            .distribution
            .withdraw_delegation_rewards(&mut ctx, &validator, &op)
            .unwrap();
        assert_eq!(paid, Coins::single(NATIVE_DENOM, 882));

        let commission = keepers
            .distribution
            .withdraw_validator_commission(&mut ctx, &op)
            .unwrap();
        assert_eq!(commission, Coins::single(NATIVE_DENOM, 98));

        let module = DistributionModule::new(keepers.distribution.clone());
        assert_eq!(module.check_module_account(&mut ctx).unwrap(), None);
    }

    #[test]
    fn test_delegation_change_withdraws_rewards() {
        let mut env = TestEnv::new();
        let keepers = env.keepers();
        keepers.bind_hooks();
        let mut ctx = env.ctx();

        let op = Address([1; 20]);
        let cons = setup_validator(&keepers, &mut ctx, op, Decimal::ZERO);
        keepers.fund(&mut ctx, Address::for_module(FEE_COLLECTOR), 100);
        keepers
            .distribution
            .allocate_tokens(&mut ctx, 0, 100, &cons, &[])
            .unwrap();

        let before = keepers.bank.balance(&mut ctx, &op).unwrap().amount_of(NATIVE_DENOM);
        keepers.staking.delegate(&mut ctx, &op, &op, 10).unwrap();
        let after = keepers.bank.balance(&mut ctx, &op).unwrap().amount_of(NATIVE_DENOM);
        // proposer share only: 1% base, no votes
        assert_eq!(after + 10 - before, 1);
    }

    #[test]
    fn test_fund_community_pool() {
        let mut env = TestEnv::new();
        let keepers = env.keepers();
        let module = DistributionModule::new(keepers.distribution.clone());
        let mut ctx = env.ctx();
        let donor = Address([7; 20]);
        keepers.fund(&mut ctx, donor, 50);

        let msg = Msg::FundCommunityPool(MsgFundCommunityPool {
            depositor: donor,
            amount: Coins::single(NATIVE_DENOM, 20),
        });
        module.handle(&mut ctx, &msg).unwrap();
        let pool = keepers.distribution.fee_pool(&mut ctx).unwrap().community_pool;
        assert_eq!(pool.amount_of(NATIVE_DENOM), Decimal::from(20));
        assert_eq!(module.check_module_account(&mut ctx).unwrap(), None);
    }

    #[test]
    fn test_commission_withdraw_empty_fails() {
        let mut env = TestEnv::new();
        let keepers = env.keepers();
        keepers.bind_hooks();
        let mut ctx = env.ctx();
        let op = Address([1; 20]);
        setup_validator(&keepers, &mut ctx, op, Decimal::new(1, 1));

        let err = keepers
            .distribution
            .withdraw_validator_commission(&mut ctx, &op)
            .unwrap_err();
        assert_eq!((err.codespace(), err.code()), (MODULE_NAME, 4));
    }
}
