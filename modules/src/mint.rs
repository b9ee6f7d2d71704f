//! Block provisions
//!
//! Inflation drifts toward `inflation_max` while the bonded ratio is under
//! `goal_bonded` and toward `inflation_min` above it. Every block mints
//! `annual_provisions / blocks_per_year` into the mint module account and
//! forwards it to the fee collector for distribution.

use crate::{
    abci::{RequestBeginBlock, ValidatorUpdate},
    auth::FEE_COLLECTOR,
    module::{parse_genesis, to_json, AppModule, BeginBlocker, DeliverGenesisTx},
    staking::StakingKeeper,
    supply::SupplyKeeper,
    types::{dec_from_amount, Coins, NATIVE_DENOM},
    Error, Result,
};
use chain_store::{Context, Event, StoreKey};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Module name
pub const MODULE_NAME: &str = "mint";

/// Store key name
pub const STORE_KEY: &str = "mint";

const MINTER_KEY: &[u8] = &[0x00];
const PARAMS_KEY: &str = "params";

/// Current inflation state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Minter {
    /// Annual inflation rate
    pub inflation: Decimal,
    /// Tokens minted per year at the current rate
    pub annual_provisions: Decimal,
}

impl Default for Minter {
    fn default() -> Self {
        Self {
            inflation: Decimal::new(13, 2),
            annual_provisions: Decimal::ZERO,
        }
    }
}

impl Minter {
    /// Inflation for the next block given the bonded ratio
    pub fn next_inflation_rate(&self, params: &Params, bonded_ratio: Decimal) -> Result<Decimal> {
        let per_year = bonded_ratio
            .checked_div(params.goal_bonded)
            .map(|ratio| (Decimal::ONE - ratio) * params.inflation_rate_change)
            .ok_or_else(|| Error::module(MODULE_NAME, 2, "goal bonded must be positive"))?;
        let per_block = per_year
            .checked_div(Decimal::from(params.blocks_per_year))
            .ok_or_else(|| Error::module(MODULE_NAME, 2, "blocks per year must be positive"))?;
        let next = self.inflation + per_block;
        Ok(next.max(params.inflation_min).min(params.inflation_max))
    }

    /// Annual provisions at the current inflation
    pub fn next_annual_provisions(&self, total_supply: u128) -> Result<Decimal> {
        self.inflation
            .checked_mul(dec_from_amount(total_supply)?)
            .ok_or_else(|| Error::module(MODULE_NAME, 3, "annual provisions overflow"))
    }

    /// Tokens minted this block
    pub fn block_provision(&self, params: &Params) -> Result<Coins> {
        let amount = self
            .annual_provisions
            .checked_div(Decimal::from(params.blocks_per_year))
            .and_then(|v| v.trunc().to_u128())
            .ok_or_else(|| Error::module(MODULE_NAME, 2, "blocks per year must be positive"))?;
        Ok(Coins::single(params.mint_denom.clone(), amount))
    }
}

/// Mint parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Minted denomination
    pub mint_denom: String,
    /// Maximum yearly change of the inflation rate
    pub inflation_rate_change: Decimal,
    /// Inflation ceiling
    pub inflation_max: Decimal,
    /// Inflation floor
    pub inflation_min: Decimal,
    /// Target bonded ratio
    pub goal_bonded: Decimal,
    /// Expected blocks per year
    pub blocks_per_year: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            mint_denom: NATIVE_DENOM.to_string(),
            inflation_rate_change: Decimal::new(13, 2),
            inflation_max: Decimal::new(20, 2),
            inflation_min: Decimal::new(7, 2),
            goal_bonded: Decimal::new(67, 2),
            blocks_per_year: 60 * 60 * 8766 / 5,
        }
    }
}

impl Params {
    fn validate(&self) -> Result<()> {
        crate::types::validate_denom(&self.mint_denom)?;
        if self.inflation_min.is_sign_negative() || self.inflation_max < self.inflation_min {
            return Err(Error::Genesis(format!(
                "invalid inflation bounds: min {} max {}",
                self.inflation_min, self.inflation_max
            )));
        }
        if self.goal_bonded <= Decimal::ZERO || self.goal_bonded > Decimal::ONE {
            return Err(Error::Genesis(format!("goal bonded out of range: {}", self.goal_bonded)));
        }
        if self.blocks_per_year == 0 {
            return Err(Error::Genesis("blocks per year must be positive".into()));
        }
        Ok(())
    }
}

/// Mint keeper
#[derive(Debug, Clone)]
pub struct MintKeeper {
    key: StoreKey,
    space: crate::params::Subspace,
    staking: StakingKeeper,
    supply: SupplyKeeper,
}

impl MintKeeper {
    /// Create keeper
    pub fn new(
        key: StoreKey,
        space: crate::params::Subspace,
        staking: StakingKeeper,
        supply: SupplyKeeper,
    ) -> Self {
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

    /// Current minter
    pub fn minter(&self, ctx: &mut Context<'_>) -> Result<Minter> {
        Ok(ctx.get_value(&self.key, MINTER_KEY)?.unwrap_or_default())
    }

    /// Replace minter
    pub fn set_minter(&self, ctx: &mut Context<'_>, minter: &Minter) -> Result<()> {
        Ok(ctx.set_value(&self.key, MINTER_KEY, minter)?)
    }
}

/// Mint genesis fragment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    /// Inflation state
    pub minter: Minter,
    /// Parameters
    pub params: Params,
}

/// Mint module
#[derive(Debug, Clone)]
pub struct MintModule {
    keeper: MintKeeper,
}

impl MintModule {
    /// Wrap keeper
    pub fn new(keeper: MintKeeper) -> Self {
        Self { keeper }
    }
}

impl AppModule for MintModule {
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
        self.keeper.set_minter(ctx, &state.minter)?;
        self.keeper.set_params(ctx, &state.params)?;
        Ok(Vec::new())
    }

    fn export_genesis(&self, ctx: &mut Context<'_>) -> Result<Value> {
        to_json(&GenesisState {
            minter: self.keeper.minter(ctx)?,
            params: self.keeper.params(ctx)?,
        })
    }

    fn query_route(&self) -> Option<&'static str> {
        Some(MODULE_NAME)
    }

    fn query(&self, ctx: &mut Context<'_>, path: &[&str], _data: &[u8]) -> Result<Value> {
        match path {
            ["params"] => to_json(&self.keeper.params(ctx)?),
            ["inflation"] => to_json(&self.keeper.minter(ctx)?.inflation),
            ["annual_provisions"] => to_json(&self.keeper.minter(ctx)?.annual_provisions),
            _ => Err(Error::UnknownRequest(format!(
                "unknown mint query endpoint: {}",
                path.join("/")
            ))),
        }
    }

    fn as_begin_blocker(&self) -> Option<&dyn BeginBlocker> {
        Some(self)
    }
}

impl BeginBlocker for MintModule {
    fn begin_block(&self, ctx: &mut Context<'_>, _req: &RequestBeginBlock) -> Result<()> {
        let keeper = &self.keeper;
        let params = keeper.params(ctx)?;
        let mut minter = keeper.minter(ctx)?;

        let bonded_ratio = keeper.staking.bonded_ratio(ctx)?;
        let total_supply = keeper.supply.supply(ctx)?.amount_of(&params.mint_denom);
        minter.inflation = minter.next_inflation_rate(&params, bonded_ratio)?;
        minter.annual_provisions = minter.next_annual_provisions(total_supply)?;
        keeper.set_minter(ctx, &minter)?;

        let minted = minter.block_provision(&params)?;
        if minted.is_empty() {
            return Ok(());
        }
        keeper.supply.mint_coins(ctx, MODULE_NAME, &minted)?;
        keeper
            .supply
            .send_coins_from_module_to_module(ctx, MODULE_NAME, FEE_COLLECTOR, &minted)?;

        ctx.emit_event(
            Event::new("mint")
                .attr("bonded_ratio", bonded_ratio)
                .attr("inflation", minter.inflation)
                .attr("annual_provisions", minter.annual_provisions)
                .attr("amount", &minted),
        );
        tracing::trace!(height = ctx.block_height(), minted = %minted, "Minted block provision");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestEnv;

    #[test]
    fn test_inflation_moves_toward_bounds() {
        let params = Params::default();
        let minter = Minter::default();

        let low_bonded = minter.next_inflation_rate(&params, Decimal::ZERO).unwrap();
        assert!(low_bonded > minter.inflation);

        let high_bonded = minter.next_inflation_rate(&params, Decimal::ONE).unwrap();
        assert!(high_bonded < minter.inflation);

        let capped = Minter {
            inflation: params.inflation_max,
            annual_provisions: Decimal::ZERO,
        };
        assert_eq!(capped.next_inflation_rate(&params, Decimal::ZERO).unwrap(), params.inflation_max);
    }

    #[test]
    fn test_begin_block_mints_to_fee_collector() {
        let mut env = TestEnv::new();
        let keepers = env.keepers();
        let module = MintModule::new(keepers.mint.clone());
        let mut ctx = env.ctx();

        let params = Params {
            blocks_per_year: 10,
            ..Params::default()
        };
        keepers.mint.set_params(&mut ctx, &params).unwrap();
        keepers.supply.mint_coins(&mut ctx, MODULE_NAME, &Coins::single(NATIVE_DENOM, 1_000_000)).unwrap();

        module.begin_block(&mut ctx, &RequestBeginBlock::default()).unwrap();

        let minter = keepers.mint.minter(&mut ctx).unwrap();
        assert!(minter.annual_provisions > Decimal::ZERO);
        let fees = keepers.supply.module_balance(&mut ctx, FEE_COLLECTOR).unwrap();
        assert_eq!(fees, minter.block_provision(&params).unwrap());
        assert!(ctx.events().iter().any(|e| e.kind == "mint"));
    }
}
