//! Liveness and double-sign penalties
//!
//! Every bonded validator has a signing record with a sliding window of
//! missed blocks. Falling below `min_signed_per_window` slashes and jails
//! the validator for `downtime_jail_duration`. Double-sign evidence slashes,
//! jails and tombstones it for good.

use crate::{
    abci::{Evidence, EvidenceKind, RequestBeginBlock, ValidatorUpdate},
    module::{parse_genesis, to_json, AppModule, BeginBlocker, DeliverGenesisTx},
    msgs::{Msg, MsgDefinition},
    params::Subspace,
    staking::{time_after, BondStatus, StakingHooks, StakingKeeper},
    types::Address,
    Error, Result,
};
use chain_store::{Context, Event, StoreKey};
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Module name
pub const MODULE_NAME: &str = "slashing";

/// Store key name
pub const STORE_KEY: &str = "slashing";

const SIGNING_INFO_PREFIX: &[u8] = &[0x01];
const MISSED_BLOCK_PREFIX: &[u8] = &[0x02];
const PARAMS_KEY: &str = "params";

/// Blocks between a validator set change and it taking effect
const VALIDATOR_UPDATE_DELAY: u64 = 1;

fn tombstone_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(9999, 12, 31, 23, 59, 59)
        .single()
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Slashing parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Params {
    /// Blocks in the liveness window
    pub signed_blocks_window: u64,
    /// Minimum fraction of the window that must be signed
    pub min_signed_per_window: Decimal,
    /// Jail time for downtime, seconds
    pub downtime_jail_duration_secs: u64,
    /// Slash fraction for double signing
    pub slash_fraction_double_sign: Decimal,
    /// Slash fraction for downtime
    pub slash_fraction_downtime: Decimal,
    /// Evidence older than this is ignored, seconds
    pub max_evidence_age_secs: u64,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            signed_blocks_window: 100,
            min_signed_per_window: Decimal::new(5, 1),
            downtime_jail_duration_secs: 600,
            slash_fraction_double_sign: Decimal::new(5, 2),
            slash_fraction_downtime: Decimal::new(1, 2),
            max_evidence_age_secs: 3 * 7 * 24 * 3600,
        }
    }
}

impl Params {
    fn validate(&self) -> Result<()> {
        if self.signed_blocks_window == 0 {
            return Err(Error::Genesis("signed blocks window must be positive".into()));
        }
        for (name, value) in [
            ("min signed per window", self.min_signed_per_window),
            ("double sign slash fraction", self.slash_fraction_double_sign),
            ("downtime slash fraction", self.slash_fraction_downtime),
        ] {
            if value.is_sign_negative() || value > Decimal::ONE {
                return Err(Error::Genesis(format!("{} must be between 0 and 1: {}", name, value)));
            }
        }
        Ok(())
    }

    /// Missed blocks tolerated inside one window
    pub fn max_missed_blocks(&self) -> u64 {
        let window = Decimal::from(self.signed_blocks_window);
        let min_signed = (window * self.min_signed_per_window).trunc().to_u64().unwrap_or(0);
        self.signed_blocks_window.saturating_sub(min_signed)
    }
}

/// Liveness record of one validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSigningInfo {
    /// Consensus address
    pub address: Address,
    /// Height the validator was first bonded
    pub start_height: u64,
    /// Position in the missed-block window
    pub index_offset: u64,
    /// Earliest time an unjail is accepted
    pub jailed_until: DateTime<Utc>,
    /// Permanently banned after double signing
    pub tombstoned: bool,
    /// Blocks missed in the current window
    pub missed_blocks_counter: u64,
}

/// Leave jail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgUnjail {
    /// Validator operator
    pub validator: Address,
}

impl MsgDefinition for MsgUnjail {
    const ROUTE: &'static str = MODULE_NAME;
    const TYPE_URL: &'static str = "/slashing.MsgUnjail";

    fn validate_basic(&self) -> Result<()> {
        Ok(())
    }

    fn signers(&self) -> Vec<Address> {
        vec![self.validator]
    }
}

/// Slashing keeper
#[derive(Debug, Clone)]
pub struct SlashingKeeper {
    key: StoreKey,
    space: Subspace,
    staking: StakingKeeper,
}

impl SlashingKeeper {
    /// Create keeper
    pub fn new(key: StoreKey, space: Subspace, staking: StakingKeeper) -> Self {
        Self { key, space, staking }
    }

    /// Parameters
    pub fn params(&self, ctx: &mut Context<'_>) -> Result<Params> {
        self.space.get_or_default(ctx, PARAMS_KEY)
    }

    /// Replace parameters
    pub fn set_params(&self, ctx: &mut Context<'_>, params: &Params) -> Result<()> {
        self.space.set(ctx, PARAMS_KEY, params)
    }

    /// Signing record of a consensus address
    pub fn signing_info(&self, ctx: &mut Context<'_>, cons: &Address) -> Result<Option<ValidatorSigningInfo>> {
        Ok(ctx.get_value(&self.key, &[SIGNING_INFO_PREFIX, cons.as_bytes()].concat())?)
    }

    /// Store a signing record
    pub fn set_signing_info(&self, ctx: &mut Context<'_>, info: &ValidatorSigningInfo) -> Result<()> {
        Ok(ctx.set_value(
            &self.key,
            &[SIGNING_INFO_PREFIX, info.address.as_bytes()].concat(),
            info,
        )?)
    }

    /// Every signing record
    pub fn signing_infos(&self, ctx: &mut Context<'_>) -> Result<Vec<ValidatorSigningInfo>> {
        Ok(ctx
            .scan_values::<ValidatorSigningInfo>(&self.key, SIGNING_INFO_PREFIX)?
            .into_iter()
            .map(|(_, info)| info)
            .collect())
    }

    fn missed_key(cons: &Address, index: u64) -> Vec<u8> {
        [MISSED_BLOCK_PREFIX, cons.as_bytes(), &index.to_be_bytes()].concat()
    }

    fn missed(&self, ctx: &mut Context<'_>, cons: &Address, index: u64) -> Result<bool> {
        Ok(ctx.has(&self.key, &Self::missed_key(cons, index))?)
    }

    fn set_missed(&self, ctx: &mut Context<'_>, cons: &Address, index: u64, missed: bool) -> Result<()> {
        let key = Self::missed_key(cons, index);
        if missed {
            ctx.set(&self.key, &key, vec![1])?;
        } else {
            ctx.delete(&self.key, &key)?;
        }
        Ok(())
    }

    /// Window indices currently marked missed
    pub fn missed_indices(&self, ctx: &mut Context<'_>, cons: &Address) -> Result<Vec<u64>> {
        let prefix = [MISSED_BLOCK_PREFIX, cons.as_bytes()].concat();
        Ok(ctx
            .prefix_scan(&self.key, &prefix)?
            .into_iter()
            .filter_map(|(key, _)| {
                let bytes = <[u8; 8]>::try_from(key.get(prefix.len()..)?).ok()?;
                Some(u64::from_be_bytes(bytes))
            })
            .collect())
    }

    fn clear_missed(&self, ctx: &mut Context<'_>, cons: &Address) -> Result<()> {
        for index in self.missed_indices(ctx, cons)? {
            self.set_missed(ctx, cons, index, false)?;
        }
        Ok(())
    }

    /// Create a signing record if none exists
    pub fn ensure_signing_info(&self, ctx: &mut Context<'_>, cons: &Address) -> Result<()> {
        if self.signing_info(ctx, cons)?.is_some() {
            return Ok(());
        }
        let info = ValidatorSigningInfo {
            address: *cons,
            start_height: ctx.block_height(),
            index_offset: 0,
            jailed_until: DateTime::<Utc>::default(),
            tombstoned: false,
            missed_blocks_counter: 0,
        };
        self.set_signing_info(ctx, &info)
    }

    /// Record one block's signature of a validator
    pub fn handle_validator_signature(
        &self,
        ctx: &mut Context<'_>,
        cons: &Address,
        power: u64,
        signed: bool,
    ) -> Result<()> {
        let params = self.params(ctx)?;
        let height = ctx.block_height();
        let mut info = self.signing_info(ctx, cons)?.ok_or_else(|| {
            Error::module(MODULE_NAME, 8, format!("no signing info found for {}", cons))
        })?;

        let index = info.index_offset % params.signed_blocks_window;
        info.index_offset += 1;

        let previously_missed = self.missed(ctx, cons, index)?;
        let missed = !signed;
        if !previously_missed && missed {
            self.set_missed(ctx, cons, index, true)?;
            info.missed_blocks_counter += 1;
        } else if previously_missed && !missed {
            self.set_missed(ctx, cons, index, false)?;
            info.missed_blocks_counter = info.missed_blocks_counter.saturating_sub(1);
        }

        if missed {
            ctx.emit_event(
                Event::new("liveness")
                    .attr("address", cons)
                    .attr("missed_blocks", info.missed_blocks_counter)
                    .attr("height", height),
            );
            tracing::debug!(
                cons = %cons,
                missed = info.missed_blocks_counter,
                height,
                "Validator missed block"
            );
        }

        let min_height = info.start_height + params.signed_blocks_window;
        if height > min_height && info.missed_blocks_counter > params.max_missed_blocks() {
            if let Some(validator) = self.staking.validator_by_cons_addr(ctx, cons)? {
                if !validator.jailed {
                    let infraction_height = height.saturating_sub(VALIDATOR_UPDATE_DELAY + 1);
                    self.staking
                        .slash(ctx, cons, infraction_height, power, params.slash_fraction_downtime)?;
                    self.staking.jail(ctx, cons)?;

                    info.jailed_until = time_after(ctx.block_time(), params.downtime_jail_duration_secs)?;
                    info.missed_blocks_counter = 0;
                    info.index_offset = 0;
                    self.clear_missed(ctx, cons)?;

                    ctx.emit_event(
                        Event::new("slash")
                            .attr("address", cons)
                            .attr("power", power)
                            .attr("reason", "missing_signature")
                            .attr("jailed", cons),
                    );
                    tracing::warn!(
                        cons = %cons,
                        height,
                        min_height,
                        "Validator jailed for downtime"
                    );
                }
            }
        }

        self.set_signing_info(ctx, &info)
    }

    /// Punish double signing
    pub fn handle_double_sign(&self, ctx: &mut Context<'_>, evidence: &Evidence) -> Result<()> {
        let params = self.params(ctx)?;
        let cons = &evidence.address;

        let validator = match self.staking.validator_by_cons_addr(ctx, cons)? {
            Some(v) if v.status != BondStatus::Unbonded => v,
            _ => {
                tracing::debug!(cons = %cons, "Ignored double sign of unknown or unbonded validator");
                return Ok(());
            }
        };

        let age = ctx.block_time().signed_duration_since(evidence.time);
        if age.num_seconds() > i64::try_from(params.max_evidence_age_secs).unwrap_or(i64::MAX) {
            tracing::info!(cons = %cons, age_secs = age.num_seconds(), "Ignored expired double sign evidence");
            return Ok(());
        }

        let mut info = self.signing_info(ctx, cons)?.ok_or_else(|| {
            Error::module(MODULE_NAME, 8, format!("no signing info found for {}", cons))
        })?;
        if info.tombstoned {
            tracing::info!(cons = %cons, "Ignored double sign of tombstoned validator");
            return Ok(());
        }

        let infraction_height = evidence.height.saturating_sub(VALIDATOR_UPDATE_DELAY);
        self.staking.slash(
            ctx,
            cons,
            infraction_height,
            evidence.power,
            params.slash_fraction_double_sign,
        )?;
        if !validator.jailed {
            self.staking.jail(ctx, cons)?;
        }

        info.jailed_until = tombstone_time();
        info.tombstoned = true;
        self.set_signing_info(ctx, &info)?;

        ctx.emit_event(
            Event::new("slash")
                .attr("address", cons)
                .attr("power", evidence.power)
                .attr("reason", "double_sign")
                .attr("jailed", cons),
        );
        tracing::warn!(cons = %cons, height = evidence.height, "Validator tombstoned for double signing");
        Ok(())
    }

    /// Release a jailed validator
    pub fn unjail(&self, ctx: &mut Context<'_>, operator: &Address) -> Result<()> {
        let validator = self.staking.validator(ctx, operator)?.ok_or_else(|| {
            Error::module(MODULE_NAME, 2, format!("no validator for address {}", operator))
        })?;
        if self.staking.delegation(ctx, operator, operator)?.is_none() {
            return Err(Error::module(MODULE_NAME, 6, "validator has no self-delegation"));
        }
        if !validator.jailed {
            return Err(Error::module(MODULE_NAME, 5, "validator not jailed; cannot be unjailed"));
        }

        let cons = validator.cons_address();
        let info = self.signing_info(ctx, &cons)?.ok_or_else(|| {
            Error::module(MODULE_NAME, 8, format!("no signing info found for {}", cons))
        })?;
        if info.tombstoned || ctx.block_time() < info.jailed_until {
            return Err(Error::module(MODULE_NAME, 4, "validator still jailed; cannot be unjailed"));
        }

        self.staking.unjail(ctx, &cons)
    }
}

/// Staking hooks creating signing records
#[derive(Debug, Clone)]
pub struct SlashingHooks {
    keeper: SlashingKeeper,
}

impl SlashingHooks {
    /// Wrap keeper
    pub fn new(keeper: SlashingKeeper) -> Self {
        Self { keeper }
    }
}

impl StakingHooks for SlashingHooks {
    fn after_validator_bonded(&self, ctx: &mut Context<'_>, cons: &Address, _operator: &Address) -> Result<()> {
        self.keeper.ensure_signing_info(ctx, cons)
    }
}

/// Missed window indices of one validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissedBlocks {
    /// Consensus address
    pub address: Address,
    /// Missed window positions
    pub indices: Vec<u64>,
}

/// Slashing genesis fragment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    /// Parameters
    pub params: Params,
    /// Signing records
    #[serde(default)]
    pub signing_infos: Vec<ValidatorSigningInfo>,
    /// Missed-block windows
    #[serde(default)]
    pub missed_blocks: Vec<MissedBlocks>,
}

/// Slashing module
#[derive(Debug, Clone)]
pub struct SlashingModule {
    keeper: SlashingKeeper,
}

impl SlashingModule {
    /// Wrap keeper
    pub fn new(keeper: SlashingKeeper) -> Self {
        Self { keeper }
    }
}

impl AppModule for SlashingModule {
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

        for info in &state.signing_infos {
            keeper.set_signing_info(ctx, info)?;
        }
        for missed in &state.missed_blocks {
            for index in &missed.indices {
                keeper.set_missed(ctx, &missed.address, *index, true)?;
            }
        }
        for validator in keeper.staking.bonded_validators(ctx)? {
            keeper.ensure_signing_info(ctx, &validator.cons_address())?;
        }
        Ok(Vec::new())
    }

    fn export_genesis(&self, ctx: &mut Context<'_>) -> Result<Value> {
        let keeper = &self.keeper;
        let signing_infos = keeper.signing_infos(ctx)?;
        let mut missed_blocks = Vec::new();
        for info in &signing_infos {
            let indices = keeper.missed_indices(ctx, &info.address)?;
            if !indices.is_empty() {
                missed_blocks.push(MissedBlocks {
                    address: info.address,
                    indices,
                });
            }
        }
        to_json(&GenesisState {
            params: keeper.params(ctx)?,
            signing_infos,
            missed_blocks,
        })
    }

    fn message_types(&self) -> &'static [&'static str] {
        &[MsgUnjail::TYPE_URL]
    }

    fn handle(&self, ctx: &mut Context<'_>, msg: &Msg) -> Result<Vec<u8>> {
        match msg {
            Msg::Unjail(msg) => {
                self.keeper.unjail(ctx, &msg.validator)?;
                ctx.emit_event(
                    Event::new("message")
                        .attr("module", MODULE_NAME)
                        .attr("sender", msg.validator),
                );
                Ok(Vec::new())
            }
            other => Err(Error::UnknownRequest(format!(
                "unrecognized slashing message type: {}",
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
            ["signing_infos"] => to_json(&self.keeper.signing_infos(ctx)?),
            ["signing_info", cons] => {
                let cons = Address::from_hex(cons)?;
                to_json(&self.keeper.signing_info(ctx, &cons)?)
            }
            _ => Err(Error::UnknownRequest(format!(
                "unknown slashing query endpoint: {}",
                path.join("/")
            ))),
        }
    }

    fn as_begin_blocker(&self) -> Option<&dyn BeginBlocker> {
        Some(self)
    }
}

impl BeginBlocker for SlashingModule {
    fn begin_block(&self, ctx: &mut Context<'_>, req: &RequestBeginBlock) -> Result<()> {
        for vote in &req.votes {
            self.keeper
                .handle_validator_signature(ctx, &vote.address, vote.power, vote.signed_last_block)?;
        }
        for evidence in &req.byzantine_validators {
            match evidence.kind {
                EvidenceKind::DuplicateVote => self.keeper.handle_double_sign(ctx, evidence)?,
            }
        }
        Ok(())
    }
}
