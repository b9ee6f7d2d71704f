//! Coordinated software upgrades
//!
//! A single [`Plan`] may be scheduled at a time. When the chain reaches the
//! plan height the running binary must either carry a handler registered
//! under the plan name, or list the height in its skip heights. Otherwise
//! block processing stops with [`Error::UpgradeRequired`] so operators can
//! swap binaries.
//!
//! Handlers are registered on the keeper during wiring, before it is shared.

use crate::{
    abci::ValidatorUpdate,
    module::{parse_genesis, to_json, AppModule, DeliverGenesisTx},
    msgs::{Msg, MsgDefinition},
    types::Address,
    Error, Result,
};
use chain_store::{Context, Event, StoreKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Module name
pub const MODULE_NAME: &str = "upgrade";

/// Store key name
pub const STORE_KEY: &str = "upgrade";

const PLAN_KEY: &[u8] = &[0x00];
const DONE_PREFIX: &[u8] = &[0x01];

/// Scheduled upgrade
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    /// Name the new binary registers its handler under
    pub name: String,
    /// Height at which the upgrade takes effect
    pub height: u64,
    /// Free-form operator information
    #[serde(default)]
    pub info: String,
}

impl Plan {
    fn validate_basic(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::ValidateBasic("upgrade plan name cannot be empty".into()));
        }
        if self.height == 0 {
            return Err(Error::ValidateBasic("upgrade plan height must be positive".into()));
        }
        Ok(())
    }
}

/// State migration run when a plan is reached
pub type UpgradeHandler = Arc<dyn Fn(&mut Context<'_>, &Plan) -> Result<()> + Send + Sync>;

/// Schedule a plan, replacing any pending one
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSoftwareUpgrade {
    /// Upgrade authority
    pub authority: Address,
    /// Plan
    pub plan: Plan,
}

impl MsgDefinition for MsgSoftwareUpgrade {
    const ROUTE: &'static str = MODULE_NAME;
    const TYPE_URL: &'static str = "/upgrade.MsgSoftwareUpgrade";

    fn validate_basic(&self) -> Result<()> {
        self.plan.validate_basic()
    }

    fn signers(&self) -> Vec<Address> {
        vec![self.authority]
    }
}

/// Cancel the pending plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgCancelUpgrade {
    /// Upgrade authority
    pub authority: Address,
}

impl MsgDefinition for MsgCancelUpgrade {
    const ROUTE: &'static str = MODULE_NAME;
    const TYPE_URL: &'static str = "/upgrade.MsgCancelUpgrade";

    fn validate_basic(&self) -> Result<()> {
        Ok(())
    }

    fn signers(&self) -> Vec<Address> {
        vec![self.authority]
    }
}

/// Upgrade keeper
#[derive(Clone)]
pub struct UpgradeKeeper {
    key: StoreKey,
    skip_heights: Arc<BTreeSet<u64>>,
    authority: Option<Address>,
    handlers: BTreeMap<String, UpgradeHandler>,
}

impl fmt::Debug for UpgradeKeeper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeKeeper")
            .field("key", &self.key)
            .field("skip_heights", &self.skip_heights)
            .field("authority", &self.authority)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl UpgradeKeeper {
    /// Create keeper; `authority` may schedule and cancel plans
    pub fn new(key: StoreKey, skip_heights: BTreeSet<u64>, authority: Option<Address>) -> Self {
        Self {
            key,
            skip_heights: Arc::new(skip_heights),
            authority,
            handlers: BTreeMap::new(),
        }
    }

    /// Register the migration for plan `name`
    pub fn set_upgrade_handler<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&mut Context<'_>, &Plan) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Heights at which a plan is skipped without a handler
    pub fn skip_heights(&self) -> &BTreeSet<u64> {
        &self.skip_heights
    }

    /// Pending plan
    pub fn upgrade_plan(&self, ctx: &mut Context<'_>) -> Result<Option<Plan>> {
        Ok(ctx.get_value(&self.key, PLAN_KEY)?)
    }

    /// Height a named plan was applied at
    pub fn done_height(&self, ctx: &mut Context<'_>, name: &str) -> Result<Option<u64>> {
        Ok(ctx.get_value(&self.key, &[DONE_PREFIX, name.as_bytes()].concat())?)
    }

    /// Schedule a plan
    pub fn schedule_upgrade(&self, ctx: &mut Context<'_>, plan: &Plan) -> Result<()> {
        plan.validate_basic()?;
        if plan.height <= ctx.block_height() {
            return Err(Error::module(MODULE_NAME, 2, "upgrade cannot be scheduled in the past"));
        }
        if self.done_height(ctx, &plan.name)?.is_some() {
            return Err(Error::module(
                MODULE_NAME,
                3,
                format!("upgrade with name {} has already been completed", plan.name),
            ));
        }
        ctx.set_value(&self.key, PLAN_KEY, plan)?;
        ctx.emit_event(
            Event::new("schedule_upgrade")
                .attr("name", &plan.name)
                .attr("height", plan.height),
        );
        tracing::info!(name = %plan.name, height = plan.height, "Scheduled upgrade");
        Ok(())
    }

    /// Drop the pending plan
    pub fn clear_upgrade_plan(&self, ctx: &mut Context<'_>) -> Result<()> {
        Ok(ctx.delete(&self.key, PLAN_KEY)?)
    }

    fn check_authority(&self, signer: &Address) -> Result<()> {
        match &self.authority {
            Some(authority) if authority == signer => Ok(()),
            Some(authority) => Err(Error::Unauthorized(format!(
                "expected upgrade authority {}, got {}",
                authority, signer
            ))),
            None => Err(Error::Unauthorized("no upgrade authority configured".into())),
        }
    }

    /// Act on the pending plan before any module runs its block-begin logic
    pub fn begin_block(&self, ctx: &mut Context<'_>) -> Result<()> {
        let plan = match self.upgrade_plan(ctx)? {
            Some(plan) => plan,
            None => return Ok(()),
        };
        let height = ctx.block_height();

        if plan.height > height {
            if self.handlers.contains_key(&plan.name) {
                tracing::error!(name = %plan.name, height = plan.height, "Binary updated before upgrade height");
                return Err(Error::module(
                    MODULE_NAME,
                    4,
                    format!("binary updated before trigger: {} at height {}", plan.name, plan.height),
                ));
            }
            return Ok(());
        }

        if self.skip_heights.contains(&height) {
            tracing::info!(name = %plan.name, height, "Skipping upgrade");
            return self.clear_upgrade_plan(ctx);
        }

        match self.handlers.get(&plan.name) {
            Some(handler) => {
                handler(ctx, &plan)?;
                self.clear_upgrade_plan(ctx)?;
                ctx.set_value(&self.key, &[DONE_PREFIX, plan.name.as_bytes()].concat(), &height)?;
                ctx.emit_event(Event::new("upgrade").attr("name", &plan.name).attr("height", height));
                tracing::info!(name = %plan.name, height, "Applied upgrade");
                Ok(())
            }
            None => {
                tracing::error!(name = %plan.name, height, info = %plan.info, "UPGRADE NEEDED");
                Err(Error::UpgradeRequired {
                    name: plan.name,
                    height,
                })
            }
        }
    }
}

/// Upgrade genesis fragment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    /// Pending plan
    #[serde(default)]
    pub plan: Option<Plan>,
}

/// Upgrade module
#[derive(Debug, Clone)]
pub struct UpgradeModule {
    keeper: UpgradeKeeper,
}

impl UpgradeModule {
    /// Wrap keeper
    pub fn new(keeper: UpgradeKeeper) -> Self {
        Self { keeper }
    }
}

impl AppModule for UpgradeModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn default_genesis(&self) -> Value {
        serde_json::to_value(GenesisState::default()).unwrap_or(Value::Null)
    }

    fn validate_genesis(&self, genesis: &Value) -> Result<()> {
        match parse_genesis::<GenesisState>(MODULE_NAME, genesis)?.plan {
            Some(plan) => plan.validate_basic(),
            None => Ok(()),
        }
    }

    fn init_genesis(
        &self,
        ctx: &mut Context<'_>,
        genesis: &Value,
        _txs: &dyn DeliverGenesisTx,
    ) -> Result<Vec<ValidatorUpdate>> {
        let state: GenesisState = parse_genesis(MODULE_NAME, genesis)?;
        if let Some(plan) = &state.plan {
            self.keeper.schedule_upgrade(ctx, plan)?;
        }
        Ok(Vec::new())
    }

    fn export_genesis(&self, ctx: &mut Context<'_>) -> Result<Value> {
        to_json(&GenesisState {
            plan: self.keeper.upgrade_plan(ctx)?,
        })
    }

    fn message_types(&self) -> &'static [&'static str] {
        &[MsgSoftwareUpgrade::TYPE_URL, MsgCancelUpgrade::TYPE_URL]
    }

    fn handle(&self, ctx: &mut Context<'_>, msg: &Msg) -> Result<Vec<u8>> {
        match msg {
            Msg::SoftwareUpgrade(msg) => {
                self.keeper.check_authority(&msg.authority)?;
                self.keeper.schedule_upgrade(ctx, &msg.plan)?;
                Ok(Vec::new())
            }
            Msg::CancelUpgrade(msg) => {
                self.keeper.check_authority(&msg.authority)?;
                self.keeper.clear_upgrade_plan(ctx)?;
                ctx.emit_event(Event::new("cancel_upgrade"));
                Ok(Vec::new())
            }
            other => Err(Error::UnknownRequest(format!(
                "unrecognized upgrade message type: {}",
                other.type_url()
            ))),
        }
    }

    fn query_route(&self) -> Option<&'static str> {
        Some(MODULE_NAME)
    }

    fn query(&self, ctx: &mut Context<'_>, path: &[&str], _data: &[u8]) -> Result<Value> {
        match path {
            ["current"] => to_json(&self.keeper.upgrade_plan(ctx)?),
            ["applied", name] => to_json(&self.keeper.done_height(ctx, name)?),
            _ => Err(Error::UnknownRequest(format!(
                "unknown upgrade query endpoint: {}",
                path.join("/")
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestEnv;

    fn plan(height: u64) -> Plan {
        Plan {
            name: "v2".into(),
            height,
            info: String::new(),
        }
    }

    #[test]
    fn test_halts_without_handler() {
        let mut env = TestEnv::new();
        let keeper = UpgradeKeeper::new(env.key(STORE_KEY), BTreeSet::new(), None);
        let height = env.header().height;
        let mut ctx = env.ctx();
        ctx.set_value(&keeper.key, PLAN_KEY, &plan(height)).unwrap();

        let err = keeper.begin_block(&mut ctx).unwrap_err();
        assert!(matches!(err, Error::UpgradeRequired { ref name, .. } if name == "v2"));
    }

    #[test]
    fn test_handler_runs_and_marks_done() {
        let mut env = TestEnv::new();
        let mut keeper = UpgradeKeeper::new(env.key(STORE_KEY), BTreeSet::new(), None);
        keeper.set_upgrade_handler("v2", |ctx: &mut Context<'_>, _plan: &Plan| {
            ctx.emit_event(Event::new("migrated"));
            Ok(())
        });
        let height = env.header().height;
        let mut ctx = env.ctx();
        ctx.set_value(&keeper.key, PLAN_KEY, &plan(height)).unwrap();

        keeper.begin_block(&mut ctx).unwrap();
        assert!(keeper.upgrade_plan(&mut ctx).unwrap().is_none());
        assert_eq!(keeper.done_height(&mut ctx, "v2").unwrap(), Some(height));
        assert!(ctx.events().iter().any(|e| e.kind == "migrated"));

        // a completed plan cannot be scheduled again
        assert!(keeper.schedule_upgrade(&mut ctx, &plan(height + 10)).is_err());
    }

    #[test]
    fn test_skip_height_clears_plan() {
        let mut env = TestEnv::new();
        let height = env.header().height;
        let keeper = UpgradeKeeper::new(env.key(STORE_KEY), [height].into_iter().collect(), None);
        let mut ctx = env.ctx();
        ctx.set_value(&keeper.key, PLAN_KEY, &plan(height)).unwrap();

        keeper.begin_block(&mut ctx).unwrap();
        assert!(keeper.upgrade_plan(&mut ctx).unwrap().is_none());
    }

    #[test]
    fn test_early_handler_is_fatal() {
        let mut env = TestEnv::new();
        let mut keeper = UpgradeKeeper::new(env.key(STORE_KEY), BTreeSet::new(), None);
        keeper.set_upgrade_handler("v2", |_: &mut Context<'_>, _: &Plan| Ok(()));
        let height = env.header().height;
        let mut ctx = env.ctx();
        keeper.schedule_upgrade(&mut ctx, &plan(height + 5)).unwrap();

        assert!(keeper.begin_block(&mut ctx).is_err());
    }

    #[test]
    fn test_authority_gates_messages() {
        let mut env = TestEnv::new();
        let authority = Address([9; 20]);
        let keeper = UpgradeKeeper::new(env.key(STORE_KEY), BTreeSet::new(), Some(authority));
        let module = UpgradeModule::new(keeper.clone());
        let height = env.header().height;
        let mut ctx = env.ctx();

        let forged = Msg::SoftwareUpgrade(MsgSoftwareUpgrade {
            authority: Address([1; 20]),
            plan: plan(height + 5),
        });
        assert!(matches!(module.handle(&mut ctx, &forged), Err(Error::Unauthorized(_))));

        let msg = Msg::SoftwareUpgrade(MsgSoftwareUpgrade {
            authority,
            plan: plan(height + 5),
        });
        module.handle(&mut ctx, &msg).unwrap();
        assert_eq!(keeper.upgrade_plan(&mut ctx).unwrap(), Some(plan(height + 5)));

        module
            .handle(&mut ctx, &Msg::CancelUpgrade(MsgCancelUpgrade { authority }))
            .unwrap();
        assert!(keeper.upgrade_plan(&mut ctx).unwrap().is_none());
    }
}
