//! Application lifecycle
//!
//! [`Application`] owns the committed multistore and drives the modules
//! through the lifecycle the consensus engine calls:
//!
//! ```text
//! Uninitialized ─init_chain─> Initialized ─begin_block─> BlockBegun
//!   BlockBegun ─deliver_tx─> Delivering ─end_block─> BlockEnded
//!   BlockEnded ─commit─> Committed ─begin_block─> BlockBegun ...
//! ```
//!
//! Writes of the current block are buffered in the deliver state and reach
//! the multistore only on commit. CheckTx runs against a separate check
//! state over the last commit, reset on every commit.
//!
//! # Invariants
//!
//! - Calls out of phase are rejected and change nothing
//! - Every message is routed to exactly one module
//! - A failed transaction leaves no writes; only its gas used is reported
//! - Registered invariants hold after genesis and every `inv_check_period` blocks

use crate::{
    abci::{
        Header, RequestBeginBlock, RequestEndBlock, RequestInitChain, RequestQuery, ResponseBeginBlock,
        ResponseCheckTx, ResponseCommit, ResponseDeliverTx, ResponseEndBlock, ResponseInfo,
        ResponseInitChain, ResponseQuery, ValidatorUpdate,
    },
    ante::AnteHandler,
    config::Config,
    error::TxError,
    genesis::GenesisDoc,
    manager::{GenesisState, ModuleManager, ModuleOrders},
    metrics::Metrics,
    permissions::Permissions,
    router::{QueryRouter, Router},
    tx::Tx,
    wiring::{self, Keepers, WiringOptions},
    Error, Result,
};
use chain_modules::{
    upgrade::UpgradeHandler, Address, DeliverGenesisTx, Error as ModuleError, InvariantRegistry,
};
use chain_store::{
    cache::apply_writes, BlockHeader, CommitMultiStore, Context, Database, ExecMode, KvStore, StoreKey,
    StoreKeys, Tracer, WriteSet,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

const CHAIN_ID_KEY: &[u8] = b"chain_id";
const LAST_BLOCK_TIME_KEY: &[u8] = b"last_block_time";

/// Lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No genesis applied
    Uninitialized,
    /// Genesis applied, first block not begun
    Initialized,
    /// Block begun, no transaction delivered yet
    BlockBegun,
    /// At least one transaction delivered
    Delivering,
    /// Block ended, not committed
    BlockEnded,
    /// Last block committed
    Committed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Uninitialized => "uninitialized",
            Phase::Initialized => "initialized",
            Phase::BlockBegun => "block begun",
            Phase::Delivering => "delivering",
            Phase::BlockEnded => "block ended",
            Phase::Committed => "committed",
        };
        f.write_str(name)
    }
}

/// State exported for a new genesis
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedApp {
    /// Module fragments
    pub app_state: GenesisState,
    /// Current bonded validator set
    pub validators: Vec<ValidatorUpdate>,
    /// Height exported
    pub height: u64,
}

struct BlockState {
    writes: WriteSet,
    header: BlockHeader,
}

/// Ante pipeline plus routing, borrowed for one call
struct TxRunner<'a> {
    ante: &'a AnteHandler,
    router: &'a Router,
}

struct TxResult {
    data: Vec<u8>,
    gas_wanted: u64,
}

impl TxRunner<'_> {
    /// Run the ante pipeline, then (outside check mode) every message
    ///
    /// Both run in one branch: any failure drops the fee, the sequence
    /// increment and every message write together.
    fn execute(&self, ctx: &mut Context<'_>, bytes: &[u8]) -> std::result::Result<TxResult, (ModuleError, u64)> {
        let tx = Tx::decode(bytes).map_err(|e| (e, 0))?;
        let gas_wanted = tx.gas();

        let data = ctx
            .atomic(|ctx| {
                self.ante.run(ctx, &tx, bytes.len())?;
                let mut data = Vec::new();
                if ctx.is_check_tx() {
                    return Ok(data);
                }
                for msg in tx.msgs() {
                    let module = self.router.route(&msg)?;
                    data.extend(module.handle(ctx, &msg)?);
                }
                Ok::<_, ModuleError>(data)
            })
            .map_err(|e| (e, gas_wanted))?;

        Ok(TxResult { data, gas_wanted })
    }

    fn respond(&self, ctx: &mut Context<'_>, bytes: &[u8]) -> ResponseDeliverTx {
        let result = self.execute(ctx, bytes);
        let gas_used = ctx.gas_meter().consumed();
        match result {
            Ok(result) => ResponseDeliverTx {
                data: result.data,
                gas_wanted: result.gas_wanted,
                gas_used,
                events: ctx.take_events(),
                ..Default::default()
            },
            Err((err, gas_wanted)) => {
                ctx.take_events();
                ResponseDeliverTx::from_error(&TxError::from(&err), gas_wanted, gas_used)
            }
        }
    }
}

impl DeliverGenesisTx for TxRunner<'_> {
    fn deliver_genesis_tx(&self, ctx: &mut Context<'_>, tx: &[u8]) -> chain_modules::Result<()> {
        self.execute(ctx, tx).map(|_| ()).map_err(|(err, _)| err)
    }
}

/// The ledger application
pub struct Application {
    store: CommitMultiStore,
    keys: StoreKeys,
    main_key: StoreKey,
    keepers: Keepers,
    permissions: Permissions,
    manager: ModuleManager,
    router: Router,
    queries: QueryRouter,
    invariants: InvariantRegistry,
    ante: AnteHandler,
    config: Config,
    metrics: Metrics,
    phase: Phase,
    chain_id: String,
    deliver: Option<BlockState>,
    check: BlockState,
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Application")
            .field("chain_id", &self.chain_id)
            .field("phase", &self.phase)
            .field("last_commit", &self.store.last_commit_id())
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

impl Application {
    /// Build the application over `db`
    ///
    /// `skip_heights` is merged with the configured skip heights. With
    /// `load_latest`, the latest committed version is loaded.
    pub fn new(
        db: Arc<dyn Database>,
        trace_sink: Option<Box<dyn Write + Send>>,
        load_latest: bool,
        skip_heights: BTreeSet<u64>,
        config: Config,
    ) -> Result<Self> {
        Self::with_upgrade_handlers(db, trace_sink, load_latest, skip_heights, config, BTreeMap::new())
    }

    /// Build the application with migrations for scheduled upgrades
    pub fn with_upgrade_handlers(
        db: Arc<dyn Database>,
        trace_sink: Option<Box<dyn Write + Send>>,
        load_latest: bool,
        mut skip_heights: BTreeSet<u64>,
        config: Config,
        upgrade_handlers: BTreeMap<String, UpgradeHandler>,
    ) -> Result<Self> {
        skip_heights.extend(config.skip_heights());

        let permissions = Permissions::standard();
        let keys = wiring::allocate_stores()?;
        let options = WiringOptions {
            skip_upgrade_heights: skip_heights,
            upgrade_authority: config.upgrade_authority()?,
            upgrade_handlers,
            ..WiringOptions::default()
        };
        let keepers = Keepers::new(&keys, &permissions, options)?;

        let manager = ModuleManager::new(keepers.modules(), ModuleOrders::standard())?;
        let (router, queries) = manager.register_routes()?;
        let invariants = manager.register_invariants();
        let ante = AnteHandler::new(&keepers, config.min_gas_prices()?, config.max_block_gas);

        let mut store = CommitMultiStore::with_pruning(db, config.store.pruning.clone())?;
        if let Some(sink) = trace_sink {
            store.set_tracer(Tracer::new(sink));
        }
        store.mount_stores(&keys)?;

        let mut app = Self {
            store,
            main_key: keys.persistent(wiring::MAIN_STORE)?,
            keys,
            keepers,
            permissions,
            manager,
            router,
            queries,
            invariants,
            ante,
            config,
            metrics: Metrics::new()?,
            phase: Phase::Uninitialized,
            chain_id: String::new(),
            deliver: None,
            check: BlockState {
                writes: WriteSet::new(),
                header: BlockHeader::genesis("", Default::default()),
            },
        };

        info!(
            modules = app.manager.module_names().count(),
            invariants = app.invariants.routes().len(),
            "Application wired"
        );

        if load_latest {
            app.load_latest_version()?;
        }
        Ok(app)
    }

    // ---- accessors ----

    /// Current lifecycle phase
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Chain identifier, empty before genesis
    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Last committed height
    pub fn last_block_height(&self) -> u64 {
        self.store.last_commit_id().version
    }

    /// Last committed application hash
    pub fn last_app_hash(&self) -> [u8; 32] {
        self.store.last_commit_id().hash
    }

    /// Wired keepers
    pub fn keepers(&self) -> &Keepers {
        &self.keepers
    }

    /// Module manager
    pub fn manager(&self) -> &ModuleManager {
        &self.manager
    }

    /// Metrics collector
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Module account address by module name
    pub fn module_account_addrs(&self) -> BTreeMap<String, Address> {
        self.permissions.module_addresses()
    }

    /// Addresses refused as transfer destinations
    pub fn blacklisted_acc_addrs(&self) -> BTreeSet<Address> {
        self.permissions.blocked_receivers()
    }

    /// Default genesis fragment of every module
    pub fn default_genesis(&self) -> GenesisState {
        self.manager.default_genesis()
    }

    /// Run `f` against committed state; writes are discarded
    pub fn with_query_context<T>(&mut self, f: impl FnOnce(&mut Context<'_>) -> T) -> T {
        let header = self.committed_header();
        let mut ctx = Context::new(&mut self.store, header, ExecMode::Query);
        f(&mut ctx)
    }

    /// Info about committed state
    pub fn info(&self) -> ResponseInfo {
        ResponseInfo {
            data: "ethapp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            last_block_height: self.last_block_height(),
            last_block_app_hash: self.last_app_hash(),
        }
    }

    // ---- lifecycle ----

    /// Apply genesis
    pub fn init_chain(&mut self, req: RequestInitChain) -> Result<ResponseInitChain> {
        self.expect_phase("init_chain", &[Phase::Uninitialized])?;

        let genesis = GenesisDoc::parse_app_state(&req.app_state_bytes)?;
        self.manager.validate_genesis(&genesis)?;

        let header = BlockHeader::genesis(req.chain_id.clone(), req.time);
        let mut ctx = Context::new(&mut self.store, header.clone(), ExecMode::Genesis);
        ctx.set_value(&self.main_key, CHAIN_ID_KEY, &req.chain_id)?;

        let runner = TxRunner {
            ante: &self.ante,
            router: &self.router,
        };
        let mut validators = self.manager.init_genesis(&mut ctx, &genesis, &runner)?;

        let broken = self.invariants.check_all(&mut ctx)?;
        if !broken.is_empty() {
            let reasons: Vec<String> = broken.iter().map(|b| format!("{}: {}", b.route, b.message)).collect();
            return Err(Error::Genesis(format!("invariant broken after genesis: {}", reasons.join("; "))));
        }

        if validators.is_empty() {
            validators = req.validators;
        } else if !req.validators.is_empty() && req.validators != validators {
            return Err(Error::Genesis(
                "validators in the request differ from the genesis validator set".into(),
            ));
        }

        let (writes, _, _) = ctx.into_parts();
        self.check = BlockState {
            writes: writes.clone(),
            header: BlockHeader {
                height: 1,
                ..header.clone()
            },
        };
        self.deliver = Some(BlockState { writes, header });
        self.chain_id = req.chain_id;
        self.phase = Phase::Initialized;

        info!(chain_id = %self.chain_id, validators = validators.len(), "Initialized chain");
        Ok(ResponseInitChain { validators })
    }

    /// Start a block
    pub fn begin_block(&mut self, req: RequestBeginBlock) -> Result<ResponseBeginBlock> {
        self.expect_phase("begin_block", &[Phase::Initialized, Phase::Committed])?;
        self.check_header(&req.header)?;

        let header = BlockHeader {
            chain_id: req.header.chain_id.clone(),
            height: req.header.height,
            time: req.header.time,
        };
        let pending = self.deliver.take();
        let writes = pending.as_ref().map(|state| state.writes.clone()).unwrap_or_default();
        let mut ctx = Context::with_writes(&mut self.store, writes, header.clone(), ExecMode::Deliver);

        let upgrade = &self.keepers.upgrade;
        let manager = &self.manager;
        let main_key = &self.main_key;
        let result = ctx.atomic(|ctx| -> Result<()> {
            upgrade.begin_block(ctx).map_err(|e| {
                error!(height = ctx.block_height(), error = %e, "Upgrade halt");
                e
            })?;
            manager.begin_block(ctx, &req.module_request())?;
            let time = ctx.block_time();
            ctx.set_value(main_key, LAST_BLOCK_TIME_KEY, &time)?;
            Ok(())
        });

        let (writes, events, _) = ctx.into_parts();
        if let Err(e) = result {
            self.deliver = pending;
            return Err(e);
        }
        debug!(height = header.height, events = events.len(), "Began block");
        self.deliver = Some(BlockState { writes, header });
        self.phase = Phase::BlockBegun;
        Ok(ResponseBeginBlock { events })
    }

    /// Admit a transaction to the mempool; runs the ante pipeline only
    pub fn check_tx(&mut self, tx: &[u8]) -> Result<ResponseCheckTx> {
        if self.phase == Phase::Uninitialized {
            return Err(invalid_phase("check_tx", self.phase));
        }

        let writes = std::mem::take(&mut self.check.writes);
        let mut ctx = Context::with_writes(&mut self.store, writes, self.check.header.clone(), ExecMode::Check);
        let runner = TxRunner {
            ante: &self.ante,
            router: &self.router,
        };
        let response = runner.respond(&mut ctx, tx);
        let (writes, _, _) = ctx.into_parts();
        self.check.writes = writes;

        self.metrics.record_check(response.is_ok());
        if !response.is_ok() {
            debug!(code = response.code, log = %response.log, "CheckTx rejected");
        }
        Ok(response)
    }

    /// Execute a transaction in the current block
    pub fn deliver_tx(&mut self, tx: &[u8]) -> Result<ResponseDeliverTx> {
        self.expect_phase("deliver_tx", &[Phase::BlockBegun, Phase::Delivering])?;
        let Some(state) = self.deliver.as_mut() else {
            return Err(invalid_phase("deliver_tx", self.phase));
        };

        let writes = std::mem::take(&mut state.writes);
        let mut ctx = Context::with_writes(&mut self.store, writes, state.header.clone(), ExecMode::Deliver);
        let runner = TxRunner {
            ante: &self.ante,
            router: &self.router,
        };
        let response = runner.respond(&mut ctx, tx);
        let (writes, _, _) = ctx.into_parts();
        state.writes = writes;

        self.metrics.record_deliver(response.is_ok(), response.gas_used);
        if response.is_ok() {
            debug!(gas_used = response.gas_used, "Delivered tx");
        } else {
            warn!(code = response.code, codespace = %response.codespace, log = %response.log, "Tx failed");
        }
        self.phase = Phase::Delivering;
        Ok(response)
    }

    /// End the current block
    pub fn end_block(&mut self, req: RequestEndBlock) -> Result<ResponseEndBlock> {
        self.expect_phase("end_block", &[Phase::BlockBegun, Phase::Delivering])?;
        let Some(state) = self.deliver.as_mut() else {
            return Err(invalid_phase("end_block", self.phase));
        };
        if req.height != state.header.height {
            return Err(Error::InvalidBlock(format!(
                "end_block height {} differs from begun height {}",
                req.height, state.header.height
            )));
        }

        let writes = std::mem::take(&mut state.writes);
        let mut ctx = Context::with_writes(&mut self.store, writes, state.header.clone(), ExecMode::Deliver);

        let manager = &self.manager;
        let invariants = &self.invariants;
        let period = self.config.inv_check_period;
        let result = ctx.atomic(|ctx| -> Result<Vec<ValidatorUpdate>> {
            let updates = manager.end_block(ctx, &req)?;
            if period > 0 && req.height % period == 0 {
                let broken = invariants.check_all(ctx)?;
                if let Some(first) = broken.first() {
                    error!(route = %first.route, message = %first.message, height = req.height, "Invariant broken");
                    return Err(Error::InvariantBroken(format!("{}: {}", first.route, first.message)));
                }
                debug!(height = req.height, checked = invariants.routes().len(), "Invariants hold");
            }
            Ok(updates)
        });

        let (writes, events, _) = ctx.into_parts();
        state.writes = writes;
        let validator_updates = result?;
        self.phase = Phase::BlockEnded;
        Ok(ResponseEndBlock {
            validator_updates,
            events,
        })
    }

    /// Persist the block and reset the check state
    ///
    /// Returns [`Error::Halted`] after persisting the configured halt height.
    pub fn commit(&mut self) -> Result<ResponseCommit> {
        self.expect_phase("commit", &[Phase::BlockEnded])?;
        let Some(state) = self.deliver.take() else {
            return Err(invalid_phase("commit", self.phase));
        };

        apply_writes(&mut self.store, state.writes);
        let commit = self.store.commit()?;

        self.check = BlockState {
            writes: WriteSet::new(),
            header: BlockHeader {
                height: commit.version + 1,
                ..state.header
            },
        };
        self.phase = Phase::Committed;
        self.metrics.record_commit(commit.version);
        info!(height = commit.version, app_hash = %hex::encode(commit.hash), "Committed block");

        let halt = self.config.halt_height;
        if halt > 0 && commit.version >= halt {
            warn!(height = commit.version, halt_height = halt, "Halt height reached");
            return Err(Error::Halted(commit.version));
        }

        Ok(ResponseCommit {
            data: commit.hash,
            height: commit.version,
        })
    }

    /// Read-only query of committed state
    pub fn query(&mut self, req: RequestQuery) -> ResponseQuery {
        let height = self.last_block_height();
        match self.run_query(&req) {
            Ok(value) => ResponseQuery {
                key: req.data,
                value,
                height,
                ..Default::default()
            },
            Err(err) => ResponseQuery::from_error(&TxError::from(&err), height),
        }
    }

    fn run_query(&mut self, req: &RequestQuery) -> chain_modules::Result<Vec<u8>> {
        let path: Vec<&str> = req.path.trim_matches('/').split('/').collect();
        match path.as_slice() {
            ["app", "version"] => Ok(env!("CARGO_PKG_VERSION").as_bytes().to_vec()),
            ["store", name, "key"] => {
                let key = self
                    .keys
                    .persistent(name)
                    .map_err(|_| ModuleError::UnknownRequest(format!("no store named {}", name)))?;
                Ok(self.store.get(&key, &req.data).unwrap_or_default())
            }
            ["custom", route, rest @ ..] => {
                let module = Arc::clone(
                    self.queries
                        .route(route)
                        .ok_or_else(|| ModuleError::UnknownRequest(format!("no route for query {}", route)))?,
                );
                let value = self.with_query_context(|ctx| module.query(ctx, rest, &req.data))?;
                Ok(serde_json::to_vec(&value)?)
            }
            _ => Err(ModuleError::UnknownRequest(format!("unknown query path: {}", req.path))),
        }
    }

    // ---- versions ----

    /// Reload state as of `height`; pending block state is dropped
    pub fn load_height(&mut self, height: u64) -> Result<()> {
        self.store.load_version(height)?;
        self.reset_after_load()
    }

    /// Reload the latest committed state
    pub fn load_latest_version(&mut self) -> Result<()> {
        self.store.load_latest_version()?;
        self.reset_after_load()
    }

    fn reset_after_load(&mut self) -> Result<()> {
        let version = self.last_block_height();
        self.deliver = None;

        if version == 0 {
            self.chain_id.clear();
            self.phase = Phase::Uninitialized;
        } else {
            let header = self.committed_header();
            let mut ctx = Context::new(&mut self.store, header, ExecMode::Query);
            self.chain_id = ctx
                .get_value::<String>(&self.main_key, CHAIN_ID_KEY)?
                .ok_or_else(|| Error::Genesis(format!("version {} has no chain id", version)))?;
            self.phase = Phase::Committed;
        }

        self.check = BlockState {
            writes: WriteSet::new(),
            header: BlockHeader {
                height: version + 1,
                ..self.committed_header()
            },
        };
        info!(height = version, chain_id = %self.chain_id, "Loaded application state");
        Ok(())
    }

    /// Export every module's state and the bonded validator set
    pub fn export_app_state(&mut self) -> Result<ExportedApp> {
        let height = self.last_block_height();
        let header = self.committed_header();
        let manager = &self.manager;
        let staking = &self.keepers.staking;
        let mut ctx = Context::new(&mut self.store, header, ExecMode::Query);

        let app_state = manager.export_genesis(&mut ctx)?;
        let reduction = staking.params(&mut ctx)?.power_reduction;
        let validators = staking
            .bonded_validators(&mut ctx)?
            .into_iter()
            .map(|v| ValidatorUpdate {
                pub_key: v.consensus_pubkey,
                power: v.power(reduction),
            })
            .collect();

        Ok(ExportedApp {
            app_state,
            validators,
            height,
        })
    }

    // ---- helpers ----

    fn committed_header(&mut self) -> BlockHeader {
        let height = self.last_block_height();
        let chain_id = self.chain_id.clone();
        let header = BlockHeader::genesis(chain_id.clone(), Default::default());
        let mut ctx = Context::new(&mut self.store, header, ExecMode::Query);
        let time = ctx
            .get_value(&self.main_key, LAST_BLOCK_TIME_KEY)
            .ok()
            .flatten()
            .unwrap_or_default();
        BlockHeader { chain_id, height, time }
    }

    fn check_header(&self, header: &Header) -> Result<()> {
        if header.chain_id != self.chain_id {
            return Err(Error::InvalidBlock(format!(
                "chain id {} differs from {}",
                header.chain_id, self.chain_id
            )));
        }
        let expected = self.last_block_height() + 1;
        if header.height != expected {
            return Err(Error::InvalidBlock(format!(
                "expected height {}, got {}",
                expected, header.height
            )));
        }
        Ok(())
    }

    fn expect_phase(&self, call: &'static str, allowed: &[Phase]) -> Result<()> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(invalid_phase(call, self.phase))
        }
    }
}

fn invalid_phase(call: &'static str, phase: Phase) -> Error {
    Error::InvalidPhase {
        call,
        phase: phase.to_string(),
    }
}
