//! Application Node Binary
//!
//! Opens the application over the configured database and either runs a
//! single-validator block loop or performs a one-shot command:
//!
//! - `chain-node start` (default): apply genesis if needed, then produce
//!   empty blocks every `block_interval_ms` until interrupted
//! - `chain-node export <path>`: write the current state as a genesis file
//! - `chain-node default-genesis <path> <chain-id>`: write a default genesis

use anyhow::{bail, Context as _};
use chain_app::{
    abci::{Header, RequestBeginBlock, RequestEndBlock, RequestInitChain, ValidatorUpdate, VoteInfo},
    Application, Config, Error, GenesisDoc, Phase,
};
use chain_modules::{Address, H256};
use chain_store::{crypto::hash_bytes, open_database};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::var("CHAIN_CONFIG") {
        Ok(path) => Config::from_file(&path).with_context(|| format!("loading config from {}", path))?,
        Err(_) => Config::from_env()?,
    };

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    if config.logging.json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("start");

    info!(data_dir = ?config.store.data_dir, backend = ?config.store.backend, "Opening database");
    let db = open_database(&config.store)?;
    let trace_sink = match &config.trace_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening trace file {}", path.display()))?;
            Some(Box::new(file) as Box<dyn std::io::Write + Send>)
        }
        None => None,
    };
    let mut app = Application::new(db, trace_sink, true, BTreeSet::new(), config.clone())?;

    match command {
        "start" => run(&mut app, &config).await,
        "export" => {
            let Some(path) = args.get(1) else {
                bail!("usage: chain-node export <path>");
            };
            let exported = app.export_app_state()?;
            let doc = GenesisDoc::new(app.chain_id(), Utc::now(), exported.app_state);
            doc.to_file(path)?;
            info!(height = exported.height, validators = exported.validators.len(), path = %path, "Exported state");
            Ok(())
        }
        "default-genesis" => {
            let (Some(path), Some(chain_id)) = (args.get(1), args.get(2)) else {
                bail!("usage: chain-node default-genesis <path> <chain-id>");
            };
            GenesisDoc::new(chain_id.as_str(), Utc::now(), app.default_genesis()).to_file(path)?;
            info!(path = %path, "Wrote default genesis");
            Ok(())
        }
        other => bail!("unknown command: {}", other),
    }
}

async fn run(app: &mut Application, config: &Config) -> anyhow::Result<()> {
    let mut validators = if app.phase() == Phase::Uninitialized {
        info!(path = ?config.genesis_file, "Applying genesis");
        let doc = GenesisDoc::from_file(&config.genesis_file)?;
        let response = app.init_chain(RequestInitChain {
            time: doc.genesis_time,
            chain_id: doc.chain_id.clone(),
            validators: Vec::new(),
            app_state_bytes: doc.app_state_bytes()?,
        })?;
        info!(chain_id = %doc.chain_id, validators = response.validators.len(), "Genesis applied");
        ValidatorSet::from_updates(&response.validators)
    } else {
        bonded_set(app)?
    };

    info!(
        chain_id = %app.chain_id(),
        height = app.last_block_height(),
        app_hash = %hex::encode(app.last_app_hash()),
        "Node running"
    );

    let mut ticker = tokio::time::interval(Duration::from_millis(config.block_interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match produce_block(app, &mut validators) {
                    Ok(()) => {}
                    Err(Error::Halted(height)) => {
                        warn!(height, "Node halted");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "Block failed");
                        return Err(e.into());
                    }
                }
            }
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received shutdown signal"),
                    Err(err) => error!("Unable to listen for shutdown signal: {}", err),
                }
                break;
            }
        }
    }

    info!(metrics = ?app.metrics(), "Node stopped");
    Ok(())
}

/// Consensus validator set as the block loop sees it, keyed by consensus
/// address
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct ValidatorSet {
    powers: BTreeMap<Address, u64>,
}

impl ValidatorSet {
    fn from_updates(updates: &[ValidatorUpdate]) -> Self {
        let mut set = Self::default();
        set.apply(updates);
        set
    }

    /// Power 0 removes a validator
    fn apply(&mut self, updates: &[ValidatorUpdate]) {
        for update in updates {
            let address = Address::from_public_key(&update.pub_key);
            if update.power == 0 {
                self.powers.remove(&address);
            } else {
                self.powers.insert(address, update.power);
            }
        }
    }

    /// Every member as a signer of the previous commit; the strongest
    /// proposes, ties going to the lowest address
    fn commit_votes(&self) -> (Address, Vec<VoteInfo>) {
        let votes: Vec<VoteInfo> = self
            .powers
            .iter()
            .map(|(address, power)| VoteInfo {
                address: *address,
                power: *power,
                signed_last_block: true,
            })
            .collect();
        let proposer = votes
            .iter()
            .max_by(|a, b| a.power.cmp(&b.power).then(b.address.cmp(&a.address)))
            .map(|v| v.address)
            .unwrap_or_default();
        (proposer, votes)
    }
}

/// Set rebuilt from committed staking state after a restart
fn bonded_set(app: &mut Application) -> chain_app::Result<ValidatorSet> {
    let staking = app.keepers().staking.clone();
    let updates = app.with_query_context(|ctx| -> chain_modules::Result<Vec<ValidatorUpdate>> {
        let reduction = staking.params(ctx)?.power_reduction;
        Ok(staking
            .bonded_validators(ctx)?
            .iter()
            .map(|v| ValidatorUpdate {
                pub_key: v.consensus_pubkey,
                power: v.power(reduction),
            })
            .collect())
    })?;
    Ok(ValidatorSet::from_updates(&updates))
}

fn produce_block(app: &mut Application, validators: &mut ValidatorSet) -> chain_app::Result<()> {
    let height = app.last_block_height() + 1;
    let (proposer, votes) = validators.commit_votes();
    let hash = H256(hash_bytes(&[app.last_app_hash().as_slice(), &height.to_be_bytes()].concat()));
    app.begin_block(RequestBeginBlock {
        hash,
        header: Header {
            chain_id: app.chain_id().to_string(),
            height,
            time: Utc::now(),
        },
        proposer,
        votes,
        byzantine_validators: Vec::new(),
    })?;
    let end = app.end_block(RequestEndBlock { height })?;
    if !end.validator_updates.is_empty() {
        info!(height, updates = end.validator_updates.len(), "Validator set changed");
        validators.apply(&end.validator_updates);
    }
    app.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_modules::PubKey;

    fn update(seed: u8, power: u64) -> ValidatorUpdate {
        ValidatorUpdate {
            pub_key: PubKey([seed; 32]),
            power,
        }
    }

    #[test]
    fn test_genesis_validators_vote_and_propose() {
        let set = ValidatorSet::from_updates(&[update(1, 10), update(2, 30)]);
        let (proposer, votes) = set.commit_votes();
        assert_eq!(votes.len(), 2);
        assert!(votes.iter().all(|v| v.signed_last_block));
        assert_eq!(proposer, Address::from_public_key(&PubKey([2; 32])));
        assert_eq!(votes.iter().map(|v| v.power).sum::<u64>(), 40);
    }

    #[test]
    fn test_updates_change_and_remove_members() {
        let mut set = ValidatorSet::from_updates(&[update(1, 10), update(2, 30)]);
        set.apply(&[update(2, 0), update(3, 5)]);
        let (proposer, votes) = set.commit_votes();
        assert_eq!(votes.len(), 2);
        assert_eq!(proposer, Address::from_public_key(&PubKey([1; 32])));

        set.apply(&[update(1, 0), update(3, 0)]);
        let (proposer, votes) = set.commit_votes();
        assert!(votes.is_empty());
        assert_eq!(proposer, Address::default());
    }
}
