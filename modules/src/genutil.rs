//! Genesis transactions
//!
//! Validators of a new chain are usually created by signed transactions
//! collected before launch. Their raw bytes are carried hex-encoded in this
//! fragment and delivered through the full transaction pipeline during
//! InitChain; the initial validator set is then read back from staking.

use crate::{
    abci::ValidatorUpdate,
    module::{parse_genesis, to_json, AppModule, DeliverGenesisTx},
    staking::StakingKeeper,
    Error, Result,
};
use chain_store::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Module name
pub const MODULE_NAME: &str = "genutil";

/// Genutil genesis fragment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenesisState {
    /// Hex-encoded transactions
    #[serde(default)]
    pub gen_txs: Vec<String>,
}

impl GenesisState {
    fn decode(&self) -> Result<Vec<Vec<u8>>> {
        self.gen_txs
            .iter()
            .enumerate()
            .map(|(i, tx)| {
                hex::decode(tx).map_err(|e| Error::Genesis(format!("gen tx {} is not valid hex: {}", i, e)))
            })
            .collect()
    }
}

/// Genesis transaction module
#[derive(Debug, Clone)]
pub struct GenutilModule {
    staking: StakingKeeper,
}

impl GenutilModule {
    /// Wrap the staking keeper the validator set is read from
    pub fn new(staking: StakingKeeper) -> Self {
        Self { staking }
    }
}

impl AppModule for GenutilModule {
    fn name(&self) -> &'static str {
        MODULE_NAME
    }

    fn default_genesis(&self) -> Value {
        serde_json::to_value(GenesisState::default()).unwrap_or(Value::Null)
    }

    fn validate_genesis(&self, genesis: &Value) -> Result<()> {
        parse_genesis::<GenesisState>(MODULE_NAME, genesis)?.decode().map(|_| ())
    }

    fn init_genesis(
        &self,
        ctx: &mut Context<'_>,
        genesis: &Value,
        txs: &dyn DeliverGenesisTx,
    ) -> Result<Vec<ValidatorUpdate>> {
        let state: GenesisState = parse_genesis(MODULE_NAME, genesis)?;
        let decoded = state.decode()?;
        if decoded.is_empty() {
            return Ok(Vec::new());
        }
        for (i, tx) in decoded.iter().enumerate() {
            txs.deliver_genesis_tx(ctx, tx)
                .map_err(|e| Error::Genesis(format!("gen tx {} failed: {}", i, e)))?;
        }
        let updates = self.staking.apply_and_return_validator_set_updates(ctx)?;
        tracing::info!(txs = decoded.len(), validators = updates.len(), "Delivered genesis transactions");
        Ok(updates)
    }

    fn export_genesis(&self, _ctx: &mut Context<'_>) -> Result<Value> {
        to_json(&GenesisState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::NoGenesisTxs;
    use crate::staking::MsgCreateValidator;
    use crate::testutil::TestEnv;
    use crate::types::{Address, Coin, PubKey, NATIVE_DENOM};
    use rust_decimal::Decimal;

    struct CreateValidators(StakingKeeper);

    impl DeliverGenesisTx for CreateValidators {
        fn deliver_genesis_tx(&self, ctx: &mut Context<'_>, tx: &[u8]) -> Result<()> {
            let msg: MsgCreateValidator = bincode::deserialize(tx).map_err(|e| Error::Decode(e.to_string()))?;
            self.0.create_validator(ctx, &msg)
        }
    }

    fn gen_tx(operator: Address, seed: u8) -> String {
        let msg = MsgCreateValidator {
            operator,
            pub_key: PubKey([seed; 32]),
            moniker: format!("validator-{}", seed),
            commission_rate: Decimal::new(1, 1),
            value: Coin::new(10_000_000, NATIVE_DENOM),
        };
        hex::encode(bincode::serialize(&msg).unwrap())
    }

    #[test]
    fn test_empty_gen_txs_return_no_updates() {
        let mut env = TestEnv::new();
        let keepers = env.keepers();
        let module = GenutilModule::new(keepers.staking.clone());
        let mut ctx = env.ctx();
        let updates = module
            .init_genesis(&mut ctx, &module.default_genesis(), &NoGenesisTxs)
            .unwrap();
        assert!(updates.is_empty());
    }

    #[test]
    fn test_gen_txs_yield_initial_validator_set() {
        let mut env = TestEnv::new();
        let keepers = env.keepers();
        let module = GenutilModule::new(keepers.staking.clone());
        let mut ctx = env.ctx();
        let operator = Address([4; 20]);
        keepers.fund(&mut ctx, operator, 20_000_000);

        let genesis = serde_json::json!({ "gen_txs": [gen_tx(operator, 4)] });
        module.validate_genesis(&genesis).unwrap();
        let updates = module
            .init_genesis(&mut ctx, &genesis, &CreateValidators(keepers.staking.clone()))
            .unwrap();

        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].pub_key, PubKey([4; 32]));
        assert_eq!(updates[0].power, 10_000_000);
    }

    #[test]
    fn test_invalid_hex_rejected() {
        let env = TestEnv::new();
        let genesis = serde_json::json!({ "gen_txs": ["zz"] });
        let module = GenutilModule::new(env.keepers().staking);
        assert!(matches!(module.validate_genesis(&genesis), Err(Error::Genesis(_))));
    }
}
