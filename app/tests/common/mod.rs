//! Shared fixtures for application tests

#![allow(dead_code)]

use chain_app::{
    abci::{Header, RequestBeginBlock, RequestEndBlock, RequestInitChain, ResponseDeliverTx, ResponseInitChain},
    Application, Config, GenesisState, StdFee, StdTx, Tx,
};
use chain_modules::{
    auth::{self, Account, BaseAccount},
    bank::{self, Balance, MsgSend},
    genutil,
    staking::MsgCreateValidator,
    Address, Coin, Coins, Msg, PubKey, H256, NATIVE_DENOM,
};
use chain_store::{crypto::KeyPair, MemDatabase};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeSet;
use std::sync::Arc;

pub const CHAIN_ID: &str = "ethapp-test";
pub const INITIAL_BALANCE: u128 = 1_000_000_000;
pub const SELF_DELEGATION: u128 = 10_000_000;

/// Named test account
pub struct TestAccount {
    pub key: KeyPair,
    pub address: Address,
}

impl TestAccount {
    pub fn new(seed: u8) -> Self {
        let key = KeyPair::from_seed(&[seed; 32]);
        let address = Address::from_public_key(&PubKey(key.public_key()));
        Self { key, address }
    }

    pub fn pub_key(&self) -> PubKey {
        PubKey(self.key.public_key())
    }
}

/// Application over memory with three funded accounts: `alice`, `bob` and
/// `validator`, the last one bonded through a genesis transaction
pub struct TestChain {
    pub app: Application,
    pub alice: TestAccount,
    pub bob: TestAccount,
    pub validator: TestAccount,
    pub consensus_key: PubKey,
    pub init: ResponseInitChain,
}

pub fn genesis_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()
}

pub fn new_app(config: Config) -> Application {
    Application::new(Arc::new(MemDatabase::new()), None, false, BTreeSet::new(), config).unwrap()
}

/// Genesis funding `accounts` and bonding `validator` with `consensus_key`
pub fn genesis_state(
    app: &Application,
    accounts: &[&TestAccount],
    validator: &TestAccount,
    consensus_key: PubKey,
) -> GenesisState {
    let mut state = app.default_genesis();

    let auth_state = auth::GenesisState {
        params: Default::default(),
        accounts: accounts
            .iter()
            .map(|a| {
                Account::Base(BaseAccount {
                    address: a.address,
                    pub_key: None,
                    account_number: 0,
                    sequence: 0,
                })
            })
            .collect(),
    };
    state.insert("auth".into(), serde_json::to_value(auth_state).unwrap());

    let bank_state = bank::GenesisState {
        params: Default::default(),
        balances: accounts
            .iter()
            .map(|a| Balance {
                address: a.address,
                coins: Coins::single(NATIVE_DENOM, INITIAL_BALANCE),
            })
            .collect(),
    };
    state.insert("bank".into(), serde_json::to_value(bank_state).unwrap());

    let create = MsgCreateValidator {
        operator: validator.address,
        pub_key: consensus_key,
        moniker: "genesis-validator".into(),
        commission_rate: Decimal::new(1, 1),
        value: Coin::new(SELF_DELEGATION, NATIVE_DENOM),
    };
    let fee = StdFee {
        amount: Coins::empty(),
        gas: 200_000,
    };
    let gen_tx: Tx = StdTx::sign(vec![create.into()], fee, "", CHAIN_ID, &[(&validator.key, 0, 0)])
        .unwrap()
        .into();
    let genutil_state = genutil::GenesisState {
        gen_txs: vec![hex::encode(gen_tx.encode().unwrap())],
    };
    state.insert("genutil".into(), serde_json::to_value(genutil_state).unwrap());

    state
}

impl TestChain {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Chain with genesis committed as block 1, so queries see the funded accounts
    pub fn with_config(config: Config) -> Self {
        let mut chain = Self::at_genesis(config);
        chain.block(&[]);
        chain
    }

    /// Chain right after InitChain, before any block
    pub fn at_genesis(config: Config) -> Self {
        let mut app = new_app(config);
        let alice = TestAccount::new(1);
        let bob = TestAccount::new(2);
        let validator = TestAccount::new(3);
        let consensus_key = PubKey(KeyPair::from_seed(&[30; 32]).public_key());

        let state = genesis_state(&app, &[&alice, &bob, &validator], &validator, consensus_key);
        let init = app
            .init_chain(RequestInitChain {
                time: genesis_time(),
                chain_id: CHAIN_ID.into(),
                validators: Vec::new(),
                app_state_bytes: serde_json::to_vec(&state).unwrap(),
            })
            .unwrap();

        Self {
            app,
            alice,
            bob,
            validator,
            consensus_key,
            init,
        }
    }

    pub fn next_height(&self) -> u64 {
        self.app.last_block_height() + 1
    }

    pub fn begin(&mut self) {
        let height = self.next_height();
        self.app.begin_block(begin_request(height)).unwrap();
    }

    pub fn end_and_commit(&mut self) -> [u8; 32] {
        let height = self.next_height();
        self.app.end_block(RequestEndBlock { height }).unwrap();
        self.app.commit().unwrap().data
    }

    /// One block holding `txs`
    pub fn block(&mut self, txs: &[Vec<u8>]) -> Vec<ResponseDeliverTx> {
        self.begin();
        let responses = txs.iter().map(|tx| self.app.deliver_tx(tx).unwrap()).collect();
        self.end_and_commit();
        responses
    }

    pub fn balance(&mut self, address: Address) -> u128 {
        let bank = self.app.keepers().bank.clone();
        self.app
            .with_query_context(|ctx| bank.balance(ctx, &address))
            .unwrap()
            .amount_of(NATIVE_DENOM)
    }

    pub fn sequence(&mut self, address: Address) -> u64 {
        let accounts = self.app.keepers().accounts.clone();
        self.app.with_query_context(|ctx| accounts.sequence(ctx, &address)).unwrap()
    }

    pub fn account_number(&mut self, address: Address) -> u64 {
        let accounts = self.app.keepers().accounts.clone();
        self.app
            .with_query_context(|ctx| accounts.get_account(ctx, &address))
            .unwrap()
            .unwrap()
            .account_number()
    }

    /// Signed transfer from `from` at its current sequence
    pub fn transfer(&mut self, from: &TestAccount, to: Address, amount: u128, fee: u128) -> Vec<u8> {
        let sequence = self.sequence(from.address);
        self.transfer_at(from, to, amount, fee, sequence)
    }

    pub fn transfer_at(&mut self, from: &TestAccount, to: Address, amount: u128, fee: u128, sequence: u64) -> Vec<u8> {
        let msg = MsgSend {
            from_address: from.address,
            to_address: to,
            amount: Coins::single(NATIVE_DENOM, amount),
        };
        self.sign(from, vec![msg.into()], fee, sequence)
    }

    pub fn sign(&mut self, from: &TestAccount, msgs: Vec<Msg>, fee: u128, sequence: u64) -> Vec<u8> {
        let account_number = self.account_number(from.address);
        let fee = StdFee {
            amount: if fee == 0 {
                Coins::empty()
            } else {
                Coins::single(NATIVE_DENOM, fee)
            },
            gas: 200_000,
        };
        let tx: Tx = StdTx::sign(msgs, fee, "", CHAIN_ID, &[(&from.key, account_number, sequence)])
            .unwrap()
            .into();
        tx.encode().unwrap()
    }
}

pub fn begin_request(height: u64) -> RequestBeginBlock {
    RequestBeginBlock {
        hash: H256([height as u8; 32]),
        header: Header {
            chain_id: CHAIN_ID.into(),
            height,
            time: genesis_time() + Duration::seconds(5 * height as i64),
        },
        proposer: Address::default(),
        votes: Vec::new(),
        byzantine_validators: Vec::new(),
    }
}
