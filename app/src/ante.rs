//! Ante pipeline
//!
//! Authenticates a decoded transaction and charges its fee before any
//! message handler runs:
//!
//! ```text
//! validate ─> sequence ─> signature ─> fee ─> gas meter ─> increment sequence
//! ```
//!
//! Every signer's sequence is checked before any signature is verified.
//! The caller runs [`AnteHandler::run`] and the message handlers inside one
//! atomic branch, so a failure anywhere leaves no write behind. Standard
//! transactions get a gas meter limited to their declared gas, charged for
//! the encoded size and each signature verification; VM transactions run
//! under an infinite meter and the evm module installs the limited one once
//! it knows the gas used.
//!
//! # Invariants
//!
//! - Success implies every signer's sequence advanced by one and the fee
//!   reached the fee collector
//! - Failure implies neither happened

use crate::{
    tx::{EvmTx, StdTx, Tx},
    wiring::Keepers,
};
use chain_modules::{
    auth::{Account, AccountKeeper, FEE_COLLECTOR},
    evm::EvmKeeper,
    supply::SupplyKeeper,
    types::dec_from_amount,
    Address, Coins, DecCoins, Error, Msg, MsgDefinition, PubKey, Result,
};
use chain_store::{crypto::verify_signature, Context, GasMeter};
use rust_decimal::Decimal;

/// Result of a passed ante pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnteOutcome {
    /// Gas limit requested by the transaction
    pub gas_wanted: u64,
    /// Fee moved to the fee collector
    pub fee: Coins,
    /// Authenticated signers; the first paid the fee
    pub signers: Vec<Address>,
}

/// Transaction gate shared by check, deliver and genesis
#[derive(Debug, Clone)]
pub struct AnteHandler {
    accounts: AccountKeeper,
    supply: SupplyKeeper,
    evm: EvmKeeper,
    min_gas_prices: DecCoins,
    max_block_gas: u64,
}

impl AnteHandler {
    /// Gate over the wired keepers; `max_block_gas` of 0 means unlimited
    pub fn new(keepers: &Keepers, min_gas_prices: DecCoins, max_block_gas: u64) -> Self {
        Self {
            accounts: keepers.accounts.clone(),
            supply: keepers.supply.clone(),
            evm: keepers.evm.clone(),
            min_gas_prices,
            max_block_gas,
        }
    }

    /// Run every step against `ctx`; `tx_len` is the encoded size
    pub fn run(&self, ctx: &mut Context<'_>, tx: &Tx, tx_len: usize) -> Result<AnteOutcome> {
        match tx {
            Tx::Std(tx) => self.run_std(ctx, tx, tx_len),
            Tx::Evm(tx) => self.run_evm(ctx, tx),
        }
    }

    fn run_std(&self, ctx: &mut Context<'_>, tx: &StdTx, tx_len: usize) -> Result<AnteOutcome> {
        let params = self.accounts.params(ctx)?;
        let signers = tx.signers();

        // validate
        if tx.msgs.is_empty() {
            return Err(Error::ValidateBasic("must contain at least one message".into()));
        }
        for msg in &tx.msgs {
            if matches!(msg, Msg::EthereumTx(_)) {
                return Err(Error::InvalidRequest("VM payloads must use the VM encoding".into()));
            }
            msg.validate_basic()?;
        }
        tx.fee.amount.validate()?;
        self.check_gas_limit(tx.fee.gas)?;
        if tx.signatures.is_empty() {
            return Err(Error::NoSignatures);
        }
        let sig_count = tx.signatures.len() as u64;
        if sig_count > params.tx_sig_limit {
            return Err(Error::TooManySignatures {
                max: params.tx_sig_limit,
                got: sig_count,
            });
        }
        if tx.signatures.len() != signers.len() {
            return Err(Error::Unauthorized(format!(
                "wrong number of signers; expected {}, got {}",
                signers.len(),
                tx.signatures.len()
            )));
        }
        let memo_len = tx.memo.chars().count() as u64;
        if memo_len > params.max_memo_characters {
            return Err(Error::MemoTooLarge {
                max: params.max_memo_characters,
                got: memo_len,
            });
        }
        if ctx.is_check_tx() {
            self.check_min_gas_prices(&tx.fee.amount, tx.fee.gas)?;
        }

        // sequence
        let mut accounts = signers
            .iter()
            .zip(&tx.signatures)
            .map(|(signer, sig)| self.signer_account(ctx, signer, sig.sequence))
            .collect::<Result<Vec<_>>>()?;

        // signature
        for (account, sig) in accounts.iter_mut().zip(&tx.signatures) {
            let bytes = tx.sign_bytes(ctx.chain_id(), self.sign_account_number(ctx, account), sig.sequence)?;
            self.verify(account, &sig.pub_key, &bytes, &sig.signature)?;
        }

        // fee
        if !tx.fee.amount.is_empty() {
            self.supply
                .send_coins_from_account_to_module(ctx, &signers[0], FEE_COLLECTOR, &tx.fee.amount)?;
        }

        // gas
        if !ctx.is_genesis() {
            ctx.set_gas_meter(GasMeter::with_limit(tx.fee.gas));
        }
        ctx.consume_gas(params.tx_size_cost_per_byte.saturating_mul(tx_len as u64), "txSize")?;
        for _ in &tx.signatures {
            ctx.consume_gas(params.sig_verify_cost_ed25519, "ante verify: ed25519")?;
        }

        self.increment_sequences(ctx, accounts)?;

        Ok(AnteOutcome {
            gas_wanted: tx.fee.gas,
            fee: tx.fee.amount.clone(),
            signers,
        })
    }

    fn run_evm(&self, ctx: &mut Context<'_>, tx: &EvmTx) -> Result<AnteOutcome> {
        let msg = &tx.msg;

        // validate
        msg.validate_basic()?;
        self.check_gas_limit(msg.gas_limit)?;
        if tx.signature.is_empty() {
            return Err(Error::NoSignatures);
        }
        let denom = self.evm.params(ctx)?.evm_denom;
        let fee = Coins::single(denom, msg.fee()?);
        if ctx.is_check_tx() {
            self.check_min_gas_prices(&fee, msg.gas_limit)?;
        }

        // sequence
        let mut account = self.signer_account(ctx, &msg.from, msg.nonce)?;

        // signature
        let bytes = tx.sign_bytes(ctx.chain_id(), self.sign_account_number(ctx, &account))?;
        self.verify(&mut account, &tx.pub_key, &bytes, &tx.signature)?;

        // fee
        self.supply
            .send_coins_from_account_to_module(ctx, &msg.from, FEE_COLLECTOR, &fee)?;

        // gas: the evm module installs the limited meter after execution
        ctx.set_gas_meter(GasMeter::infinite());

        self.increment_sequences(ctx, vec![account])?;

        Ok(AnteOutcome {
            gas_wanted: msg.gas_limit,
            fee,
            signers: vec![msg.from],
        })
    }

    fn check_gas_limit(&self, gas: u64) -> Result<()> {
        if gas == 0 {
            return Err(Error::ValidateBasic("gas limit must be positive".into()));
        }
        if self.max_block_gas > 0 && gas > self.max_block_gas {
            return Err(Error::InvalidRequest(format!(
                "gas wanted {} exceeds block maximum {}",
                gas, self.max_block_gas
            )));
        }
        Ok(())
    }

    /// Fee must cover `price * gas` in at least one configured denomination
    fn check_min_gas_prices(&self, fee: &Coins, gas: u64) -> Result<()> {
        if self.min_gas_prices.is_empty() {
            return Ok(());
        }
        let gas = Decimal::from(gas);
        let mut required = Vec::new();
        for (denom, price) in self.min_gas_prices.iter() {
            let needed = price
                .checked_mul(gas)
                .ok_or_else(|| Error::InsufficientFee("required fee overflows".into()))?
                .ceil();
            if needed.is_zero() || dec_from_amount(fee.amount_of(denom))? >= needed {
                return Ok(());
            }
            required.push(format!("{}{}", needed, denom));
        }
        Err(Error::InsufficientFee(format!(
            "insufficient fees; got: {} required: {}",
            fee,
            required.join(",")
        )))
    }

    fn signer_account(&self, ctx: &mut Context<'_>, signer: &Address, declared: u64) -> Result<Account> {
        let account = self
            .accounts
            .get_account(ctx, signer)?
            .ok_or_else(|| Error::UnknownAddress(format!("account {} does not exist", signer)))?;
        if account.sequence() != declared {
            return Err(Error::SequenceMismatch {
                expected: account.sequence(),
                got: declared,
            });
        }
        Ok(account)
    }

    /// Genesis transactions are signed before account numbers exist
    fn sign_account_number(&self, ctx: &Context<'_>, account: &Account) -> u64 {
        if ctx.is_genesis() {
            0
        } else {
            account.account_number()
        }
    }

    fn verify(&self, account: &mut Account, pub_key: &PubKey, bytes: &[u8], signature: &[u8]) -> Result<()> {
        if Address::from_public_key(pub_key) != account.address() {
            return Err(Error::InvalidSignature(format!(
                "key {} does not belong to {}",
                pub_key,
                account.address()
            )));
        }
        if let Some(stored) = account.pub_key() {
            if &stored != pub_key {
                return Err(Error::InvalidSignature(format!(
                    "key {} differs from the key stored for {}",
                    pub_key,
                    account.address()
                )));
            }
        }
        if !verify_signature(bytes, signature, &pub_key.0) {
            return Err(Error::InvalidSignature(format!(
                "signature of {} does not verify",
                account.address()
            )));
        }
        account.base_mut().pub_key = Some(*pub_key);
        Ok(())
    }

    fn increment_sequences(&self, ctx: &mut Context<'_>, accounts: Vec<Account>) -> Result<()> {
        for mut account in accounts {
            account.base_mut().sequence += 1;
            self.accounts.set_account(ctx, &account)?;
        }
        Ok(())
    }
}
