//! Transaction encodings
//!
//! Two encodings share one decoder:
//!
//! - [`StdTx`]: several messages, one signature per unique signer, an
//!   explicit fee and gas limit
//! - [`EvmTx`]: one VM payload with a single signer; nonce, gas price and
//!   gas limit live in the payload
//!
//! Sign bytes are bincode of a sign document bound to the chain id, so a
//! signature is never valid on another chain.

use chain_modules::{
    evm::MsgEthereumTx, Address, Coins, Error as ModuleError, Msg, PubKey, Result,
};
use chain_store::crypto::KeyPair;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Fee and gas limit of a standard transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdFee {
    /// Paid by the first signer
    pub amount: Coins,
    /// Gas limit
    pub gas: u64,
}

/// One signer's signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdSignature {
    /// Key whose hash is the signer address
    pub pub_key: PubKey,
    /// Sequence the signer declares
    pub sequence: u64,
    /// Ed25519 signature over the sign bytes
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Multi-message transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdTx {
    /// Messages, executed in order
    pub msgs: Vec<Msg>,
    /// Fee
    pub fee: StdFee,
    /// Free text
    pub memo: String,
    /// Signatures, ordered like [`StdTx::signers`]
    pub signatures: Vec<StdSignature>,
}

#[derive(Serialize)]
struct StdSignDoc<'a> {
    chain_id: &'a str,
    account_number: u64,
    sequence: u64,
    fee: &'a StdFee,
    memo: &'a str,
    msgs: &'a [Msg],
}

impl StdTx {
    /// Unique signers in first-appearance order; the first pays the fee
    pub fn signers(&self) -> Vec<Address> {
        let mut seen = BTreeSet::new();
        self.msgs
            .iter()
            .flat_map(Msg::signers)
            .filter(|signer| seen.insert(*signer))
            .collect()
    }

    /// Bytes a signer with `account_number` and `sequence` signs
    pub fn sign_bytes(&self, chain_id: &str, account_number: u64, sequence: u64) -> Result<Vec<u8>> {
        std_sign_bytes(chain_id, account_number, sequence, &self.fee, &self.memo, &self.msgs)
    }

    /// Build and sign; `signers` supplies key, account number and sequence
    /// for each signer, in signer order
    pub fn sign(
        msgs: Vec<Msg>,
        fee: StdFee,
        memo: impl Into<String>,
        chain_id: &str,
        signers: &[(&KeyPair, u64, u64)],
    ) -> Result<Self> {
        let memo = memo.into();
        let signatures = signers
            .iter()
            .map(|(key, account_number, sequence)| {
                let bytes = std_sign_bytes(chain_id, *account_number, *sequence, &fee, &memo, &msgs)?;
                Ok(StdSignature {
                    pub_key: PubKey(key.public_key()),
                    sequence: *sequence,
                    signature: key.sign(&bytes).to_vec(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            msgs,
            fee,
            memo,
            signatures,
        })
    }
}

fn std_sign_bytes(
    chain_id: &str,
    account_number: u64,
    sequence: u64,
    fee: &StdFee,
    memo: &str,
    msgs: &[Msg],
) -> Result<Vec<u8>> {
    let doc = StdSignDoc {
        chain_id,
        account_number,
        sequence,
        fee,
        memo,
        msgs,
    };
    bincode::serialize(&doc).map_err(|e| ModuleError::Decode(e.to_string()))
}

/// VM transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvmTx {
    /// Payload
    pub msg: MsgEthereumTx,
    /// Sender's key
    pub pub_key: PubKey,
    /// Ed25519 signature over the sign bytes
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct EvmSignDoc<'a> {
    chain_id: &'a str,
    account_number: u64,
    msg: &'a MsgEthereumTx,
}

impl EvmTx {
    /// Bytes the sender signs; the nonce is part of `msg`
    pub fn sign_bytes(&self, chain_id: &str, account_number: u64) -> Result<Vec<u8>> {
        evm_sign_bytes(chain_id, account_number, &self.msg)
    }

    /// Build and sign
    pub fn sign(msg: MsgEthereumTx, chain_id: &str, account_number: u64, key: &KeyPair) -> Result<Self> {
        let bytes = evm_sign_bytes(chain_id, account_number, &msg)?;
        Ok(Self {
            msg,
            pub_key: PubKey(key.public_key()),
            signature: key.sign(&bytes).to_vec(),
        })
    }
}

fn evm_sign_bytes(chain_id: &str, account_number: u64, msg: &MsgEthereumTx) -> Result<Vec<u8>> {
    let doc = EvmSignDoc {
        chain_id,
        account_number,
        msg,
    };
    bincode::serialize(&doc).map_err(|e| ModuleError::Decode(e.to_string()))
}

/// Any accepted transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Tx {
    /// Standard encoding
    Std(StdTx),
    /// VM encoding
    Evm(EvmTx),
}

impl Tx {
    /// Decode raw bytes
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(ModuleError::Decode("empty transaction".into()));
        }
        bincode::deserialize(bytes).map_err(|e| ModuleError::Decode(e.to_string()))
    }

    /// Encode to raw bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| ModuleError::Decode(e.to_string()))
    }

    /// Messages to route after the ante pipeline
    pub fn msgs(&self) -> Vec<Msg> {
        match self {
            Tx::Std(tx) => tx.msgs.clone(),
            Tx::Evm(tx) => vec![Msg::EthereumTx(tx.msg.clone())],
        }
    }

    /// Gas requested
    pub fn gas(&self) -> u64 {
        match self {
            Tx::Std(tx) => tx.fee.gas,
            Tx::Evm(tx) => tx.msg.gas_limit,
        }
    }
}

impl From<StdTx> for Tx {
    fn from(tx: StdTx) -> Self {
        Tx::Std(tx)
    }
}

impl From<EvmTx> for Tx {
    fn from(tx: EvmTx) -> Self {
        Tx::Evm(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chain_modules::bank::MsgSend;

    fn send(from: Address, to: Address) -> Msg {
        MsgSend {
            from_address: from,
            to_address: to,
            amount: Coins::single("aphoton", 5),
        }
        .into()
    }

    #[test]
    fn test_signers_unique_in_order() {
        let (a, b) = (Address([1; 20]), Address([2; 20]));
        let tx = StdTx {
            msgs: vec![send(b, a), send(a, b), send(b, a)],
            fee: StdFee {
                amount: Coins::empty(),
                gas: 1,
            },
            memo: String::new(),
            signatures: Vec::new(),
        };
        assert_eq!(tx.signers(), vec![b, a]);
    }

    #[test]
    fn test_sign_bytes_bound_to_chain_and_sequence() {
        let key = KeyPair::from_seed(&[7; 32]);
        let from = Address::from_public_key(&PubKey(key.public_key()));
        let fee = StdFee {
            amount: Coins::single("aphoton", 1),
            gas: 200_000,
        };
        let tx = StdTx::sign(vec![send(from, Address([2; 20]))], fee, "", "chain-a", &[(&key, 0, 3)]).unwrap();

        let bytes = tx.sign_bytes("chain-a", 0, 3).unwrap();
        assert!(chain_store::crypto::verify_signature(&bytes, &tx.signatures[0].signature, &key.public_key()));
        assert_ne!(bytes, tx.sign_bytes("chain-b", 0, 3).unwrap());
        assert_ne!(bytes, tx.sign_bytes("chain-a", 0, 4).unwrap());
        assert_eq!(tx.signatures[0].sequence, 3);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(Tx::decode(&[]), Err(ModuleError::Decode(_))));
        assert!(matches!(Tx::decode(&[9, 9, 9]), Err(ModuleError::Decode(_))));
    }
}
