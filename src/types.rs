//! Core chain-state types

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Hash type: 256-bit SHA-256 digest
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Block height
pub type Height = u64;

/// Milliseconds since the Unix epoch
pub type Timestamp = u64;

/// Amount in the smallest unit
pub type Value = u64;

/// Hex of RIPEMD-160(SHA-256(compressed public key))
pub type Address = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    Coinbase,
    Normal,
}

impl TransactionType {
    pub fn code(self) -> u64 {
        match self {
            TransactionType::Coinbase => 0,
            TransactionType::Normal => 1,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(TransactionType::Coinbase),
            1 => Some(TransactionType::Normal),
            _ => None,
        }
    }
}

/// Reference to a transaction output: (txHash, outputIndex)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_hash: Hash,
    pub index: u64,
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", hex::encode(self.tx_hash), self.index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    /// Unlocking script: L(DER signature) ‖ L(public key)
    pub script: ByteString,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub address: Address,
    pub value: Value,
    pub output_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_type: TransactionType,
    pub timestamp: Timestamp,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: Height,
    pub timestamp: Timestamp,
    pub previous_block_hash: Hash,
    pub merkle_root: Hash,
    pub nonce: u64,
    pub hash: Hash,
    pub transactions: Vec<Transaction>,
}

/// Entry of the UTXO index keyed by `OutPoint`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub address: Address,
    pub value: Value,
    pub creation_height: Height,
}

/// Highest committed block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTail {
    pub height: Height,
    pub hash: Hash,
    pub timestamp: Timestamp,
}

/// A committed transaction with its position in the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRecord {
    pub transaction: Transaction,
    pub block_height: Height,
    /// Position in the global committed transaction order
    pub sequence: u64,
    /// Global sequence of the first output of this transaction
    pub first_output_sequence: u64,
}

/// An output owned by an address, spent or not
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressOutput {
    pub outpoint: OutPoint,
    pub address: Address,
    pub value: Value,
    pub creation_height: Height,
    pub spent_by: Option<Hash>,
}

/// Read-only view of committed chain state used by the validators.
pub trait ChainState {
    fn tail(&self) -> Result<Option<ChainTail>>;

    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>>;

    fn block_timestamp_at(&self, height: Height) -> Result<Option<Timestamp>>;

    /// Big-endian target of retarget epoch `epoch`, when the view keeps one
    fn epoch_target(&self, _epoch: u64) -> Result<Option<[u8; 32]>> {
        Ok(None)
    }
}

/// UTXO Set: OutPoint → Utxo
pub type UtxoSet = HashMap<OutPoint, Utxo>;

/// A bare UTXO set is a view of an empty chain holding those outputs.
impl ChainState for UtxoSet {
    fn tail(&self) -> Result<Option<ChainTail>> {
        Ok(None)
    }

    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>> {
        Ok(self.get(outpoint).cloned())
    }

    fn block_timestamp_at(&self, _height: Height) -> Result<Option<Timestamp>> {
        Ok(None)
    }
}

impl<T: ChainState + ?Sized> ChainState for &T {
    fn tail(&self) -> Result<Option<ChainTail>> {
        (**self).tail()
    }

    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>> {
        (**self).utxo(outpoint)
    }

    fn block_timestamp_at(&self, height: Height) -> Result<Option<Timestamp>> {
        (**self).block_timestamp_at(height)
    }

    fn epoch_target(&self, epoch: u64) -> Result<Option<[u8; 32]>> {
        (**self).epoch_target(epoch)
    }
}
