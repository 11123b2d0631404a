//! Wire format for externally submitted transactions

use crate::codec::hash_from_hex;
use crate::error::{ConsensusError, Result};
use crate::transaction::rehash;
use crate::types::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInputDto {
    pub prev_tx_hash: String,
    pub output_index: u64,
    /// Hex unlocking script
    pub script: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOutputDto {
    pub address: Address,
    pub value: Value,
}

/// `{timestamp, inputs: [{prevTxHash, outputIndex, script}], outputs: [{address, value}]}`
///
/// A `transactionHash` may be present; it is informational only and never
/// trusted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDto {
    pub timestamp: Timestamp,
    pub inputs: Vec<TransactionInputDto>,
    pub outputs: Vec<TransactionOutputDto>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
}

impl TransactionDto {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ConsensusError::Encoding(format!("transaction json: {}", e)))
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ConsensusError::Encoding(e.to_string()))
    }

    /// NORMAL transaction with every hash recomputed
    pub fn into_transaction(self) -> Result<Transaction> {
        let mut inputs = Vec::with_capacity(self.inputs.len());
        for input in self.inputs {
            let script = hex::decode(&input.script)
                .map_err(|e| ConsensusError::Encoding(format!("script {}: {}", input.script, e)))?;
            let tx_hash = hash_from_hex(&input.prev_tx_hash)?;
            inputs.push(TransactionInput {
                prevout: OutPoint { tx_hash, index: input.output_index },
                script,
            });
        }
        let outputs = self
            .outputs
            .into_iter()
            .map(|o| TransactionOutput { address: o.address, value: o.value, output_hash: [0; 32] })
            .collect();

        let mut tx = Transaction {
            transaction_type: TransactionType::Normal,
            timestamp: self.timestamp,
            inputs,
            outputs,
            hash: [0; 32],
        };
        rehash(&mut tx);
        Ok(tx)
    }

    pub fn from_transaction(tx: &Transaction) -> Self {
        Self {
            timestamp: tx.timestamp,
            inputs: tx
                .inputs
                .iter()
                .map(|i| TransactionInputDto {
                    prev_tx_hash: hex::encode(i.prevout.tx_hash),
                    output_index: i.prevout.index,
                    script: hex::encode(&i.script),
                })
                .collect(),
            outputs: tx
                .outputs
                .iter()
                .map(|o| TransactionOutputDto { address: o.address.clone(), value: o.value })
                .collect(),
            transaction_hash: Some(hex::encode(tx.hash)),
        }
    }
}
