//! Transaction construction and admission rules

use crate::codec::{output_hash, signature_message, transaction_hash};
use crate::config::ChainConfig;
use crate::economic::total_output_value;
use crate::error::{ConsensusError, Result};
use crate::script::verify_script;
use crate::types::*;
use std::collections::HashSet;

/// Build a COINBASE paying `value` to `address`
pub fn new_coinbase(timestamp: Timestamp, address: Address, value: Value) -> Transaction {
    let mut tx = Transaction {
        transaction_type: TransactionType::Coinbase,
        timestamp,
        inputs: Vec::new(),
        outputs: vec![TransactionOutput { address, value, output_hash: [0; 32] }],
        hash: [0; 32],
    };
    rehash(&mut tx);
    tx
}

/// Build an unsigned NORMAL transaction; scripts are filled in by signing
pub fn new_normal(
    timestamp: Timestamp,
    prevouts: Vec<OutPoint>,
    outputs: Vec<(Address, Value)>,
) -> Transaction {
    let mut tx = Transaction {
        transaction_type: TransactionType::Normal,
        timestamp,
        inputs: prevouts
            .into_iter()
            .map(|prevout| TransactionInput { prevout, script: Vec::new() })
            .collect(),
        outputs: outputs
            .into_iter()
            .map(|(address, value)| TransactionOutput { address, value, output_hash: [0; 32] })
            .collect(),
        hash: [0; 32],
    };
    rehash(&mut tx);
    tx
}

/// Recompute the transaction hash, then every output hash
pub fn rehash(tx: &mut Transaction) {
    tx.hash = transaction_hash(tx);
    let hash = tx.hash;
    for (i, output) in tx.outputs.iter_mut().enumerate() {
        output.output_hash = output_hash(&hash, i as u64);
    }
}

pub fn is_coinbase(tx: &Transaction) -> bool {
    tx.transaction_type == TransactionType::Coinbase
}

/// CheckTransaction: 𝒯𝒳 → {valid, invalid}
///
/// Context-free rules:
/// 1. COINBASE: |ins| = 0 ∧ |outs| = 1
/// 2. NORMAL: |ins| > 0 ∧ |outs| > 0, inputs pairwise distinct
/// 3. ∀o ∈ outs: o.value > 0 ∧ o.address is non-empty ASCII alphanumeric
/// 4. tx.hash = transactionHash(tx) ∧ ∀i: outs[i].hash = outputHash(tx, i)
pub fn check_transaction(tx: &Transaction) -> Result<()> {
    // 1-2. Shape by type
    match tx.transaction_type {
        TransactionType::Coinbase => {
            if !tx.inputs.is_empty() || tx.outputs.len() != 1 {
                return Err(ConsensusError::CoinbaseRuleViolation(format!(
                    "coinbase must have 0 inputs and 1 output, got {} and {}",
                    tx.inputs.len(),
                    tx.outputs.len()
                )));
            }
        }
        TransactionType::Normal => {
            if tx.inputs.is_empty() || tx.outputs.is_empty() {
                return Err(ConsensusError::MalformedTransaction("Empty inputs or outputs".into()));
            }
            let mut seen = HashSet::with_capacity(tx.inputs.len());
            for input in &tx.inputs {
                if !seen.insert(&input.prevout) {
                    return Err(ConsensusError::DoubleSpendInBlock(format!(
                        "transaction {} spends {} twice",
                        hex::encode(tx.hash),
                        input.prevout
                    )));
                }
            }
        }
    }

    // 3. Output values and owners
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.value == 0 {
            return Err(ConsensusError::MalformedTransaction(format!(
                "Zero output value at index {}",
                i
            )));
        }
        if output.address.is_empty() || !output.address.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ConsensusError::MalformedTransaction(format!(
                "Invalid address {:?} at index {}",
                output.address, i
            )));
        }
    }

    // 4. Hash fields
    let expected = transaction_hash(tx);
    if tx.hash != expected {
        return Err(ConsensusError::HashMismatch(format!(
            "transaction hash {} != recomputed {}",
            hex::encode(tx.hash),
            hex::encode(expected)
        )));
    }
    for (i, output) in tx.outputs.iter().enumerate() {
        if output.output_hash != output_hash(&expected, i as u64) {
            return Err(ConsensusError::HashMismatch(format!(
                "output hash mismatch at index {} of {}",
                i,
                hex::encode(expected)
            )));
        }
    }

    Ok(())
}

/// Temporal context a transaction is judged in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampPolicy {
    /// Mempool admission: within ±ΔT/2 of the wall clock
    Mempool { now: Timestamp },
    /// Inclusion in a block: within ±ΔT of the block timestamp
    Block { block_timestamp: Timestamp },
}

pub fn check_timestamp(
    tx: &Transaction,
    policy: TimestampPolicy,
    config: &ChainConfig,
) -> Result<()> {
    let (center, tolerance) = match policy {
        TimestampPolicy::Mempool { now } => (now, config.timestamp_tolerance_ms / 2),
        TimestampPolicy::Block { block_timestamp } => {
            (block_timestamp, config.timestamp_tolerance_ms)
        }
    };
    let low = center.saturating_sub(tolerance);
    let high = center.saturating_add(tolerance);
    if tx.timestamp < low || tx.timestamp > high {
        return Err(ConsensusError::TimestampOutOfRange(format!(
            "transaction timestamp {} outside [{}, {}]",
            tx.timestamp, low, high
        )));
    }
    Ok(())
}

/// CheckTxInputs: 𝒯𝒳 × 𝒰𝒮 → {valid, invalid} × ℕ
///
/// For a NORMAL transaction tx against view us:
/// 1. ∀i ∈ ins: us(i.prevout) exists
/// 2. ∀i ∈ ins: script(i) verifies against us(i.prevout).address
/// 3. Let total_in = Σᵢ us(i.prevout).value, total_out = Σₒ o.value
/// 4. If total_in < total_out: invalid
/// 5. Return total_in - total_out (the fee)
pub fn check_tx_inputs<V: ChainState>(tx: &Transaction, view: &V) -> Result<Value> {
    if is_coinbase(tx) {
        return Ok(0);
    }

    let message = signature_message(tx);
    let mut total_input_value: Value = 0;
    for (i, input) in tx.inputs.iter().enumerate() {
        let utxo = view.utxo(&input.prevout)?.ok_or_else(|| {
            ConsensusError::UnknownUtxo(format!("input {} references {}", i, input.prevout))
        })?;
        verify_script(&input.script, &utxo.address, &message)?;
        total_input_value = total_input_value
            .checked_add(utxo.value)
            .ok_or_else(|| ConsensusError::ValueImbalance("input sum overflows".into()))?;
    }

    let total_out = total_output_value(tx)?;
    if total_input_value < total_out {
        return Err(ConsensusError::ValueImbalance(format!(
            "inputs {} < outputs {}",
            total_input_value, total_out
        )));
    }
    Ok(total_input_value - total_out)
}

/// Full admission of a NORMAL transaction; returns its fee
pub fn validate_transaction<V: ChainState>(
    tx: &Transaction,
    view: &V,
    policy: TimestampPolicy,
    config: &ChainConfig,
) -> Result<Value> {
    if is_coinbase(tx) {
        return Err(ConsensusError::CoinbaseRuleViolation(
            "coinbase is only valid at index 0 of a block".into(),
        ));
    }
    check_transaction(tx)?;
    check_timestamp(tx, policy, config)?;
    check_tx_inputs(tx, view)
}

/// Coinbase rules inside a block at `block_timestamp`
pub fn check_coinbase(
    tx: &Transaction,
    block_timestamp: Timestamp,
    expected_value: Value,
) -> Result<()> {
    if !is_coinbase(tx) {
        return Err(ConsensusError::CoinbaseRuleViolation(
            "first transaction is not a coinbase".into(),
        ));
    }
    check_transaction(tx)?;
    if tx.timestamp != block_timestamp {
        return Err(ConsensusError::TimestampOutOfRange(format!(
            "coinbase timestamp {} != block timestamp {}",
            tx.timestamp, block_timestamp
        )));
    }
    let value = tx.outputs[0].value;
    if value != expected_value {
        return Err(ConsensusError::ValueImbalance(format!(
            "coinbase pays {} but reward plus fees is {}",
            value, expected_value
        )));
    }
    Ok(())
}
