//! Block admission rules

use crate::codec::{block_hash, transactions_merkle_root};
use crate::config::ChainConfig;
use crate::economic::coinbase_value;
use crate::error::{ConsensusError, Result};
use crate::pow::{check_proof_of_work, target_for_height};
use crate::transaction::{check_coinbase, is_coinbase, validate_transaction, TimestampPolicy};
use crate::types::*;
use std::collections::HashSet;

/// (previousBlockHash, height) the next block must carry
pub fn expected_linkage(tail: Option<&ChainTail>, config: &ChainConfig) -> (Hash, Height) {
    match tail {
        Some(t) => (t.hash, t.height + 1),
        None => (config.genesis_hash, config.first_block_height()),
    }
}

/// CheckBlock: ℬ × 𝒞𝒮 × ℕ → {valid, invalid} × ℕ
///
/// For block b against committed view cs at wall clock now:
/// 1. b.prev = tail.hash ∧ b.height = tail.height + 1 (genesis when empty)
/// 2. tail.timestamp < b.timestamp ≤ now
/// 3. b.merkle = Merkle(b.txs) ∧ b.hash = blockHash(b)
/// 4. b.hash ≤ target(b.height)
/// 5. b.txs[0] is the only COINBASE
/// 6. block, transaction and output hashes pairwise distinct
/// 7. no outpoint spent twice across b.txs
/// 8. ∀tx ∈ b.txs[1..]: tx admissible against cs (no intra-block chaining)
/// 9. coinbase value = baseReward(b.height) + Σ fees
///
/// Returns Σ fees.
pub fn check_block<V: ChainState>(
    block: &Block,
    view: &V,
    config: &ChainConfig,
    now: Timestamp,
) -> Result<Value> {
    // 1. Linkage
    let tail = view.tail()?;
    let (expected_prev, expected_height) = expected_linkage(tail.as_ref(), config);
    if block.previous_block_hash != expected_prev {
        return Err(ConsensusError::Linkage(format!(
            "previous hash {} does not match tail {}",
            hex::encode(block.previous_block_hash),
            hex::encode(expected_prev)
        )));
    }
    if block.height != expected_height {
        return Err(ConsensusError::Linkage(format!(
            "height {} does not follow tail, expected {}",
            block.height, expected_height
        )));
    }

    // 2. Timestamp
    if let Some(t) = tail {
        if block.timestamp <= t.timestamp {
            return Err(ConsensusError::TimestampOutOfRange(format!(
                "block timestamp {} not after tail timestamp {}",
                block.timestamp, t.timestamp
            )));
        }
    }
    if block.timestamp > now {
        return Err(ConsensusError::TimestampOutOfRange(format!(
            "block timestamp {} is in the future (now {})",
            block.timestamp, now
        )));
    }

    // 3. Merkle root and block hash
    let merkle_root = transactions_merkle_root(&block.transactions);
    if merkle_root != block.merkle_root {
        return Err(ConsensusError::HashMismatch(format!(
            "merkle root {} != recomputed {}",
            hex::encode(block.merkle_root),
            hex::encode(merkle_root)
        )));
    }
    let hash = block_hash(block);
    if hash != block.hash {
        return Err(ConsensusError::HashMismatch(format!(
            "block hash {} != recomputed {}",
            hex::encode(block.hash),
            hex::encode(hash)
        )));
    }

    // 4. Proof of work
    let target = target_for_height(config, view, block.height)?;
    if !check_proof_of_work(&hash, &target) {
        return Err(ConsensusError::ProofOfWorkInsufficient(format!(
            "hash {} above target {}",
            hex::encode(hash),
            hex::encode(target.to_be_bytes())
        )));
    }

    // 5. Coinbase position
    let coinbase = block
        .transactions
        .first()
        .ok_or_else(|| ConsensusError::CoinbaseRuleViolation("block has no transactions".into()))?;
    if !is_coinbase(coinbase) {
        return Err(ConsensusError::CoinbaseRuleViolation(
            "first transaction is not a coinbase".into(),
        ));
    }
    if let Some(i) = block.transactions.iter().skip(1).position(is_coinbase) {
        return Err(ConsensusError::CoinbaseRuleViolation(format!(
            "extra coinbase at index {}",
            i + 1
        )));
    }

    // 6. Hash uniqueness
    if !has_no_duplicate_new_hashes(block) {
        return Err(ConsensusError::DuplicateHashInBlock(format!(
            "block {} repeats a block, transaction or output hash",
            hex::encode(block.hash)
        )));
    }

    // 7. Double spends across the block
    let mut spent = HashSet::new();
    for tx in &block.transactions {
        for input in &tx.inputs {
            if !spent.insert(&input.prevout) {
                return Err(ConsensusError::DoubleSpendInBlock(format!(
                    "{} spent twice in block {}",
                    input.prevout,
                    hex::encode(block.hash)
                )));
            }
        }
    }

    // 8. Per-transaction admission against committed state
    let policy = TimestampPolicy::Block { block_timestamp: block.timestamp };
    let mut fees: Value = 0;
    for tx in block.transactions.iter().skip(1) {
        let fee = validate_transaction(tx, view, policy, config)?;
        fees = fees
            .checked_add(fee)
            .ok_or_else(|| ConsensusError::ValueImbalance("fee sum overflows".into()))?;
    }

    // 9. Coinbase value
    check_coinbase(coinbase, block.timestamp, coinbase_value(config, block.height, fees)?)?;

    Ok(fees)
}

/// True iff the block hash, every transaction hash and every output hash
/// are mutually distinct.
pub fn has_no_duplicate_new_hashes(block: &Block) -> bool {
    let mut seen = HashSet::new();
    if !seen.insert(block.hash) {
        return false;
    }
    for tx in &block.transactions {
        if !seen.insert(tx.hash) {
            return false;
        }
        for output in &tx.outputs {
            if !seen.insert(output.output_hash) {
                return false;
            }
        }
    }
    true
}
