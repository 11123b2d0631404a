//! Reward schedule and fee arithmetic

use crate::config::ChainConfig;
use crate::error::{ConsensusError, Result};
use crate::types::*;

/// baseReward: ℕ → ℕ
///
/// The reward of the first block is `initial_reward`; it halves every
/// `halving_interval` blocks counted from the first block. A zero interval
/// disables halving.
pub fn base_reward(config: &ChainConfig, height: Height) -> Value {
    if config.halving_interval == 0 || height <= config.genesis_height {
        return config.initial_reward;
    }
    let halvings = (height - config.first_block_height()) / config.halving_interval;

    // After 64 halvings the reward is 0
    if halvings >= 64 {
        return 0;
    }
    config.initial_reward >> halvings
}

/// Sum of output values, failing on overflow
pub fn total_output_value(tx: &Transaction) -> Result<Value> {
    tx.outputs.iter().try_fold(0u64, |acc, output| {
        acc.checked_add(output.value)
            .ok_or_else(|| ConsensusError::ValueImbalance("output sum overflows".into()))
    })
}

/// Expected coinbase value: baseReward(height) + Σ fees
pub fn coinbase_value(config: &ChainConfig, height: Height, fees: Value) -> Result<Value> {
    base_reward(config, height)
        .checked_add(fees)
        .ok_or_else(|| ConsensusError::ValueImbalance("reward plus fees overflows".into()))
}
