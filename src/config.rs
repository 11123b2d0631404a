//! Immutable network configuration threaded through construction

use crate::constants::*;
use crate::error::{ConsensusError, Result};
use crate::types::{Hash, Height, Value};
use serde::{Deserialize, Serialize};

/// Network parameters. Every node of one network must agree on the
/// consensus fields (genesis, reward, target rules, ΔT).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub genesis_height: Height,
    #[serde(with = "hex::serde")]
    pub genesis_hash: Hash,
    pub initial_reward: Value,
    pub halving_interval: u64,
    pub timestamp_tolerance_ms: u64,
    #[serde(with = "hex::serde")]
    pub initial_target: Hash,
    pub target_block_time_ms: u64,
    pub retarget_interval: u64,
    pub max_block_transactions: usize,
    pub mempool_capacity: usize,
    pub miner_check_interval: u64,
    pub miner_refresh_ms: u64,
    pub event_channel_capacity: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            genesis_height: GENESIS_HEIGHT,
            genesis_hash: GENESIS_HASH,
            initial_reward: INITIAL_REWARD,
            halving_interval: HALVING_INTERVAL,
            timestamp_tolerance_ms: TIMESTAMP_TOLERANCE_MS,
            initial_target: INITIAL_TARGET,
            target_block_time_ms: TARGET_BLOCK_TIME_MS,
            retarget_interval: RETARGET_INTERVAL,
            max_block_transactions: MAX_BLOCK_TRANSACTIONS,
            mempool_capacity: MEMPOOL_CAPACITY,
            miner_check_interval: MINER_CHECK_INTERVAL,
            miner_refresh_ms: MINER_REFRESH_MS,
            event_channel_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl ChainConfig {
    /// Parse a JSON document; absent fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ChainConfig = serde_json::from_str(json)
            .map_err(|e| ConsensusError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_target == [0u8; 32] {
            return Err(ConsensusError::InvalidConfig("initial_target must be non-zero".into()));
        }
        if self.target_block_time_ms == 0 {
            return Err(ConsensusError::InvalidConfig(
                "target_block_time_ms must be positive".into(),
            ));
        }
        if self.miner_check_interval == 0 || self.miner_check_interval > MAX_MINER_CHECK_INTERVAL {
            return Err(ConsensusError::InvalidConfig(format!(
                "miner_check_interval must be in 1..={}",
                MAX_MINER_CHECK_INTERVAL
            )));
        }
        if self.max_block_transactions == 0 || self.mempool_capacity == 0 {
            return Err(ConsensusError::InvalidConfig("capacities must be positive".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConsensusError::InvalidConfig(
                "event_channel_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Height the first real block must carry
    pub fn first_block_height(&self) -> Height {
        self.genesis_height + 1
    }
}
