//! Default network constants

use crate::types::{Hash, Height, Value};

/// Height of the virtual genesis; the first real block sits at GENESIS_HEIGHT + 1
pub const GENESIS_HEIGHT: Height = 0;

/// previousBlockHash of the first block
pub const GENESIS_HASH: Hash = [0u8; 32];

/// Reward of the first block
pub const INITIAL_REWARD: Value = 50;

/// Reward halves every HALVING_INTERVAL blocks
pub const HALVING_INTERVAL: u64 = 210_000;

/// ΔT: permitted skew between a transaction timestamp and its block (2 hours)
pub const TIMESTAMP_TOLERANCE_MS: u64 = 2 * 60 * 60 * 1000;

/// Target time per block: 1 minute
pub const TARGET_BLOCK_TIME_MS: u64 = 60_000;

/// Blocks per retarget epoch
pub const RETARGET_INTERVAL: u64 = 10;

/// Easiest allowed target (16 leading zero bits)
pub const INITIAL_TARGET: Hash = [
    0x00, 0x00, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// Maximum NORMAL transactions per mined block
pub const MAX_BLOCK_TRANSACTIONS: usize = 1000;

/// Maximum transactions held by the mempool
pub const MEMPOOL_CAPACITY: usize = 10_000;

/// Hash iterations between cancellation and tail polls
pub const MINER_CHECK_INTERVAL: u64 = 1024;

/// Upper bound for MINER_CHECK_INTERVAL
pub const MAX_MINER_CHECK_INTERVAL: u64 = 4096;

/// Timestamp refresh period while solving
pub const MINER_REFRESH_MS: u64 = 10_000;

/// Capacity of each event subscription channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Width of the big-endian length prefix in canonical encodings
pub const LENGTH_PREFIX_BYTES: usize = 8;
