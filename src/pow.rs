//! Proof of Work: target arithmetic and retargeting

use crate::config::ChainConfig;
use crate::error::{ConsensusError, Result};
use crate::types::*;
use std::cmp::Ordering;

/// 256-bit unsigned integer, little-endian 64-bit words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct U256([u64; 4]);

impl U256 {
    pub const ZERO: U256 = U256([0; 4]);
    pub const ONE: U256 = U256([1, 0, 0, 0]);
    pub const MAX: U256 = U256([u64::MAX; 4]);

    pub fn from_be_bytes(bytes: &[u8; 32]) -> Self {
        let mut words = [0u64; 4];
        for (i, word) in words.iter_mut().enumerate() {
            let start = 32 - (i + 1) * 8;
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[start..start + 8]);
            *word = u64::from_be_bytes(chunk);
        }
        U256(words)
    }

    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, word) in self.0.iter().enumerate() {
            let start = 32 - (i + 1) * 8;
            bytes[start..start + 8].copy_from_slice(&word.to_be_bytes());
        }
        bytes
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&x| x == 0)
    }

    /// Multiply by a u64, saturating at MAX
    pub fn saturating_mul_u64(&self, rhs: u64) -> Self {
        let mut result = [0u64; 4];
        let mut carry = 0u128;
        for (i, word) in self.0.iter().enumerate() {
            let product = (*word as u128) * (rhs as u128) + carry;
            result[i] = product as u64;
            carry = product >> 64;
        }
        if carry != 0 {
            return U256::MAX;
        }
        U256(result)
    }

    /// Divide by a non-zero u64
    pub fn div_u64(&self, rhs: u64) -> Self {
        debug_assert!(rhs != 0);
        let mut result = [0u64; 4];
        let mut remainder = 0u128;
        for i in (0..4).rev() {
            let current = (remainder << 64) | self.0[i] as u128;
            result[i] = (current / rhs as u128) as u64;
            remainder = current % rhs as u128;
        }
        U256(result)
    }
}

impl PartialOrd for U256 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for U256 {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.0.iter().rev().zip(other.0.iter().rev()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                other => return other,
            }
        }
        Ordering::Equal
    }
}

/// CheckProofOfWork: ℍ × U256 → {true, false}
///
/// A hash satisfies the target when, read as a big-endian integer, it is
/// less than or equal to the target.
pub fn check_proof_of_work(hash: &Hash, target: &U256) -> bool {
    U256::from_be_bytes(hash) <= *target
}

/// One retarget step: previous × clamp(actual, expected/4, 4·expected) / expected,
/// capped at the PoW limit and floored at 1.
pub fn retarget(previous: &U256, actual_span: u64, expected_span: u64, limit: &U256) -> U256 {
    let min_span = (expected_span / 4).max(1);
    let max_span = expected_span.saturating_mul(4);
    let span = actual_span.clamp(min_span, max_span);

    let next = previous.saturating_mul_u64(span).div_u64(expected_span);
    if next > *limit {
        *limit
    } else if next.is_zero() {
        U256::ONE
    } else {
        next
    }
}

/// Retarget epoch holding `height`, counted from the first block.
/// `None` while retargeting is disabled (`retarget_interval < 2`).
pub fn retarget_epoch(config: &ChainConfig, height: Height) -> Option<u64> {
    let interval = config.retarget_interval;
    if interval < 2 || height < config.first_block_height() {
        return None;
    }
    Some((height - config.first_block_height()) / interval)
}

/// Epoch that starts right after the block at `height`, when that block
/// closes an epoch
pub fn epoch_opened_after(config: &ChainConfig, height: Height) -> Option<u64> {
    let next = retarget_epoch(config, height.checked_add(1)?)?;
    if next > 0 && retarget_epoch(config, height) != Some(next) {
        Some(next)
    } else {
        None
    }
}

/// Target of the epoch following one mined at `previous` whose first and
/// last blocks carry timestamps `first` and `last`.
pub fn next_epoch_target(
    config: &ChainConfig,
    previous: &U256,
    first: Timestamp,
    last: Timestamp,
) -> U256 {
    let limit = U256::from_be_bytes(&config.initial_target);
    let expected_span = config
        .retarget_interval
        .saturating_sub(1)
        .saturating_mul(config.target_block_time_ms)
        .max(1);
    retarget(previous, last.saturating_sub(first), expected_span, &limit)
}

/// target: ℕ → U256
///
/// Heights are grouped into epochs of `retarget_interval` blocks starting at
/// the first block. The first epoch uses the initial target; each later epoch
/// scales the previous epoch's target by how long that epoch actually took.
/// With `retarget_interval < 2` the target is constant.
///
/// Views that keep epoch targets answer with one lookup; other views replay
/// every epoch from the first block.
pub fn target_for_height<V: ChainState>(
    config: &ChainConfig,
    view: &V,
    height: Height,
) -> Result<U256> {
    let limit = U256::from_be_bytes(&config.initial_target);
    let epoch = match retarget_epoch(config, height) {
        Some(epoch) if epoch > 0 => epoch,
        _ => return Ok(limit),
    };
    if let Some(stored) = view.epoch_target(epoch)? {
        return Ok(U256::from_be_bytes(&stored));
    }

    let interval = config.retarget_interval;
    let mut target = limit;
    for e in 1..=epoch {
        let epoch_start = config.first_block_height() + e * interval;
        let first = timestamp_at(view, epoch_start - interval)?;
        let last = timestamp_at(view, epoch_start - 1)?;
        target = next_epoch_target(config, &target, first, last);
    }
    Ok(target)
}

fn timestamp_at<V: ChainState>(view: &V, height: Height) -> Result<Timestamp> {
    view.block_timestamp_at(height)?.ok_or_else(|| {
        ConsensusError::StorageFailure(format!(
            "missing committed block at height {} for retarget",
            height
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::collections::BTreeMap;

    struct Timestamps(BTreeMap<Height, Timestamp>);

    impl ChainState for Timestamps {
        fn tail(&self) -> Result<Option<ChainTail>> {
            Ok(None)
        }
        fn utxo(&self, _outpoint: &OutPoint) -> Result<Option<Utxo>> {
            Ok(None)
        }
        fn block_timestamp_at(&self, height: Height) -> Result<Option<Timestamp>> {
            Ok(self.0.get(&height).copied())
        }
    }

    /// Keeps epoch targets and counts timestamp reads
    struct KeptTargets {
        targets: BTreeMap<u64, [u8; 32]>,
        reads: Cell<usize>,
    }

    impl ChainState for KeptTargets {
        fn tail(&self) -> Result<Option<ChainTail>> {
            Ok(None)
        }
        fn utxo(&self, _outpoint: &OutPoint) -> Result<Option<Utxo>> {
            Ok(None)
        }
        fn block_timestamp_at(&self, _height: Height) -> Result<Option<Timestamp>> {
            self.reads.set(self.reads.get() + 1);
            Ok(None)
        }
        fn epoch_target(&self, epoch: u64) -> Result<Option<[u8; 32]>> {
            Ok(self.targets.get(&epoch).copied())
        }
    }

    #[test]
    fn test_u256_byte_order() {
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        assert_eq!(U256::from_be_bytes(&bytes), U256::ONE);
        assert_eq!(U256::ONE.to_be_bytes(), bytes);
    }

    #[test]
    fn test_u256_ordering_is_big_endian() {
        let mut high = [0u8; 32];
        high[0] = 1;
        let mut low = [0xffu8; 32];
        low[0] = 0;
        assert!(U256::from_be_bytes(&high) > U256::from_be_bytes(&low));
    }

    #[test]
    fn test_u256_mul_div() {
        let value = U256::from_be_bytes(&[0x11; 32]).div_u64(16);
        assert_eq!(value.saturating_mul_u64(16).div_u64(16), value);
        assert_eq!(U256::MAX.saturating_mul_u64(2), U256::MAX);
    }

    #[test]
    fn test_check_proof_of_work_boundary() {
        let target = U256::from_be_bytes(&[0x10; 32]);
        assert!(check_proof_of_work(&[0x10; 32], &target));
        assert!(check_proof_of_work(&[0x0f; 32], &target));
        assert!(!check_proof_of_work(&[0x11; 32], &target));
    }

    #[test]
    fn test_retarget_clamps_to_four_times() {
        let limit = U256::MAX;
        let start = U256::from_be_bytes(&[0x01; 32]);
        let faster = retarget(&start, 0, 1000, &limit);
        assert_eq!(faster, start.saturating_mul_u64(250).div_u64(1000));
        let slower = retarget(&start, 1_000_000, 1000, &limit);
        assert_eq!(slower, start.saturating_mul_u64(4000).div_u64(1000));
    }

    #[test]
    fn test_retarget_capped_at_limit() {
        let limit = U256::from_be_bytes(&[0x01; 32]);
        assert_eq!(retarget(&limit, 4000, 1000, &limit), limit);
    }

    #[test]
    fn test_constant_target_when_retarget_disabled() {
        let config = ChainConfig { retarget_interval: 0, ..ChainConfig::default() };
        let view = Timestamps(BTreeMap::new());
        let target = target_for_height(&config, &view, 500).unwrap();
        assert_eq!(target, U256::from_be_bytes(&config.initial_target));
    }

    #[test]
    fn test_first_epoch_uses_initial_target() {
        let config = ChainConfig { retarget_interval: 4, ..ChainConfig::default() };
        let view = Timestamps(BTreeMap::new());
        for h in 1..=4 {
            assert_eq!(
                target_for_height(&config, &view, h).unwrap(),
                U256::from_be_bytes(&config.initial_target)
            );
        }
    }

    #[test]
    fn test_fast_epoch_hardens_target() {
        let config = ChainConfig {
            retarget_interval: 4,
            target_block_time_ms: 1000,
            ..ChainConfig::default()
        };
        // blocks 1..=4 one millisecond apart: far faster than expected
        let view = Timestamps((1..=4).map(|h| (h, 1_000 + h)).collect());
        let target = target_for_height(&config, &view, 5).unwrap();
        let limit = U256::from_be_bytes(&config.initial_target);
        assert!(target < limit);
        assert_eq!(target, retarget(&limit, 3, 3000, &limit));
    }

    #[test]
    fn test_missing_history_is_storage_failure() {
        let config = ChainConfig { retarget_interval: 4, ..ChainConfig::default() };
        let view = Timestamps(BTreeMap::new());
        assert!(matches!(
            target_for_height(&config, &view, 5),
            Err(ConsensusError::StorageFailure(_))
        ));
    }

    #[test]
    fn test_epoch_boundaries() {
        let config = ChainConfig { retarget_interval: 4, ..ChainConfig::default() };
        assert_eq!(retarget_epoch(&config, 1), Some(0));
        assert_eq!(retarget_epoch(&config, 4), Some(0));
        assert_eq!(retarget_epoch(&config, 5), Some(1));
        assert_eq!(epoch_opened_after(&config, 3), None);
        assert_eq!(epoch_opened_after(&config, 4), Some(1));
        assert_eq!(epoch_opened_after(&config, 8), Some(2));

        let disabled = ChainConfig { retarget_interval: 0, ..ChainConfig::default() };
        assert_eq!(retarget_epoch(&disabled, 5), None);
        assert_eq!(epoch_opened_after(&disabled, 4), None);
    }

    #[test]
    fn test_kept_epoch_target_skips_replay() {
        let config = ChainConfig { retarget_interval: 10, ..ChainConfig::default() };
        let kept = [0x01; 32];
        let targets = [(10_000, kept)].into_iter().collect();
        let view = KeptTargets { targets, reads: Cell::new(0) };

        let target = target_for_height(&config, &view, 100_001).unwrap();
        assert_eq!(target, U256::from_be_bytes(&kept));
        assert_eq!(view.reads.get(), 0);
    }
}
