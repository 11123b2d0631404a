//! Mempool: admitted NORMAL transactions awaiting inclusion

use crate::codec::transaction_hash;
use crate::config::ChainConfig;
use crate::error::{ConsensusError, Result};
use crate::transaction::{validate_transaction, TimestampPolicy};
use crate::types::*;
use log::debug;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Result of mempool submission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted { fee: Value },
    AlreadyPresent,
}

/// A transaction chosen for a candidate block, with its fee
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selected {
    pub transaction: Transaction,
    pub fee: Value,
}

#[derive(Debug, Clone)]
struct MempoolEntry {
    transaction: Transaction,
    sequence: u64,
}

#[derive(Debug, Default)]
struct MempoolInner {
    /// Admission order: sequence → tx hash
    order: BTreeMap<u64, Hash>,
    entries: HashMap<Hash, MempoolEntry>,
    /// Outpoints consumed by members → consuming tx hash
    spent: HashMap<OutPoint, Hash>,
    next_sequence: u64,
}

impl MempoolInner {
    fn remove(&mut self, hash: &Hash) -> Option<MempoolEntry> {
        let entry = self.entries.remove(hash)?;
        self.order.remove(&entry.sequence);
        for input in &entry.transaction.inputs {
            self.spent.remove(&input.prevout);
        }
        Some(entry)
    }
}

/// Pending transactions behind a single lock.
///
/// Callers needing a chain view take the database reader lock first and
/// pass the view in; the mempool never calls into the database.
#[derive(Debug)]
pub struct Mempool {
    inner: Mutex<MempoolInner>,
    config: Arc<ChainConfig>,
}

impl Mempool {
    pub fn new(config: Arc<ChainConfig>) -> Self {
        Self { inner: Mutex::new(MempoolInner::default()), config }
    }

    /// AcceptToMemoryPool: 𝒯𝒳 × 𝒞𝒮 → {accepted, rejected}
    ///
    /// 1. If tx is already a member: already present
    /// 2. Admit tx against the committed view (timestamp within ±ΔT/2 of now)
    /// 3. Reject if an input is consumed by another member
    /// 4. Reject if the pool is full
    pub fn submit<V: ChainState>(
        &self,
        tx: Transaction,
        view: &V,
        now: Timestamp,
    ) -> Result<Admission> {
        let mut inner = self.inner.lock();

        // 1. Idempotent resubmission
        let hash = transaction_hash(&tx);
        if inner.entries.contains_key(&hash) {
            return Ok(Admission::AlreadyPresent);
        }

        // 2. Transaction admission
        let policy = TimestampPolicy::Mempool { now };
        let fee = match validate_transaction(&tx, view, policy, &self.config) {
            Ok(fee) => fee,
            Err(e) => {
                debug!("Rejected transaction {}: {}", hex::encode(hash), e);
                return Err(e);
            }
        };

        // 3. Conflicts with members
        if let Some((outpoint, other)) = tx
            .inputs
            .iter()
            .find_map(|input| inner.spent.get(&input.prevout).map(|other| (&input.prevout, other)))
        {
            let e = ConsensusError::MempoolConflict(format!(
                "{} already spent by pending {}",
                outpoint,
                hex::encode(other)
            ));
            debug!("Rejected transaction {}: {}", hex::encode(hash), e);
            return Err(e);
        }

        // 4. Capacity
        if inner.entries.len() >= self.config.mempool_capacity {
            return Err(ConsensusError::MempoolFull(format!(
                "{} transactions pending",
                inner.entries.len()
            )));
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        for input in &tx.inputs {
            inner.spent.insert(input.prevout.clone(), hash);
        }
        inner.order.insert(sequence, hash);
        inner.entries.insert(hash, MempoolEntry { transaction: tx, sequence });
        debug!("Admitted transaction {} with fee {}", hex::encode(hash), fee);
        Ok(Admission::Accepted { fee })
    }

    /// Up to `max_count` members in admission order that are still valid for a
    /// block at `block_timestamp` on top of `view`. Members that no longer
    /// validate are dropped from the pool.
    pub fn select<V: ChainState>(
        &self,
        max_count: usize,
        view: &V,
        block_timestamp: Timestamp,
    ) -> Vec<Selected> {
        let mut inner = self.inner.lock();
        let policy = TimestampPolicy::Block { block_timestamp };
        let mut selected = Vec::new();
        let mut stale = Vec::new();

        for hash in inner.order.values() {
            if selected.len() >= max_count {
                break;
            }
            let Some(entry) = inner.entries.get(hash) else { continue };
            match validate_transaction(&entry.transaction, view, policy, &self.config) {
                Ok(fee) => selected.push(Selected { transaction: entry.transaction.clone(), fee }),
                Err(ConsensusError::StorageFailure(e)) => {
                    debug!("Skipping transaction {} during selection: {}", hex::encode(hash), e);
                }
                Err(e) => {
                    debug!("Pruning transaction {}: {}", hex::encode(hash), e);
                    stale.push(*hash);
                }
            }
        }

        for hash in &stale {
            inner.remove(hash);
        }
        selected
    }

    /// Remove the given members; returns how many were present
    pub fn evict(&self, hashes: &[Hash]) -> usize {
        let mut inner = self.inner.lock();
        hashes.iter().filter(|hash| inner.remove(hash).is_some()).count()
    }

    /// Drop members committed by `block` or conflicting with its inputs
    pub fn remove_committed(&self, block: &Block) -> usize {
        let mut inner = self.inner.lock();
        let mut removed = 0;
        for tx in &block.transactions {
            if inner.remove(&tx.hash).is_some() {
                removed += 1;
            }
            for input in &tx.inputs {
                if let Some(conflict) = inner.spent.get(&input.prevout).copied() {
                    if inner.remove(&conflict).is_some() {
                        removed += 1;
                    }
                }
            }
        }
        if removed > 0 {
            debug!("Evicted {} transactions after block {}", removed, hex::encode(block.hash));
        }
        removed
    }

    pub fn get(&self, hash: &Hash) -> Option<Transaction> {
        self.inner.lock().entries.get(hash).map(|e| e.transaction.clone())
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.inner.lock().entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Members in admission order
    pub fn transactions(&self, offset: usize, limit: usize) -> Vec<Transaction> {
        let inner = self.inner.lock();
        inner
            .order
            .values()
            .skip(offset)
            .take(limit)
            .filter_map(|hash| inner.entries.get(hash).map(|e| e.transaction.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Account;
    use crate::transaction::new_normal;

    const NOW: Timestamp = 1_700_000_000_000;

    struct Fixture {
        mempool: Mempool,
        utxos: UtxoSet,
        account: Account,
    }

    fn fixture(capacity: usize) -> Fixture {
        let config = Arc::new(ChainConfig { mempool_capacity: capacity, ..ChainConfig::default() });
        let account = Account::from_secret_bytes(&[11; 32]).unwrap();
        let mut utxos = UtxoSet::new();
        for i in 0..3 {
            utxos.insert(
                OutPoint { tx_hash: [i + 1; 32], index: 0 },
                Utxo { address: account.address(), value: 50, creation_height: 1 },
            );
        }
        Fixture { mempool: Mempool::new(config), utxos, account }
    }

    fn spend(f: &Fixture, source: u8, value: Value) -> Transaction {
        let prevout = OutPoint { tx_hash: [source; 32], index: 0 };
        let mut tx = new_normal(NOW, vec![prevout], vec![("dest".into(), value)]);
        f.account.sign_transaction(&mut tx).unwrap();
        tx
    }

    #[test]
    fn test_submit_accepts_with_fee() {
        let f = fixture(10);
        let tx = spend(&f, 1, 45);
        let admission = f.mempool.submit(tx.clone(), &f.utxos, NOW).unwrap();
        assert_eq!(admission, Admission::Accepted { fee: 5 });
        assert!(f.mempool.contains(&tx.hash));
        assert_eq!(f.mempool.get(&tx.hash), Some(tx));
    }

    #[test]
    fn test_resubmit_is_noop() {
        let f = fixture(10);
        let tx = spend(&f, 1, 45);
        f.mempool.submit(tx.clone(), &f.utxos, NOW).unwrap();
        assert_eq!(f.mempool.submit(tx, &f.utxos, NOW).unwrap(), Admission::AlreadyPresent);
        assert_eq!(f.mempool.len(), 1);
    }

    #[test]
    fn test_conflicting_spend_rejected() {
        let f = fixture(10);
        f.mempool.submit(spend(&f, 1, 45), &f.utxos, NOW).unwrap();
        let result = f.mempool.submit(spend(&f, 1, 40), &f.utxos, NOW);
        assert!(matches!(result, Err(ConsensusError::MempoolConflict(_))));
    }

    #[test]
    fn test_capacity_enforced() {
        let f = fixture(1);
        f.mempool.submit(spend(&f, 1, 45), &f.utxos, NOW).unwrap();
        let result = f.mempool.submit(spend(&f, 2, 45), &f.utxos, NOW);
        assert!(matches!(result, Err(ConsensusError::MempoolFull(_))));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let f = fixture(10);
        let tx = spend(&f, 1, 45);
        let later = NOW + ChainConfig::default().timestamp_tolerance_ms;
        assert!(matches!(
            f.mempool.submit(tx, &f.utxos, later),
            Err(ConsensusError::TimestampOutOfRange(_))
        ));
    }

    #[test]
    fn test_select_is_fifo_and_prunes_invalid() {
        let f = fixture(10);
        let first = spend(&f, 1, 45);
        let second = spend(&f, 2, 40);
        let third = spend(&f, 3, 30);
        for tx in [&first, &second, &third] {
            f.mempool.submit(tx.clone(), &f.utxos, NOW).unwrap();
        }

        // second's input disappears from the committed view
        let mut view = f.utxos.clone();
        view.remove(&OutPoint { tx_hash: [2; 32], index: 0 });

        let selected = f.mempool.select(10, &view, NOW);
        let hashes: Vec<Hash> = selected.iter().map(|s| s.transaction.hash).collect();
        assert_eq!(hashes, vec![first.hash, third.hash]);
        assert_eq!(selected[1].fee, 20);
        assert!(!f.mempool.contains(&second.hash));
        assert_eq!(f.mempool.select(1, &view, NOW).len(), 1);
    }

    #[test]
    fn test_evict_frees_inputs() {
        let f = fixture(10);
        let tx = spend(&f, 1, 45);
        f.mempool.submit(tx.clone(), &f.utxos, NOW).unwrap();
        assert_eq!(f.mempool.evict(&[tx.hash, [0; 32]]), 1);
        assert!(f.mempool.is_empty());
        assert!(f.mempool.submit(spend(&f, 1, 40), &f.utxos, NOW).is_ok());
    }

    #[test]
    fn test_transactions_paginates_in_order() {
        let f = fixture(10);
        let txs: Vec<Transaction> = (1..=3).map(|i| spend(&f, i, 10)).collect();
        for tx in &txs {
            f.mempool.submit(tx.clone(), &f.utxos, NOW).unwrap();
        }
        assert_eq!(f.mempool.transactions(1, 5), txs[1..].to_vec());
    }
}
