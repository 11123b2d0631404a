//! # Chain-Core
//!
//! Chain-state engine of a single-node educational blockchain.
//!
//! The crate validates and commits blocks, maintains the UTXO set and its
//! address indexes, runs a proof-of-work miner over a mempool and adopts
//! longer chains offered by a peer.
//!
//! ## Architecture
//!
//! - `codec`, `types`: canonical encoding, hashing and the entity model
//! - `transaction`, `block`, `pow`, `economic`: pure validation rules
//! - `database`: authoritative chain over a pluggable key-value store
//! - `mempool`, `mining`, `reorganization`: the concurrent actors
//!
//! ## Usage
//!
//! ```rust
//! use chain_core::{CancellationToken, ChainConfig, ChainCore, MemoryStore};
//!
//! let config = ChainConfig { initial_target: [0xff; 32], ..ChainConfig::default() };
//! let core = ChainCore::open(MemoryStore::new(), config, "a1".to_string()).unwrap();
//! core.mine_once(&CancellationToken::new()).unwrap();
//! assert_eq!(core.height(), 1);
//! assert_eq!(core.balance("a1").unwrap(), 50);
//! ```

pub mod types;
pub mod constants;
pub mod config;
pub mod error;
pub mod codec;
pub mod script;
pub mod economic;
pub mod pow;
pub mod transaction;
pub mod block;
pub mod store;
pub mod database;
pub mod mempool;
pub mod mining;
pub mod reorganization;
pub mod worker;
pub mod dto;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use config::ChainConfig;
pub use error::{ConsensusError, Result};
pub use database::{ChainDatabase, ChainEvent, ChainView};
pub use dto::TransactionDto;
pub use mempool::{Admission, Mempool};
pub use mining::{Miner, MinerEvent, MinerState};
pub use reorganization::{PeerSource, SyncEngine, SyncOutcome};
pub use script::Account;
pub use store::{KeyValueStore, MemoryStore, WriteBatch};
pub use worker::CancellationToken;

use crossbeam::channel::Receiver;
use log::info;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Node core wiring the database, mempool, miner and sync engine
///
/// # Examples
///
/// ```
/// use chain_core::{ChainConfig, ChainCore, MemoryStore};
///
/// let config = ChainConfig::default();
/// let core = ChainCore::open(MemoryStore::new(), config, "miner".to_string()).unwrap();
/// assert_eq!(core.height(), 0);
/// assert!(core.tail().is_none());
/// ```
pub struct ChainCore<S: KeyValueStore + 'static> {
    config: Arc<ChainConfig>,
    database: Arc<ChainDatabase<S>>,
    mempool: Arc<Mempool>,
    miner: Miner<S>,
    sync: Mutex<Option<Arc<SyncEngine<S>>>>,
}

impl<S: KeyValueStore + 'static> ChainCore<S> {
    /// Open the chain over `store`; mined rewards go to `miner_address`
    pub fn open(store: S, config: ChainConfig, miner_address: Address) -> Result<Self> {
        if miner_address.is_empty() || !miner_address.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ConsensusError::InvalidConfig(format!(
                "invalid miner address {:?}",
                miner_address
            )));
        }
        let config = Arc::new(config);
        let database = Arc::new(ChainDatabase::open(store, config.clone())?);
        let mempool = Arc::new(Mempool::new(config.clone()));
        let miner = Miner::new(database.clone(), mempool.clone(), miner_address);
        Ok(Self { config, database, mempool, miner, sync: Mutex::new(None) })
    }

    pub fn config(&self) -> &Arc<ChainConfig> {
        &self.config
    }

    pub fn database(&self) -> &Arc<ChainDatabase<S>> {
        &self.database
    }

    pub fn mempool(&self) -> &Arc<Mempool> {
        &self.mempool
    }

    pub fn miner(&self) -> &Miner<S> {
        &self.miner
    }

    // ========================================================================
    // SUBMISSION
    // ========================================================================

    /// Convert a wire transaction (hashes recomputed) and submit it
    pub fn submit_transaction(&self, dto: TransactionDto) -> Result<Admission> {
        self.submit(dto.into_transaction()?)
    }

    /// Admit `tx` to the mempool against the current tail
    pub fn submit(&self, tx: Transaction) -> Result<Admission> {
        let view = self.database.read();
        self.mempool.submit(tx, &view, worker::current_timestamp())
    }

    /// Append an externally produced block and evict what it commits
    pub fn append_block(&self, block: &Block) -> Result<()> {
        self.database.append(block)?;
        self.mempool.remove_committed(block);
        Ok(())
    }

    pub fn rollback_to(&self, height: Height) -> Result<Vec<Block>> {
        self.database.rollback_to(height)
    }

    pub fn subscribe(&self) -> Receiver<ChainEvent> {
        self.database.subscribe()
    }

    // ========================================================================
    // QUERIES
    // ========================================================================

    pub fn tail(&self) -> Option<ChainTail> {
        self.database.tail()
    }

    pub fn height(&self) -> Height {
        self.database.height()
    }

    pub fn block_hash_at(&self, height: Height) -> Result<Option<Hash>> {
        self.database.block_hash_at(height)
    }

    pub fn block_by_height(&self, height: Height) -> Result<Option<Block>> {
        self.database.block_by_height(height)
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>> {
        self.database.block_by_hash(hash)
    }

    pub fn transaction_by_hash(&self, hash: &Hash) -> Result<Option<TransactionRecord>> {
        self.database.transaction_by_hash(hash)
    }

    pub fn transactions_by_sequence(
        &self,
        from: u64,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>> {
        self.database.transactions_by_sequence(from, limit)
    }

    pub fn outputs_by_address(
        &self,
        address: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AddressOutput>> {
        self.database.outputs_by_address(address, offset, limit)
    }

    pub fn utxos_by_address(
        &self,
        address: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AddressOutput>> {
        self.database.utxos_by_address(address, offset, limit)
    }

    pub fn balance(&self, address: &str) -> Result<Value> {
        self.database.balance(address)
    }

    /// Pending transactions in admission order
    pub fn mining_transactions(&self, offset: usize, limit: usize) -> Vec<Transaction> {
        self.mempool.transactions(offset, limit)
    }

    pub fn mining_transaction_by_hash(&self, hash: &Hash) -> Option<Transaction> {
        self.mempool.get(hash)
    }

    // ========================================================================
    // WORKERS
    // ========================================================================

    pub fn mine_once(&self, token: &CancellationToken) -> Result<Block> {
        self.miner.mine_once(token)
    }

    pub fn start_mining(&self) -> Result<()> {
        self.miner.start()
    }

    pub fn stop_mining(&self) {
        self.miner.stop()
    }

    /// Use `peer` for synchronization, replacing any previous peer
    pub fn attach_peer(&self, peer: Arc<dyn PeerSource>) {
        let engine = Arc::new(SyncEngine::new(self.database.clone(), self.mempool.clone(), peer));
        let previous = self.sync.lock().replace(engine);
        if let Some(previous) = previous {
            previous.stop();
        }
        info!("Attached sync peer");
    }

    /// The attached engine, taken out of the slot so rounds run unlocked
    fn sync_engine(&self) -> Result<Arc<SyncEngine<S>>> {
        self.sync
            .lock()
            .clone()
            .ok_or_else(|| ConsensusError::PeerUnavailable("no peer attached".into()))
    }

    /// One synchronization round against the attached peer
    pub fn synchronize(&self, token: &CancellationToken) -> Result<SyncOutcome> {
        self.sync_engine()?.synchronize(token)
    }

    pub fn start_sync(&self, interval: Duration) -> Result<()> {
        self.sync_engine()?.start(interval)
    }

    pub fn stop_sync(&self) {
        if let Ok(engine) = self.sync_engine() {
            engine.stop();
        }
    }

    /// Stop every worker
    pub fn shutdown(&self) {
        self.stop_mining();
        self.stop_sync();
    }
}
