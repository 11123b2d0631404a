//! Shared fixtures for integration tests

#![allow(dead_code)]

use chain_core::mining::{candidate_timestamp, create_block_template, mine_block};
use chain_core::store::WriteBatch;
use chain_core::transaction::new_normal;
use chain_core::worker::current_timestamp;
use chain_core::*;
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Every hash meets the target and the target never moves
pub fn easy_config() -> ChainConfig {
    ChainConfig { initial_target: [0xff; 32], retarget_interval: 0, ..ChainConfig::default() }
}

pub fn account(seed: u8) -> Account {
    Account::from_secret_bytes(&[seed; 32]).unwrap()
}

pub fn core_for(miner: &Account) -> ChainCore<MemoryStore> {
    init_logging();
    ChainCore::open(MemoryStore::new(), easy_config(), miner.address()).unwrap()
}

pub fn mine(core: &ChainCore<impl KeyValueStore + 'static>, count: usize) -> Vec<Block> {
    (0..count).map(|_| core.mine_once(&CancellationToken::new()).unwrap()).collect()
}

/// Solved block on top of `core`'s tail paying `address`, not yet appended
pub fn block_paying(core: &ChainCore<impl KeyValueStore + 'static>, address: &str) -> Block {
    // keep the candidate timestamp at or behind the clock
    thread::sleep(Duration::from_millis(2));
    let template = {
        let view = core.database().read();
        let timestamp = candidate_timestamp(view.chain_tail().as_ref(), current_timestamp());
        create_block_template(&view, core.mempool(), core.config(), address, timestamp).unwrap()
    };
    mine_block(template.block, &template.target, u64::MAX).0
}

/// Signed NORMAL transaction spending `prevouts` (all owned by `owner`)
pub fn spend(
    owner: &Account,
    prevouts: Vec<OutPoint>,
    outputs: Vec<(Address, Value)>,
) -> Transaction {
    let mut tx = new_normal(current_timestamp(), prevouts, outputs);
    owner.sign_transaction(&mut tx).unwrap();
    tx
}

pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint { tx_hash: block.transactions[0].hash, index: 0 }
}

/// Every block of `core`, lowest first
pub fn chain_of(core: &ChainCore<impl KeyValueStore + 'static>) -> Vec<Block> {
    (1..=core.height()).map(|h| core.block_by_height(h).unwrap().unwrap()).collect()
}

/// Memory store whose batch writes fail while `fail` is set
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
    pub fail: AtomicBool,
}

impl FailingStore {
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl KeyValueStore for FailingStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn write_batch(&self, batch: WriteBatch) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ConsensusError::StorageFailure("injected write failure".into()));
        }
        self.inner.write_batch(batch)
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.inner.scan_prefix(prefix, offset, limit)
    }
}

/// Peer serving a fixed list of blocks (first block at height 1)
pub struct VecPeer {
    blocks: Mutex<Vec<Block>>,
}

impl VecPeer {
    pub fn new(blocks: Vec<Block>) -> Arc<Self> {
        Arc::new(Self { blocks: Mutex::new(blocks) })
    }

    pub fn replace(&self, blocks: Vec<Block>) {
        *self.blocks.lock() = blocks;
    }
}

impl PeerSource for VecPeer {
    fn peer_tail(&self) -> anyhow::Result<Option<ChainTail>> {
        Ok(self
            .blocks
            .lock()
            .last()
            .map(|b| ChainTail { height: b.height, hash: b.hash, timestamp: b.timestamp }))
    }

    fn fetch_block(&self, height: Height) -> anyhow::Result<Option<Block>> {
        let blocks = self.blocks.lock();
        Ok(usize::try_from(height)
            .ok()
            .and_then(|h| h.checked_sub(1))
            .and_then(|i| blocks.get(i).cloned()))
    }
}

/// Peer whose transport always fails
pub struct DeadPeer;

impl PeerSource for DeadPeer {
    fn peer_tail(&self) -> anyhow::Result<Option<ChainTail>> {
        anyhow::bail!("connection refused")
    }

    fn fetch_block(&self, _height: Height) -> anyhow::Result<Option<Block>> {
        anyhow::bail!("connection refused")
    }
}

/// Peer that answers its tail only once released
pub struct GatedPeer {
    entered: Sender<()>,
    release: Receiver<()>,
}

impl GatedPeer {
    /// The peer, a receiver signalled on each request, and the release handle
    pub fn new() -> (Arc<Self>, Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = bounded(8);
        let (release_tx, release_rx) = bounded(8);
        (Arc::new(Self { entered: entered_tx, release: release_rx }), entered_rx, release_tx)
    }
}

impl PeerSource for GatedPeer {
    fn peer_tail(&self) -> anyhow::Result<Option<ChainTail>> {
        let _ = self.entered.try_send(());
        let _ = self.release.recv_timeout(Duration::from_secs(5));
        Ok(None)
    }

    fn fetch_block(&self, _height: Height) -> anyhow::Result<Option<Block>> {
        Ok(None)
    }
}
