//! Mining: candidate assembly, proof-of-work search and submission

use crate::block::expected_linkage;
use crate::codec::{header_hash, transactions_merkle_root};
use crate::config::ChainConfig;
use crate::database::{ChainDatabase, ChainEvent};
use crate::economic::coinbase_value;
use crate::error::{ConsensusError, Result};
use crate::mempool::Mempool;
use crate::pow::{check_proof_of_work, target_for_height, U256};
use crate::store::KeyValueStore;
use crate::transaction::new_coinbase;
use crate::types::*;
use crate::worker::{current_timestamp, CancellationToken, Worker};
use crossbeam::channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// CreateNewBlock: ℕ × ℍ × ℕ × 𝒜 × ℕ × 𝒯𝒳* → ℬ
///
/// 1. Create the coinbase paying `reward` to `miner_address` at `timestamp`
/// 2. Place it before `transactions`
/// 3. Calculate merkle root
/// 4. Hash the header with nonce 0
pub fn create_new_block(
    height: Height,
    previous_block_hash: Hash,
    timestamp: Timestamp,
    miner_address: &str,
    reward: Value,
    transactions: Vec<Transaction>,
) -> Block {
    let mut all = Vec::with_capacity(transactions.len() + 1);
    all.push(new_coinbase(timestamp, miner_address.to_string(), reward));
    all.extend(transactions);

    let merkle_root = transactions_merkle_root(&all);
    Block {
        height,
        timestamp,
        previous_block_hash,
        merkle_root,
        nonce: 0,
        hash: header_hash(timestamp, &previous_block_hash, &merkle_root, 0),
        transactions: all,
    }
}

/// Candidate timestamp: the wall clock, but strictly after the tail
pub fn candidate_timestamp(tail: Option<&ChainTail>, now: Timestamp) -> Timestamp {
    tail.map_or(now, |t| now.max(t.timestamp + 1))
}

/// A candidate block with everything needed to solve and submit it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    pub block: Block,
    pub target: U256,
    /// Tail the candidate builds on
    pub tail: Option<ChainTail>,
    pub fees: Value,
}

/// BlockTemplate: 𝒞𝒮 × 𝒫 × 𝒜 × ℕ → ℬ
///
/// Deterministic in (view, mempool contents, address, timestamp):
/// 1. Link to the tail (genesis when empty)
/// 2. Select mempool transactions valid at `timestamp` in admission order
/// 3. Coinbase pays baseReward(height) + Σ fees
/// 4. Target from the retargeting rule
pub fn create_block_template<V: ChainState>(
    view: &V,
    mempool: &Mempool,
    config: &ChainConfig,
    miner_address: &str,
    timestamp: Timestamp,
) -> Result<BlockTemplate> {
    let tail = view.tail()?;
    let (previous_block_hash, height) = expected_linkage(tail.as_ref(), config);

    let selected = mempool.select(config.max_block_transactions, view, timestamp);
    let fees = selected.iter().try_fold(0u64, |acc, s| {
        acc.checked_add(s.fee)
            .ok_or_else(|| ConsensusError::ValueImbalance("fee sum overflows".into()))
    })?;
    let reward = coinbase_value(config, height, fees)?;
    let transactions = selected.into_iter().map(|s| s.transaction).collect();

    let block = create_new_block(
        height,
        previous_block_hash,
        timestamp,
        miner_address,
        reward,
        transactions,
    );
    let target = target_for_height(config, view, height)?;
    Ok(BlockTemplate { block, target, tail, fees })
}

/// Result of mining attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningResult {
    Success,
    Failure,
}

/// MineBlock: ℬ × U256 × ℕ → ℬ × {success, failure}
///
/// Try up to `max_attempts` nonces starting at `block.nonce`. On success the
/// block carries the winning nonce and hash; on failure `block.nonce` is the
/// next nonce to try.
pub fn mine_block(mut block: Block, target: &U256, max_attempts: u64) -> (Block, MiningResult) {
    for _ in 0..max_attempts {
        let hash = header_hash(
            block.timestamp,
            &block.previous_block_hash,
            &block.merkle_root,
            block.nonce,
        );
        if check_proof_of_work(&hash, target) {
            block.hash = hash;
            return (block, MiningResult::Success);
        }
        match block.nonce.checked_add(1) {
            Some(next) => block.nonce = next,
            None => break,
        }
    }
    (block, MiningResult::Failure)
}

// ============================================================================
// MINER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    Idle,
    Assembling,
    Solving,
    Submitting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinerEvent {
    Solved(Arc<Block>),
    Discarded { height: Height, reason: String },
}

/// A template in flight, tied to the chain events seen since it was built
#[derive(Debug)]
pub struct Candidate {
    pub template: BlockTemplate,
    events: Receiver<ChainEvent>,
    assembled_at: Timestamp,
}

struct MinerShared<S: KeyValueStore> {
    database: Arc<ChainDatabase<S>>,
    mempool: Arc<Mempool>,
    address: Address,
    state: Mutex<MinerState>,
    blocks_mined: AtomicU64,
    subscribers: Mutex<Vec<Sender<MinerEvent>>>,
}

/// Mines on top of the database tail and submits solved blocks to it
pub struct Miner<S: KeyValueStore + 'static> {
    shared: Arc<MinerShared<S>>,
    worker: Mutex<Option<Worker>>,
}

impl<S: KeyValueStore + 'static> Miner<S> {
    pub fn new(database: Arc<ChainDatabase<S>>, mempool: Arc<Mempool>, address: Address) -> Self {
        let shared = MinerShared {
            database,
            mempool,
            address,
            state: Mutex::new(MinerState::Idle),
            blocks_mined: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        };
        Self { shared: Arc::new(shared), worker: Mutex::new(None) }
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn state(&self) -> MinerState {
        *self.shared.state.lock()
    }

    pub fn blocks_mined(&self) -> u64 {
        self.shared.blocks_mined.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> Receiver<MinerEvent> {
        let capacity = self.shared.database.config().event_channel_capacity;
        let (sender, receiver) = bounded(capacity);
        self.shared.subscribers.lock().push(sender);
        receiver
    }

    pub fn assemble(&self) -> Result<Candidate> {
        self.shared.assemble()
    }

    /// Search nonces until solved (`Ok(true)`), the refresh period elapsed
    /// (`Ok(false)`), the tail moved (`StaleCandidate`) or `token` fired
    /// (`Cancelled`).
    pub fn solve(&self, candidate: &mut Candidate, token: &CancellationToken) -> Result<bool> {
        self.shared.solve(candidate, token)
    }

    /// Append a solved candidate; a rejection is reported as `Discarded`
    pub fn submit(&self, candidate: Candidate, token: &CancellationToken) -> Result<Block> {
        let height = candidate.template.block.height;
        let result = self.shared.submit(candidate, token);
        self.shared.finish(height, result)
    }

    /// One full attempt: assemble, solve, submit
    pub fn mine_once(&self, token: &CancellationToken) -> Result<Block> {
        self.shared.mine_once(token)
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().map_or(false, |w| !w.is_finished())
    }

    /// Launch the mining loop on a dedicated thread; no-op when running
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.as_ref().map_or(false, |w| !w.is_finished()) {
            return Ok(());
        }
        let shared = self.shared.clone();
        *worker = Some(Worker::spawn("miner", move |token| shared.run(&token))?);
        info!("Miner started for address {}", self.shared.address);
        Ok(())
    }

    /// Cancel the mining loop and wait for it
    pub fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
            info!("Miner stopped after {} blocks", self.blocks_mined());
        }
    }
}

impl<S: KeyValueStore> MinerShared<S> {
    fn run(&self, token: &CancellationToken) {
        while !token.is_cancelled() {
            match self.mine_once(token) {
                Ok(_) => {}
                Err(ConsensusError::Cancelled) => break,
                Err(e) if e.is_fatal() => {
                    error!("Miner halted: {}", e);
                    break;
                }
                Err(ConsensusError::StaleCandidate(reason)) => {
                    debug!("Discarded stale candidate: {}", reason);
                }
                Err(e) => {
                    warn!("Mining attempt failed: {}", e);
                    // avoid spinning on a persistent rejection
                    if !token.sleep(Duration::from_millis(100)) {
                        break;
                    }
                }
            }
        }
        self.set_state(MinerState::Idle);
    }

    fn mine_once(&self, token: &CancellationToken) -> Result<Block> {
        let result = self.attempt(token);
        let height = match &result {
            Ok(block) => block.height,
            Err(_) => self.database.height() + 1,
        };
        self.finish(height, result)
    }

    /// Back to idle; every rejection but cancellation is published
    fn finish(&self, height: Height, result: Result<Block>) -> Result<Block> {
        self.set_state(MinerState::Idle);
        if let Err(e) = &result {
            if !matches!(e, ConsensusError::Cancelled) {
                self.publish(MinerEvent::Discarded { height, reason: e.to_string() });
            }
        }
        result
    }

    fn attempt(&self, token: &CancellationToken) -> Result<Block> {
        let mut candidate = self.assemble()?;
        loop {
            if self.solve(&mut candidate, token)? {
                return self.submit(candidate, token);
            }
            debug!("Refreshing candidate at height {}", candidate.template.block.height);
            token.check()?;
            candidate = self.reassemble(candidate)?;
        }
    }

    fn assemble(&self) -> Result<Candidate> {
        self.assemble_with(self.database.subscribe())
    }

    /// Fresh template reusing the previous candidate's event subscription
    fn reassemble(&self, previous: Candidate) -> Result<Candidate> {
        self.assemble_with(previous.events)
    }

    fn assemble_with(&self, events: Receiver<ChainEvent>) -> Result<Candidate> {
        self.set_state(MinerState::Assembling);
        let config = self.database.config().clone();
        let view = self.database.read();
        // writers publish under the lock, so everything queued predates the view
        let skipped = events.try_iter().count();
        if skipped > 0 {
            debug!("Skipped {} chain events before assembling", skipped);
        }
        let now = current_timestamp();
        let timestamp = candidate_timestamp(view.chain_tail().as_ref(), now);
        let template =
            create_block_template(&view, &self.mempool, &config, &self.address, timestamp)?;
        debug!(
            "Assembled candidate at height {} with {} transactions",
            template.block.height,
            template.block.transactions.len()
        );
        Ok(Candidate { template, events, assembled_at: now })
    }

    fn solve(&self, candidate: &mut Candidate, token: &CancellationToken) -> Result<bool> {
        self.set_state(MinerState::Solving);
        let config = self.database.config();
        let target = candidate.template.target;
        loop {
            let block = candidate.template.block.clone();
            let (block, result) = mine_block(block, &target, config.miner_check_interval);
            candidate.template.block = block;
            if result == MiningResult::Success {
                return Ok(true);
            }

            token.check()?;
            if self.tail_moved(&candidate.events, candidate.template.tail) {
                return Err(ConsensusError::StaleCandidate(format!(
                    "tail moved while solving height {}",
                    candidate.template.block.height
                )));
            }
            let elapsed = current_timestamp().saturating_sub(candidate.assembled_at);
            if elapsed >= config.miner_refresh_ms || candidate.template.block.nonce == u64::MAX {
                return Ok(false);
            }
        }
    }

    fn submit(&self, candidate: Candidate, token: &CancellationToken) -> Result<Block> {
        self.set_state(MinerState::Submitting);
        let block = candidate.template.block;

        // A candidate stamped tail.timestamp + 1 may be ahead of the clock
        while current_timestamp() < block.timestamp {
            token.check()?;
            thread::sleep(Duration::from_millis(1));
        }

        if let Err(e) = self.database.append(&block) {
            if self.database.tail() != candidate.template.tail {
                return Err(ConsensusError::StaleCandidate(format!(
                    "tail moved before submitting height {}: {}",
                    block.height, e
                )));
            }
            return Err(e);
        }

        self.mempool.remove_committed(&block);
        self.blocks_mined.fetch_add(1, Ordering::SeqCst);
        info!("Mined block {} at height {}", hex::encode(block.hash), block.height);
        self.publish(MinerEvent::Solved(Arc::new(block.clone())));
        Ok(block)
    }

    fn tail_moved(&self, events: &Receiver<ChainEvent>, tail: Option<ChainTail>) -> bool {
        loop {
            match events.try_recv() {
                // the candidate's own tail landing just before the snapshot
                Ok(ChainEvent::Added(block)) if tail.map(|t| t.hash) == Some(block.hash) => {
                    continue
                }
                Ok(_) => return true,
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => return self.database.tail() != tail,
            }
        }
    }

    fn set_state(&self, state: MinerState) {
        *self.state.lock() = state;
    }

    fn publish(&self, event: MinerEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Dropping miner event subscriber with a full channel");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }
}

impl<S: KeyValueStore + 'static> Drop for Miner<S> {
    fn drop(&mut self) {
        self.stop();
    }
}
