//! Chain synchronization: adopting a longer chain presented by a peer

use crate::database::ChainDatabase;
use crate::error::{ConsensusError, Result};
use crate::mempool::Mempool;
use crate::store::KeyValueStore;
use crate::types::*;
use crate::worker::{CancellationToken, Worker};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Blocks offered by a remote node. Implemented by the transport layer.
pub trait PeerSource: Send + Sync {
    /// The peer's tail, or `None` when unknown
    fn peer_tail(&self) -> anyhow::Result<Option<ChainTail>>;

    /// The peer's block at `height`, or `None` when it has none
    fn fetch_block(&self, height: Height) -> anyhow::Result<Option<Block>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The peer is not strictly ahead
    UpToDate,
    /// The peer chain was adopted
    Adopted { ancestor: Height, new_height: Height, rolled_back: usize },
    /// A peer block failed; the local chain was put back as it was
    Restored { reason: String },
}

/// Strictly greater height wins; ties keep the local chain
pub fn should_reorganize(local_height: Height, peer_height: Height) -> bool {
    peer_height > local_height
}

fn peer_error(context: String, e: anyhow::Error) -> ConsensusError {
    ConsensusError::PeerUnavailable(format!("{}: {:#}", context, e))
}

struct SyncShared<S: KeyValueStore> {
    database: Arc<ChainDatabase<S>>,
    mempool: Arc<Mempool>,
    peer: Arc<dyn PeerSource>,
}

/// Drives append and rollback on the database from a peer's chain
pub struct SyncEngine<S: KeyValueStore + 'static> {
    shared: Arc<SyncShared<S>>,
    worker: Mutex<Option<Worker>>,
}

impl<S: KeyValueStore + 'static> SyncEngine<S> {
    pub fn new(
        database: Arc<ChainDatabase<S>>,
        mempool: Arc<Mempool>,
        peer: Arc<dyn PeerSource>,
    ) -> Self {
        Self { shared: Arc::new(SyncShared { database, mempool, peer }), worker: Mutex::new(None) }
    }

    /// Reorganization: adopt the peer chain if it is strictly longer.
    ///
    /// 1. Compare tails; stop unless the peer is ahead
    /// 2. Find the common ancestor by probing hashes downward
    /// 3. Roll back to the ancestor, keeping the removed blocks
    /// 4. Append peer blocks one by one
    /// 5. If any append fails, roll back again and re-append the kept blocks
    /// 6. Once every peer block is in, evict what they commit from the mempool
    pub fn synchronize(&self, token: &CancellationToken) -> Result<SyncOutcome> {
        self.shared.synchronize(token)
    }

    pub fn find_common_ancestor(
        &self,
        peer_height: Height,
        token: &CancellationToken,
    ) -> Result<Height> {
        self.shared.find_common_ancestor(peer_height, token)
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().as_ref().map_or(false, |w| !w.is_finished())
    }

    /// Run `synchronize` every `interval` on a dedicated thread
    pub fn start(&self, interval: Duration) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.as_ref().map_or(false, |w| !w.is_finished()) {
            return Ok(());
        }
        let shared = self.shared.clone();
        *worker = Some(Worker::spawn("sync", move |token| shared.run(&token, interval))?);
        info!("Sync engine started");
        Ok(())
    }

    pub fn stop(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.stop();
            info!("Sync engine stopped");
        }
    }
}

impl<S: KeyValueStore + 'static> Drop for SyncEngine<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl<S: KeyValueStore> SyncShared<S> {
    fn run(&self, token: &CancellationToken, interval: Duration) {
        loop {
            match self.synchronize(token) {
                Ok(SyncOutcome::UpToDate) => {}
                Ok(outcome) => debug!("Sync round finished: {:?}", outcome),
                Err(ConsensusError::Cancelled) => break,
                Err(e) if e.is_fatal() => {
                    error!("Sync halted: {}", e);
                    break;
                }
                Err(e) => warn!("Sync round failed: {}", e),
            }
            if !token.sleep(interval) {
                break;
            }
        }
    }

    fn synchronize(&self, token: &CancellationToken) -> Result<SyncOutcome> {
        // 1. Compare tails
        let peer_tail = match self
            .peer
            .peer_tail()
            .map_err(|e| peer_error("peer tail".into(), e))?
        {
            Some(tail) => tail,
            None => return Ok(SyncOutcome::UpToDate),
        };
        let local_height = self.database.height();
        if !should_reorganize(local_height, peer_tail.height) {
            return Ok(SyncOutcome::UpToDate);
        }

        // 2. Common ancestor
        let ancestor = self.find_common_ancestor(peer_tail.height, token)?;
        info!(
            "Adopting peer chain at height {} (local {}, ancestor {})",
            peer_tail.height, local_height, ancestor
        );

        // 3. Roll back, keeping the removed blocks
        let removed = self.database.rollback_to(ancestor)?;

        // 4. Apply peer blocks
        let mut adopted = Vec::new();
        for height in ancestor + 1..=peer_tail.height {
            let applied = token.check().and_then(|_| self.fetch_block(height)).and_then(|block| {
                self.database.append(&block)?;
                Ok(block)
            });
            let e = match applied {
                Ok(block) => {
                    adopted.push(block);
                    continue;
                }
                Err(e) => e,
            };
            if e.is_fatal() {
                self.evict_committed(&adopted);
                return Err(e);
            }
            warn!("Peer block at height {} rejected: {}; restoring local chain", height, e);

            // 5. Restore; nothing was evicted yet
            self.restore(ancestor, &removed)?;
            if e == ConsensusError::Cancelled {
                return Err(e);
            }
            return Ok(SyncOutcome::Restored { reason: e.to_string() });
        }

        // 6. Evict
        self.evict_committed(&adopted);
        let new_height = self.database.height();
        info!("Adopted peer chain, tail now at height {}", new_height);
        Ok(SyncOutcome::Adopted { ancestor, new_height, rolled_back: removed.len() })
    }

    fn find_common_ancestor(
        &self,
        peer_height: Height,
        token: &CancellationToken,
    ) -> Result<Height> {
        let genesis_height = self.database.config().genesis_height;
        let mut height = self.database.height().min(peer_height);
        while height > genesis_height {
            token.check()?;
            let local = self.database.block_hash_at(height)?;
            let remote = self.fetch_block(height)?.hash;
            if local == Some(remote) {
                return Ok(height);
            }
            height -= 1;
        }
        Ok(genesis_height)
    }

    fn fetch_block(&self, height: Height) -> Result<Block> {
        self.peer
            .fetch_block(height)
            .map_err(|e| peer_error(format!("block at height {}", height), e))?
            .ok_or_else(|| {
                ConsensusError::PeerUnavailable(format!("peer has no block at height {}", height))
            })
    }

    fn evict_committed(&self, blocks: &[Block]) {
        let evicted: usize = blocks.iter().map(|b| self.mempool.remove_committed(b)).sum();
        if evicted > 0 {
            debug!("Evicted {} mempool transactions committed by the peer chain", evicted);
        }
    }

    /// Put back the blocks removed by a rollback to `ancestor`
    fn restore(&self, ancestor: Height, removed: &[Block]) -> Result<()> {
        self.database.rollback_to(ancestor)?;
        for block in removed.iter().rev() {
            self.database.append(block)?;
        }
        info!("Restored local chain to height {}", self.database.height());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_reorganize_needs_strictly_greater_height() {
        assert!(should_reorganize(1, 2));
        assert!(!should_reorganize(2, 2));
        assert!(!should_reorganize(3, 2));
    }
}
