//! Chain database: the authoritative canonical chain and UTXO index
//!
//! Logical layout inside the key-value store:
//!
//! | key | value |
//! |---|---|
//! | `block:height:{h}` | block record |
//! | `block:hash:{hex}` | height |
//! | `block:time:{h}` | block timestamp |
//! | `epoch:target:{e}` | target of retarget epoch `e` |
//! | `tx:hash:{hex}` | transaction, block height, tx sequence, first output sequence |
//! | `tx:seq:{seq}` | transaction hash |
//! | `utxo:{hex}:{idx}` | address, value, creation height, output sequence |
//! | `addr:out:{address}:{seq}` | outpoint (every output ever committed) |
//! | `addr:utxo:{address}:{seq}` | outpoint (unspent outputs only) |
//! | `txo:spent:{hex}:{idx}` | hash of the spending transaction |
//! | `tail` | tail height, hash, timestamp and global counters |
//!
//! Heights and sequences are zero-padded so prefix scans return them in
//! commit order. Every append and every rollback step is one `WriteBatch`.

use crate::block::check_block;
use crate::codec::{
    decode_block, decode_outpoint, decode_transaction, encode_block, encode_outpoint,
    encode_transaction, Decoder, Encoder,
};
use crate::config::ChainConfig;
use crate::error::{ConsensusError, Result};
use crate::pow::{epoch_opened_after, next_epoch_target, target_for_height};
use crate::store::{KeyValueStore, WriteBatch};
use crate::types::*;
use crate::worker::current_timestamp;
use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use std::sync::Arc;

const TAIL_KEY: &[u8] = b"tail";

/// Commit-ordered notification published after every append and rollback step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainEvent {
    Added(Arc<Block>),
    Removed(Arc<Block>),
}

impl ChainEvent {
    pub fn block(&self) -> &Block {
        match self {
            ChainEvent::Added(block) | ChainEvent::Removed(block) => block,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ChainMeta {
    tail: Option<ChainTail>,
    transaction_count: u64,
    output_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct UtxoRecord {
    address: Address,
    value: Value,
    creation_height: Height,
    output_sequence: u64,
}

// ============================================================================
// KEYS
// ============================================================================

fn block_height_key(height: Height) -> String {
    format!("block:height:{:020}", height)
}

fn block_hash_key(hash: &Hash) -> String {
    format!("block:hash:{}", hex::encode(hash))
}

fn block_time_key(height: Height) -> String {
    format!("block:time:{:020}", height)
}

fn epoch_target_key(epoch: u64) -> String {
    format!("epoch:target:{:020}", epoch)
}

fn tx_hash_key(hash: &Hash) -> String {
    format!("tx:hash:{}", hex::encode(hash))
}

fn tx_seq_key(sequence: u64) -> String {
    format!("tx:seq:{:020}", sequence)
}

fn utxo_key(outpoint: &OutPoint) -> String {
    format!("utxo:{}", outpoint)
}

fn spent_key(outpoint: &OutPoint) -> String {
    format!("txo:spent:{}", outpoint)
}

fn address_output_prefix(address: &str) -> String {
    format!("addr:out:{}:", address)
}

fn address_utxo_prefix(address: &str) -> String {
    format!("addr:utxo:{}:", address)
}

fn address_output_key(address: &str, sequence: u64) -> String {
    format!("{}{:020}", address_output_prefix(address), sequence)
}

fn address_utxo_key(address: &str, sequence: u64) -> String {
    format!("{}{:020}", address_utxo_prefix(address), sequence)
}

// ============================================================================
// RECORDS
// ============================================================================

fn encode_u64(value: u64) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_u64(value);
    enc.into_bytes()
}

fn decode_u64(bytes: &[u8]) -> Result<u64> {
    let mut dec = Decoder::new(bytes);
    let value = dec.get_u64()?;
    dec.finish()?;
    Ok(value)
}

fn encode_outpoint_value(outpoint: &OutPoint) -> Vec<u8> {
    let mut enc = Encoder::new();
    encode_outpoint(&mut enc, outpoint);
    enc.into_bytes()
}

fn decode_outpoint_value(bytes: &[u8]) -> Result<OutPoint> {
    let mut dec = Decoder::new(bytes);
    let outpoint = decode_outpoint(&mut dec)?;
    dec.finish()?;
    Ok(outpoint)
}

fn encode_meta(meta: &ChainMeta, tail: &ChainTail) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_u64(tail.height)
        .put_bytes(&tail.hash)
        .put_u64(tail.timestamp)
        .put_u64(meta.transaction_count)
        .put_u64(meta.output_count);
    enc.into_bytes()
}

fn decode_meta(bytes: &[u8]) -> Result<ChainMeta> {
    let mut dec = Decoder::new(bytes);
    let tail = ChainTail {
        height: dec.get_u64()?,
        hash: dec.get_hash()?,
        timestamp: dec.get_u64()?,
    };
    let meta = ChainMeta {
        tail: Some(tail),
        transaction_count: dec.get_u64()?,
        output_count: dec.get_u64()?,
    };
    dec.finish()?;
    Ok(meta)
}

fn encode_record(record: &TransactionRecord) -> Vec<u8> {
    let mut enc = Encoder::new();
    encode_transaction(&mut enc, &record.transaction);
    enc.put_u64(record.block_height)
        .put_u64(record.sequence)
        .put_u64(record.first_output_sequence);
    enc.into_bytes()
}

fn decode_record(bytes: &[u8]) -> Result<TransactionRecord> {
    let mut dec = Decoder::new(bytes);
    let transaction = decode_transaction(&mut dec)?;
    let record = TransactionRecord {
        transaction,
        block_height: dec.get_u64()?,
        sequence: dec.get_u64()?,
        first_output_sequence: dec.get_u64()?,
    };
    dec.finish()?;
    Ok(record)
}

fn encode_utxo(utxo: &UtxoRecord) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_str(&utxo.address)
        .put_u64(utxo.value)
        .put_u64(utxo.creation_height)
        .put_u64(utxo.output_sequence);
    enc.into_bytes()
}

fn decode_utxo(bytes: &[u8]) -> Result<UtxoRecord> {
    let mut dec = Decoder::new(bytes);
    let utxo = UtxoRecord {
        address: dec.get_string()?,
        value: dec.get_u64()?,
        creation_height: dec.get_u64()?,
        output_sequence: dec.get_u64()?,
    };
    dec.finish()?;
    Ok(utxo)
}

fn missing(what: String) -> ConsensusError {
    ConsensusError::StorageFailure(format!("missing committed record: {}", what))
}

// ============================================================================
// READ VIEW
// ============================================================================

/// Consistent read-only view of the committed chain.
///
/// Obtained from [`ChainDatabase::read`], it holds the database's reader
/// lock until dropped so every query through it observes the same tail.
pub struct ChainView<'a, S: KeyValueStore> {
    store: &'a S,
    config: &'a ChainConfig,
    meta: ChainMeta,
    _guard: Option<RwLockReadGuard<'a, ChainMeta>>,
}

impl<'a, S: KeyValueStore> ChainView<'a, S> {
    pub fn chain_tail(&self) -> Option<ChainTail> {
        self.meta.tail
    }

    /// Tail height, or the genesis height for an empty chain
    pub fn height(&self) -> Height {
        self.meta.tail.map_or(self.config.genesis_height, |t| t.height)
    }

    pub fn transaction_count(&self) -> u64 {
        self.meta.transaction_count
    }

    pub fn block_by_height(&self, height: Height) -> Result<Option<Block>> {
        match self.store.get(block_height_key(height).as_bytes())? {
            Some(bytes) => Ok(Some(decode_block(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>> {
        match self.store.get(block_hash_key(hash).as_bytes())? {
            Some(bytes) => self.block_by_height(decode_u64(&bytes)?),
            None => Ok(None),
        }
    }

    /// Hash of the committed block at `height`; the genesis hash at the
    /// genesis height.
    pub fn block_hash_at(&self, height: Height) -> Result<Option<Hash>> {
        if height == self.config.genesis_height {
            return Ok(Some(self.config.genesis_hash));
        }
        Ok(self.block_by_height(height)?.map(|b| b.hash))
    }

    pub fn transaction_by_hash(&self, hash: &Hash) -> Result<Option<TransactionRecord>> {
        match self.store.get(tx_hash_key(hash).as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Committed transactions in global commit order starting at `from`
    pub fn transactions_by_sequence(
        &self,
        from: u64,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>> {
        let offset = usize::try_from(from).unwrap_or(usize::MAX);
        let mut records = Vec::new();
        for (_, value) in self.store.scan_prefix(b"tx:seq:", offset, limit)? {
            let hash: Hash = value
                .as_slice()
                .try_into()
                .map_err(|_| {
                    ConsensusError::Encoding("transaction sequence entry is not a hash".into())
                })?;
            let record = self
                .transaction_by_hash(&hash)?
                .ok_or_else(|| missing(format!("transaction {}", hex::encode(hash))))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Every output ever committed to `address`, oldest first, with the
    /// spending transaction when spent.
    pub fn outputs_by_address(
        &self,
        address: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AddressOutput>> {
        let prefix = address_output_prefix(address);
        let entries = self.store.scan_prefix(prefix.as_bytes(), offset, limit)?;
        let mut outputs = Vec::with_capacity(entries.len());
        for (_, value) in entries {
            let outpoint = decode_outpoint_value(&value)?;
            let record = self
                .transaction_by_hash(&outpoint.tx_hash)?
                .ok_or_else(|| missing(format!("transaction {}", hex::encode(outpoint.tx_hash))))?;
            let output = usize::try_from(outpoint.index)
                .ok()
                .and_then(|i| record.transaction.outputs.get(i))
                .ok_or_else(|| missing(format!("output {}", outpoint)))?;
            let spent_by: Option<Hash> = match self.store.get(spent_key(&outpoint).as_bytes())? {
                Some(bytes) => Some(
                    bytes
                        .as_slice()
                        .try_into()
                        .map_err(|_| ConsensusError::Encoding("spent entry is not a hash".into()))?,
                ),
                None => None,
            };
            outputs.push(AddressOutput {
                address: output.address.clone(),
                value: output.value,
                creation_height: record.block_height,
                spent_by,
                outpoint,
            });
        }
        Ok(outputs)
    }

    /// Unspent outputs owned by `address`, oldest first
    pub fn utxos_by_address(
        &self,
        address: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AddressOutput>> {
        let prefix = address_utxo_prefix(address);
        let entries = self.store.scan_prefix(prefix.as_bytes(), offset, limit)?;
        let mut utxos = Vec::with_capacity(entries.len());
        for (_, value) in entries {
            let outpoint = decode_outpoint_value(&value)?;
            let utxo = self
                .utxo_record(&outpoint)?
                .ok_or_else(|| missing(format!("utxo {}", outpoint)))?;
            utxos.push(AddressOutput {
                outpoint,
                address: utxo.address,
                value: utxo.value,
                creation_height: utxo.creation_height,
                spent_by: None,
            });
        }
        Ok(utxos)
    }

    /// Sum of the unspent outputs owned by `address`
    pub fn balance(&self, address: &str) -> Result<Value> {
        let utxos = self.utxos_by_address(address, 0, usize::MAX)?;
        Ok(utxos.iter().fold(0u64, |acc, u| acc.saturating_add(u.value)))
    }

    fn utxo_record(&self, outpoint: &OutPoint) -> Result<Option<UtxoRecord>> {
        match self.store.get(utxo_key(outpoint).as_bytes())? {
            Some(bytes) => Ok(Some(decode_utxo(&bytes)?)),
            None => Ok(None),
        }
    }
}

impl<'a, S: KeyValueStore> ChainState for ChainView<'a, S> {
    fn tail(&self) -> Result<Option<ChainTail>> {
        Ok(self.meta.tail)
    }

    fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>> {
        Ok(self.utxo_record(outpoint)?.map(|u| Utxo {
            address: u.address,
            value: u.value,
            creation_height: u.creation_height,
        }))
    }

    fn block_timestamp_at(&self, height: Height) -> Result<Option<Timestamp>> {
        if let Some(tail) = self.meta.tail {
            if tail.height == height {
                return Ok(Some(tail.timestamp));
            }
        }
        match self.store.get(block_time_key(height).as_bytes())? {
            Some(bytes) => Ok(Some(decode_u64(&bytes)?)),
            None => Ok(None),
        }
    }

    fn epoch_target(&self, epoch: u64) -> Result<Option<[u8; 32]>> {
        match self.store.get(epoch_target_key(epoch).as_bytes())? {
            Some(bytes) => Ok(Some(
                bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| ConsensusError::Encoding("epoch target is not 32 bytes".into()))?,
            )),
            None => Ok(None),
        }
    }
}

// ============================================================================
// DATABASE
// ============================================================================

/// Owns the canonical chain. Mutations (`append`, each `rollback_to` step)
/// are serialized behind the writer lock; readers share the lock through
/// [`ChainView`].
pub struct ChainDatabase<S: KeyValueStore> {
    store: S,
    config: Arc<ChainConfig>,
    meta: RwLock<ChainMeta>,
    subscribers: Mutex<Vec<Sender<ChainEvent>>>,
}

impl<S: KeyValueStore> ChainDatabase<S> {
    /// Open the database over `store`, resuming from its persisted tail
    pub fn open(store: S, config: Arc<ChainConfig>) -> Result<Self> {
        config.validate()?;
        let meta = match store.get(TAIL_KEY)? {
            Some(bytes) => decode_meta(&bytes)?,
            None => ChainMeta::default(),
        };
        match meta.tail {
            Some(tail) => {
                info!("Opened chain at height {} ({})", tail.height, hex::encode(tail.hash))
            }
            None => info!("Opened empty chain at genesis height {}", config.genesis_height),
        }
        Ok(Self { store, config, meta: RwLock::new(meta), subscribers: Mutex::new(Vec::new()) })
    }

    pub fn config(&self) -> &Arc<ChainConfig> {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// View for a writer that already holds the lock
    fn writer_view(&self, meta: ChainMeta) -> ChainView<'_, S> {
        ChainView { store: &self.store, config: &self.config, meta, _guard: None }
    }

    /// Snapshot holding the reader lock
    pub fn read(&self) -> ChainView<'_, S> {
        let guard = self.meta.read();
        ChainView { store: &self.store, config: &self.config, meta: *guard, _guard: Some(guard) }
    }

    pub fn tail(&self) -> Option<ChainTail> {
        self.meta.read().tail
    }

    pub fn height(&self) -> Height {
        self.read().height()
    }

    pub fn block_hash_at(&self, height: Height) -> Result<Option<Hash>> {
        self.read().block_hash_at(height)
    }

    pub fn block_by_height(&self, height: Height) -> Result<Option<Block>> {
        self.read().block_by_height(height)
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>> {
        self.read().block_by_hash(hash)
    }

    pub fn transaction_by_hash(&self, hash: &Hash) -> Result<Option<TransactionRecord>> {
        self.read().transaction_by_hash(hash)
    }

    pub fn transactions_by_sequence(
        &self,
        from: u64,
        limit: usize,
    ) -> Result<Vec<TransactionRecord>> {
        self.read().transactions_by_sequence(from, limit)
    }

    pub fn outputs_by_address(
        &self,
        address: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AddressOutput>> {
        self.read().outputs_by_address(address, offset, limit)
    }

    pub fn utxos_by_address(
        &self,
        address: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<AddressOutput>> {
        self.read().utxos_by_address(address, offset, limit)
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<Utxo>> {
        self.read().utxo(outpoint)
    }

    pub fn balance(&self, address: &str) -> Result<Value> {
        self.read().balance(address)
    }

    /// Subscribe to `Added`/`Removed` events from now on
    pub fn subscribe(&self) -> Receiver<ChainEvent> {
        let (sender, receiver) = bounded(self.config.event_channel_capacity);
        self.subscribers.lock().push(sender);
        receiver
    }

    /// Live event subscriptions, counting ones dropped since the last event
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Validate `block` against the tail at the current wall clock and commit it
    pub fn append(&self, block: &Block) -> Result<()> {
        self.append_at(block, current_timestamp())
    }

    /// Append with an explicit wall clock
    pub fn append_at(&self, block: &Block, now: Timestamp) -> Result<()> {
        let mut meta = self.meta.write();
        let view = self.writer_view(*meta);

        if let Err(e) = check_block(block, &view, &self.config, now) {
            warn!("Rejected block {} at height {}: {}", hex::encode(block.hash), block.height, e);
            return Err(e);
        }

        let (batch, next) = self.connect_batch(block, &view)?;
        if let Err(e) = self.store.write_batch(batch) {
            error!("Failed to commit block {}: {}", hex::encode(block.hash), e);
            return Err(e);
        }
        *meta = next;

        info!(
            "Committed block {} at height {} with {} transactions",
            hex::encode(block.hash),
            block.height,
            block.transactions.len()
        );
        self.publish(ChainEvent::Added(Arc::new(block.clone())));
        Ok(())
    }

    /// Remove blocks from the top until the tail height is at most `height`.
    /// Each removal is its own atomic step. Returns the removed blocks,
    /// highest first.
    pub fn rollback_to(&self, height: Height) -> Result<Vec<Block>> {
        let mut removed = Vec::new();
        loop {
            let mut meta = self.meta.write();
            let tail = match meta.tail {
                Some(tail) if tail.height > height => tail,
                _ => break,
            };
            let view = self.writer_view(*meta);
            let block = view
                .block_by_height(tail.height)?
                .ok_or_else(|| missing(format!("block at height {}", tail.height)))?;

            let (batch, next) = self.disconnect_batch(&block, &view)?;
            if let Err(e) = self.store.write_batch(batch) {
                error!("Failed to roll back block {}: {}", hex::encode(block.hash), e);
                return Err(e);
            }
            *meta = next;

            info!("Rolled back block {} at height {}", hex::encode(block.hash), block.height);
            let block = Arc::new(block);
            self.publish(ChainEvent::Removed(block.clone()));
            removed.push((*block).clone());
        }
        Ok(removed)
    }

    /// Batch committing `block` on top of `view`, with the resulting metadata
    fn connect_batch(
        &self,
        block: &Block,
        view: &ChainView<'_, S>,
    ) -> Result<(WriteBatch, ChainMeta)> {
        let mut batch = WriteBatch::new();
        let mut meta = view.meta;

        batch.put(block_height_key(block.height), encode_block(block));
        batch.put(block_hash_key(&block.hash), encode_u64(block.height));
        batch.put(block_time_key(block.height), encode_u64(block.timestamp));

        for tx in &block.transactions {
            for input in &tx.inputs {
                let spent = view
                    .utxo_record(&input.prevout)?
                    .ok_or_else(|| ConsensusError::UnknownUtxo(input.prevout.to_string()))?;
                batch.delete(utxo_key(&input.prevout));
                batch.delete(address_utxo_key(&spent.address, spent.output_sequence));
                batch.put(spent_key(&input.prevout), tx.hash.to_vec());
            }

            let record = TransactionRecord {
                transaction: tx.clone(),
                block_height: block.height,
                sequence: meta.transaction_count,
                first_output_sequence: meta.output_count,
            };
            batch.put(tx_hash_key(&tx.hash), encode_record(&record));
            batch.put(tx_seq_key(record.sequence), tx.hash.to_vec());
            meta.transaction_count += 1;

            for (i, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint { tx_hash: tx.hash, index: i as u64 };
                let utxo = UtxoRecord {
                    address: output.address.clone(),
                    value: output.value,
                    creation_height: block.height,
                    output_sequence: meta.output_count,
                };
                let value = encode_outpoint_value(&outpoint);
                batch.put(utxo_key(&outpoint), encode_utxo(&utxo));
                batch.put(address_output_key(&output.address, utxo.output_sequence), value.clone());
                batch.put(address_utxo_key(&output.address, utxo.output_sequence), value);
                meta.output_count += 1;
            }
        }

        // The block closing an epoch fixes the next epoch's target
        if let Some(epoch) = epoch_opened_after(&self.config, block.height) {
            let current = target_for_height(&self.config, view, block.height)?;
            let first_height = block.height + 1 - self.config.retarget_interval;
            let first = view
                .block_timestamp_at(first_height)?
                .ok_or_else(|| missing(format!("timestamp at height {}", first_height)))?;
            let next = next_epoch_target(&self.config, &current, first, block.timestamp);
            batch.put(epoch_target_key(epoch), next.to_be_bytes().to_vec());
            debug!("Epoch {} target {}", epoch, hex::encode(next.to_be_bytes()));
        }

        let tail = ChainTail { height: block.height, hash: block.hash, timestamp: block.timestamp };
        meta.tail = Some(tail);
        batch.put(TAIL_KEY, encode_meta(&meta, &tail));
        debug!("Prepared {} writes for block {}", batch.len(), hex::encode(block.hash));
        Ok((batch, meta))
    }

    /// Batch removing the tail `block`, with the resulting metadata
    fn disconnect_batch(
        &self,
        block: &Block,
        view: &ChainView<'_, S>,
    ) -> Result<(WriteBatch, ChainMeta)> {
        let mut batch = WriteBatch::new();
        let mut meta = view.meta;

        for tx in block.transactions.iter().rev() {
            let record = view
                .transaction_by_hash(&tx.hash)?
                .ok_or_else(|| missing(format!("transaction {}", hex::encode(tx.hash))))?;

            for (i, output) in tx.outputs.iter().enumerate() {
                let outpoint = OutPoint { tx_hash: tx.hash, index: i as u64 };
                let sequence = record.first_output_sequence + i as u64;
                batch.delete(utxo_key(&outpoint));
                batch.delete(address_output_key(&output.address, sequence));
                batch.delete(address_utxo_key(&output.address, sequence));
            }

            for input in &tx.inputs {
                let origin_hash = input.prevout.tx_hash;
                let origin = view
                    .transaction_by_hash(&origin_hash)?
                    .ok_or_else(|| missing(format!("transaction {}", hex::encode(origin_hash))))?;
                let output = usize::try_from(input.prevout.index)
                    .ok()
                    .and_then(|i| origin.transaction.outputs.get(i))
                    .ok_or_else(|| missing(format!("output {}", input.prevout)))?;
                let utxo = UtxoRecord {
                    address: output.address.clone(),
                    value: output.value,
                    creation_height: origin.block_height,
                    output_sequence: origin.first_output_sequence + input.prevout.index,
                };
                batch.put(utxo_key(&input.prevout), encode_utxo(&utxo));
                batch.put(
                    address_utxo_key(&utxo.address, utxo.output_sequence),
                    encode_outpoint_value(&input.prevout),
                );
                batch.delete(spent_key(&input.prevout));
            }

            batch.delete(tx_hash_key(&tx.hash));
            batch.delete(tx_seq_key(record.sequence));
            meta.transaction_count -= 1;
            meta.output_count -= tx.outputs.len() as u64;
        }

        batch.delete(block_height_key(block.height));
        batch.delete(block_hash_key(&block.hash));
        batch.delete(block_time_key(block.height));
        if let Some(epoch) = epoch_opened_after(&self.config, block.height) {
            batch.delete(epoch_target_key(epoch));
        }

        if block.height > self.config.first_block_height() {
            let previous = view
                .block_by_height(block.height - 1)?
                .ok_or_else(|| missing(format!("block at height {}", block.height - 1)))?;
            let tail = ChainTail {
                height: previous.height,
                hash: previous.hash,
                timestamp: previous.timestamp,
            };
            meta.tail = Some(tail);
            batch.put(TAIL_KEY, encode_meta(&meta, &tail));
        } else {
            meta = ChainMeta::default();
            batch.delete(TAIL_KEY);
        }
        Ok((batch, meta))
    }

    /// Deliver without blocking; full or disconnected subscribers are dropped
    fn publish(&self, event: ChainEvent) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|sender| match sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Dropping chain event subscriber with a full channel");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("Dropping disconnected chain event subscriber");
                false
            }
        });
    }
}
