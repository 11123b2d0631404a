//! Canonical byte encoding, hashing and Merkle root
//!
//! Every field is written as `L(x)`: the field length as an 8-byte big-endian
//! integer followed by the field bytes. Integers are encoded as 8-byte
//! big-endian before prefixing. The same encoding is used for hash preimages
//! and for persisted records, so decoding is unambiguous.

use crate::constants::LENGTH_PREFIX_BYTES;
use crate::error::{ConsensusError, Result};
use crate::types::*;
use sha2::{Digest, Sha256};

/// Length-prefixed field writer
#[derive(Debug, Default, Clone)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(&(bytes.len() as u64).to_be_bytes());
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn put_u64(&mut self, value: u64) -> &mut Self {
        self.put_bytes(&value.to_be_bytes())
    }

    pub fn put_str(&mut self, value: &str) -> &mut Self {
        self.put_bytes(value.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Length-prefixed field reader
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn get_bytes(&mut self) -> Result<&'a [u8]> {
        let prefix_end = self.pos + LENGTH_PREFIX_BYTES;
        if prefix_end > self.data.len() {
            return Err(ConsensusError::Encoding("truncated length prefix".into()));
        }
        let mut len_bytes = [0u8; LENGTH_PREFIX_BYTES];
        len_bytes.copy_from_slice(&self.data[self.pos..prefix_end]);
        let len = u64::from_be_bytes(len_bytes);
        let remaining = (self.data.len() - prefix_end) as u64;
        if len > remaining {
            return Err(ConsensusError::Encoding(format!(
                "field length {} exceeds remaining {} bytes",
                len, remaining
            )));
        }
        let end = prefix_end + len as usize;
        let field = &self.data[prefix_end..end];
        self.pos = end;
        Ok(field)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let bytes = self.get_bytes()?;
        let array: [u8; 8] = bytes
            .try_into()
            .map_err(|_| {
                ConsensusError::Encoding(format!("expected 8-byte integer, got {}", bytes.len()))
            })?;
        Ok(u64::from_be_bytes(array))
    }

    pub fn get_hash(&mut self) -> Result<Hash> {
        let bytes = self.get_bytes()?;
        bytes
            .try_into()
            .map_err(|_| {
                ConsensusError::Encoding(format!("expected 32-byte hash, got {}", bytes.len()))
            })
    }

    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| ConsensusError::Encoding(e.to_string()))
    }

    /// Fail unless every byte was consumed
    pub fn finish(self) -> Result<()> {
        if self.pos != self.data.len() {
            return Err(ConsensusError::Encoding(format!(
                "{} trailing bytes",
                self.data.len() - self.pos
            )));
        }
        Ok(())
    }
}

pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// blockHash = SHA-256(L(ts) ‖ L(prev) ‖ L(merkle) ‖ L(nonce))
pub fn header_hash(
    timestamp: Timestamp,
    previous_block_hash: &Hash,
    merkle_root: &Hash,
    nonce: u64,
) -> Hash {
    let mut enc = Encoder::new();
    enc.put_u64(timestamp)
        .put_bytes(previous_block_hash)
        .put_bytes(merkle_root)
        .put_u64(nonce);
    sha256(enc.as_bytes())
}

pub fn block_hash(block: &Block) -> Hash {
    header_hash(block.timestamp, &block.previous_block_hash, &block.merkle_root, block.nonce)
}

fn encode_transaction_body(enc: &mut Encoder, tx: &Transaction, with_scripts: bool) {
    enc.put_u64(tx.timestamp);
    enc.put_u64(tx.inputs.len() as u64);
    for input in &tx.inputs {
        enc.put_bytes(&input.prevout.tx_hash).put_u64(input.prevout.index);
        if with_scripts {
            enc.put_bytes(&input.script);
        }
    }
    enc.put_u64(tx.outputs.len() as u64);
    for output in &tx.outputs {
        enc.put_str(&output.address).put_u64(output.value);
    }
}

/// transactionHash over (timestamp, inputs with scripts, outputs)
pub fn transaction_hash(tx: &Transaction) -> Hash {
    let mut enc = Encoder::new();
    encode_transaction_body(&mut enc, tx, true);
    sha256(enc.as_bytes())
}

/// Message every input signs: the transaction with scripts omitted
pub fn signature_message(tx: &Transaction) -> Hash {
    let mut enc = Encoder::new();
    encode_transaction_body(&mut enc, tx, false);
    sha256(enc.as_bytes())
}

/// outputHash = SHA-256(L(txHash) ‖ L(index))
pub fn output_hash(tx_hash: &Hash, index: u64) -> Hash {
    let mut enc = Encoder::new();
    enc.put_bytes(tx_hash).put_u64(index);
    sha256(enc.as_bytes())
}

/// Merkle root over transaction hashes; the zero digest when empty, the
/// last hash duplicated on odd levels.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return [0u8; 32];
    }
    let mut level = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                let right = pair.get(1).unwrap_or(&pair[0]);
                let mut combined = [0u8; 64];
                combined[..32].copy_from_slice(&pair[0]);
                combined[32..].copy_from_slice(right);
                sha256(&combined)
            })
            .collect();
    }
    level[0]
}

pub fn transactions_merkle_root(transactions: &[Transaction]) -> Hash {
    let hashes: Vec<Hash> = transactions.iter().map(|tx| tx.hash).collect();
    merkle_root(&hashes)
}

pub fn hash_from_hex(value: &str) -> Result<Hash> {
    let mut hash = [0u8; 32];
    hex::decode_to_slice(value, &mut hash)
        .map_err(|e| ConsensusError::Encoding(format!("{}: {}", value, e)))?;
    Ok(hash)
}

// ============================================================================
// RECORD ENCODING
// ============================================================================

pub fn encode_outpoint(enc: &mut Encoder, outpoint: &OutPoint) {
    enc.put_bytes(&outpoint.tx_hash).put_u64(outpoint.index);
}

pub fn decode_outpoint(dec: &mut Decoder<'_>) -> Result<OutPoint> {
    Ok(OutPoint { tx_hash: dec.get_hash()?, index: dec.get_u64()? })
}

pub fn encode_transaction(enc: &mut Encoder, tx: &Transaction) {
    enc.put_u64(tx.transaction_type.code()).put_u64(tx.timestamp);
    enc.put_u64(tx.inputs.len() as u64);
    for input in &tx.inputs {
        encode_outpoint(enc, &input.prevout);
        enc.put_bytes(&input.script);
    }
    enc.put_u64(tx.outputs.len() as u64);
    for output in &tx.outputs {
        enc.put_str(&output.address).put_u64(output.value).put_bytes(&output.output_hash);
    }
    enc.put_bytes(&tx.hash);
}

pub fn decode_transaction(dec: &mut Decoder<'_>) -> Result<Transaction> {
    let code = dec.get_u64()?;
    let transaction_type = TransactionType::from_code(code)
        .ok_or_else(|| ConsensusError::Encoding(format!("unknown transaction type {}", code)))?;
    let timestamp = dec.get_u64()?;
    let input_count = dec.get_u64()?;
    let mut inputs = Vec::new();
    for _ in 0..input_count {
        let prevout = decode_outpoint(dec)?;
        let script = dec.get_bytes()?.to_vec();
        inputs.push(TransactionInput { prevout, script });
    }
    let output_count = dec.get_u64()?;
    let mut outputs = Vec::new();
    for _ in 0..output_count {
        outputs.push(TransactionOutput {
            address: dec.get_string()?,
            value: dec.get_u64()?,
            output_hash: dec.get_hash()?,
        });
    }
    let hash = dec.get_hash()?;
    Ok(Transaction { transaction_type, timestamp, inputs, outputs, hash })
}

pub fn encode_block(block: &Block) -> Vec<u8> {
    let mut enc = Encoder::new();
    enc.put_u64(block.height)
        .put_u64(block.timestamp)
        .put_bytes(&block.previous_block_hash)
        .put_bytes(&block.merkle_root)
        .put_u64(block.nonce)
        .put_bytes(&block.hash)
        .put_u64(block.transactions.len() as u64);
    for tx in &block.transactions {
        encode_transaction(&mut enc, tx);
    }
    enc.into_bytes()
}

pub fn decode_block(bytes: &[u8]) -> Result<Block> {
    let mut dec = Decoder::new(bytes);
    let height = dec.get_u64()?;
    let timestamp = dec.get_u64()?;
    let previous_block_hash = dec.get_hash()?;
    let merkle_root = dec.get_hash()?;
    let nonce = dec.get_u64()?;
    let hash = dec.get_hash()?;
    let count = dec.get_u64()?;
    let mut transactions = Vec::new();
    for _ in 0..count {
        transactions.push(decode_transaction(&mut dec)?);
    }
    dec.finish()?;
    Ok(Block { height, timestamp, previous_block_hash, merkle_root, nonce, hash, transactions })
}
