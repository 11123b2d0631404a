//! Rejection reasons for chain-state validation and storage

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsensusError {
    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Hash mismatch: {0}")]
    HashMismatch(String),

    #[error("Timestamp out of range: {0}")]
    TimestampOutOfRange(String),

    #[error("Linkage error: {0}")]
    Linkage(String),

    #[error("Insufficient proof of work: {0}")]
    ProofOfWorkInsufficient(String),

    #[error("Coinbase rule violation: {0}")]
    CoinbaseRuleViolation(String),

    #[error("Duplicate hash in block: {0}")]
    DuplicateHashInBlock(String),

    #[error("Double spend in block: {0}")]
    DoubleSpendInBlock(String),

    #[error("UTXO not found: {0}")]
    UnknownUtxo(String),

    #[error("Invalid signature: {0}")]
    SignatureInvalid(String),

    #[error("Value imbalance: {0}")]
    ValueImbalance(String),

    #[error("Malformed transaction: {0}")]
    MalformedTransaction(String),

    #[error("Mempool conflict: {0}")]
    MempoolConflict(String),

    #[error("Mempool full: {0}")]
    MempoolFull(String),

    #[error("Stale candidate: {0}")]
    StaleCandidate(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Peer unavailable: {0}")]
    PeerUnavailable(String),

    #[error("Worker spawn failed: {0}")]
    WorkerSpawn(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl ConsensusError {
    /// Fatal errors must be surfaced to the caller; everything else is a
    /// local rejection of one submission.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConsensusError::StorageFailure(_) | ConsensusError::WorkerSpawn(_))
    }
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
