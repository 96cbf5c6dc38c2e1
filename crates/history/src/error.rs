//! Error types for history operations.

use lumen_common::Hash256;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HistoryError {
    /// The catch-up request cannot be planned. Raised before any download.
    #[error("invalid catch-up configuration: {0}")]
    InvalidConfiguration(String),

    /// The archive is not ahead of the local ledger.
    #[error("nothing to catch up to: remote ledger {remote} is not newer than local ledger {local}")]
    NothingToCatchUp { remote: u32, local: u32 },

    #[error("archive {archive} unavailable: {reason}")]
    ArchiveUnavailable { archive: String, reason: String },

    #[error("not found in archive: {0}")]
    NotFound(String),

    #[error("invalid sequence: expected {expected}, got {got}")]
    InvalidSequence { expected: u32, got: u32 },

    #[error("invalid previous hash at ledger {ledger}")]
    InvalidPreviousHash { ledger: u32 },

    #[error("ledger {ledger} hash {actual} does not match trusted hash {expected}")]
    UntrustedChain {
        ledger: u32,
        expected: Hash256,
        actual: Hash256,
    },

    #[error("invalid tx set hash at ledger {ledger}")]
    InvalidTxSetHash { ledger: u32 },

    #[error("bucket {0} does not match its hash")]
    CorruptBucket(Hash256),

    /// Archive state and verified header disagree; applying buckets would
    /// break ledger continuity.
    #[error("bucket state mismatch: {0}")]
    BucketStateMismatch(String),

    #[error("history verification failed: {0}")]
    VerificationFailed(String),

    #[error("apply failed at ledger {ledger}: {reason}")]
    ApplyFailed { ledger: u32, reason: String },

    /// A unit of a catch-up or publish run did not succeed.
    #[error("{work} failed: {reason}")]
    WorkFailed { work: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, HistoryError>;
