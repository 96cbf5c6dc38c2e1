//! Ledger data carried in history and the collaborators catch-up drives.

use std::fmt;

use lumen_common::Hash256;
use serde::{Deserialize, Serialize};

use crate::archive_state::HistoryArchiveState;
use crate::error::Result;

/// The subset of a ledger header catch-up verifies against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerHeader {
    pub ledger_seq: u32,
    pub previous_ledger_hash: Hash256,
    pub tx_set_hash: Hash256,
    pub bucket_list_hash: Hash256,
    pub close_time: u64,
    pub base_fee: u32,
}

impl LedgerHeader {
    /// The hash the next header links to.
    pub fn hash(&self) -> Hash256 {
        Hash256::hash_parts(&[
            &self.ledger_seq.to_be_bytes(),
            self.previous_ledger_hash.as_bytes(),
            self.tx_set_hash.as_bytes(),
            self.bucket_list_hash.as_bytes(),
            &self.close_time.to_be_bytes(),
            &self.base_fee.to_be_bytes(),
        ])
    }

    pub fn hash_pair(&self) -> LedgerHashPair {
        LedgerHashPair::new(self.ledger_seq, self.hash())
    }
}

/// A ledger number with the hash of its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerHashPair {
    pub ledger: u32,
    pub hash: Hash256,
}

impl LedgerHashPair {
    pub fn new(ledger: u32, hash: Hash256) -> Self {
        Self { ledger, hash }
    }
}

impl fmt::Display for LedgerHashPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ledger, self.hash.short())
    }
}

/// The transactions closed in one ledger, as stored in an archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionHistoryEntry {
    pub ledger_seq: u32,
    pub tx_set: Vec<Vec<u8>>,
}

impl TransactionHistoryEntry {
    /// Hash committed to by the header of `ledger_seq`: the previous ledger
    /// hash followed by every transaction in order.
    pub fn tx_set_hash(&self, previous_ledger_hash: &Hash256) -> Hash256 {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(self.tx_set.len() + 1);
        parts.push(previous_ledger_hash.as_bytes());
        parts.extend(self.tx_set.iter().map(Vec::as_slice));
        Hash256::hash_parts(&parts)
    }
}

/// Local ledger state as seen by catch-up.
///
/// Implementations own their own synchronization; work units call these
/// from spawned tasks.
pub trait LedgerApplier: Send + Sync {
    fn last_closed_ledger(&self) -> LedgerHashPair;

    /// Replace local state with the buckets of `has`, anchored at `anchor`.
    /// Every bucket is already in the [`BucketStore`].
    fn apply_buckets(&self, has: &HistoryArchiveState, anchor: &LedgerHeader) -> Result<()>;

    /// Close `header.ledger_seq` with `txs`, returning the hash of the
    /// resulting local header.
    fn apply_ledger(&self, header: &LedgerHeader, txs: &TransactionHistoryEntry) -> Result<Hash256>;
}

/// Content-addressed bucket storage.
pub trait BucketStore: Send + Sync {
    fn contains(&self, hash: &Hash256) -> bool;

    fn put(&self, hash: Hash256, data: Vec<u8>) -> Result<()>;
}

/// Top-level sync manager, told when a catch-up run ends either way.
pub trait SyncManager: Send + Sync {
    fn history_caught_up(&self, succeeded: bool);
}
