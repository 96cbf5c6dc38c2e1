//! Transactions received but not yet externalized, bucketed by age.
//!
//! Tier 0 holds transactions received since the last ledger closed. Every
//! externalize ages the pool by one tier; whatever sits in the oldest tier
//! at that point is dropped. A transaction therefore survives
//! `tiers` ledger closes without being included before it is evicted.

use std::collections::HashMap;

use lumen_common::Hash256;
use tracing::trace;

use crate::ledger::LedgerManager;
use crate::tx::{AccountId, Transaction, TxError};

pub const DEFAULT_POOL_TIERS: usize = 4;

/// Outcome of offering a transaction to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Pending,
    Duplicate,
    Error(TxError),
}

#[derive(Debug, Clone)]
pub struct TransactionPool {
    tiers: Vec<Vec<Transaction>>,
    /// Full hash to tier index.
    index: HashMap<Hash256, usize>,
}

impl Default for TransactionPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_TIERS)
    }
}

impl TransactionPool {
    /// A pool with `tiers` age tiers; at least two are kept so there is
    /// always a tier to age into.
    pub fn new(tiers: usize) -> Self {
        Self {
            tiers: vec![Vec::new(); tiers.max(2)],
            index: HashMap::new(),
        }
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.len()
    }

    pub fn tier(&self, n: usize) -> &[Transaction] {
        self.tiers.get(n).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.index.contains_key(hash)
    }

    pub fn tier_of(&self, hash: &Hash256) -> Option<usize> {
        self.index.get(hash).copied()
    }

    /// Every pending transaction, newest tier first.
    pub fn iter(&self) -> impl Iterator<Item = &Transaction> {
        self.tiers.iter().flatten()
    }

    /// Total fee and highest sequence number pending for `source`.
    pub fn source_summary(&self, source: &AccountId) -> (u64, u64) {
        self.iter()
            .filter(|tx| tx.source == *source)
            .fold((0, 0), |(fee, seq), tx| {
                (fee.saturating_add(tx.fee), seq.max(tx.seq_num))
            })
    }

    /// Admit `tx` into tier 0 if it is new, valid after the source's other
    /// pending transactions, and the source can pay for all of them.
    pub fn try_add(&mut self, tx: Transaction, ledger: &dyn LedgerManager) -> TransactionStatus {
        let hash = tx.full_hash();
        if self.contains(&hash) {
            return TransactionStatus::Duplicate;
        }
        let (pending_fee, high_seq) = self.source_summary(&tx.source);
        if let Err(err) = tx.check_valid(ledger, high_seq) {
            return TransactionStatus::Error(err);
        }
        let needed = pending_fee.saturating_add(tx.fee);
        let available = ledger
            .account(&tx.source)
            .map(|account| account.balance_above_reserve)
            .unwrap_or_default();
        if available < needed {
            return TransactionStatus::Error(TxError::InsufficientBalance { needed, available });
        }
        trace!(tx = %hash.short(), source = %tx.source, seq = tx.seq_num, "transaction pending");
        self.index.insert(hash, 0);
        self.tiers[0].push(tx);
        TransactionStatus::Pending
    }

    pub fn remove(&mut self, hash: &Hash256) -> bool {
        let Some(tier) = self.index.remove(hash) else {
            return false;
        };
        self.tiers[tier].retain(|tx| tx.full_hash() != *hash);
        true
    }

    /// Remove every transaction of an applied set; returns how many were
    /// pending.
    pub fn remove_applied<'a>(&mut self, applied: impl IntoIterator<Item = &'a Transaction>) -> usize {
        applied
            .into_iter()
            .filter(|tx| self.remove(&tx.full_hash()))
            .count()
    }

    /// Age every tier by one. The oldest tier is evicted and returned.
    pub fn shift(&mut self) -> Vec<Transaction> {
        let Some(evicted) = self.tiers.pop() else {
            return Vec::new();
        };
        self.tiers.insert(0, Vec::new());
        for hash in evicted.iter().map(Transaction::full_hash) {
            self.index.remove(&hash);
        }
        for (tier, txs) in self.tiers.iter().enumerate() {
            for tx in txs {
                self.index.insert(tx.full_hash(), tier);
            }
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tx::tests::{tx, AccountsLedger};

    #[test]
    fn test_add_then_duplicate() {
        let ledger = AccountsLedger::with(&[("alice", 1_000, 0)]);
        let mut pool = TransactionPool::default();
        assert_eq!(pool.try_add(tx("alice", 1, 10), &ledger), TransactionStatus::Pending);
        assert_eq!(pool.try_add(tx("alice", 1, 10), &ledger), TransactionStatus::Duplicate);
        assert_eq!(pool.len(), 1);
        assert_eq!(pool.tier_of(&tx("alice", 1, 10).full_hash()), Some(0));
    }

    #[test]
    fn test_sequence_follows_pending_transactions() {
        let ledger = AccountsLedger::with(&[("alice", 1_000, 0)]);
        let mut pool = TransactionPool::default();
        pool.try_add(tx("alice", 1, 10), &ledger);
        assert_eq!(pool.try_add(tx("alice", 2, 10), &ledger), TransactionStatus::Pending);
        assert_eq!(
            pool.try_add(tx("alice", 4, 10), &ledger),
            TransactionStatus::Error(TxError::BadSeq { expected: 3, got: 4 })
        );
    }

    #[test]
    fn test_cumulative_fee_must_fit_balance() {
        let ledger = AccountsLedger::with(&[("alice", 25, 0)]);
        let mut pool = TransactionPool::default();
        pool.try_add(tx("alice", 1, 10), &ledger);
        pool.try_add(tx("alice", 2, 10), &ledger);
        assert_eq!(
            pool.try_add(tx("alice", 3, 10), &ledger),
            TransactionStatus::Error(TxError::InsufficientBalance {
                needed: 30,
                available: 25
            })
        );
    }

    #[test]
    fn test_transaction_ages_one_tier_per_shift_then_is_evicted() {
        let ledger = AccountsLedger::with(&[("alice", 1_000, 0), ("bob", 1_000, 0)]);
        let mut pool = TransactionPool::new(3);
        let old = tx("alice", 1, 10);
        pool.try_add(old.clone(), &ledger);

        for expected_tier in 1..3 {
            assert!(pool.shift().is_empty());
            assert_eq!(pool.tier_of(&old.full_hash()), Some(expected_tier));
            assert_eq!(pool.iter().filter(|t| **t == old).count(), 1);
        }
        pool.try_add(tx("bob", 1, 10), &ledger);

        assert_eq!(pool.shift(), vec![old.clone()]);
        assert!(!pool.contains(&old.full_hash()));
        assert_eq!(pool.tier_of(&tx("bob", 1, 10).full_hash()), Some(1));
    }

    #[test]
    fn test_remove_applied() {
        let ledger = AccountsLedger::with(&[("alice", 1_000, 0)]);
        let mut pool = TransactionPool::default();
        pool.try_add(tx("alice", 1, 10), &ledger);
        pool.shift();
        pool.try_add(tx("alice", 2, 10), &ledger);

        let applied = [tx("alice", 1, 10), tx("alice", 2, 10), tx("zed", 1, 10)];
        assert_eq!(pool.remove_applied(&applied), 2);
        assert!(pool.is_empty());
        assert!(pool.tier(0).is_empty() && pool.tier(1).is_empty());
    }
}
