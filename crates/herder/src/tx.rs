//! Transactions and transaction sets, as far as consensus cares.
//!
//! The Herder never executes transactions. It needs a content hash for
//! de-duplication, a source account with a sequence number and a fee for
//! admission, and enough structure to build, trim and surge-price a
//! candidate set.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::fmt;

use lumen_common::Hash256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ledger::LedgerManager;

/// An account that pays for and sequences transactions.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct AccountId(pub [u8; 32]);

impl AccountId {
    pub fn from_seed(seed: &str) -> Self {
        Self(Hash256::hash(seed.as_bytes()).0)
    }
}

impl fmt::Debug for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AccountId({self})")
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0[..4] {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Why a transaction cannot be admitted or proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TxError {
    #[error("source account does not exist")]
    NoAccount,
    #[error("bad sequence number: expected {expected}, got {got}")]
    BadSeq { expected: u64, got: u64 },
    #[error("fee {fee} below minimum {min}")]
    InsufficientFee { fee: u64, min: u64 },
    #[error("insufficient balance for fees: need {needed}, have {available}")]
    InsufficientBalance { needed: u64, available: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transaction {
    pub source: AccountId,
    pub seq_num: u64,
    pub fee: u64,
    /// Operations, opaque to consensus.
    pub body: Vec<u8>,
}

impl Transaction {
    pub fn new(source: AccountId, seq_num: u64, fee: u64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            source,
            seq_num,
            fee,
            body: body.into(),
        }
    }

    /// Hash over every field; two transactions with the same hash are the
    /// same transaction.
    pub fn full_hash(&self) -> Hash256 {
        Hash256::hash_parts(&[
            &self.source.0,
            &self.seq_num.to_be_bytes(),
            &self.fee.to_be_bytes(),
            &self.body,
        ])
    }

    /// Check the transaction against the last closed ledger.
    ///
    /// `high_seq` is the highest sequence number already pending for the
    /// source, or 0 when none is; the transaction must follow it directly.
    pub fn check_valid(&self, ledger: &dyn LedgerManager, high_seq: u64) -> Result<(), TxError> {
        let account = ledger.account(&self.source).ok_or(TxError::NoAccount)?;
        let min = ledger.last_tx_fee();
        if self.fee < min {
            return Err(TxError::InsufficientFee { fee: self.fee, min });
        }
        let base = if high_seq > 0 { high_seq } else { account.seq_num };
        let expected = base.saturating_add(1);
        if self.seq_num != expected {
            return Err(TxError::BadSeq {
                expected,
                got: self.seq_num,
            });
        }
        Ok(())
    }
}

/// A candidate set of transactions for the ledger after
/// `previous_ledger_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransactionSet {
    previous_ledger_hash: Hash256,
    transactions: Vec<Transaction>,
}

impl TransactionSet {
    pub fn new(previous_ledger_hash: Hash256) -> Self {
        Self {
            previous_ledger_hash,
            transactions: Vec::new(),
        }
    }

    pub fn from_transactions(
        previous_ledger_hash: Hash256,
        transactions: impl IntoIterator<Item = Transaction>,
    ) -> Self {
        Self {
            previous_ledger_hash,
            transactions: transactions.into_iter().collect(),
        }
    }

    pub fn previous_ledger_hash(&self) -> Hash256 {
        self.previous_ledger_hash
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn add(&mut self, tx: Transaction) {
        self.transactions.push(tx);
    }

    /// Hash identifying the set: the previous ledger hash followed by the
    /// sorted transaction hashes, so insertion order does not matter.
    pub fn contents_hash(&self) -> Hash256 {
        let mut hashes: Vec<Hash256> = self.transactions.iter().map(Transaction::full_hash).collect();
        hashes.sort();
        let mut parts: Vec<&[u8]> = Vec::with_capacity(hashes.len() + 1);
        parts.push(self.previous_ledger_hash.as_bytes().as_slice());
        parts.extend(hashes.iter().map(|h| h.as_bytes().as_slice()));
        Hash256::hash_parts(&parts)
    }

    /// Whether every transaction could be applied on top of the ledger with
    /// hash `last_closed_hash`.
    pub fn check_valid(&self, ledger: &dyn LedgerManager, last_closed_hash: Hash256) -> bool {
        if self.previous_ledger_hash != last_closed_hash {
            return false;
        }
        self.by_source()
            .iter()
            .all(|(_, chain)| valid_prefix(chain, ledger) == chain.len())
    }

    /// Drop transactions that cannot be applied and return them.
    ///
    /// Within one source, everything after the first invalid transaction is
    /// dropped too, since the sequence numbers no longer line up. A source
    /// that cannot pay for its remaining transactions loses all of them.
    pub fn trim_invalid(&mut self, ledger: &dyn LedgerManager) -> Vec<Transaction> {
        let mut keep: Vec<Hash256> = Vec::new();
        for chain in self.by_source().values() {
            let valid = valid_prefix(chain, ledger);
            keep.extend(chain[..valid].iter().map(|tx| tx.full_hash()));
        }
        let (kept, removed): (Vec<_>, Vec<_>) = std::mem::take(&mut self.transactions)
            .into_iter()
            .partition(|tx| keep.contains(&tx.full_hash()));
        self.transactions = kept;
        removed
    }

    /// Cut the set down to `max_size` transactions, preferring higher fees.
    ///
    /// Each source's transactions are taken in sequence order, so a source
    /// can only get its next transaction in once the previous one made it.
    /// Returns what was cut.
    pub fn surge_pricing_filter(&mut self, max_size: usize) -> Vec<Transaction> {
        if self.transactions.len() <= max_size {
            return Vec::new();
        }
        let mut chains: BTreeMap<AccountId, VecDeque<Transaction>> = BTreeMap::new();
        for tx in std::mem::take(&mut self.transactions) {
            chains.entry(tx.source).or_default().push_back(tx);
        }
        for chain in chains.values_mut() {
            chain.make_contiguous().sort_by_key(|tx| tx.seq_num);
        }

        let mut heads: BinaryHeap<(u64, Reverse<Hash256>, AccountId)> = chains
            .iter()
            .filter_map(|(source, chain)| {
                chain
                    .front()
                    .map(|tx| (tx.fee, Reverse(tx.full_hash()), *source))
            })
            .collect();
        while self.transactions.len() < max_size {
            let Some((_, _, source)) = heads.pop() else {
                break;
            };
            let Some(chain) = chains.get_mut(&source) else {
                continue;
            };
            if let Some(tx) = chain.pop_front() {
                self.transactions.push(tx);
            }
            if let Some(next) = chain.front() {
                heads.push((next.fee, Reverse(next.full_hash()), source));
            }
        }
        chains.into_values().flatten().collect()
    }

    fn by_source(&self) -> BTreeMap<AccountId, Vec<&Transaction>> {
        let mut chains: BTreeMap<AccountId, Vec<&Transaction>> = BTreeMap::new();
        for tx in &self.transactions {
            chains.entry(tx.source).or_default().push(tx);
        }
        for chain in chains.values_mut() {
            chain.sort_by_key(|tx| tx.seq_num);
        }
        chains
    }
}

/// Length of the leading run of `chain` (one source, sorted by sequence
/// number) that is valid and affordable.
fn valid_prefix(chain: &[&Transaction], ledger: &dyn LedgerManager) -> usize {
    let mut high_seq = 0;
    let mut total_fee: u64 = 0;
    let mut valid = 0;
    for tx in chain {
        if tx.check_valid(ledger, high_seq).is_err() {
            break;
        }
        high_seq = tx.seq_num;
        total_fee = total_fee.saturating_add(tx.fee);
        valid += 1;
    }
    let Some(source) = chain.first().map(|tx| tx.source) else {
        return 0;
    };
    match ledger.account(&source) {
        Some(account) if account.balance_above_reserve >= total_fee => valid,
        _ => 0,
    }
}
