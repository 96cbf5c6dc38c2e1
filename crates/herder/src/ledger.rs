//! Collaborators the Herder drives but does not own.
//!
//! The ledger manager applies externalized values and answers account and
//! fee queries. The overlay moves messages to peers. Both are shared with
//! the rest of the node, so the Herder holds them as trait objects.

use std::sync::Arc;

use lumen_common::Hash256;
use lumen_scp::Envelope;

use crate::tx::{AccountId, Transaction, TransactionSet};

/// The ledger the node last closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastClosedLedger {
    pub ledger_seq: u64,
    pub hash: Hash256,
    pub tx_set_hash: Hash256,
    pub bucket_list_hash: Hash256,
    pub close_time: u64,
}

/// What the ledger needs to know about a transaction's source account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountState {
    /// Balance left after the minimum reserve, available for fees.
    pub balance_above_reserve: u64,
    pub seq_num: u64,
}

/// An externalized value handed to the ledger.
///
/// `tx_set` is missing when the node externalized a value whose
/// transaction set it never received; the ledger manager then has to catch
/// up rather than apply.
#[derive(Debug, Clone)]
pub struct LedgerCloseData {
    pub ledger_seq: u64,
    pub tx_set: Option<Arc<TransactionSet>>,
    pub close_time: u64,
    pub base_fee: u64,
}

pub trait LedgerManager: Send + Sync {
    fn last_closed_ledger(&self) -> LastClosedLedger;

    /// Whether the ledger is applying consensus output directly rather than
    /// catching up.
    fn is_synced(&self) -> bool;

    /// Force the synced state. Used when bootstrapping from local state.
    fn set_synced(&self);

    fn account(&self, id: &AccountId) -> Option<AccountState>;

    /// Minimum fee for one transaction at the last closed ledger.
    fn last_tx_fee(&self) -> u64;

    /// Close (or schedule catch-up towards) the ledger that just
    /// externalized.
    fn externalize_value(&self, data: LedgerCloseData);
}

pub trait Overlay: Send + Sync {
    fn broadcast_envelope(&self, envelope: &Envelope, is_rebroadcast: bool);

    fn broadcast_transaction(&self, tx: &Transaction);

    /// The node moved to a new ledger; per-peer bookkeeping can move on.
    fn ledger_closed(&self, ledger_seq: u64);

    fn request_tx_set(&self, hash: Hash256);

    fn request_quorum_set(&self, hash: Hash256);
}
