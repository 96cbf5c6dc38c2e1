//! History archives and catch-up for lumen.
//!
//! A node that falls behind the network, or starts from scratch, brings
//! itself up to date from history archives: files published every
//! checkpoint (64 ledgers by default) holding ledger headers, transaction
//! sets and the bucket list state.
//!
//! # Catch-up
//!
//! [`CatchupRange`] decides which ledgers to replay and whether to first
//! apply a bucket list snapshot. [`CatchupWork`] then drives the run as a
//! sequence of [`lumen_work`] units:
//!
//! ```text
//! archive state -> header chain -> buckets (optional) -> transactions
//! ```
//!
//! Every downloaded header is verified against its successor, the local
//! last closed ledger and, when supplied, a trusted hash. Bucket state is
//! only applied when it matches a verified header.
//!
//! # Publishing
//!
//! [`PublishSnapshotWork`] uploads a checkpoint to every writable archive.
//!
//! # Files
//!
//! ```text
//! .well-known/lumen-history.json                 latest archive state
//! history/00/00/00/history-0000007f.json         archive state at 127
//! ledger/00/00/00/ledger-0000007f.json           headers 64-127
//! transactions/00/00/00/transactions-0000007f.json
//! bucket/e1/13/f8/bucket-e113f8...
//! ```

pub mod archive;
pub mod archive_state;
pub mod catchup;
pub mod catchup_range;
pub mod checkpoint;
pub mod error;
pub mod historywork;
pub mod ledger;
pub mod publish;
pub mod verify;

pub use archive::{HistoryArchive, MemoryArchive};
pub use archive_state::{BucketLevel, HistoryArchiveState};
pub use catchup::{CatchupProgressHandler, CatchupProgressState, CatchupWork};
pub use catchup_range::{
    compute_catchup_ledgers, CatchupConfiguration, CatchupRange, CatchupTarget, LedgerRange,
    GENESIS_LEDGER_SEQ,
};
pub use checkpoint::{checkpoint_path, Checkpoints, FileType, DEFAULT_CHECKPOINT_FREQUENCY};
pub use error::{HistoryError, Result};
pub use historywork::{CatchupStage, CatchupState};
pub use ledger::{
    BucketStore, LedgerApplier, LedgerHashPair, LedgerHeader, SyncManager, TransactionHistoryEntry,
};
pub use publish::{PublishSnapshotWork, StateSnapshot};
