//! Work units that make up a catch-up run.
//!
//! Units share a [`CatchupState`] behind an async mutex: earlier units
//! leave what they fetched and verified there for later ones. Archive
//! errors are reported as [`WorkOutcome::Retry`] so the scheduler's retry
//! budget applies to them; verification and apply errors are
//! [`WorkOutcome::Failed`] and never retried.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use lumen_common::Hash256;
use lumen_work::{Work, WorkContext, WorkOutcome};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::archive::HistoryArchive;
use crate::archive_state::HistoryArchiveState;
use crate::catchup_range::LedgerRange;
use crate::checkpoint::Checkpoints;
use crate::ledger::{BucketStore, LedgerApplier, LedgerHashPair, LedgerHeader, TransactionHistoryEntry};
use crate::verify;

/// Parallel bucket downloads per run.
pub const MAX_CONCURRENT_DOWNLOADS: usize = 16;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CatchupStage {
    #[default]
    Idle,
    FetchingArchiveState,
    VerifyingLedgerChain,
    ApplyingBuckets,
    ApplyingTransactions,
    Finished,
    Failed,
}

/// What a run has fetched, verified and applied so far.
#[derive(Debug, Default)]
pub struct CatchupState {
    pub stage: CatchupStage,
    pub message: String,
    /// State at the target checkpoint (or the archive tip).
    pub remote_state: Option<HistoryArchiveState>,
    /// State at the bucket-apply ledger.
    pub bucket_state: Option<HistoryArchiveState>,
    /// Headers of the verify range, ascending, already checked.
    pub verified_headers: Vec<LedgerHeader>,
    pub buckets_downloaded: usize,
    pub last_applied: Option<LedgerHashPair>,
}

impl CatchupState {
    pub fn verified_header(&self, seq: u32) -> Option<&LedgerHeader> {
        let first = self.verified_headers.first()?.ledger_seq;
        self.verified_headers.get(seq.checked_sub(first)? as usize)
    }
}

pub type SharedCatchupState = Arc<Mutex<CatchupState>>;

pub(crate) async fn set_progress(state: &SharedCatchupState, stage: CatchupStage, message: impl Into<String>) {
    let mut guard = state.lock().await;
    guard.stage = stage;
    guard.message = message.into();
}

/// Which slot of [`CatchupState`] a fetched archive state lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveStateSlot {
    Remote,
    Bucket,
}

/// Fetch the archive state at a checkpoint, or the archive's latest.
pub struct GetHistoryArchiveStateWork {
    archive: Arc<dyn HistoryArchive>,
    checkpoint: Option<u32>,
    slot: ArchiveStateSlot,
    state: SharedCatchupState,
}

impl GetHistoryArchiveStateWork {
    pub fn new(
        archive: Arc<dyn HistoryArchive>,
        checkpoint: Option<u32>,
        slot: ArchiveStateSlot,
        state: SharedCatchupState,
    ) -> Self {
        Self {
            archive,
            checkpoint,
            slot,
            state,
        }
    }
}

#[async_trait]
impl Work for GetHistoryArchiveStateWork {
    fn name(&self) -> &str {
        match self.slot {
            ArchiveStateSlot::Remote => "get-history-archive-state",
            ArchiveStateSlot::Bucket => "get-bucket-archive-state",
        }
    }

    async fn run(&mut self, _ctx: WorkContext) -> WorkOutcome {
        let at = self
            .checkpoint
            .map_or_else(|| "current".to_string(), |cp| cp.to_string());
        set_progress(
            &self.state,
            CatchupStage::FetchingArchiveState,
            format!("fetching archive state at {at} from {}", self.archive.name()),
        )
        .await;

        match self.archive.get_state(self.checkpoint).await {
            Ok(has) => {
                info!(
                    archive = self.archive.name(),
                    ledger = has.current_ledger,
                    "fetched history archive state"
                );
                let mut guard = self.state.lock().await;
                match self.slot {
                    ArchiveStateSlot::Remote => guard.remote_state = Some(has),
                    ArchiveStateSlot::Bucket => guard.bucket_state = Some(has),
                }
                WorkOutcome::Success
            }
            Err(err) => {
                warn!(archive = self.archive.name(), checkpoint = %at, error = %err, "failed to fetch archive state");
                self.state.lock().await.message = format!("archive state at {at}: {err}");
                WorkOutcome::Retry {
                    delay: std::time::Duration::ZERO,
                }
            }
        }
    }
}

/// Download the headers of a ledger range and verify them as one chain.
///
/// Checkpoint files already downloaded are kept across retries.
pub struct DownloadVerifyLedgerChainWork {
    archive: Arc<dyn HistoryArchive>,
    range: LedgerRange,
    last_closed: LedgerHashPair,
    trusted: Option<LedgerHashPair>,
    checkpoints: Checkpoints,
    downloaded: BTreeMap<u32, Vec<LedgerHeader>>,
    state: SharedCatchupState,
}

impl DownloadVerifyLedgerChainWork {
    pub fn new(
        archive: Arc<dyn HistoryArchive>,
        range: LedgerRange,
        last_closed: LedgerHashPair,
        trusted: Option<LedgerHashPair>,
        checkpoints: Checkpoints,
        state: SharedCatchupState,
    ) -> Self {
        Self {
            archive,
            range,
            last_closed,
            trusted,
            checkpoints,
            downloaded: BTreeMap::new(),
            state,
        }
    }
}

#[async_trait]
impl Work for DownloadVerifyLedgerChainWork {
    fn name(&self) -> &str {
        "download-verify-ledger-chain"
    }

    async fn run(&mut self, ctx: WorkContext) -> WorkOutcome {
        let first = self.range.first;
        let last = self.range.last();
        set_progress(
            &self.state,
            CatchupStage::VerifyingLedgerChain,
            format!("downloading and verifying ledgers {first}-{last}"),
        )
        .await;

        for checkpoint in self.checkpoints.checkpoints_covering(first, last) {
            if ctx.is_cancelled() {
                return WorkOutcome::Cancelled;
            }
            if self.downloaded.contains_key(&checkpoint) {
                continue;
            }
            match self.archive.get_ledger_headers(checkpoint).await {
                Ok(headers) => {
                    debug!(checkpoint, count = headers.len(), "downloaded ledger headers");
                    self.downloaded.insert(checkpoint, headers);
                }
                Err(err) => {
                    warn!(checkpoint, error = %err, "failed to download ledger headers");
                    self.state.lock().await.message = format!("headers for checkpoint {checkpoint}: {err}");
                    return WorkOutcome::Retry {
                        delay: std::time::Duration::ZERO,
                    };
                }
            }
        }

        let headers: Vec<LedgerHeader> = self
            .downloaded
            .values()
            .flatten()
            .filter(|h| self.range.contains(h.ledger_seq))
            .cloned()
            .collect();
        if headers.len() != self.range.count as usize {
            return WorkOutcome::Failed(format!(
                "archive holds {} of the {} headers in ledgers {first}-{last}",
                headers.len(),
                self.range.count
            ));
        }

        if let Err(err) = verify::verify_header_chain(&headers, &self.last_closed, self.trusted.as_ref()) {
            return WorkOutcome::Failed(format!("ledger chain {first}-{last} failed verification: {err}"));
        }

        info!(first, last, "verified ledger chain");
        self.state.lock().await.verified_headers = headers;
        WorkOutcome::Success
    }
}

/// Download the buckets of the bucket-apply state that are not stored
/// locally, then apply that state.
pub struct DownloadApplyBucketsWork {
    archive: Arc<dyn HistoryArchive>,
    store: Arc<dyn BucketStore>,
    ledger: Arc<dyn LedgerApplier>,
    state: SharedCatchupState,
}

impl DownloadApplyBucketsWork {
    pub fn new(
        archive: Arc<dyn HistoryArchive>,
        store: Arc<dyn BucketStore>,
        ledger: Arc<dyn LedgerApplier>,
        state: SharedCatchupState,
    ) -> Self {
        Self {
            archive,
            store,
            ledger,
            state,
        }
    }
}

#[async_trait]
impl Work for DownloadApplyBucketsWork {
    fn name(&self) -> &str {
        "download-apply-buckets"
    }

    async fn run(&mut self, _ctx: WorkContext) -> WorkOutcome {
        let (has, anchor) = {
            let guard = self.state.lock().await;
            let Some(has) = guard.bucket_state.clone() else {
                return WorkOutcome::Failed("no archive state to apply buckets from".into());
            };
            let Some(anchor) = guard.verified_header(has.current_ledger).cloned() else {
                return WorkOutcome::Failed(format!(
                    "no verified header for bucket-apply ledger {}",
                    has.current_ledger
                ));
            };
            (has, anchor)
        };

        let missing: Vec<Hash256> = has
            .all_buckets()
            .into_iter()
            .filter(|hash| !self.store.contains(hash))
            .collect();
        set_progress(
            &self.state,
            CatchupStage::ApplyingBuckets,
            format!("downloading {} buckets for ledger {}", missing.len(), has.current_ledger),
        )
        .await;

        let archive = Arc::clone(&self.archive);
        let results: Vec<Result<(Hash256, Vec<u8>), BucketFetchError>> = stream::iter(missing)
            .map(|hash| {
                let archive = Arc::clone(&archive);
                async move {
                    let data = archive
                        .get_bucket(&hash)
                        .await
                        .map_err(|err| BucketFetchError::Download(format!("bucket {hash}: {err}")))?;
                    verify::verify_bucket_hash(&data, &hash)
                        .map_err(|err| BucketFetchError::Corrupt(err.to_string()))?;
                    Ok((hash, data))
                }
            })
            .buffer_unordered(MAX_CONCURRENT_DOWNLOADS)
            .collect()
            .await;

        // Good buckets are stored even when others failed, so a retry only
        // fetches what is still missing.
        let mut count = 0;
        let mut download_error = None;
        for result in results {
            match result {
                Ok((hash, data)) => {
                    if let Err(err) = self.store.put(hash, data) {
                        return WorkOutcome::Failed(format!("failed to store bucket {hash}: {err}"));
                    }
                    count += 1;
                }
                Err(BucketFetchError::Corrupt(err)) => return WorkOutcome::Failed(err),
                Err(BucketFetchError::Download(err)) => {
                    download_error.get_or_insert(err);
                }
            }
        }
        self.state.lock().await.buckets_downloaded += count;
        if let Some(err) = download_error {
            warn!(archive = self.archive.name(), error = %err, "failed to download buckets");
            self.state.lock().await.message = format!("failed to download {err}");
            return WorkOutcome::Retry {
                delay: std::time::Duration::ZERO,
            };
        }
        info!(count, ledger = has.current_ledger, "downloaded buckets");

        set_progress(
            &self.state,
            CatchupStage::ApplyingBuckets,
            format!("applying buckets at ledger {}", anchor.ledger_seq),
        )
        .await;
        if let Err(err) = self.ledger.apply_buckets(&has, &anchor) {
            return WorkOutcome::Failed(format!(
                "failed to apply buckets at ledger {}: {err}",
                anchor.ledger_seq
            ));
        }

        self.state.lock().await.last_applied = Some(anchor.hash_pair());
        WorkOutcome::Success
    }
}

enum BucketFetchError {
    /// The archive did not deliver; worth another attempt.
    Download(String),
    /// The archive delivered the wrong bytes.
    Corrupt(String),
}

/// Download the transactions of a replay range, check them against the
/// verified headers and close each ledger in order.
pub struct DownloadApplyTransactionsWork {
    archive: Arc<dyn HistoryArchive>,
    ledger: Arc<dyn LedgerApplier>,
    range: LedgerRange,
    checkpoints: Checkpoints,
    state: SharedCatchupState,
}

impl DownloadApplyTransactionsWork {
    pub fn new(
        archive: Arc<dyn HistoryArchive>,
        ledger: Arc<dyn LedgerApplier>,
        range: LedgerRange,
        checkpoints: Checkpoints,
        state: SharedCatchupState,
    ) -> Self {
        Self {
            archive,
            ledger,
            range,
            checkpoints,
            state,
        }
    }

    async fn download(&self) -> Result<HashMap<u32, TransactionHistoryEntry>, String> {
        let mut entries = HashMap::new();
        for checkpoint in self.checkpoints.checkpoints_covering(self.range.first, self.range.last()) {
            let batch = self
                .archive
                .get_transactions(checkpoint)
                .await
                .map_err(|err| format!("failed to download transactions for checkpoint {checkpoint}: {err}"))?;
            entries.extend(
                batch
                    .into_iter()
                    .filter(|entry| self.range.contains(entry.ledger_seq))
                    .map(|entry| (entry.ledger_seq, entry)),
            );
        }
        Ok(entries)
    }
}

#[async_trait]
impl Work for DownloadApplyTransactionsWork {
    fn name(&self) -> &str {
        "download-apply-transactions"
    }

    async fn run(&mut self, ctx: WorkContext) -> WorkOutcome {
        let first = self.range.first;
        let last = self.range.last();
        set_progress(
            &self.state,
            CatchupStage::ApplyingTransactions,
            format!("downloading transactions for ledgers {first}-{last}"),
        )
        .await;

        // Nothing is applied until every checkpoint is downloaded, so a
        // download failure leaves the ledger untouched and can be retried.
        let mut entries = match self.download().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(archive = self.archive.name(), error = %err, "failed to download transactions");
                self.state.lock().await.message = err;
                return WorkOutcome::Retry {
                    delay: std::time::Duration::ZERO,
                };
            }
        };

        for seq in first..=last {
            if ctx.is_cancelled() {
                return WorkOutcome::Cancelled;
            }
            let header = {
                let guard = self.state.lock().await;
                match guard.verified_header(seq) {
                    Some(header) => header.clone(),
                    None => return WorkOutcome::Failed(format!("no verified header for ledger {seq}")),
                }
            };
            // Archives may omit ledgers that closed with no transactions.
            let entry = entries.remove(&seq).unwrap_or(TransactionHistoryEntry {
                ledger_seq: seq,
                tx_set: Vec::new(),
            });
            if let Err(err) = verify::verify_tx_set(&header, &entry) {
                return WorkOutcome::Failed(err.to_string());
            }

            let applied = match self.ledger.apply_ledger(&header, &entry) {
                Ok(hash) => hash,
                Err(err) => return WorkOutcome::Failed(format!("failed to apply ledger {seq}: {err}")),
            };
            let expected = header.hash();
            if applied != expected {
                return WorkOutcome::Failed(format!(
                    "ledger {seq} applied to hash {applied}, expected {expected}"
                ));
            }
            debug!(ledger = seq, txs = entry.tx_set.len(), "applied ledger");
            self.state.lock().await.last_applied = Some(LedgerHashPair::new(seq, applied));
        }

        info!(first, last, "applied transactions");
        WorkOutcome::Success
    }
}
