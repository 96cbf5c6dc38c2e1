//! The catch-up orchestrator.
//!
//! A run moves through strictly ordered phases, each a [`WorkSequence`]
//! on its own scheduler, and never starts a phase before the previous one
//! succeeded:
//!
//! 1. fetch the archive state at the target checkpoint (or the tip)
//! 2. give up if the archive is not ahead of the local ledger
//! 3. plan the range ([`CatchupRange`])
//! 4. fetch the archive state at the bucket-apply ledger if it differs,
//!    then download and verify the header chain
//! 5. check the bucket state against the verified anchor header
//! 6. download and apply buckets, then download and apply transactions
//!
//! Progress is reported as `AppliedBuckets? -> AppliedTransactions ->
//! Finished`, or `Failed`. The [`SyncManager`] is told the run ended
//! either way. A run cannot be resumed; a new one is planned from the
//! ledger state at that time.

use std::sync::Arc;

use async_trait::async_trait;
use lumen_work::{
    RetryPolicy, Work, WorkContext, WorkOutcome, WorkScheduler, WorkSchedulerConfig, WorkSequence,
    WorkWithCallback,
};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::archive::HistoryArchive;
use crate::catchup_range::{CatchupConfiguration, CatchupRange, CatchupTarget};
use crate::checkpoint::Checkpoints;
use crate::error::{HistoryError, Result};
use crate::historywork::{
    set_progress, ArchiveStateSlot, CatchupStage, CatchupState, DownloadApplyBucketsWork,
    DownloadApplyTransactionsWork, DownloadVerifyLedgerChainWork, GetHistoryArchiveStateWork,
    SharedCatchupState,
};
use crate::ledger::{BucketStore, LedgerApplier, LedgerHashPair, SyncManager};
use crate::verify;

pub const DEFAULT_DOWNLOAD_RETRIES: u32 = 3;

/// Milestones reported to the progress handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupProgressState {
    AppliedBuckets,
    AppliedTransactions,
    Finished,
    Failed,
}

/// Called with each milestone and the last ledger applied at that point.
pub type CatchupProgressHandler = Arc<dyn Fn(CatchupProgressState, Option<LedgerHashPair>) + Send + Sync>;

type PhaseUnit = (Box<dyn Work + Send>, RetryPolicy);

fn unit<W: Work + 'static>(work: W, retry: RetryPolicy) -> PhaseUnit {
    (Box::new(work), retry)
}

pub struct CatchupWork {
    config: CatchupConfiguration,
    archive: Arc<dyn HistoryArchive>,
    ledger: Arc<dyn LedgerApplier>,
    buckets: Arc<dyn BucketStore>,
    sync: Arc<dyn SyncManager>,
    progress: CatchupProgressHandler,
    checkpoints: Checkpoints,
    scheduler_config: WorkSchedulerConfig,
    download_retries: u32,
    state: SharedCatchupState,
    range: Option<CatchupRange>,
}

impl CatchupWork {
    pub fn new(
        config: CatchupConfiguration,
        archive: Arc<dyn HistoryArchive>,
        ledger: Arc<dyn LedgerApplier>,
        buckets: Arc<dyn BucketStore>,
        sync: Arc<dyn SyncManager>,
    ) -> Self {
        Self {
            config,
            archive,
            ledger,
            buckets,
            sync,
            progress: Arc::new(|_, _| {}),
            checkpoints: Checkpoints::default(),
            scheduler_config: WorkSchedulerConfig::default(),
            download_retries: DEFAULT_DOWNLOAD_RETRIES,
            state: Arc::new(Mutex::new(CatchupState::default())),
            range: None,
        }
    }

    pub fn with_progress_handler(mut self, handler: CatchupProgressHandler) -> Self {
        self.progress = handler;
        self
    }

    pub fn with_checkpoints(mut self, checkpoints: Checkpoints) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    pub fn with_scheduler_config(mut self, config: WorkSchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    /// Retries granted to archive downloads. Verification and apply
    /// failures are never retried.
    pub fn with_download_retries(mut self, retries: u32) -> Self {
        self.download_retries = retries;
        self
    }

    /// The planned range, once the archive state has been fetched.
    pub fn range(&self) -> Option<CatchupRange> {
        self.range
    }

    pub fn state(&self) -> SharedCatchupState {
        Arc::clone(&self.state)
    }

    pub async fn stage(&self) -> CatchupStage {
        self.state.lock().await.stage
    }

    /// Run to completion, returning the last applied ledger.
    pub async fn execute(&mut self) -> Result<LedgerHashPair> {
        let result = self.drive().await;
        match &result {
            Ok(applied) => {
                info!(ledger = applied.ledger, hash = %applied.hash, "catch-up finished");
                set_progress(&self.state, CatchupStage::Finished, format!("caught up to {applied}")).await;
                (self.progress)(CatchupProgressState::AppliedTransactions, Some(*applied));
                (self.progress)(CatchupProgressState::Finished, Some(*applied));
                self.sync.history_caught_up(true);
            }
            Err(err) => {
                warn!(error = %err, "catch-up failed");
                set_progress(&self.state, CatchupStage::Failed, err.to_string()).await;
                self.sync.history_caught_up(false);
                (self.progress)(CatchupProgressState::Failed, None);
            }
        }
        result
    }

    async fn drive(&mut self) -> Result<LedgerHashPair> {
        let lcl = self.ledger.last_closed_ledger();
        self.config.validate(lcl.ledger)?;
        info!(
            lcl = lcl.ledger,
            target = %self.config.target,
            count = self.config.count,
            "starting catch-up"
        );

        let target_checkpoint = self
            .config
            .to_ledger()
            .map(|to| self.checkpoints.checkpoint_containing(to));
        self.run_sequence(vec![unit(
            GetHistoryArchiveStateWork::new(
                Arc::clone(&self.archive),
                target_checkpoint,
                ArchiveStateSlot::Remote,
                Arc::clone(&self.state),
            ),
            RetryPolicy::Bounded(self.download_retries),
        )])
        .await?;

        let remote = self
            .state
            .lock()
            .await
            .remote_state
            .clone()
            .ok_or_else(|| HistoryError::NotFound("remote archive state".into()))?;
        if remote.current_ledger <= lcl.ledger {
            match self.config.target {
                CatchupTarget::Current => info!(
                    remote = remote.current_ledger,
                    lcl = lcl.ledger,
                    "archive is not ahead of the local ledger, wait for the next checkpoint"
                ),
                CatchupTarget::Ledger(to) => info!(
                    remote = remote.current_ledger,
                    lcl = lcl.ledger,
                    to,
                    "archive is not ahead of the local ledger"
                ),
            }
            return Err(HistoryError::NothingToCatchUp {
                remote: remote.current_ledger,
                local: lcl.ledger,
            });
        }

        let resolved = self.config.resolve(remote.current_ledger);
        let range = CatchupRange::new(lcl.ledger, &resolved, &self.checkpoints)?;
        self.range = Some(range);
        info!(%range, "planned catch-up");

        let mut verify_phase: Vec<PhaseUnit> = Vec::new();
        if let Some(at) = range.bucket_apply_ledger() {
            if at == remote.current_ledger {
                self.state.lock().await.bucket_state = Some(remote.clone());
            } else {
                verify_phase.push(unit(
                    GetHistoryArchiveStateWork::new(
                        Arc::clone(&self.archive),
                        Some(at),
                        ArchiveStateSlot::Bucket,
                        Arc::clone(&self.state),
                    ),
                    RetryPolicy::Bounded(self.download_retries),
                ));
            }
        }
        let trusted = resolved
            .trusted_hash
            .map(|hash| LedgerHashPair::new(range.last(), hash));
        verify_phase.push(unit(
            DownloadVerifyLedgerChainWork::new(
                Arc::clone(&self.archive),
                range.verify_range(),
                lcl,
                trusted,
                self.checkpoints,
                Arc::clone(&self.state),
            ),
            RetryPolicy::Bounded(self.download_retries),
        ));
        self.run_sequence(verify_phase).await?;

        let mut apply_phase: Vec<PhaseUnit> = Vec::new();
        if let Some(at) = range.bucket_apply_ledger() {
            let anchor = self.assert_bucket_state(at, lcl.ledger).await?;
            let progress = Arc::clone(&self.progress);
            let buckets = DownloadApplyBucketsWork::new(
                Arc::clone(&self.archive),
                Arc::clone(&self.buckets),
                Arc::clone(&self.ledger),
                Arc::clone(&self.state),
            );
            apply_phase.push(unit(
                WorkWithCallback::new(
                    Box::new(buckets),
                    Arc::new(move |outcome: &WorkOutcome, _: &WorkContext| {
                        if *outcome == WorkOutcome::Success {
                            progress(CatchupProgressState::AppliedBuckets, Some(anchor));
                        }
                    }),
                ),
                RetryPolicy::Bounded(self.download_retries),
            ));
        }
        if range.apply_ledgers() {
            apply_phase.push(unit(
                DownloadApplyTransactionsWork::new(
                    Arc::clone(&self.archive),
                    Arc::clone(&self.ledger),
                    range.ledgers(),
                    self.checkpoints,
                    Arc::clone(&self.state),
                ),
                RetryPolicy::Bounded(self.download_retries),
            ));
        }
        self.run_sequence(apply_phase).await?;

        self.state
            .lock()
            .await
            .last_applied
            .ok_or_else(|| HistoryError::VerificationFailed("no ledger was applied".into()))
    }

    /// The archive state about to be applied must describe exactly the
    /// verified anchor header, which must not be behind local state.
    async fn assert_bucket_state(&self, at: u32, last_closed: u32) -> Result<LedgerHashPair> {
        let guard = self.state.lock().await;
        let has = guard
            .bucket_state
            .as_ref()
            .ok_or_else(|| HistoryError::NotFound(format!("archive state at ledger {at}")))?;
        let anchor = guard.verified_header(at).ok_or_else(|| {
            HistoryError::VerificationFailed(format!("no verified header at bucket-apply ledger {at}"))
        })?;
        if let Err(err) = verify::verify_bucket_state(has, anchor, last_closed) {
            error!(ledger = at, error = %err, "refusing to apply buckets");
            return Err(err);
        }
        Ok(anchor.hash_pair())
    }

    async fn run_sequence(&self, units: Vec<PhaseUnit>) -> Result<()> {
        let mut scheduler = WorkScheduler::new(self.scheduler_config.clone());
        let mut sequence = WorkSequence::new();
        let mut names = Vec::with_capacity(units.len());
        for (work, retry) in units {
            names.push(work.name().to_string());
            sequence.push(&mut scheduler, work, retry);
        }
        scheduler.run_until_done().await;

        let Some(failed) = sequence.first_failure(&scheduler) else {
            return Ok(());
        };
        let index = sequence.ids().iter().position(|id| *id == failed).unwrap_or_default();
        let reason = match scheduler.last_error(failed) {
            Some(err) => err.to_string(),
            None => format!("ended in state {:?}", scheduler.state(failed)),
        };
        let detail = self.state.lock().await.message.clone();
        Err(HistoryError::WorkFailed {
            work: names.get(index).cloned().unwrap_or_default(),
            reason: if detail.is_empty() || reason.contains(&detail) {
                reason
            } else {
                format!("{reason} ({detail})")
            },
        })
    }
}

#[async_trait]
impl Work for CatchupWork {
    fn name(&self) -> &str {
        "catchup"
    }

    async fn run(&mut self, _ctx: WorkContext) -> WorkOutcome {
        match self.execute().await {
            Ok(_) => WorkOutcome::Success,
            Err(err) => WorkOutcome::Failed(err.to_string()),
        }
    }
}
