//! Publishing a checkpoint snapshot to writable archives.
//!
//! Each writable archive gets its own three-step sequence: read the
//! archive's current state, upload the files it lacks, then write the new
//! state. Steps retry once. Archives are independent: one failing does not
//! stop the others from being updated, but the publish as a whole fails.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lumen_common::Hash256;
use lumen_work::{RetryPolicy, Work, WorkContext, WorkOutcome, WorkScheduler, WorkSchedulerConfig, WorkSequence};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::archive::{to_json_bytes, HistoryArchive};
use crate::archive_state::HistoryArchiveState;
use crate::checkpoint::{bucket_path, checkpoint_path, FileType};
use crate::error::{HistoryError, Result};
use crate::ledger::{LedgerHeader, TransactionHistoryEntry};

/// Everything published for one checkpoint.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    /// State as of the checkpoint's last ledger.
    pub local_state: HistoryArchiveState,
    pub headers: Vec<LedgerHeader>,
    pub transactions: Vec<TransactionHistoryEntry>,
    pub buckets: HashMap<Hash256, Vec<u8>>,
}

impl StateSnapshot {
    pub fn checkpoint(&self) -> u32 {
        self.local_state.current_ledger
    }
}

type RemoteState = Arc<Mutex<Option<HistoryArchiveState>>>;

fn retry() -> WorkOutcome {
    WorkOutcome::Retry {
        delay: std::time::Duration::ZERO,
    }
}

struct GetRemoteStateWork {
    archive: Arc<dyn HistoryArchive>,
    remote: RemoteState,
}

#[async_trait]
impl Work for GetRemoteStateWork {
    fn name(&self) -> &str {
        "get-remote-archive-state"
    }

    async fn run(&mut self, _ctx: WorkContext) -> WorkOutcome {
        match self.archive.get_state(None).await {
            Ok(has) => {
                *self.remote.lock().await = Some(has);
                WorkOutcome::Success
            }
            // A fresh archive has no state yet.
            Err(HistoryError::NotFound(_)) => WorkOutcome::Success,
            Err(err) => {
                warn!(archive = self.archive.name(), error = %err, "failed to read archive state");
                retry()
            }
        }
    }
}

struct PutSnapshotFilesWork {
    archive: Arc<dyn HistoryArchive>,
    snapshot: Arc<StateSnapshot>,
    remote: RemoteState,
}

#[async_trait]
impl Work for PutSnapshotFilesWork {
    fn name(&self) -> &str {
        "put-snapshot-files"
    }

    async fn run(&mut self, _ctx: WorkContext) -> WorkOutcome {
        let checkpoint = self.snapshot.checkpoint();
        let mut files: Vec<(String, Vec<u8>)> = Vec::new();
        for (file_type, encoded) in [
            (FileType::Ledger, to_json_bytes(&self.snapshot.headers)),
            (FileType::Transactions, to_json_bytes(&self.snapshot.transactions)),
        ] {
            match encoded {
                Ok(data) => files.push((checkpoint_path(file_type, checkpoint), data)),
                Err(err) => return WorkOutcome::Failed(format!("failed to encode {file_type} file: {err}")),
            }
        }

        let missing = match self.remote.lock().await.as_ref() {
            Some(remote) => self.snapshot.local_state.differing_buckets(remote),
            None => self.snapshot.local_state.all_buckets(),
        };
        for hash in missing {
            let Some(data) = self.snapshot.buckets.get(&hash) else {
                return WorkOutcome::Failed(format!("snapshot lacks bucket {hash}"));
            };
            files.push((bucket_path(&hash), data.clone()));
        }

        let count = files.len();
        for (path, data) in files {
            if let Err(err) = self.archive.put_file(&path, data).await {
                warn!(archive = self.archive.name(), path = %path, error = %err, "failed to upload file");
                return retry();
            }
        }
        info!(archive = self.archive.name(), checkpoint, files = count, "uploaded snapshot files");
        WorkOutcome::Success
    }
}

struct PutHistoryArchiveStateWork {
    archive: Arc<dyn HistoryArchive>,
    snapshot: Arc<StateSnapshot>,
}

#[async_trait]
impl Work for PutHistoryArchiveStateWork {
    fn name(&self) -> &str {
        "put-history-archive-state"
    }

    async fn run(&mut self, _ctx: WorkContext) -> WorkOutcome {
        match self.archive.put_state(&self.snapshot.local_state).await {
            Ok(()) => WorkOutcome::Success,
            Err(err) => {
                warn!(archive = self.archive.name(), error = %err, "failed to write archive state");
                retry()
            }
        }
    }
}

/// Publishes one snapshot to every writable archive.
pub struct PublishSnapshotWork {
    archives: Vec<Arc<dyn HistoryArchive>>,
    snapshot: Arc<StateSnapshot>,
    scheduler_config: WorkSchedulerConfig,
    name: String,
}

impl PublishSnapshotWork {
    pub fn new(archives: Vec<Arc<dyn HistoryArchive>>, snapshot: StateSnapshot) -> Self {
        let name = format!("update-archives-{:08x}", snapshot.checkpoint());
        Self {
            archives,
            snapshot: Arc::new(snapshot),
            scheduler_config: WorkSchedulerConfig::default(),
            name,
        }
    }

    pub fn with_scheduler_config(mut self, config: WorkSchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    /// Publish to every writable archive. Fails naming the archives that
    /// could not be updated.
    pub async fn publish(&self) -> Result<()> {
        let mut scheduler = WorkScheduler::new(self.scheduler_config.clone());
        let mut sequences = Vec::new();
        for archive in self.archives.iter().filter(|a| a.is_writable()) {
            let remote: RemoteState = Arc::new(Mutex::new(None));
            let mut sequence = WorkSequence::new();
            sequence.push(
                &mut scheduler,
                Box::new(GetRemoteStateWork {
                    archive: Arc::clone(archive),
                    remote: Arc::clone(&remote),
                }),
                RetryPolicy::Once,
            );
            sequence.push(
                &mut scheduler,
                Box::new(PutSnapshotFilesWork {
                    archive: Arc::clone(archive),
                    snapshot: Arc::clone(&self.snapshot),
                    remote,
                }),
                RetryPolicy::Once,
            );
            sequence.push(
                &mut scheduler,
                Box::new(PutHistoryArchiveStateWork {
                    archive: Arc::clone(archive),
                    snapshot: Arc::clone(&self.snapshot),
                }),
                RetryPolicy::Once,
            );
            sequences.push((archive.name().to_string(), sequence));
        }
        if sequences.is_empty() {
            return Err(HistoryError::InvalidConfiguration(
                "no writable archive to publish to".into(),
            ));
        }

        scheduler.run_until_done().await;

        let failed: Vec<String> = sequences
            .iter()
            .filter(|(_, sequence)| sequence.first_failure(&scheduler).is_some())
            .map(|(name, _)| name.clone())
            .collect();
        if failed.is_empty() {
            info!(checkpoint = self.snapshot.checkpoint(), archives = sequences.len(), "published snapshot");
            Ok(())
        } else {
            Err(HistoryError::WorkFailed {
                work: self.name.clone(),
                reason: format!("could not update {}", failed.join(", ")),
            })
        }
    }
}

#[async_trait]
impl Work for PublishSnapshotWork {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&mut self, _ctx: WorkContext) -> WorkOutcome {
        match self.publish().await {
            Ok(()) => WorkOutcome::Success,
            Err(err) => WorkOutcome::Failed(err.to_string()),
        }
    }
}
