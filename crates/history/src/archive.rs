//! Archive access.
//!
//! An archive is a flat file store. [`HistoryArchive`] implementors only
//! move bytes; the typed accessors are provided on top, addressing files by
//! checkpoint and [`FileType`] (see [`checkpoint_path`]).

use std::collections::HashMap;

use async_trait::async_trait;
use lumen_common::Hash256;
use parking_lot::Mutex;
use serde::Serialize;

use crate::archive_state::HistoryArchiveState;
use crate::checkpoint::{bucket_path, checkpoint_path, FileType, ROOT_HAS_PATH};
use crate::error::{HistoryError, Result};
use crate::ledger::{LedgerHeader, TransactionHistoryEntry};

#[async_trait]
pub trait HistoryArchive: Send + Sync {
    fn name(&self) -> &str;

    fn is_writable(&self) -> bool {
        false
    }

    async fn get_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn put_file(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// The state at `checkpoint`, or the archive's latest state for `None`.
    async fn get_state(&self, checkpoint: Option<u32>) -> Result<HistoryArchiveState> {
        let path = match checkpoint {
            Some(cp) => checkpoint_path(FileType::History, cp),
            None => ROOT_HAS_PATH.to_string(),
        };
        let bytes = self.get_file(&path).await?;
        let json = std::str::from_utf8(&bytes)
            .map_err(|e| HistoryError::VerificationFailed(format!("{path}: {e}")))?;
        HistoryArchiveState::from_json(json)
    }

    async fn get_ledger_headers(&self, checkpoint: u32) -> Result<Vec<LedgerHeader>> {
        let bytes = self
            .get_file(&checkpoint_path(FileType::Ledger, checkpoint))
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get_transactions(&self, checkpoint: u32) -> Result<Vec<TransactionHistoryEntry>> {
        let bytes = self
            .get_file(&checkpoint_path(FileType::Transactions, checkpoint))
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn get_bucket(&self, hash: &Hash256) -> Result<Vec<u8>> {
        self.get_file(&bucket_path(hash)).await
    }

    /// Write `has` as the state of its checkpoint and as the latest state.
    async fn put_state(&self, has: &HistoryArchiveState) -> Result<()> {
        let json = has.to_json()?.into_bytes();
        self.put_file(&checkpoint_path(FileType::History, has.current_ledger), json.clone())
            .await?;
        self.put_file(ROOT_HAS_PATH, json).await
    }
}

pub fn to_json_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// An archive held in memory. Records every path read so callers can see
/// what a run downloaded.
pub struct MemoryArchive {
    name: String,
    writable: bool,
    files: Mutex<HashMap<String, Vec<u8>>>,
    reads: Mutex<Vec<String>>,
}

impl MemoryArchive {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            writable: false,
            files: Mutex::new(HashMap::new()),
            reads: Mutex::new(Vec::new()),
        }
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn insert(&self, path: impl Into<String>, data: Vec<u8>) {
        self.files.lock().insert(path.into(), data);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.lock().contains_key(path)
    }

    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().clone()
    }
}

#[async_trait]
impl HistoryArchive for MemoryArchive {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_writable(&self) -> bool {
        self.writable
    }

    async fn get_file(&self, path: &str) -> Result<Vec<u8>> {
        self.reads.lock().push(path.to_string());
        self.files
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| HistoryError::NotFound(format!("{}: {path}", self.name)))
    }

    async fn put_file(&self, path: &str, data: Vec<u8>) -> Result<()> {
        if !self.writable {
            return Err(HistoryError::ArchiveUnavailable {
                archive: self.name.clone(),
                reason: "archive is read-only".into(),
            });
        }
        self.insert(path, data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive_state::BucketLevel;

    #[tokio::test]
    async fn test_state_round_trip_through_paths() {
        let archive = MemoryArchive::new("mem").writable();
        let has = HistoryArchiveState::new(
            191,
            vec![BucketLevel::new(Hash256::hash(b"b"), Hash256::ZERO)],
        );
        archive.put_state(&has).await.unwrap();

        assert!(archive.contains(ROOT_HAS_PATH));
        assert!(archive.contains(&checkpoint_path(FileType::History, 191)));
        assert_eq!(archive.get_state(None).await.unwrap(), has);
        assert_eq!(archive.get_state(Some(191)).await.unwrap(), has);
        assert!(matches!(
            archive.get_state(Some(127)).await,
            Err(HistoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_read_only_archive_rejects_writes() {
        let archive = MemoryArchive::new("ro");
        let err = archive.put_file("x", vec![1]).await.unwrap_err();
        assert!(matches!(err, HistoryError::ArchiveUnavailable { .. }));
        assert!(!archive.is_writable());
    }

    #[tokio::test]
    async fn test_reads_are_recorded() {
        let archive = MemoryArchive::new("mem");
        let data = b"bucket".to_vec();
        let hash = Hash256::hash(&data);
        archive.insert(bucket_path(&hash), data.clone());
        assert_eq!(archive.get_bucket(&hash).await.unwrap(), data);
        assert_eq!(archive.reads(), vec![bucket_path(&hash)]);
    }
}
