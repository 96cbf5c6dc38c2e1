//! History archive state (HAS).
//!
//! The HAS is the JSON document an archive publishes per checkpoint (and at
//! [`ROOT_HAS_PATH`](crate::checkpoint::ROOT_HAS_PATH) for its latest
//! checkpoint). It names the checkpoint's last ledger and the bucket list
//! at that ledger, one `curr`/`snap` pair per level.

use std::collections::{BTreeSet, HashSet};

use lumen_common::Hash256;
use serde::{Deserialize, Serialize};

use crate::error::{HistoryError, Result};

pub const HAS_VERSION: u32 = 1;

/// One level of the bucket list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLevel {
    pub curr: Hash256,
    pub snap: Hash256,
}

impl BucketLevel {
    pub fn new(curr: Hash256, snap: Hash256) -> Self {
        Self { curr, snap }
    }

    pub fn hash(&self) -> Hash256 {
        Hash256::hash_parts(&[self.curr.as_bytes().as_slice(), self.snap.as_bytes().as_slice()])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryArchiveState {
    pub version: u32,
    /// Identifies the node that wrote the document.
    #[serde(default)]
    pub server: String,
    pub current_ledger: u32,
    pub current_buckets: Vec<BucketLevel>,
}

impl HistoryArchiveState {
    pub fn new(current_ledger: u32, current_buckets: Vec<BucketLevel>) -> Self {
        Self {
            version: HAS_VERSION,
            server: format!("lumen {}", env!("CARGO_PKG_VERSION")),
            current_ledger,
            current_buckets,
        }
    }

    /// Parse a HAS document.
    ///
    /// ```
    /// use lumen_history::HistoryArchiveState;
    ///
    /// let json = r#"{
    ///     "version": 1,
    ///     "currentLedger": 127,
    ///     "currentBuckets": [{
    ///         "curr": "e113f8cc5468579cb57538e3204c8d3ecce59a0cdb47f6fa7e87ab4d9d8146fd",
    ///         "snap": "0000000000000000000000000000000000000000000000000000000000000000"
    ///     }]
    /// }"#;
    /// let has = HistoryArchiveState::from_json(json).unwrap();
    /// assert_eq!(has.current_ledger, 127);
    /// assert_eq!(has.all_buckets().len(), 1);
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let has: Self = serde_json::from_str(json)?;
        if has.version != HAS_VERSION {
            return Err(HistoryError::VerificationFailed(format!(
                "unsupported archive state version {}",
                has.version
            )));
        }
        Ok(has)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// The bucket list hash a ledger header at `current_ledger` commits to.
    pub fn bucket_list_hash(&self) -> Hash256 {
        let level_hashes: Vec<Hash256> = self.current_buckets.iter().map(BucketLevel::hash).collect();
        let parts: Vec<&[u8]> = level_hashes.iter().map(|h| h.as_bytes().as_slice()).collect();
        Hash256::hash_parts(&parts)
    }

    /// Every non-empty bucket referenced, deduplicated and sorted.
    pub fn all_buckets(&self) -> Vec<Hash256> {
        self.current_buckets
            .iter()
            .flat_map(|level| [level.curr, level.snap])
            .filter(|hash| !hash.is_zero())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Buckets referenced here but not by `other`.
    pub fn differing_buckets(&self, other: &HistoryArchiveState) -> Vec<Hash256> {
        let known: HashSet<Hash256> = other.all_buckets().into_iter().collect();
        self.all_buckets()
            .into_iter()
            .filter(|hash| !known.contains(hash))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn has_with(ledger: u32, pairs: &[(&[u8], &[u8])]) -> HistoryArchiveState {
        let levels = pairs
            .iter()
            .map(|(curr, snap)| {
                let hash = |b: &[u8]| if b.is_empty() { Hash256::ZERO } else { Hash256::hash(b) };
                BucketLevel::new(hash(*curr), hash(*snap))
            })
            .collect();
        HistoryArchiveState::new(ledger, levels)
    }

    #[test]
    fn test_all_buckets_skips_empty_and_dedupes() {
        let has = has_with(127, &[(b"a", b"b"), (b"a", b""), (b"", b"")]);
        let buckets = has.all_buckets();
        assert_eq!(buckets.len(), 2);
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_differing_buckets() {
        let local = has_with(63, &[(b"a", b"b")]);
        let remote = has_with(127, &[(b"a", b"c"), (b"d", b"")]);
        let mut expected = vec![Hash256::hash(b"c"), Hash256::hash(b"d")];
        expected.sort();
        assert_eq!(remote.differing_buckets(&local), expected);
        assert!(local.differing_buckets(&local).is_empty());
    }

    #[test]
    fn test_bucket_list_hash_depends_on_levels() {
        let one = has_with(127, &[(b"a", b"b")]);
        let same = has_with(191, &[(b"a", b"b")]);
        let swapped = has_with(127, &[(b"b", b"a")]);
        assert_eq!(one.bucket_list_hash(), same.bucket_list_hash());
        assert_ne!(one.bucket_list_hash(), swapped.bucket_list_hash());
    }

    #[test]
    fn test_json_uses_camel_case_and_hex() {
        let has = has_with(127, &[(b"a", b"")]);
        let json = has.to_json().unwrap();
        assert!(json.contains("\"currentLedger\": 127"));
        assert!(json.contains(&Hash256::hash(b"a").to_hex()));
        assert_eq!(HistoryArchiveState::from_json(&json).unwrap(), has);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let json = r#"{"version": 9, "currentLedger": 1, "currentBuckets": []}"#;
        assert!(matches!(
            HistoryArchiveState::from_json(json),
            Err(HistoryError::VerificationFailed(_))
        ));
        assert!(HistoryArchiveState::from_json("{").is_err());
    }
}
