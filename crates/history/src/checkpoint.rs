//! Checkpoint arithmetic.
//!
//! History is published in checkpoints of `frequency` ledgers. A checkpoint
//! is named by its last ledger, which satisfies `(seq + 1) % frequency == 0`.
//! With the default frequency of 64:
//!
//! - checkpoint 63 holds ledgers 0-63
//! - checkpoint 127 holds ledgers 64-127
//! - checkpoint 191 holds ledgers 128-191
//!
//! Archive files are addressed by checkpoint and [`FileType`]; see
//! [`checkpoint_path`].

use std::fmt;

use lumen_common::Hash256;

pub const DEFAULT_CHECKPOINT_FREQUENCY: u32 = 64;

/// Checkpoint math for one checkpoint frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoints {
    frequency: u32,
}

impl Default for Checkpoints {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_CHECKPOINT_FREQUENCY,
        }
    }
}

impl Checkpoints {
    /// Returns `None` for a zero frequency.
    pub fn new(frequency: u32) -> Option<Self> {
        (frequency > 0).then_some(Self { frequency })
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// The checkpoint that contains `seq`. Saturates at `u32::MAX` when that
    /// checkpoint lies past the end of the sequence range.
    ///
    /// ```
    /// use lumen_history::Checkpoints;
    ///
    /// let cp = Checkpoints::default();
    /// assert_eq!(cp.checkpoint_containing(0), 63);
    /// assert_eq!(cp.checkpoint_containing(63), 63);
    /// assert_eq!(cp.checkpoint_containing(64), 127);
    /// ```
    pub fn checkpoint_containing(&self, seq: u32) -> u32 {
        self.first_ledger_in_checkpoint_containing(seq)
            .saturating_add(self.frequency - 1)
    }

    pub fn is_checkpoint(&self, seq: u32) -> bool {
        seq % self.frequency == self.frequency - 1
    }

    pub fn first_ledger_in_checkpoint_containing(&self, seq: u32) -> u32 {
        (seq / self.frequency) * self.frequency
    }

    /// The checkpoint right before the one containing `seq`, or `None` in
    /// the first checkpoint.
    pub fn last_ledger_before_checkpoint_containing(&self, seq: u32) -> Option<u32> {
        self.first_ledger_in_checkpoint_containing(seq).checked_sub(1)
    }

    /// The latest checkpoint at or below `seq`.
    pub fn latest_checkpoint_at_or_before(&self, seq: u32) -> Option<u32> {
        let containing = self.checkpoint_containing(seq);
        if containing == seq {
            Some(seq)
        } else {
            self.last_ledger_before_checkpoint_containing(seq)
        }
    }

    /// Every checkpoint whose ledgers intersect `first..=last`, ascending.
    pub fn checkpoints_covering(&self, first: u32, last: u32) -> Vec<u32> {
        if last < first {
            return Vec::new();
        }
        let mut out = Vec::new();
        let mut cp = self.checkpoint_containing(first);
        let end = self.checkpoint_containing(last);
        loop {
            out.push(cp);
            match cp.checked_add(self.frequency) {
                Some(next) if cp < end => cp = next,
                _ => break,
            }
        }
        out
    }
}

/// Kinds of files an archive stores per checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileType {
    /// The archive state document.
    History,
    Ledger,
    Transactions,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::History => "history",
            FileType::Ledger => "ledger",
            FileType::Transactions => "transactions",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{type}/{xx}/{yy}/{zz}/{type}-{checkpoint:08x}.json`, sharded by the
/// leading bytes of the hex checkpoint number.
///
/// ```
/// use lumen_history::{checkpoint_path, FileType};
///
/// assert_eq!(
///     checkpoint_path(FileType::Ledger, 127),
///     "ledger/00/00/00/ledger-0000007f.json"
/// );
/// ```
pub fn checkpoint_path(file_type: FileType, checkpoint: u32) -> String {
    let hex = format!("{checkpoint:08x}");
    format!(
        "{ty}/{}/{}/{}/{ty}-{hex}.json",
        &hex[0..2],
        &hex[2..4],
        &hex[4..6],
        ty = file_type.as_str(),
    )
}

pub fn bucket_path(hash: &Hash256) -> String {
    let hex = hash.to_hex();
    format!("bucket/{}/{}/{}/bucket-{hex}", &hex[0..2], &hex[2..4], &hex[4..6])
}

/// Location of the archive state describing the archive's latest checkpoint.
pub const ROOT_HAS_PATH: &str = ".well-known/lumen-history.json";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_containing() {
        let cp = Checkpoints::default();
        for seq in 0..=63 {
            assert_eq!(cp.checkpoint_containing(seq), 63);
        }
        for seq in 64..=127 {
            assert_eq!(cp.checkpoint_containing(seq), 127);
        }
        assert_eq!(cp.checkpoint_containing(991), 1023);
        assert_eq!(cp.checkpoint_containing(u32::MAX), u32::MAX);
        assert!(cp.is_checkpoint(u32::MAX));

        let odd = Checkpoints::new(100).unwrap();
        assert_eq!(odd.checkpoint_containing(u32::MAX), u32::MAX);
        assert!(!odd.is_checkpoint(u32::MAX));
    }

    #[test]
    fn test_is_checkpoint() {
        let cp = Checkpoints::default();
        assert!(cp.is_checkpoint(63));
        assert!(cp.is_checkpoint(959));
        assert!(!cp.is_checkpoint(64));
        assert!(!cp.is_checkpoint(0));
    }

    #[test]
    fn test_boundaries_around_checkpoint() {
        let cp = Checkpoints::default();
        assert_eq!(cp.first_ledger_in_checkpoint_containing(991), 960);
        assert_eq!(cp.last_ledger_before_checkpoint_containing(991), Some(959));
        assert_eq!(cp.last_ledger_before_checkpoint_containing(40), None);
        assert_eq!(cp.latest_checkpoint_at_or_before(62), None);
        assert_eq!(cp.latest_checkpoint_at_or_before(127), Some(127));
        assert_eq!(cp.latest_checkpoint_at_or_before(128), Some(127));
    }

    #[test]
    fn test_small_frequency() {
        let cp = Checkpoints::new(8).unwrap();
        assert_eq!(cp.checkpoint_containing(9), 15);
        assert!(cp.is_checkpoint(7));
        assert_eq!(cp.checkpoints_covering(5, 17), vec![7, 15, 23]);
        assert!(Checkpoints::new(0).is_none());
    }

    #[test]
    fn test_checkpoints_covering_single() {
        let cp = Checkpoints::default();
        assert_eq!(cp.checkpoints_covering(64, 100), vec![127]);
        assert!(cp.checkpoints_covering(10, 9).is_empty());
    }

    #[test]
    fn test_paths() {
        assert_eq!(
            checkpoint_path(FileType::Transactions, 0xaabbccff),
            "transactions/aa/bb/cc/transactions-aabbccff.json"
        );
        let hash = Hash256::hash(b"bucket");
        let path = bucket_path(&hash);
        assert!(path.starts_with(&format!("bucket/{}/", &hash.to_hex()[0..2])));
        assert!(path.ends_with(&hash.to_hex()));
    }
}
