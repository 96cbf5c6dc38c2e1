//! Deciding which ledgers a catch-up run replays.
//!
//! | Case | Condition | Result |
//! |------|-----------|--------|
//! | 1 | LCL past genesis | replay `LCL+1..=target`, no buckets |
//! | 2 | count reaches back to genesis | replay `2..=target` |
//! | 3 | first wanted ledger is a checkpoint | buckets at it, replay after it |
//! | 4 | first wanted ledger in the first checkpoint | replay `2..=target` |
//! | 5 | otherwise | buckets at the previous checkpoint, replay from there |
//!
//! Whether buckets are applied is derived from the range: a bulk state
//! apply is needed exactly when the first replayed ledger is not the one
//! right after the local last closed ledger.

use std::fmt;
use std::str::FromStr;

use lumen_common::Hash256;

use crate::checkpoint::Checkpoints;
use crate::error::{HistoryError, Result};

pub const GENESIS_LEDGER_SEQ: u32 = 1;

/// `count` ledgers starting at `first`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerRange {
    pub first: u32,
    pub count: u32,
}

impl LedgerRange {
    pub fn new(first: u32, count: u32) -> Self {
        Self { first, count }
    }

    /// Range covering `first..=last`.
    pub fn inclusive(first: u32, last: u32) -> Self {
        Self {
            first,
            count: last.saturating_sub(first) + 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Last ledger of the range. For an empty range this is `first - 1`.
    pub fn last(&self) -> u32 {
        match self.count {
            0 => self.first.saturating_sub(1),
            count => self.first.saturating_add(count - 1),
        }
    }

    pub fn contains(&self, seq: u32) -> bool {
        seq >= self.first && seq - self.first < self.count
    }
}

/// Which ledger a run should end at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupTarget {
    /// Whatever the archive currently reports.
    Current,
    Ledger(u32),
}

impl FromStr for CatchupTarget {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "current" | "tip" => Ok(CatchupTarget::Current),
            other => other.parse().map(CatchupTarget::Ledger).map_err(|_| {
                HistoryError::InvalidConfiguration(format!(
                    "target '{s}' is neither a ledger number nor 'current'"
                ))
            }),
        }
    }
}

impl fmt::Display for CatchupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatchupTarget::Current => f.write_str("current"),
            CatchupTarget::Ledger(seq) => write!(f, "{seq}"),
        }
    }
}

/// What the operator asked for. Fixed for the lifetime of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchupConfiguration {
    pub target: CatchupTarget,
    /// How many ledgers before the target to replay. `0` asks for the
    /// smallest possible replay, [`CatchupConfiguration::COMPLETE`] for a
    /// replay from genesis.
    pub count: u32,
    /// Hash the ledger at the target must have, if known.
    pub trusted_hash: Option<Hash256>,
}

impl CatchupConfiguration {
    pub const COMPLETE: u32 = u32::MAX;

    pub fn new(target: CatchupTarget, count: u32) -> Self {
        Self {
            target,
            count,
            trusted_hash: None,
        }
    }

    pub fn with_trusted_hash(mut self, hash: Hash256) -> Self {
        self.trusted_hash = Some(hash);
        self
    }

    pub fn to_ledger(&self) -> Option<u32> {
        match self.target {
            CatchupTarget::Current => None,
            CatchupTarget::Ledger(seq) => Some(seq),
        }
    }

    /// Pin a `Current` target to the ledger the archive reported.
    pub fn resolve(&self, remote_ledger: u32) -> Self {
        match self.target {
            CatchupTarget::Current => Self {
                target: CatchupTarget::Ledger(remote_ledger),
                ..self.clone()
            },
            CatchupTarget::Ledger(_) => self.clone(),
        }
    }

    /// Reject requests that can never be planned, before any download.
    pub fn validate(&self, last_closed: u32) -> Result<()> {
        if last_closed == 0 {
            return Err(HistoryError::InvalidConfiguration(
                "last closed ledger must be at least 1".into(),
            ));
        }
        if let CatchupTarget::Ledger(to) = self.target {
            if to <= last_closed {
                return Err(HistoryError::InvalidConfiguration(format!(
                    "target ledger {to} is not after last closed ledger {last_closed}"
                )));
            }
        }
        Ok(())
    }
}

/// Ledgers to replay plus whether a bucket apply precedes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatchupRange {
    ledgers: LedgerRange,
    apply_buckets: bool,
}

impl CatchupRange {
    /// Plan a run from `last_closed` using a resolved configuration.
    pub fn new(
        last_closed: u32,
        config: &CatchupConfiguration,
        checkpoints: &Checkpoints,
    ) -> Result<Self> {
        let ledgers = compute_catchup_ledgers(last_closed, config, checkpoints)?;
        Ok(Self {
            ledgers,
            apply_buckets: ledgers.first > last_closed + 1,
        })
    }

    pub fn ledgers(&self) -> LedgerRange {
        self.ledgers
    }

    pub fn apply_buckets(&self) -> bool {
        self.apply_buckets
    }

    /// Whether any ledger is replayed after the (optional) bucket apply.
    pub fn apply_ledgers(&self) -> bool {
        !self.ledgers.is_empty()
    }

    pub fn first(&self) -> u32 {
        self.ledgers.first
    }

    pub fn last(&self) -> u32 {
        self.ledgers.last()
    }

    /// The checkpoint whose state is applied, `None` for pure replays.
    pub fn bucket_apply_ledger(&self) -> Option<u32> {
        self.apply_buckets.then(|| self.ledgers.first - 1)
    }

    /// Headers that need verifying: the replayed ledgers plus the bucket
    /// anchor ledger if there is one.
    pub fn verify_range(&self) -> LedgerRange {
        let first = self.bucket_apply_ledger().unwrap_or(self.ledgers.first);
        LedgerRange::inclusive(first, self.last())
    }
}

impl fmt::Display for CatchupRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bucket_apply_ledger() {
            Some(at) => write!(
                f,
                "buckets at {at}, replay {} ledgers from {}",
                self.ledgers.count, self.ledgers.first
            ),
            None => write!(
                f,
                "replay {} ledgers from {}",
                self.ledgers.count, self.ledgers.first
            ),
        }
    }
}

/// The ledgers a run must replay, see the module docs for the cases.
pub fn compute_catchup_ledgers(
    last_closed: u32,
    config: &CatchupConfiguration,
    checkpoints: &Checkpoints,
) -> Result<LedgerRange> {
    config.validate(last_closed)?;
    let to = config.to_ledger().ok_or_else(|| {
        HistoryError::InvalidConfiguration("target must be resolved before planning".into())
    })?;

    // The archive must be able to name the checkpoint holding the target.
    if !checkpoints.is_checkpoint(checkpoints.checkpoint_containing(to)) {
        return Err(HistoryError::InvalidConfiguration(format!(
            "target ledger {to} lies past the last checkpoint with frequency {}",
            checkpoints.frequency()
        )));
    }

    if last_closed > GENESIS_LEDGER_SEQ {
        return Ok(LedgerRange::new(last_closed + 1, to - last_closed));
    }

    let full_replay = LedgerRange::new(GENESIS_LEDGER_SEQ + 1, to - GENESIS_LEDGER_SEQ);
    if config.count >= to - GENESIS_LEDGER_SEQ {
        return Ok(full_replay);
    }

    let smallest_to_apply = to - config.count.max(1) + 1;
    let first_checkpoint = checkpoints.checkpoint_containing(GENESIS_LEDGER_SEQ);
    let smallest_checkpoint = checkpoints.checkpoint_containing(smallest_to_apply);

    if smallest_checkpoint == smallest_to_apply {
        return Ok(LedgerRange::new(
            smallest_to_apply + 1,
            to - smallest_to_apply,
        ));
    }
    // History entries only exist from the first checkpoint on.
    if smallest_checkpoint == first_checkpoint {
        return Ok(full_replay);
    }
    // One checkpoint further back so the first replayed ledger has a
    // history entry to verify against.
    let previous = smallest_checkpoint
        .checked_sub(checkpoints.frequency())
        .ok_or_else(|| {
            HistoryError::InvalidConfiguration(format!("no checkpoint before ledger {smallest_to_apply}"))
        })?;
    Ok(LedgerRange::new(previous + 1, to - previous))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(lcl: u32, to: u32, count: u32) -> CatchupRange {
        let config = CatchupConfiguration::new(CatchupTarget::Ledger(to), count);
        CatchupRange::new(lcl, &config, &Checkpoints::default()).unwrap()
    }

    #[test]
    fn test_past_genesis_replays_sequentially() {
        let range = plan(100, 150, 1000);
        assert_eq!(range.ledgers(), LedgerRange::new(101, 50));
        assert!(!range.apply_buckets());
        assert_eq!(range.bucket_apply_ledger(), None);
        assert_eq!(range.last(), 150);
    }

    #[test]
    fn test_genesis_with_small_count_applies_buckets() {
        let range = plan(1, 1000, 10);
        assert_eq!(range.ledgers(), LedgerRange::new(960, 41));
        assert!(range.apply_buckets());
        assert_eq!(range.bucket_apply_ledger(), Some(959));
        assert_eq!(range.verify_range(), LedgerRange::new(959, 42));
    }

    #[test]
    fn test_genesis_with_count_covering_everything() {
        let range = plan(1, 100, CatchupConfiguration::COMPLETE);
        assert_eq!(range.ledgers(), LedgerRange::new(2, 99));
        assert!(!range.apply_buckets());

        let range = plan(1, 100, 99);
        assert_eq!(range.ledgers(), LedgerRange::new(2, 99));
    }

    #[test]
    fn test_first_wanted_ledger_on_checkpoint() {
        let range = plan(1, 200, 74);
        // 200 - 74 + 1 = 127, a checkpoint
        assert_eq!(range.ledgers(), LedgerRange::new(128, 73));
        assert_eq!(range.bucket_apply_ledger(), Some(127));
    }

    #[test]
    fn test_minimal_to_checkpoint_applies_buckets_only() {
        let range = plan(1, 127, 0);
        assert!(range.apply_buckets());
        assert!(!range.apply_ledgers());
        assert_eq!(range.bucket_apply_ledger(), Some(127));
        assert_eq!(range.last(), 127);
        assert_eq!(range.verify_range(), LedgerRange::new(127, 1));
    }

    #[test]
    fn test_first_checkpoint_falls_back_to_full_replay() {
        let range = plan(1, 50, 10);
        assert_eq!(range.ledgers(), LedgerRange::new(2, 49));
        assert!(!range.apply_buckets());
    }

    #[test]
    fn test_extends_back_to_previous_checkpoint() {
        let range = plan(1, 200, 50);
        // 151 sits in checkpoint 191; anchor at 127
        assert_eq!(range.bucket_apply_ledger(), Some(127));
        assert_eq!(range.ledgers(), LedgerRange::new(128, 73));
    }

    #[test]
    fn test_rejects_unplannable_configurations() {
        let cp = Checkpoints::default();
        let behind = CatchupConfiguration::new(CatchupTarget::Ledger(10), 0);
        assert!(matches!(
            CatchupRange::new(10, &behind, &cp),
            Err(HistoryError::InvalidConfiguration(_))
        ));
        assert!(CatchupRange::new(0, &behind, &cp).is_err());

        let unresolved = CatchupConfiguration::new(CatchupTarget::Current, 0);
        assert!(CatchupRange::new(5, &unresolved, &cp).is_err());
        let resolved = unresolved.resolve(300);
        assert_eq!(resolved.to_ledger(), Some(300));
        assert!(CatchupRange::new(5, &resolved, &cp).is_ok());
    }

    #[test]
    fn test_ranges_at_the_top_of_the_sequence() {
        let top = LedgerRange::new(u32::MAX, 1);
        assert!(top.contains(u32::MAX));
        assert!(!top.contains(u32::MAX - 1));
        assert_eq!(top.last(), u32::MAX);
        assert!(!LedgerRange::new(u32::MAX - 1, 0).contains(u32::MAX - 1));

        // u32::MAX closes a checkpoint at the default frequency
        let range = plan(1, u32::MAX, 10);
        assert_eq!(range.ledgers(), LedgerRange::new(u32::MAX - 63, 64));
        assert_eq!(range.bucket_apply_ledger(), Some(u32::MAX - 64));
        assert_eq!(range.last(), u32::MAX);
        assert_eq!(plan(u32::MAX - 5, u32::MAX, 0).ledgers(), LedgerRange::new(u32::MAX - 4, 5));
    }

    #[test]
    fn test_rejects_target_without_checkpoint() {
        let cp = Checkpoints::new(100).unwrap();
        let config = CatchupConfiguration::new(CatchupTarget::Ledger(u32::MAX - 10), 10);
        assert!(matches!(
            CatchupRange::new(1, &config, &cp),
            Err(HistoryError::InvalidConfiguration(_))
        ));
        let config = CatchupConfiguration::new(CatchupTarget::Ledger(u32::MAX - 100), 10);
        assert!(CatchupRange::new(1, &config, &cp).is_ok());
    }

    #[test]
    fn test_target_parsing() {
        assert_eq!("current".parse::<CatchupTarget>().unwrap(), CatchupTarget::Current);
        assert_eq!("1024".parse::<CatchupTarget>().unwrap(), CatchupTarget::Ledger(1024));
        assert!("soon".parse::<CatchupTarget>().is_err());
    }
}
