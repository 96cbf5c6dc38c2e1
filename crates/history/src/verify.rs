//! Integrity checks for downloaded history.
//!
//! Nothing fetched from an archive is trusted until it is tied back to
//! something that is: the local last closed ledger, an operator supplied
//! trusted hash, or a header that was itself verified that way.

use lumen_common::Hash256;

use crate::archive_state::HistoryArchiveState;
use crate::error::{HistoryError, Result};
use crate::ledger::{LedgerHashPair, LedgerHeader, TransactionHistoryEntry};

/// Verify that `headers` form one hash-linked chain.
///
/// - sequence numbers are consecutive
/// - each header's `previous_ledger_hash` is the hash of the header before it
/// - when the chain starts right after `last_closed`, it links to it, and a
///   header at `last_closed`'s sequence must have `last_closed`'s hash
/// - when `trusted` is given, the chain must contain that ledger with that hash
pub fn verify_header_chain(
    headers: &[LedgerHeader],
    last_closed: &LedgerHashPair,
    trusted: Option<&LedgerHashPair>,
) -> Result<()> {
    let Some(first) = headers.first() else {
        return Err(HistoryError::VerificationFailed("empty header chain".into()));
    };

    if first.ledger_seq == last_closed.ledger + 1 && first.previous_ledger_hash != last_closed.hash {
        return Err(HistoryError::InvalidPreviousHash {
            ledger: first.ledger_seq,
        });
    }

    let mut prev: Option<&LedgerHeader> = None;
    for header in headers {
        if let Some(prev) = prev {
            if header.ledger_seq != prev.ledger_seq + 1 {
                return Err(HistoryError::InvalidSequence {
                    expected: prev.ledger_seq + 1,
                    got: header.ledger_seq,
                });
            }
            if header.previous_ledger_hash != prev.hash() {
                return Err(HistoryError::InvalidPreviousHash {
                    ledger: header.ledger_seq,
                });
            }
        }
        if header.ledger_seq == last_closed.ledger && header.hash() != last_closed.hash {
            return Err(HistoryError::UntrustedChain {
                ledger: header.ledger_seq,
                expected: last_closed.hash,
                actual: header.hash(),
            });
        }
        prev = Some(header);
    }

    if let Some(trusted) = trusted {
        let pinned = headers
            .iter()
            .find(|h| h.ledger_seq == trusted.ledger)
            .ok_or_else(|| {
                HistoryError::VerificationFailed(format!(
                    "trusted ledger {} is outside the downloaded chain",
                    trusted.ledger
                ))
            })?;
        let actual = pinned.hash();
        if actual != trusted.hash {
            return Err(HistoryError::UntrustedChain {
                ledger: trusted.ledger,
                expected: trusted.hash,
                actual,
            });
        }
    }
    Ok(())
}

pub fn verify_bucket_hash(data: &[u8], expected: &Hash256) -> Result<()> {
    if Hash256::hash(data) != *expected {
        return Err(HistoryError::CorruptBucket(*expected));
    }
    Ok(())
}

/// Check a ledger's transactions against the header that closed it.
pub fn verify_tx_set(header: &LedgerHeader, entry: &TransactionHistoryEntry) -> Result<()> {
    if entry.ledger_seq != header.ledger_seq {
        return Err(HistoryError::InvalidSequence {
            expected: header.ledger_seq,
            got: entry.ledger_seq,
        });
    }
    if entry.tx_set_hash(&header.previous_ledger_hash) != header.tx_set_hash {
        return Err(HistoryError::InvalidTxSetHash {
            ledger: header.ledger_seq,
        });
    }
    Ok(())
}

/// Bucket state about to be applied must match the verified header it is
/// anchored to, and must not move the node backwards.
pub fn verify_bucket_state(
    has: &HistoryArchiveState,
    anchor: &LedgerHeader,
    last_closed: u32,
) -> Result<()> {
    if has.current_ledger != anchor.ledger_seq {
        return Err(HistoryError::BucketStateMismatch(format!(
            "archive state is at ledger {} but the verified anchor is ledger {}",
            has.current_ledger, anchor.ledger_seq
        )));
    }
    let declared = has.bucket_list_hash();
    if declared != anchor.bucket_list_hash {
        return Err(HistoryError::BucketStateMismatch(format!(
            "bucket list hash {} at ledger {} does not match verified header hash {}",
            declared, anchor.ledger_seq, anchor.bucket_list_hash
        )));
    }
    if anchor.ledger_seq < last_closed {
        return Err(HistoryError::BucketStateMismatch(format!(
            "anchor ledger {} is older than last closed ledger {}",
            anchor.ledger_seq, last_closed
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive_state::BucketLevel;

    fn chain(first: u32, len: u32, parent: Hash256) -> Vec<LedgerHeader> {
        let mut prev = parent;
        (first..first + len)
            .map(|seq| {
                let header = LedgerHeader {
                    ledger_seq: seq,
                    previous_ledger_hash: prev,
                    tx_set_hash: Hash256::ZERO,
                    bucket_list_hash: Hash256::ZERO,
                    close_time: seq as u64 * 5,
                    base_fee: 100,
                };
                prev = header.hash();
                header
            })
            .collect()
    }

    #[test]
    fn test_valid_chain_linked_to_lcl_and_pin() {
        let lcl = LedgerHashPair::new(10, Hash256::hash(b"ten"));
        let headers = chain(11, 5, lcl.hash);
        let pin = headers[4].hash_pair();
        verify_header_chain(&headers, &lcl, Some(&pin)).unwrap();
    }

    #[test]
    fn test_broken_link_detected() {
        let lcl = LedgerHashPair::new(10, Hash256::hash(b"ten"));
        let mut headers = chain(11, 5, lcl.hash);
        headers[2].close_time += 1;
        assert!(matches!(
            verify_header_chain(&headers, &lcl, None),
            Err(HistoryError::InvalidPreviousHash { ledger: 14 })
        ));
    }

    #[test]
    fn test_gap_detected() {
        let lcl = LedgerHashPair::new(1, Hash256::ZERO);
        let mut headers = chain(100, 3, Hash256::ZERO);
        headers.remove(1);
        assert!(matches!(
            verify_header_chain(&headers, &lcl, None),
            Err(HistoryError::InvalidSequence { expected: 101, got: 102 })
        ));
    }

    #[test]
    fn test_chain_must_follow_lcl() {
        let lcl = LedgerHashPair::new(10, Hash256::hash(b"ten"));
        let headers = chain(11, 2, Hash256::hash(b"other"));
        assert!(matches!(
            verify_header_chain(&headers, &lcl, None),
            Err(HistoryError::InvalidPreviousHash { ledger: 11 })
        ));
    }

    #[test]
    fn test_pin_mismatch_and_out_of_range() {
        let lcl = LedgerHashPair::new(1, Hash256::ZERO);
        let headers = chain(128, 3, Hash256::hash(b"x"));
        let wrong = LedgerHashPair::new(130, Hash256::hash(b"forged"));
        assert!(matches!(
            verify_header_chain(&headers, &lcl, Some(&wrong)),
            Err(HistoryError::UntrustedChain { ledger: 130, .. })
        ));
        let outside = LedgerHashPair::new(500, Hash256::ZERO);
        assert!(verify_header_chain(&headers, &lcl, Some(&outside)).is_err());
        assert!(verify_header_chain(&[], &lcl, None).is_err());
    }

    #[test]
    fn test_bucket_and_tx_set_checks() {
        let data = b"bucket contents";
        verify_bucket_hash(data, &Hash256::hash(data)).unwrap();
        assert!(verify_bucket_hash(b"tampered", &Hash256::hash(data)).is_err());

        let entry = TransactionHistoryEntry {
            ledger_seq: 12,
            tx_set: vec![b"pay".to_vec()],
        };
        let mut header = chain(12, 1, Hash256::hash(b"p")).remove(0);
        header.tx_set_hash = entry.tx_set_hash(&header.previous_ledger_hash);
        verify_tx_set(&header, &entry).unwrap();
        header.tx_set_hash = Hash256::ZERO;
        assert!(matches!(
            verify_tx_set(&header, &entry),
            Err(HistoryError::InvalidTxSetHash { ledger: 12 })
        ));
    }

    #[test]
    fn test_bucket_state_must_match_anchor() {
        let has = HistoryArchiveState::new(
            127,
            vec![BucketLevel::new(Hash256::hash(b"a"), Hash256::ZERO)],
        );
        let mut anchor = chain(127, 1, Hash256::ZERO).remove(0);
        anchor.bucket_list_hash = has.bucket_list_hash();
        verify_bucket_state(&has, &anchor, 1).unwrap();

        assert!(verify_bucket_state(&has, &anchor, 200).is_err());
        anchor.bucket_list_hash = Hash256::hash(b"other");
        assert!(matches!(
            verify_bucket_state(&has, &anchor, 1),
            Err(HistoryError::BucketStateMismatch(_))
        ));
    }
}
