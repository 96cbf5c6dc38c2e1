//! Quorum set operations.
//!
//! These are the threshold predicates federated voting is built on:
//!
//! - A **quorum slice** for a node is any set satisfying its quorum set.
//! - A **quorum** is a set of nodes that contains a slice for each member.
//! - A **v-blocking** set intersects every slice of the local node, so it
//!   can prevent agreement on its own.
//!
//! Also here: the sanity check applied to every quorum set before it is
//! trusted, hashing, and the weight used for nomination leader election.

use std::collections::{BTreeSet, HashSet};

use lumen_common::{Hash256, NodeId};

use crate::error::{Result, ScpError};
use crate::types::QuorumSet;

pub const MAXIMUM_QUORUM_NESTING_LEVEL: u32 = 4;

pub const MAXIMUM_QUORUM_NODES: usize = 1000;

/// Whether `nodes` satisfies `quorum_set`.
pub fn is_quorum_slice(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>) -> bool {
    let threshold = quorum_set.threshold as usize;
    if threshold == 0 {
        return true;
    }

    let mut count = 0;
    for validator in &quorum_set.validators {
        if nodes.contains(validator) {
            count += 1;
            if count >= threshold {
                return true;
            }
        }
    }
    for inner in &quorum_set.inner_sets {
        if is_quorum_slice(inner, nodes) {
            count += 1;
            if count >= threshold {
                return true;
            }
        }
    }
    false
}

/// Whether `nodes` contains a quorum for the local node.
///
/// Nodes whose own slice is not satisfied by the candidate set are pruned
/// repeatedly until the set is stable; the survivors must then satisfy the
/// local quorum set. Nodes with no known quorum set are pruned.
pub fn is_quorum<'q, F>(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>, get_quorum_set: F) -> bool
where
    F: Fn(&NodeId) -> Option<&'q QuorumSet>,
{
    let mut remaining: HashSet<NodeId> = nodes.clone();
    loop {
        let before = remaining.len();
        let snapshot = remaining.clone();
        remaining.retain(|node| {
            get_quorum_set(node)
                .map(|qs| is_quorum_slice(qs, &snapshot))
                .unwrap_or(false)
        });
        if remaining.len() == before {
            break;
        }
    }
    is_quorum_slice(quorum_set, &remaining)
}

/// Whether `nodes` intersects every slice of `quorum_set`.
///
/// A set with threshold 0 has no v-blocking set.
pub fn is_v_blocking(quorum_set: &QuorumSet, nodes: &HashSet<NodeId>) -> bool {
    let threshold = quorum_set.threshold as usize;
    if threshold == 0 {
        return false;
    }
    let blocking_threshold = quorum_set.entry_count().saturating_sub(threshold) + 1;

    let mut count = quorum_set
        .validators
        .iter()
        .filter(|v| nodes.contains(v))
        .count();
    if count >= blocking_threshold {
        return true;
    }
    for inner in &quorum_set.inner_sets {
        if is_v_blocking(inner, nodes) {
            count += 1;
            if count >= blocking_threshold {
                return true;
            }
        }
    }
    false
}

/// Validate a quorum set before trusting it.
///
/// Rules: threshold within `1..=entries` at every level, nesting at most
/// [`MAXIMUM_QUORUM_NESTING_LEVEL`], between 1 and
/// [`MAXIMUM_QUORUM_NODES`] validators overall, and no validator listed
/// twice. With `extra_checks`, each threshold must also be a strict
/// majority of its level.
pub fn check_quorum_set_sane(quorum_set: &QuorumSet, extra_checks: bool) -> Result<()> {
    let mut known = HashSet::new();
    check_level(quorum_set, 0, extra_checks, &mut known)?;
    if known.is_empty() || known.len() > MAXIMUM_QUORUM_NODES {
        return Err(ScpError::InvalidQuorumSet(format!(
            "total number of validators must be within 1 and {MAXIMUM_QUORUM_NODES}, got {}",
            known.len()
        )));
    }
    Ok(())
}

fn check_level(
    quorum_set: &QuorumSet,
    depth: u32,
    extra_checks: bool,
    known: &mut HashSet<NodeId>,
) -> Result<()> {
    if depth > MAXIMUM_QUORUM_NESTING_LEVEL {
        return Err(ScpError::InvalidQuorumSet(
            "maximum quorum nesting level exceeded".into(),
        ));
    }
    let total = quorum_set.entry_count();
    let threshold = quorum_set.threshold as usize;
    if threshold < 1 || threshold > total {
        return Err(ScpError::InvalidQuorumSet(format!(
            "threshold {threshold} outside 1..={total}"
        )));
    }
    if extra_checks && threshold < total - threshold + 1 {
        return Err(ScpError::InvalidQuorumSet(format!(
            "threshold {threshold} is below a majority of {total}"
        )));
    }
    for node in &quorum_set.validators {
        if !known.insert(*node) {
            return Err(ScpError::InvalidQuorumSet(format!(
                "duplicate validator {node}"
            )));
        }
    }
    for inner in &quorum_set.inner_sets {
        check_level(inner, depth + 1, extra_checks, known)?;
    }
    Ok(())
}

pub fn is_quorum_set_sane(quorum_set: &QuorumSet) -> bool {
    check_quorum_set_sane(quorum_set, false).is_ok()
}

/// Content hash of a quorum set.
pub fn hash_quorum_set(quorum_set: &QuorumSet) -> Hash256 {
    Hash256::hash_encoded(quorum_set).unwrap_or(Hash256::ZERO)
}

/// Every validator mentioned anywhere in the set.
pub fn all_nodes(quorum_set: &QuorumSet) -> BTreeSet<NodeId> {
    let mut nodes = BTreeSet::new();
    collect_nodes(quorum_set, &mut nodes);
    nodes
}

fn collect_nodes(quorum_set: &QuorumSet, nodes: &mut BTreeSet<NodeId>) {
    nodes.extend(quorum_set.validators.iter().copied());
    for inner in &quorum_set.inner_sets {
        collect_nodes(inner, nodes);
    }
}

/// Remove `node` from the set (lowering thresholds accordingly) and
/// simplify: singleton inner sets are merged into their parent and a set
/// that only wraps one inner set is replaced by it. Validators and inner
/// sets end up sorted.
pub fn normalize_without(quorum_set: &QuorumSet, node: Option<&NodeId>) -> QuorumSet {
    let mut out = quorum_set.clone();
    simplify(&mut out, node);
    sort_entries(&mut out);
    out
}

fn simplify(quorum_set: &mut QuorumSet, node: Option<&NodeId>) {
    if let Some(id) = node {
        let before = quorum_set.validators.len();
        quorum_set.validators.retain(|v| v != id);
        let removed = (before - quorum_set.validators.len()) as u32;
        quorum_set.threshold = quorum_set.threshold.saturating_sub(removed);
    }

    let mut inner_sets = std::mem::take(&mut quorum_set.inner_sets);
    for inner in &mut inner_sets {
        simplify(inner, node);
    }
    for inner in inner_sets {
        if inner.threshold == 1 && inner.validators.len() == 1 && inner.inner_sets.is_empty() {
            quorum_set.validators.push(inner.validators[0]);
        } else {
            quorum_set.inner_sets.push(inner);
        }
    }

    if quorum_set.threshold == 1
        && quorum_set.validators.is_empty()
        && quorum_set.inner_sets.len() == 1
    {
        let inner = quorum_set.inner_sets.remove(0);
        *quorum_set = inner;
    }
}

fn sort_entries(quorum_set: &mut QuorumSet) {
    quorum_set.validators.sort();
    for inner in &mut quorum_set.inner_sets {
        sort_entries(inner);
    }
    quorum_set
        .inner_sets
        .sort_by(|a, b| (&a.validators, a.threshold).cmp(&(&b.validators, b.threshold)));
}

/// `ceil(m * threshold / total)` without overflow.
pub fn compute_weight(m: u64, total: u64, threshold: u64) -> u64 {
    if threshold == 0 || total == 0 {
        return 0;
    }
    let numerator = u128::from(m) * u128::from(threshold);
    let denominator = u128::from(total);
    let res = numerator.div_ceil(denominator);
    u64::try_from(res).unwrap_or(u64::MAX)
}

/// Fraction of `u64::MAX` representing how much of the quorum set `node`
/// carries. Nodes absent from the set weigh 0.
pub fn node_weight(quorum_set: &QuorumSet, node: &NodeId) -> u64 {
    let total = quorum_set.entry_count() as u64;
    let threshold = u64::from(quorum_set.threshold);
    if quorum_set.validators.contains(node) {
        return compute_weight(u64::MAX, total, threshold);
    }
    for inner in &quorum_set.inner_sets {
        let weight = node_weight(inner, node);
        if weight > 0 {
            return compute_weight(weight, total, threshold);
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn node(n: u8) -> NodeId {
        NodeId::from_bytes([n; 32])
    }

    fn set(ids: &[u8]) -> HashSet<NodeId> {
        ids.iter().map(|i| node(*i)).collect()
    }

    fn flat(threshold: u32, ids: &[u8]) -> QuorumSet {
        QuorumSet::new(threshold, ids.iter().map(|i| node(*i)).collect())
    }

    #[test]
    fn test_quorum_slice_threshold() {
        let qs = flat(2, &[1, 2, 3]);
        assert!(is_quorum_slice(&qs, &set(&[1, 2])));
        assert!(!is_quorum_slice(&qs, &set(&[1])));
    }

    #[test]
    fn test_quorum_slice_inner_sets() {
        let qs = flat(2, &[1]).with_inner_sets(vec![flat(1, &[2, 3])]);
        assert!(is_quorum_slice(&qs, &set(&[1, 3])));
        assert!(!is_quorum_slice(&qs, &set(&[2, 3])));
    }

    #[test]
    fn test_v_blocking_threshold() {
        // 3-of-4 is blocked by any 2.
        let qs = flat(3, &[1, 2, 3, 4]);
        assert!(is_v_blocking(&qs, &set(&[1, 2])));
        assert!(!is_v_blocking(&qs, &set(&[1])));
        assert!(!is_v_blocking(&QuorumSet::default(), &set(&[1])));
    }

    #[test]
    fn test_is_quorum_prunes_unsatisfied_nodes() {
        let local = flat(2, &[1, 2, 3]);
        let mut qsets = HashMap::new();
        qsets.insert(node(1), flat(2, &[1, 2, 3]));
        // node 2 requires node 4, which is absent
        qsets.insert(node(2), flat(2, &[2, 4]));
        qsets.insert(node(3), flat(2, &[1, 3]));

        assert!(is_quorum(&local, &set(&[1, 3]), |n| qsets.get(n)));
        assert!(!is_quorum(&local, &set(&[1, 2]), |n| qsets.get(n)));
    }

    #[test]
    fn test_sanity_rejects_bad_sets() {
        assert!(check_quorum_set_sane(&flat(2, &[1, 2]), false).is_ok());
        assert!(check_quorum_set_sane(&flat(0, &[1, 2]), false).is_err());
        assert!(check_quorum_set_sane(&flat(3, &[1, 2]), false).is_err());
        assert!(check_quorum_set_sane(&flat(1, &[1, 1]), false).is_err());
        assert!(check_quorum_set_sane(&QuorumSet::new(1, vec![]), false).is_err());
        // 1-of-3 is legal but not a majority
        assert!(check_quorum_set_sane(&flat(1, &[1, 2, 3]), true).is_err());
    }

    #[test]
    fn test_sanity_rejects_deep_nesting() {
        let mut qs = flat(1, &[1]);
        for depth in 0..6u8 {
            qs = flat(1, &[10 + depth]).with_inner_sets(vec![qs]);
        }
        assert!(check_quorum_set_sane(&qs, false).is_err());
    }

    #[test]
    fn test_normalize_removes_node_and_merges_singletons() {
        let qs = flat(2, &[3, 1]).with_inner_sets(vec![flat(1, &[2])]);
        let normalized = normalize_without(&qs, Some(&node(1)));
        assert_eq!(normalized.threshold, 1);
        assert_eq!(normalized.validators, vec![node(2), node(3)]);
        assert!(normalized.inner_sets.is_empty());
    }

    #[test]
    fn test_weights() {
        assert_eq!(compute_weight(100, 4, 2), 50);
        assert_eq!(compute_weight(10, 3, 2), 7);
        let qs = flat(2, &[1, 2]).with_inner_sets(vec![flat(1, &[3, 4])]);
        assert_eq!(node_weight(&qs, &node(9)), 0);
        assert!(node_weight(&qs, &node(1)) > node_weight(&qs, &node(3)));
    }

    #[test]
    fn test_hash_changes_with_threshold() {
        assert_ne!(
            hash_quorum_set(&flat(1, &[1, 2])),
            hash_quorum_set(&flat(2, &[1, 2]))
        );
    }
}
