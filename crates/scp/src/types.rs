//! Protocol messages exchanged by SCP nodes.
//!
//! Every message is an [`Envelope`] wrapping a [`Statement`]: the sending
//! node, the slot it talks about and one of four pledge kinds. Statements
//! never carry quorum sets inline; they cite them by hash and the receiver
//! resolves the hash through its driver.

use std::fmt;

use lumen_common::{Hash256, NodeId};
use serde::{Deserialize, Serialize};

/// An opaque value under agreement.
///
/// SCP never looks inside a value; it only compares, hashes and forwards
/// them. Ordering is bytewise.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Value(pub Vec<u8>);

impl Value {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn hash(&self) -> Hash256 {
        Hash256::hash(&self.0)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Value({})", self.hash().short())
    }
}

/// A `(counter, value)` pair contending for externalization.
///
/// The derived ordering compares `counter` first and then the value bytes,
/// which gives the total order the ballot protocol relies on.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ballot {
    pub counter: u32,
    pub value: Value,
}

impl Ballot {
    pub fn new(counter: u32, value: Value) -> Self {
        Self { counter, value }
    }

    /// Two ballots are compatible when they carry the same value.
    pub fn is_compatible(&self, other: &Ballot) -> bool {
        self.value == other.value
    }

    /// `self <= other` and both carry the same value.
    pub fn less_and_compatible(&self, other: &Ballot) -> bool {
        self <= other && self.is_compatible(other)
    }

    /// `self <= other` and the values differ.
    pub fn less_and_incompatible(&self, other: &Ballot) -> bool {
        self <= other && !self.is_compatible(other)
    }
}

impl fmt::Debug for Ballot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.counter, self.value.hash().short())
    }
}

/// A node's trust configuration: `threshold` of the listed validators and
/// inner sets must agree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuorumSet {
    pub threshold: u32,
    #[serde(default)]
    pub validators: Vec<NodeId>,
    #[serde(default)]
    pub inner_sets: Vec<QuorumSet>,
}

impl QuorumSet {
    pub fn new(threshold: u32, validators: Vec<NodeId>) -> Self {
        Self {
            threshold,
            validators,
            inner_sets: Vec::new(),
        }
    }

    /// The quorum set `{1, [node]}` used for nodes that have externalized.
    pub fn singleton(node: NodeId) -> Self {
        Self::new(1, vec![node])
    }

    pub fn with_inner_sets(mut self, inner_sets: Vec<QuorumSet>) -> Self {
        self.inner_sets = inner_sets;
        self
    }

    /// Number of top-level entries (validators plus inner sets).
    pub fn entry_count(&self) -> usize {
        self.validators.len() + self.inner_sets.len()
    }
}

/// Nomination pledge: values a node votes for and values it accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Nomination {
    pub quorum_set_hash: Hash256,
    pub votes: Vec<Value>,
    pub accepted: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PrepareStatement {
    pub quorum_set_hash: Hash256,
    pub ballot: Ballot,
    pub prepared: Option<Ballot>,
    pub prepared_prime: Option<Ballot>,
    pub n_c: u32,
    pub n_h: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfirmStatement {
    pub ballot: Ballot,
    pub n_prepared: u32,
    pub n_commit: u32,
    pub n_h: u32,
    pub quorum_set_hash: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExternalizeStatement {
    pub commit: Ballot,
    pub n_h: u32,
    pub commit_quorum_set_hash: Hash256,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pledges {
    Nominate(Nomination),
    Prepare(PrepareStatement),
    Confirm(ConfirmStatement),
    Externalize(ExternalizeStatement),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Statement {
    pub node_id: NodeId,
    pub slot_index: u64,
    pub pledges: Pledges,
}

impl Statement {
    /// The quorum set hash the statement cites.
    pub fn quorum_set_hash(&self) -> Hash256 {
        match &self.pledges {
            Pledges::Nominate(n) => n.quorum_set_hash,
            Pledges::Prepare(p) => p.quorum_set_hash,
            Pledges::Confirm(c) => c.quorum_set_hash,
            Pledges::Externalize(e) => e.commit_quorum_set_hash,
        }
    }

    /// Every value the statement mentions.
    pub fn values(&self) -> Vec<Value> {
        let mut values = Vec::new();
        match &self.pledges {
            Pledges::Nominate(n) => {
                values.extend(n.votes.iter().cloned());
                values.extend(n.accepted.iter().cloned());
            }
            Pledges::Prepare(p) => {
                values.push(p.ballot.value.clone());
                if let Some(b) = &p.prepared {
                    values.push(b.value.clone());
                }
                if let Some(b) = &p.prepared_prime {
                    values.push(b.value.clone());
                }
            }
            Pledges::Confirm(c) => values.push(c.ballot.value.clone()),
            Pledges::Externalize(e) => values.push(e.commit.value.clone()),
        }
        values.sort();
        values.dedup();
        values
    }

    /// The ballot a ballot-protocol statement is currently working on.
    pub fn working_ballot(&self) -> Option<&Ballot> {
        match &self.pledges {
            Pledges::Nominate(_) => None,
            Pledges::Prepare(p) => Some(&p.ballot),
            Pledges::Confirm(c) => Some(&c.ballot),
            Pledges::Externalize(e) => Some(&e.commit),
        }
    }

    pub fn is_nomination(&self) -> bool {
        matches!(self.pledges, Pledges::Nominate(_))
    }

    pub fn kind(&self) -> &'static str {
        match self.pledges {
            Pledges::Nominate(_) => "NOMINATE",
            Pledges::Prepare(_) => "PREPARE",
            Pledges::Confirm(_) => "CONFIRM",
            Pledges::Externalize(_) => "EXTERNALIZE",
        }
    }
}

/// A statement as it travels between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Envelope {
    pub statement: Statement,
}

impl Envelope {
    pub fn new(statement: Statement) -> Self {
        Self { statement }
    }

    pub fn slot_index(&self) -> u64 {
        self.statement.slot_index
    }

    pub fn node_id(&self) -> &NodeId {
        &self.statement.node_id
    }

    /// Content hash used for de-duplication.
    pub fn hash(&self) -> Hash256 {
        Hash256::hash_encoded(self).unwrap_or(Hash256::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(b: u8) -> Value {
        Value::new(vec![b])
    }

    #[test]
    fn test_ballot_ordering_counter_first() {
        assert!(Ballot::new(1, v(9)) < Ballot::new(2, v(0)));
        assert!(Ballot::new(2, v(1)) < Ballot::new(2, v(2)));
        assert_eq!(
            Ballot::new(3, v(1)).cmp(&Ballot::new(3, v(1))),
            std::cmp::Ordering::Equal
        );
    }

    #[test]
    fn test_ballot_compatibility_helpers() {
        let low = Ballot::new(1, v(1));
        let high = Ballot::new(2, v(1));
        let other = Ballot::new(3, v(2));
        assert!(low.less_and_compatible(&high));
        assert!(!high.less_and_compatible(&low));
        assert!(low.less_and_incompatible(&other));
        assert!(!other.less_and_incompatible(&low));
    }

    #[test]
    fn test_statement_values_are_sorted_and_unique() {
        let st = Statement {
            node_id: NodeId::from_seed("n"),
            slot_index: 1,
            pledges: Pledges::Prepare(PrepareStatement {
                quorum_set_hash: Hash256::ZERO,
                ballot: Ballot::new(2, v(3)),
                prepared: Some(Ballot::new(1, v(3))),
                prepared_prime: Some(Ballot::new(1, v(1))),
                n_c: 0,
                n_h: 0,
            }),
        };
        assert_eq!(st.values(), vec![v(1), v(3)]);
    }

    #[test]
    fn test_envelope_hash_depends_on_content() {
        let mk = |slot| {
            Envelope::new(Statement {
                node_id: NodeId::from_seed("n"),
                slot_index: slot,
                pledges: Pledges::Nominate(Nomination {
                    quorum_set_hash: Hash256::ZERO,
                    votes: vec![v(1)],
                    accepted: vec![],
                }),
            })
        };
        assert_eq!(mk(1).hash(), mk(1).hash());
        assert_ne!(mk(1).hash(), mk(2).hash());
    }
}
