//! The boundary between SCP and the application that embeds it.
//!
//! SCP decides *when* things happen; the driver decides what values mean.
//! The driver validates and combines values, resolves quorum sets by hash,
//! transmits envelopes, arms timers and learns about externalized values.
//!
//! The driver is handed to every [`crate::Scp`] call as `&mut D` rather than
//! stored, so an embedding coordinator can lend out a view of its own state
//! for the duration of one call.

use std::collections::BTreeSet;
use std::time::Duration;

use lumen_common::{Hash256, NodeId};

use crate::types::{Ballot, Envelope, QuorumSet, Value};

/// Upper bound, in seconds, of a single nomination or ballot round timeout.
pub const MAX_TIMEOUT_SECONDS: u64 = 30 * 60;

/// Outcome of validating a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValidationLevel {
    /// The value can never be valid.
    Invalid,
    /// The value could not be fully checked, for example because the node
    /// is not in sync. The node may still vote on it but will not emit
    /// statements for the slot.
    MaybeValid,
    /// The value passed every check.
    FullyValidated,
}

/// The two per-slot timers SCP asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Nomination,
    Ballot,
}

pub trait ScpDriver {
    /// Validate a value seen in a statement or proposed for nomination.
    fn validate_value(&self, slot_index: u64, value: &Value, nomination: bool) -> ValidationLevel;

    /// Validate the working ballot of a ballot statement from `node_id`.
    /// Runs before the ballot's values are validated.
    fn validate_ballot(&self, _slot_index: u64, _node_id: &NodeId, _ballot: &Ballot) -> bool {
        true
    }

    /// Salvage a valid value out of a `MaybeValid` one, if possible.
    fn extract_valid_value(&self, _slot_index: u64, _value: &Value) -> Option<Value> {
        None
    }

    /// Merge confirmed nomination candidates into a single composite value.
    fn combine_candidates(&mut self, slot_index: u64, candidates: &BTreeSet<Value>)
        -> Option<Value>;

    /// Resolve a quorum set from its hash.
    fn get_quorum_set(&self, hash: &Hash256) -> Option<QuorumSet>;

    /// Send a locally produced envelope to peers.
    fn emit_envelope(&mut self, envelope: &Envelope);

    /// A slot reached its final value.
    fn value_externalized(&mut self, slot_index: u64, value: &Value);

    /// The local node started voting for `value` during nomination.
    fn nominating_value(&mut self, _slot_index: u64, _value: &Value) {}

    fn setup_timer(&mut self, slot_index: u64, kind: TimerKind, timeout: Duration);

    fn stop_timer(&mut self, slot_index: u64, kind: TimerKind);

    /// Hash used for leader election. `is_priority` selects between the
    /// neighborhood hash and the priority hash.
    fn compute_hash_node(
        &self,
        slot_index: u64,
        prev_value: &Value,
        is_priority: bool,
        round: u32,
        node_id: &NodeId,
    ) -> u64 {
        let tag: u32 = if is_priority { 2 } else { 1 };
        Hash256::hash_parts(&[
            &slot_index.to_be_bytes(),
            prev_value.as_bytes(),
            &tag.to_be_bytes(),
            &round.to_be_bytes(),
            node_id.as_bytes(),
        ])
        .to_u64()
    }

    /// Hash used to pick the best value out of a leader's nomination.
    fn compute_value_hash(
        &self,
        slot_index: u64,
        prev_value: &Value,
        round: u32,
        value: &Value,
    ) -> u64 {
        let tag: u32 = 3;
        Hash256::hash_parts(&[
            &slot_index.to_be_bytes(),
            prev_value.as_bytes(),
            &tag.to_be_bytes(),
            &round.to_be_bytes(),
            value.as_bytes(),
        ])
        .to_u64()
    }

    /// Linear back-off: one second per round, capped.
    fn compute_timeout(&self, round: u32, _is_nomination: bool) -> Duration {
        Duration::from_secs(u64::from(round).min(MAX_TIMEOUT_SECONDS))
    }
}
