//! Federated Byzantine agreement for lumen.
//!
//! This crate runs the Stellar Consensus Protocol for a sequence of slots.
//! Each slot goes through two protocols:
//!
//! 1. **Nomination** narrows the proposed values down to confirmed
//!    candidates and combines them into one composite value.
//! 2. **Ballot protocol** commits a `(counter, value)` ballot through the
//!    Prepare, Confirm and Externalize phases.
//!
//! The crate is purely reactive. [`Scp`] is fed envelopes, nomination
//! requests and timer expirations, and reacts through an [`ScpDriver`]
//! passed into every call. It owns no timers, sockets or threads.
//!
//! ```ignore
//! let mut scp = Scp::new(node_id, quorum_set, true)?;
//! scp.nominate(slot, value, &prev_value, &mut driver);
//! let state = scp.receive_envelope(envelope, &mut driver);
//! ```

mod ballot;
mod driver;
mod error;
mod nomination;
mod observer;
mod quorum;
mod scp;
mod slot;
mod types;

use lumen_common::{Hash256, NodeId};

pub use ballot::{BallotPhase, BallotState};
pub use driver::{ScpDriver, TimerKind, ValidationLevel, MAX_TIMEOUT_SECONDS};
pub use error::{Result, ScpError};
pub use nomination::is_newer_nomination;
pub use observer::{SlotEvent, SlotObserver};
pub use quorum::{
    all_nodes, check_quorum_set_sane, hash_quorum_set, is_quorum, is_quorum_set_sane,
    is_quorum_slice, is_v_blocking, normalize_without, MAXIMUM_QUORUM_NESTING_LEVEL,
    MAXIMUM_QUORUM_NODES,
};
pub use scp::Scp;
pub use slot::SlotPhase;
pub use types::{
    Ballot, ConfirmStatement, Envelope, ExternalizeStatement, Nomination, Pledges,
    PrepareStatement, QuorumSet, Statement, Value,
};

/// Result of handing an envelope to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeState {
    /// Rejected: stale, malformed or carrying an invalid value.
    Invalid,
    /// Accepted without changing local state.
    Valid,
    /// Accepted and local state moved forward.
    ValidNew,
}

impl EnvelopeState {
    pub fn is_valid(self) -> bool {
        !matches!(self, EnvelopeState::Invalid)
    }

    pub fn is_new(self) -> bool {
        matches!(self, EnvelopeState::ValidNew)
    }
}

/// Everything a slot borrows from its owner while it processes one input.
pub(crate) struct SlotContext<'a, D> {
    pub local_node_id: &'a NodeId,
    pub local_quorum_set: &'a QuorumSet,
    pub local_quorum_set_hash: Hash256,
    pub slot_index: u64,
    pub driver: &'a mut D,
    pub events: &'a mut Vec<SlotEvent>,
}

impl<D: ScpDriver> SlotContext<'_, D> {
    /// Quorum set a statement should be judged against.
    ///
    /// Externalizing nodes are treated as trusting only themselves, since
    /// their value is final whatever their slices say.
    pub fn statement_quorum_set(&self, statement: &Statement) -> Option<QuorumSet> {
        if let Pledges::Externalize(_) = statement.pledges {
            return Some(QuorumSet::singleton(statement.node_id));
        }
        let hash = statement.quorum_set_hash();
        if hash == self.local_quorum_set_hash {
            return Some(self.local_quorum_set.clone());
        }
        self.driver.get_quorum_set(&hash)
    }
}
