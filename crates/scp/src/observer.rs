//! Instrumentation hooks.
//!
//! Slots record a [`SlotEvent`] for every notable transition while they
//! process a message. [`crate::Scp`] hands the recorded events to every
//! registered [`SlotObserver`] once processing has finished, so observers
//! see transitions after the fact and cannot influence them.

use crate::types::{Ballot, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotEvent {
    /// A nomination round started.
    NominationRound { round: u32 },
    /// The composite candidate changed.
    CandidateUpdated { value: Value },
    /// The ballot protocol started with its first ballot.
    BallotStarted { ballot: Ballot },
    /// The local ballot counter moved up.
    BallotBumped { ballot: Ballot },
    AcceptedPrepared { ballot: Ballot },
    ConfirmedPrepared { ballot: Ballot },
    AcceptedCommit { ballot: Ballot },
    HeardFromQuorum { ballot: Ballot },
    Externalized { value: Value },
}

impl SlotEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SlotEvent::NominationRound { .. } => "nomination_round",
            SlotEvent::CandidateUpdated { .. } => "candidate_updated",
            SlotEvent::BallotStarted { .. } => "ballot_started",
            SlotEvent::BallotBumped { .. } => "ballot_bumped",
            SlotEvent::AcceptedPrepared { .. } => "accepted_prepared",
            SlotEvent::ConfirmedPrepared { .. } => "confirmed_prepared",
            SlotEvent::AcceptedCommit { .. } => "accepted_commit",
            SlotEvent::HeardFromQuorum { .. } => "heard_from_quorum",
            SlotEvent::Externalized { .. } => "externalized",
        }
    }
}

pub trait SlotObserver: Send + Sync {
    fn on_slot_event(&self, slot_index: u64, event: &SlotEvent);
}
