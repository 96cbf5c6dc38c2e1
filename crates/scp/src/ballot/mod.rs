//! The ballot protocol.
//!
//! Once nomination has produced a composite value, nodes try to commit a
//! ballot `(counter, value)` through three phases:
//!
//! - **Prepare**: vote to prepare ballots until one is confirmed prepared
//!   and a commit vote can be cast.
//! - **Confirm**: commit has been accepted; wait for it to be confirmed.
//! - **Externalize**: commit is confirmed and the value is final.
//!
//! The local state follows the usual SCP naming: `b` is the current ballot,
//! `p`/`p'` the two highest incompatible accepted-prepared ballots, `h` the
//! highest confirmed-prepared ballot and `c` the lowest ballot voted to
//! commit.

use std::collections::HashMap;

use lumen_common::NodeId;
use tracing::{debug, trace};

use crate::observer::SlotEvent;
use crate::types::{Ballot, Envelope, Pledges, Statement, Value};
use crate::{EnvelopeState, ScpDriver, SlotContext};

mod envelope;
mod state_machine;
mod statements;

/// Bound on cascaded self-processing steps triggered by one message.
const MAX_PROTOCOL_TRANSITIONS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BallotPhase {
    Prepare,
    Confirm,
    Externalize,
}

/// Snapshot of the local ballot variables, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BallotState {
    pub phase: BallotPhase,
    pub current: Option<Ballot>,
    pub prepared: Option<Ballot>,
    pub prepared_prime: Option<Ballot>,
    pub high: Option<Ballot>,
    pub commit: Option<Ballot>,
    pub heard_from_quorum: bool,
}

#[derive(Debug)]
pub(crate) struct BallotProtocol {
    current_ballot: Option<Ballot>,
    prepared: Option<Ballot>,
    prepared_prime: Option<Ballot>,
    high_ballot: Option<Ballot>,
    commit: Option<Ballot>,
    phase: BallotPhase,

    /// Latest ballot statement from each node, local node included.
    latest_envelopes: HashMap<NodeId, Envelope>,

    /// Value we are bound to once something was confirmed prepared or
    /// accepted committed.
    value_override: Option<Value>,
    composite_candidate: Option<Value>,
    heard_from_quorum: bool,
    message_level: u32,

    last_envelope: Option<Envelope>,
    last_envelope_emit: Option<Envelope>,
    fully_validated: bool,
    externalized_now: bool,
}

impl BallotProtocol {
    pub fn new(fully_validated: bool) -> Self {
        Self {
            current_ballot: None,
            prepared: None,
            prepared_prime: None,
            high_ballot: None,
            commit: None,
            phase: BallotPhase::Prepare,
            latest_envelopes: HashMap::new(),
            value_override: None,
            composite_candidate: None,
            heard_from_quorum: false,
            message_level: 0,
            last_envelope: None,
            last_envelope_emit: None,
            fully_validated,
            externalized_now: false,
        }
    }

    pub fn phase(&self) -> BallotPhase {
        self.phase
    }

    pub fn current_ballot(&self) -> Option<&Ballot> {
        self.current_ballot.as_ref()
    }

    pub fn heard_from_quorum(&self) -> bool {
        self.heard_from_quorum
    }

    pub fn state(&self) -> BallotState {
        BallotState {
            phase: self.phase,
            current: self.current_ballot.clone(),
            prepared: self.prepared.clone(),
            prepared_prime: self.prepared_prime.clone(),
            high: self.high_ballot.clone(),
            commit: self.commit.clone(),
            heard_from_quorum: self.heard_from_quorum,
        }
    }

    pub fn last_envelope(&self) -> Option<&Envelope> {
        self.last_envelope.as_ref()
    }

    pub fn latest_envelopes(&self) -> &HashMap<NodeId, Envelope> {
        &self.latest_envelopes
    }

    pub fn set_fully_validated(&mut self, fully_validated: bool) {
        self.fully_validated = fully_validated;
    }

    pub fn set_composite_candidate(&mut self, value: Option<Value>) {
        self.composite_candidate = value;
    }

    /// Returns true exactly once after the protocol reached Externalize.
    pub fn take_externalized(&mut self) -> bool {
        std::mem::take(&mut self.externalized_now)
    }

    pub fn externalized_value(&self) -> Option<&Value> {
        match (self.phase, &self.commit) {
            (BallotPhase::Externalize, Some(commit)) => Some(&commit.value),
            _ => None,
        }
    }

    /// Start balloting on `value` unless a ballot already exists (or
    /// `force` is set, which bumps the counter).
    pub fn bump<D: ScpDriver>(
        &mut self,
        ctx: &mut SlotContext<'_, D>,
        value: Value,
        force: bool,
    ) -> bool {
        if !force && self.current_ballot.is_some() {
            return false;
        }
        let counter = self
            .current_ballot
            .as_ref()
            .map(|b| b.counter.saturating_add(1))
            .unwrap_or(1);
        self.bump_state(ctx, value, counter)
    }

    /// The ballot timer fired: move to the next counter.
    pub fn bump_timeout<D: ScpDriver>(&mut self, ctx: &mut SlotContext<'_, D>) -> bool {
        self.abandon_ballot(0, ctx)
    }

    pub fn process_envelope<D: ScpDriver>(
        &mut self,
        envelope: &Envelope,
        ctx: &mut SlotContext<'_, D>,
    ) -> EnvelopeState {
        let statement = &envelope.statement;
        if statement.is_nomination() {
            return EnvelopeState::Invalid;
        }
        if !self.is_newer_statement(&statement.node_id, statement) {
            trace!(slot = ctx.slot_index, node = %statement.node_id, "stale ballot statement");
            return EnvelopeState::Invalid;
        }

        if self.phase == BallotPhase::Externalize {
            // Only statements agreeing with the externalized value are kept,
            // for rebroadcast and bookkeeping.
            if self.statement_matches_commit(statement) {
                self.latest_envelopes
                    .insert(statement.node_id, envelope.clone());
                return EnvelopeState::Valid;
            }
            return EnvelopeState::Invalid;
        }

        self.latest_envelopes
            .insert(statement.node_id, envelope.clone());
        self.advance_slot(statement, ctx)
    }

    fn statement_matches_commit(&self, statement: &Statement) -> bool {
        let Some(commit) = &self.commit else {
            return false;
        };
        let value = match &statement.pledges {
            Pledges::Prepare(p) => &p.ballot.value,
            Pledges::Confirm(c) => &c.ballot.value,
            Pledges::Externalize(e) => &e.commit.value,
            Pledges::Nominate(_) => return false,
        };
        commit.value == *value
    }

    /// Jump straight to Externalize with `value`, used when the value is
    /// already known from history.
    pub fn force_externalize(&mut self, value: Value) {
        let ballot = Ballot::new(u32::MAX, value);
        self.commit = Some(ballot.clone());
        self.high_ballot = Some(ballot.clone());
        self.prepared = Some(ballot.clone());
        self.current_ballot = Some(ballot);
        self.phase = BallotPhase::Externalize;
    }

    pub(crate) fn bump_state<D: ScpDriver>(
        &mut self,
        ctx: &mut SlotContext<'_, D>,
        value: Value,
        counter: u32,
    ) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }
        let value = self.value_override.clone().unwrap_or(value);
        let ballot = Ballot::new(counter, value);
        let first = self.current_ballot.is_none();

        let updated = self.update_current_value(&ballot);
        if updated {
            debug!(slot = ctx.slot_index, counter, "ballot bumped");
            ctx.events.push(if first {
                SlotEvent::BallotStarted {
                    ballot: ballot.clone(),
                }
            } else {
                SlotEvent::BallotBumped { ballot }
            });
            self.emit_current_state(ctx);
            self.check_heard_from_quorum(ctx);
        }
        updated
    }
}
