//! One agreement instance.
//!
//! A [`Slot`] owns the nomination and ballot protocols for a single slot
//! index and routes statements between them. The phase it reports is a
//! tagged [`SlotPhase`]; the slot moves forward through it and never back.

use std::collections::HashSet;

use lumen_common::NodeId;
use tracing::debug;

use crate::ballot::{BallotPhase, BallotProtocol, BallotState};
use crate::driver::{ScpDriver, TimerKind, ValidationLevel};
use crate::nomination::NominationProtocol;
use crate::quorum::is_v_blocking;
use crate::types::{Ballot, Envelope, Pledges, Value};
use crate::{EnvelopeState, SlotContext};

/// Where a slot is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotPhase {
    /// No ballot yet; nomination may or may not have started.
    Nominating,
    /// The ballot protocol is running.
    Balloting(BallotPhase),
    /// A value is final for this slot.
    Externalized,
}

#[derive(Debug)]
pub(crate) struct Slot {
    slot_index: u64,
    is_validator: bool,
    nomination: NominationProtocol,
    ballot: BallotProtocol,
    fully_validated: bool,
    got_v_blocking: bool,
    externalized_value: Option<Value>,
    statement_count: usize,
}

impl Slot {
    pub fn new(slot_index: u64, is_validator: bool) -> Self {
        Self {
            slot_index,
            is_validator,
            nomination: NominationProtocol::new(is_validator),
            ballot: BallotProtocol::new(is_validator),
            fully_validated: is_validator,
            got_v_blocking: false,
            externalized_value: None,
            statement_count: 0,
        }
    }

    pub fn phase(&self) -> SlotPhase {
        if self.externalized_value.is_some() {
            return SlotPhase::Externalized;
        }
        match self.ballot.current_ballot() {
            None => SlotPhase::Nominating,
            Some(_) => SlotPhase::Balloting(self.ballot.phase()),
        }
    }

    pub fn externalized_value(&self) -> Option<&Value> {
        self.externalized_value.as_ref()
    }

    pub fn is_fully_validated(&self) -> bool {
        self.fully_validated
    }

    pub fn got_v_blocking(&self) -> bool {
        self.got_v_blocking
    }

    pub fn heard_from_quorum(&self) -> bool {
        self.ballot.heard_from_quorum()
    }

    pub fn current_ballot(&self) -> Option<&Ballot> {
        self.ballot.current_ballot()
    }

    pub fn ballot_state(&self) -> BallotState {
        self.ballot.state()
    }

    pub fn nomination_timeouts(&self) -> u32 {
        self.nomination.timer_exp_count()
    }

    pub fn nomination_round(&self) -> u32 {
        self.nomination.round()
    }

    pub fn nomination_leaders(&self) -> &HashSet<NodeId> {
        self.nomination.round_leaders()
    }

    pub fn latest_composite(&self) -> Option<&Value> {
        self.nomination.latest_composite()
    }

    pub fn statement_count(&self) -> usize {
        self.statement_count
    }

    /// Latest statement from `node_id`, ballot statements first.
    pub fn latest_envelope(&self, node_id: &NodeId) -> Option<&Envelope> {
        self.ballot
            .latest_envelopes()
            .get(node_id)
            .or_else(|| self.nomination.latest_nominations().get(node_id))
    }

    /// The local messages worth re-sending for this slot.
    pub fn latest_messages_send(&self) -> Vec<Envelope> {
        if !self.fully_validated {
            return Vec::new();
        }
        self.nomination
            .last_envelope()
            .into_iter()
            .chain(self.ballot.last_envelope())
            .cloned()
            .collect()
    }

    /// Ballot statements that agree with the externalized value.
    pub fn externalizing_state(&self) -> Vec<Envelope> {
        let Some(value) = &self.externalized_value else {
            return Vec::new();
        };
        let mut envelopes: Vec<Envelope> = self
            .ballot
            .latest_envelopes()
            .values()
            .filter(|env| env.statement.values().contains(value))
            .cloned()
            .collect();
        envelopes.sort_by_key(|env| env.statement.node_id);
        envelopes
    }

    pub fn process_envelope<D: ScpDriver>(
        &mut self,
        envelope: &Envelope,
        ctx: &mut SlotContext<'_, D>,
    ) -> EnvelopeState {
        if envelope.slot_index() != self.slot_index {
            return EnvelopeState::Invalid;
        }
        let node_id = envelope.statement.node_id;
        let heard_before = self.latest_envelope(&node_id).is_some();

        let state = match &envelope.statement.pledges {
            Pledges::Nominate(_) => self.process_nomination(envelope, ctx),
            _ => self.process_ballot(envelope, ctx),
        };

        if state.is_valid() {
            self.statement_count += 1;
            if !heard_before {
                self.update_got_v_blocking(ctx);
            }
        }

        self.check_nomination_to_ballot(ctx);
        self.check_externalized(ctx);
        state
    }

    fn process_nomination<D: ScpDriver>(
        &mut self,
        envelope: &Envelope,
        ctx: &mut SlotContext<'_, D>,
    ) -> EnvelopeState {
        if ctx.statement_quorum_set(&envelope.statement).is_none() {
            debug!(slot = self.slot_index, "nomination cites unknown quorum set");
            return EnvelopeState::Invalid;
        }
        self.nomination.process_envelope(envelope, ctx)
    }

    fn process_ballot<D: ScpDriver>(
        &mut self,
        envelope: &Envelope,
        ctx: &mut SlotContext<'_, D>,
    ) -> EnvelopeState {
        let statement = &envelope.statement;
        if !self.ballot.is_statement_sane(statement, ctx) {
            debug!(
                slot = self.slot_index,
                node = %statement.node_id,
                kind = statement.kind(),
                "insane ballot statement"
            );
            return EnvelopeState::Invalid;
        }

        match self.ballot.validate_statement_values(statement, ctx) {
            ValidationLevel::Invalid => {
                debug!(slot = self.slot_index, node = %statement.node_id, "invalid ballot value");
                return EnvelopeState::Invalid;
            }
            ValidationLevel::MaybeValid => self.set_fully_validated(false),
            ValidationLevel::FullyValidated => {}
        }

        self.sync_composite_candidate();
        self.ballot.process_envelope(envelope, ctx)
    }

    pub fn nominate<D: ScpDriver>(
        &mut self,
        ctx: &mut SlotContext<'_, D>,
        value: Value,
        prev_value: &Value,
        timedout: bool,
    ) -> bool {
        if !self.is_validator || self.externalized_value.is_some() {
            return false;
        }

        let updated = self.nomination.nominate(ctx, value, prev_value, timedout);

        // The timer is re-armed whenever the round ran, updated or not.
        if self.nomination.is_started()
            && !self.nomination.is_stopped()
            && self.nomination.candidates().is_empty()
        {
            let timeout = ctx.driver.compute_timeout(self.nomination.round(), true);
            ctx.driver
                .setup_timer(self.slot_index, TimerKind::Nomination, timeout);
        }

        self.check_nomination_to_ballot(ctx);
        self.check_externalized(ctx);
        updated
    }

    pub fn stop_nomination<D: ScpDriver>(&mut self, ctx: &mut SlotContext<'_, D>) {
        self.nomination.stop();
        ctx.driver.stop_timer(self.slot_index, TimerKind::Nomination);
    }

    /// The ballot timer fired: abandon the current ballot for the next
    /// counter.
    pub fn bump_ballot_on_timeout<D: ScpDriver>(&mut self, ctx: &mut SlotContext<'_, D>) -> bool {
        if !self.is_validator || self.externalized_value.is_some() {
            return false;
        }
        self.sync_composite_candidate();
        let bumped = self.ballot.bump_timeout(ctx);
        self.check_externalized(ctx);
        bumped
    }

    /// Mark the slot externalized with a value learned out of band.
    pub fn force_externalize(&mut self, value: Value) {
        self.nomination.stop();
        self.ballot.force_externalize(value.clone());
        self.externalized_value = Some(value);
        self.set_fully_validated(true);
    }

    fn set_fully_validated(&mut self, fully_validated: bool) {
        self.fully_validated = fully_validated;
        self.nomination.set_fully_validated(fully_validated);
        self.ballot.set_fully_validated(fully_validated);
    }

    fn sync_composite_candidate(&mut self) {
        self.ballot
            .set_composite_candidate(self.nomination.latest_composite().cloned());
    }

    /// Nomination produced a composite but balloting has not started yet.
    fn check_nomination_to_ballot<D: ScpDriver>(&mut self, ctx: &mut SlotContext<'_, D>) {
        if self.ballot.current_ballot().is_some() || self.externalized_value.is_some() {
            return;
        }
        let Some(composite) = self.nomination.latest_composite().cloned() else {
            return;
        };
        ctx.driver.stop_timer(self.slot_index, TimerKind::Nomination);
        self.sync_composite_candidate();
        self.ballot.bump(ctx, composite, false);
    }

    fn check_externalized<D: ScpDriver>(&mut self, ctx: &mut SlotContext<'_, D>) {
        if self.ballot.take_externalized() {
            self.nomination.stop();
        }
        if self.externalized_value.is_some() {
            return;
        }
        let Some(value) = self.ballot.externalized_value().cloned() else {
            return;
        };
        self.externalized_value = Some(value);
        self.set_fully_validated(true);
        ctx.driver.stop_timer(self.slot_index, TimerKind::Nomination);
        ctx.driver.stop_timer(self.slot_index, TimerKind::Ballot);
    }

    fn update_got_v_blocking<D: ScpDriver>(&mut self, ctx: &SlotContext<'_, D>) {
        if self.got_v_blocking {
            return;
        }
        let heard: HashSet<NodeId> = self
            .ballot
            .latest_envelopes()
            .keys()
            .chain(self.nomination.latest_nominations().keys())
            .copied()
            .collect();
        self.got_v_blocking = is_v_blocking(ctx.local_quorum_set, &heard);
    }
}
