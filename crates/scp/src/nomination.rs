//! Nomination protocol.
//!
//! Nomination narrows the values proposed by round leaders down to a set of
//! confirmed candidates. Each node votes for values (its own if it leads the
//! round, otherwise the best value of a leader), accepts a value once a
//! v-blocking set accepted it or a quorum voted or accepted it, and confirms
//! it as a candidate once a quorum accepted it. Candidates are combined by
//! the driver into the composite value the ballot protocol starts from.
//!
//! Leaders are chosen per round by hashing node ids weighted by their share
//! of the local quorum set. The leader set only grows within a slot.

use std::collections::{BTreeSet, HashMap, HashSet};

use lumen_common::NodeId;
use tracing::{debug, trace};

use crate::driver::{ScpDriver, TimerKind, ValidationLevel};
use crate::observer::SlotEvent;
use crate::quorum::{
    all_nodes, hash_quorum_set, is_quorum, is_v_blocking, node_weight, normalize_without,
};
use crate::types::{Envelope, Nomination, Pledges, QuorumSet, Statement, Value};
use crate::{EnvelopeState, SlotContext};

#[derive(Debug, Default)]
pub(crate) struct NominationProtocol {
    round: u32,
    votes: BTreeSet<Value>,
    accepted: BTreeSet<Value>,
    candidates: BTreeSet<Value>,
    started: bool,
    stopped: bool,
    latest_composite: Option<Value>,
    previous_value: Option<Value>,
    timer_exp_count: u32,
    latest_nominations: HashMap<NodeId, Envelope>,
    round_leaders: HashSet<NodeId>,
    last_envelope: Option<Envelope>,
    fully_validated: bool,
}

impl NominationProtocol {
    pub fn new(fully_validated: bool) -> Self {
        Self {
            fully_validated,
            ..Self::default()
        }
    }

    pub fn round(&self) -> u32 {
        self.round
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn candidates(&self) -> &BTreeSet<Value> {
        &self.candidates
    }

    pub fn latest_composite(&self) -> Option<&Value> {
        self.latest_composite.as_ref()
    }

    pub fn round_leaders(&self) -> &HashSet<NodeId> {
        &self.round_leaders
    }

    pub fn timer_exp_count(&self) -> u32 {
        self.timer_exp_count
    }

    pub fn last_envelope(&self) -> Option<&Envelope> {
        self.last_envelope.as_ref()
    }

    pub fn latest_nominations(&self) -> &HashMap<NodeId, Envelope> {
        &self.latest_nominations
    }

    pub fn set_fully_validated(&mut self, fully_validated: bool) {
        self.fully_validated = fully_validated;
    }

    pub fn stop(&mut self) {
        self.stopped = true;
        self.started = false;
    }

    /// Start or continue nominating `value` for a new round.
    ///
    /// Returns true when the local vote set changed.
    pub fn nominate<D: ScpDriver>(
        &mut self,
        ctx: &mut SlotContext<'_, D>,
        value: Value,
        prev_value: &Value,
        timedout: bool,
    ) -> bool {
        if self.stopped || !self.candidates.is_empty() {
            return false;
        }
        if timedout {
            self.timer_exp_count = self.timer_exp_count.saturating_add(1);
            if !self.started {
                return false;
            }
        }

        self.started = true;
        self.previous_value = Some(prev_value.clone());
        self.round = self.round.saturating_add(1);
        ctx.events.push(SlotEvent::NominationRound { round: self.round });

        self.update_round_leaders(ctx, prev_value);
        debug!(
            slot = ctx.slot_index,
            round = self.round,
            leaders = self.round_leaders.len(),
            "nomination round"
        );

        let mut updated = self.adopt_leader_values(ctx);
        updated = self.vote_as_leader(ctx, value) || updated;
        if updated {
            self.emit_nomination(ctx);
        }
        updated
    }

    fn adopt_leader_values<D: ScpDriver>(&mut self, ctx: &mut SlotContext<'_, D>) -> bool {
        let mut updated = false;
        let leaders: Vec<NodeId> = self.round_leaders.iter().copied().collect();
        for leader in leaders {
            let Some(nomination) = self.nomination_of(&leader).cloned() else {
                continue;
            };
            if let Some(value) = self.get_new_value_from_nomination(&nomination, ctx) {
                if self.votes.insert(value.clone()) {
                    ctx.driver.nominating_value(ctx.slot_index, &value);
                    updated = true;
                }
            }
        }
        updated
    }

    fn vote_as_leader<D: ScpDriver>(&mut self, ctx: &mut SlotContext<'_, D>, value: Value) -> bool {
        if !self.round_leaders.contains(ctx.local_node_id) || !self.votes.is_empty() {
            return false;
        }
        if ctx.driver.validate_value(ctx.slot_index, &value, true) == ValidationLevel::Invalid {
            return false;
        }
        ctx.driver.nominating_value(ctx.slot_index, &value);
        self.votes.insert(value)
    }

    pub fn process_envelope<D: ScpDriver>(
        &mut self,
        envelope: &Envelope,
        ctx: &mut SlotContext<'_, D>,
    ) -> EnvelopeState {
        let Pledges::Nominate(nomination) = &envelope.statement.pledges else {
            return EnvelopeState::Invalid;
        };
        let node_id = envelope.statement.node_id;
        if !self.is_newer_nomination_from(&node_id, nomination) {
            trace!(slot = ctx.slot_index, node = %node_id, "stale nomination");
            return EnvelopeState::Invalid;
        }
        if !is_sane_nomination(nomination) {
            return EnvelopeState::Invalid;
        }

        self.latest_nominations.insert(node_id, envelope.clone());
        if !self.started {
            return EnvelopeState::Valid;
        }

        let (mut modified, new_candidates) = self.attempt_promote(&nomination.votes, ctx);

        // A leader's new values are only taken while candidates are missing.
        if self.candidates.is_empty() && self.round_leaders.contains(&node_id) {
            if let Some(value) = self.get_new_value_from_nomination(nomination, ctx) {
                if self.votes.insert(value.clone()) {
                    ctx.driver.nominating_value(ctx.slot_index, &value);
                    modified = true;
                }
            }
        }

        if modified {
            self.emit_nomination(ctx);
        }
        if new_candidates {
            self.update_composite(ctx);
        }

        if modified || new_candidates {
            EnvelopeState::ValidNew
        } else {
            EnvelopeState::Valid
        }
    }

    /// Promote votes to accepted and accepted values to candidates.
    ///
    /// Returns `(votes_or_accepted_changed, new_candidates)`.
    fn attempt_promote<D: ScpDriver>(
        &mut self,
        votes_to_check: &[Value],
        ctx: &mut SlotContext<'_, D>,
    ) -> (bool, bool) {
        let mut modified = false;
        let mut new_candidates = false;

        for value in votes_to_check {
            if self.accepted.contains(value) || !self.federated_accept_value(value, ctx) {
                continue;
            }
            match ctx.driver.validate_value(ctx.slot_index, value, true) {
                ValidationLevel::FullyValidated => {
                    self.accepted.insert(value.clone());
                    self.votes.insert(value.clone());
                    modified = true;
                }
                ValidationLevel::MaybeValid => {
                    if let Some(extracted) = ctx.driver.extract_valid_value(ctx.slot_index, value) {
                        modified = self.votes.insert(extracted) || modified;
                    }
                }
                ValidationLevel::Invalid => {}
            }
        }

        let accepted: Vec<Value> = self.accepted.iter().cloned().collect();
        for value in accepted {
            if self.candidates.contains(&value) {
                continue;
            }
            if self.federated_ratify_value(&value, ctx) {
                self.candidates.insert(value);
                new_candidates = true;
                ctx.driver.stop_timer(ctx.slot_index, TimerKind::Nomination);
            }
        }

        (modified, new_candidates)
    }

    /// Record the local nomination, process it as if received, then send it
    /// if it is still the newest local statement.
    fn emit_nomination<D: ScpDriver>(&mut self, ctx: &mut SlotContext<'_, D>) {
        let nomination = Nomination {
            quorum_set_hash: hash_quorum_set(ctx.local_quorum_set),
            votes: self.votes.iter().cloned().collect(),
            accepted: self.accepted.iter().cloned().collect(),
        };
        let envelope = Envelope::new(Statement {
            node_id: *ctx.local_node_id,
            slot_index: ctx.slot_index,
            pledges: Pledges::Nominate(nomination.clone()),
        });

        if self.process_envelope(&envelope, ctx) == EnvelopeState::Invalid {
            return;
        }

        let newer = match self.last_envelope.as_ref().map(|e| &e.statement.pledges) {
            Some(Pledges::Nominate(last)) => is_newer_nomination(last, &nomination),
            _ => true,
        };
        if newer {
            self.last_envelope = Some(envelope.clone());
            if self.fully_validated {
                ctx.driver.emit_envelope(&envelope);
            }
        }
    }

    fn update_composite<D: ScpDriver>(&mut self, ctx: &mut SlotContext<'_, D>) {
        if self.candidates.is_empty() {
            return;
        }
        let Some(composite) = ctx.driver.combine_candidates(ctx.slot_index, &self.candidates)
        else {
            return;
        };
        if self.latest_composite.as_ref() != Some(&composite) {
            ctx.events.push(SlotEvent::CandidateUpdated {
                value: composite.clone(),
            });
            self.latest_composite = Some(composite);
        }
    }

    fn nomination_of(&self, node_id: &NodeId) -> Option<&Nomination> {
        match &self.latest_nominations.get(node_id)?.statement.pledges {
            Pledges::Nominate(n) => Some(n),
            _ => None,
        }
    }

    fn is_newer_nomination_from(&self, node_id: &NodeId, nomination: &Nomination) -> bool {
        match self.nomination_of(node_id) {
            None => true,
            Some(old) => is_newer_nomination(old, nomination),
        }
    }

    fn quorum_sets<D: ScpDriver>(&self, ctx: &SlotContext<'_, D>) -> HashMap<NodeId, QuorumSet> {
        let mut map: HashMap<NodeId, QuorumSet> = self
            .latest_nominations
            .iter()
            .filter_map(|(node, env)| ctx.statement_quorum_set(&env.statement).map(|q| (*node, q)))
            .collect();
        map.entry(*ctx.local_node_id)
            .or_insert_with(|| ctx.local_quorum_set.clone());
        map
    }

    fn nodes_with(&self, value: &Value, pick: fn(&Nomination) -> &[Value]) -> HashSet<NodeId> {
        self.latest_nominations
            .iter()
            .filter(|(_, env)| match &env.statement.pledges {
                Pledges::Nominate(n) => pick(n).contains(value),
                _ => false,
            })
            .map(|(node, _)| *node)
            .collect()
    }

    fn federated_accept_value<D: ScpDriver>(&self, value: &Value, ctx: &SlotContext<'_, D>) -> bool {
        let acceptors = self.nodes_with(value, |n| &n.accepted);
        if is_v_blocking(ctx.local_quorum_set, &acceptors) {
            return true;
        }
        let mut supporters = self.nodes_with(value, |n| &n.votes);
        supporters.extend(acceptors);
        let qsets = self.quorum_sets(ctx);
        is_quorum(ctx.local_quorum_set, &supporters, |n| qsets.get(n))
    }

    fn federated_ratify_value<D: ScpDriver>(&self, value: &Value, ctx: &SlotContext<'_, D>) -> bool {
        let acceptors = self.nodes_with(value, |n| &n.accepted);
        let qsets = self.quorum_sets(ctx);
        is_quorum(ctx.local_quorum_set, &acceptors, |n| qsets.get(n))
    }

    /// Best value of a leader's nomination that we do not vote for yet.
    ///
    /// Accepted values are preferred; votes are only considered when none of
    /// the accepted values is valid.
    fn get_new_value_from_nomination<D: ScpDriver>(
        &self,
        nomination: &Nomination,
        ctx: &SlotContext<'_, D>,
    ) -> Option<Value> {
        let mut best: Option<(u64, Value)> = None;
        let mut found_valid = false;

        let consider = |value: &Value, found_valid: &mut bool, best: &mut Option<(u64, Value)>| {
            let candidate = match ctx.driver.validate_value(ctx.slot_index, value, true) {
                ValidationLevel::FullyValidated => Some(value.clone()),
                ValidationLevel::MaybeValid => ctx.driver.extract_valid_value(ctx.slot_index, value),
                ValidationLevel::Invalid => None,
            };
            let Some(candidate) = candidate else {
                return;
            };
            *found_valid = true;
            if self.votes.contains(&candidate) {
                return;
            }
            let prev = self.previous_value.as_ref().unwrap_or(&candidate);
            let hash = ctx
                .driver
                .compute_value_hash(ctx.slot_index, prev, self.round, &candidate);
            if best.as_ref().map(|(h, _)| hash >= *h).unwrap_or(true) {
                *best = Some((hash, candidate));
            }
        };

        for value in &nomination.accepted {
            consider(value, &mut found_valid, &mut best);
        }
        if !found_valid {
            for value in &nomination.votes {
                consider(value, &mut found_valid, &mut best);
            }
        }
        best.map(|(_, value)| value)
    }

    /// Add the highest-priority nodes of this round to the leader set.
    fn update_round_leaders<D: ScpDriver>(&mut self, ctx: &SlotContext<'_, D>, prev_value: &Value) {
        let normalized = normalize_without(ctx.local_quorum_set, Some(ctx.local_node_id));

        let mut top_priority = self.node_priority(ctx, &normalized, prev_value, ctx.local_node_id);
        let mut new_leaders = vec![*ctx.local_node_id];
        for node in all_nodes(&normalized) {
            let priority = self.node_priority(ctx, &normalized, prev_value, &node);
            if priority > top_priority {
                top_priority = priority;
                new_leaders.clear();
            }
            if priority == top_priority && priority > 0 {
                new_leaders.push(node);
            }
        }
        if top_priority == 0 {
            new_leaders.clear();
        }
        self.round_leaders.extend(new_leaders);
    }

    fn node_priority<D: ScpDriver>(
        &self,
        ctx: &SlotContext<'_, D>,
        normalized: &QuorumSet,
        prev_value: &Value,
        node: &NodeId,
    ) -> u64 {
        let weight = if node == ctx.local_node_id {
            u64::MAX
        } else {
            node_weight(normalized, node)
        };
        if weight == 0 {
            return 0;
        }
        let neighborhood = ctx
            .driver
            .compute_hash_node(ctx.slot_index, prev_value, false, self.round, node);
        if neighborhood <= weight {
            ctx.driver
                .compute_hash_node(ctx.slot_index, prev_value, true, self.round, node)
        } else {
            0
        }
    }
}

/// A nomination is newer when neither set shrank and at least one grew.
pub fn is_newer_nomination(old: &Nomination, new: &Nomination) -> bool {
    let subset = |a: &[Value], b: &[Value]| a.iter().all(|v| b.contains(v));
    if !subset(&old.votes, &new.votes) || !subset(&old.accepted, &new.accepted) {
        return false;
    }
    new.votes.len() > old.votes.len() || new.accepted.len() > old.accepted.len()
}

/// Non-empty, with both lists strictly increasing.
fn is_sane_nomination(nomination: &Nomination) -> bool {
    let strictly_sorted = |values: &[Value]| values.windows(2).all(|w| w[0] < w[1]);
    (!nomination.votes.is_empty() || !nomination.accepted.is_empty())
        && strictly_sorted(&nomination.votes)
        && strictly_sorted(&nomination.accepted)
}
