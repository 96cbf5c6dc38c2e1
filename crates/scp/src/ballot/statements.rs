//! Statement predicates and federated voting over ballot statements.

use std::collections::{BTreeSet, HashMap, HashSet};

use lumen_common::NodeId;

use super::{BallotPhase, BallotProtocol};
use crate::driver::{ScpDriver, TimerKind, ValidationLevel};
use crate::observer::SlotEvent;
use crate::quorum::{is_quorum, is_quorum_set_sane, is_v_blocking};
use crate::types::{Ballot, Pledges, QuorumSet, Statement};
use crate::SlotContext;

/// Rank used to order statements of different kinds from one node.
fn pledge_rank(pledges: &Pledges) -> u8 {
    match pledges {
        Pledges::Prepare(_) => 0,
        Pledges::Confirm(_) => 1,
        Pledges::Externalize(_) => 2,
        Pledges::Nominate(_) => 3,
    }
}

/// Whether `new` supersedes `old` for the same node.
pub(crate) fn is_newer_ballot_statement(old: &Statement, new: &Statement) -> bool {
    let (old_rank, new_rank) = (pledge_rank(&old.pledges), pledge_rank(&new.pledges));
    if old_rank != new_rank {
        return old_rank < new_rank;
    }
    match (&old.pledges, &new.pledges) {
        (Pledges::Prepare(o), Pledges::Prepare(n)) => {
            (&o.ballot, &o.prepared, &o.prepared_prime, o.n_h)
                < (&n.ballot, &n.prepared, &n.prepared_prime, n.n_h)
        }
        (Pledges::Confirm(o), Pledges::Confirm(n)) => {
            (&o.ballot, o.n_prepared, o.n_h) < (&n.ballot, n.n_prepared, n.n_h)
        }
        // Externalize is final.
        _ => false,
    }
}

pub(crate) fn statement_ballot_counter(statement: &Statement) -> u32 {
    match &statement.pledges {
        Pledges::Prepare(p) => p.ballot.counter,
        Pledges::Confirm(c) => c.ballot.counter,
        Pledges::Externalize(_) => u32::MAX,
        Pledges::Nominate(_) => 0,
    }
}

impl BallotProtocol {
    pub fn is_newer_statement(&self, node_id: &NodeId, statement: &Statement) -> bool {
        match self.latest_envelopes.get(node_id) {
            None => true,
            Some(existing) => is_newer_ballot_statement(&existing.statement, statement),
        }
    }

    /// Structural checks on a ballot statement, including that its quorum
    /// set is known and sane.
    pub fn is_statement_sane<D: ScpDriver>(
        &self,
        statement: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        let Some(qset) = ctx.statement_quorum_set(statement) else {
            return false;
        };
        if !is_quorum_set_sane(&qset) {
            return false;
        }

        match &statement.pledges {
            Pledges::Prepare(p) => {
                // The local node may emit a zero ballot before it has one.
                let is_self = statement.node_id == *ctx.local_node_id;
                if !is_self && p.ballot.counter == 0 {
                    return false;
                }
                if let (Some(pp), Some(prep)) = (&p.prepared_prime, &p.prepared) {
                    if pp >= prep || pp.is_compatible(prep) {
                        return false;
                    }
                }
                if p.n_h != 0 {
                    match &p.prepared {
                        Some(prep) if p.n_h <= prep.counter => {}
                        _ => return false,
                    }
                }
                if p.n_c != 0 && (p.n_h == 0 || p.ballot.counter < p.n_h || p.n_h < p.n_c) {
                    return false;
                }
                true
            }
            Pledges::Confirm(c) => {
                c.ballot.counter > 0 && c.n_h <= c.ballot.counter && c.n_commit <= c.n_h
            }
            Pledges::Externalize(e) => e.commit.counter > 0 && e.n_h >= e.commit.counter,
            Pledges::Nominate(_) => false,
        }
    }

    /// Lowest validation level over every value in the statement.
    pub fn validate_statement_values<D: ScpDriver>(
        &self,
        statement: &Statement,
        ctx: &SlotContext<'_, D>,
    ) -> ValidationLevel {
        if let Some(ballot) = statement.working_ballot() {
            if !ctx.driver.validate_ballot(ctx.slot_index, &statement.node_id, ballot) {
                return ValidationLevel::Invalid;
            }
        }
        let values = statement.values();
        if values.is_empty() {
            return ValidationLevel::Invalid;
        }
        values
            .iter()
            .map(|v| ctx.driver.validate_value(ctx.slot_index, v, false))
            .min()
            .unwrap_or(ValidationLevel::Invalid)
    }

    /// Ballots worth testing for "accept prepared" given the statement
    /// that triggered the evaluation, in ascending order.
    pub(super) fn get_prepare_candidates(&self, hint: &Statement) -> Vec<Ballot> {
        let mut hint_ballots: BTreeSet<Ballot> = BTreeSet::new();
        match &hint.pledges {
            Pledges::Prepare(p) => {
                hint_ballots.insert(p.ballot.clone());
                hint_ballots.extend(p.prepared.iter().cloned());
                hint_ballots.extend(p.prepared_prime.iter().cloned());
            }
            Pledges::Confirm(c) => {
                hint_ballots.insert(Ballot::new(c.n_prepared, c.ballot.value.clone()));
                hint_ballots.insert(Ballot::new(u32::MAX, c.ballot.value.clone()));
            }
            Pledges::Externalize(e) => {
                hint_ballots.insert(Ballot::new(u32::MAX, e.commit.value.clone()));
            }
            Pledges::Nominate(_) => {}
        }

        let mut candidates = BTreeSet::new();
        for top_vote in hint_ballots.iter().rev() {
            for envelope in self.latest_envelopes.values() {
                match &envelope.statement.pledges {
                    Pledges::Prepare(p) => {
                        if p.ballot.less_and_compatible(top_vote) {
                            candidates.insert(p.ballot.clone());
                        }
                        for b in p.prepared.iter().chain(p.prepared_prime.iter()) {
                            if b.less_and_compatible(top_vote) {
                                candidates.insert(b.clone());
                            }
                        }
                    }
                    Pledges::Confirm(c) => {
                        if top_vote.is_compatible(&c.ballot) {
                            candidates.insert(top_vote.clone());
                            if c.n_prepared < top_vote.counter {
                                candidates
                                    .insert(Ballot::new(c.n_prepared, top_vote.value.clone()));
                            }
                        }
                    }
                    Pledges::Externalize(e) => {
                        if top_vote.is_compatible(&e.commit) {
                            candidates.insert(top_vote.clone());
                        }
                    }
                    Pledges::Nominate(_) => {}
                }
            }
        }
        candidates.into_iter().collect()
    }

    /// Quorum sets of every node we hold a statement from, plus our own.
    fn quorum_set_map<D: ScpDriver>(&self, ctx: &SlotContext<'_, D>) -> HashMap<NodeId, QuorumSet> {
        let mut map: HashMap<NodeId, QuorumSet> = self
            .latest_envelopes
            .iter()
            .filter_map(|(node, env)| ctx.statement_quorum_set(&env.statement).map(|q| (*node, q)))
            .collect();
        map.entry(*ctx.local_node_id)
            .or_insert_with(|| ctx.local_quorum_set.clone());
        map
    }

    /// Accept when a v-blocking set accepted, or a quorum voted or accepted.
    pub(super) fn federated_accept<D, V, A>(
        &self,
        voted: V,
        accepted: A,
        ctx: &SlotContext<'_, D>,
    ) -> bool
    where
        D: ScpDriver,
        V: Fn(&Statement) -> bool,
        A: Fn(&Statement) -> bool,
    {
        let mut acceptors = HashSet::new();
        let mut supporters = HashSet::new();
        for (node, envelope) in &self.latest_envelopes {
            if accepted(&envelope.statement) {
                acceptors.insert(*node);
                supporters.insert(*node);
            } else if voted(&envelope.statement) {
                supporters.insert(*node);
            }
        }
        if is_v_blocking(ctx.local_quorum_set, &acceptors) {
            return true;
        }
        let qsets = self.quorum_set_map(ctx);
        is_quorum(ctx.local_quorum_set, &supporters, |n| qsets.get(n))
    }

    /// Ratify when a quorum voted.
    pub(super) fn federated_ratify<D, V>(&self, voted: V, ctx: &SlotContext<'_, D>) -> bool
    where
        D: ScpDriver,
        V: Fn(&Statement) -> bool,
    {
        let supporters: HashSet<NodeId> = self
            .latest_envelopes
            .iter()
            .filter(|(_, env)| voted(&env.statement))
            .map(|(node, _)| *node)
            .collect();
        let qsets = self.quorum_set_map(ctx);
        is_quorum(ctx.local_quorum_set, &supporters, |n| qsets.get(n))
    }

    pub(super) fn has_vblocking_subset_strictly_ahead_of<D: ScpDriver>(
        &self,
        counter: u32,
        ctx: &SlotContext<'_, D>,
    ) -> bool {
        let ahead: HashSet<NodeId> = self
            .latest_envelopes
            .iter()
            .filter(|(_, env)| statement_ballot_counter(&env.statement) > counter)
            .map(|(node, _)| *node)
            .collect();
        is_v_blocking(ctx.local_quorum_set, &ahead)
    }

    /// Re-evaluate whether a quorum is at or past our counter, arming the
    /// ballot timer on the transition to "heard".
    pub(super) fn check_heard_from_quorum<D: ScpDriver>(&mut self, ctx: &mut SlotContext<'_, D>) {
        let Some(current) = self.current_ballot.clone() else {
            return;
        };

        let mut nodes = HashSet::new();
        let mut qsets = HashMap::new();
        for (node, envelope) in &self.latest_envelopes {
            let include = match &envelope.statement.pledges {
                Pledges::Prepare(p) => current.counter <= p.ballot.counter,
                Pledges::Confirm(_) | Pledges::Externalize(_) => true,
                Pledges::Nominate(_) => false,
            };
            if include {
                nodes.insert(*node);
                if let Some(qs) = ctx.statement_quorum_set(&envelope.statement) {
                    qsets.insert(*node, qs);
                }
            }
        }

        if is_quorum(ctx.local_quorum_set, &nodes, |n| qsets.get(n)) {
            let was_heard = self.heard_from_quorum;
            self.heard_from_quorum = true;
            if !was_heard {
                ctx.events.push(SlotEvent::HeardFromQuorum {
                    ballot: current.clone(),
                });
                if self.phase != BallotPhase::Externalize {
                    let timeout = ctx.driver.compute_timeout(current.counter, false);
                    ctx.driver.setup_timer(ctx.slot_index, TimerKind::Ballot, timeout);
                }
            }
            if self.phase == BallotPhase::Externalize {
                ctx.driver.stop_timer(ctx.slot_index, TimerKind::Ballot);
            }
        } else {
            self.heard_from_quorum = false;
            ctx.driver.stop_timer(ctx.slot_index, TimerKind::Ballot);
        }
    }
}

pub(super) fn votes_for_ballot(ballot: &Ballot, statement: &Statement) -> bool {
    match &statement.pledges {
        Pledges::Prepare(p) => ballot.less_and_compatible(&p.ballot),
        Pledges::Confirm(c) => ballot.is_compatible(&c.ballot),
        Pledges::Externalize(e) => ballot.is_compatible(&e.commit),
        Pledges::Nominate(_) => false,
    }
}

pub(super) fn has_prepared_ballot(ballot: &Ballot, statement: &Statement) -> bool {
    match &statement.pledges {
        Pledges::Prepare(p) => p
            .prepared
            .iter()
            .chain(p.prepared_prime.iter())
            .any(|prepared| ballot.less_and_compatible(prepared)),
        Pledges::Confirm(c) => {
            ballot.less_and_compatible(&Ballot::new(c.n_prepared, c.ballot.value.clone()))
        }
        Pledges::Externalize(e) => ballot.is_compatible(&e.commit),
        Pledges::Nominate(_) => false,
    }
}

/// Statement votes to commit `ballot.value` over counters `interval`.
pub(super) fn votes_commit(ballot: &Ballot, interval: (u32, u32), statement: &Statement) -> bool {
    match &statement.pledges {
        Pledges::Prepare(p) => {
            ballot.is_compatible(&p.ballot)
                && p.n_c != 0
                && p.n_c <= interval.0
                && interval.1 <= p.n_h
        }
        Pledges::Confirm(c) => ballot.is_compatible(&c.ballot) && c.n_commit <= interval.0,
        Pledges::Externalize(e) => ballot.is_compatible(&e.commit) && e.commit.counter <= interval.0,
        Pledges::Nominate(_) => false,
    }
}

/// Statement accepted commit of `ballot.value` over counters `interval`.
pub(super) fn accepted_commit(ballot: &Ballot, interval: (u32, u32), statement: &Statement) -> bool {
    match &statement.pledges {
        Pledges::Confirm(c) => {
            ballot.is_compatible(&c.ballot) && c.n_commit <= interval.0 && interval.1 <= c.n_h
        }
        Pledges::Externalize(e) => ballot.is_compatible(&e.commit) && e.commit.counter <= interval.0,
        _ => false,
    }
}
