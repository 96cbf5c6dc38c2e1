//! Ballot state transitions.
//!
//! `advance_slot` runs every transition that might have become possible
//! after a new statement arrived. Each `attempt_*` step checks its guard
//! with federated voting and, on success, updates local state and emits a
//! new local statement, which is processed again recursively.

use std::collections::BTreeSet;

use tracing::{error, info};

use super::statements::{
    accepted_commit, has_prepared_ballot, statement_ballot_counter, votes_commit,
    votes_for_ballot,
};
use super::{BallotPhase, BallotProtocol, MAX_PROTOCOL_TRANSITIONS};
use crate::driver::{ScpDriver, TimerKind};
use crate::observer::SlotEvent;
use crate::types::{Ballot, Pledges, Statement};
use crate::{EnvelopeState, SlotContext};

impl BallotProtocol {
    pub(super) fn advance_slot<D: ScpDriver>(
        &mut self,
        hint: &Statement,
        ctx: &mut SlotContext<'_, D>,
    ) -> EnvelopeState {
        self.message_level += 1;
        if self.message_level >= MAX_PROTOCOL_TRANSITIONS {
            error!(
                slot = ctx.slot_index,
                level = self.message_level,
                "maximum number of ballot transitions reached"
            );
            self.message_level -= 1;
            return EnvelopeState::Valid;
        }

        let mut did_work = self.attempt_accept_prepared(hint, ctx);
        did_work = self.attempt_confirm_prepared(hint, ctx) || did_work;
        did_work = self.attempt_accept_commit(hint, ctx) || did_work;
        did_work = self.attempt_confirm_commit(hint, ctx) || did_work;

        // Bumping only happens at the outermost level so that nested
        // self-processing sees a stable counter.
        if self.message_level == 1 {
            while self.attempt_bump(ctx) {
                did_work = true;
            }
            self.check_heard_from_quorum(ctx);
        }

        self.message_level -= 1;
        if did_work {
            self.send_latest_envelope(ctx);
            EnvelopeState::ValidNew
        } else {
            EnvelopeState::Valid
        }
    }

    fn attempt_accept_prepared<D: ScpDriver>(
        &mut self,
        hint: &Statement,
        ctx: &mut SlotContext<'_, D>,
    ) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }

        let candidates = self.get_prepare_candidates(hint);
        for ballot in candidates.iter().rev() {
            if self.phase == BallotPhase::Confirm {
                // only ballots that raise p and stay compatible with c
                if let Some(prepared) = &self.prepared {
                    if !prepared.less_and_compatible(ballot) {
                        continue;
                    }
                }
                if let Some(commit) = &self.commit {
                    if !commit.is_compatible(ballot) {
                        continue;
                    }
                }
            }
            if let Some(pp) = &self.prepared_prime {
                if ballot <= pp {
                    continue;
                }
            }
            if let Some(prepared) = &self.prepared {
                if ballot.less_and_compatible(prepared) {
                    continue;
                }
            }

            let accepted = self.federated_accept(
                |st| votes_for_ballot(ballot, st),
                |st| has_prepared_ballot(ballot, st),
                ctx,
            );
            if accepted && self.set_accept_prepared(ballot.clone(), ctx) {
                return true;
            }
        }
        false
    }

    fn set_accept_prepared<D: ScpDriver>(
        &mut self,
        ballot: Ballot,
        ctx: &mut SlotContext<'_, D>,
    ) -> bool {
        let mut did_work = self.set_prepared(ballot.clone());

        if self.commit.is_some() {
            if let Some(high) = &self.high_ballot {
                let conflicts = self
                    .prepared
                    .iter()
                    .chain(self.prepared_prime.iter())
                    .any(|p| high.less_and_incompatible(p));
                if conflicts {
                    self.commit = None;
                    did_work = true;
                }
            }
        }

        if did_work {
            ctx.events.push(SlotEvent::AcceptedPrepared { ballot });
            self.emit_current_state(ctx);
        }
        did_work
    }

    fn set_prepared(&mut self, ballot: Ballot) -> bool {
        let Some(prepared) = self.prepared.clone() else {
            self.prepared = Some(ballot);
            return true;
        };

        match prepared.cmp(&ballot) {
            std::cmp::Ordering::Less => {
                if !prepared.is_compatible(&ballot) {
                    self.prepared_prime = Some(prepared);
                }
                self.prepared = Some(ballot);
                true
            }
            std::cmp::Ordering::Greater => {
                let replace_prime = match &self.prepared_prime {
                    None => true,
                    Some(pp) => *pp < ballot && !prepared.is_compatible(&ballot),
                };
                if replace_prime {
                    self.prepared_prime = Some(ballot);
                }
                replace_prime
            }
            std::cmp::Ordering::Equal => false,
        }
    }

    fn attempt_confirm_prepared<D: ScpDriver>(
        &mut self,
        hint: &Statement,
        ctx: &mut SlotContext<'_, D>,
    ) -> bool {
        if self.phase != BallotPhase::Prepare || self.prepared.is_none() {
            return false;
        }

        let candidates = self.get_prepare_candidates(hint);
        let Some((new_h, h_index)) = self.find_highest_confirmed_prepared(&candidates, ctx) else {
            return false;
        };
        let new_c = self.find_lowest_commit_ballot(&candidates, &new_h, h_index, ctx);
        self.set_confirm_prepared(new_c, new_h, ctx)
    }

    fn find_highest_confirmed_prepared<D: ScpDriver>(
        &self,
        candidates: &[Ballot],
        ctx: &SlotContext<'_, D>,
    ) -> Option<(Ballot, usize)> {
        for (idx, ballot) in candidates.iter().enumerate().rev() {
            if let Some(high) = &self.high_ballot {
                if high >= ballot {
                    break;
                }
            }
            if self.federated_ratify(|st| has_prepared_ballot(ballot, st), ctx) {
                return Some((ballot.clone(), idx));
            }
        }
        None
    }

    /// Walk down from `h` to find the lowest ballot that is still confirmed
    /// prepared, which becomes `c`. Returns a zero-counter ballot when no
    /// commit vote can be cast.
    fn find_lowest_commit_ballot<D: ScpDriver>(
        &self,
        candidates: &[Ballot],
        new_h: &Ballot,
        h_index: usize,
        ctx: &SlotContext<'_, D>,
    ) -> Ballot {
        let mut new_c = Ballot::new(0, new_h.value.clone());
        let current = self
            .current_ballot
            .clone()
            .unwrap_or_else(|| Ballot::new(0, new_h.value.clone()));

        let can_set_commit = self.commit.is_none()
            && !self
                .prepared
                .iter()
                .chain(self.prepared_prime.iter())
                .any(|p| new_h.less_and_incompatible(p));

        if can_set_commit {
            for ballot in candidates[..=h_index].iter().rev() {
                if *ballot < current {
                    break;
                }
                if !ballot.less_and_compatible(new_h) {
                    continue;
                }
                if self.federated_ratify(|st| has_prepared_ballot(ballot, st), ctx) {
                    new_c = ballot.clone();
                } else {
                    break;
                }
            }
        }
        new_c
    }

    fn set_confirm_prepared<D: ScpDriver>(
        &mut self,
        new_c: Ballot,
        new_h: Ballot,
        ctx: &mut SlotContext<'_, D>,
    ) -> bool {
        let mut did_work = false;
        self.value_override = Some(new_h.value.clone());

        let compatible = self
            .current_ballot
            .as_ref()
            .map(|b| b.is_compatible(&new_h))
            .unwrap_or(true);
        if compatible {
            if self.high_ballot.as_ref().map(|h| new_h > *h).unwrap_or(true) {
                self.high_ballot = Some(new_h.clone());
                did_work = true;
            }
            if new_c.counter != 0 && self.commit.is_none() {
                self.commit = Some(new_c);
                did_work = true;
            }
            if did_work {
                ctx.events.push(SlotEvent::ConfirmedPrepared {
                    ballot: new_h.clone(),
                });
            }
        }

        did_work = self.update_current_if_needed(&new_h) || did_work;
        if did_work {
            self.emit_current_state(ctx);
        }
        did_work
    }

    fn attempt_accept_commit<D: ScpDriver>(
        &mut self,
        hint: &Statement,
        ctx: &mut SlotContext<'_, D>,
    ) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }
        let Some(ballot) = hint_ballot_for_commit(hint) else {
            return false;
        };
        if self.phase == BallotPhase::Confirm {
            if let Some(high) = &self.high_ballot {
                if !ballot.is_compatible(high) {
                    return false;
                }
            }
        }

        let boundaries = self.commit_boundaries(&ballot);
        if boundaries.is_empty() {
            return false;
        }

        let view: &SlotContext<'_, D> = ctx;
        let interval = find_extended_interval(&boundaries, |interval| {
            self.federated_accept(
                |st| votes_commit(&ballot, interval, st),
                |st| accepted_commit(&ballot, interval, st),
                view,
            )
        });
        let Some((low, high)) = interval else {
            return false;
        };

        let current_high = self.high_ballot.as_ref().map(|b| b.counter).unwrap_or(0);
        if self.phase != BallotPhase::Confirm || high > current_high {
            let c = Ballot::new(low, ballot.value.clone());
            let h = Ballot::new(high, ballot.value);
            return self.set_accept_commit(c, h, ctx);
        }
        false
    }

    fn set_accept_commit<D: ScpDriver>(
        &mut self,
        c: Ballot,
        h: Ballot,
        ctx: &mut SlotContext<'_, D>,
    ) -> bool {
        let mut did_work = false;
        self.value_override = Some(h.value.clone());

        if self.high_ballot.as_ref() != Some(&h) || self.commit.as_ref() != Some(&c) {
            self.commit = Some(c);
            self.high_ballot = Some(h.clone());
            did_work = true;
        }

        if self.phase == BallotPhase::Prepare {
            self.phase = BallotPhase::Confirm;
            if let Some(current) = &self.current_ballot {
                if !h.less_and_compatible(current) {
                    self.bump_to_ballot(&h, false);
                }
            }
            self.prepared_prime = None;
            did_work = true;
        }

        if did_work {
            self.update_current_if_needed(&h);
            ctx.events.push(SlotEvent::AcceptedCommit { ballot: h });
            self.emit_current_state(ctx);
        }
        did_work
    }

    fn attempt_confirm_commit<D: ScpDriver>(
        &mut self,
        hint: &Statement,
        ctx: &mut SlotContext<'_, D>,
    ) -> bool {
        if self.phase != BallotPhase::Confirm {
            return false;
        }
        let (Some(_), Some(commit)) = (&self.high_ballot, &self.commit) else {
            return false;
        };
        let Some(ballot) = hint_ballot_for_commit(hint) else {
            return false;
        };
        if !ballot.is_compatible(commit) {
            return false;
        }

        let boundaries = self.commit_boundaries(&ballot);
        let view: &SlotContext<'_, D> = ctx;
        let interval = find_extended_interval(&boundaries, |interval| {
            self.federated_ratify(|st| accepted_commit(&ballot, interval, st), view)
        });
        let Some((low, high)) = interval else {
            return false;
        };

        let c = Ballot::new(low, ballot.value.clone());
        let h = Ballot::new(high, ballot.value);
        self.set_confirm_commit(c, h, ctx)
    }

    fn set_confirm_commit<D: ScpDriver>(
        &mut self,
        c: Ballot,
        h: Ballot,
        ctx: &mut SlotContext<'_, D>,
    ) -> bool {
        self.commit = Some(c.clone());
        self.high_ballot = Some(h.clone());
        self.update_current_if_needed(&h);
        self.phase = BallotPhase::Externalize;

        self.emit_current_state(ctx);

        info!(slot = ctx.slot_index, counter = c.counter, "ballot externalized");
        self.externalized_now = true;
        ctx.driver.stop_timer(ctx.slot_index, TimerKind::Ballot);
        ctx.events.push(SlotEvent::Externalized {
            value: c.value.clone(),
        });
        ctx.driver.value_externalized(ctx.slot_index, &c.value);
        true
    }

    /// If a v-blocking set is at a higher counter, jump to the lowest
    /// counter that is no longer v-blocking-ahead of us.
    fn attempt_bump<D: ScpDriver>(&mut self, ctx: &mut SlotContext<'_, D>) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }
        let local_counter = self.current_ballot.as_ref().map(|b| b.counter).unwrap_or(0);
        if !self.has_vblocking_subset_strictly_ahead_of(local_counter, ctx) {
            return false;
        }

        let counters: BTreeSet<u32> = self
            .latest_envelopes
            .values()
            .map(|env| statement_ballot_counter(&env.statement))
            .filter(|c| *c > local_counter)
            .collect();

        for counter in counters {
            if !self.has_vblocking_subset_strictly_ahead_of(counter, ctx) {
                return self.abandon_ballot(counter, ctx);
            }
        }
        false
    }

    /// Move to `counter` (or the next counter when 0), preferring the
    /// composite candidate over the current ballot's value.
    pub(super) fn abandon_ballot<D: ScpDriver>(
        &mut self,
        counter: u32,
        ctx: &mut SlotContext<'_, D>,
    ) -> bool {
        let value = self
            .composite_candidate
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| self.current_ballot.as_ref().map(|b| b.value.clone()));
        let Some(value) = value else {
            return false;
        };
        let counter = if counter == 0 {
            self.current_ballot
                .as_ref()
                .map(|b| b.counter.saturating_add(1))
                .unwrap_or(1)
        } else {
            counter
        };
        self.bump_state(ctx, value, counter)
    }

    fn update_current_if_needed(&mut self, ballot: &Ballot) -> bool {
        match &self.current_ballot {
            Some(current) if current >= ballot => false,
            _ => self.bump_to_ballot(ballot, true),
        }
    }

    pub(super) fn update_current_value(&mut self, ballot: &Ballot) -> bool {
        if !matches!(self.phase, BallotPhase::Prepare | BallotPhase::Confirm) {
            return false;
        }
        let Some(current) = &self.current_ballot else {
            self.bump_to_ballot(ballot, true);
            return true;
        };
        if let Some(commit) = &self.commit {
            if !commit.is_compatible(ballot) {
                return false;
            }
        }
        if current < ballot {
            self.bump_to_ballot(ballot, true);
            true
        } else {
            false
        }
    }

    fn bump_to_ballot(&mut self, ballot: &Ballot, check: bool) -> bool {
        if check {
            if let Some(current) = &self.current_ballot {
                if ballot <= current {
                    return false;
                }
            }
        }

        let counter_changed = self
            .current_ballot
            .as_ref()
            .map(|b| b.counter != ballot.counter)
            .unwrap_or(true);
        self.current_ballot = Some(ballot.clone());

        // h and c must stay compatible with b
        if let Some(high) = &self.high_ballot {
            if !ballot.is_compatible(high) {
                self.high_ballot = None;
                self.commit = None;
            }
        }
        if counter_changed {
            self.heard_from_quorum = false;
        }
        true
    }

    /// Counters at which some statement starts or ends a commit interval
    /// for `ballot.value`.
    fn commit_boundaries(&self, ballot: &Ballot) -> BTreeSet<u32> {
        let mut res = BTreeSet::new();
        for envelope in self.latest_envelopes.values() {
            match &envelope.statement.pledges {
                Pledges::Prepare(p) => {
                    if ballot.is_compatible(&p.ballot) && p.n_c != 0 {
                        res.insert(p.n_c);
                        res.insert(p.n_h);
                    }
                }
                Pledges::Confirm(c) => {
                    if ballot.is_compatible(&c.ballot) {
                        res.insert(c.n_commit);
                        res.insert(c.n_h);
                    }
                }
                Pledges::Externalize(e) => {
                    if ballot.is_compatible(&e.commit) {
                        res.insert(e.commit.counter);
                        res.insert(e.n_h);
                        res.insert(u32::MAX);
                    }
                }
                Pledges::Nominate(_) => {}
            }
        }
        res
    }
}

/// Largest interval `[low, high]` over `boundaries` satisfying `pred`,
/// found by fixing the top boundary first and then extending downward.
fn find_extended_interval<F>(boundaries: &BTreeSet<u32>, pred: F) -> Option<(u32, u32)>
where
    F: Fn((u32, u32)) -> bool,
{
    let mut found: Option<(u32, u32)> = None;
    for &boundary in boundaries.iter().rev() {
        let candidate = match found {
            None => (boundary, boundary),
            Some((_, high)) if boundary > high => continue,
            Some((_, high)) => (boundary, high),
        };
        if pred(candidate) {
            found = Some(candidate);
        } else if found.is_some() {
            break;
        }
    }
    found.filter(|(low, _)| *low != 0)
}

/// Ballot whose value a statement could help commit.
fn hint_ballot_for_commit(hint: &Statement) -> Option<Ballot> {
    match &hint.pledges {
        Pledges::Prepare(p) if p.n_c != 0 => Some(Ballot::new(p.n_h, p.ballot.value.clone())),
        Pledges::Confirm(c) => Some(Ballot::new(c.n_h, c.ballot.value.clone())),
        Pledges::Externalize(e) => Some(Ballot::new(e.n_h, e.commit.value.clone())),
        _ => None,
    }
}

#[cfg(test)]
mod interval_tests {
    use super::*;

    #[test]
    fn test_extended_interval_grows_downward() {
        let boundaries: BTreeSet<u32> = [1, 2, 3, 5].into_iter().collect();
        // predicate holds for intervals within [2, 5]
        let found = find_extended_interval(&boundaries, |(lo, hi)| lo >= 2 && hi <= 5);
        assert_eq!(found, Some((2, 5)));
    }

    #[test]
    fn test_extended_interval_none_when_nothing_holds() {
        let boundaries: BTreeSet<u32> = [1, 2].into_iter().collect();
        assert_eq!(find_extended_interval(&boundaries, |_| false), None);
    }
}
