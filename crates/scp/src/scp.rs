use std::collections::BTreeMap;
use std::sync::Arc;

use lumen_common::{Hash256, NodeId};
use tracing::{debug, info};

use crate::ballot::BallotState;
use crate::driver::ScpDriver;
use crate::error::{Result, ScpError};
use crate::observer::{SlotEvent, SlotObserver};
use crate::quorum::{check_quorum_set_sane, hash_quorum_set};
use crate::slot::{Slot, SlotPhase};
use crate::types::{Ballot, Envelope, QuorumSet, Value};
use crate::{EnvelopeState, SlotContext};

/// The table of slots a node participates in.
///
/// Slots are created lazily when the first message or nomination for them
/// arrives and stay until [`Scp::purge_slots`] drops them.
pub struct Scp {
    local_node_id: NodeId,
    local_quorum_set: QuorumSet,
    local_quorum_set_hash: Hash256,
    is_validator: bool,
    slots: BTreeMap<u64, Slot>,
    observers: Vec<Arc<dyn SlotObserver>>,
}

impl Scp {
    pub fn new(local_node_id: NodeId, local_quorum_set: QuorumSet, is_validator: bool) -> Result<Self> {
        check_quorum_set_sane(&local_quorum_set, false)?;
        let local_quorum_set_hash = hash_quorum_set(&local_quorum_set);
        Ok(Self {
            local_node_id,
            local_quorum_set,
            local_quorum_set_hash,
            is_validator,
            slots: BTreeMap::new(),
            observers: Vec::new(),
        })
    }

    pub fn local_node_id(&self) -> &NodeId {
        &self.local_node_id
    }

    pub fn local_quorum_set(&self) -> &QuorumSet {
        &self.local_quorum_set
    }

    pub fn local_quorum_set_hash(&self) -> Hash256 {
        self.local_quorum_set_hash
    }

    pub fn is_validator(&self) -> bool {
        self.is_validator
    }

    pub fn add_observer(&mut self, observer: Arc<dyn SlotObserver>) {
        self.observers.push(observer);
    }

    pub fn receive_envelope<D: ScpDriver>(&mut self, envelope: &Envelope, driver: &mut D) -> EnvelopeState {
        let slot_index = envelope.slot_index();
        let state = self
            .with_slot(slot_index, true, driver, |slot, ctx| {
                slot.process_envelope(envelope, ctx)
            })
            .unwrap_or(EnvelopeState::Invalid);
        debug!(
            slot = slot_index,
            node = %envelope.node_id(),
            kind = envelope.statement.kind(),
            ?state,
            "processed envelope"
        );
        state
    }

    /// Start nominating `value` for `slot_index`.
    pub fn nominate<D: ScpDriver>(
        &mut self,
        slot_index: u64,
        value: Value,
        prev_value: &Value,
        driver: &mut D,
    ) -> bool {
        self.with_slot(slot_index, true, driver, |slot, ctx| {
            slot.nominate(ctx, value, prev_value, false)
        })
        .unwrap_or(false)
    }

    /// The nomination timer fired: run another round.
    pub fn nominate_timeout<D: ScpDriver>(
        &mut self,
        slot_index: u64,
        value: Value,
        prev_value: &Value,
        driver: &mut D,
    ) -> bool {
        self.with_slot(slot_index, false, driver, |slot, ctx| {
            slot.nominate(ctx, value, prev_value, true)
        })
        .unwrap_or(false)
    }

    /// Abandon nomination for `slot_index` and cancel its timer. Later
    /// nomination calls for the slot are no-ops.
    pub fn stop_nomination<D: ScpDriver>(&mut self, slot_index: u64, driver: &mut D) {
        self.with_slot(slot_index, false, driver, |slot, ctx| slot.stop_nomination(ctx));
    }

    /// The ballot timer fired for `slot_index`.
    pub fn ballot_timer_expired<D: ScpDriver>(&mut self, slot_index: u64, driver: &mut D) -> bool {
        self.with_slot(slot_index, false, driver, |slot, ctx| {
            slot.bump_ballot_on_timeout(ctx)
        })
        .unwrap_or(false)
    }

    /// Record `value` as final for `slot_index` without running the
    /// protocol, for values known from history.
    pub fn force_externalize(&mut self, slot_index: u64, value: Value) -> Result<()> {
        let is_validator = self.is_validator;
        let slot = self
            .slots
            .entry(slot_index)
            .or_insert_with(|| Slot::new(slot_index, is_validator));
        match slot.externalized_value() {
            Some(existing) if *existing != value => {
                Err(ScpError::ConflictingExternalize { slot: slot_index })
            }
            Some(_) => Ok(()),
            None => {
                info!(slot = slot_index, "force externalizing slot");
                slot.force_externalize(value);
                Ok(())
            }
        }
    }

    pub fn get_externalized_value(&self, slot_index: u64) -> Option<Value> {
        self.slots.get(&slot_index)?.externalized_value().cloned()
    }

    pub fn is_slot_externalized(&self, slot_index: u64) -> bool {
        self.get_externalized_value(slot_index).is_some()
    }

    pub fn slot_phase(&self, slot_index: u64) -> Option<SlotPhase> {
        self.slots.get(&slot_index).map(Slot::phase)
    }

    pub fn is_slot_fully_validated(&self, slot_index: u64) -> bool {
        self.slots
            .get(&slot_index)
            .map(Slot::is_fully_validated)
            .unwrap_or(false)
    }

    pub fn got_v_blocking(&self, slot_index: u64) -> bool {
        self.slots
            .get(&slot_index)
            .map(Slot::got_v_blocking)
            .unwrap_or(false)
    }

    pub fn heard_from_quorum(&self, slot_index: u64) -> bool {
        self.slots
            .get(&slot_index)
            .map(Slot::heard_from_quorum)
            .unwrap_or(false)
    }

    pub fn current_ballot(&self, slot_index: u64) -> Option<Ballot> {
        self.slots.get(&slot_index)?.current_ballot().cloned()
    }

    /// Local ballot variables of `slot_index`, for diagnostics.
    pub fn ballot_state(&self, slot_index: u64) -> Option<BallotState> {
        self.slots.get(&slot_index).map(Slot::ballot_state)
    }

    /// How many times the nomination timer fired for `slot_index`.
    pub fn nomination_timeouts(&self, slot_index: u64) -> u32 {
        self.slots
            .get(&slot_index)
            .map(Slot::nomination_timeouts)
            .unwrap_or(0)
    }

    pub fn nomination_round(&self, slot_index: u64) -> u32 {
        self.slots
            .get(&slot_index)
            .map(Slot::nomination_round)
            .unwrap_or(0)
    }

    pub fn nomination_leaders(&self, slot_index: u64) -> Vec<NodeId> {
        let mut leaders: Vec<NodeId> = self
            .slots
            .get(&slot_index)
            .map(|s| s.nomination_leaders().iter().copied().collect())
            .unwrap_or_default();
        leaders.sort();
        leaders
    }

    pub fn latest_composite_candidate(&self, slot_index: u64) -> Option<Value> {
        self.slots.get(&slot_index)?.latest_composite().cloned()
    }

    pub fn latest_envelope(&self, slot_index: u64, node_id: &NodeId) -> Option<Envelope> {
        self.slots.get(&slot_index)?.latest_envelope(node_id).cloned()
    }

    /// Local envelopes for `slot_index` that should be re-sent to peers.
    pub fn latest_messages_send(&self, slot_index: u64) -> Vec<Envelope> {
        self.slots
            .get(&slot_index)
            .map(Slot::latest_messages_send)
            .unwrap_or_default()
    }

    /// Statements supporting the externalized value of `slot_index`.
    pub fn externalizing_state(&self, slot_index: u64) -> Vec<Envelope> {
        self.slots
            .get(&slot_index)
            .map(Slot::externalizing_state)
            .unwrap_or_default()
    }

    pub fn statement_count(&self, slot_index: u64) -> usize {
        self.slots
            .get(&slot_index)
            .map(Slot::statement_count)
            .unwrap_or(0)
    }

    /// Drop every slot below `max_slot_index`, except `slot_to_keep`.
    pub fn purge_slots(&mut self, max_slot_index: u64, slot_to_keep: Option<u64>) {
        let before = self.slots.len();
        self.slots
            .retain(|index, _| *index >= max_slot_index || Some(*index) == slot_to_keep);
        let purged = before - self.slots.len();
        if purged > 0 {
            debug!(below = max_slot_index, purged, "purged slots");
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn active_slots(&self) -> Vec<u64> {
        self.slots.keys().copied().collect()
    }

    pub fn highest_slot(&self) -> Option<u64> {
        self.slots.keys().next_back().copied()
    }

    pub fn highest_externalized_slot(&self) -> Option<u64> {
        self.slots
            .iter()
            .rev()
            .find(|(_, slot)| slot.externalized_value().is_some())
            .map(|(index, _)| *index)
    }

    fn with_slot<D, R, F>(&mut self, slot_index: u64, create: bool, driver: &mut D, f: F) -> Option<R>
    where
        D: ScpDriver,
        F: FnOnce(&mut Slot, &mut SlotContext<'_, D>) -> R,
    {
        let mut events = Vec::new();
        let result = {
            let slot = if create {
                let is_validator = self.is_validator;
                self.slots
                    .entry(slot_index)
                    .or_insert_with(|| Slot::new(slot_index, is_validator))
            } else {
                self.slots.get_mut(&slot_index)?
            };
            let mut ctx = SlotContext {
                local_node_id: &self.local_node_id,
                local_quorum_set: &self.local_quorum_set,
                local_quorum_set_hash: self.local_quorum_set_hash,
                slot_index,
                driver,
                events: &mut events,
            };
            f(slot, &mut ctx)
        };
        self.dispatch(slot_index, &events);
        Some(result)
    }

    fn dispatch(&self, slot_index: u64, events: &[SlotEvent]) {
        for event in events {
            for observer in &self.observers {
                observer.on_slot_event(slot_index, event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::from_seed(name)
    }

    fn scp() -> Scp {
        let local = node("a");
        let qset = QuorumSet::new(2, vec![local, node("b"), node("c")]);
        Scp::new(local, qset, true).unwrap()
    }

    #[test]
    fn test_new_rejects_insane_quorum_set() {
        let qset = QuorumSet::new(3, vec![node("a")]);
        assert!(Scp::new(node("a"), qset, true).is_err());
    }

    #[test]
    fn test_force_externalize_is_idempotent_and_conflict_checked() {
        let mut scp = scp();
        scp.force_externalize(5, Value::new(vec![1])).unwrap();
        scp.force_externalize(5, Value::new(vec![1])).unwrap();
        assert!(matches!(
            scp.force_externalize(5, Value::new(vec![2])),
            Err(ScpError::ConflictingExternalize { slot: 5 })
        ));
        assert_eq!(scp.slot_phase(5), Some(SlotPhase::Externalized));
        assert_eq!(scp.highest_externalized_slot(), Some(5));
    }

    #[test]
    fn test_purge_slots_keeps_requested_slot() {
        let mut scp = scp();
        for i in 1..=10 {
            scp.force_externalize(i, Value::new(vec![i as u8])).unwrap();
        }
        scp.purge_slots(8, Some(3));
        assert_eq!(scp.active_slots(), vec![3, 8, 9, 10]);
    }
}
