//! The Herder's side of the SCP boundary.
//!
//! [`HerderDriver`] holds everything SCP needs to consult while it runs:
//! the tracking state for value validation, the pending store for tx sets
//! and quorum sets, the timer queue and the overlay for outgoing
//! envelopes. The [`crate::Herder`] lends it to SCP as `&mut` for each
//! call.
//!
//! Externalization is not acted on here. SCP reports a final value from
//! deep inside its own call, so the driver only queues it; the Herder
//! drains the queue once SCP has returned.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lumen_common::{Clock, Hash256, NodeId};
use lumen_scp::{
    Ballot, Envelope, QuorumSet, ScpDriver, TimerKind, ValidationLevel, Value, MAX_TIMEOUT_SECONDS,
};
use tracing::{debug, error, trace};

use crate::config::HerderConfig;
use crate::ledger::{LedgerManager, Overlay};
use crate::metrics::HerderMetrics;
use crate::pending::PendingEnvelopes;
use crate::state::TrackingState;
use crate::timer::{HerderTimer, TimerQueue};
use crate::tx::TransactionSet;
use crate::tx_pool::TransactionPool;
use crate::value::ConsensusValue;

/// The value the local node is nominating, kept for nomination timeouts.
#[derive(Debug, Clone)]
pub(crate) struct Nomination {
    pub slot_index: u64,
    pub value: Value,
    pub prev_value: Value,
}

pub(crate) struct HerderDriver {
    pub config: HerderConfig,
    pub local_node: NodeId,
    pub ledger: Arc<dyn LedgerManager>,
    pub overlay: Arc<dyn Overlay>,
    pub clock: Arc<dyn Clock>,
    pub metrics: Arc<HerderMetrics>,
    pub pending: PendingEnvelopes,
    pub pool: TransactionPool,
    pub timers: TimerQueue,
    pub tracking: Option<TrackingState>,
    pub last_trigger: Instant,
    pub last_trigger_unix: u64,
    pub nomination: Option<Nomination>,
    pub last_emitted_slot: Option<u64>,
    /// Values SCP externalized during the current call.
    pub externalized: VecDeque<(u64, Value)>,
    /// Latest slot each peer sent an envelope for.
    pub node_last_slot: HashMap<NodeId, u64>,
}

impl HerderDriver {
    pub fn new(
        local_node: NodeId,
        local_quorum_set: QuorumSet,
        config: HerderConfig,
        ledger: Arc<dyn LedgerManager>,
        overlay: Arc<dyn Overlay>,
        clock: Arc<dyn Clock>,
        metrics: Arc<HerderMetrics>,
    ) -> Self {
        let pending = PendingEnvelopes::new(config.pending.clone(), local_quorum_set);
        let pool = TransactionPool::new(config.pool_tiers);
        let last_trigger = clock.now();
        let last_trigger_unix = clock.unix_time();
        Self {
            config,
            local_node,
            ledger,
            overlay,
            clock,
            metrics,
            pending,
            pool,
            timers: TimerQueue::new(),
            tracking: None,
            last_trigger,
            last_trigger_unix,
            nomination: None,
            last_emitted_slot: None,
            externalized: VecDeque::new(),
            node_last_slot: HashMap::new(),
        }
    }

    pub fn schedule(&mut self, timer: HerderTimer, slot_index: u64, delay: Duration) {
        let deadline = self.clock.now() + delay;
        trace!(%timer, slot = slot_index, ?delay, "timer scheduled");
        self.timers.schedule(timer, slot_index, deadline);
    }

    /// Re-arm the lost-sync timer for the slot just externalized.
    pub fn track_heartbeat(&mut self) {
        if self.config.manual_close {
            return;
        }
        if let Some(tracking) = self.tracking {
            self.schedule(
                HerderTimer::Tracking,
                tracking.consensus_index,
                self.config.consensus_stuck_timeout,
            );
        }
    }

    pub fn note_node_slot(&mut self, node: NodeId, slot_index: u64) {
        let last = self.node_last_slot.entry(node).or_insert(slot_index);
        *last = (*last).max(slot_index);
    }

    /// Forget peers not heard from within the expiration window before
    /// `slot_index`. Returns how many were dropped.
    pub fn evict_idle_nodes(&mut self, slot_index: u64) -> usize {
        let Some(floor) = slot_index.checked_sub(self.config.node_expiration_slots) else {
            return 0;
        };
        let before = self.node_last_slot.len();
        self.node_last_slot.retain(|_, last| *last >= floor);
        before - self.node_last_slot.len()
    }

    fn validate_consensus_value(&self, slot_index: u64, value: &ConsensusValue) -> ValidationLevel {
        let Some(tracking) = self.tracking else {
            return ValidationLevel::MaybeValid;
        };
        let next = tracking.next_index();
        if slot_index < next {
            trace!(slot = slot_index, next, "value for a past slot");
            return ValidationLevel::MaybeValid;
        }
        if slot_index > next {
            error!(slot = slot_index, next, "value for a future slot while tracking");
            self.metrics.protocol_violations.inc();
            return ValidationLevel::Invalid;
        }
        if value.close_time <= tracking.value.close_time {
            debug!(
                slot = slot_index,
                close_time = value.close_time,
                last = tracking.value.close_time,
                "close time not after last ledger"
            );
            return ValidationLevel::Invalid;
        }
        let latest = self.clock.unix_time().saturating_add(self.config.max_time_slip.as_secs());
        if value.close_time > latest {
            debug!(slot = slot_index, close_time = value.close_time, latest, "close time too far ahead");
            return ValidationLevel::Invalid;
        }
        if !self.ledger.is_synced() {
            return ValidationLevel::MaybeValid;
        }

        let lcl = self.ledger.last_closed_ledger();
        match self.pending.get_tx_set(&value.tx_set_hash) {
            None => {
                error!(slot = slot_index, tx_set = %value.tx_set_hash.short(), "validating value with unknown tx set");
                ValidationLevel::Invalid
            }
            Some(set) if !set.check_valid(self.ledger.as_ref(), lcl.hash) => {
                debug!(slot = slot_index, tx_set = %value.tx_set_hash.short(), "invalid tx set");
                ValidationLevel::Invalid
            }
            Some(_) => ValidationLevel::FullyValidated,
        }
    }

    /// Whether `counter` rounds could have timed out by `limit_unix`, given
    /// each round waits `min(2^i, MAX_TIMEOUT_SECONDS)` after the last
    /// trigger.
    fn counter_within_budget(&self, counter: u32, limit_unix: u64) -> bool {
        let mut budget: u64 = 0;
        for i in 0..counter {
            if limit_unix < self.last_trigger_unix.saturating_add(budget) {
                return false;
            }
            let step = 1u64
                .checked_shl(i)
                .unwrap_or(u64::MAX)
                .min(MAX_TIMEOUT_SECONDS);
            budget = budget.saturating_add(step);
        }
        limit_unix >= self.last_trigger_unix.saturating_add(budget)
    }

    fn check_ballot(&self, slot_index: u64, node_id: &NodeId, ballot: &Ballot) -> bool {
        let Ok(value) = ConsensusValue::from_value(&ballot.value) else {
            trace!(slot = slot_index, "ballot value does not decode");
            return false;
        };
        let limit = self.clock.unix_time().saturating_add(self.config.max_time_slip.as_secs());
        if value.close_time > limit {
            debug!(slot = slot_index, close_time = value.close_time, "ballot close time too far ahead");
            return false;
        }
        if let Some(tracking) = self.tracking {
            if slot_index != tracking.next_index() {
                error!(
                    slot = slot_index,
                    next = tracking.next_index(),
                    node = %node_id,
                    "ballot for a slot other than the tracked one"
                );
                self.metrics.protocol_violations.inc();
                return false;
            }
        }
        if !self.counter_within_budget(ballot.counter, limit) {
            debug!(slot = slot_index, counter = ballot.counter, node = %node_id, "ballot counter too high");
            return false;
        }
        let desired = self.config.desired_base_fee;
        if value.base_fee.saturating_mul(2) < desired || value.base_fee > desired.saturating_mul(2) {
            debug!(slot = slot_index, base_fee = value.base_fee, desired, "base fee out of band");
            return false;
        }
        if !self.config.is_validator && *node_id == self.local_node {
            debug!(slot = slot_index, "observer cannot author ballots");
            return false;
        }
        true
    }
}

impl ScpDriver for HerderDriver {
    fn validate_value(&self, slot_index: u64, value: &Value, _nomination: bool) -> ValidationLevel {
        let level = match ConsensusValue::from_value(value) {
            Ok(decoded) => self.validate_consensus_value(slot_index, &decoded),
            Err(e) => {
                trace!(slot = slot_index, error = %e, "value does not decode");
                ValidationLevel::Invalid
            }
        };
        if level == ValidationLevel::Invalid {
            self.metrics.values_rejected.inc();
        }
        level
    }

    fn validate_ballot(&self, slot_index: u64, node_id: &NodeId, ballot: &Ballot) -> bool {
        let valid = self.check_ballot(slot_index, node_id, ballot);
        if !valid {
            self.metrics.ballots_rejected.inc();
        }
        valid
    }

    /// Highest fee, latest close time and the union of every candidate's
    /// transactions that build on the local last closed ledger.
    fn combine_candidates(&mut self, slot_index: u64, candidates: &BTreeSet<Value>) -> Option<Value> {
        let decoded: Vec<ConsensusValue> = candidates
            .iter()
            .filter_map(|value| ConsensusValue::from_value(value).ok())
            .collect();
        let base_fee = decoded.iter().map(|v| v.base_fee).max()?;
        let close_time = decoded.iter().map(|v| v.close_time).max()?;

        let lcl = self.ledger.last_closed_ledger();
        let mut seen = HashSet::new();
        let mut transactions = Vec::new();
        for value in &decoded {
            let Some(set) = self.pending.get_tx_set(&value.tx_set_hash) else {
                continue;
            };
            if set.previous_ledger_hash() != lcl.hash {
                continue;
            }
            for tx in set.transactions() {
                if seen.insert(tx.full_hash()) {
                    transactions.push(tx.clone());
                }
            }
        }

        let mut combined = TransactionSet::from_transactions(lcl.hash, transactions);
        let invalid = combined.trim_invalid(self.ledger.as_ref());
        let cut = combined.surge_pricing_filter(self.config.max_tx_set_size);
        let hash = combined.contents_hash();
        debug!(
            slot = slot_index,
            candidates = decoded.len(),
            txs = combined.len(),
            invalid = invalid.len(),
            cut = cut.len(),
            "combined candidates"
        );
        self.pending.add_tx_set(slot_index, hash, Arc::new(combined));
        ConsensusValue::new(hash, close_time, base_fee).to_value().ok()
    }

    fn get_quorum_set(&self, hash: &Hash256) -> Option<QuorumSet> {
        self.pending.get_quorum_set(hash)
    }

    fn emit_envelope(&mut self, envelope: &Envelope) {
        if !self.config.is_validator {
            return;
        }
        if self.tracking.is_none() || !self.ledger.is_synced() {
            debug!(slot = envelope.slot_index(), "not emitting while out of sync");
            return;
        }
        self.metrics.envelopes_emitted.inc();
        self.last_emitted_slot = Some(envelope.slot_index());
        self.overlay.broadcast_envelope(envelope, false);
        self.schedule(
            HerderTimer::Rebroadcast,
            envelope.slot_index(),
            self.config.rebroadcast_interval,
        );
    }

    fn value_externalized(&mut self, slot_index: u64, value: &Value) {
        self.externalized.push_back((slot_index, value.clone()));
    }

    fn setup_timer(&mut self, slot_index: u64, kind: TimerKind, timeout: Duration) {
        self.schedule(kind.into(), slot_index, timeout);
    }

    fn stop_timer(&mut self, _slot_index: u64, kind: TimerKind) {
        self.timers.cancel(kind.into());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use lumen_common::ManualClock;
    use parking_lot::Mutex;

    use super::*;
    use crate::tx::tests::{tx, AccountsLedger};
    use crate::tx::Transaction;

    pub(crate) const START: u64 = 10_000;

    #[derive(Default)]
    pub(crate) struct RecordingOverlay {
        pub envelopes: Mutex<Vec<(Envelope, bool)>>,
    }

    impl Overlay for RecordingOverlay {
        fn broadcast_envelope(&self, envelope: &Envelope, is_rebroadcast: bool) {
            self.envelopes.lock().push((envelope.clone(), is_rebroadcast));
        }
        fn broadcast_transaction(&self, _tx: &Transaction) {}
        fn ledger_closed(&self, _ledger_seq: u64) {}
        fn request_tx_set(&self, _hash: Hash256) {}
        fn request_quorum_set(&self, _hash: Hash256) {}
    }

    struct Fixture {
        driver: HerderDriver,
        clock: ManualClock,
        metrics: Arc<HerderMetrics>,
        lcl_hash: Hash256,
    }

    /// Validator tracking slot 1 (the accounts ledger's LCL) at close time
    /// `START - 10`.
    fn fixture() -> Fixture {
        let local = NodeId::from_seed("local");
        let clock = ManualClock::new(START);
        let metrics = Arc::new(HerderMetrics::new());
        let ledger = Arc::new(AccountsLedger::with(&[("alice", 1_000, 0), ("bob", 1_000, 0)]));
        let lcl_hash = ledger.last_closed_ledger().hash;
        let mut driver = HerderDriver::new(
            local,
            QuorumSet::singleton(local),
            HerderConfig::validator(),
            ledger,
            Arc::new(RecordingOverlay::default()),
            Arc::new(clock.clone()),
            Arc::clone(&metrics),
        );
        driver.tracking = Some(TrackingState {
            consensus_index: 1,
            value: ConsensusValue::new(Hash256::ZERO, START - 10, 100),
        });
        Fixture {
            driver,
            clock,
            metrics,
            lcl_hash,
        }
    }

    fn register(driver: &mut HerderDriver, set: TransactionSet) -> Hash256 {
        let hash = set.contents_hash();
        driver.pending.add_tx_set(2, hash, Arc::new(set));
        hash
    }

    fn encode(hash: Hash256, close_time: u64, base_fee: u64) -> Value {
        ConsensusValue::new(hash, close_time, base_fee).to_value().unwrap()
    }

    #[test]
    fn test_value_for_tracked_slot_is_fully_validated() {
        let mut f = fixture();
        let hash = register(&mut f.driver, TransactionSet::from_transactions(f.lcl_hash, [tx("alice", 1, 10)]));
        assert_eq!(
            f.driver.validate_value(2, &encode(hash, START, 100), true),
            ValidationLevel::FullyValidated
        );
        // unknown tx set
        assert_eq!(
            f.driver.validate_value(2, &encode(Hash256::hash(b"nope"), START, 100), true),
            ValidationLevel::Invalid
        );
        // built on another ledger
        let stale = register(&mut f.driver, TransactionSet::new(Hash256::hash(b"other")));
        assert_eq!(
            f.driver.validate_value(2, &encode(stale, START, 100), true),
            ValidationLevel::Invalid
        );
        assert_eq!(f.metrics.snapshot().values_rejected, 2);
    }

    #[test]
    fn test_future_slot_is_a_protocol_violation() {
        let mut f = fixture();
        let hash = register(&mut f.driver, TransactionSet::new(f.lcl_hash));
        assert_eq!(
            f.driver.validate_value(3, &encode(hash, START, 100), true),
            ValidationLevel::Invalid
        );
        assert_eq!(f.metrics.snapshot().protocol_violations, 1);
        // past slots are tolerated
        assert_eq!(
            f.driver.validate_value(1, &encode(hash, START, 100), true),
            ValidationLevel::MaybeValid
        );

        let ballot = Ballot::new(1, encode(hash, START, 100));
        assert!(!f.driver.validate_ballot(3, &NodeId::from_seed("peer"), &ballot));
        assert_eq!(f.metrics.snapshot().protocol_violations, 2);
        assert!(f.driver.validate_ballot(2, &NodeId::from_seed("peer"), &ballot));
    }

    #[test]
    fn test_close_time_must_advance_and_not_run_ahead() {
        let mut f = fixture();
        let hash = register(&mut f.driver, TransactionSet::new(f.lcl_hash));
        assert_eq!(
            f.driver.validate_value(2, &encode(hash, START - 10, 100), true),
            ValidationLevel::Invalid
        );
        assert_eq!(
            f.driver.validate_value(2, &encode(hash, START + 61, 100), true),
            ValidationLevel::Invalid
        );
        assert_eq!(
            f.driver.validate_value(2, &encode(hash, START + 60, 100), true),
            ValidationLevel::FullyValidated
        );
    }

    #[test]
    fn test_not_tracking_is_maybe_valid() {
        let mut f = fixture();
        f.driver.tracking = None;
        let value = encode(Hash256::hash(b"whatever"), START, 100);
        assert_eq!(f.driver.validate_value(40, &value, false), ValidationLevel::MaybeValid);
        assert_eq!(
            f.driver.validate_value(40, &Value::new(b"junk".to_vec()), false),
            ValidationLevel::Invalid
        );
    }

    #[test]
    fn test_ballot_counter_budget_grows_with_time() {
        let f = fixture();
        let peer = NodeId::from_seed("peer");
        let value = encode(Hash256::ZERO, START, 100);
        // slip of 60s covers 1 + 2 + 4 + 8 + 16 = 31s but not 63s
        assert!(f.driver.validate_ballot(2, &peer, &Ballot::new(5, value.clone())));
        assert!(!f.driver.validate_ballot(2, &peer, &Ballot::new(6, value.clone())));

        f.clock.advance(Duration::from_secs(3));
        assert!(f.driver.validate_ballot(2, &peer, &Ballot::new(6, value)));
        assert_eq!(f.metrics.snapshot().ballots_rejected, 1);
    }

    #[test]
    fn test_ballot_fee_band_and_close_time() {
        let f = fixture();
        let peer = NodeId::from_seed("peer");
        let ballot = |close, fee| Ballot::new(1, encode(Hash256::ZERO, close, fee));
        assert!(f.driver.validate_ballot(2, &peer, &ballot(START, 50)));
        assert!(f.driver.validate_ballot(2, &peer, &ballot(START, 200)));
        assert!(!f.driver.validate_ballot(2, &peer, &ballot(START, 49)));
        assert!(!f.driver.validate_ballot(2, &peer, &ballot(START, 201)));
        assert!(!f.driver.validate_ballot(2, &peer, &ballot(START + 61, 100)));
    }

    #[test]
    fn test_observer_rejects_its_own_ballots() {
        let mut f = fixture();
        f.driver.config.is_validator = false;
        let ballot = Ballot::new(1, encode(Hash256::ZERO, START, 100));
        let local = f.driver.local_node;
        assert!(!f.driver.validate_ballot(2, &local, &ballot));
        assert!(f.driver.validate_ballot(2, &NodeId::from_seed("peer"), &ballot));
    }

    #[test]
    fn test_combine_candidates_takes_maxima_and_union() {
        let mut f = fixture();
        let first = register(
            &mut f.driver,
            TransactionSet::from_transactions(f.lcl_hash, [tx("alice", 1, 10), tx("alice", 2, 10)]),
        );
        let second = register(
            &mut f.driver,
            TransactionSet::from_transactions(
                f.lcl_hash,
                // alice 5 has a gap and is dropped
                [tx("alice", 1, 10), tx("bob", 1, 20), tx("alice", 5, 10)],
            ),
        );
        let other_ledger = register(
            &mut f.driver,
            TransactionSet::from_transactions(Hash256::hash(b"fork"), [tx("bob", 2, 20)]),
        );
        let candidates = BTreeSet::from([
            encode(first, 1_000, 100),
            encode(second, 1_002, 120),
            encode(other_ledger, 1_001, 110),
        ]);

        let combined = f.driver.combine_candidates(2, &candidates).unwrap();
        let combined = ConsensusValue::from_value(&combined).unwrap();
        assert_eq!(combined.base_fee, 120);
        assert_eq!(combined.close_time, 1_002);

        let set = f.driver.pending.get_tx_set(&combined.tx_set_hash).unwrap();
        let expected = TransactionSet::from_transactions(
            f.lcl_hash,
            [tx("alice", 1, 10), tx("alice", 2, 10), tx("bob", 1, 20)],
        );
        assert_eq!(set.contents_hash(), expected.contents_hash());
    }

    #[test]
    fn test_combine_candidates_without_decodable_values() {
        let mut f = fixture();
        let candidates = BTreeSet::from([Value::new(b"junk".to_vec())]);
        assert!(f.driver.combine_candidates(2, &candidates).is_none());
    }

    #[test]
    fn test_idle_nodes_are_evicted() {
        let mut f = fixture();
        f.driver.note_node_slot(NodeId::from_seed("old"), 10);
        f.driver.note_node_slot(NodeId::from_seed("new"), 300);
        f.driver.note_node_slot(NodeId::from_seed("new"), 200);
        assert_eq!(f.driver.evict_idle_nodes(100), 0);
        assert_eq!(f.driver.evict_idle_nodes(300), 1);
        assert_eq!(f.driver.node_last_slot.get(&NodeId::from_seed("new")), Some(&300));
    }
}
