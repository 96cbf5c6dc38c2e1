//! Herder counters.
//!
//! All counters are relaxed atomics so the metrics handle can be shared
//! with SCP as a [`SlotObserver`] and read from other threads while the
//! Herder runs.

use std::sync::atomic::{AtomicU64, Ordering};

use lumen_scp::{SlotEvent, SlotObserver};
use serde::Serialize;

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct HerderMetrics {
    // ===== Envelopes =====
    pub envelopes_received: Counter,
    pub envelopes_ready: Counter,
    /// Dropped before reaching SCP: out of bracket, manual close, duplicate
    /// or malformed.
    pub envelopes_discarded: Counter,
    pub envelopes_emitted: Counter,
    pub rebroadcasts: Counter,

    // ===== Validation =====
    pub values_rejected: Counter,
    pub ballots_rejected: Counter,
    /// A peer sent a statement for a slot it could not have reached.
    pub protocol_violations: Counter,

    // ===== Consensus =====
    pub values_externalized: Counter,
    pub lost_sync: Counter,
    pub nomination_rounds: Counter,
    pub ballots_bumped: Counter,
    pub heard_from_quorum: Counter,

    // ===== Transactions =====
    pub tx_received: Counter,
    pub tx_duplicate: Counter,
    pub tx_rejected: Counter,
    pub tx_evicted: Counter,
}

/// Point-in-time copy of [`HerderMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HerderMetricsSnapshot {
    pub envelopes_received: u64,
    pub envelopes_ready: u64,
    pub envelopes_discarded: u64,
    pub envelopes_emitted: u64,
    pub rebroadcasts: u64,
    pub values_rejected: u64,
    pub ballots_rejected: u64,
    pub protocol_violations: u64,
    pub values_externalized: u64,
    pub lost_sync: u64,
    pub nomination_rounds: u64,
    pub ballots_bumped: u64,
    pub heard_from_quorum: u64,
    pub tx_received: u64,
    pub tx_duplicate: u64,
    pub tx_rejected: u64,
    pub tx_evicted: u64,
}

impl HerderMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HerderMetricsSnapshot {
        HerderMetricsSnapshot {
            envelopes_received: self.envelopes_received.get(),
            envelopes_ready: self.envelopes_ready.get(),
            envelopes_discarded: self.envelopes_discarded.get(),
            envelopes_emitted: self.envelopes_emitted.get(),
            rebroadcasts: self.rebroadcasts.get(),
            values_rejected: self.values_rejected.get(),
            ballots_rejected: self.ballots_rejected.get(),
            protocol_violations: self.protocol_violations.get(),
            values_externalized: self.values_externalized.get(),
            lost_sync: self.lost_sync.get(),
            nomination_rounds: self.nomination_rounds.get(),
            ballots_bumped: self.ballots_bumped.get(),
            heard_from_quorum: self.heard_from_quorum.get(),
            tx_received: self.tx_received.get(),
            tx_duplicate: self.tx_duplicate.get(),
            tx_rejected: self.tx_rejected.get(),
            tx_evicted: self.tx_evicted.get(),
        }
    }
}

impl SlotObserver for HerderMetrics {
    fn on_slot_event(&self, _slot_index: u64, event: &SlotEvent) {
        match event {
            SlotEvent::NominationRound { .. } => self.nomination_rounds.inc(),
            SlotEvent::BallotBumped { .. } => self.ballots_bumped.inc(),
            SlotEvent::HeardFromQuorum { .. } => self.heard_from_quorum.inc(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use lumen_scp::{Ballot, Value};

    use super::*;

    #[test]
    fn test_observer_counts_slot_events() {
        let metrics = HerderMetrics::new();
        let ballot = Ballot::new(2, Value::new(vec![1]));
        metrics.on_slot_event(3, &SlotEvent::NominationRound { round: 1 });
        metrics.on_slot_event(3, &SlotEvent::NominationRound { round: 2 });
        metrics.on_slot_event(3, &SlotEvent::BallotBumped { ballot: ballot.clone() });
        metrics.on_slot_event(3, &SlotEvent::AcceptedPrepared { ballot });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.nomination_rounds, 2);
        assert_eq!(snapshot.ballots_bumped, 1);
        assert_eq!(snapshot.heard_from_quorum, 0);

        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["nomination_rounds"], 2);
    }
}
