//! The consensus coordinator.
//!
//! The [`Herder`] sits between the network, the transaction pool and SCP.
//! It decides which envelopes reach SCP and when, proposes a value for each
//! ledger, and turns externalized values into ledger closes.
//!
//! # Round lifecycle
//!
//! ```text
//! trigger_next_ledger ──nominate──▶ SCP ──externalize──▶ value_externalized
//!        ▲                                                     │
//!        └──────── Trigger timer ◀──────── ledger_closed ◀─────┘
//! ```
//!
//! Everything runs on the caller's thread. Timers are deadlines in a
//! [`crate::TimerQueue`]; the host calls [`Herder::fire_due_timers`] when
//! [`Herder::next_timer_deadline`] passes. A deferred action re-checks the
//! state it was scheduled under before doing anything, since an
//! externalize may have moved the node on in the meantime.
//!
//! # Tracking
//!
//! While tracking, only envelopes for the next slot (and up to the
//! validity bracket beyond it) are accepted, and only the next slot is fed
//! to SCP. If nothing externalizes within the stuck timeout the node drops
//! tracking and replays whatever is queued, lowest slot first, to find
//! where the network is.

use std::sync::Arc;
use std::time::Instant;

use lumen_common::{Clock, Hash256, NodeId};
use lumen_scp::{Envelope, QuorumSet, Scp, Value};
use tracing::{debug, info, trace, warn};

use crate::config::HerderConfig;
use crate::error::{HerderError, Result};
use crate::ledger::{LedgerCloseData, LedgerManager, Overlay};
use crate::metrics::HerderMetrics;
use crate::pending::{FetchRequest, PendingStats, RecvResult};
use crate::scp_driver::{HerderDriver, Nomination};
use crate::state::{HerderState, TrackingState};
use crate::timer::HerderTimer;
use crate::tx::{Transaction, TransactionSet};
use crate::tx_pool::{TransactionPool, TransactionStatus};
use crate::value::ConsensusValue;

pub struct Herder {
    scp: Scp,
    driver: HerderDriver,
}

impl Herder {
    pub fn new(
        local_node: NodeId,
        local_quorum_set: QuorumSet,
        config: HerderConfig,
        ledger: Arc<dyn LedgerManager>,
        overlay: Arc<dyn Overlay>,
        clock: Arc<dyn Clock>,
        metrics: Arc<HerderMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let mut scp = Scp::new(local_node, local_quorum_set.clone(), config.is_validator)?;
        scp.add_observer(metrics.clone());
        let driver = HerderDriver::new(
            local_node,
            local_quorum_set,
            config,
            ledger,
            overlay,
            clock,
            metrics,
        );
        Ok(Self { scp, driver })
    }

    pub fn state(&self) -> HerderState {
        if self.driver.tracking.is_some() {
            HerderState::Tracking
        } else {
            HerderState::Syncing
        }
    }

    pub fn tracking(&self) -> Option<TrackingState> {
        self.driver.tracking
    }

    /// Last slot the node saw externalize, if tracking.
    pub fn tracking_consensus_index(&self) -> Option<u64> {
        self.driver.tracking.map(|t| t.consensus_index)
    }

    /// The slot consensus is working on.
    pub fn next_consensus_ledger_index(&self) -> u64 {
        match self.driver.tracking {
            Some(tracking) => tracking.next_index(),
            None => self.driver.ledger.last_closed_ledger().ledger_seq + 1,
        }
    }

    pub fn scp(&self) -> &Scp {
        &self.scp
    }

    pub fn pool(&self) -> &TransactionPool {
        &self.driver.pool
    }

    pub fn metrics(&self) -> &Arc<HerderMetrics> {
        &self.driver.metrics
    }

    pub fn pending_stats(&self) -> PendingStats {
        self.driver.pending.stats()
    }

    pub fn get_tx_set(&self, hash: &Hash256) -> Option<Arc<TransactionSet>> {
        self.driver.pending.get_tx_set(hash)
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.driver.timers.next_deadline()
    }

    pub fn is_timer_scheduled(&self, timer: HerderTimer) -> bool {
        self.driver.timers.is_scheduled(timer)
    }

    /// Start consensus from the local last closed ledger without waiting
    /// to hear from the network.
    pub fn bootstrap(&mut self) -> Result<()> {
        if !self.driver.config.is_validator {
            return Err(HerderError::NotValidating);
        }
        let lcl = self.driver.ledger.last_closed_ledger();
        info!(ledger = lcl.ledger_seq, "bootstrapping consensus from last closed ledger");
        self.driver.tracking = Some(TrackingState {
            consensus_index: lcl.ledger_seq,
            value: ConsensusValue::new(lcl.tx_set_hash, lcl.close_time, self.driver.config.desired_base_fee),
        });
        self.driver.ledger.set_synced();
        self.driver.track_heartbeat();

        // first round starts immediately
        let now = self.driver.clock.now();
        self.driver.last_trigger = now
            .checked_sub(self.driver.config.target_round_duration)
            .unwrap_or(now);
        self.ledger_closed()
    }

    pub fn recv_transaction(&mut self, tx: Transaction) -> TransactionStatus {
        let driver = &mut self.driver;
        driver.metrics.tx_received.inc();
        let status = driver.pool.try_add(tx.clone(), driver.ledger.as_ref());
        match status {
            TransactionStatus::Pending => driver.overlay.broadcast_transaction(&tx),
            TransactionStatus::Duplicate => driver.metrics.tx_duplicate.inc(),
            TransactionStatus::Error(err) => {
                debug!(tx = %tx.full_hash().short(), source = %tx.source, error = %err, "transaction rejected");
                driver.metrics.tx_rejected.inc();
            }
        }
        status
    }

    pub fn recv_scp_envelope(&mut self, envelope: Envelope) -> Result<RecvResult> {
        self.driver.metrics.envelopes_received.inc();
        if self.driver.config.manual_close {
            trace!(slot = envelope.slot_index(), "ignoring envelope in manual close mode");
            self.driver.metrics.envelopes_discarded.inc();
            return Ok(RecvResult::Discarded);
        }

        let slot_index = envelope.slot_index();
        if let Some(tracking) = self.driver.tracking {
            let next = tracking.next_index();
            let max = next.saturating_add(self.driver.config.ledger_validity_bracket);
            if slot_index < next || slot_index > max {
                trace!(slot = slot_index, next, max, "envelope outside validity bracket");
                self.driver.metrics.envelopes_discarded.inc();
                return Ok(RecvResult::Discarded);
            }
        }

        self.driver.note_node_slot(*envelope.node_id(), slot_index);
        let result = self.driver.pending.recv_envelope(envelope);
        match &result {
            RecvResult::Ready => self.driver.metrics.envelopes_ready.inc(),
            RecvResult::Fetching(missing) => {
                for item in missing {
                    match item {
                        FetchRequest::TxSet(hash) => self.driver.overlay.request_tx_set(*hash),
                        FetchRequest::QuorumSet(hash) => self.driver.overlay.request_quorum_set(*hash),
                    }
                }
            }
            RecvResult::Duplicate | RecvResult::Discarded => {
                self.driver.metrics.envelopes_discarded.inc()
            }
        }
        self.process_scp_queue()?;
        Ok(result)
    }

    pub fn recv_quorum_set(&mut self, hash: Hash256, quorum_set: QuorumSet) -> Result<()> {
        let released = self.driver.pending.recv_quorum_set(hash, quorum_set);
        self.driver.metrics.envelopes_ready.add(released as u64);
        self.process_scp_queue()
    }

    pub fn recv_tx_set(&mut self, hash: Hash256, tx_set: Arc<TransactionSet>) -> Result<()> {
        let released = self.driver.pending.recv_tx_set(hash, tx_set);
        self.driver.metrics.envelopes_ready.add(released as u64);
        self.process_scp_queue()
    }

    /// Run every timer due at `now`. Returns how many fired.
    pub fn fire_due_timers(&mut self, now: Instant) -> Result<usize> {
        let mut fired = 0;
        for due in self.driver.timers.due(now) {
            if !self.driver.timers.claim(&due) {
                continue;
            }
            fired += 1;
            trace!(timer = %due.timer, slot = due.slot_index, "timer fired");
            match due.timer {
                HerderTimer::Trigger => self.trigger_next_ledger(due.slot_index)?,
                HerderTimer::Nomination => self.nomination_timer_expired(due.slot_index)?,
                HerderTimer::Ballot => {
                    self.scp.ballot_timer_expired(due.slot_index, &mut self.driver);
                    self.handle_externalized()?;
                }
                HerderTimer::Rebroadcast => self.rebroadcast(),
                HerderTimer::Tracking => self.lost_sync()?,
            }
        }
        Ok(fired)
    }

    /// Propose a value for `ledger_to_trigger` if it is still the next
    /// ledger to close.
    pub fn trigger_next_ledger(&mut self, ledger_to_trigger: u64) -> Result<()> {
        if self.driver.tracking.is_none() || !self.driver.ledger.is_synced() {
            debug!(ledger = ledger_to_trigger, "not triggering while out of sync");
            return Ok(());
        }

        let lcl = self.driver.ledger.last_closed_ledger();
        let mut proposed = TransactionSet::from_transactions(lcl.hash, self.driver.pool.iter().cloned());
        let invalid = proposed.trim_invalid(self.driver.ledger.as_ref());
        for tx in &invalid {
            self.driver.pool.remove(&tx.full_hash());
        }
        proposed.surge_pricing_filter(self.driver.config.max_tx_set_size);
        let tx_set_hash = proposed.contents_hash();
        let tx_count = proposed.len();
        self.driver.pending
            .add_tx_set(lcl.ledger_seq + 1, tx_set_hash, Arc::new(proposed));

        self.process_scp_queue()?;

        let Some(tracking) = self.driver.tracking else {
            return Ok(());
        };
        let slot_index = self.driver.ledger.last_closed_ledger().ledger_seq + 1;
        if ledger_to_trigger != slot_index || slot_index != tracking.next_index() {
            debug!(ledger = ledger_to_trigger, next = slot_index, "stale trigger");
            return Ok(());
        }

        let now_unix = self.driver.clock.unix_time();
        self.driver.last_trigger = self.driver.clock.now();
        self.driver.last_trigger_unix = now_unix;
        let close_time = now_unix
            .max(lcl.close_time + 1)
            .max(tracking.value.close_time + 1);
        let value = ConsensusValue::new(tx_set_hash, close_time, self.driver.config.desired_base_fee);
        info!(slot = slot_index, txs = tx_count, dropped = invalid.len(), %value, "triggering next ledger");

        let value = value.to_value()?;
        let prev_value = tracking.value.to_value()?;
        self.driver.nomination = Some(Nomination {
            slot_index,
            value: value.clone(),
            prev_value: prev_value.clone(),
        });
        self.scp.nominate(slot_index, value, &prev_value, &mut self.driver);
        self.handle_externalized()
    }

    /// Re-send the latest local envelopes for the slot last emitted on.
    pub fn rebroadcast(&mut self) {
        if self.driver.config.manual_close || self.driver.tracking.is_none() {
            return;
        }
        let Some(slot_index) = self.driver.last_emitted_slot else {
            return;
        };
        let envelopes = self.scp.latest_messages_send(slot_index);
        if envelopes.is_empty() {
            return;
        }
        trace!(slot = slot_index, count = envelopes.len(), "rebroadcasting");
        for envelope in &envelopes {
            self.driver.overlay.broadcast_envelope(envelope, true);
        }
        self.driver.metrics.rebroadcasts.inc();
        self.driver.schedule(
            HerderTimer::Rebroadcast,
            slot_index,
            self.driver.config.rebroadcast_interval,
        );
    }

    fn nomination_timer_expired(&mut self, slot_index: u64) -> Result<()> {
        let Some(nomination) = self.driver.nomination.clone() else {
            return Ok(());
        };
        if nomination.slot_index != slot_index {
            return Ok(());
        }
        self.scp.nominate_timeout(
            slot_index,
            nomination.value,
            &nomination.prev_value,
            &mut self.driver,
        );
        self.handle_externalized()
    }

    fn lost_sync(&mut self) -> Result<()> {
        let last = self.tracking_consensus_index();
        warn!(last_externalized = ?last, "lost track of consensus");
        self.driver.metrics.lost_sync.inc();
        self.driver.tracking = None;
        self.driver.timers.cancel(HerderTimer::Rebroadcast);
        self.process_scp_queue()
    }

    /// Feed queued envelopes to SCP: the next slot when tracking, otherwise
    /// the lowest ready slots until one externalizes.
    fn process_scp_queue(&mut self) -> Result<()> {
        if let Some(tracking) = self.driver.tracking {
            let next = tracking.next_index();
            self.driver.pending.erase_below(next);
            return self.process_slot(next);
        }
        for slot_index in self.driver.pending.ready_slots() {
            self.process_slot(slot_index)?;
            if self.driver.tracking.is_some() {
                break;
            }
        }
        Ok(())
    }

    fn process_slot(&mut self, slot_index: u64) -> Result<()> {
        while let Some(envelope) = self.driver.pending.pop(slot_index) {
            self.scp.receive_envelope(&envelope, &mut self.driver);
            self.handle_externalized()?;
        }
        Ok(())
    }

    fn handle_externalized(&mut self) -> Result<()> {
        while let Some((slot_index, value)) = self.driver.externalized.pop_front() {
            self.value_externalized(slot_index, &value)?;
        }
        Ok(())
    }

    fn value_externalized(&mut self, slot_index: u64, value: &Value) -> Result<()> {
        let value = ConsensusValue::from_value(value)
            .map_err(|_| HerderError::MalformedExternalizedValue { slot: slot_index })?;
        if let Some(tracking) = self.driver.tracking {
            if slot_index <= tracking.consensus_index {
                debug!(slot = slot_index, tracking = tracking.consensus_index, "already past externalized slot");
                return Ok(());
            }
        }

        self.scp.stop_nomination(slot_index, &mut self.driver);
        let driver = &mut self.driver;
        driver.metrics.values_externalized.inc();
        info!(slot = slot_index, %value, "value externalized");
        driver.timers.cancel(HerderTimer::Ballot);
        driver.nomination = None;

        driver.tracking = Some(TrackingState {
            consensus_index: slot_index,
            value,
        });
        driver.track_heartbeat();
        driver.timers.cancel(HerderTimer::Trigger);

        let tx_set = driver.pending.get_tx_set(&value.tx_set_hash);
        match &tx_set {
            Some(set) => {
                let applied = driver.pool.remove_applied(set.transactions());
                debug!(slot = slot_index, txs = set.len(), from_pool = applied, "closing ledger");
            }
            None => warn!(slot = slot_index, tx_set = %value.tx_set_hash.short(), "externalized tx set is unknown"),
        }
        driver.ledger.externalize_value(LedgerCloseData {
            ledger_seq: slot_index,
            tx_set,
            close_time: value.close_time,
            base_fee: value.base_fee,
        });

        for tx in driver.pool.tier(1) {
            driver.overlay.broadcast_transaction(tx);
        }

        let evicted_nodes = driver.evict_idle_nodes(slot_index);
        if evicted_nodes > 0 {
            debug!(slot = slot_index, nodes = evicted_nodes, "evicted idle nodes");
        }
        if let Some(below) = slot_index.checked_sub(driver.config.max_slots_to_remember) {
            if below > 0 {
                self.scp.purge_slots(below, None);
            }
        }

        let evicted = self.driver.pool.shift();
        if !evicted.is_empty() {
            debug!(slot = slot_index, count = evicted.len(), "evicted aged transactions");
            self.driver.metrics.tx_evicted.add(evicted.len() as u64);
        }
        self.ledger_closed()
    }

    fn ledger_closed(&mut self) -> Result<()> {
        self.driver.timers.cancel(HerderTimer::Trigger);
        let last = self
            .tracking_consensus_index()
            .unwrap_or_else(|| self.driver.ledger.last_closed_ledger().ledger_seq);
        self.driver.pending.slot_closed(last);
        self.driver.overlay.ledger_closed(last);

        let next = self.next_consensus_ledger_index();
        self.process_scp_queue()?;
        if self.next_consensus_ledger_index() != next {
            // a later slot externalized while draining the queue
            return Ok(());
        }

        if !self.driver.config.is_validator {
            return Ok(());
        }
        if !self.driver.ledger.is_synced() {
            debug!(next, "not triggering: ledger not synced");
            return Ok(());
        }
        if self.driver.config.manual_close {
            return Ok(());
        }

        let elapsed = self
            .driver
            .clock
            .now()
            .saturating_duration_since(self.driver.last_trigger);
        let delay = self
            .driver
            .config
            .target_round_duration
            .saturating_sub(elapsed);
        trace!(next, ?delay, "scheduling trigger");
        self.driver.schedule(HerderTimer::Trigger, next, delay);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use lumen_common::ManualClock;
    use lumen_scp::{Ballot, Pledges, PrepareStatement, Statement};

    use super::*;
    use crate::scp_driver::tests::{RecordingOverlay, START};
    use crate::tx::tests::{tx, AccountsLedger};

    fn herder(config: HerderConfig, quorum_set: Option<QuorumSet>) -> (Herder, ManualClock) {
        let local = NodeId::from_seed("local");
        let clock = ManualClock::new(START);
        let ledger = Arc::new(AccountsLedger::with(&[("alice", 1_000, 0)]));
        let herder = Herder::new(
            local,
            quorum_set.unwrap_or_else(|| QuorumSet::singleton(local)),
            config,
            ledger,
            Arc::new(RecordingOverlay::default()),
            Arc::new(clock.clone()),
            Arc::new(HerderMetrics::new()),
        )
        .unwrap();
        (herder, clock)
    }

    fn prepare_from(node: &str, slot_index: u64) -> Envelope {
        Envelope::new(Statement {
            node_id: NodeId::from_seed(node),
            slot_index,
            pledges: Pledges::Prepare(PrepareStatement {
                quorum_set_hash: Hash256::hash(b"unknown qset"),
                ballot: Ballot::new(
                    1,
                    ConsensusValue::new(Hash256::hash(b"set"), START, 100)
                        .to_value()
                        .unwrap(),
                ),
                prepared: None,
                prepared_prime: None,
                n_c: 0,
                n_h: 0,
            }),
        })
    }

    #[test]
    fn test_observer_cannot_bootstrap() {
        let (mut herder, _) = herder(HerderConfig::default(), None);
        assert!(matches!(herder.bootstrap(), Err(HerderError::NotValidating)));
        assert_eq!(herder.state(), HerderState::Syncing);
    }

    #[test]
    fn test_bootstrap_tracks_lcl_and_schedules_trigger() {
        let (mut herder, clock) = herder(HerderConfig::validator(), None);
        herder.bootstrap().unwrap();
        assert_eq!(herder.state(), HerderState::Tracking);
        assert_eq!(herder.tracking_consensus_index(), Some(1));
        assert_eq!(herder.next_consensus_ledger_index(), 2);
        assert!(herder.is_timer_scheduled(HerderTimer::Trigger));
        assert_eq!(herder.next_timer_deadline(), Some(clock.now()));
    }

    #[test]
    fn test_envelopes_outside_bracket_are_dropped() {
        let (mut herder, _) = herder(HerderConfig::validator(), None);
        herder.bootstrap().unwrap();

        assert_eq!(herder.recv_scp_envelope(prepare_from("peer", 1)).unwrap(), RecvResult::Discarded);
        assert_eq!(herder.recv_scp_envelope(prepare_from("peer", 103)).unwrap(), RecvResult::Discarded);
        assert!(matches!(
            herder.recv_scp_envelope(prepare_from("peer", 102)).unwrap(),
            RecvResult::Fetching(_)
        ));
        let snapshot = herder.metrics().snapshot();
        assert_eq!(snapshot.envelopes_received, 3);
        assert_eq!(snapshot.envelopes_discarded, 2);
    }

    #[test]
    fn test_manual_close_ignores_envelopes() {
        let config = HerderConfig {
            manual_close: true,
            ..HerderConfig::validator()
        };
        let (mut herder, _) = herder(config, None);
        assert_eq!(herder.recv_scp_envelope(prepare_from("peer", 2)).unwrap(), RecvResult::Discarded);
        assert_eq!(herder.pending_stats().received, 0);
    }

    #[test]
    fn test_stale_trigger_does_not_nominate() {
        let (mut herder, _) = herder(HerderConfig::validator(), None);
        herder.bootstrap().unwrap();
        herder.trigger_next_ledger(7).unwrap();
        assert_eq!(herder.tracking_consensus_index(), Some(1));
        assert_eq!(herder.scp().slot_count(), 0);
    }

    #[test]
    fn test_lost_sync_when_nothing_externalizes() {
        let local = NodeId::from_seed("local");
        let quorum = QuorumSet::new(2, vec![local, NodeId::from_seed("silent")]);
        let (mut herder, clock) = herder(HerderConfig::validator(), Some(quorum));
        herder.bootstrap().unwrap();
        herder.fire_due_timers(clock.now()).unwrap();
        assert_eq!(herder.state(), HerderState::Tracking);

        clock.advance(Duration::from_secs(36));
        herder.fire_due_timers(clock.now()).unwrap();
        assert_eq!(herder.state(), HerderState::Syncing);
        assert_eq!(herder.metrics().snapshot().lost_sync, 1);
    }

    #[test]
    fn test_transaction_status_is_metered() {
        let (mut herder, _) = herder(HerderConfig::validator(), None);
        assert_eq!(herder.recv_transaction(tx("alice", 1, 10)), TransactionStatus::Pending);
        assert_eq!(herder.recv_transaction(tx("alice", 1, 10)), TransactionStatus::Duplicate);
        assert!(matches!(
            herder.recv_transaction(tx("nobody", 1, 10)),
            TransactionStatus::Error(_)
        ));
        let snapshot = herder.metrics().snapshot();
        assert_eq!((snapshot.tx_received, snapshot.tx_duplicate, snapshot.tx_rejected), (3, 1, 1));
    }
}
