//! Multi-node SCP simulation.
//!
//! Several [`Scp`] instances are wired together through an in-memory
//! network that delivers every emitted envelope to every other node until
//! the network goes quiet.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use lumen_common::{Hash256, NodeId};
use lumen_scp::{
    hash_quorum_set, Envelope, QuorumSet, Scp, ScpDriver, SlotEvent, SlotObserver, SlotPhase,
    TimerKind, ValidationLevel, Value,
};
use parking_lot::Mutex;

const SLOT: u64 = 1;

fn prev() -> Value {
    Value::new(b"prev".to_vec())
}

#[derive(Default)]
struct SimulationDriver {
    quorum_sets: HashMap<Hash256, QuorumSet>,
    outbox: Vec<Envelope>,
    externalized: HashMap<u64, Value>,
    timers: HashMap<TimerKind, Duration>,
    rejected: BTreeSet<Value>,
}

impl ScpDriver for SimulationDriver {
    fn validate_value(&self, _slot_index: u64, value: &Value, _nomination: bool) -> ValidationLevel {
        if self.rejected.contains(value) {
            ValidationLevel::Invalid
        } else {
            ValidationLevel::FullyValidated
        }
    }

    fn combine_candidates(&mut self, _slot_index: u64, candidates: &BTreeSet<Value>) -> Option<Value> {
        candidates.iter().next_back().cloned()
    }

    fn get_quorum_set(&self, hash: &Hash256) -> Option<QuorumSet> {
        self.quorum_sets.get(hash).cloned()
    }

    fn emit_envelope(&mut self, envelope: &Envelope) {
        self.outbox.push(envelope.clone());
    }

    fn value_externalized(&mut self, slot_index: u64, value: &Value) {
        let previous = self.externalized.insert(slot_index, value.clone());
        assert!(previous.is_none(), "slot {slot_index} externalized twice");
    }

    fn setup_timer(&mut self, _slot_index: u64, kind: TimerKind, timeout: Duration) {
        self.timers.insert(kind, timeout);
    }

    fn stop_timer(&mut self, _slot_index: u64, kind: TimerKind) {
        self.timers.remove(&kind);
    }
}

struct SimNode {
    scp: Scp,
    driver: SimulationDriver,
}

struct Network {
    nodes: Vec<SimNode>,
    proposals: Vec<Option<Value>>,
}

impl Network {
    /// `count` nodes that all trust `threshold` of the whole set.
    fn new(count: usize, threshold: u32) -> Self {
        let ids: Vec<NodeId> = (0..count)
            .map(|i| NodeId::from_seed(&format!("sim-{i}")))
            .collect();
        let qset = QuorumSet::new(threshold, ids.clone());
        let qset_hash = hash_quorum_set(&qset);
        let nodes = ids
            .iter()
            .map(|id| {
                let mut driver = SimulationDriver::default();
                driver.quorum_sets.insert(qset_hash, qset.clone());
                SimNode {
                    scp: Scp::new(*id, qset.clone(), true).unwrap(),
                    driver,
                }
            })
            .collect();
        Self {
            nodes,
            proposals: vec![None; count],
        }
    }

    fn nominate(&mut self, node: usize, value: &Value) {
        self.proposals[node] = Some(value.clone());
        let n = &mut self.nodes[node];
        n.scp.nominate(SLOT, value.clone(), &prev(), &mut n.driver);
    }

    /// Fire every armed timer on nodes that have not externalized yet.
    fn fire_timers(&mut self) {
        for (node, proposal) in self.nodes.iter_mut().zip(&self.proposals) {
            if node.scp.is_slot_externalized(SLOT) {
                continue;
            }
            if node.driver.timers.remove(&TimerKind::Nomination).is_some() {
                if let Some(value) = proposal {
                    node.scp
                        .nominate_timeout(SLOT, value.clone(), &prev(), &mut node.driver);
                }
            }
            if node.driver.timers.remove(&TimerKind::Ballot).is_some() {
                node.scp.ballot_timer_expired(SLOT, &mut node.driver);
            }
        }
    }

    /// Alternate message delivery and timeouts until `nodes` externalized.
    fn run_until_externalized(&mut self, nodes: std::ops::Range<usize>) {
        for _ in 0..50 {
            self.run();
            if nodes.clone().all(|i| self.nodes[i].scp.is_slot_externalized(SLOT)) {
                return;
            }
            self.fire_timers();
        }
        panic!("nodes did not externalize");
    }

    /// Deliver messages until no node has anything left to say.
    fn run(&mut self) {
        for _ in 0..1000 {
            let mut pending = Vec::new();
            for (i, node) in self.nodes.iter_mut().enumerate() {
                pending.extend(node.driver.outbox.drain(..).map(|env| (i, env)));
            }
            if pending.is_empty() {
                return;
            }
            for (from, envelope) in pending {
                for (to, node) in self.nodes.iter_mut().enumerate() {
                    if to != from {
                        node.scp.receive_envelope(&envelope, &mut node.driver);
                    }
                }
            }
        }
        panic!("network did not go quiet");
    }

    fn externalized(&self) -> Vec<Option<Value>> {
        self.nodes
            .iter()
            .map(|n| n.scp.get_externalized_value(SLOT))
            .collect()
    }
}

#[test]
fn test_single_node_externalizes_on_nominate() {
    let mut net = Network::new(1, 1);
    let value = Value::new(b"solo".to_vec());
    net.nominate(0, &value);
    assert_eq!(net.externalized(), vec![Some(value.clone())]);
    assert_eq!(net.nodes[0].driver.externalized.get(&SLOT), Some(&value));
    assert_eq!(net.nodes[0].scp.slot_phase(SLOT), Some(SlotPhase::Externalized));
}

#[test]
fn test_four_nodes_agree_on_same_value() {
    let mut net = Network::new(4, 3);
    let value = Value::new(b"block".to_vec());
    for i in 0..4 {
        net.nominate(i, &value);
    }
    net.run_until_externalized(0..4);
    assert!(net.externalized().iter().all(|v| v.as_ref() == Some(&value)));
}

#[test]
fn test_four_nodes_agree_on_one_of_different_values() {
    let mut net = Network::new(4, 3);
    let values: Vec<Value> = (0..4u8).map(|i| Value::new(vec![b'v', i])).collect();
    for (i, value) in values.iter().enumerate() {
        net.nominate(i, value);
    }
    net.run_until_externalized(0..4);

    let externalized = net.externalized();
    let first = externalized[0].clone().expect("node 0 did not externalize");
    assert!(values.contains(&first));
    assert!(externalized.iter().all(|v| v.as_ref() == Some(&first)));
}

#[test]
fn test_three_of_four_progress_without_one_node() {
    let mut net = Network::new(4, 3);
    let value = Value::new(b"partial".to_vec());
    // node 3 never proposes a value; the rest still form a quorum
    for i in 0..3 {
        net.nominate(i, &value);
    }
    net.run_until_externalized(0..3);
    let externalized = net.externalized();
    for v in &externalized[..3] {
        assert_eq!(v.as_ref(), Some(&value));
    }
}

#[test]
fn test_invalid_value_never_externalizes() {
    let mut net = Network::new(2, 2);
    let bad = Value::new(b"bad".to_vec());
    for node in &mut net.nodes {
        node.driver.rejected.insert(bad.clone());
    }
    net.nominate(0, &bad);
    net.nominate(1, &bad);
    net.run();
    assert_eq!(net.externalized(), vec![None, None]);
}

#[derive(Default)]
struct RecordingObserver {
    events: Mutex<Vec<(u64, &'static str)>>,
}

impl SlotObserver for RecordingObserver {
    fn on_slot_event(&self, slot_index: u64, event: &SlotEvent) {
        self.events.lock().push((slot_index, event.name()));
    }
}

#[test]
fn test_observer_sees_transitions_in_order() {
    let mut net = Network::new(1, 1);
    let observer = Arc::new(RecordingObserver::default());
    net.nodes[0].scp.add_observer(observer.clone());
    net.nominate(0, &Value::new(b"watched".to_vec()));

    let names: Vec<&str> = observer.events.lock().iter().map(|(_, n)| *n).collect();
    let position = |name: &str| names.iter().position(|n| *n == name);
    let round = position("nomination_round").expect("no nomination round");
    let started = position("ballot_started").expect("no ballot");
    let externalized = position("externalized").expect("no externalize");
    assert!(round < started && started < externalized);
    assert!(observer.events.lock().iter().all(|(slot, _)| *slot == SLOT));
}

#[test]
fn test_stopped_nomination_ignores_timeouts() {
    let mut net = Network::new(2, 2);
    let value = Value::new(b"lonely".to_vec());
    net.nominate(0, &value);
    let node = &mut net.nodes[0];
    assert_eq!(node.scp.nomination_round(SLOT), 1);
    assert!(node.driver.timers.contains_key(&TimerKind::Nomination));

    node.scp.stop_nomination(SLOT, &mut node.driver);
    assert!(!node.driver.timers.contains_key(&TimerKind::Nomination));
    assert!(!node.scp.nominate_timeout(SLOT, value.clone(), &prev(), &mut node.driver));
    assert!(!node.scp.nominate(SLOT, value, &prev(), &mut node.driver));
    assert_eq!(node.scp.nomination_round(SLOT), 1);
}
