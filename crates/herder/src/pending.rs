//! Envelopes waiting to be processed.
//!
//! An SCP envelope can only be handed to SCP once the quorum set it cites
//! and the transaction set of every value it mentions are known locally.
//! Until then it waits here, in the `fetching` state, while the Herder asks
//! peers for the missing pieces. When the last piece arrives the envelope
//! moves to `ready`, and the Herder pops ready envelopes slot by slot.
//!
//! The store is also the node's content-addressed cache of quorum sets and
//! transaction sets. It is the only owner of those payloads; envelopes and
//! consensus values refer to them by hash. A payload stays cached while a
//! live slot references it: through a waiting envelope, an envelope already
//! handed to SCP, or a set the local node proposed for that slot with
//! [`PendingEnvelopes::add_tx_set`]. Only unreferenced entries are evicted.
//! Transaction sets from peers are accepted only when a waiting envelope
//! asked for them.
//!
//! Per slot, every envelope hash is remembered as processed or discarded
//! so a re-sent envelope is recognized as a duplicate. Slots below
//! [`PendingEnvelopes::erase_below`]'s bound are forgotten and never
//! re-admitted.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use lumen_common::Hash256;
use lumen_scp::{hash_quorum_set, is_quorum_set_sane, Envelope, QuorumSet};
use tracing::{debug, trace};

use crate::tx::TransactionSet;
use crate::value::ConsensusValue;

pub const DEFAULT_MAX_CACHED_QUORUM_SETS: usize = 100;
pub const DEFAULT_MAX_CACHED_TX_SETS: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingConfig {
    pub max_quorum_sets: usize,
    pub max_tx_sets: usize,
}

impl Default for PendingConfig {
    fn default() -> Self {
        Self {
            max_quorum_sets: DEFAULT_MAX_CACHED_QUORUM_SETS,
            max_tx_sets: DEFAULT_MAX_CACHED_TX_SETS,
        }
    }
}

/// Something an envelope is waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchRequest {
    TxSet(Hash256),
    QuorumSet(Hash256),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvResult {
    /// All dependencies are known; the envelope can be popped.
    Ready,
    /// The envelope waits for these items.
    Fetching(Vec<FetchRequest>),
    Duplicate,
    /// Malformed, for an erased slot, or citing an insane quorum set.
    Discarded,
}

/// Cumulative counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingStats {
    pub received: u64,
    pub ready: u64,
    pub fetching: u64,
    pub duplicate: u64,
    pub discarded: u64,
    pub tx_sets_received: u64,
    /// Peer transaction sets no waiting envelope asked for.
    pub tx_sets_unsolicited: u64,
    pub quorum_sets_received: u64,
}

#[derive(Debug, Default)]
struct SlotEnvelopes {
    discarded: HashSet<Hash256>,
    /// Envelopes handed out or queued as ready.
    processed: HashSet<Hash256>,
    fetching: HashMap<Hash256, Envelope>,
    ready: VecDeque<Envelope>,
    /// Quorum and transaction sets cited by admitted envelopes or proposed
    /// locally. Kept cached until the slot is erased.
    referenced: HashSet<Hash256>,
}

/// Insertion-ordered cache.
#[derive(Debug)]
struct Cache<T> {
    entries: HashMap<Hash256, T>,
    order: VecDeque<Hash256>,
    capacity: usize,
}

impl<T> Cache<T> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, hash: &Hash256) -> Option<&T> {
        self.entries.get(hash)
    }

    fn contains(&self, hash: &Hash256) -> bool {
        self.entries.contains_key(hash)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    /// Insert, then evict the oldest entries not in `keep` until the cache
    /// fits its capacity or nothing else can go.
    fn insert(&mut self, hash: Hash256, value: T, keep: &HashSet<Hash256>) {
        if self.entries.insert(hash, value).is_none() {
            self.order.push_back(hash);
        }
        while self.entries.len() > self.capacity {
            let Some(pos) = self.order.iter().position(|h| !keep.contains(h) && *h != hash) else {
                break;
            };
            if let Some(evicted) = self.order.remove(pos) {
                self.entries.remove(&evicted);
                trace!(hash = %evicted.short(), "evicted cache entry");
            }
        }
    }

    /// Evict unreferenced entries left over capacity once pins are released.
    fn trim(&mut self, keep: &HashSet<Hash256>) {
        while self.entries.len() > self.capacity {
            let Some(pos) = self.order.iter().position(|h| !keep.contains(h)) else {
                break;
            };
            if let Some(evicted) = self.order.remove(pos) {
                self.entries.remove(&evicted);
                trace!(hash = %evicted.short(), "evicted cache entry");
            }
        }
    }
}

pub struct PendingEnvelopes {
    slots: BTreeMap<u64, SlotEnvelopes>,
    quorum_sets: Cache<QuorumSet>,
    tx_sets: Cache<Arc<TransactionSet>>,
    local_quorum_set_hash: Hash256,
    erased_below: u64,
    stats: PendingStats,
}

impl PendingEnvelopes {
    /// The local quorum set is cached up front and never evicted.
    pub fn new(config: PendingConfig, local_quorum_set: QuorumSet) -> Self {
        let local_quorum_set_hash = hash_quorum_set(&local_quorum_set);
        let mut quorum_sets = Cache::new(config.max_quorum_sets.max(1));
        quorum_sets.insert(local_quorum_set_hash, local_quorum_set, &HashSet::new());
        Self {
            slots: BTreeMap::new(),
            quorum_sets,
            tx_sets: Cache::new(config.max_tx_sets.max(1)),
            local_quorum_set_hash,
            erased_below: 0,
            stats: PendingStats::default(),
        }
    }

    pub fn recv_envelope(&mut self, envelope: Envelope) -> RecvResult {
        self.stats.received += 1;
        let slot_index = envelope.slot_index();
        if slot_index < self.erased_below {
            self.stats.discarded += 1;
            return RecvResult::Discarded;
        }

        let hash = envelope.hash();
        let missing = self.missing(&envelope);
        let slot = self.slots.entry(slot_index).or_default();
        if slot.processed.contains(&hash)
            || slot.discarded.contains(&hash)
            || slot.fetching.contains_key(&hash)
        {
            self.stats.duplicate += 1;
            return RecvResult::Duplicate;
        }

        match missing {
            None => {
                debug!(slot = slot_index, node = %envelope.node_id(), "discarding malformed envelope");
                slot.discarded.insert(hash);
                self.stats.discarded += 1;
                RecvResult::Discarded
            }
            Some(missing) if missing.is_empty() => {
                slot.processed.insert(hash);
                slot.referenced.extend(dependencies(&envelope));
                slot.ready.push_back(envelope);
                self.stats.ready += 1;
                RecvResult::Ready
            }
            Some(missing) => {
                trace!(slot = slot_index, missing = missing.len(), "envelope waiting for dependencies");
                slot.fetching.insert(hash, envelope);
                self.stats.fetching += 1;
                RecvResult::Fetching(missing)
            }
        }
    }

    /// Cache a quorum set fetched from a peer. Returns how many envelopes
    /// became ready.
    pub fn recv_quorum_set(&mut self, hash: Hash256, quorum_set: QuorumSet) -> usize {
        if hash_quorum_set(&quorum_set) != hash {
            debug!(hash = %hash.short(), "quorum set does not match its hash");
            return 0;
        }
        if !is_quorum_set_sane(&quorum_set) {
            debug!(hash = %hash.short(), "discarding envelopes citing insane quorum set");
            self.discard_fetching(|env| env.statement.quorum_set_hash() == hash);
            return 0;
        }
        self.stats.quorum_sets_received += 1;
        let keep = self.referenced_hashes();
        self.quorum_sets.insert(hash, quorum_set, &keep);
        self.recheck_fetching()
    }

    /// Cache a transaction set fetched from a peer. Sets no waiting
    /// envelope cites are dropped. Returns how many envelopes became ready.
    pub fn recv_tx_set(&mut self, hash: Hash256, tx_set: Arc<TransactionSet>) -> usize {
        if tx_set.contents_hash() != hash {
            debug!(hash = %hash.short(), "transaction set does not match its hash");
            return 0;
        }
        if !self.tx_sets.contains(&hash) && !self.is_awaited(&hash) {
            trace!(hash = %hash.short(), "dropping unsolicited transaction set");
            self.stats.tx_sets_unsolicited += 1;
            return 0;
        }
        self.stats.tx_sets_received += 1;
        let keep = self.referenced_hashes();
        self.tx_sets.insert(hash, tx_set, &keep);
        self.recheck_fetching()
    }

    /// Cache a transaction set the local node built for `slot_index`, as a
    /// nomination or a combined candidate. It stays cached until the slot is
    /// erased. Returns how many envelopes became ready.
    pub fn add_tx_set(&mut self, slot_index: u64, hash: Hash256, tx_set: Arc<TransactionSet>) -> usize {
        if tx_set.contents_hash() != hash {
            debug!(hash = %hash.short(), "transaction set does not match its hash");
            return 0;
        }
        if slot_index >= self.erased_below {
            self.slots.entry(slot_index).or_default().referenced.insert(hash);
        }
        let keep = self.referenced_hashes();
        self.tx_sets.insert(hash, tx_set, &keep);
        self.recheck_fetching()
    }

    pub fn get_tx_set(&self, hash: &Hash256) -> Option<Arc<TransactionSet>> {
        self.tx_sets.get(hash).cloned()
    }

    pub fn get_quorum_set(&self, hash: &Hash256) -> Option<QuorumSet> {
        self.quorum_sets.get(hash).cloned()
    }

    /// Next ready envelope for `slot_index`, in arrival order.
    pub fn pop(&mut self, slot_index: u64) -> Option<Envelope> {
        self.slots.get_mut(&slot_index)?.ready.pop_front()
    }

    /// Slots with at least one ready envelope, ascending.
    pub fn ready_slots(&self) -> Vec<u64> {
        self.slots
            .iter()
            .filter(|(_, slot)| !slot.ready.is_empty())
            .map(|(index, _)| *index)
            .collect()
    }

    /// Forget every slot below `slot_index`. Envelopes for those slots are
    /// discarded from now on.
    pub fn erase_below(&mut self, slot_index: u64) {
        self.erased_below = self.erased_below.max(slot_index);
        let floor = self.erased_below;
        self.slots.retain(|index, _| *index >= floor);
        let keep = self.referenced_hashes();
        self.tx_sets.trim(&keep);
        self.quorum_sets.trim(&keep);
    }

    /// `slot_index` closed: stop waiting on dependencies for it.
    pub fn slot_closed(&mut self, slot_index: u64) {
        if let Some(slot) = self.slots.get_mut(&slot_index) {
            let abandoned: Vec<Hash256> = slot.fetching.drain().map(|(hash, _)| hash).collect();
            if !abandoned.is_empty() {
                trace!(slot = slot_index, count = abandoned.len(), "abandoned fetching envelopes");
            }
            slot.discarded.extend(abandoned);
        }
    }

    pub fn stats(&self) -> PendingStats {
        self.stats
    }

    pub fn cached_tx_sets(&self) -> usize {
        self.tx_sets.len()
    }

    pub fn cached_quorum_sets(&self) -> usize {
        self.quorum_sets.len()
    }

    /// Dependencies of `envelope` not yet cached, or `None` if one of its
    /// values does not decode.
    fn missing(&self, envelope: &Envelope) -> Option<Vec<FetchRequest>> {
        let mut missing = Vec::new();
        let qset_hash = envelope.statement.quorum_set_hash();
        if !self.quorum_sets.contains(&qset_hash) {
            missing.push(FetchRequest::QuorumSet(qset_hash));
        }
        for value in envelope.statement.values() {
            let value = ConsensusValue::from_value(&value).ok()?;
            let request = FetchRequest::TxSet(value.tx_set_hash);
            if !self.tx_sets.contains(&value.tx_set_hash) && !missing.contains(&request) {
                missing.push(request);
            }
        }
        Some(missing)
    }

    /// Whether a waiting envelope cites `hash`.
    fn is_awaited(&self, hash: &Hash256) -> bool {
        self.slots
            .values()
            .flat_map(|slot| slot.fetching.values())
            .any(|envelope| dependencies(envelope).any(|h| h == *hash))
    }

    /// Everything a live slot still needs, plus the local quorum set.
    fn referenced_hashes(&self) -> HashSet<Hash256> {
        let mut keep = HashSet::from([self.local_quorum_set_hash]);
        for slot in self.slots.values() {
            keep.extend(slot.referenced.iter().copied());
            for envelope in slot.fetching.values() {
                keep.extend(dependencies(envelope));
            }
        }
        keep
    }

    fn recheck_fetching(&mut self) -> usize {
        let mut moved = Vec::new();
        for (index, slot) in &self.slots {
            for (hash, envelope) in &slot.fetching {
                if self.missing(envelope).is_some_and(|m| m.is_empty()) {
                    moved.push((*index, *hash));
                }
            }
        }
        for (index, hash) in &moved {
            if let Some(slot) = self.slots.get_mut(index) {
                if let Some(envelope) = slot.fetching.remove(hash) {
                    slot.processed.insert(*hash);
                    slot.referenced.extend(dependencies(&envelope));
                    slot.ready.push_back(envelope);
                    self.stats.ready += 1;
                }
            }
        }
        moved.len()
    }

    fn discard_fetching(&mut self, matches: impl Fn(&Envelope) -> bool) {
        for slot in self.slots.values_mut() {
            let doomed: Vec<Hash256> = slot
                .fetching
                .iter()
                .filter(|(_, env)| matches(env))
                .map(|(hash, _)| *hash)
                .collect();
            for hash in doomed {
                slot.fetching.remove(&hash);
                slot.discarded.insert(hash);
                self.stats.discarded += 1;
            }
        }
    }
}

/// The quorum set and transaction sets an envelope cites. Values that do
/// not decode contribute nothing.
fn dependencies(envelope: &Envelope) -> impl Iterator<Item = Hash256> {
    let tx_sets: Vec<Hash256> = envelope
        .statement
        .values()
        .iter()
        .filter_map(|v| ConsensusValue::from_value(v).ok())
        .map(|v| v.tx_set_hash)
        .collect();
    std::iter::once(envelope.statement.quorum_set_hash()).chain(tx_sets)
}

#[cfg(test)]
mod tests {
    use lumen_common::NodeId;
    use lumen_scp::{Ballot, Pledges, PrepareStatement, Statement, Value};

    use super::*;

    fn node(seed: &str) -> NodeId {
        NodeId::from_seed(seed)
    }

    fn qset() -> QuorumSet {
        QuorumSet::new(1, vec![node("a"), node("b")])
    }

    fn tx_set(tag: &str) -> Arc<TransactionSet> {
        Arc::new(TransactionSet::new(Hash256::hash(tag.as_bytes())))
    }

    fn value_for(set: &TransactionSet, close_time: u64) -> Value {
        ConsensusValue::new(set.contents_hash(), close_time, 100)
            .to_value()
            .unwrap()
    }

    fn prepare(slot: u64, from: &str, qset_hash: Hash256, value: Value) -> Envelope {
        Envelope::new(Statement {
            node_id: node(from),
            slot_index: slot,
            pledges: Pledges::Prepare(PrepareStatement {
                quorum_set_hash: qset_hash,
                ballot: Ballot::new(1, value),
                prepared: None,
                prepared_prime: None,
                n_c: 0,
                n_h: 0,
            }),
        })
    }

    fn store() -> PendingEnvelopes {
        PendingEnvelopes::new(PendingConfig::default(), qset())
    }

    #[test]
    fn test_envelope_waits_for_tx_set_then_becomes_ready() {
        let mut pending = store();
        let set = tx_set("one");
        let env = prepare(5, "b", hash_quorum_set(&qset()), value_for(&set, 10));

        assert_eq!(
            pending.recv_envelope(env.clone()),
            RecvResult::Fetching(vec![FetchRequest::TxSet(set.contents_hash())])
        );
        assert!(pending.ready_slots().is_empty());
        assert_eq!(pending.recv_envelope(env.clone()), RecvResult::Duplicate);

        assert_eq!(pending.recv_tx_set(set.contents_hash(), set), 1);
        assert_eq!(pending.ready_slots(), vec![5]);
        assert_eq!(pending.pop(5), Some(env.clone()));
        assert_eq!(pending.pop(5), None);
        assert_eq!(pending.recv_envelope(env), RecvResult::Duplicate);
    }

    #[test]
    fn test_unknown_quorum_set_is_requested() {
        let mut pending = store();
        let set = tx_set("one");
        pending.add_tx_set(5, set.contents_hash(), Arc::clone(&set));
        let remote = QuorumSet::new(1, vec![node("c")]);
        let env = prepare(5, "c", hash_quorum_set(&remote), value_for(&set, 10));

        assert_eq!(
            pending.recv_envelope(env),
            RecvResult::Fetching(vec![FetchRequest::QuorumSet(hash_quorum_set(&remote))])
        );
        // wrong hash is ignored
        assert_eq!(pending.recv_quorum_set(Hash256::ZERO, remote.clone()), 0);
        assert_eq!(pending.recv_quorum_set(hash_quorum_set(&remote), remote), 1);
    }

    #[test]
    fn test_insane_quorum_set_discards_waiting_envelopes() {
        let mut pending = store();
        let set = tx_set("one");
        pending.add_tx_set(5, set.contents_hash(), Arc::clone(&set));
        let insane = QuorumSet::new(3, vec![node("c")]);
        let env = prepare(5, "c", hash_quorum_set(&insane), value_for(&set, 10));
        pending.recv_envelope(env.clone());

        assert_eq!(pending.recv_quorum_set(hash_quorum_set(&insane), insane.clone()), 0);
        assert!(pending.get_quorum_set(&hash_quorum_set(&insane)).is_none());
        assert_eq!(pending.stats().discarded, 1);
        assert_eq!(pending.recv_envelope(env), RecvResult::Duplicate);
    }

    #[test]
    fn test_undecodable_value_is_discarded() {
        let mut pending = store();
        let env = prepare(5, "b", hash_quorum_set(&qset()), Value::new(b"garbage".to_vec()));
        assert_eq!(pending.recv_envelope(env), RecvResult::Discarded);
    }

    #[test]
    fn test_ready_slots_ascend() {
        let mut pending = store();
        let set = tx_set("one");
        pending.add_tx_set(3, set.contents_hash(), Arc::clone(&set));
        let qset_hash = hash_quorum_set(&qset());
        for slot in [9, 3, 7] {
            pending.recv_envelope(prepare(slot, "b", qset_hash, value_for(&set, slot)));
        }
        assert_eq!(pending.ready_slots(), vec![3, 7, 9]);
    }

    #[test]
    fn test_erase_below_is_idempotent_and_final() {
        let mut pending = store();
        let set = tx_set("one");
        pending.add_tx_set(1, set.contents_hash(), Arc::clone(&set));
        let qset_hash = hash_quorum_set(&qset());
        for slot in 1..=6 {
            pending.recv_envelope(prepare(slot, "b", qset_hash, value_for(&set, slot)));
        }

        pending.erase_below(4);
        let once = pending.ready_slots();
        pending.erase_below(4);
        assert_eq!(pending.ready_slots(), once);
        assert_eq!(once, vec![4, 5, 6]);

        let stale = prepare(2, "a", qset_hash, value_for(&set, 99));
        assert_eq!(pending.recv_envelope(stale), RecvResult::Discarded);
        // a lower bound never lowers the floor
        pending.erase_below(1);
        assert_eq!(
            pending.recv_envelope(prepare(3, "a", qset_hash, value_for(&set, 98))),
            RecvResult::Discarded
        );
    }

    #[test]
    fn test_slot_closed_abandons_fetching() {
        let mut pending = store();
        let set = tx_set("late");
        let env = prepare(5, "b", hash_quorum_set(&qset()), value_for(&set, 10));
        pending.recv_envelope(env);
        pending.slot_closed(5);
        assert_eq!(pending.recv_tx_set(set.contents_hash(), set), 0);
        assert!(pending.ready_slots().is_empty());
    }

    #[test]
    fn test_cache_eviction_spares_referenced_sets() {
        let mut pending = PendingEnvelopes::new(
            PendingConfig {
                max_quorum_sets: 4,
                max_tx_sets: 2,
            },
            qset(),
        );
        let wanted = tx_set("wanted");
        let missing = tx_set("missing");
        pending.add_tx_set(5, wanted.contents_hash(), Arc::clone(&wanted));

        // waits on `missing` while citing `wanted`
        let env = Envelope::new(Statement {
            node_id: node("b"),
            slot_index: 5,
            pledges: Pledges::Prepare(PrepareStatement {
                quorum_set_hash: hash_quorum_set(&qset()),
                ballot: Ballot::new(2, value_for(&missing, 10)),
                prepared: Some(Ballot::new(1, value_for(&wanted, 9))),
                prepared_prime: None,
                n_c: 0,
                n_h: 0,
            }),
        });
        assert!(matches!(pending.recv_envelope(env), RecvResult::Fetching(_)));

        // proposals for an older slot are pinned until it is erased
        for tag in ["x", "y", "z"] {
            let set = tx_set(tag);
            pending.add_tx_set(3, set.contents_hash(), set);
        }
        assert_eq!(pending.cached_tx_sets(), 4);
        pending.erase_below(4);
        assert_eq!(pending.cached_tx_sets(), 2);
        assert!(pending.get_tx_set(&wanted.contents_hash()).is_some());
        assert!(pending.get_tx_set(&tx_set("z").contents_hash()).is_some());

        assert_eq!(pending.recv_tx_set(missing.contents_hash(), Arc::clone(&missing)), 1);
        assert_eq!(pending.cached_tx_sets(), 2);
        assert!(pending.get_tx_set(&missing.contents_hash()).is_some());
        assert!(pending.get_tx_set(&wanted.contents_hash()).is_some());
    }

    #[test]
    fn test_sets_of_ready_envelopes_survive_a_flood() {
        let mut pending = PendingEnvelopes::new(
            PendingConfig {
                max_quorum_sets: 4,
                max_tx_sets: 3,
            },
            qset(),
        );
        let qset_hash = hash_quorum_set(&qset());
        let own = tx_set("own");
        let peer = tx_set("peer");
        pending.add_tx_set(2, own.contents_hash(), Arc::clone(&own));
        let env = prepare(2, "b", qset_hash, value_for(&peer, 10));
        pending.recv_envelope(env.clone());
        assert_eq!(pending.recv_tx_set(peer.contents_hash(), Arc::clone(&peer)), 1);
        assert_eq!(pending.pop(2), Some(env));

        for i in 0..100u32 {
            let junk = Arc::new(TransactionSet::new(Hash256::hash(&i.to_be_bytes())));
            assert_eq!(pending.recv_tx_set(junk.contents_hash(), junk), 0);
        }
        assert_eq!(pending.stats().tx_sets_unsolicited, 100);

        // locally built sets are pinned even past capacity
        for tag in ["c1", "c2", "c3"] {
            let set = tx_set(tag);
            pending.add_tx_set(3, set.contents_hash(), set);
        }
        assert!(pending.get_tx_set(&own.contents_hash()).is_some());
        assert!(pending.get_tx_set(&peer.contents_hash()).is_some());
        assert!(pending.get_tx_set(&tx_set("c1").contents_hash()).is_some());
    }
}
