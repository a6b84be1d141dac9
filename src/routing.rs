//! XOR-metric routing table.
//!
//! 160 k-buckets indexed by the leading-zero count of the XOR distance
//! to the local id. Each bucket keeps up to `k` contacts ordered by
//! recency of last successful interaction (tail = most recent), with a
//! side map of last-seen timestamps driving bucket refresh.
//!
//! Insertion follows LRU replacement with liveness preference: a full
//! bucket evicts its least-recently-updated entry only when that entry
//! is marked not-alive; a live eldest is preserved and the newcomer is
//! rejected. The local node is never stored.
//!
//! The table carries no lock of its own. The DHT actor owns it and
//! serializes every access; that ownership is the exclusive guard.

use std::collections::HashMap;
use std::time::Duration;

use crate::node_id::{bucket_index, distance_cmp, NodeId, NODE_ID_BITS};
use crate::peer::{now_ms, Node};

/// Default bucket capacity (the Kademlia replication factor).
pub const DEFAULT_K: usize = 20;

/// One k-bucket: contacts ordered by recency, most recent at the tail.
#[derive(Debug, Default)]
pub struct KBucket {
    entries: Vec<Node>,
    last_seen: HashMap<NodeId, u64>,
}

impl KBucket {
    fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Node] {
        &self.entries
    }

    fn contains(&self, id: &NodeId) -> bool {
        self.entries.iter().any(|n| n.id == *id)
    }

    /// Last-seen timestamp of the least-recently updated entry.
    fn oldest_last_seen(&self) -> Option<u64> {
        self.entries
            .iter()
            .map(|n| self.last_seen.get(&n.id).copied().unwrap_or(n.last_seen_ms))
            .min()
    }

    /// Insert or refresh a contact under the replacement policy.
    fn upsert(&mut self, mut node: Node, k: usize) -> bool {
        let now = now_ms();

        if let Some(pos) = self.entries.iter().position(|n| n.id == node.id) {
            // Known contact: adopt the newer observation, move to tail.
            self.entries.remove(pos);
            node.last_seen_ms = now;
            node.alive = true;
            self.last_seen.insert(node.id, now);
            self.entries.push(node);
            return true;
        }

        if self.entries.len() < k {
            node.last_seen_ms = now;
            self.last_seen.insert(node.id, now);
            self.entries.push(node);
            return true;
        }

        // Full bucket: the eldest survives if it is still considered
        // alive; otherwise it is replaced by the newcomer.
        match self.entries.first() {
            Some(eldest) if !eldest.alive => {
                let evicted = self.entries.remove(0);
                self.last_seen.remove(&evicted.id);
                node.last_seen_ms = now;
                self.last_seen.insert(node.id, now);
                self.entries.push(node);
                true
            }
            _ => false,
        }
    }

    fn remove(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.entries.iter().position(|n| n.id == *id) {
            self.entries.remove(pos);
            self.last_seen.remove(id);
            true
        } else {
            false
        }
    }

    /// Refresh a contact after a successful interaction: move to the
    /// tail, stamp last-seen, mark alive.
    fn touch(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.entries.iter().position(|n| n.id == *id) {
            let mut node = self.entries.remove(pos);
            let now = now_ms();
            node.last_seen_ms = now;
            node.alive = true;
            self.last_seen.insert(node.id, now);
            self.entries.push(node);
            true
        } else {
            false
        }
    }

    fn set_alive(&mut self, id: &NodeId, alive: bool) -> bool {
        if let Some(node) = self.entries.iter_mut().find(|n| n.id == *id) {
            node.alive = alive;
            true
        } else {
            false
        }
    }
}

/// The routing table: one bucket per distance class.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    k: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        let mut buckets = Vec::with_capacity(NODE_ID_BITS);
        for _ in 0..NODE_ID_BITS {
            buckets.push(KBucket::new());
        }
        Self { local_id, k, buckets }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Add or refresh a contact. Returns false when the contact was
    /// rejected (the local node, or a full bucket with a live eldest).
    pub fn add(&mut self, node: Node) -> bool {
        if node.id == self.local_id {
            return false;
        }
        let idx = bucket_index(&self.local_id, &node.id);
        self.buckets[idx].upsert(node, self.k)
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        if *id == self.local_id {
            return false;
        }
        let idx = bucket_index(&self.local_id, id);
        self.buckets[idx].remove(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        if *id == self.local_id {
            return false;
        }
        let idx = bucket_index(&self.local_id, id);
        self.buckets[idx].contains(id)
    }

    /// Look up a contact by id.
    pub fn get(&self, id: &NodeId) -> Option<Node> {
        if *id == self.local_id {
            return None;
        }
        let idx = bucket_index(&self.local_id, id);
        self.buckets[idx].entries.iter().find(|n| n.id == *id).cloned()
    }

    /// Refresh recency after a successful interaction with `id`.
    pub fn update_last_seen(&mut self, id: &NodeId) -> bool {
        if *id == self.local_id {
            return false;
        }
        let idx = bucket_index(&self.local_id, id);
        self.buckets[idx].touch(id)
    }

    /// Flip a contact's liveness flag without changing its position.
    pub fn mark_alive(&mut self, id: &NodeId, alive: bool) -> bool {
        if *id == self.local_id {
            return false;
        }
        let idx = bucket_index(&self.local_id, id);
        self.buckets[idx].set_alive(id, alive)
    }

    /// The `count` nodes closest to `key`, ascending by distance; ties
    /// broken by byte-lexicographic id order so the result is
    /// deterministic.
    pub fn closest(&self, key: &NodeId, count: usize) -> Vec<Node> {
        if count == 0 {
            return Vec::new();
        }
        let mut all: Vec<Node> = self.buckets.iter().flat_map(|b| b.entries.iter().cloned()).collect();
        all.sort_by(|a, b| {
            let da = key.xor_distance(&a.id);
            let db = key.xor_distance(&b.id);
            distance_cmp(&da, &db).then_with(|| a.id.as_bytes().cmp(b.id.as_bytes()))
        });
        all.truncate(count);
        all
    }

    pub fn all_nodes(&self) -> Vec<Node> {
        self.buckets.iter().flat_map(|b| b.entries.iter().cloned()).collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(|b| b.is_empty())
    }

    pub fn nonempty_bucket_count(&self) -> usize {
        self.buckets.iter().filter(|b| !b.is_empty()).count()
    }

    /// Indices of nonempty buckets whose oldest entry has not been
    /// seen within `max_age`. Empty buckets are never refreshed.
    pub fn buckets_needing_refresh(&self, max_age: Duration) -> Vec<usize> {
        let now = now_ms();
        let max_age_ms = max_age.as_millis() as u64;
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, bucket)| {
                bucket
                    .oldest_last_seen()
                    .is_some_and(|oldest| now.saturating_sub(oldest) > max_age_ms)
            })
            .map(|(idx, _)| idx)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn bucket(&self, idx: usize) -> &KBucket {
        &self.buckets[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_id::NODE_ID_LEN;

    fn id_with_first_byte(b: u8) -> NodeId {
        let mut bytes = [0u8; NODE_ID_LEN];
        bytes[0] = b;
        NodeId::from_bytes(bytes)
    }

    fn node(id: NodeId) -> Node {
        Node::new(id, "10.0.0.1", 4000)
    }

    #[test]
    fn local_node_is_refused() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, DEFAULT_K);
        assert!(!table.add(node(local)));
        assert_eq!(table.len(), 0);
        assert!(!table.contains(&local));
    }

    #[test]
    fn bucket_orders_by_recency_and_reinsert_moves_to_tail() {
        let local = id_with_first_byte(0x00);
        let mut table = RoutingTable::new(local, DEFAULT_K);

        let a = id_with_first_byte(0x01);
        let b = id_with_first_byte(0x02);
        let c = id_with_first_byte(0x04);
        for id in [a, b, c] {
            assert!(table.add(node(id)));
        }

        let bucket = table.bucket(159);
        let order: Vec<NodeId> = bucket.entries().iter().map(|n| n.id).collect();
        assert_eq!(order, vec![a, b, c]);

        // Re-inserting a known contact moves it to the tail.
        assert!(table.add(node(a)));
        let order: Vec<NodeId> = table.bucket(159).entries().iter().map(|n| n.id).collect();
        assert_eq!(order, vec![b, c, a]);
    }

    #[test]
    fn full_bucket_rejects_newcomer_when_eldest_is_alive() {
        let local = id_with_first_byte(0x00);
        let mut table = RoutingTable::new(local, 2);

        let a = id_with_first_byte(0x01);
        let b = id_with_first_byte(0x02);
        let c = id_with_first_byte(0x04);
        assert!(table.add(node(a)));
        assert!(table.add(node(b)));
        assert!(!table.add(node(c)));
        assert!(table.contains(&a));
        assert!(!table.contains(&c));
    }

    #[test]
    fn full_bucket_evicts_dead_eldest() {
        let local = id_with_first_byte(0x00);
        let mut table = RoutingTable::new(local, 2);

        let a = id_with_first_byte(0x01);
        let b = id_with_first_byte(0x02);
        let c = id_with_first_byte(0x04);
        table.add(node(a));
        table.add(node(b));
        table.mark_alive(&a, false);

        assert!(table.add(node(c)));
        assert!(!table.contains(&a));
        assert!(table.contains(&c));
        assert_eq!(table.bucket(159).len(), 2);
    }

    #[test]
    fn bucket_capacity_is_never_exceeded() {
        let local = NodeId::random();
        let k = 4;
        let mut table = RoutingTable::new(local, k);
        for _ in 0..200 {
            table.add(node(NodeId::random()));
            for idx in 0..NODE_ID_BITS {
                assert!(table.bucket(idx).len() <= k);
            }
        }
    }

    #[test]
    fn closest_returns_ascending_by_distance() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, DEFAULT_K);
        let mut ids = Vec::new();
        for _ in 0..50 {
            let id = NodeId::random();
            ids.push(id);
            table.add(node(id));
        }

        let key = NodeId::random();
        let got = table.closest(&key, 10);
        assert!(got.len() <= 10);

        // Ascending distance.
        for pair in got.windows(2) {
            let da = key.xor_distance(&pair[0].id);
            let db = key.xor_distance(&pair[1].id);
            assert_ne!(crate::node_id::distance_cmp(&da, &db), std::cmp::Ordering::Greater);
        }

        // Exactly the best of what the table holds.
        let mut expected: Vec<NodeId> = table.all_nodes().iter().map(|n| n.id).collect();
        expected.sort_by(|a, b| {
            let da = key.xor_distance(a);
            let db = key.xor_distance(b);
            crate::node_id::distance_cmp(&da, &db).then_with(|| a.as_bytes().cmp(b.as_bytes()))
        });
        expected.truncate(10);
        let got_ids: Vec<NodeId> = got.iter().map(|n| n.id).collect();
        assert_eq!(got_ids, expected);
    }

    #[test]
    fn remove_then_readd_tracks_size() {
        let local = id_with_first_byte(0x00);
        let mut table = RoutingTable::new(local, DEFAULT_K);

        let first_wave: Vec<NodeId> = (1u8..=5).map(id_with_first_byte).collect();
        for id in &first_wave {
            table.add(node(*id));
        }
        assert_eq!(table.len(), 5);

        for id in &first_wave {
            assert!(table.remove(id));
        }
        assert_eq!(table.len(), 0);

        let second_wave: Vec<NodeId> = (6u8..=10).map(id_with_first_byte).collect();
        for id in &second_wave {
            table.add(node(*id));
        }
        assert_eq!(table.len(), 5);

        for id in &first_wave {
            table.add(node(*id));
        }
        assert!(table.len() >= 10);
    }

    #[test]
    fn refresh_reports_only_stale_nonempty_buckets() {
        let local = id_with_first_byte(0x00);
        let mut table = RoutingTable::new(local, DEFAULT_K);
        table.add(node(id_with_first_byte(0x01)));

        // Fresh entry: nothing due at a generous max age.
        assert!(table.buckets_needing_refresh(Duration::from_secs(3600)).is_empty());
        // Zero max age: the nonempty bucket is due once any time passed.
        std::thread::sleep(Duration::from_millis(5));
        let due = table.buckets_needing_refresh(Duration::ZERO);
        assert_eq!(due, vec![159]);
    }
}
