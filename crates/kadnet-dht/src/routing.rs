//! Kademlia routing table implementation

use kadnet_core::{Error, NodeId, PeerRecord, Result};
use std::collections::VecDeque;

/// Consecutive failed requests after which an entry is considered stale and
/// may be replaced without a liveness probe.
pub const MAX_FAILURES: u32 = 3;

/// Result of offering a peer to the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The peer was new and its bucket had room.
    Inserted,
    /// The peer was already known; it is now the most recently seen entry.
    Refreshed,
    /// The bucket was full and its least recently seen entry was stale, so it
    /// was replaced by the new peer.
    Evicted { old: PeerRecord },
    /// The bucket is full. The caller should probe `lru` and report the result
    /// through [`RoutingTable::resolve_probe`].
    Full { lru: PeerRecord },
}

impl InsertOutcome {
    /// Whether the offered peer is now in the table.
    pub fn is_stored(&self) -> bool {
        !matches!(self, InsertOutcome::Full { .. })
    }
}

#[derive(Debug, Clone)]
struct Entry {
    peer: PeerRecord,
    failures: u32,
}

/// A k-bucket in the routing table
#[derive(Debug, Clone)]
pub struct KBucket {
    /// Maximum number of nodes in this bucket
    k: usize,
    /// Nodes in this bucket, ordered by last seen (most recent at back)
    entries: VecDeque<Entry>,
}

impl KBucket {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            entries: VecDeque::with_capacity(k),
        }
    }

    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.peer.id == *id)
    }

    /// Move an existing entry to the back (most recently seen), updating its
    /// address and clearing its failure count.
    fn touch(&mut self, pos: usize, peer: Option<PeerRecord>) {
        if let Some(mut entry) = self.entries.remove(pos) {
            if let Some(peer) = peer {
                entry.peer = peer;
            }
            entry.failures = 0;
            self.entries.push_back(entry);
        }
    }

    fn push(&mut self, peer: PeerRecord) {
        debug_assert!(self.entries.len() < self.k);
        self.entries.push_back(Entry { peer, failures: 0 });
    }

    /// Get all nodes in the bucket, least recently seen first
    pub fn nodes(&self) -> impl Iterator<Item = &PeerRecord> {
        self.entries.iter().map(|e| &e.peer)
    }

    /// The least recently seen node
    pub fn least_recent(&self) -> Option<&PeerRecord> {
        self.entries.front().map(|e| &e.peer)
    }

    /// Check if bucket is full
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.k
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Kademlia routing table
///
/// Holds one bucket per bit of identifier width. Bucket `i` contains the peers
/// whose XOR distance to the local id has its highest set bit at position `i`.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    /// Our node ID
    local_id: NodeId,
    /// K-buckets, one per bit of id width
    buckets: Vec<KBucket>,
    /// K parameter
    k: usize,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        Self {
            local_id,
            buckets: (0..local_id.bits()).map(|_| KBucket::new(k)).collect(),
            k,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn k(&self) -> usize {
        self.k
    }

    /// Index of the bucket `id` belongs in.
    ///
    /// Fails for our own id (distance zero has no bucket) and for ids of a
    /// different width.
    pub fn bucket_index(&self, id: &NodeId) -> Result<usize> {
        if id.bits() != self.local_id.bits() {
            return Err(Error::InvalidArgument(format!(
                "{}-bit id in a {}-bit table",
                id.bits(),
                self.local_id.bits()
            )));
        }

        self.local_id
            .distance(id)
            .ilog2()
            .map(|i| i as usize)
            .ok_or_else(|| Error::InvalidArgument("distance to self has no bucket".to_string()))
    }

    /// Add or refresh a peer.
    ///
    /// Known peers move to the most-recently-seen position. A full bucket
    /// replaces its least recently seen entry only when that entry is stale;
    /// otherwise the table is left untouched and [`InsertOutcome::Full`] asks
    /// the caller to probe it.
    pub fn insert(&mut self, peer: PeerRecord) -> Result<InsertOutcome> {
        let index = self.bucket_index(&peer.id)?;
        let bucket = &mut self.buckets[index];

        if let Some(pos) = bucket.position(&peer.id) {
            bucket.touch(pos, Some(peer));
            return Ok(InsertOutcome::Refreshed);
        }

        if !bucket.is_full() {
            bucket.push(peer);
            return Ok(InsertOutcome::Inserted);
        }

        match bucket.entries.front() {
            Some(lru) if lru.failures >= MAX_FAILURES => {
                let old = lru.peer;
                bucket.entries.pop_front();
                bucket.push(peer);
                Ok(InsertOutcome::Evicted { old })
            }
            Some(lru) => Ok(InsertOutcome::Full { lru: lru.peer }),
            // k == 0: nothing can ever be stored.
            None => Ok(InsertOutcome::Full { lru: peer }),
        }
    }

    /// Apply the result of probing `lru` after an [`InsertOutcome::Full`].
    ///
    /// A live `lru` is kept and refreshed and `candidate` is discarded; a dead
    /// one is evicted and `candidate` takes its place.
    pub fn resolve_probe(
        &mut self,
        lru: &PeerRecord,
        alive: bool,
        candidate: PeerRecord,
    ) -> Result<InsertOutcome> {
        if alive {
            self.mark_seen(&lru.id);
            return Ok(InsertOutcome::Full { lru: *lru });
        }

        let old = self.remove(&lru.id);
        match (self.insert(candidate)?, old) {
            (InsertOutcome::Inserted, Some(old)) => Ok(InsertOutcome::Evicted { old }),
            (outcome, _) => Ok(outcome),
        }
    }

    /// Record a successful exchange with `id`.
    pub fn mark_seen(&mut self, id: &NodeId) -> bool {
        let Ok(index) = self.bucket_index(id) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        match bucket.position(id) {
            Some(pos) => {
                bucket.touch(pos, None);
                true
            }
            None => false,
        }
    }

    /// Record a failed exchange with `id`, returning its consecutive failures.
    pub fn mark_failed(&mut self, id: &NodeId) -> Option<u32> {
        let index = self.bucket_index(id).ok()?;
        let entry = self.buckets[index]
            .entries
            .iter_mut()
            .find(|e| e.peer.id == *id)?;
        entry.failures += 1;
        Some(entry.failures)
    }

    pub fn remove(&mut self, id: &NodeId) -> Option<PeerRecord> {
        let index = self.bucket_index(id).ok()?;
        let bucket = &mut self.buckets[index];
        let pos = bucket.position(id)?;
        bucket.entries.remove(pos).map(|e| e.peer)
    }

    pub fn get(&self, id: &NodeId) -> Option<PeerRecord> {
        let index = self.bucket_index(id).ok()?;
        self.buckets[index].nodes().find(|p| p.id == *id).copied()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.get(id).is_some()
    }

    /// Find the `count` closest nodes to a target
    ///
    /// Scans every bucket: the closest peers to an arbitrary target need not
    /// share a bucket with it. Equal distances keep table order.
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        let mut all_nodes: Vec<_> = self.peers();

        all_nodes.sort_by_key(|p| p.id.distance(target));
        all_nodes.truncate(count);
        all_nodes
    }

    /// Every known peer, bucket by bucket, least recently seen first.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.buckets
            .iter()
            .flat_map(|b| b.nodes())
            .copied()
            .collect()
    }

    pub fn bucket(&self, index: usize) -> Option<&KBucket> {
        self.buckets.get(index)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// `(index, size)` of every non-empty bucket.
    pub fn bucket_sizes(&self) -> Vec<(usize, usize)> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(i, b)| (i, b.len()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }
}
