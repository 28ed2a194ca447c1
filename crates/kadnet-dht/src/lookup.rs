//! Iterative closest-node lookup.

use std::collections::HashSet;

use futures::future::join_all;
use kadnet_core::{Distance, Message, NodeId, PeerRecord, Transport};
use tracing::{debug, trace};

use crate::dht::Dht;

/// State of one iterative search for the peers closest to a target.
///
/// Each round queries up to `alpha` not-yet-asked peers among the `k` best
/// candidates. The search stops once a round fails to bring a strictly closer
/// candidate, when every one of the `k` best candidates has been asked, or
/// after one round per bit of id width.
#[derive(Debug)]
pub struct Lookup {
    target: NodeId,
    k: usize,
    alpha: usize,
    /// Candidates sorted by ascending distance to the target.
    candidates: Vec<PeerRecord>,
    queried: HashSet<NodeId>,
    unreachable: HashSet<NodeId>,
    best: Option<Distance>,
    rounds: u32,
    done: bool,
}

impl Lookup {
    pub fn new(target: NodeId, k: usize, alpha: usize, seed: Vec<PeerRecord>) -> Self {
        let mut lookup = Self {
            target,
            k,
            alpha,
            candidates: Vec::new(),
            queried: HashSet::new(),
            unreachable: HashSet::new(),
            best: None,
            rounds: 0,
            done: false,
        };
        lookup.merge(seed);
        lookup.best = lookup.best_distance();

        trace!(%target, seeds = lookup.candidates.len(), "New lookup");
        lookup
    }

    pub fn target(&self) -> NodeId {
        self.target
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Peers to query in the next round; empty once the lookup is done.
    pub fn next_batch(&self) -> Vec<PeerRecord> {
        if self.done {
            return Vec::new();
        }

        self.candidates
            .iter()
            .take(self.k)
            .filter(|p| !self.queried.contains(&p.id))
            .take(self.alpha)
            .copied()
            .collect()
    }

    /// Mark `peer` as asked before its request goes out.
    pub fn mark_queried(&mut self, peer: &PeerRecord) {
        self.queried.insert(peer.id);
    }

    /// Merge the peers returned by `from`.
    pub fn record_response(&mut self, from: &PeerRecord, peers: Vec<PeerRecord>) {
        self.queried.insert(from.id);
        self.merge(peers);
    }

    /// Note that `from` did not answer; it stays asked for this lookup.
    pub fn record_failure(&mut self, from: &PeerRecord) {
        self.queried.insert(from.id);
        self.unreachable.insert(from.id);
    }

    /// Close the current round, returning whether another one should run.
    pub fn finish_round(&mut self) -> bool {
        self.rounds += 1;

        let best = self.best_distance();
        let improved = match (best, self.best) {
            (Some(new), Some(old)) => new < old,
            (Some(_), None) => true,
            (None, _) => false,
        };
        self.best = best;

        if !improved || self.rounds >= self.target.bits() as u32 || self.next_batch().is_empty()
        {
            self.done = true;
        }

        !self.done
    }

    /// The `k` closest candidates found so far.
    pub fn closest(&self) -> Vec<PeerRecord> {
        self.candidates.iter().take(self.k).copied().collect()
    }

    /// Peers that failed to answer during this lookup.
    pub fn unreachable(&self) -> &HashSet<NodeId> {
        &self.unreachable
    }

    fn best_distance(&self) -> Option<Distance> {
        self.candidates.first().map(|p| p.id.distance(&self.target))
    }

    fn merge(&mut self, peers: Vec<PeerRecord>) {
        for peer in peers {
            if peer.id.bits() != self.target.bits() {
                continue;
            }
            if self.candidates.iter().any(|c| c.id == peer.id) {
                continue;
            }

            let distance = peer.id.distance(&self.target);
            let pos = self
                .candidates
                .partition_point(|c| c.id.distance(&self.target) <= distance);
            self.candidates.insert(pos, peer);
        }
    }
}

/// Run an iterative lookup for `target` through `dht`'s table and transport.
///
/// Every peer learned along the way is offered to the routing table.
/// Unresponsive peers are reported as failed but stay in the table.
pub async fn lookup<T: Transport>(
    dht: &Dht<T>,
    target: NodeId,
    k: usize,
    alpha: usize,
) -> Vec<PeerRecord> {
    let local = dht.local();
    let seed = dht.closest(&target, k);
    let mut lookup = Lookup::new(target, k, alpha, seed);
    let timeout = dht.config().request_timeout;

    loop {
        let batch = lookup.next_batch();
        if batch.is_empty() {
            break;
        }
        for peer in &batch {
            lookup.mark_queried(peer);
        }

        let request = Message::ClosestNodesRequest {
            sender_address: local.address,
            target,
        };
        let responses = join_all(batch.iter().map(|peer| {
            let request = request.clone();
            async move {
                (
                    *peer,
                    dht.transport().send(peer.address, request, timeout).await,
                )
            }
        }))
        .await;

        for (peer, response) in responses {
            match response {
                Ok(Message::ClosestNodesResponse { peers }) => {
                    dht.admit(peer);
                    let peers: Vec<_> = peers.into_iter().filter(|p| p.id != local.id).collect();
                    for p in &peers {
                        dht.admit(*p);
                    }
                    lookup.record_response(&peer, peers);
                }
                Ok(other) => {
                    debug!("{} answered a lookup with {}", peer, other.kind());
                    dht.report_failure(&peer.id);
                    lookup.record_failure(&peer);
                }
                Err(e) => {
                    debug!("Lookup request to {} failed: {}", peer, e);
                    dht.report_failure(&peer.id);
                    lookup.record_failure(&peer);
                }
            }
        }

        if !lookup.finish_round() {
            break;
        }
    }

    debug!(
        %target,
        rounds = lookup.rounds(),
        unreachable = lookup.unreachable().len(),
        "Lookup finished"
    );
    lookup.closest()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DhtConfig;
    use kadnet_core::transport::mock::{MockNetwork, MockTransport};
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    fn id(value: u64) -> NodeId {
        NodeId::from_u64(16, value).unwrap()
    }

    fn peer(value: u64) -> PeerRecord {
        PeerRecord::new(
            id(value),
            SocketAddr::from(([127, 0, 0, 1], value as u16)),
        )
    }

    fn node(network: &MockNetwork, value: u64) -> Dht<MockTransport> {
        let local = peer(value);
        let config = DhtConfig {
            id_bits: 16,
            request_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let dht = Dht::new(local, config, network.transport(local.address)).unwrap();
        network.register(local.address, Arc::new(dht.clone()));
        dht
    }

    #[test]
    fn test_seed_sorted_and_deduplicated() {
        let lookup = Lookup::new(id(0), 3, 2, vec![peer(8), peer(1), peer(4), peer(1)]);
        assert_eq!(lookup.closest(), vec![peer(1), peer(4), peer(8)]);
        assert_eq!(lookup.next_batch(), vec![peer(1), peer(4)]);
    }

    #[test]
    fn test_empty_seed_has_nothing_to_do() {
        let mut lookup = Lookup::new(id(0), 3, 2, vec![]);
        assert!(lookup.next_batch().is_empty());
        assert!(!lookup.finish_round());
        assert!(lookup.closest().is_empty());
    }

    #[test]
    fn test_stops_without_improvement() {
        let mut lookup = Lookup::new(id(0), 3, 1, vec![peer(4)]);

        let batch = lookup.next_batch();
        assert_eq!(batch, vec![peer(4)]);
        lookup.record_response(&peer(4), vec![peer(8), peer(9)]);

        // Best distance is still 4.
        assert!(!lookup.finish_round());
        assert!(lookup.is_done());
        assert!(lookup.next_batch().is_empty());
        assert_eq!(lookup.closest(), vec![peer(4), peer(8), peer(9)]);
    }

    #[test]
    fn test_continues_while_improving() {
        let mut lookup = Lookup::new(id(0), 3, 1, vec![peer(16)]);

        lookup.record_response(&peer(16), vec![peer(4)]);
        assert!(lookup.finish_round());
        assert_eq!(lookup.next_batch(), vec![peer(4)]);

        lookup.record_response(&peer(4), vec![peer(1)]);
        assert!(lookup.finish_round());
        assert_eq!(lookup.next_batch(), vec![peer(1)]);

        lookup.record_response(&peer(1), vec![peer(16), peer(4)]);
        assert!(!lookup.finish_round());
        assert_eq!(lookup.rounds(), 3);
        assert_eq!(lookup.closest(), vec![peer(1), peer(4), peer(16)]);
    }

    #[test]
    fn test_failures_are_not_requeried() {
        let mut lookup = Lookup::new(id(0), 3, 3, vec![peer(1), peer(2)]);
        lookup.record_failure(&peer(1));
        lookup.record_response(&peer(2), vec![]);

        assert!(!lookup.finish_round());
        assert!(lookup.unreachable().contains(&id(1)));
        // Known peers are still reported.
        assert_eq!(lookup.closest(), vec![peer(1), peer(2)]);
    }

    #[test]
    fn test_batch_limited_to_k_best() {
        let mut lookup = Lookup::new(id(0), 2, 3, vec![peer(1), peer(2), peer(64)]);
        assert_eq!(lookup.next_batch(), vec![peer(1), peer(2)]);

        lookup.record_response(&peer(1), vec![]);
        lookup.record_response(&peer(2), vec![]);
        // 64 is outside the k best, so there is nothing left to ask.
        assert!(!lookup.finish_round());
    }

    #[test]
    fn test_rounds_bounded_by_width() {
        let mut lookup = Lookup::new(id(0), 1, 1, vec![peer(0xffff)]);
        let mut next = 0xfffe;
        let mut rounds = 0;
        loop {
            let batch = lookup.next_batch();
            if batch.is_empty() {
                break;
            }
            // Each answer is exactly one closer than the last.
            lookup.record_response(&batch[0], vec![peer(next)]);
            next -= 1;
            rounds += 1;
            if !lookup.finish_round() {
                break;
            }
        }

        assert_eq!(rounds, 16);
        assert!(lookup.is_done());
    }

    #[test]
    fn test_foreign_width_ignored() {
        let mut lookup = Lookup::new(id(0), 3, 1, vec![peer(8)]);
        let wide = PeerRecord::new(
            NodeId::from_u64(32, 1).unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 1)),
        );
        lookup.record_response(&peer(8), vec![wide]);
        assert_eq!(lookup.closest(), vec![peer(8)]);
    }

    #[tokio::test]
    async fn test_lookup_follows_closer_peers() {
        let network = MockNetwork::new();
        let local = node(&network, 0x0000);
        let far = node(&network, 0x8000);
        let middle = node(&network, 0x4000);
        let near = node(&network, 0x0100);

        local.admit(far.local());
        far.admit(middle.local());
        middle.admit(near.local());

        let target = id(0x0101);
        let found = local.lookup(target).await.unwrap();

        assert_eq!(found, vec![near.local(), middle.local(), far.local()]);
        // Everything learned on the way was admitted.
        assert_eq!(local.len(), 3);
        assert_eq!(network.sent_to(near.local().address), 1);
    }

    #[tokio::test]
    async fn test_lookup_with_empty_table() {
        let network = MockNetwork::new();
        let local = node(&network, 1);

        let found = local.lookup(id(2)).await.unwrap();
        assert!(found.is_empty());
        assert!(network.sent().is_empty());
    }

    #[tokio::test]
    async fn test_lookup_skips_unresponsive_peers() {
        let network = MockNetwork::new();
        let local = node(&network, 0x0000);
        let silent = node(&network, 0x8001);
        let alive = node(&network, 0x8002);
        let near = node(&network, 0x0010);
        network.set_silent(silent.local().address);

        local.admit(silent.local());
        local.admit(alive.local());
        alive.admit(near.local());

        let found = local.lookup(id(0x0011)).await.unwrap();

        assert_eq!(found[0], near.local());
        assert!(found.contains(&silent.local()));
        // A single miss does not drop the peer.
        assert!(local.contains(&silent.local().id));
        assert_eq!(network.sent_to(silent.local().address), 1);
    }

    #[tokio::test]
    async fn test_lookup_terminates_on_larger_network() {
        let network = MockNetwork::new();
        let values: Vec<u64> = (1..=60).map(|i| (i * 1093) % 0xffff).collect();
        let nodes: Vec<_> = values.iter().map(|v| node(&network, *v)).collect();

        // Each node knows a few ring neighbours and the node opposite it.
        for (i, dht) in nodes.iter().enumerate() {
            for offset in [1, 2, 3, nodes.len() / 2] {
                dht.admit(nodes[(i + offset) % nodes.len()].local());
            }
        }

        let local = &nodes[0];
        let target = id(0x1234);
        let initial_best = local
            .closest(&target, 1)
            .first()
            .map(|p| p.id.distance(&target))
            .unwrap();

        let found = tokio::time::timeout(Duration::from_secs(5), local.lookup(target))
            .await
            .expect("lookup did not terminate")
            .unwrap();

        assert!(!found.is_empty());
        assert!(found.len() <= local.config().k);
        assert!(found[0].id.distance(&target) <= initial_best);
        assert!(found
            .windows(2)
            .all(|w| w[0].id.distance(&target) <= w[1].id.distance(&target)));
        assert!(!found.contains(&local.local()));
    }
}
