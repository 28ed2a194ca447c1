//! A DHT node: routing table, outbound RPCs, and the inbound request handler.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use kadnet_core::{Error, Message, NodeId, PeerRecord, RequestHandler, Result, Transport};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::lookup;
use crate::routing::{InsertOutcome, RoutingTable};
use crate::DhtConfig;

/// Handle to a node's routing state.
///
/// Cloning is cheap; clones share the same table and transport.
pub struct Dht<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    local: PeerRecord,
    config: DhtConfig,
    table: Mutex<RoutingTable>,
    transport: T,
    /// Least recently seen entries currently being probed for eviction.
    probing: Mutex<HashSet<NodeId>>,
}

impl<T> Clone for Dht<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Dht<T> {
    pub fn new(local: PeerRecord, config: DhtConfig, transport: T) -> Result<Self> {
        config.validate()?;
        if local.id.bits() != config.id_bits {
            return Err(Error::InvalidArgument(format!(
                "local id is {} bits, expected {}",
                local.id.bits(),
                config.id_bits
            )));
        }

        let table = RoutingTable::new(local.id, config.k);
        Ok(Self {
            inner: Arc::new(Inner {
                local,
                config,
                table: Mutex::new(table),
                transport,
                probing: Mutex::new(HashSet::new()),
            }),
        })
    }

    pub fn local(&self) -> PeerRecord {
        self.inner.local
    }

    pub fn config(&self) -> &DhtConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<PeerRecord> {
        self.inner.table.lock().closest(target, count)
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.inner.table.lock().peers()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.inner.table.lock().contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table.lock().is_empty()
    }

    pub fn bucket_sizes(&self) -> Vec<(usize, usize)> {
        self.inner.table.lock().bucket_sizes()
    }

    /// Eviction probes that have not completed yet.
    pub fn probes_in_flight(&self) -> usize {
        self.inner.probing.lock().len()
    }

    /// Offer a peer to the routing table.
    ///
    /// When the peer's bucket is full, its least recently seen entry is
    /// probed in the background and the peer replaces it only if the probe
    /// fails. Returns `None` for our own id or an id of the wrong width.
    pub fn admit(&self, peer: PeerRecord) -> Option<InsertOutcome> {
        if peer.id == self.inner.local.id {
            return None;
        }

        let outcome = match self.inner.table.lock().insert(peer) {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!("Rejected peer {}: {}", peer, e);
                return None;
            }
        };

        match &outcome {
            InsertOutcome::Inserted => debug!("Added peer {}", peer),
            InsertOutcome::Refreshed => trace!("Refreshed peer {}", peer),
            InsertOutcome::Evicted { old } => {
                debug!("Replaced stale peer {} with {}", old, peer)
            }
            InsertOutcome::Full { lru } => self.spawn_probe(*lru, peer),
        }

        Some(outcome)
    }

    /// Record a failed exchange with `id`.
    pub fn report_failure(&self, id: &NodeId) {
        if let Some(failures) = self.inner.table.lock().mark_failed(id) {
            debug!(peer = %id, failures, "Request failed");
        }
    }

    /// Ask the node at `address` for its identity and admit it on success.
    pub async fn ping(&self, address: SocketAddr) -> Result<PeerRecord> {
        let request = Message::NodeInfoRequest {
            sender: self.inner.local,
        };

        let response = self
            .inner
            .transport
            .send(address, request, self.inner.config.request_timeout)
            .await?;

        match response {
            Message::NodeInfoResponse { responder } if responder.id == self.inner.local.id => {
                Err(Error::InvalidArgument(format!(
                    "{address} answered with our own id"
                )))
            }
            Message::NodeInfoResponse { responder } => {
                self.admit(responder);
                Ok(responder)
            }
            other => Err(Error::ProtocolViolation(format!(
                "{address} answered node_info_request with {}",
                other.kind()
            ))),
        }
    }

    /// Find the `k` closest reachable peers to `target`.
    pub async fn lookup(&self, target: NodeId) -> Result<Vec<PeerRecord>> {
        if target.bits() != self.inner.config.id_bits {
            return Err(Error::InvalidArgument(format!(
                "lookup target is {} bits, expected {}",
                target.bits(),
                self.inner.config.id_bits
            )));
        }

        let config = &self.inner.config;
        Ok(lookup::lookup(self, target, config.k, config.alpha).await)
    }

    fn spawn_probe(&self, lru: PeerRecord, candidate: PeerRecord) {
        // Admission also happens outside a runtime in unit tests.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if !self.inner.probing.lock().insert(lru.id) {
            trace!("Probe of {} already running, dropping {}", lru, candidate);
            return;
        }

        let dht = self.clone();
        runtime.spawn(async move {
            let request = Message::NodeInfoRequest {
                sender: dht.inner.local,
            };
            let response = dht
                .inner
                .transport
                .send(lru.address, request, dht.inner.config.request_timeout)
                .await;
            let alive = matches!(
                &response,
                Ok(Message::NodeInfoResponse { responder }) if responder.id == lru.id
            );

            let outcome = dht
                .inner
                .table
                .lock()
                .resolve_probe(&lru, alive, candidate);
            dht.inner.probing.lock().remove(&lru.id);

            match outcome {
                Ok(InsertOutcome::Full { .. }) => {
                    debug!("{} is alive, discarding {}", lru, candidate)
                }
                Ok(_) => debug!("{} did not answer, replaced by {}", lru, candidate),
                Err(e) => debug!("Probe of {} failed: {}", lru, e),
            }
        });
    }
}

impl<T: Transport> RequestHandler for Dht<T> {
    fn handle(&self, request: Message, from: SocketAddr) -> Option<Message> {
        match request {
            Message::NodeInfoRequest { sender } => {
                trace!("node_info_request from {} ({})", sender, from);
                self.admit(sender);
                Some(Message::NodeInfoResponse {
                    responder: self.inner.local,
                })
            }
            Message::ClosestNodesRequest {
                sender_address,
                target,
            } => {
                trace!("closest_nodes_request for {} from {}", target, sender_address);
                if target.bits() != self.inner.config.id_bits {
                    debug!("Ignoring {}-bit target from {}", target.bits(), from);
                    return None;
                }
                Some(Message::ClosestNodesResponse {
                    peers: self.closest(&target, self.inner.config.k),
                })
            }
            response => {
                debug!("Unexpected {} from {}", response.kind(), from);
                None
            }
        }
    }
}
