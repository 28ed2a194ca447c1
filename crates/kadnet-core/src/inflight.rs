//! Bookkeeping for outbound requests awaiting a response.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// An outbound request that has been written and not yet answered.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub request_id: u64,
    pub to: SocketAddr,
    pub kind: &'static str,
    pub sent_at: Instant,
}

/// Shared registry of pending requests, keyed by request id.
///
/// Request ids start at a random offset so ids from a restarted node are
/// unlikely to collide with stale responses from a previous run.
#[derive(Debug, Clone)]
pub struct InflightRequests {
    next_id: Arc<AtomicU64>,
    requests: Arc<Mutex<HashMap<u64, PendingRequest>>>,
}

impl InflightRequests {
    pub fn new() -> Self {
        let mut buf = [0u8; 8];
        let start = match getrandom::getrandom(&mut buf) {
            Ok(()) => u64::from_le_bytes(buf),
            // Any starting point works, randomness only reduces collisions.
            Err(_) => std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64,
        };

        Self {
            next_id: Arc::new(AtomicU64::new(start)),
            requests: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Allocate a request id and record the request as pending.
    ///
    /// The entry is removed when the returned guard is dropped, so every exit
    /// path of a send (response, timeout, error) clears it.
    pub fn register(&self, to: SocketAddr, kind: &'static str) -> InflightGuard {
        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().insert(
            request_id,
            PendingRequest {
                request_id,
                to,
                kind,
                sent_at: Instant::now(),
            },
        );

        InflightGuard {
            requests: self.clone(),
            request_id,
        }
    }

    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    pub fn contains(&self, request_id: u64) -> bool {
        self.requests.lock().contains_key(&request_id)
    }

    /// Age of the oldest pending request.
    pub fn oldest(&self) -> Option<Duration> {
        self.requests
            .lock()
            .values()
            .map(|request| request.sent_at.elapsed())
            .max()
    }

    fn remove(&self, request_id: u64) -> Option<PendingRequest> {
        self.requests.lock().remove(&request_id)
    }
}

impl Default for InflightRequests {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a request registered while it is in flight.
#[derive(Debug)]
pub struct InflightGuard {
    requests: InflightRequests,
    request_id: u64,
}

impl InflightGuard {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Mark the request as answered, returning its record.
    pub fn complete(self) -> Option<PendingRequest> {
        self.requests.remove(self.request_id)
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.requests.remove(self.request_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 60000))
    }

    #[test]
    fn test_register_and_complete() {
        let inflight = InflightRequests::new();
        let guard = inflight.register(addr(), "node_info_request");
        let id = guard.request_id();

        assert!(inflight.contains(id));
        assert_eq!(inflight.len(), 1);

        let pending = guard.complete().unwrap();
        assert_eq!(pending.request_id, id);
        assert_eq!(pending.to, addr());
        assert!(inflight.is_empty());
    }

    #[test]
    fn test_drop_removes_entry() {
        let inflight = InflightRequests::new();
        {
            let _a = inflight.register(addr(), "node_info_request");
            let _b = inflight.register(addr(), "closest_nodes_request");
            assert_eq!(inflight.len(), 2);
            assert!(inflight.oldest().is_some());
        }
        assert!(inflight.is_empty());
        assert!(inflight.oldest().is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let inflight = InflightRequests::new();
        let a = inflight.register(addr(), "node_info_request");
        let b = inflight.register(addr(), "node_info_request");
        assert_ne!(a.request_id(), b.request_id());
    }
}
