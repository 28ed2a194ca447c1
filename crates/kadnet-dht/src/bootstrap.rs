//! Joining the network and keeping the routing table fresh.

use std::net::SocketAddr;

use kadnet_core::Transport;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dht::Dht;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    /// Contacting seeds and probing every bucket once.
    Joining,
    /// Periodically re-probing a rotating subset of buckets.
    Steady,
}

/// Drives a node from an empty table to a populated one, then refreshes it.
pub struct Bootstrap<T> {
    dht: Dht<T>,
    seeds: Vec<SocketAddr>,
    state: BootstrapState,
    /// Next bucket to refresh.
    cursor: usize,
}

impl<T: Transport> Bootstrap<T> {
    pub fn new(dht: Dht<T>, seeds: Vec<SocketAddr>) -> Self {
        Self {
            dht,
            seeds,
            state: BootstrapState::Joining,
            cursor: 0,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Contact every seed, then run one lookup per bucket.
    ///
    /// Unreachable seeds and failed lookups are logged and skipped.
    pub async fn join(&mut self) {
        let local = self.dht.local();
        info!("Joining with {} seed(s) as {}", self.seeds.len(), local);

        for seed in &self.seeds {
            if *seed == local.address {
                debug!("Skipping seed {}: that is us", seed);
                continue;
            }

            match self.dht.ping(*seed).await {
                Ok(peer) => info!("Seed {} is {}", seed, peer.id),
                Err(e) if e.is_unreachable() => warn!("Seed {} unreachable: {}", seed, e),
                Err(e) => warn!("Seed {} gave a bad answer: {}", seed, e),
            }
        }

        for bucket in 0..self.bucket_count() {
            self.probe_bucket(bucket).await;
        }

        self.state = BootstrapState::Steady;
        info!(peers = self.dht.len(), "Joined network");
    }

    /// Probe the next `refresh_batch` buckets.
    pub async fn refresh(&mut self) {
        let buckets = self.bucket_count();
        let batch = self.dht.config().refresh_batch.min(buckets);

        for _ in 0..batch {
            let bucket = self.cursor;
            self.cursor = (self.cursor + 1) % buckets;
            self.probe_bucket(bucket).await;
        }

        self.log_summary();
    }

    /// Join, then refresh every `refresh_interval` until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        if self.state == BootstrapState::Joining {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown during join");
                    return;
                }
                _ = self.join() => {}
            }
        }

        let mut ticker = interval(self.dht.config().refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = self.refresh() => {}
                    }
                }
            }
        }

        info!("Bootstrap stopped");
    }

    fn bucket_count(&self) -> usize {
        self.dht.config().id_bits as usize
    }

    async fn probe_bucket(&self, bucket: usize) {
        let target = match self.dht.local().id.random_at_distance(bucket as u32) {
            Ok(target) => target,
            Err(e) => {
                warn!("Skipping bucket {}: {}", bucket, e);
                return;
            }
        };

        match self.dht.lookup(target).await {
            Ok(found) => debug!(bucket, found = found.len(), "Bucket probed"),
            Err(e) => warn!("Lookup for bucket {} failed: {}", bucket, e),
        }
    }

    fn log_summary(&self) {
        let sizes = self.dht.bucket_sizes();
        info!(
            peers = self.dht.len(),
            buckets = sizes.len(),
            "Routing table refreshed"
        );
        debug!("Bucket sizes: {:?}", sizes);
    }
}
