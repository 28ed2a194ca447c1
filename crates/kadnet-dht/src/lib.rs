//! kadnet DHT - Kademlia routing, lookup, and bootstrap
//!
//! This crate keeps the XOR-metric routing table of a node, runs iterative
//! closest-node lookups over a [`kadnet_core::Transport`], and drives the
//! join/refresh cycle that keeps the table populated.

pub mod bootstrap;
pub mod dht;
pub mod lookup;
pub mod routing;

use std::time::Duration;

use kadnet_core::codec::{closest_nodes_response_len, MAX_FRAME_LENGTH};
use kadnet_core::id::DEFAULT_ID_BITS;
use kadnet_core::{Error, NodeId, Result};

pub use bootstrap::{Bootstrap, BootstrapState};
pub use dht::Dht;
pub use routing::{InsertOutcome, KBucket, RoutingTable};

/// DHT node configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Identifier width in bits
    pub id_bits: u16,
    /// Number of nodes per k-bucket
    pub k: usize,
    /// Parallelism factor for lookups
    pub alpha: usize,
    /// Timeout applied to every outbound request
    pub request_timeout: Duration,
    /// Delay between two refresh rounds once joined
    pub refresh_interval: Duration,
    /// Buckets re-probed per refresh round
    pub refresh_batch: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            id_bits: DEFAULT_ID_BITS,
            k: 20,
            alpha: 3,
            request_timeout: Duration::from_secs(5),
            refresh_interval: Duration::from_secs(60),
            refresh_batch: 8,
        }
    }
}

impl DhtConfig {
    pub fn validate(&self) -> Result<()> {
        NodeId::validate_width(self.id_bits)?;

        if self.k == 0 {
            return Err(Error::InvalidArgument("k must be at least 1".into()));
        }
        // A full CLOSEST_NODES_RESPONSE must fit in one frame.
        let response_len = closest_nodes_response_len(self.k, self.id_bits);
        if response_len > MAX_FRAME_LENGTH {
            return Err(Error::InvalidArgument(format!(
                "k = {} too large: responses may reach {} bytes, frames are limited to {}",
                self.k, response_len, MAX_FRAME_LENGTH
            )));
        }
        if self.alpha == 0 {
            return Err(Error::InvalidArgument("alpha must be at least 1".into()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "request timeout must be non-zero".into(),
            ));
        }
        if self.refresh_interval.is_zero() {
            return Err(Error::InvalidArgument(
                "refresh interval must be non-zero".into(),
            ));
        }
        if self.refresh_batch == 0 {
            return Err(Error::InvalidArgument(
                "refresh batch must be at least 1".into(),
            ));
        }

        Ok(())
    }
}
