//! Core data types for kadnet

use std::fmt;
use std::net::SocketAddr;

use crate::id::NodeId;
use crate::{Error, Result};

/// A known peer: its identifier and the address it accepts connections on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerRecord {
    pub id: NodeId,
    pub address: SocketAddr,
}

impl PeerRecord {
    pub fn new(id: NodeId, address: SocketAddr) -> Self {
        Self { id, address }
    }
}

impl fmt::Display for PeerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.address)
    }
}

/// Parse a `host:port` address as it appears on the wire.
pub fn parse_address(s: &str) -> Result<SocketAddr> {
    s.parse()
        .map_err(|e| Error::InvalidArgument(format!("invalid address {s:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("127.0.0.1:60000").unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 60000))
        );
        assert!(parse_address("[::1]:60000").is_ok());
        assert!(matches!(
            parse_address("localhost"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_display() {
        let peer = PeerRecord::new(
            NodeId::from_u64(16, 0xbeef).unwrap(),
            "10.0.0.1:60000".parse().unwrap(),
        );
        assert_eq!(peer.to_string(), "beef@10.0.0.1:60000");
    }
}
