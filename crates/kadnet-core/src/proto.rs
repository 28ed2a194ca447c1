//! Protocol buffer message definitions
//!
//! These are manually defined to avoid the need for protoc at build time.
//! Identifiers travel as fixed-width hex strings and addresses as `host:port`
//! strings; [`crate::message`] converts them into typed values.

use crate::{Error, Result, PROTOCOL_VERSION};
use prost::Message;

/// Message envelope wrapping all protocol messages
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Protocol version
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Request ID for correlation
    #[prost(uint64, tag = "2")]
    pub request_id: u64,
    /// The actual message payload
    #[prost(oneof = "Payload", tags = "10, 11, 20, 21")]
    pub payload: Option<Payload>,
}

/// Payload variants for the envelope
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "10")]
    NodeInfoRequest(NodeInfoRequest),
    #[prost(message, tag = "11")]
    NodeInfoResponse(NodeInfoResponse),
    #[prost(message, tag = "20")]
    ClosestNodesRequest(ClosestNodesRequest),
    #[prost(message, tag = "21")]
    ClosestNodesResponse(ClosestNodesResponse),
}

// Identification

#[derive(Clone, PartialEq, Message)]
pub struct NodeInfoRequest {
    #[prost(string, tag = "1")]
    pub sender_address: String,
    #[prost(string, tag = "2")]
    pub sender_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeInfoResponse {
    #[prost(string, tag = "1")]
    pub responder_address: String,
    #[prost(string, tag = "2")]
    pub responder_id: String,
}

// Routing

#[derive(Clone, PartialEq, Message)]
pub struct ClosestNodesRequest {
    #[prost(string, tag = "1")]
    pub sender_address: String,
    #[prost(string, tag = "2")]
    pub target_id: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClosestNodesResponse {
    #[prost(message, repeated, tag = "1")]
    pub peers: Vec<PeerInfo>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PeerInfo {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub address: String,
}

// Helper implementations

impl Envelope {
    /// Create a new envelope with the current protocol version
    pub fn new(request_id: u64, payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id,
            payload: Some(payload),
        }
    }

    /// Encode the envelope to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decode an envelope from bytes, checking version compatibility
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let envelope = Self::decode(buf)?;

        if envelope.version != PROTOCOL_VERSION {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: envelope.version,
            });
        }

        Ok(envelope)
    }
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::NodeInfoRequest(_) => "node_info_request",
            Payload::NodeInfoResponse(_) => "node_info_response",
            Payload::ClosestNodesRequest(_) => "closest_nodes_request",
            Payload::ClosestNodesResponse(_) => "closest_nodes_response",
        }
    }
}
