//! Typed protocol messages.

use std::net::SocketAddr;

use crate::id::NodeId;
use crate::proto::{self, Envelope, Payload};
use crate::types::{parse_address, PeerRecord};
use crate::Result;

/// Request/response variants exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Identification and liveness probe; carries the sender's own record.
    NodeInfoRequest { sender: PeerRecord },
    /// The correct response to NODE_INFO_REQUEST.
    NodeInfoResponse { responder: PeerRecord },

    /// Asks the recipient for the peers it knows closest to `target`.
    ClosestNodesRequest {
        sender_address: SocketAddr,
        target: NodeId,
    },
    /// The correct response to CLOSEST_NODES_REQUEST.
    ClosestNodesResponse { peers: Vec<PeerRecord> },
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::NodeInfoRequest { .. } => "node_info_request",
            Message::NodeInfoResponse { .. } => "node_info_response",
            Message::ClosestNodesRequest { .. } => "closest_nodes_request",
            Message::ClosestNodesResponse { .. } => "closest_nodes_response",
        }
    }

    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Message::NodeInfoResponse { .. } | Message::ClosestNodesResponse { .. }
        )
    }

    /// Whether `response` is the kind of message that answers `self`.
    pub fn is_answered_by(&self, response: &Message) -> bool {
        matches!(
            (self, response),
            (
                Message::NodeInfoRequest { .. },
                Message::NodeInfoResponse { .. }
            ) | (
                Message::ClosestNodesRequest { .. },
                Message::ClosestNodesResponse { .. }
            )
        )
    }

    /// Wrap the message in a versioned envelope.
    pub fn into_envelope(self, request_id: u64) -> Envelope {
        let payload = match self {
            Message::NodeInfoRequest { sender } => Payload::NodeInfoRequest(proto::NodeInfoRequest {
                sender_address: sender.address.to_string(),
                sender_id: sender.id.to_hex(),
            }),
            Message::NodeInfoResponse { responder } => {
                Payload::NodeInfoResponse(proto::NodeInfoResponse {
                    responder_address: responder.address.to_string(),
                    responder_id: responder.id.to_hex(),
                })
            }
            Message::ClosestNodesRequest {
                sender_address,
                target,
            } => Payload::ClosestNodesRequest(proto::ClosestNodesRequest {
                sender_address: sender_address.to_string(),
                target_id: target.to_hex(),
            }),
            Message::ClosestNodesResponse { peers } => {
                Payload::ClosestNodesResponse(proto::ClosestNodesResponse {
                    peers: peers
                        .into_iter()
                        .map(|peer| proto::PeerInfo {
                            id: peer.id.to_hex(),
                            address: peer.address.to_string(),
                        })
                        .collect(),
                })
            }
        };

        Envelope::new(request_id, payload)
    }

    /// Validate a wire payload into a typed message.
    ///
    /// Identifiers must have exactly `id_bits / 4` hex characters; any
    /// malformed field rejects the whole message with `InvalidArgument`.
    pub fn from_payload(payload: Payload, id_bits: u16) -> Result<Self> {
        let message = match payload {
            Payload::NodeInfoRequest(req) => Message::NodeInfoRequest {
                sender: PeerRecord::new(
                    NodeId::from_hex(id_bits, &req.sender_id)?,
                    parse_address(&req.sender_address)?,
                ),
            },
            Payload::NodeInfoResponse(resp) => Message::NodeInfoResponse {
                responder: PeerRecord::new(
                    NodeId::from_hex(id_bits, &resp.responder_id)?,
                    parse_address(&resp.responder_address)?,
                ),
            },
            Payload::ClosestNodesRequest(req) => Message::ClosestNodesRequest {
                sender_address: parse_address(&req.sender_address)?,
                target: NodeId::from_hex(id_bits, &req.target_id)?,
            },
            Payload::ClosestNodesResponse(resp) => Message::ClosestNodesResponse {
                peers: resp
                    .peers
                    .iter()
                    .map(|peer| {
                        Ok(PeerRecord::new(
                            NodeId::from_hex(id_bits, &peer.id)?,
                            parse_address(&peer.address)?,
                        ))
                    })
                    .collect::<Result<_>>()?,
            },
        };

        Ok(message)
    }
}
