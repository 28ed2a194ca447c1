//! kadnet core - identifiers, wire protocol, and transport
//!
//! This crate provides the building blocks shared by the kadnet routing
//! logic and the node binary: XOR-metric identifiers, peer records, the
//! length-delimited protobuf wire format, and a one-request-per-connection
//! TCP transport.

pub mod codec;
pub mod error;
pub mod id;
pub mod inflight;
pub mod message;
pub mod proto;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use id::{Distance, NodeId};
pub use message::Message;
pub use transport::{serve, RequestHandler, ServeConfig, TcpTransport, Transport};
pub use types::PeerRecord;

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;
