//! Length-delimited framing of protocol envelopes.

use bytes::{Bytes, BytesMut};
use prost::Message;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::proto::{Envelope, PeerInfo};
use crate::Error;

/// Largest frame accepted on the wire.
///
/// A full CLOSEST_NODES_RESPONSE with K=20 and 256-bit ids is a few KiB; the
/// limit only guards against garbage length prefixes. Larger bucket sizes
/// must still fit, see [`closest_nodes_response_len`].
pub const MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Longest textual socket address, `[ffff:...:ffff%4294967295]:65535`.
pub const MAX_ADDRESS_LENGTH: usize = 58;

/// Upper bound on the encoded size of a CLOSEST_NODES_RESPONSE envelope
/// carrying `k` peers with `id_bits`-bit identifiers.
pub fn closest_nodes_response_len(k: usize, id_bits: u16) -> usize {
    let peer = PeerInfo {
        id: "f".repeat(id_bits as usize / 4),
        address: "f".repeat(MAX_ADDRESS_LENGTH),
    };
    let peer_len = peer.encoded_len();
    // Field key plus length prefix for every repeated entry.
    let entry_len = 1 + prost::length_delimiter_len(peer_len) + peer_len;
    let body_len = k.saturating_mul(entry_len);

    // Oneof tag 21 needs a two-byte key.
    let payload_len = 2usize
        .saturating_add(prost::length_delimiter_len(body_len))
        .saturating_add(body_len);
    // version (key + 5-byte varint) and request_id (key + 10-byte varint).
    payload_len.saturating_add(6 + 11)
}

/// Frames envelopes as `<u32 big-endian length><protobuf bytes>`.
pub struct EnvelopeCodec {
    codec: LengthDelimitedCodec,
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            codec: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
        }
    }
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let bytes = match self.codec.decode(src)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        Envelope::from_bytes(&bytes).map(Some)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = Error;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.codec
            .encode(Bytes::from(envelope.to_bytes()), dst)
            .map_err(Error::from)
    }
}
