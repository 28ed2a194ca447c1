//! Node identifiers and the XOR distance metric.

use std::fmt;

use crate::{Error, Result};

/// Largest supported identifier width in bytes.
pub const MAX_ID_BYTES: usize = 32;

/// Default identifier width in bits.
pub const DEFAULT_ID_BITS: u16 = 160;

/// A fixed-width identifier in the XOR metric space.
///
/// The bytes are stored big-endian and right-aligned in a 32-byte buffer, so
/// identifiers of any supported width (a multiple of 8 between 8 and 256 bits)
/// share the same representation and distances compare numerically.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    bytes: [u8; MAX_ID_BYTES],
    bits: u16,
}

/// The XOR distance between two identifiers, interpreted as an unsigned integer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; MAX_ID_BYTES]);

impl NodeId {
    /// Check that `bits` is a width this crate can represent.
    pub fn validate_width(bits: u16) -> Result<()> {
        if bits == 0 || bits % 8 != 0 || bits as usize > MAX_ID_BYTES * 8 {
            return Err(Error::InvalidArgument(format!(
                "id width must be a multiple of 8 between 8 and {}, got {bits}",
                MAX_ID_BYTES * 8
            )));
        }
        Ok(())
    }

    /// Build an identifier from its big-endian bytes; the width is `8 * bytes.len()`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let bits = u16::try_from(bytes.len() * 8)
            .map_err(|_| Error::InvalidArgument(format!("{} byte id", bytes.len())))?;
        Self::validate_width(bits)?;

        let mut buf = [0u8; MAX_ID_BYTES];
        buf[MAX_ID_BYTES - bytes.len()..].copy_from_slice(bytes);
        Ok(Self { bytes: buf, bits })
    }

    /// Build an identifier of the given width from an integer.
    ///
    /// Mostly useful with small widths, where whole ids fit in a `u64`.
    pub fn from_u64(bits: u16, value: u64) -> Result<Self> {
        Self::validate_width(bits)?;
        if bits < 64 && value >> bits != 0 {
            return Err(Error::InvalidArgument(format!(
                "{value} does not fit in {bits} bits"
            )));
        }

        let mut bytes = [0u8; MAX_ID_BYTES];
        bytes[MAX_ID_BYTES - 8..].copy_from_slice(&value.to_be_bytes());
        Ok(Self { bytes, bits })
    }

    /// Generate a random identifier from the operating system's CSPRNG.
    pub fn random(bits: u16) -> Result<Self> {
        Self::validate_width(bits)?;

        let mut bytes = [0u8; MAX_ID_BYTES];
        let len = bits as usize / 8;
        getrandom::getrandom(&mut bytes[MAX_ID_BYTES - len..])?;
        Ok(Self { bytes, bits })
    }

    /// Width of the identifier in bits.
    pub fn bits(&self) -> u16 {
        self.bits
    }

    /// The identifier's significant big-endian bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[MAX_ID_BYTES - self.bits as usize / 8..]
    }

    /// XOR distance to another identifier.
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut out = [0u8; MAX_ID_BYTES];
        for (o, (a, b)) in out.iter_mut().zip(self.bytes.iter().zip(other.bytes.iter())) {
            *o = a ^ b;
        }
        Distance(out)
    }

    /// A uniformly random identifier whose distance from `self` lies in
    /// `[2^bucket, 2^(bucket+1) - 1]`, i.e. one that falls into bucket `bucket`.
    pub fn random_at_distance(&self, bucket: u32) -> Result<Self> {
        if bucket >= self.bits as u32 {
            return Err(Error::InvalidArgument(format!(
                "bucket {bucket} out of range for a {}-bit id",
                self.bits
            )));
        }

        let mut offset = [0u8; MAX_ID_BYTES];
        getrandom::getrandom(&mut offset)?;

        // Clear everything above the bucket bit, then force the bucket bit on.
        let top = MAX_ID_BYTES - 1 - (bucket as usize / 8);
        let shift = bucket % 8;
        for byte in offset.iter_mut().take(top) {
            *byte = 0;
        }
        offset[top] = (offset[top] & ((1u8 << shift) - 1)) | (1u8 << shift);

        let mut bytes = self.bytes;
        for (b, o) in bytes.iter_mut().zip(offset.iter()) {
            *b ^= o;
        }
        Ok(Self {
            bytes,
            bits: self.bits,
        })
    }

    /// Fixed-width lowercase hex, `bits / 4` characters long.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Parse an identifier of the given width from its hex form.
    pub fn from_hex(bits: u16, s: &str) -> Result<Self> {
        Self::validate_width(bits)?;
        if s.len() != bits as usize / 4 {
            return Err(Error::InvalidArgument(format!(
                "expected {} hex characters for a {bits}-bit id, got {}",
                bits / 4,
                s.len()
            )));
        }

        let bytes = hex::decode(s)
            .map_err(|e| Error::InvalidArgument(format!("invalid id {s:?}: {e}")))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Distance {
    pub const ZERO: Distance = Distance([0u8; MAX_ID_BYTES]);

    pub fn is_zero(&self) -> bool {
        self == &Self::ZERO
    }

    /// Position of the most significant set bit, `None` for a zero distance.
    pub fn ilog2(&self) -> Option<u32> {
        self.0
            .iter()
            .enumerate()
            .find(|(_, byte)| **byte != 0)
            .map(|(i, byte)| ((MAX_ID_BYTES - 1 - i) as u32) * 8 + (u8::BITS - 1 - byte.leading_zeros()))
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let start = self.0.iter().position(|b| *b != 0).unwrap_or(MAX_ID_BYTES - 1);
        write!(f, "Distance(0x{})", hex::encode(&self.0[start..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id16(value: u64) -> NodeId {
        NodeId::from_u64(16, value).unwrap()
    }

    #[test]
    fn test_distance_is_symmetric_and_zero_on_self() {
        for (a, b) in [(0u64, 1u64), (0x1234, 0xfedc), (0xffff, 0x0f0f), (7, 7)] {
            let (a, b) = (id16(a), id16(b));
            assert_eq!(a.distance(&b), b.distance(&a));
            assert!(a.distance(&a).is_zero());
        }
    }

    #[test]
    fn test_ilog2_matches_integer_log() {
        // Step through the 16-bit space with a stride coprime to 2^16.
        let mut a: u16 = 0x1d2f;
        let mut b: u16 = 0x0001;
        for _ in 0..2000 {
            a = a.wrapping_mul(31).wrapping_add(17);
            b = b.wrapping_mul(13).wrapping_add(5);
            if a == b {
                continue;
            }

            let expected = u16::BITS - (a ^ b).leading_zeros() - 1;
            let distance = id16(a as u64).distance(&id16(b as u64));
            assert_eq!(distance.ilog2(), Some(expected));
        }

        assert_eq!(Distance::ZERO.ilog2(), None);
    }

    #[test]
    fn test_distance_ordering_is_numeric() {
        let origin = id16(0);
        assert!(origin.distance(&id16(1)) < origin.distance(&id16(2)));
        assert!(origin.distance(&id16(0x00ff)) < origin.distance(&id16(0x0100)));
        assert!(origin.distance(&id16(0x8000)) > origin.distance(&id16(0x7fff)));
    }

    #[test]
    fn test_hex_is_fixed_width() {
        let id = id16(0x00ab);
        assert_eq!(id.to_hex(), "00ab");
        assert_eq!(NodeId::from_hex(16, "00ab").unwrap(), id);

        let wide = NodeId::random(160).unwrap();
        assert_eq!(wide.to_hex().len(), 40);
        assert_eq!(NodeId::from_hex(160, &wide.to_hex()).unwrap(), wide);
    }

    #[test]
    fn test_from_hex_rejects_malformed_input() {
        assert!(matches!(
            NodeId::from_hex(16, "abc"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            NodeId::from_hex(16, "zzzz"),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            NodeId::from_hex(12, "abc"),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_random_respects_width() {
        let id = NodeId::random(16).unwrap();
        assert_eq!(id.bits(), 16);
        assert_eq!(id.as_bytes().len(), 2);
        assert!(id.distance(&id16(0)).ilog2().map_or(true, |i| i < 16));

        assert!(NodeId::random(0).is_err());
        assert!(NodeId::random(264).is_err());
    }

    #[test]
    fn test_random_at_distance_lands_in_bucket() {
        let local = NodeId::random(160).unwrap();
        for bucket in 0..160 {
            let target = local.random_at_distance(bucket).unwrap();
            assert_eq!(local.distance(&target).ilog2(), Some(bucket));
        }

        assert!(local.random_at_distance(160).is_err());
    }

    #[test]
    fn test_from_u64_rejects_overflow() {
        assert!(NodeId::from_u64(16, 0x1_0000).is_err());
        assert!(NodeId::from_u64(16, 0xffff).is_ok());
    }
}
