//! 160-bit identifiers, the XOR metric and bit-prefix ranges
use crate::error::IdError;

use std::{
    convert::{TryFrom, TryInto},
    fmt,
    net::Ipv4Addr,
    ops::BitXor,
    str::FromStr,
};

use crc32c::crc32c;
use serde::{Deserialize, Deserializer};

pub const ID_BYTES: usize = 20;
pub const ID_BITS: usize = ID_BYTES * 8;

#[derive(Hash, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeId(pub [u8; ID_BYTES]);

/// Torrents are looked up by the same kind of identifier as nodes.
pub type InfoHash = NodeId;

impl NodeId {
    pub fn random() -> Self {
        NodeId(rand::random::<[u8; ID_BYTES]>())
    }

    pub fn xor(&self, other: &NodeId) -> NodeId {
        let mut out = [0u8; ID_BYTES];
        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *o = a ^ b;
        }
        NodeId(out)
    }

    pub fn distance(&self, other: &NodeId) -> Distance {
        Distance(self.xor(other).0)
    }

    /// Number of leading bits shared with `other`, 0..=160.
    pub fn common_prefix_bits(&self, other: &NodeId) -> usize {
        let diff = self.xor(other);
        for (i, byte) in diff.0.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        ID_BITS
    }

    /// Bit at `index`, counting from the most significant bit.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index / 8] & (0x80 >> (index % 8)) != 0
    }

    fn with_bit(mut self, index: usize, value: bool) -> NodeId {
        let mask = 0x80 >> (index % 8);
        if value {
            self.0[index / 8] |= mask;
        } else {
            self.0[index / 8] &= !mask;
        }
        self
    }

    /// BEP 42 id for an external IPv4 address. `r` is the random 3-bit seed,
    /// it also ends up as the last byte of the id.
    pub fn secure(ip: Ipv4Addr, r: u8) -> NodeId {
        let crc = secure_crc(ip, r);

        let mut id = rand::random::<[u8; ID_BYTES]>();
        id[0] = ((crc >> 24) & 0xff) as u8;
        id[1] = ((crc >> 16) & 0xff) as u8;
        id[2] = ((crc >> 8) & 0xf8) as u8 | (rand::random::<u8>() & 0x7);
        id[19] = r;
        NodeId(id)
    }

    pub fn is_secure_for(&self, ip: Ipv4Addr) -> bool {
        let crc = secure_crc(ip, self.0[19]);

        self.0[0] == ((crc >> 24) & 0xff) as u8
            && self.0[1] == ((crc >> 16) & 0xff) as u8
            && self.0[2] & 0xf8 == ((crc >> 8) & 0xf8) as u8
    }
}

fn secure_crc(ip: Ipv4Addr, r: u8) -> u32 {
    let ip = u32::from_be_bytes(ip.octets());
    let r_bits = u32::from(r & 0x7);
    crc32c(&((ip & 0x030f_3fff) | (r_bits << 29)).to_be_bytes())
}

impl From<[u8; ID_BYTES]> for NodeId {
    fn from(bytes: [u8; ID_BYTES]) -> Self {
        NodeId(bytes)
    }
}

impl TryFrom<&[u8]> for NodeId {
    type Error = IdError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; ID_BYTES] = bytes.try_into().map_err(|_| IdError::InvalidLength {
            expected: ID_BYTES,
            actual: bytes.len(),
        })?;
        Ok(NodeId(bytes))
    }
}

impl BitXor for NodeId {
    type Output = NodeId;

    fn bitxor(self, rhs: NodeId) -> NodeId {
        self.xor(&rhs)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| IdError::InvalidHex(e.to_string()))?;
        NodeId::try_from(bytes.as_slice())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// XOR of two identifiers read as a big-endian unsigned integer.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance(pub [u8; ID_BYTES]);

impl Distance {
    pub const ZERO: Distance = Distance([0u8; ID_BYTES]);
    pub const MAX: Distance = Distance([0xff; ID_BYTES]);
}

/// Contiguous range of the identifier space: every id whose first `len`
/// bits equal those of `bits`.
#[derive(Hash, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Prefix {
    bits: NodeId,
    len: usize,
}

impl Prefix {
    /// The whole identifier space.
    pub fn root() -> Self {
        Prefix {
            bits: NodeId([0u8; ID_BYTES]),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.bits.common_prefix_bits(id) >= self.len
    }

    pub fn can_split(&self) -> bool {
        self.len < ID_BITS
    }

    /// Halves the range on the next bit. Returns `(bit = 0, bit = 1)`.
    pub fn split(&self) -> (Prefix, Prefix) {
        let low = Prefix {
            bits: self.bits.with_bit(self.len, false),
            len: self.len + 1,
        };
        let high = Prefix {
            bits: self.bits.with_bit(self.len, true),
            len: self.len + 1,
        };
        (low, high)
    }

    /// Uniformly random identifier inside the range.
    pub fn random_id(&self) -> NodeId {
        let mut id = NodeId::random();
        for index in 0..self.len {
            id = id.with_bit(index, self.bits.bit(index));
        }
        id
    }

    /// Lowest identifier of the range, used to keep buckets ordered.
    pub fn start(&self) -> NodeId {
        let mut id = self.bits;
        for index in self.len..ID_BITS {
            id = id.with_bit(index, false);
        }
        id
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.start(), self.len)
    }
}
