//! Ring node identifiers.
//!
//! A node id is a 128-bit number with a total order; the ring metric is
//! subtraction modulo 2^128. On the wire a node id is a 16-byte
//! unsigned-char array (high half first, each half little-endian).

use md5::{Digest, Md5};
use weft_codec::{CodecError, Decoder, Encoder, FabricValue, TypeMeta, weft_struct};

/// Unique identifier of a node in the federation ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u128);

const NODE_ID_WIRE_LEN: u32 = 16;

impl NodeId {
    /// The smallest node id, the origin of the ring.
    pub const MIN: NodeId = NodeId(0);

    /// Builds a node id from its hexadecimal form.
    pub fn from_hex(hex: &str) -> Result<NodeId, std::num::ParseIntError> {
        u128::from_str_radix(hex, 16).map(NodeId)
    }

    /// Hashes an arbitrary name into a node id using MD5.
    pub fn from_md5(name: &str) -> NodeId {
        let digest = Md5::digest(name.as_bytes());
        let hi = u64::from_le_bytes(digest[0..8].try_into().unwrap_or_default());
        let lo = u64::from_le_bytes(digest[8..16].try_into().unwrap_or_default());
        NodeId::from_halves(hi, lo)
    }

    /// Distance from `from` to `self` walking the ring forward.
    pub fn ring_distance_from(self, from: NodeId) -> u128 {
        self.0.wrapping_sub(from.0)
    }

    pub(crate) const fn from_halves(hi: u64, lo: u64) -> NodeId {
        NodeId((hi as u128) << 64 | lo as u128)
    }

    pub(crate) const fn hi(self) -> u64 {
        (self.0 >> 64) as u64
    }

    pub(crate) const fn lo(self) -> u64 {
        self.0 as u64
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl FabricValue for NodeId {
    const ARRAY_META: TypeMeta = TypeMeta::OBJECT_ARRAY;

    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        enc.write_meta(TypeMeta::UCHAR_ARRAY);
        enc.write_compressed_u32(NODE_ID_WIRE_LEN);
        enc.write_bytes(&self.hi().to_le_bytes());
        enc.write_bytes(&self.lo().to_le_bytes());
        Ok(())
    }

    fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
        if meta != TypeMeta::UCHAR_ARRAY {
            return Err(CodecError::UnexpectedMeta { got: meta, expected: "node id byte array" });
        }
        let len = dec.read_compressed_u32()?;
        if len != NODE_ID_WIRE_LEN {
            return Err(CodecError::FixedArrayLength { got: len, expected: NODE_ID_WIRE_LEN });
        }
        let bytes = dec.read_bytes(16)?;
        let hi = u64::from_le_bytes(bytes[0..8].try_into().unwrap_or_default());
        let lo = u64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default());
        Ok(NodeId::from_halves(hi, lo))
    }
}

weft_struct! {
    /// A node id paired with the instance number of its current
    /// incarnation.
    #[derive(Copy, Eq, Hash)]
    pub struct NodeInstance {
        /// The node's ring id.
        pub id: NodeId,
        /// Ever-increasing incarnation number.
        pub instance_id: u64,
    }
}

/// A claimed arc of the ring, from `begin` to `end` inclusive. A range
/// whose `begin` exceeds its `end` wraps around zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeIdRange {
    /// First id covered by the range.
    pub begin: NodeId,
    /// Last id covered by the range.
    pub end: NodeId,
}

impl NodeIdRange {
    /// True iff `id` lies on the inclusive arc from `begin` to `end`.
    pub fn contains(&self, id: NodeId) -> bool {
        if self.begin > self.end {
            id >= self.begin || id <= self.end
        } else {
            self.begin <= id && id <= self.end
        }
    }
}

// A range travels as two node ids back to back, with no object
// envelope of its own.
impl FabricValue for NodeIdRange {
    const ARRAY_META: TypeMeta = TypeMeta::OBJECT_ARRAY;

    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        self.begin.write_value(enc)?;
        self.end.write_value(enc)
    }

    fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
        let begin = NodeId::read_value(dec, meta)?;
        let end_meta = dec.read_meta()?;
        let end = NodeId::read_value(dec, end_meta)?;
        Ok(NodeIdRange { begin, end })
    }
}

// The name-based v4 generator hashes with a fixed Pearson permutation
// table over the UTF-16 form of the name, bracketed by these salts.
const PEARSON_PREFIX: &str = "UTzJ";
const PEARSON_SUFFIX: &str = "X3if";

#[rustfmt::skip]
const PEARSON_TABLE: [u8; 256] = [
    1, 87, 49, 12, 176, 178, 102, 166, 121, 193, 6, 84, 249, 230, 44, 163,
    14, 197, 213, 181, 161, 85, 218, 80, 64, 239, 24, 226, 236, 142, 38, 200,
    110, 177, 104, 103, 141, 253, 255, 50, 77, 101, 81, 18, 45, 96, 31, 222,
    25, 107, 190, 70, 86, 237, 240, 34, 72, 242, 20, 214, 244, 227, 149, 235,
    97, 234, 57, 22, 60, 250, 82, 175, 208, 5, 127, 199, 111, 62, 135, 248,
    174, 169, 211, 58, 66, 154, 106, 195, 245, 171, 17, 187, 182, 179, 0, 243,
    132, 56, 148, 75, 128, 133, 158, 100, 130, 126, 91, 13, 153, 246, 216, 219,
    119, 68, 223, 78, 83, 88, 201, 99, 122, 11, 92, 32, 136, 114, 52, 10,
    138, 30, 48, 183, 156, 35, 61, 26, 143, 74, 251, 94, 129, 162, 63, 152,
    170, 7, 115, 167, 241, 206, 3, 150, 55, 59, 151, 220, 90, 53, 23, 131,
    125, 173, 15, 238, 79, 95, 89, 16, 105, 137, 225, 224, 217, 160, 37, 123,
    118, 73, 2, 157, 46, 116, 9, 145, 134, 228, 207, 212, 202, 215, 69, 229,
    27, 188, 67, 124, 168, 252, 42, 4, 29, 108, 21, 247, 19, 205, 39, 203,
    233, 40, 186, 147, 198, 192, 155, 33, 164, 191, 98, 204, 165, 180, 117, 76,
    140, 36, 210, 172, 41, 54, 159, 8, 185, 232, 113, 196, 231, 47, 146, 120,
    51, 65, 28, 144, 254, 221, 93, 189, 194, 139, 112, 43, 71, 109, 184, 209,
];

// Not a standard Pearson hash: 16 rounds over the UTF-16LE bytes, each
// seeded from the first byte plus the round index.
fn pearson_hash(value: &str) -> [u8; 16] {
    let salted = format!("{PEARSON_PREFIX}{value}{PEARSON_SUFFIX}");
    let input: Vec<u8> =
        salted.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect();

    let mut hash = [0u8; 16];
    for (round, out) in hash.iter_mut().enumerate() {
        let mut h = PEARSON_TABLE[usize::from(input[0].wrapping_add(round as u8))];
        for &byte in &input[1..] {
            h = PEARSON_TABLE[usize::from(h ^ byte)];
        }
        *out = h;
    }
    hash
}

fn node_id_from_hash(hash: [u8; 16]) -> NodeId {
    let hi = u64::from_le_bytes(hash[0..8].try_into().unwrap_or_default());
    let lo = u64::from_le_bytes(hash[8..16].try_into().unwrap_or_default());
    NodeId::from_halves(hi, lo)
}

impl NodeId {
    /// Derives a node id from a `rolename.instance` style name, the
    /// scheme used by v4-generation cluster manifests: the Pearson hash
    /// of the full name, with the top 24 bits replaced by a multiplier
    /// spread of the role-relative instance number.
    pub fn from_v4_generator(name: &str) -> NodeId {
        let full = node_id_from_hash(pearson_hash(name));

        let Some(index) = name.rfind(['.', '_']) else {
            return full;
        };
        let role_name = &name[..index];
        let Ok(instance) = name[index + 1..].parse::<u64>() else {
            return full;
        };

        let role = node_id_from_hash(pearson_hash(role_name));
        let offset = role.lo() & 0x00FF_FFFF;
        let instance_x = (offset + instance) & 0x00FF_FFFF;
        let instance_y = (instance_x * 14_938_617) & 0x00FF_FFFF;

        let hi = (full.hi() & 0x0000_00FF_FFFF_FFFF) | (instance_y << 40);
        NodeId::from_halves(hi, full.lo())
    }
}
