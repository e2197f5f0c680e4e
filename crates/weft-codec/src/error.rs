//! Error types for the structured serializer.
//!
//! Every decode failure is a format error: the input either was not
//! produced by a conforming encoder or was corrupted in transit. Callers
//! treat these as fatal for the surrounding connection.

use thiserror::Error;

use crate::meta::TypeMeta;

/// Errors produced while encoding or decoding the structured wire format.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// A type meta did not match what the target type expects.
    #[error("unexpected type meta {got:?}, expected {expected}")]
    UnexpectedMeta {
        /// The meta byte that was read.
        got: TypeMeta,
        /// Human-readable description of what was expected.
        expected: &'static str,
    },

    /// Input ended before the value was complete.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A compressed integer ran past the maximum encoded length for its
    /// width (3, 5 or 10 bytes for 16/32/64-bit values).
    #[error("compressed integer exceeds {max_bytes} bytes for a {bits}-bit value")]
    IntegerOverflow {
        /// Bit width of the target integer.
        bits: u32,
        /// Maximum number of encoded bytes for that width.
        max_bytes: usize,
    },

    /// An object header carried a size that does not fit the input.
    #[error("object size {size} out of bounds at offset {offset}")]
    BadObjectSize {
        /// The declared object size.
        size: u32,
        /// Offset of the object header in the input.
        offset: usize,
    },

    /// An object declared embedded type information of length zero.
    #[error("object type information length must be non-zero")]
    EmptyTypeInformation,

    /// A fixed-length array (GUID, node id) had the wrong element count.
    #[error("fixed array length mismatch: got {got}, expected {expected}")]
    FixedArrayLength {
        /// Element count read from the wire.
        got: u32,
        /// Element count the type requires.
        expected: u32,
    },
}
