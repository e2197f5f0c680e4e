//! Self-describing structured serializer for the weft wire protocol.
//!
//! Every value on the wire is introduced by a one-byte [`TypeMeta`]:
//! base type in the low nibble, array/empty flags in the high bits.
//! Integers are variable-length compressed, strings are UTF-16LE code
//! unit arrays, and structs are framed object scopes carrying their own
//! size, which is what makes the format tolerant of schema drift in
//! both directions.
//!
//! Types opt in by implementing [`FabricValue`]; struct types normally
//! use the [`weft_struct!`] macro, which generates the field walk in
//! declaration order and supports flattened embedding. Types with a
//! bespoke layout (GUIDs, ring node ids) implement the trait by hand
//! and write their own meta.

mod compress;
mod decode;
mod encode;
mod error;
mod guid;
mod macros;
mod meta;
mod value;

pub use decode::{Decoder, ObjectScope};
pub use encode::Encoder;
pub use error::CodecError;
pub use guid::Guid;
pub use meta::TypeMeta;
pub use value::{ByteArray, FabricStruct, FabricValue, decode, encode};
