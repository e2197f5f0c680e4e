//! GUID support.
//!
//! GUIDs travel as 16 bytes in the Windows mixed-endian layout (the
//! first three fields little-endian, the trailing eight bytes as-is).
//! The all-zero GUID elides its payload via the empty-value bit.

use uuid::Uuid;

use crate::decode::Decoder;
use crate::encode::Encoder;
use crate::error::CodecError;
use crate::meta::TypeMeta;
use crate::value::FabricValue;

/// A 128-bit globally unique identifier.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Guid(Uuid);

impl Guid {
    /// The all-zero GUID.
    pub const EMPTY: Guid = Guid(Uuid::nil());

    /// Generates a new version-4 (random) GUID.
    pub fn new_v4() -> Guid {
        Guid(Uuid::new_v4())
    }

    /// True for the all-zero GUID.
    pub fn is_empty(&self) -> bool {
        self.0.is_nil()
    }

    /// The GUID in its wire layout.
    pub fn to_bytes_le(self) -> [u8; 16] {
        self.0.to_bytes_le()
    }

    /// Builds a GUID from its wire layout.
    pub fn from_bytes_le(bytes: [u8; 16]) -> Guid {
        Guid(Uuid::from_bytes_le(bytes))
    }
}

impl From<Uuid> for Guid {
    fn from(uuid: Uuid) -> Guid {
        Guid(uuid)
    }
}

impl From<Guid> for Uuid {
    fn from(guid: Guid) -> Uuid {
        guid.0
    }
}

impl std::fmt::Display for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Debug for Guid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Guid({})", self.0)
    }
}

impl FabricValue for Guid {
    const ARRAY_META: TypeMeta = TypeMeta::OBJECT_ARRAY;

    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        if self.is_empty() {
            enc.write_meta(TypeMeta::GUID.empty());
            return Ok(());
        }
        enc.write_meta(TypeMeta::GUID);
        enc.write_bytes(&self.to_bytes_le());
        Ok(())
    }

    fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
        if meta.is_empty() {
            return Ok(Guid::EMPTY);
        }
        if !meta.is_base(TypeMeta::GUID) {
            return Err(CodecError::UnexpectedMeta { got: meta, expected: "guid" });
        }
        let bytes = dec.read_bytes(16)?;
        Ok(Guid::from_bytes_le(bytes.try_into().map_err(|_| CodecError::UnexpectedEof)?))
    }
}

#[cfg(test)]
mod tests {
    use super::Guid;
    use crate::value::{decode, encode};
    use crate::weft_struct;

    weft_struct! {
        struct Holder {
            id: Guid,
        }
    }

    #[test]
    fn roundtrip() {
        let holder = Holder { id: Guid::new_v4() };
        let bytes = encode(&holder).unwrap();
        assert_eq!(decode::<Holder>(&bytes).unwrap(), holder);
    }

    #[test]
    fn empty_guid_elides_payload() {
        let bytes = encode(&Holder::default()).unwrap();
        // Envelope plus a single empty-guid meta in the field scope.
        let field_area = &bytes[10..bytes.len() - 2];
        assert_eq!(field_area, [0x4C]);
        assert_eq!(decode::<Holder>(&bytes).unwrap(), Holder::default());
    }

    #[test]
    fn wire_layout_is_mixed_endian() {
        // {14E4F405-BA48-4B51-8084-0B6C5523F29E}
        let guid = Guid::from_bytes_le([
            0x05, 0xF4, 0xE4, 0x14, 0x48, 0xBA, 0x51, 0x4B, 0x80, 0x84, 0x0B, 0x6C, 0x55, 0x23,
            0xF2, 0x9E,
        ]);
        assert_eq!(guid.to_string(), "14e4f405-ba48-4b51-8084-0b6c5523f29e");
    }
}
