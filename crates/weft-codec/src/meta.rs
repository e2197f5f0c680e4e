//! The one-byte type meta that introduces every serialized value.
//!
//! The low nibble carries the base type; the high bits carry flags:
//! `EMPTY` (0x40) marks a zero value with no payload, `ARRAY` (0x80)
//! marks a length-prefixed element sequence. Booleans are a special
//! case: both values are payload-free, and `false` is distinguished by
//! the 0x30 flag pair.

/// Self-describing type tag preceding each value on the wire.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct TypeMeta(u8);

impl TypeMeta {
    /// Flag bit: the value is the zero value of its base type and no
    /// payload follows.
    pub const EMPTY_VALUE_BIT: u8 = 0x40;
    /// Flag bit: a compressed element count and elements follow.
    pub const ARRAY_BIT: u8 = 0x80;
    /// Mask selecting the base type nibble.
    pub const BASE_TYPE_MASK: u8 = 0x0F;
    /// Flag pair distinguishing `false` from `true`.
    pub const BOOL_FALSE_FLAG: u8 = 0x30;

    /// Object (struct) scope.
    pub const OBJECT: TypeMeta = TypeMeta(0x00);
    /// Pointer to a value; null pointers use the empty bit.
    pub const POINTER: TypeMeta = TypeMeta(0x01);
    /// Boolean `true` (always written with the empty bit).
    pub const BOOL: TypeMeta = TypeMeta(0x02);
    /// Boolean `false` (always written with the empty bit).
    pub const BOOL_FALSE: TypeMeta = TypeMeta(0x02 | Self::BOOL_FALSE_FLAG);
    /// Signed 8-bit value, raw byte payload.
    pub const CHAR: TypeMeta = TypeMeta(0x03);
    /// Unsigned 8-bit value, raw byte payload.
    pub const UCHAR: TypeMeta = TypeMeta(0x04);
    /// Signed 16-bit value, compressed payload.
    pub const SHORT: TypeMeta = TypeMeta(0x05);
    /// Unsigned 16-bit value, compressed payload.
    pub const USHORT: TypeMeta = TypeMeta(0x06);
    /// Signed 32-bit value, compressed payload.
    pub const INT32: TypeMeta = TypeMeta(0x07);
    /// Unsigned 32-bit value, compressed payload.
    pub const UINT32: TypeMeta = TypeMeta(0x08);
    /// Signed 64-bit value, compressed payload.
    pub const INT64: TypeMeta = TypeMeta(0x09);
    /// Unsigned 64-bit value, compressed payload.
    pub const UINT64: TypeMeta = TypeMeta(0x0A);
    /// IEEE-754 double, 8-byte little-endian payload.
    pub const DOUBLE: TypeMeta = TypeMeta(0x0B);
    /// GUID, 16-byte little-endian mixed field layout.
    pub const GUID: TypeMeta = TypeMeta(0x0C);
    /// Wide string; only ever appears with the array bit.
    pub const WSTRING: TypeMeta = TypeMeta(0x0D);
    /// Borrowed byte run (always an array).
    pub const BYTE_ARRAY_NO_COPY: TypeMeta = TypeMeta(0x0E | Self::ARRAY_BIT);
    /// Opens an object field scope.
    pub const SCOPE_BEGIN: TypeMeta = TypeMeta(0x1F);
    /// Closes an object field scope.
    pub const SCOPE_END: TypeMeta = TypeMeta(0x2F);
    /// Terminates an object.
    pub const OBJECT_END: TypeMeta = TypeMeta(0x3F);
    /// Sentinel for "no valid meta".
    pub const NOT_A_META: TypeMeta = TypeMeta(0xFF);

    /// Object array meta, the element tag for struct and map sequences.
    pub const OBJECT_ARRAY: TypeMeta = Self::OBJECT.array();
    /// Wide-string array meta, the tag for string payloads.
    pub const WSTRING_ARRAY: TypeMeta = Self::WSTRING.array();
    /// Unsigned-byte array meta, the tag for raw byte runs.
    pub const UCHAR_ARRAY: TypeMeta = Self::UCHAR.array();

    /// Wraps a raw meta byte read from the wire.
    pub const fn from_raw(raw: u8) -> TypeMeta {
        TypeMeta(raw)
    }

    /// The raw meta byte.
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// This meta with the empty-value bit set.
    pub const fn empty(self) -> TypeMeta {
        TypeMeta(self.0 | Self::EMPTY_VALUE_BIT)
    }

    /// This meta with the array bit set.
    pub const fn array(self) -> TypeMeta {
        TypeMeta(self.0 | Self::ARRAY_BIT)
    }

    /// True if the empty-value bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 & Self::EMPTY_VALUE_BIT != 0
    }

    /// True if the array bit is set.
    pub const fn is_array(self) -> bool {
        self.0 & Self::ARRAY_BIT != 0
    }

    /// True if the base type nibble matches `base`.
    pub const fn is_base(self, base: TypeMeta) -> bool {
        self.0 & Self::BASE_TYPE_MASK == base.0 & Self::BASE_TYPE_MASK
    }
}

impl std::fmt::Debug for TypeMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TypeMeta({:#04x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::TypeMeta;

    #[test]
    fn flags() {
        assert!(TypeMeta::WSTRING_ARRAY.is_array());
        assert!(!TypeMeta::WSTRING.is_array());
        assert!(TypeMeta::INT64.empty().is_empty());
        assert!(TypeMeta::INT64.empty().is_base(TypeMeta::INT64));
        assert_eq!(TypeMeta::BOOL_FALSE.raw(), 0x32);
        assert_eq!(TypeMeta::BYTE_ARRAY_NO_COPY.raw(), 0x8E);
    }
}
