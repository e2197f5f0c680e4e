//! The value trait wiring Rust types to the self-describing format.
//!
//! Every encodable type implements [`FabricValue`]; struct types add
//! [`FabricStruct`] (normally via the [`weft_struct!`] macro) so their
//! ordered fields can be flattened into an enclosing object scope.
//!
//! [`weft_struct!`]: crate::weft_struct

use std::collections::{BTreeMap, HashMap};

use crate::decode::{Decoder, ObjectScope};
use crate::encode::Encoder;
use crate::error::CodecError;
use crate::meta::TypeMeta;

/// A value with a self-describing wire encoding.
///
/// `write_value` emits the type meta and payload; `read_value` receives
/// the already-consumed meta. Implementations own their empty-value
/// handling: zero values emit the empty meta with no payload, and any
/// meta with the empty bit decodes to the type's default.
pub trait FabricValue: Sized {
    /// Meta introducing a `Vec<Self>` payload.
    ///
    /// Numeric and struct elements use their base meta with the array
    /// bit; string and pointer elements use the bare `UInt32` meta (a
    /// quirk of the original wire format, kept for compatibility).
    const ARRAY_META: TypeMeta;

    /// Writes the meta and payload for this value.
    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError>;

    /// Reads a value whose meta has already been consumed.
    fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError>;
}

/// A struct whose fields serialize in declaration order.
///
/// Implemented by [`weft_struct!`]; the field-level methods exist so an
/// embedded base struct can be flattened into a derived struct's scope.
///
/// [`weft_struct!`]: crate::weft_struct
pub trait FabricStruct: Default {
    /// Writes the fields, without the object envelope.
    fn write_fields(&self, enc: &mut Encoder) -> Result<(), CodecError>;

    /// Reads fields from an open scope. Fields missing from the wire
    /// (older writer) keep their default values.
    fn read_fields(
        &mut self,
        dec: &mut Decoder<'_>,
        scope: &mut ObjectScope,
    ) -> Result<(), CodecError>;
}

/// Serializes `value` to its wire form.
pub fn encode<T: FabricValue>(value: &T) -> Result<Vec<u8>, CodecError> {
    let mut enc = Encoder::new();
    value.write_value(&mut enc)?;
    Ok(enc.into_bytes())
}

/// Deserializes a value from its wire form.
pub fn decode<T: FabricValue>(data: &[u8]) -> Result<T, CodecError> {
    let mut dec = Decoder::new(data);
    let meta = dec.read_meta()?;
    T::read_value(&mut dec, meta)
}

macro_rules! compressed_unsigned_impl {
    ($ty:ty, $bits:expr, $meta:expr, $expected:expr) => {
        impl FabricValue for $ty {
            const ARRAY_META: TypeMeta = $meta.array();

            fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
                if *self == 0 {
                    enc.write_meta($meta.empty());
                } else {
                    enc.write_meta($meta);
                    enc.write_compressed_unsigned($bits, u64::from(*self));
                }
                Ok(())
            }

            fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
                if meta.is_empty() {
                    return Ok(0);
                }
                match meta {
                    TypeMeta::USHORT | TypeMeta::UINT32 | TypeMeta::UINT64 => {
                        Ok(dec.read_compressed_unsigned($bits)? as $ty)
                    }
                    got => Err(CodecError::UnexpectedMeta { got, expected: $expected }),
                }
            }
        }
    };
}

macro_rules! compressed_signed_impl {
    ($ty:ty, $bits:expr, $meta:expr, $expected:expr) => {
        impl FabricValue for $ty {
            const ARRAY_META: TypeMeta = $meta.array();

            fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
                if *self == 0 {
                    enc.write_meta($meta.empty());
                } else {
                    enc.write_meta($meta);
                    enc.write_compressed_signed($bits, i64::from(*self));
                }
                Ok(())
            }

            fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
                if meta.is_empty() {
                    return Ok(0);
                }
                match meta {
                    TypeMeta::SHORT | TypeMeta::INT32 | TypeMeta::INT64 => {
                        Ok(dec.read_compressed_signed($bits)? as $ty)
                    }
                    got => Err(CodecError::UnexpectedMeta { got, expected: $expected }),
                }
            }
        }
    };
}

compressed_unsigned_impl!(u16, 16, TypeMeta::USHORT, "ushort");
compressed_unsigned_impl!(u32, 32, TypeMeta::UINT32, "uint32");
compressed_unsigned_impl!(u64, 64, TypeMeta::UINT64, "uint64");
compressed_signed_impl!(i16, 16, TypeMeta::SHORT, "short");
compressed_signed_impl!(i32, 32, TypeMeta::INT32, "int32");
compressed_signed_impl!(i64, 64, TypeMeta::INT64, "int64");

impl FabricValue for u8 {
    const ARRAY_META: TypeMeta = TypeMeta::UCHAR_ARRAY;

    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        if *self == 0 {
            enc.write_meta(TypeMeta::UCHAR.empty());
        } else {
            enc.write_meta(TypeMeta::UCHAR);
            enc.write_u8(*self);
        }
        Ok(())
    }

    fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
        if meta.is_empty() {
            return Ok(0);
        }
        match meta {
            TypeMeta::UCHAR | TypeMeta::CHAR => dec.read_u8(),
            got => Err(CodecError::UnexpectedMeta { got, expected: "uchar" }),
        }
    }
}

impl FabricValue for i8 {
    const ARRAY_META: TypeMeta = TypeMeta::CHAR.array();

    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        if *self == 0 {
            enc.write_meta(TypeMeta::CHAR.empty());
        } else {
            enc.write_meta(TypeMeta::CHAR);
            enc.write_u8(*self as u8);
        }
        Ok(())
    }

    fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
        if meta.is_empty() {
            return Ok(0);
        }
        match meta {
            TypeMeta::CHAR | TypeMeta::UCHAR => dec.read_u8().map(|b| b as i8),
            got => Err(CodecError::UnexpectedMeta { got, expected: "char" }),
        }
    }
}

impl FabricValue for bool {
    const ARRAY_META: TypeMeta = TypeMeta::BOOL.array();

    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        // Both boolean values are payload-free.
        let meta = if *self { TypeMeta::BOOL } else { TypeMeta::BOOL_FALSE };
        enc.write_meta(meta.empty());
        Ok(())
    }

    fn read_value(_dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
        if meta == TypeMeta::BOOL.empty() {
            Ok(true)
        } else if meta == TypeMeta::BOOL_FALSE.empty() {
            Ok(false)
        } else {
            Err(CodecError::UnexpectedMeta { got: meta, expected: "bool" })
        }
    }
}

impl FabricValue for f64 {
    const ARRAY_META: TypeMeta = TypeMeta::DOUBLE.array();

    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        if *self == 0.0 {
            enc.write_meta(TypeMeta::DOUBLE.empty());
        } else {
            enc.write_meta(TypeMeta::DOUBLE);
            enc.write_bytes(&self.to_le_bytes());
        }
        Ok(())
    }

    fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
        if meta.is_empty() {
            return Ok(0.0);
        }
        if meta != TypeMeta::DOUBLE {
            return Err(CodecError::UnexpectedMeta { got: meta, expected: "double" });
        }
        let bytes = dec.read_bytes(8)?;
        Ok(f64::from_le_bytes(bytes.try_into().map_err(|_| CodecError::UnexpectedEof)?))
    }
}

impl FabricValue for String {
    // String elements count with the bare UInt32 meta.
    const ARRAY_META: TypeMeta = TypeMeta::UINT32;

    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        if self.is_empty() {
            enc.write_meta(TypeMeta::WSTRING_ARRAY.empty());
            return Ok(());
        }
        enc.write_meta(TypeMeta::WSTRING_ARRAY);
        let units: Vec<u16> = self.encode_utf16().collect();
        enc.write_compressed_u32(units.len() as u32);
        for unit in units {
            enc.write_bytes(&unit.to_le_bytes());
        }
        Ok(())
    }

    fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
        if meta.is_empty() {
            return Ok(String::new());
        }
        if meta != TypeMeta::WSTRING_ARRAY {
            return Err(CodecError::UnexpectedMeta { got: meta, expected: "wide string" });
        }
        let count = dec.read_compressed_u32()? as usize;
        let bytes = dec.read_bytes(count.checked_mul(2).ok_or(CodecError::UnexpectedEof)?)?;
        let units: Vec<u16> =
            bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
        // Unpaired surrogates decode to the replacement character.
        Ok(String::from_utf16_lossy(&units))
    }
}

impl<T: FabricValue> FabricValue for Option<T> {
    // Pointer elements count with the bare UInt32 meta.
    const ARRAY_META: TypeMeta = TypeMeta::UINT32;

    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        match self {
            None => {
                enc.write_meta(TypeMeta::POINTER.empty());
                Ok(())
            }
            Some(inner) => {
                enc.write_meta(TypeMeta::POINTER);
                inner.write_value(enc)
            }
        }
    }

    fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
        if meta.is_empty() {
            return Ok(None);
        }
        if !meta.is_base(TypeMeta::POINTER) {
            return Err(CodecError::UnexpectedMeta { got: meta, expected: "pointer" });
        }
        let inner_meta = dec.read_meta()?;
        T::read_value(dec, inner_meta).map(Some)
    }
}

impl<T: FabricValue> FabricValue for Box<T> {
    const ARRAY_META: TypeMeta = T::ARRAY_META;

    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        (**self).write_value(enc)
    }

    fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
        T::read_value(dec, meta).map(Box::new)
    }
}

impl<T: FabricValue> FabricValue for Vec<T> {
    // Arrays of arrays do not occur on the wire.
    const ARRAY_META: TypeMeta = TypeMeta::NOT_A_META;

    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        if self.is_empty() {
            enc.write_meta(T::ARRAY_META.empty());
            return Ok(());
        }
        enc.write_meta(T::ARRAY_META);
        enc.write_compressed_u32(self.len() as u32);
        for element in self {
            element.write_value(enc)?;
        }
        Ok(())
    }

    fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
        if meta.is_empty() {
            return Ok(Vec::new());
        }
        let count = dec.read_compressed_u32()? as usize;
        let mut out = Vec::new();
        for _ in 0..count {
            let element_meta = dec.read_meta()?;
            out.push(T::read_value(dec, element_meta)?);
        }
        Ok(out)
    }
}

/// Raw byte run: a `UChar` array whose payload is the bytes themselves,
/// with no per-element metas. This is the layout used by fixed binary
/// blobs such as GUID-like identifiers.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ByteArray(pub Vec<u8>);

impl FabricValue for ByteArray {
    const ARRAY_META: TypeMeta = TypeMeta::NOT_A_META;

    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        if self.0.is_empty() {
            enc.write_meta(TypeMeta::UCHAR_ARRAY.empty());
            return Ok(());
        }
        enc.write_meta(TypeMeta::UCHAR_ARRAY);
        enc.write_compressed_u32(self.0.len() as u32);
        enc.write_bytes(&self.0);
        Ok(())
    }

    fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
        if meta.is_empty() {
            return Ok(ByteArray(Vec::new()));
        }
        if meta != TypeMeta::UCHAR_ARRAY {
            return Err(CodecError::UnexpectedMeta { got: meta, expected: "byte array" });
        }
        let count = dec.read_compressed_u32()? as usize;
        Ok(ByteArray(dec.read_bytes(count)?.to_vec()))
    }
}

// Map entries travel as an array of anonymous {key, value} objects.
struct MapEntryRef<'a, K, V> {
    key: &'a K,
    value: &'a V,
}

fn write_map_entries<'a, K, V, I>(enc: &mut Encoder, len: usize, entries: I) -> Result<(), CodecError>
where
    K: FabricValue,
    V: FabricValue,
    I: Iterator<Item = MapEntryRef<'a, K, V>>,
    K: 'a,
    V: 'a,
{
    if len == 0 {
        enc.write_meta(TypeMeta::OBJECT_ARRAY.empty());
        return Ok(());
    }
    enc.write_meta(TypeMeta::OBJECT_ARRAY);
    enc.write_compressed_u32(len as u32);
    for entry in entries {
        enc.begin_struct()?;
        entry.key.write_value(enc)?;
        entry.value.write_value(enc)?;
        enc.end_struct()?;
    }
    Ok(())
}

fn read_map_entries<K, V>(
    dec: &mut Decoder<'_>,
    meta: TypeMeta,
) -> Result<Vec<(K, V)>, CodecError>
where
    K: FabricValue + Default,
    V: FabricValue + Default,
{
    if meta.is_empty() {
        return Ok(Vec::new());
    }
    if meta != TypeMeta::OBJECT_ARRAY {
        return Err(CodecError::UnexpectedMeta { got: meta, expected: "map entry array" });
    }
    let count = dec.read_compressed_u32()? as usize;
    let mut out = Vec::new();
    for _ in 0..count {
        let entry_meta = dec.read_meta()?;
        let mut scope = dec.begin_struct(entry_meta)?;
        let mut key = K::default();
        let mut value = V::default();
        if let Some(m) = scope.next_field(dec)? {
            key = K::read_value(dec, m)?;
        }
        if let Some(m) = scope.next_field(dec)? {
            value = V::read_value(dec, m)?;
        }
        dec.end_struct(scope)?;
        out.push((key, value));
    }
    Ok(out)
}

impl<K, V> FabricValue for BTreeMap<K, V>
where
    K: FabricValue + Default + Ord,
    V: FabricValue + Default,
{
    const ARRAY_META: TypeMeta = TypeMeta::NOT_A_META;

    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        write_map_entries(
            enc,
            self.len(),
            self.iter().map(|(key, value)| MapEntryRef { key, value }),
        )
    }

    fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
        Ok(read_map_entries(dec, meta)?.into_iter().collect())
    }
}

impl<K, V> FabricValue for HashMap<K, V>
where
    K: FabricValue + Default + Eq + std::hash::Hash,
    V: FabricValue + Default,
{
    const ARRAY_META: TypeMeta = TypeMeta::NOT_A_META;

    fn write_value(&self, enc: &mut Encoder) -> Result<(), CodecError> {
        write_map_entries(
            enc,
            self.len(),
            self.iter().map(|(key, value)| MapEntryRef { key, value }),
        )
    }

    fn read_value(dec: &mut Decoder<'_>, meta: TypeMeta) -> Result<Self, CodecError> {
        Ok(read_map_entries(dec, meta)?.into_iter().collect())
    }
}
