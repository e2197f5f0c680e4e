//! Serializer roundtrip and schema-drift coverage.

use std::collections::BTreeMap;

use proptest::prelude::{Strategy, any, proptest};
use weft_codec::{ByteArray, Guid, decode, encode, weft_struct};

weft_struct! {
    struct Basic {
        char1: i8,
        uchar1: u8,
        short1: i16,
        ushort1: u16,
        bool1: bool,
        ulong64: u64,
        long64: i64,
        double: f64,
        string: String,
        long64_array: Vec<i64>,
        guid: Guid,
    }
}

#[test]
fn basic_object_roundtrip() {
    let object = Basic {
        char1: b'd' as i8,
        uchar1: 0xF8,
        short1: -10,
        ushort1: 10,
        bool1: true,
        ulong64: u64::MAX,
        long64: 0x0FFF_FFFF_FFFF_FFFF,
        double: 89.3,
        string: "Hello object".to_string(),
        long64_array: (0..16).collect(),
        guid: Guid::from_bytes_le([
            0x05, 0xF4, 0xE4, 0x14, 0x48, 0xBA, 0x51, 0x4B, 0x80, 0x84, 0x0B, 0x6C, 0x55, 0x23,
            0xF2, 0x9E,
        ]),
    };

    let bytes = encode(&object).unwrap();
    assert_eq!(decode::<Basic>(&bytes).unwrap(), object);
}

#[test]
fn zero_values_roundtrip() {
    let bytes = encode(&Basic::default()).unwrap();
    assert_eq!(decode::<Basic>(&bytes).unwrap(), Basic::default());
}

weft_struct! {
    struct Scalars {
        a: i16,
        b: i32,
        c: i64,
        d: u16,
        e: u32,
        f: u64,
        g: bool,
        h: f64,
        s: String,
    }
}

proptest! {
    #[test]
    fn scalar_roundtrip(
        a in any::<i16>(),
        b in any::<i32>(),
        c in any::<i64>(),
        d in any::<u16>(),
        e in any::<u32>(),
        f in any::<u64>(),
        g in any::<bool>(),
        h in any::<f64>().prop_filter("NaN never compares equal", |v| !v.is_nan()),
        s in "\\PC*",
    ) {
        let value = Scalars { a, b, c, d, e, f, g, h, s };
        let bytes = encode(&value).unwrap();
        proptest::prop_assert_eq!(decode::<Scalars>(&bytes).unwrap(), value);
    }

    #[test]
    fn byte_array_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        let value = ByteArrayHolder { data: ByteArray(data) };
        let bytes = encode(&value).unwrap();
        proptest::prop_assert_eq!(decode::<ByteArrayHolder>(&bytes).unwrap(), value);
    }
}

weft_struct! {
    struct ByteArrayHolder {
        data: ByteArray,
    }
}

weft_struct! {
    struct Inner {
        tag: u32,
        name: String,
    }
}

weft_struct! {
    struct Outer {
        items: Vec<Inner>,
        lookup: BTreeMap<u32, String>,
        next: Option<Box<Outer>>,
        label: Option<String>,
    }
}

#[test]
fn nested_pointers_arrays_maps_roundtrip() {
    let outer = Outer {
        items: vec![
            Inner { tag: 1, name: "one".into() },
            Inner { tag: 0, name: String::new() },
        ],
        lookup: [(7, "seven".to_string()), (0, String::new())].into_iter().collect(),
        next: Some(Box::new(Outer {
            items: Vec::new(),
            lookup: BTreeMap::new(),
            next: None,
            label: None,
        })),
        label: Some("outer".into()),
    };

    let bytes = encode(&outer).unwrap();
    assert_eq!(decode::<Outer>(&bytes).unwrap(), outer);
}

weft_struct! {
    struct BaseFields {
        base_id: u32,
        base_name: String,
    }
}

weft_struct! {
    struct DerivedFields {
        flatten base: BaseFields;
        extra: i64,
    }
}

#[test]
fn flattened_embedding_is_wire_compatible_with_inline_fields() {
    weft_struct! {
        struct InlineFields {
            base_id: u32,
            base_name: String,
            extra: i64,
        }
    }

    let derived = DerivedFields {
        base: BaseFields { base_id: 9, base_name: "base".into() },
        extra: -5,
    };
    let inline = InlineFields { base_id: 9, base_name: "base".into(), extra: -5 };

    assert_eq!(encode(&derived).unwrap(), encode(&inline).unwrap());
    assert_eq!(decode::<DerivedFields>(&encode(&inline).unwrap()).unwrap(), derived);
}

// The drift pair: V2 appends fields after V1's.
weft_struct! {
    struct DriftV1 {
        char1: i8,
    }
}

weft_struct! {
    struct DriftV2 {
        char1: i8,
        ulong64: u64,
        short1: i16,
        char_array: Vec<i8>,
    }
}

#[test]
fn newer_writer_older_reader_drops_extra_fields() {
    let v2 = DriftV2 {
        char1: b'F' as i8,
        ulong64: 0xF00D,
        short1: 0x0BAD,
        char_array: vec![b'y' as i8, b'e' as i8, b's' as i8],
    };

    let bytes = encode(&v2).unwrap();
    let v1: DriftV1 = decode(&bytes).unwrap();
    assert_eq!(v1, DriftV1 { char1: b'F' as i8 });

    // The same bytes still restore the full V2.
    assert_eq!(decode::<DriftV2>(&bytes).unwrap(), v2);
}

#[test]
fn older_writer_newer_reader_zero_fills_missing_fields() {
    let v1 = DriftV1 { char1: b'F' as i8 };
    let bytes = encode(&v1).unwrap();

    let v2: DriftV2 = decode(&bytes).unwrap();
    assert_eq!(
        v2,
        DriftV2 { char1: b'F' as i8, ulong64: 0, short1: 0, char_array: Vec::new() }
    );
}

#[test]
fn zero_integers_encode_as_empty_meta_only() {
    weft_struct! {
        struct Zeroes {
            a: u64,
            b: i32,
        }
    }

    let bytes = encode(&Zeroes::default()).unwrap();
    // Field area: two empty metas, no payload bytes.
    let field_area = &bytes[10..bytes.len() - 2];
    assert_eq!(field_area, [0x4A, 0x47]);
}
