//! Declarative struct registration for the serializer.
//!
//! The original format walks struct fields with runtime reflection;
//! here a macro generates the same walk at compile time. Fields encode
//! in declaration order, and an optional `flatten base: Base;` line
//! splices an embedded struct's fields into this struct's scope before
//! its own (base fields before derived fields on the wire).

/// Forwards the wire codec of a single-field tuple struct to its inner
/// type. Used for typed wrappers over wire integers (actors, error
/// codes, phases) that should serialize exactly like the raw value.
#[macro_export]
macro_rules! weft_newtype {
    ($name:ident => $inner:ty) => {
        impl $crate::FabricValue for $name {
            const ARRAY_META: $crate::TypeMeta = <$inner as $crate::FabricValue>::ARRAY_META;

            fn write_value(
                &self,
                enc: &mut $crate::Encoder,
            ) -> Result<(), $crate::CodecError> {
                $crate::FabricValue::write_value(&self.0, enc)
            }

            fn read_value(
                dec: &mut $crate::Decoder<'_>,
                meta: $crate::TypeMeta,
            ) -> Result<Self, $crate::CodecError> {
                <$inner as $crate::FabricValue>::read_value(dec, meta).map($name)
            }
        }
    };
}

/// Defines a struct together with its wire codec.
///
/// ```
/// use weft_codec::weft_struct;
///
/// weft_struct! {
///     /// A point with a label.
///     pub struct Labeled {
///         pub x: i32,
///         pub y: i32,
///         pub label: String,
///     }
/// }
///
/// let bytes = weft_codec::encode(&Labeled { x: 3, y: -4, label: "p".into() }).unwrap();
/// let back: Labeled = weft_codec::decode(&bytes).unwrap();
/// assert_eq!(back.x, 3);
/// ```
///
/// An optional leading `flatten base: Base;` line embeds another
/// struct's fields inline ahead of this struct's own. Versioning works
/// both ways: a reader with fewer fields skips the remainder of the
/// object scope, and a reader with more fields leaves the extras at
/// their defaults.
#[macro_export]
macro_rules! weft_struct {
    (
        $(#[$smeta:meta])*
        $vis:vis struct $name:ident {
            flatten $bname:ident : $bty:ty;
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $fname:ident : $fty:ty
            ),* $(,)?
        }
    ) => {
        $crate::weft_struct! {
            @impl
            $(#[$smeta])*
            $vis struct $name {
                flatten $bname : $bty;
                $(
                    $(#[$fmeta])*
                    $fvis $fname : $fty
                ),*
            }
        }
    };
    (
        $(#[$smeta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $fname:ident : $fty:ty
            ),* $(,)?
        }
    ) => {
        $crate::weft_struct! {
            @impl
            $(#[$smeta])*
            $vis struct $name {
                $(
                    $(#[$fmeta])*
                    $fvis $fname : $fty
                ),*
            }
        }
    };
    (
        @impl
        $(#[$smeta:meta])*
        $vis:vis struct $name:ident {
            flatten $bname:ident : $bty:ty;
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $fname:ident : $fty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$smeta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            /// Flattened base: its fields serialize inline before this
            /// struct's own fields.
            $vis $bname : $bty,
            $(
                $(#[$fmeta])*
                $fvis $fname : $fty,
            )*
        }

        impl $crate::FabricStruct for $name {
            fn write_fields(
                &self,
                enc: &mut $crate::Encoder,
            ) -> Result<(), $crate::CodecError> {
                $crate::FabricStruct::write_fields(&self.$bname, enc)?;
                $( $crate::FabricValue::write_value(&self.$fname, enc)?; )*
                Ok(())
            }

            fn read_fields(
                &mut self,
                dec: &mut $crate::Decoder<'_>,
                scope: &mut $crate::ObjectScope,
            ) -> Result<(), $crate::CodecError> {
                $crate::FabricStruct::read_fields(&mut self.$bname, dec, scope)?;
                $(
                    if let Some(meta) = scope.next_field(dec)? {
                        self.$fname = $crate::FabricValue::read_value(dec, meta)?;
                    }
                )*
                Ok(())
            }
        }

        impl $crate::FabricValue for $name {
            const ARRAY_META: $crate::TypeMeta = $crate::TypeMeta::OBJECT_ARRAY;

            fn write_value(
                &self,
                enc: &mut $crate::Encoder,
            ) -> Result<(), $crate::CodecError> {
                enc.begin_struct()?;
                $crate::FabricStruct::write_fields(self, enc)?;
                enc.end_struct()
            }

            fn read_value(
                dec: &mut $crate::Decoder<'_>,
                meta: $crate::TypeMeta,
            ) -> Result<Self, $crate::CodecError> {
                if meta.is_empty() {
                    return Ok(Self::default());
                }
                let mut scope = dec.begin_struct(meta)?;
                let mut value = Self::default();
                $crate::FabricStruct::read_fields(&mut value, dec, &mut scope)?;
                dec.end_struct(scope)?;
                Ok(value)
            }
        }
    };
    (
        @impl
        $(#[$smeta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$fmeta:meta])*
                $fvis:vis $fname:ident : $fty:ty
            ),* $(,)?
        }
    ) => {
        $(#[$smeta])*
        #[derive(Debug, Clone, Default, PartialEq)]
        $vis struct $name {
            $(
                $(#[$fmeta])*
                $fvis $fname : $fty,
            )*
        }

        impl $crate::FabricStruct for $name {
            fn write_fields(
                &self,
                enc: &mut $crate::Encoder,
            ) -> Result<(), $crate::CodecError> {
                $( $crate::FabricValue::write_value(&self.$fname, enc)?; )*
                Ok(())
            }

            fn read_fields(
                &mut self,
                dec: &mut $crate::Decoder<'_>,
                scope: &mut $crate::ObjectScope,
            ) -> Result<(), $crate::CodecError> {
                $(
                    if let Some(meta) = scope.next_field(dec)? {
                        self.$fname = $crate::FabricValue::read_value(dec, meta)?;
                    }
                )*
                Ok(())
            }
        }

        impl $crate::FabricValue for $name {
            const ARRAY_META: $crate::TypeMeta = $crate::TypeMeta::OBJECT_ARRAY;

            fn write_value(
                &self,
                enc: &mut $crate::Encoder,
            ) -> Result<(), $crate::CodecError> {
                enc.begin_struct()?;
                $crate::FabricStruct::write_fields(self, enc)?;
                enc.end_struct()
            }

            fn read_value(
                dec: &mut $crate::Decoder<'_>,
                meta: $crate::TypeMeta,
            ) -> Result<Self, $crate::CodecError> {
                if meta.is_empty() {
                    return Ok(Self::default());
                }
                let mut scope = dec.begin_struct(meta)?;
                let mut value = Self::default();
                $crate::FabricStruct::read_fields(&mut value, dec, &mut scope)?;
                dec.end_struct(scope)?;
                Ok(value)
            }
        }
    };
}
