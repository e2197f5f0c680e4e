//! Streaming encoder for the structured wire format.
//!
//! Object scopes are built on a buffer stack: `begin_struct` redirects
//! writes into a fresh buffer, and `end_struct` pops it, prefixes the
//! object header (whose size field must cover the finished scope) and
//! splices the result into the parent buffer.

use crate::compress;
use crate::error::CodecError;
use crate::meta::TypeMeta;

/// Size of the fixed object header: `u32` size, flags byte, 3 padding bytes.
pub(crate) const OBJECT_HEADER_LEN: u32 = 8;

/// Wire encoder with object-scope tracking.
#[derive(Debug, Default)]
pub struct Encoder {
    stack: Vec<Vec<u8>>,
    buf: Vec<u8>,
}

impl Encoder {
    /// Creates an empty encoder.
    pub fn new() -> Encoder {
        Encoder::default()
    }

    /// Consumes the encoder and returns the accumulated bytes.
    ///
    /// Any unbalanced object scope is a logic error in the caller; the
    /// open scopes' bytes are simply not included.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Writes a type meta byte.
    pub fn write_meta(&mut self, meta: TypeMeta) {
        self.buf.push(meta.raw());
    }

    /// Writes raw bytes verbatim.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes a single raw byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Writes a compressed unsigned integer of the given bit width.
    pub fn write_compressed_unsigned(&mut self, bits: u32, value: u64) {
        compress::write_unsigned(&mut self.buf, bits, value);
    }

    /// Writes a compressed signed integer of the given bit width.
    pub fn write_compressed_signed(&mut self, bits: u32, value: i64) {
        compress::write_signed(&mut self.buf, bits, value);
    }

    /// Writes a compressed `u32`, the encoding used for element counts.
    pub fn write_compressed_u32(&mut self, value: u32) {
        self.write_compressed_unsigned(32, u64::from(value));
    }

    /// Opens an object scope; fields written next land inside it.
    pub fn begin_struct(&mut self) -> Result<(), CodecError> {
        self.stack.push(std::mem::take(&mut self.buf));
        Ok(())
    }

    /// Closes the innermost object scope and emits the object envelope.
    pub fn end_struct(&mut self) -> Result<(), CodecError> {
        let body = std::mem::replace(&mut self.buf, self.stack.pop().unwrap_or_default());

        self.write_meta(TypeMeta::OBJECT);

        // Size spans the object header through ObjectEnd: header bytes,
        // ScopeBegin, the fields, ScopeEnd and ObjectEnd.
        let size = body.len() as u32 + 3 + OBJECT_HEADER_LEN;
        self.buf.extend_from_slice(&size.to_le_bytes());
        self.write_u8(0); // flags: no type info, no extension data
        self.write_bytes(&[0, 0, 0]); // padding

        self.write_meta(TypeMeta::SCOPE_BEGIN);
        self.write_bytes(&body);
        self.write_meta(TypeMeta::SCOPE_END);
        self.write_meta(TypeMeta::OBJECT_END);
        Ok(())
    }
}
