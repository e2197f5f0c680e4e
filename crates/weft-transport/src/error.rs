//! Transport error types.
//!
//! Format and protocol errors are fatal to the owning connection; they
//! become the read loop's terminal error and drain every pending
//! request with a cancellation. Per-request faults (a reply carrying a
//! non-success error code) never affect other in-flight requests.

use thiserror::Error;
use weft_codec::CodecError;

use crate::headers::ErrorCode;

/// Errors surfaced by the transport layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The structured serializer rejected a header or body.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// A frame violated the wire format (bad length, CRC mismatch,
    /// truncation).
    #[error("frame format error: {0}")]
    Format(String),

    /// The peer violated the protocol (heartbeat tick mismatch,
    /// connection auth rejection).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An underlying socket operation failed.
    #[error("i/o error: {0}")]
    Io(String),

    /// The caller's wait was cancelled or timed out.
    #[error("operation cancelled")]
    Cancelled,

    /// The connection was closed before the operation completed.
    #[error("connection closed")]
    Closed,

    /// A reply carried a non-success error code in its fault header.
    #[error("peer fault: {0:?}")]
    Fault(ErrorCode),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}
