//! Framed binary message transport.
//!
//! Messages are header bags plus bodies, framed with a 12-byte
//! little-endian header carrying CRCs and a security provider mask.
//! A [`Connection`] owns a socket (plain TCP or TLS tunnelled through
//! the frame layer), drives a read loop, answers heartbeats and
//! correlates replies to pending requests. A [`Server`] accepts sockets
//! and promotes each into a connection; a [`Relay`] fronts a server and
//! pumps frames to a chosen upstream.

pub mod connection;
pub mod error;
pub mod frame;
pub mod headers;
pub mod message;
pub mod relay;
pub mod request_table;
mod secure;
pub mod server;

pub use connection::{ClientConfig, ClientTls, Config, Connection};
pub use error::TransportError;
pub use frame::{FrameReadConfig, FrameWriteConfig, SecurityProvider};
pub use headers::{
    Actor, CustomHeader, ErrorCode, HeaderId, HeaderValue, MessageHeaders,
    SecurityNegotiationHeader, register_header_activator,
};
pub use message::{Body, ByteArrayMessage, Message, MessageCallback, MessageId, MessageIdGenerator};
pub use relay::{Relay, RelayConfig};
pub use request_table::{PendingRequest, RequestTable};
pub use server::{Server, ServerConfig};
