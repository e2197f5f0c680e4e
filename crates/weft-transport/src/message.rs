//! Messages and message ids.
//!
//! A message is a header bag plus a body; the body is either raw bytes
//! or a value serialized through the structured codec. Ids pair a
//! per-connection GUID prefix with an atomically incremented index.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use weft_codec::{FabricValue, Guid, weft_struct};

use crate::error::TransportError;
use crate::headers::MessageHeaders;

weft_struct! {
    /// Unique message identifier: a GUID prefix shared by one generator
    /// and a per-message index.
    #[derive(Copy, Eq, Hash)]
    pub struct MessageId {
        /// Generator prefix.
        pub id: Guid,
        /// Message index within the generator.
        pub index: u32,
    }
}

impl MessageId {
    /// True when both fields are zero, the "no id" sentinel.
    pub fn is_empty(&self) -> bool {
        self.id.is_empty() && self.index == 0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.id, self.index)
    }
}

/// Allocates message ids under a fresh GUID prefix.
#[derive(Debug)]
pub struct MessageIdGenerator {
    prefix: Guid,
    counter: AtomicU32,
}

impl Default for MessageIdGenerator {
    fn default() -> Self {
        MessageIdGenerator::new()
    }
}

impl MessageIdGenerator {
    /// Creates a generator with a random GUID prefix.
    pub fn new() -> MessageIdGenerator {
        MessageIdGenerator { prefix: Guid::new_v4(), counter: AtomicU32::new(0) }
    }

    /// Returns the next message id.
    pub fn next(&self) -> MessageId {
        MessageId { id: self.prefix, index: self.counter.fetch_add(1, Ordering::Relaxed) }
    }

    /// Assigns an id to `message` unless it already carries one.
    pub fn fill_message_id(&self, message: &mut Message) {
        if message.headers.id.is_empty() {
            message.headers.id = self.next();
        }
    }
}

/// Message body: raw bytes, or nothing.
///
/// Typed bodies are serialized up front via [`Message::typed`], so a
/// composed message always owns plain bytes by the time it reaches the
/// framer.
#[derive(Debug, Clone, Default)]
pub enum Body {
    /// No body bytes.
    #[default]
    Empty,
    /// Body bytes, raw or pre-serialized.
    Bytes(Bytes),
}

impl Body {
    fn as_slice(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Bytes(bytes) => bytes,
        }
    }
}

/// An outgoing message: headers plus body.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Header bag.
    pub headers: MessageHeaders,
    /// Body payload.
    pub body: Body,
}

impl Message {
    /// Creates a message with raw body bytes.
    pub fn with_body(headers: MessageHeaders, body: impl Into<Bytes>) -> Message {
        Message { headers, body: Body::Bytes(body.into()) }
    }

    /// Creates a message whose body is the serialized form of `value`.
    pub fn typed<T: FabricValue>(
        headers: MessageHeaders,
        value: &T,
    ) -> Result<Message, TransportError> {
        Ok(Message { headers, body: Body::Bytes(weft_codec::encode(value)?.into()) })
    }

    /// Serializes headers followed by body, returning the header prefix
    /// length and the combined bytes.
    pub(crate) fn marshal(&self) -> Result<(usize, Vec<u8>), TransportError> {
        let mut out = Vec::new();
        self.headers.write_to(&mut out)?;
        let header_len = out.len();
        out.extend_from_slice(self.body.as_slice());
        Ok((header_len, out))
    }
}

/// A received message: parsed headers plus raw body bytes, kept raw
/// because the schema is not known until the receiver dispatches on the
/// headers.
#[derive(Debug, Clone)]
pub struct ByteArrayMessage {
    /// Parsed header bag.
    pub headers: MessageHeaders,
    /// Raw body bytes.
    pub body: Bytes,
}

impl ByteArrayMessage {
    /// Deserializes the body as `T`.
    pub fn decode_body<T: FabricValue>(&self) -> Result<T, TransportError> {
        Ok(weft_codec::decode(&self.body)?)
    }
}

/// Callback invoked for every received message that is neither a
/// transport control message nor a correlated reply.
pub type MessageCallback = Arc<dyn Fn(crate::connection::Connection, ByteArrayMessage) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::{Message, MessageIdGenerator};
    use crate::headers::MessageHeaders;

    #[test]
    fn generator_ids_are_unique_and_share_prefix() {
        let generator = MessageIdGenerator::new();
        let a = generator.next();
        let b = generator.next();
        assert_eq!(a.id, b.id);
        assert_ne!(a.index, b.index);
        assert!(!a.is_empty());
    }

    #[test]
    fn fill_message_id_respects_existing_id() {
        let generator = MessageIdGenerator::new();
        let mut message = Message::with_body(MessageHeaders::default(), vec![1u8]);
        generator.fill_message_id(&mut message);
        let assigned = message.headers.id;

        generator.fill_message_id(&mut message);
        assert_eq!(message.headers.id, assigned);
    }

    #[test]
    fn marshal_reports_header_prefix_length() {
        let generator = MessageIdGenerator::new();
        let mut message = Message::with_body(MessageHeaders::default(), vec![1u8, 2, 3, 4]);
        generator.fill_message_id(&mut message);

        let (header_len, bytes) = message.marshal().unwrap();
        assert_eq!(&bytes[header_len..], [1, 2, 3, 4]);
    }
}
