//! Correlation of reply messages to pending request waiters.
//!
//! Writers install a pending entry keyed by the outgoing message id
//! before the request hits the socket; the read loop feeds replies in
//! by their `RelatesTo` header. Whoever completes first wins: a fed
//! reply wakes the waiter, a dropped waiter turns the late reply into a
//! logged no-op.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::TransportError;
use crate::message::{ByteArrayMessage, MessageId};

/// Concurrent map from message id to pending request waiter.
#[derive(Debug, Clone, Default)]
pub struct RequestTable {
    table: Arc<DashMap<MessageId, oneshot::Sender<ByteArrayMessage>>>,
}

/// A waiter for one correlated reply.
///
/// Dropping the waiter (cancellation) removes the table entry, so a
/// reply arriving afterwards is discarded by [`RequestTable::feed`].
#[derive(Debug)]
pub struct PendingRequest {
    table: Arc<DashMap<MessageId, oneshot::Sender<ByteArrayMessage>>>,
    id: MessageId,
    rx: oneshot::Receiver<ByteArrayMessage>,
}

impl RequestTable {
    /// Creates an empty table.
    pub fn new() -> RequestTable {
        RequestTable::default()
    }

    /// Installs a pending entry for `id` and returns its waiter.
    ///
    /// Must be called before the request is written to the socket, so a
    /// reply can never race past its own entry.
    pub fn put(&self, id: MessageId) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        self.table.insert(id, tx);
        PendingRequest { table: Arc::clone(&self.table), id, rx }
    }

    /// Routes a reply to its waiter via the `RelatesTo` header.
    ///
    /// Returns whether the message was consumed. Replies without a
    /// `RelatesTo`, or for ids no longer in the table, are left to the
    /// caller.
    pub fn feed(&self, message: ByteArrayMessage) -> Result<(), ByteArrayMessage> {
        let id = message.headers.relates_to;
        if id.is_empty() {
            return Err(message);
        }
        let Some((_, tx)) = self.table.remove(&id) else {
            return Err(message);
        };
        if let Err(unclaimed) = tx.send(message) {
            tracing::warn!(id = %id, relates_to = %unclaimed.headers.relates_to,
                "dropping late reply for cancelled request");
        }
        Ok(())
    }

    /// Drains the table, waking every waiter with a cancellation error.
    /// Closing twice is a no-op.
    pub fn close(&self) {
        // Dropping the senders resolves every receiver with an error.
        self.table.clear();
    }
}

impl PendingRequest {
    /// Waits for the correlated reply.
    ///
    /// Resolves with [`TransportError::Cancelled`] if the table is
    /// closed (or the entry dropped) before a reply arrives. Dropping
    /// this future cancels the request and removes the entry.
    pub async fn wait(mut self) -> Result<ByteArrayMessage, TransportError> {
        (&mut self.rx).await.map_err(|_| TransportError::Cancelled)
    }
}

impl Drop for PendingRequest {
    fn drop(&mut self) {
        self.table.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::RequestTable;
    use crate::error::TransportError;
    use crate::headers::MessageHeaders;
    use crate::message::{ByteArrayMessage, MessageId, MessageIdGenerator};

    fn reply_to(id: MessageId) -> ByteArrayMessage {
        let headers = MessageHeaders { relates_to: id, ..MessageHeaders::default() };
        ByteArrayMessage { headers, body: Bytes::from_static(&[1]) }
    }

    #[tokio::test]
    async fn feed_wakes_the_matching_waiter() {
        let table = RequestTable::new();
        let generator = MessageIdGenerator::new();
        let id = generator.next();

        let pending = table.put(id);
        table.feed(reply_to(id)).unwrap();

        let reply = pending.wait().await.unwrap();
        assert_eq!(reply.headers.relates_to, id);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_consumed() {
        let table = RequestTable::new();
        let generator = MessageIdGenerator::new();
        let unrelated = generator.next();

        assert!(table.feed(reply_to(unrelated)).is_err());

        let no_relates = ByteArrayMessage {
            headers: MessageHeaders::default(),
            body: Bytes::new(),
        };
        assert!(table.feed(no_relates).is_err());
    }

    #[tokio::test]
    async fn close_cancels_waiters_and_is_idempotent() {
        let table = RequestTable::new();
        let generator = MessageIdGenerator::new();
        let pending = table.put(generator.next());

        table.close();
        table.close();

        assert_eq!(pending.wait().await.unwrap_err(), TransportError::Cancelled);
    }

    #[tokio::test]
    async fn dropped_waiter_discards_late_reply() {
        let table = RequestTable::new();
        let generator = MessageIdGenerator::new();
        let id = generator.next();

        drop(table.put(id));
        assert!(table.feed(reply_to(id)).is_err());
    }
}
