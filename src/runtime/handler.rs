//! Boundary to the protocol layer above the wire.
//!
//! Controllers hand every decoded payload to a `MessageHandler` on their own
//! thread. A returned reply is compressed and queued on the same connection,
//! so replies keep the order of the requests that produced them.

use super::connection::ConnectionId;

/// Consumer of decoded message payloads.
pub trait MessageHandler: Send + Sync {
    /// Handle one payload. Returning `Some` queues a reply on the connection.
    fn on_message(&self, conn: ConnectionId, payload: Vec<u8>) -> Option<Vec<u8>>;

    /// Called once after a connection has been removed from its controller.
    fn on_close(&self, _conn: ConnectionId) {}
}

impl<F> MessageHandler for F
where
    F: Fn(ConnectionId, Vec<u8>) -> Option<Vec<u8>> + Send + Sync,
{
    fn on_message(&self, conn: ConnectionId, payload: Vec<u8>) -> Option<Vec<u8>> {
        self(conn, payload)
    }
}

/// Replies to every payload with the payload itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoHandler;

impl MessageHandler for EchoHandler {
    fn on_message(&self, _conn: ConnectionId, payload: Vec<u8>) -> Option<Vec<u8>> {
        Some(payload)
    }
}
