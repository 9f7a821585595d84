//! Transport: the consumed external interface for the full-duplex
//! WebSocket-framed connection. Only the interface is specified here; a
//! real `tokio-tungstenite`-backed implementation lives in the binary
//! crate, since the transport itself is explicitly out of the core's
//! scope.

use bytes::Bytes;

/// Events the transport delivers to the coordinator, replacing the
/// source's multi-method callback interface with a single sum type
/// delivered over a channel.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Open,
    Text(String),
    Binary(Bytes),
    Closing { code: u16, reason: String },
    Closed { code: u16, reason: String },
    Failure { recoverable: bool, message: String },
}

/// A full-duplex ordered bidirectional frame channel. Send operations
/// report success as a boolean rather than throwing.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Sends a UTF-8 text frame. Returns `false` on failure without
    /// raising an error; the coordinator learns about the underlying
    /// cause (if any) from the event stream instead.
    async fn send_text(&self, text: String) -> bool;

    /// Sends a binary frame.
    async fn send_binary(&self, bytes: Bytes) -> bool;

    /// Initiates a close handshake with the given code and reason.
    /// Code 1000 signifies normal closure.
    async fn close(&self, code: u16, reason: String);
}

/// Normal-closure WebSocket close code. A peer close with this code must
/// not trigger a reconnect attempt.
pub const NORMAL_CLOSURE_CODE: u16 = 1000;
