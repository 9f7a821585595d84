//! Event system for decoupling protocol parsing from session/renderer logic.
//!
//! Two event families live here:
//!
//! - [`ProtocolEvent`]: the result of parsing one inbound frame. The
//!   session coordinator consumes these to drive the state machine and
//!   feed the renderer/filter; nothing outside the protocol handler needs
//!   to know about frame bytes or JSON shapes.
//! - [`SessionEvent`]: the small, stable set of notifications the
//!   coordinator emits to its host (a UI, a CLI, a media-session bridge).
//!   This is the "sum type of events delivered on a single event channel"
//!   called for in place of a multi-method callback interface.

mod emitter;

pub use emitter::{EventEmitter, LoggingEventEmitter, NoopEventEmitter};

use bytes::Bytes;

use crate::filter::Measurement;
use crate::protocol::message::{StreamConfigPayload, SyncOffsetChanged};

/// One parsed inbound frame, ready for the coordinator/renderer to act on.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// `server/hello`: handshake acknowledgement.
    ServerHello { session_id: String, server_name: String },
    /// `server/time`: one round-trip measurement, ready for the driver.
    ServerTime(Measurement),
    /// `server/state`: opaque playback/group state blob (not interpreted
    /// by the core beyond forwarding it to the host).
    ServerState(serde_json::Value),
    /// `server/command`: opaque command blob forwarded to the host.
    ServerCommand(serde_json::Value),
    /// `group/update`: opaque group-membership blob forwarded to the host.
    GroupUpdate(serde_json::Value),
    /// `stream/start`: a new stream configuration is now active.
    StreamStart(StreamConfigPayload),
    /// `stream/clear`: the current stream ended; renderer queue must flush.
    StreamClear,
    /// `client/sync_offset` echoed back, or a live update pushed by the
    /// host's own configuration layer (not off the wire in that case).
    SyncOffsetChanged(SyncOffsetChanged),
    /// A binary audio chunk (tag 4): server timestamp plus compressed or
    /// raw PCM payload, not yet decoded.
    AudioChunk { server_time_us: i64, payload: Bytes },
    /// Artwork channel (tags 8..=11).
    Artwork { channel: u8, server_time_us: i64, payload: Bytes },
    /// Visualizer data (tag 16).
    Visualizer { server_time_us: i64, payload: Bytes },
}

/// Notifications the session coordinator emits to its host, exactly one
/// per state transition.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Entered `Ready` for the first time in this session.
    Connected,
    /// Entered `Reconnecting(attempt)`.
    Reconnecting { attempt: u32, server_name: String },
    /// Re-entered `Ready` after a reconnect.
    Reconnected,
    /// Closed normally (peer close code 1000, or user-initiated disconnect).
    Disconnected,
    /// Entered `Failed`; no further reconnect attempts will be made.
    Error(String),
}
