//! Chorus Core - shared library for the Chorus synchronized-playback client.
//!
//! This crate implements the client half of a synchronized multi-room audio
//! protocol: it negotiates a session with a server, keeps a continuously
//! corrected clock against the server's time, and renders a queue of
//! timestamped PCM chunks against that clock so that every client in a
//! group produces sound at the same instant.
//!
//! # Architecture
//!
//! - [`filter`]: the time filter, a configurable Kalman filter that turns
//!   round-trip probes into a server/client offset and drift estimate
//! - [`time_sync`]: issues probes in bursts and at steady-state cadence,
//!   feeding every usable reply to the filter
//! - [`protocol`]: wire-format parsing for the text and binary halves of
//!   the protocol
//! - [`codec`]: decodes compressed audio payloads to interleaved PCM
//! - [`renderer`]: the deadline-scheduled playback queue and its four-tier
//!   correction hierarchy
//! - [`session`]: the handshake/reconnect state machine that owns the
//!   filter, renderer, and protocol handler for the lifetime of a
//!   connection
//! - [`events`]: the event system connecting protocol parsing to session
//!   and renderer logic, and session lifecycle notifications to the host
//! - [`error`]: centralized error types
//! - [`config`]: host-injected configuration
//!
//! # Abstraction Traits
//!
//! The crate defines a handful of traits to decouple the core logic from
//! platform-specific implementations, each with a reference implementation
//! suitable for tests:
//!
//! - [`TaskSpawner`](runtime::TaskSpawner): spawning background tasks
//! - [`EventEmitter`](events::EventEmitter): emitting session lifecycle events
//! - [`Transport`](transport::Transport): the full-duplex framed connection
//! - [`OutputSink`](sink::OutputSink): the audio output device
//! - [`TransportConnector`](session::TransportConnector): establishing a
//!   fresh transport connection, so the reconnect loop never depends on a
//!   concrete WebSocket library
//!
//! A host binary supplies real implementations of these traits (a
//! `tokio-tungstenite` transport, a `cpal` output sink) and wires them into
//! a [`session::SessionCoordinator`].

#![warn(clippy::all)]

mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod protocol;
pub mod renderer;
pub mod runtime;
pub mod session;
pub mod sink;
pub mod time_sync;
pub mod transport;

pub use clock::now_client_us;
pub use config::{BufferCapacityTier, ClientConfig, PreferredCodec};
pub use error::{ChorusError, ChorusResult, ErrorCode};
pub use events::{EventEmitter, ProtocolEvent, SessionEvent};
pub use filter::{FilterDimension, FilterSnapshot, Measurement, TimeFilter};
pub use renderer::{Renderer, RendererStats, StreamConfig};
pub use runtime::{TaskSpawner, TokioSpawner};
pub use session::{SessionCoordinator, SessionState, TransportConnector};
pub use sink::OutputSink;
pub use time_sync::{ProbeSender, TimeSyncDriver};
pub use transport::{Transport, TransportEvent, NORMAL_CLOSURE_CODE};
