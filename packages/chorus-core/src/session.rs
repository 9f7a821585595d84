//! Session coordinator: handshake, reconnect state machine, and
//! freeze/thaw orchestration across a transport outage. Implemented as a
//! single long-lived task owning one internal retry loop, rather than a
//! pair of methods that call each other and hand a shared handle back and
//! forth — that shape is the canonical source of the cancellation bugs
//! this coordinator exists to avoid.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::codec::{Codec, PcmPassthroughCodec};
#[cfg(feature = "flac")]
use crate::codec::FlacCodec;
#[cfg(feature = "opus")]
use crate::codec::OpusCodec;
use crate::config::ClientConfig;
use crate::error::{classify_transport_error, ChorusError};
use crate::events::{EventEmitter, SessionEvent};
use crate::filter::TimeFilter;
use crate::protocol::message::{AudioCodec, AudioFormat, MessageBuilder};
use crate::protocol::ProtocolHandler;
use crate::renderer::{Renderer, StreamConfig};
use crate::runtime::TaskSpawner;
use crate::time_sync::{ProbeSender, TimeSyncDriver};
use crate::transport::{Transport, TransportEvent, NORMAL_CLOSURE_CODE};

/// `{500, 1000, 2000, 4000, 8000}` ms, capped at 10s.
const RECONNECT_BACKOFFS_MS: [u64; 5] = [500, 1_000, 2_000, 4_000, 8_000];
const MAX_BACKOFF_MS: u64 = 10_000;
const MAX_RECONNECT_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    HandshakeSent,
    Ready,
    Reconnecting(u32),
    Failed,
    Closing,
}

/// Establishes a fresh transport connection. Supplied by the host so the
/// core never depends on a concrete WebSocket library.
#[async_trait::async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>), ChorusError>;
}

fn backoff_for_attempt(attempt: u32) -> Duration {
    let idx = (attempt.saturating_sub(1) as usize).min(RECONNECT_BACKOFFS_MS.len() - 1);
    Duration::from_millis(RECONNECT_BACKOFFS_MS[idx].min(MAX_BACKOFF_MS))
}

struct TransportProbeSender<S: TaskSpawner> {
    transport: Arc<dyn Transport>,
    spawner: S,
}

impl<S: TaskSpawner> ProbeSender for TransportProbeSender<S> {
    fn send_probe(&self, t1_us: i64) {
        let transport = self.transport.clone();
        let message = MessageBuilder::client_time(t1_us);
        let Ok(text) = serde_json::to_string(&message) else {
            return;
        };
        self.spawner.spawn(async move {
            let _ = transport.send_text(text).await;
        });
    }
}

/// Owns the Filter, Driver, Protocol Handler, and Renderer exclusively, as
/// required by the ownership model: nothing outside the coordinator holds
/// a reference into their internals.
pub struct SessionCoordinator<S: TaskSpawner + Clone + Send + Sync + 'static> {
    config: ClientConfig,
    connector: Arc<dyn TransportConnector>,
    filter: Arc<Mutex<TimeFilter>>,
    protocol: Arc<ProtocolHandler>,
    renderer: Arc<Renderer>,
    emitter: Arc<dyn EventEmitter>,
    spawner: S,
    state: Arc<Mutex<SessionState>>,
    attempt: Arc<AtomicU32>,
    handshake_completed_once: Arc<std::sync::atomic::AtomicBool>,
    cancel: Arc<Notify>,
    shutting_down: Arc<std::sync::atomic::AtomicBool>,
    codec: Arc<Mutex<Option<Box<dyn Codec>>>>,
}

impl<S: TaskSpawner + Clone + Send + Sync + 'static> SessionCoordinator<S> {
    #[must_use]
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn TransportConnector>,
        filter: Arc<Mutex<TimeFilter>>,
        renderer: Arc<Renderer>,
        emitter: Arc<dyn EventEmitter>,
        spawner: S,
    ) -> Self {
        Self {
            config,
            connector,
            filter,
            protocol: Arc::new(ProtocolHandler::new()),
            renderer,
            emitter,
            spawner,
            state: Arc::new(Mutex::new(SessionState::Disconnected)),
            attempt: Arc::new(AtomicU32::new(0)),
            handshake_completed_once: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            cancel: Arc::new(Notify::new()),
            shutting_down: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            codec: Arc::new(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    /// Starts the single lifecycle task. Calling this more than once has
    /// no additional effect; the task itself contains the entire
    /// connect/handshake/run/reconnect loop.
    pub fn connect(&self) {
        let ctx = LifecycleContext {
            config: self.config.clone(),
            connector: self.connector.clone(),
            filter: self.filter.clone(),
            protocol: self.protocol.clone(),
            renderer: self.renderer.clone(),
            emitter: self.emitter.clone(),
            spawner: self.spawner.clone(),
            state: self.state.clone(),
            attempt: self.attempt.clone(),
            handshake_completed_once: self.handshake_completed_once.clone(),
            cancel: self.cancel.clone(),
            shutting_down: self.shutting_down.clone(),
            codec: self.codec.clone(),
        };
        let spawner = self.spawner.clone();
        spawner.spawn(async move {
            run_lifecycle(ctx).await;
        });
    }

    /// User-initiated disconnect: no further reconnect attempts follow.
    pub fn disconnect(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancel.notify_waiters();
    }

    /// Cancels any in-progress backoff delay and retries immediately, with
    /// the attempt counter clamped to `>= 1` so a frozen filter snapshot
    /// is preserved.
    pub fn network_available(&self) {
        if self.attempt.load(Ordering::SeqCst) == 0 {
            self.attempt.store(1, Ordering::SeqCst);
        }
        self.cancel.notify_waiters();
    }

    /// Applies a live per-speaker delay change pushed by the host (e.g. a
    /// settings UI), independent of any `client/sync_offset` echoed over
    /// the wire.
    pub fn set_static_delay_ms(&self, delay_ms: i32) {
        self.filter.lock().set_static_delay_us(i64::from(delay_ms.clamp(-5_000, 5_000)) * 1_000);
    }
}

struct LifecycleContext<S: TaskSpawner + Clone + Send + Sync + 'static> {
    config: ClientConfig,
    connector: Arc<dyn TransportConnector>,
    filter: Arc<Mutex<TimeFilter>>,
    protocol: Arc<ProtocolHandler>,
    renderer: Arc<Renderer>,
    emitter: Arc<dyn EventEmitter>,
    spawner: S,
    state: Arc<Mutex<SessionState>>,
    attempt: Arc<AtomicU32>,
    handshake_completed_once: Arc<std::sync::atomic::AtomicBool>,
    cancel: Arc<Notify>,
    shutting_down: Arc<std::sync::atomic::AtomicBool>,
    codec: Arc<Mutex<Option<Box<dyn Codec>>>>,
}

/// The reconnect attempt counter (`ctx.attempt`) is reset to 0 on every
/// successful handshake, so this loop's notion of "attempt" spans one
/// outage at a time rather than the whole process lifetime: a client that
/// reconnects successfully ten times over a week never approaches
/// `MAX_RECONNECT_ATTEMPTS`.
async fn run_lifecycle<S: TaskSpawner + Clone + Send + Sync + 'static>(ctx: LifecycleContext<S>) {
    let url = crate::protocol::constants::rewrite_scheme(&ctx.config.server_url);

    loop {
        if ctx.shutting_down.load(Ordering::SeqCst) {
            return;
        }

        let attempt = ctx.attempt.load(Ordering::SeqCst);
        if attempt > 0 {
            if attempt > MAX_RECONNECT_ATTEMPTS {
                break;
            }
            *ctx.state.lock() = SessionState::Reconnecting(attempt);
            ctx.filter.lock().freeze();
            ctx.emitter.emit(SessionEvent::Reconnecting { attempt, server_name: url.clone() });

            let backoff = backoff_for_attempt(attempt);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = ctx.cancel.notified() => {}
            }
            if ctx.shutting_down.load(Ordering::SeqCst) {
                return;
            }
        } else {
            *ctx.state.lock() = SessionState::Connecting;
        }

        match run_one_connection(&ctx, &url).await {
            ConnectionOutcome::ClosedNormally => {
                *ctx.state.lock() = SessionState::Disconnected;
                ctx.emitter.emit(SessionEvent::Disconnected);
                return;
            }
            ConnectionOutcome::ShuttingDown => {
                *ctx.state.lock() = SessionState::Closing;
                ctx.emitter.emit(SessionEvent::Disconnected);
                return;
            }
            ConnectionOutcome::Failed { recoverable } => {
                // Reconnect (the Reconnecting(n) state with its freeze/backoff
                // dance) is only meaningful once a session has actually been
                // established; a connection that never completed its first
                // handshake has no filter state worth freezing and falls
                // straight through to Failed instead of cycling forever.
                if !recoverable || !ctx.handshake_completed_once.load(Ordering::SeqCst) {
                    break;
                }
                ctx.attempt.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    *ctx.state.lock() = SessionState::Failed;
    ctx.filter.lock().reset_and_discard();
    ctx.emitter.emit(SessionEvent::Error("reconnect attempts exhausted".to_string()));
}

enum ConnectionOutcome {
    ClosedNormally,
    ShuttingDown,
    Failed { recoverable: bool },
}

async fn run_one_connection<S: TaskSpawner + Clone + Send + Sync + 'static>(
    ctx: &LifecycleContext<S>,
    url: &str,
) -> ConnectionOutcome {
    let (transport, mut events) = match ctx.connector.connect(url).await {
        Ok(pair) => pair,
        Err(error) => {
            return ConnectionOutcome::Failed { recoverable: error.is_recoverable() };
        }
    };

    let was_reconnect = ctx.handshake_completed_once.load(Ordering::SeqCst);

    let driver = TimeSyncDriver::new(
        ctx.filter.clone(),
        Arc::new(TransportProbeSender { transport: transport.clone(), spawner: ctx.spawner.clone() }),
    );

    loop {
        tokio::select! {
            _ = ctx.cancel.notified() => {
                if !ctx.shutting_down.load(Ordering::SeqCst) {
                    // A `network_available()` kick while already connected;
                    // nothing to do, the connection is already live.
                    continue;
                }
                driver.stop();
                let _ = transport.close(NORMAL_CLOSURE_CODE, "client disconnect".to_string()).await;
                return ConnectionOutcome::ShuttingDown;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    driver.stop();
                    return ConnectionOutcome::Failed { recoverable: true };
                };
                match event {
                    TransportEvent::Open => {
                        *ctx.state.lock() = SessionState::HandshakeSent;
                        send_hello(&transport, &ctx.config).await;
                    }
                    TransportEvent::Text(text) => {
                        if let Some(protocol_event) = ctx.protocol.parse_text(&text) {
                            handle_protocol_event(ctx, &driver, protocol_event, was_reconnect).await;
                        }
                    }
                    TransportEvent::Binary(bytes) => {
                        if let Some(protocol_event) = ctx.protocol.parse_binary(bytes) {
                            handle_protocol_event(ctx, &driver, protocol_event, was_reconnect).await;
                        }
                    }
                    TransportEvent::Closing { .. } => {
                        *ctx.state.lock() = SessionState::Closing;
                    }
                    TransportEvent::Closed { code, .. } => {
                        driver.stop();
                        if code == NORMAL_CLOSURE_CODE {
                            return ConnectionOutcome::ClosedNormally;
                        }
                        return ConnectionOutcome::Failed { recoverable: true };
                    }
                    TransportEvent::Failure { recoverable, message } => {
                        driver.stop();
                        let error = classify_transport_error(&message);
                        return ConnectionOutcome::Failed { recoverable: recoverable || error.is_recoverable() };
                    }
                }
            }
        }
    }
}

async fn handle_protocol_event<S: TaskSpawner + Clone + Send + Sync + 'static>(
    ctx: &LifecycleContext<S>,
    driver: &TimeSyncDriver,
    event: crate::events::ProtocolEvent,
    was_reconnect: bool,
) {
    use crate::events::ProtocolEvent as PE;
    match event {
        PE::ServerHello { .. } => {
            ctx.handshake_completed_once.store(true, Ordering::SeqCst);
            *ctx.state.lock() = SessionState::Ready;
            if was_reconnect {
                ctx.filter.lock().thaw();
                ctx.attempt.store(0, Ordering::SeqCst);
                ctx.emitter.emit(SessionEvent::Reconnected);
            } else {
                ctx.emitter.emit(SessionEvent::Connected);
            }
            driver.start(&ctx.spawner);
        }
        PE::ServerTime(measurement) => {
            driver.on_server_time(measurement);
        }
        PE::StreamStart(config) => {
            ctx.renderer.configure(StreamConfig {
                sample_rate: config.sample_rate,
                channels: config.channels,
                bit_depth: config.bit_depth,
            });
            match build_codec(config.codec, config.sample_rate, config.channels) {
                Ok(mut codec) => {
                    if let Some(header) = config.decode_header() {
                        if let Err(error) = codec.set_header(&header) {
                            tracing::warn!(%error, "codec rejected its own stream header");
                        }
                    }
                    *ctx.codec.lock() = Some(codec);
                }
                Err(error) => {
                    tracing::warn!(%error, codec = ?config.codec, "cannot decode advertised codec, dropping stream");
                    *ctx.codec.lock() = None;
                }
            }
        }
        PE::StreamClear => {
            ctx.renderer.clear();
            *ctx.codec.lock() = None;
        }
        PE::AudioChunk { server_time_us, payload } => {
            decode_and_enqueue(ctx, server_time_us, &payload);
        }
        PE::SyncOffsetChanged(change) => {
            ctx.filter.lock().set_static_delay_us(i64::from(change.static_delay_ms) * 1_000);
        }
        PE::ServerState(_) | PE::ServerCommand(_) | PE::GroupUpdate(_) | PE::Artwork { .. } | PE::Visualizer { .. } => {
            // Forwarded to the host via a richer event surface in a full
            // application; the core itself only needs to keep the
            // session/filter/renderer state machines consistent.
        }
    }
}

/// Builds the decoder for a newly announced stream. PCM always succeeds;
/// Opus/FLAC fail closed if the corresponding cargo feature wasn't
/// compiled in, rather than silently passing compressed bytes to the
/// renderer as if they were raw PCM.
fn build_codec(codec: AudioCodec, sample_rate: u32, channels: u16) -> Result<Box<dyn Codec>, ChorusError> {
    match codec {
        AudioCodec::Pcm => Ok(Box::new(PcmPassthroughCodec)),
        AudioCodec::Opus => {
            #[cfg(feature = "opus")]
            {
                Ok(Box::new(OpusCodec::new(sample_rate, channels)?))
            }
            #[cfg(not(feature = "opus"))]
            {
                let _ = (sample_rate, channels);
                Err(ChorusError::Codec("opus support not compiled in".to_string()))
            }
        }
        AudioCodec::Flac => {
            #[cfg(feature = "flac")]
            {
                Ok(Box::<FlacCodec>::default())
            }
            #[cfg(not(feature = "flac"))]
            {
                Err(ChorusError::Codec("flac support not compiled in".to_string()))
            }
        }
    }
}

/// Decodes one compressed (or passthrough) frame and forwards the
/// resulting interleaved PCM to the renderer. Drops the chunk if no
/// codec has been configured yet (a `stream/start` has not arrived) or if
/// decoding fails after the codec's own retry budget is exhausted.
fn decode_and_enqueue<S: TaskSpawner + Clone + Send + Sync + 'static>(
    ctx: &LifecycleContext<S>,
    server_time_us: i64,
    payload: &[u8],
) {
    let mut codec_guard = ctx.codec.lock();
    let Some(codec) = codec_guard.as_mut() else {
        return;
    };
    match codec.decode(payload) {
        Ok(samples) => {
            drop(codec_guard);
            ctx.renderer.enqueue(server_time_us, samples_to_pcm_bytes(&samples));
        }
        Err(error) => {
            tracing::warn!(%error, "codec decode failed, dropping audio chunk");
        }
    }
}

fn samples_to_pcm_bytes(samples: &[i16]) -> Bytes {
    let mut buf = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }
    Bytes::from(buf)
}

async fn send_hello(transport: &Arc<dyn Transport>, config: &ClientConfig) {
    let preferred: AudioCodec = config.preferred_codec.into();
    let formats = ordered_supported_formats(preferred);
    let hello = MessageBuilder::client_hello(
        config.player_id,
        config.device_name.clone(),
        vec!["player".to_string()],
        serde_json::json!({ "platform": "chorus-client" }),
        formats,
    );
    if let Ok(text) = serde_json::to_string(&hello) {
        let _ = transport.send_text(text).await;
    }
}

/// Builds the advertised format list with `preferred` first, both stereo
/// and mono variants of every codec, matching the wire contract that
/// ordering is the server's selection priority, not a UI hint.
fn ordered_supported_formats(preferred: AudioCodec) -> Vec<AudioFormat> {
    let all = [AudioCodec::Opus, AudioCodec::Flac, AudioCodec::Pcm];
    let mut ordered = vec![preferred];
    for codec in all {
        if codec != preferred {
            ordered.push(codec);
        }
    }

    let mut formats = Vec::with_capacity(ordered.len() * 2);
    for codec in ordered {
        formats.push(AudioFormat { codec, sample_rate: 48_000, channels: 2, bit_depth: 16 });
        formats.push(AudioFormat { codec, sample_rate: 48_000, channels: 1, bit_depth: 16 });
    }
    formats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_sequence_follows_expected_ms_values() {
        let expected = [500, 1_000, 2_000, 4_000, 8_000];
        for (attempt, expected_ms) in (1..=5u32).zip(expected) {
            assert_eq!(backoff_for_attempt(attempt), Duration::from_millis(expected_ms));
        }
    }

    #[test]
    fn backoff_saturates_at_the_last_configured_step_beyond_five_attempts() {
        // The configured sequence tops out at 8_000ms, which never reaches
        // MAX_BACKOFF_MS (10_000ms); the cap only matters if the sequence
        // itself is ever extended past it.
        let last_step = Duration::from_millis(*RECONNECT_BACKOFFS_MS.last().unwrap());
        assert!(last_step <= Duration::from_millis(MAX_BACKOFF_MS));
        assert_eq!(backoff_for_attempt(9), last_step);
        assert_eq!(backoff_for_attempt(100), last_step);
    }

    #[test]
    fn ordered_supported_formats_puts_preferred_codec_first() {
        let formats = ordered_supported_formats(AudioCodec::Flac);
        assert_eq!(formats[0].codec, AudioCodec::Flac);
        assert_eq!(formats[1].codec, AudioCodec::Flac);
        assert_eq!(formats[2].codec, AudioCodec::Opus);
    }
}
