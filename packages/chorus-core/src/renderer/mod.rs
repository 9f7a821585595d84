//! Deadline-scheduled renderer: a FIFO queue of timestamped PCM chunks,
//! drained by a single playback task that dispatches each chunk through a
//! four-tier correction hierarchy (deadband / sample insert-delete / rate
//! adjust / hard resync) depending on how far its deadline has slipped.

mod chunk;

pub use chunk::Chunk;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::clock::now_client_us;
use crate::filter::TimeFilter;
use crate::runtime::TaskSpawner;
use crate::sink::OutputSink;

/// Boundaries of the four-tier correction hierarchy, all in microseconds.
const SCHEDULE_AHEAD_THRESHOLD_US: i64 = 200_000;
const RATE_ADJUST_THRESHOLD_US: i64 = 15_000;
const DEADBAND_THRESHOLD_US: i64 = 1_000;
const HARD_RESYNC_THRESHOLD_US: i64 = -200_000;

const RATE_ADJUST_GAIN: f64 = 0.1;
const RATE_CLAMP_MIN: f64 = 0.98;
const RATE_CLAMP_MAX: f64 = 1.02;

const SCHEDULE_AHEAD_SLEEP: Duration = Duration::from_millis(50);
const EMPTY_QUEUE_POLL: Duration = Duration::from_millis(20);
const STOP_AWAIT_TIMEOUT: Duration = Duration::from_millis(500);

const EMA_GAIN: f64 = 0.1;

pub type SharedFilter = Arc<Mutex<TimeFilter>>;

/// Decoded stream parameters the renderer needs to size the output sink.
/// Deliberately narrower than the wire `stream/start` payload: the
/// renderer never needs to know which codec produced the PCM it receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl StreamConfig {
    #[must_use]
    pub fn bytes_per_frame(&self) -> usize {
        usize::from(self.channels) * usize::from(self.bit_depth / 8)
    }
}

/// Observability counters for the playback loop.
#[derive(Default)]
pub struct RendererStats {
    chunks_played: AtomicU64,
    chunks_dropped: AtomicU64,
    hard_resyncs: AtomicU64,
    queued_samples: AtomicI64,
    sync_error_ema_us_bits: AtomicU64,
}

impl RendererStats {
    pub fn chunks_played(&self) -> u64 {
        self.chunks_played.load(Ordering::Relaxed)
    }
    pub fn chunks_dropped(&self) -> u64 {
        self.chunks_dropped.load(Ordering::Relaxed)
    }
    pub fn hard_resyncs(&self) -> u64 {
        self.hard_resyncs.load(Ordering::Relaxed)
    }
    pub fn queued_samples(&self) -> i64 {
        self.queued_samples.load(Ordering::Relaxed)
    }
    pub fn sync_error_ema_us(&self) -> f64 {
        f64::from_bits(self.sync_error_ema_us_bits.load(Ordering::Relaxed))
    }

    fn set_ema(&self, value: f64) {
        self.sync_error_ema_us_bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

enum RendererCommand {
    Configure(StreamConfig),
    Clear,
    Pause,
    Resume,
    Stop,
}

struct SharedState {
    filter: SharedFilter,
    queue: Mutex<std::collections::VecDeque<Chunk>>,
    generation: AtomicU64,
    stream_config: Mutex<Option<StreamConfig>>,
    stats: RendererStats,
    paused: AtomicBool,
}

/// The handle to the task holding the output sink, captured-and-nulled
/// atomically on stop so the two-phase cancellation pattern can't race
/// with a second concurrent `stop()` call.
struct TaskHandle {
    command_tx: mpsc::UnboundedSender<RendererCommand>,
    completion: oneshot::Receiver<()>,
}

pub struct Renderer {
    shared: Arc<SharedState>,
    task: Mutex<Option<TaskHandle>>,
}

impl Renderer {
    #[must_use]
    pub fn new(filter: SharedFilter) -> Self {
        Self {
            shared: Arc::new(SharedState {
                filter,
                queue: Mutex::new(std::collections::VecDeque::new()),
                generation: AtomicU64::new(0),
                stream_config: Mutex::new(None),
                stats: RendererStats::default(),
                paused: AtomicBool::new(false),
            }),
            task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &RendererStats {
        &self.shared.stats
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Spawns the playback task, which takes ownership of `sink` until
    /// `stop()` is called.
    pub fn start<S: TaskSpawner>(&self, spawner: &S, sink: Box<dyn OutputSink>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = oneshot::channel();

        *self.task.lock() = Some(TaskHandle { command_tx, completion: done_rx });

        let shared = self.shared.clone();
        spawner.spawn(async move {
            playback_task(shared, sink, command_rx).await;
            let _ = done_tx.send(());
        });
    }

    pub fn configure(&self, config: StreamConfig) {
        *self.shared.stream_config.lock() = Some(config);
        self.send_command(RendererCommand::Configure(config));
    }

    /// Drops if the filter isn't ready yet; otherwise computes the
    /// deadline once and pushes the chunk.
    pub fn enqueue(&self, server_time_us: i64, pcm: Bytes) {
        let Some(config) = *self.shared.stream_config.lock() else {
            return;
        };
        let filter = self.shared.filter.lock();
        if !filter.is_ready() {
            return;
        }
        let deadline = filter.server_to_client(server_time_us);
        drop(filter);

        let chunk = Chunk::new(server_time_us, deadline, pcm, config.bytes_per_frame());
        self.shared.stats.queued_samples.fetch_add(chunk.frame_count as i64, Ordering::Relaxed);
        self.shared.queue.lock().push_back(chunk);
    }

    /// Bumps the generation, flushes the queue and sink, and zeroes the
    /// sync-error EMA. The next `enqueue` produces a chunk belonging to
    /// the new generation.
    pub fn clear(&self) {
        self.shared.generation.fetch_add(1, Ordering::Relaxed);
        self.shared.queue.lock().clear();
        self.shared.stats.queued_samples.store(0, Ordering::Relaxed);
        self.shared.stats.set_ema(0.0);
        self.send_command(RendererCommand::Clear);
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::Relaxed);
        self.send_command(RendererCommand::Pause);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::Relaxed);
        self.send_command(RendererCommand::Resume);
    }

    /// Two-phase cancellation: capture-and-null the task handle under the
    /// lock, then await its completion outside the lock. Never holds the
    /// lock across an `await`.
    pub async fn stop(&self) {
        let handle = self.task.lock().take();
        let Some(handle) = handle else {
            return;
        };
        let _ = handle.command_tx.send(RendererCommand::Stop);
        let _ = tokio::time::timeout(STOP_AWAIT_TIMEOUT, handle.completion).await;
    }

    fn send_command(&self, command: RendererCommand) {
        if let Some(handle) = self.task.lock().as_ref() {
            let _ = handle.command_tx.send(command);
        }
    }
}

async fn playback_task(
    shared: Arc<SharedState>,
    mut sink: Box<dyn OutputSink>,
    mut command_rx: mpsc::UnboundedReceiver<RendererCommand>,
) {
    loop {
        tokio::select! {
            biased;
            command = command_rx.recv() => {
                match command {
                    Some(RendererCommand::Configure(config)) => {
                        if let Err(error) = sink.configure(
                            config.sample_rate,
                            config.channels,
                            config.bit_depth,
                            default_buffer_bytes(),
                        ) {
                            tracing::warn!(%error, "output sink rejected configuration");
                        }
                    }
                    Some(RendererCommand::Clear) => {
                        let _ = sink.flush();
                    }
                    Some(RendererCommand::Pause) => {
                        let _ = sink.pause();
                    }
                    Some(RendererCommand::Resume) => {
                        let _ = sink.resume();
                    }
                    Some(RendererCommand::Stop) | None => {
                        let _ = sink.stop();
                        let _ = sink.release();
                        break;
                    }
                }
            }
            () = tick(&shared, sink.as_mut()) => {}
        }
    }
}

async fn tick(shared: &Arc<SharedState>, sink: &mut dyn OutputSink) {
    if shared.paused.load(Ordering::Relaxed) {
        tokio::time::sleep(EMPTY_QUEUE_POLL).await;
        return;
    }

    let Some(config) = *shared.stream_config.lock() else {
        tokio::time::sleep(EMPTY_QUEUE_POLL).await;
        return;
    };

    let Some(deadline_us) = shared.queue.lock().front().map(|c| c.client_deadline_us) else {
        tokio::time::sleep(EMPTY_QUEUE_POLL).await;
        return;
    };

    let now = now_client_us();
    let slack_us = deadline_us - now;

    if slack_us > SCHEDULE_AHEAD_THRESHOLD_US {
        tokio::time::sleep(SCHEDULE_AHEAD_SLEEP).await;
        return;
    }

    if slack_us < HARD_RESYNC_THRESHOLD_US {
        if let Some(chunk) = shared.queue.lock().pop_front() {
            shared.stats.hard_resyncs.fetch_add(1, Ordering::Relaxed);
            shared.stats.chunks_dropped.fetch_add(1, Ordering::Relaxed);
            shared.stats.queued_samples.fetch_sub(chunk.frame_count as i64, Ordering::Relaxed);
            tracing::debug!(deadline_us, now, "hard_resync");
        }
        return;
    }

    if slack_us.abs() <= DEADBAND_THRESHOLD_US {
        if let Some(chunk) = shared.queue.lock().pop_front() {
            let _ = sink.set_playback_rate(config.sample_rate);
            write_chunk(shared, sink, chunk, now, config.bytes_per_frame());
        }
        return;
    }

    if slack_us.abs() <= RATE_ADJUST_THRESHOLD_US {
        let Some(mut chunk) = shared.queue.lock().pop_front() else { return };
        if slack_us > 0 {
            let silence_frames = frames_for_duration(slack_us, config.sample_rate);
            write_silence(sink, silence_frames, config.bytes_per_frame());
        } else {
            let skip_frames = frames_for_duration(-slack_us, config.sample_rate);
            chunk.advance(skip_frames, config.bytes_per_frame());
        }
        write_chunk(shared, sink, chunk, now, config.bytes_per_frame());
        return;
    }

    // 15ms < |slack| <= 200ms: rate-adjust. Deliberate deviation from
    // spec.md section 4.4's literal `1.0 + slack*0.1`: taken at face value
    // that formula speeds up an already-early chunk (slack > 0) and slows
    // down an already-late one (slack < 0), which runs the correction
    // backwards. This uses `1.0 - slack*0.1` instead, so rate increases as
    // slack goes negative (late, speed up to drain the backlog) and
    // decreases as slack goes positive (early, slow down to let the
    // deadline catch up). This is a correctness fix to the written
    // formula's sign, not the gain-vs-step-size ambiguity spec.md section 9
    // calls out about the `0.1` constant — see DESIGN.md.
    if let Some(chunk) = shared.queue.lock().pop_front() {
        let slack_fraction = slack_us as f64 / 1_000_000.0;
        let rate_multiplier = (1.0 - slack_fraction * RATE_ADJUST_GAIN).clamp(RATE_CLAMP_MIN, RATE_CLAMP_MAX);
        let adjusted_rate = (config.sample_rate as f64 * rate_multiplier).round() as u32;
        let _ = sink.set_playback_rate(adjusted_rate);
        write_chunk(shared, sink, chunk, now, config.bytes_per_frame());
    }
}

/// Writes one chunk. A partial write (device buffer full mid-write) is
/// re-queued at the head of the queue rather than dropped, per the
/// propagation policy: renderer write errors are logged, never silently
/// discarded, and the unwritten remainder survives to the next tick.
fn write_chunk(shared: &Arc<SharedState>, sink: &mut dyn OutputSink, chunk: Chunk, now: i64, bytes_per_frame: usize) {
    let written = match sink.write(&chunk.pcm) {
        Ok(written) => written,
        Err(error) => {
            tracing::warn!(%error, "output sink write failed");
            return;
        }
    };

    if written < chunk.pcm.len() && bytes_per_frame > 0 {
        let written_frames = written / bytes_per_frame;
        let mut remainder = chunk;
        remainder.advance(written_frames, bytes_per_frame);
        shared.stats.queued_samples.fetch_sub(written_frames as i64, Ordering::Relaxed);
        shared.queue.lock().push_front(remainder);
        return;
    }

    shared.stats.chunks_played.fetch_add(1, Ordering::Relaxed);
    shared.stats.queued_samples.fetch_sub(chunk.frame_count as i64, Ordering::Relaxed);

    let error_us = (now - chunk.client_deadline_us) as f64;
    let prev = shared.stats.sync_error_ema_us();
    shared.stats.set_ema(EMA_GAIN * error_us + (1.0 - EMA_GAIN) * prev);
}

fn write_silence(sink: &mut dyn OutputSink, frames: usize, bytes_per_frame: usize) {
    if frames == 0 || bytes_per_frame == 0 {
        return;
    }
    let silence = vec![0u8; frames * bytes_per_frame];
    if let Err(error) = sink.write(&silence) {
        tracing::warn!(%error, "output sink write failed while inserting silence");
    }
}

fn frames_for_duration(duration_us: i64, sample_rate: u32) -> usize {
    ((duration_us.max(0) as i128 * sample_rate as i128) / 1_000_000) as usize
}

fn default_buffer_bytes() -> usize {
    32 * 1024 * 1024
}
