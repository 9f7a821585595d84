//! The unit the renderer queues and plays: one PCM chunk tagged with the
//! client-clock deadline it was given at enqueue time. The deadline is
//! computed once, from the filter's estimate at that instant, and never
//! re-evaluated as the filter continues to converge — recomputing it
//! against a moving filter estimate would make "slack" meaningless.

use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct Chunk {
    pub server_time_us: i64,
    pub client_deadline_us: i64,
    pub pcm: Bytes,
    pub frame_count: usize,
}

impl Chunk {
    #[must_use]
    pub fn new(server_time_us: i64, client_deadline_us: i64, pcm: Bytes, bytes_per_frame: usize) -> Self {
        let frame_count = if bytes_per_frame == 0 { 0 } else { pcm.len() / bytes_per_frame };
        Self { server_time_us, client_deadline_us, pcm, frame_count }
    }

    /// Advances past `frames` worth of samples, used by the sample-level
    /// tier when the chunk is slightly late: rather than writing stale
    /// audio, the renderer skips ahead into the chunk before writing.
    pub fn advance(&mut self, frames: usize, bytes_per_frame: usize) {
        let skip_bytes = (frames * bytes_per_frame).min(self.pcm.len());
        self.pcm = self.pcm.slice(skip_bytes..);
        self.frame_count = self.frame_count.saturating_sub(frames);
    }
}
