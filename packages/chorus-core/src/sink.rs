//! Output sink: the consumed external interface that accepts interleaved
//! PCM and exposes a settable playback rate. A real implementation (e.g.
//! `cpal`-backed) lives in the binary crate; this module only defines the
//! trait the renderer drives.

use crate::error::ChorusError;

/// An audio output device. Owned exclusively by the renderer's playback
/// task; never shared across a task boundary.
pub trait OutputSink: Send {
    /// Allocates the device for the given format. 16-bit mono and stereo
    /// are mandatory; other bit depths are optional and must error
    /// cleanly rather than silently truncate.
    fn configure(
        &mut self,
        sample_rate: u32,
        channels: u16,
        bit_depth: u16,
        buffer_bytes: usize,
    ) -> Result<(), ChorusError>;

    /// Writes interleaved PCM. May block when the device buffer is full.
    /// Returns the number of bytes actually written; a partial write is
    /// reported, never silently dropped.
    fn write(&mut self, pcm: &[u8]) -> Result<usize, ChorusError>;

    /// Sets the playback rate in integer samples per second (the
    /// renderer's rate-adjust tier nudges this within [0.98, 1.02] of the
    /// configured sample rate).
    fn set_playback_rate(&mut self, samples_per_second: u32) -> Result<(), ChorusError>;

    fn flush(&mut self) -> Result<(), ChorusError>;
    fn pause(&mut self) -> Result<(), ChorusError>;
    fn resume(&mut self) -> Result<(), ChorusError>;
    fn stop(&mut self) -> Result<(), ChorusError>;
    fn release(&mut self) -> Result<(), ChorusError>;
}

/// A no-op sink, useful for tests that care about renderer scheduling
/// decisions but not about a real audio device.
#[derive(Default)]
pub struct NullSink {
    pub bytes_written: usize,
    pub last_rate: Option<u32>,
    pub configured: Option<(u32, u16, u16)>,
}

impl OutputSink for NullSink {
    fn configure(&mut self, sample_rate: u32, channels: u16, bit_depth: u16, _buffer_bytes: usize) -> Result<(), ChorusError> {
        self.configured = Some((sample_rate, channels, bit_depth));
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<usize, ChorusError> {
        self.bytes_written += pcm.len();
        Ok(pcm.len())
    }

    fn set_playback_rate(&mut self, samples_per_second: u32) -> Result<(), ChorusError> {
        self.last_rate = Some(samples_per_second);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ChorusError> {
        Ok(())
    }

    fn pause(&mut self) -> Result<(), ChorusError> {
        Ok(())
    }

    fn resume(&mut self) -> Result<(), ChorusError> {
        Ok(())
    }

    fn stop(&mut self) -> Result<(), ChorusError> {
        Ok(())
    }

    fn release(&mut self) -> Result<(), ChorusError> {
        Ok(())
    }
}
