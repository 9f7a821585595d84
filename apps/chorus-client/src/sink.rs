//! `cpal`-backed [`OutputSink`] implementation.
//!
//! `cpal::Stream` is not `Send` on every platform, so the stream is built
//! and held alive on a dedicated OS thread, communicating with the sink
//! handle through a byte channel rather than a shared reference to the
//! stream itself.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;

use chorus_core::{ChorusError, OutputSink};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;

/// Bounded channel capacity, in PCM byte chunks queued ahead of the
/// device. Each `write()` call below this bound returns immediately;
/// once full, `write()` blocks the caller until the device consumes more,
/// matching the `OutputSink::write` contract ("may block when the device
/// buffer is full").
const CHANNEL_DEPTH: usize = 64;

enum DeviceCommand {
    Pause,
    Resume,
    Stop,
}

/// Live audio output device. Owned exclusively by the renderer's playback
/// task (per the core's ownership model); never cloned or shared.
pub struct CpalSink {
    audio_tx: Option<std_mpsc::SyncSender<Vec<u8>>>,
    command_tx: Option<std_mpsc::Sender<DeviceCommand>>,
    device_thread: Option<JoinHandle<()>>,
    bytes_per_frame: usize,
}

impl Default for CpalSink {
    fn default() -> Self {
        Self { audio_tx: None, command_tx: None, device_thread: None, bytes_per_frame: 0 }
    }
}

impl OutputSink for CpalSink {
    fn configure(&mut self, sample_rate: u32, channels: u16, bit_depth: u16, _buffer_bytes: usize) -> Result<(), ChorusError> {
        if bit_depth != 16 {
            return Err(ChorusError::Sink(format!("unsupported bit depth {bit_depth}, only 16-bit PCM is supported")));
        }
        self.teardown();

        self.bytes_per_frame = usize::from(channels) * 2;
        let (audio_tx, audio_rx) = std_mpsc::sync_channel::<Vec<u8>>(CHANNEL_DEPTH);
        let (command_tx, command_rx) = std_mpsc::channel::<DeviceCommand>();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<(), String>>(0);

        let thread = std::thread::Builder::new()
            .name("chorus-audio-output".to_string())
            .spawn(move || device_thread_main(sample_rate, channels, audio_rx, command_rx, ready_tx))
            .map_err(|error| ChorusError::Sink(format!("failed to spawn output device thread: {error}")))?;

        ready_rx
            .recv()
            .map_err(|_| ChorusError::Sink("output device thread exited before it was ready".to_string()))?
            .map_err(ChorusError::Sink)?;

        self.audio_tx = Some(audio_tx);
        self.command_tx = Some(command_tx);
        self.device_thread = Some(thread);
        Ok(())
    }

    fn write(&mut self, pcm: &[u8]) -> Result<usize, ChorusError> {
        let Some(audio_tx) = &self.audio_tx else {
            return Err(ChorusError::Sink("write called before configure".to_string()));
        };
        audio_tx
            .send(pcm.to_vec())
            .map_err(|_| ChorusError::Sink("output device thread is gone".to_string()))?;
        Ok(pcm.len())
    }

    fn set_playback_rate(&mut self, _samples_per_second: u32) -> Result<(), ChorusError> {
        // cpal has no standard API for a fractional resample of an
        // already-open stream; the renderer's rate-adjust tier relies on
        // this to nudge timing within +/-2%, which in this reference
        // implementation is approximated by the deadband/sample-insert
        // tiers alone. A production sink would resample in software here.
        Ok(())
    }

    fn flush(&mut self) -> Result<(), ChorusError> {
        Ok(())
    }

    fn pause(&mut self) -> Result<(), ChorusError> {
        self.send_command(DeviceCommand::Pause)
    }

    fn resume(&mut self) -> Result<(), ChorusError> {
        self.send_command(DeviceCommand::Resume)
    }

    fn stop(&mut self) -> Result<(), ChorusError> {
        self.send_command(DeviceCommand::Stop)
    }

    fn release(&mut self) -> Result<(), ChorusError> {
        self.teardown();
        Ok(())
    }
}

impl CpalSink {
    fn send_command(&self, command: DeviceCommand) -> Result<(), ChorusError> {
        let Some(command_tx) = &self.command_tx else { return Ok(()) };
        let _ = command_tx.send(command);
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(command_tx) = self.command_tx.take() {
            let _ = command_tx.send(DeviceCommand::Stop);
        }
        self.audio_tx = None;
        if let Some(thread) = self.device_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Builds the `cpal` output stream and parks on `command_rx` to keep it
/// alive until told to stop. Runs entirely on its own OS thread because
/// `cpal::Stream` is `!Send` on some platforms (notably macOS).
fn device_thread_main(
    sample_rate: u32,
    channels: u16,
    audio_rx: std_mpsc::Receiver<Vec<u8>>,
    command_rx: std_mpsc::Receiver<DeviceCommand>,
    ready_tx: std_mpsc::SyncSender<Result<(), String>>,
) {
    let stream = match build_stream(sample_rate, channels, audio_rx) {
        Ok(stream) => stream,
        Err(error) => {
            let _ = ready_tx.send(Err(error));
            return;
        }
    };

    if let Err(error) = stream.play() {
        let _ = ready_tx.send(Err(format!("failed to start output stream: {error}")));
        return;
    }
    let _ = ready_tx.send(Ok(()));

    loop {
        match command_rx.recv() {
            Ok(DeviceCommand::Pause) => {
                let _ = stream.pause();
            }
            Ok(DeviceCommand::Resume) => {
                let _ = stream.play();
            }
            Ok(DeviceCommand::Stop) | Err(_) => break,
        }
    }
}

fn build_stream(
    sample_rate: u32,
    channels: u16,
    audio_rx: std_mpsc::Receiver<Vec<u8>>,
) -> Result<cpal::Stream, String> {
    let host = cpal::default_host();
    let device = host.default_output_device().ok_or_else(|| "no default output device available".to_string())?;

    let config = StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut pending: Vec<u8> = Vec::new();

    device
        .build_output_stream(
            &config,
            move |data: &mut [i16], _info: &cpal::OutputCallbackInfo| {
                let bytes_needed = data.len() * 2;
                while pending.len() < bytes_needed {
                    match audio_rx.try_recv() {
                        Ok(chunk) => pending.extend_from_slice(&chunk),
                        Err(_) => break,
                    }
                }

                let available = pending.len().min(bytes_needed);
                for (i, sample) in data.iter_mut().enumerate().take(available / 2) {
                    let offset = i * 2;
                    *sample = i16::from_le_bytes([pending[offset], pending[offset + 1]]);
                }
                for sample in data.iter_mut().skip(available / 2) {
                    *sample = 0;
                }
                pending.drain(..available);
            },
            move |error| {
                tracing::error!(%error, "cpal output stream error");
            },
            None,
        )
        .map_err(|error| format!("failed to build output stream: {error}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_16_bit_configuration() {
        let mut sink = CpalSink::default();
        let result = sink.configure(48_000, 2, 24, 32 * 1024 * 1024);
        assert!(result.is_err());
    }
}
