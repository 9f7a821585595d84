//! Opus decoding via the `opus` crate. Opus is a stateful codec: the
//! decoder carries history across frames, so a frame that fails to decode
//! must be retried rather than dropped, or every subsequent frame
//! desynchronizes from the encoder's internal state.

use opus::{Channels, Decoder};

use super::{Codec, MAX_DECODE_RETRIES};
use crate::error::ChorusError;

/// Maximum samples per channel in one Opus frame at 48kHz (120ms, the
/// largest frame duration Opus defines).
const MAX_FRAME_SAMPLES: usize = 5760;

pub struct OpusCodec {
    decoder: Decoder,
    channels: usize,
    scratch: Vec<i16>,
}

impl OpusCodec {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self, ChorusError> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            other => return Err(ChorusError::Codec(format!("opus does not support {other} channels"))),
        };
        let decoder = Decoder::new(sample_rate, opus_channels)
            .map_err(|e| ChorusError::Codec(format!("opus decoder init failed: {e}")))?;
        Ok(Self {
            decoder,
            channels: channels as usize,
            scratch: vec![0i16; MAX_FRAME_SAMPLES * usize::from(channels)],
        })
    }
}

impl Codec for OpusCodec {
    /// Opus carries its format in the codec header negotiated out of
    /// band (sample rate, channel count); there is no in-stream ID header
    /// to feed the decoder, so this is a no-op validation point only.
    fn set_header(&mut self, _header: &[u8]) -> Result<(), ChorusError> {
        Ok(())
    }

    fn decode(&mut self, compressed: &[u8]) -> Result<Vec<i16>, ChorusError> {
        let mut last_error = None;
        for _ in 0..MAX_DECODE_RETRIES {
            match self.decoder.decode(compressed, &mut self.scratch, false) {
                Ok(samples_per_channel) => {
                    let total = samples_per_channel * self.channels;
                    return Ok(self.scratch[..total].to_vec());
                }
                Err(error) => last_error = Some(error),
            }
        }
        Err(ChorusError::Codec(format!(
            "opus decode failed after {MAX_DECODE_RETRIES} attempts: {:?}",
            last_error
        )))
    }

    /// Never recreates the decoder: a fresh `Decoder` would discard the
    /// running state Opus needs to stay in sync with the encoder.
    fn flush(&mut self) -> Result<Vec<i16>, ChorusError> {
        Ok(Vec::new())
    }
}
