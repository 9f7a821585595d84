//! Codec: decodes compressed payloads to interleaved 16-bit PCM. Must
//! tolerate being retried under back-pressure (a stateful codec like Opus
//! desynchronizes if a frame is silently dropped after one failed
//! attempt), and `flush` must never restart the underlying session.

mod pcm;

#[cfg(feature = "opus")]
mod opus_codec;
#[cfg(feature = "flac")]
mod flac_codec;

pub use pcm::PcmPassthroughCodec;

#[cfg(feature = "opus")]
pub use opus_codec::OpusCodec;
#[cfg(feature = "flac")]
pub use flac_codec::FlacCodec;

use crate::error::ChorusError;

/// Maximum retries per input frame before giving up and returning an
/// error (the caller still owns re-queueing policy; the codec itself
/// never drops the frame on its own).
pub const MAX_DECODE_RETRIES: u32 = 3;

pub trait Codec: Send {
    /// Accepts an optional codec-specific header at the start of stream
    /// (e.g. an Opus ID header, a FLAC STREAMINFO block).
    fn set_header(&mut self, header: &[u8]) -> Result<(), ChorusError>;

    /// Decodes one compressed frame to interleaved 16-bit PCM samples.
    fn decode(&mut self, compressed: &[u8]) -> Result<Vec<i16>, ChorusError>;

    /// Flushes any buffered output without restarting the codec session.
    fn flush(&mut self) -> Result<Vec<i16>, ChorusError>;
}
