//! FLAC decoding via `claxon`. `claxon::FlacReader` expects a full stream
//! (STREAMINFO header followed by frames), so each call re-wraps the
//! stored header with the incoming frame bytes rather than holding a
//! long-lived reader across calls.

use std::io::Cursor;

use super::Codec;
use crate::error::ChorusError;

#[derive(Default)]
pub struct FlacCodec {
    header: Vec<u8>,
}

impl Codec for FlacCodec {
    fn set_header(&mut self, header: &[u8]) -> Result<(), ChorusError> {
        self.header = header.to_vec();
        Ok(())
    }

    fn decode(&mut self, compressed: &[u8]) -> Result<Vec<i16>, ChorusError> {
        if self.header.is_empty() {
            return Err(ChorusError::Codec("flac decode called before codec_header arrived".to_string()));
        }

        let mut buf = Vec::with_capacity(self.header.len() + compressed.len());
        buf.extend_from_slice(&self.header);
        buf.extend_from_slice(compressed);

        let mut reader = claxon::FlacReader::new(Cursor::new(buf))
            .map_err(|error| ChorusError::Codec(format!("flac stream parse failed: {error}")))?;

        let mut samples = Vec::new();
        for sample in reader.samples() {
            let sample = sample.map_err(|error| ChorusError::Codec(format!("flac decode failed: {error}")))?;
            samples.push(sample as i16);
        }
        Ok(samples)
    }

    /// Never discards `header`: the next `decode` call needs it again.
    fn flush(&mut self) -> Result<Vec<i16>, ChorusError> {
        Ok(Vec::new())
    }
}
