//! PCM passthrough: the "codec" for `preferred_codec = pcm`. The server
//! already sends interleaved 16-bit PCM, so this just reinterprets bytes.

use super::Codec;
use crate::error::ChorusError;

#[derive(Default)]
pub struct PcmPassthroughCodec;

impl Codec for PcmPassthroughCodec {
    fn set_header(&mut self, _header: &[u8]) -> Result<(), ChorusError> {
        Ok(())
    }

    fn decode(&mut self, compressed: &[u8]) -> Result<Vec<i16>, ChorusError> {
        if compressed.len() % 2 != 0 {
            return Err(ChorusError::Codec("pcm payload has odd byte length".to_string()));
        }
        Ok(compressed
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
            .collect())
    }

    fn flush(&mut self) -> Result<Vec<i16>, ChorusError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_little_endian_samples() {
        let mut codec = PcmPassthroughCodec;
        let samples = codec.decode(&[0x01, 0x00, 0xff, 0xff]).unwrap();
        assert_eq!(samples, vec![1, -1]);
    }

    #[test]
    fn odd_length_payload_errors() {
        let mut codec = PcmPassthroughCodec;
        assert!(codec.decode(&[0x01]).is_err());
    }

    #[test]
    fn flush_never_errors_and_yields_nothing() {
        let mut codec = PcmPassthroughCodec;
        assert_eq!(codec.flush().unwrap(), Vec::<i16>::new());
    }
}
