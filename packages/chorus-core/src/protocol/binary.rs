//! Binary frame parsing: 1-byte tag + 8-byte BE signed microsecond
//! timestamp + payload. Malformed frames (short header, unknown tag) are
//! logged and dropped by the caller; this module only classifies, it never
//! panics on bad input.

use bytes::Bytes;

use super::constants::{BINARY_HEADER_LEN, TAG_ARTWORK_RANGE, TAG_AUDIO, TAG_VISUALIZER};

/// A parsed binary frame, tagged by kind.
#[derive(Debug, Clone)]
pub enum BinaryFrame {
    Audio { server_time_us: i64, payload: Bytes },
    Artwork { channel: u8, server_time_us: i64, payload: Bytes },
    Visualizer { server_time_us: i64, payload: Bytes },
}

/// Reason a binary frame failed to parse, for the caller's malformed-frame
/// counter and log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryFrameError {
    TooShort,
    UnknownTag(u8),
}

/// Parses one binary frame. Takes ownership of the frame bytes so the
/// caller doesn't pay a copy for the common case (the payload slice is
/// just `frame.slice(9..)`).
pub fn parse_binary_frame(frame: Bytes) -> Result<BinaryFrame, BinaryFrameError> {
    if frame.len() < BINARY_HEADER_LEN {
        return Err(BinaryFrameError::TooShort);
    }

    let tag = frame[0];
    let mut ts_bytes = [0u8; 8];
    ts_bytes.copy_from_slice(&frame[1..9]);
    let server_time_us = i64::from_be_bytes(ts_bytes);
    let payload = frame.slice(BINARY_HEADER_LEN..);

    if tag == TAG_AUDIO {
        return Ok(BinaryFrame::Audio { server_time_us, payload });
    }
    if TAG_ARTWORK_RANGE.contains(&tag) {
        let channel = tag - TAG_ARTWORK_RANGE.start();
        return Ok(BinaryFrame::Artwork { channel, server_time_us, payload });
    }
    if tag == TAG_VISUALIZER {
        return Ok(BinaryFrame::Visualizer { server_time_us, payload });
    }

    Err(BinaryFrameError::UnknownTag(tag))
}

/// Encodes a binary frame header, for building outbound frames (currently
/// unused by the client, which never sends binary frames, but kept here so
/// the header layout has exactly one writer and one reader).
#[must_use]
pub fn encode_header(tag: u8, server_time_us: i64) -> [u8; BINARY_HEADER_LEN] {
    let mut out = [0u8; BINARY_HEADER_LEN];
    out[0] = tag;
    out[1..9].copy_from_slice(&server_time_us.to_be_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8, ts: i64, payload: &[u8]) -> Bytes {
        let mut buf = encode_header(tag, ts).to_vec();
        buf.extend_from_slice(payload);
        Bytes::from(buf)
    }

    #[test]
    fn parses_audio_frame() {
        let f = frame(4, 123_456, b"pcmdata");
        match parse_binary_frame(f).unwrap() {
            BinaryFrame::Audio { server_time_us, payload } => {
                assert_eq!(server_time_us, 123_456);
                assert_eq!(&payload[..], b"pcmdata");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_artwork_channel_from_tag_offset() {
        let f = frame(10, 0, b"jpeg");
        match parse_binary_frame(f).unwrap() {
            BinaryFrame::Artwork { channel, .. } => assert_eq!(channel, 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_visualizer_frame() {
        let f = frame(16, 0, b"fft");
        assert!(matches!(parse_binary_frame(f).unwrap(), BinaryFrame::Visualizer { .. }));
    }

    #[test]
    fn rejects_short_frame() {
        let short = Bytes::from_static(&[4, 0, 0, 0]);
        assert_eq!(parse_binary_frame(short).unwrap_err(), BinaryFrameError::TooShort);
    }

    #[test]
    fn rejects_unknown_tag() {
        let f = frame(200, 0, b"x");
        assert_eq!(parse_binary_frame(f).unwrap_err(), BinaryFrameError::UnknownTag(200));
    }

    #[test]
    fn empty_payload_is_not_an_error() {
        let f = frame(4, 0, b"");
        assert!(parse_binary_frame(f).is_ok());
    }
}
