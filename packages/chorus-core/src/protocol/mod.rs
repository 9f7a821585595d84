//! Protocol handler: turns raw transport frames into [`crate::events::ProtocolEvent`]s.
//!
//! Malformed input never propagates as an error; it is logged via
//! `tracing::warn!` and counted, a "log and discard" posture consistent
//! with the rest of the frame-handling code in this crate.

pub mod binary;
pub mod constants;
pub mod message;

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use self::binary::{parse_binary_frame, BinaryFrame, BinaryFrameError};
use self::message::Inbound;
use crate::events::ProtocolEvent;

/// Parses inbound frames and tracks how many were rejected as malformed.
#[derive(Default)]
pub struct ProtocolHandler {
    malformed_frames: AtomicU64,
}

impl ProtocolHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total frames rejected as malformed since construction.
    #[must_use]
    pub fn malformed_frame_count(&self) -> u64 {
        self.malformed_frames.load(Ordering::Relaxed)
    }

    /// Parses one UTF-8 JSON text frame. Returns `None` for an unknown
    /// `type` or invalid JSON, after logging and incrementing the
    /// malformed-frame counter.
    pub fn parse_text(&self, text: &str) -> Option<ProtocolEvent> {
        match serde_json::from_str::<Inbound>(text) {
            Ok(inbound) => Some(self.to_protocol_event(inbound)),
            Err(error) => {
                tracing::warn!(%error, "malformed text frame, discarding");
                self.malformed_frames.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Parses one binary frame. Returns `None` for a short header or
    /// unknown tag, after logging and incrementing the malformed-frame
    /// counter.
    pub fn parse_binary(&self, frame: Bytes) -> Option<ProtocolEvent> {
        match parse_binary_frame(frame) {
            Ok(BinaryFrame::Audio { server_time_us, payload }) => {
                Some(ProtocolEvent::AudioChunk { server_time_us, payload })
            }
            Ok(BinaryFrame::Artwork { channel, server_time_us, payload }) => {
                Some(ProtocolEvent::Artwork { channel, server_time_us, payload })
            }
            Ok(BinaryFrame::Visualizer { server_time_us, payload }) => {
                Some(ProtocolEvent::Visualizer { server_time_us, payload })
            }
            Err(BinaryFrameError::TooShort) => {
                tracing::warn!("binary frame shorter than header, discarding");
                self.malformed_frames.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(BinaryFrameError::UnknownTag(tag)) => {
                tracing::warn!(tag, "unknown binary frame tag, discarding");
                self.malformed_frames.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn to_protocol_event(&self, inbound: Inbound) -> ProtocolEvent {
        match inbound {
            Inbound::ServerHello(p) => {
                ProtocolEvent::ServerHello { session_id: p.session_id, server_name: p.server_name }
            }
            Inbound::ServerTime(p) => ProtocolEvent::ServerTime(p.into()),
            Inbound::ServerState(v) => ProtocolEvent::ServerState(v),
            Inbound::ServerCommand(v) => ProtocolEvent::ServerCommand(v),
            Inbound::GroupUpdate(v) => ProtocolEvent::GroupUpdate(v),
            Inbound::StreamStart(cfg) => ProtocolEvent::StreamStart(cfg),
            Inbound::StreamClear => ProtocolEvent::StreamClear,
            Inbound::SyncOffset(s) => ProtocolEvent::SyncOffsetChanged(s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use self::message::{AudioCodec, MessageBuilder};

    #[test]
    fn unknown_type_is_discarded_and_counted() {
        let handler = ProtocolHandler::new();
        let result = handler.parse_text(r#"{"type":"server/unknown","payload":{}}"#);
        assert!(result.is_none());
        assert_eq!(handler.malformed_frame_count(), 1);
    }

    #[test]
    fn invalid_json_is_discarded_and_counted() {
        let handler = ProtocolHandler::new();
        assert!(handler.parse_text("not json").is_none());
        assert_eq!(handler.malformed_frame_count(), 1);
    }

    #[test]
    fn server_time_parses_into_protocol_event() {
        let handler = ProtocolHandler::new();
        let json = r#"{"type":"server/time","payload":{"t1_us":1,"t2_us":2,"t3_us":3,"t4_us":4}}"#;
        match handler.parse_text(json) {
            Some(ProtocolEvent::ServerTime(m)) => assert_eq!(m.t4_us, 4),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn stream_start_parses_codec_header_payload() {
        let handler = ProtocolHandler::new();
        let json = r#"{"type":"stream/start","payload":{"codec":"opus","sample_rate":48000,"channels":2,"bit_depth":16}}"#;
        match handler.parse_text(json) {
            Some(ProtocolEvent::StreamStart(cfg)) => assert_eq!(cfg.codec, AudioCodec::Opus),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn malformed_binary_frame_is_discarded_and_counted() {
        let handler = ProtocolHandler::new();
        assert!(handler.parse_binary(Bytes::from_static(&[1, 2])).is_none());
        assert_eq!(handler.malformed_frame_count(), 1);
    }

    #[test]
    fn audio_binary_frame_parses() {
        let handler = ProtocolHandler::new();
        let mut buf = binary::encode_header(4, 9000).to_vec();
        buf.extend_from_slice(b"pcm");
        match handler.parse_binary(Bytes::from(buf)) {
            Some(ProtocolEvent::AudioChunk { server_time_us, payload }) => {
                assert_eq!(server_time_us, 9000);
                assert_eq!(&payload[..], b"pcm");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn message_builder_output_round_trips_through_the_handler_shaped_json() {
        let outbound = MessageBuilder::client_time(555);
        let encoded = serde_json::to_string(&outbound).unwrap();
        assert!(encoded.contains("\"type\":\"client/time\""));
    }
}
