//! JSON message shapes for the text half of the wire protocol.
//!
//! Inbound and outbound messages are each a `#[serde(tag = "type", content =
//! "payload")]` enum. Unknown `type` values fail to deserialize into either
//! enum and are handled by the caller (`ProtocolHandler`) as a
//! log-and-discard, not a hard error.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::filter::Measurement;

/// One of the three codecs this client can advertise or receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioCodec {
    Pcm,
    Flac,
    Opus,
}

/// One advertised or negotiated audio format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

/// `player_support` object nested in `client/hello`. `supported_formats`
/// is taken as given and never re-sorted: ordering is the protocol
/// contract that lets the server pick the first format it can produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerSupport {
    pub supported_formats: Vec<AudioFormat>,
}

/// Outbound `client/hello` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHelloPayload {
    pub client_id: Uuid,
    pub name: String,
    pub protocol_version: u32,
    pub supported_roles: Vec<String>,
    pub device_info: serde_json::Value,
    pub player_support: PlayerSupport,
}

/// Outbound `client/time` payload: a single probe timestamp.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClientTimePayload {
    pub t1_us: i64,
}

/// Outbound `client/goodbye` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientGoodbyePayload {
    pub reason: Option<String>,
}

/// Inbound `server/hello` payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerHelloPayload {
    pub session_id: String,
    pub server_name: String,
}

/// Inbound `server/time` payload: the four round-trip timestamps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ServerTimePayload {
    pub t1_us: i64,
    pub t2_us: i64,
    pub t3_us: i64,
    pub t4_us: i64,
}

impl From<ServerTimePayload> for Measurement {
    fn from(p: ServerTimePayload) -> Self {
        Measurement {
            t1_us: p.t1_us,
            t2_us: p.t2_us,
            t3_us: p.t3_us,
            t4_us: p.t4_us,
        }
    }
}

/// Inbound `stream/start` payload. `codec_header` travels as base64 text
/// on the wire (JSON has no binary type) and is decoded by
/// [`StreamConfigPayload::decode_header`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfigPayload {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    #[serde(default)]
    pub codec_header: Option<String>,
}

impl StreamConfigPayload {
    /// Decodes the base64 `codec_header`, if present. A malformed base64
    /// string is treated like any other malformed-frame condition: logged
    /// and discarded, never propagated as a hard error.
    #[must_use]
    pub fn decode_header(&self) -> Option<bytes::Bytes> {
        use base64::Engine as _;
        let raw = self.codec_header.as_ref()?;
        match base64::engine::general_purpose::STANDARD.decode(raw) {
            Ok(bytes) => Some(bytes::Bytes::from(bytes)),
            Err(error) => {
                tracing::warn!(%error, "malformed codec_header base64, ignoring");
                None
            }
        }
    }
}

/// Inbound `client/sync_offset` echo, or a live update pushed by the host.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SyncOffsetChanged {
    pub static_delay_ms: i32,
}

/// Messages the peer may send us.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Inbound {
    #[serde(rename = "server/hello")]
    ServerHello(ServerHelloPayload),
    #[serde(rename = "server/time")]
    ServerTime(ServerTimePayload),
    #[serde(rename = "server/state")]
    ServerState(serde_json::Value),
    #[serde(rename = "server/command")]
    ServerCommand(serde_json::Value),
    #[serde(rename = "group/update")]
    GroupUpdate(serde_json::Value),
    #[serde(rename = "stream/start")]
    StreamStart(StreamConfigPayload),
    #[serde(rename = "stream/clear")]
    StreamClear,
    #[serde(rename = "client/sync_offset")]
    SyncOffset(SyncOffsetChanged),
}

/// Messages we may send the peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Outbound {
    #[serde(rename = "client/hello")]
    ClientHello(ClientHelloPayload),
    #[serde(rename = "client/time")]
    ClientTime(ClientTimePayload),
    #[serde(rename = "client/state")]
    ClientState(serde_json::Value),
    #[serde(rename = "client/command")]
    ClientCommand(serde_json::Value),
    #[serde(rename = "client/goodbye")]
    ClientGoodbye(ClientGoodbyePayload),
}

/// Builds outbound messages, holding nothing of its own beyond the inputs
/// the caller supplies. Kept separate from the enum constructors so the
/// `supported_formats` ordering contract has exactly one call site to
/// audit.
pub struct MessageBuilder;

impl MessageBuilder {
    /// `supported_formats` is taken verbatim and never reordered.
    #[must_use]
    pub fn client_hello(
        client_id: Uuid,
        name: impl Into<String>,
        supported_roles: Vec<String>,
        device_info: serde_json::Value,
        supported_formats: Vec<AudioFormat>,
    ) -> Outbound {
        Outbound::ClientHello(ClientHelloPayload {
            client_id,
            name: name.into(),
            protocol_version: super::constants::PROTOCOL_VERSION,
            supported_roles,
            device_info,
            player_support: PlayerSupport { supported_formats },
        })
    }

    #[must_use]
    pub fn client_time(t1_us: i64) -> Outbound {
        Outbound::ClientTime(ClientTimePayload { t1_us })
    }

    #[must_use]
    pub fn client_state(state: serde_json::Value) -> Outbound {
        Outbound::ClientState(state)
    }

    #[must_use]
    pub fn client_command(command: serde_json::Value) -> Outbound {
        Outbound::ClientCommand(command)
    }

    #[must_use]
    pub fn client_goodbye(reason: Option<String>) -> Outbound {
        Outbound::ClientGoodbye(ClientGoodbyePayload { reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_round_trips_supported_formats_order() {
        let formats = vec![
            AudioFormat { codec: AudioCodec::Opus, sample_rate: 48_000, channels: 2, bit_depth: 16 },
            AudioFormat { codec: AudioCodec::Flac, sample_rate: 48_000, channels: 2, bit_depth: 16 },
            AudioFormat { codec: AudioCodec::Pcm, sample_rate: 48_000, channels: 1, bit_depth: 16 },
        ];
        let msg = MessageBuilder::client_hello(
            Uuid::nil(),
            "kitchen",
            vec!["player".to_string()],
            serde_json::json!({ "model": "test" }),
            formats.clone(),
        );

        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: Outbound = serde_json::from_str(&encoded).unwrap();
        match decoded {
            Outbound::ClientHello(payload) => {
                let codecs: Vec<AudioCodec> =
                    payload.player_support.supported_formats.iter().map(|f| f.codec).collect();
                assert_eq!(codecs, vec![AudioCodec::Opus, AudioCodec::Flac, AudioCodec::Pcm]);
            }
            _ => panic!("expected ClientHello"),
        }
    }

    #[test]
    fn inbound_server_time_parses_into_measurement() {
        let json = r#"{"type":"server/time","payload":{"t1_us":1,"t2_us":2,"t3_us":3,"t4_us":4}}"#;
        let parsed: Inbound = serde_json::from_str(json).unwrap();
        match parsed {
            Inbound::ServerTime(payload) => {
                let m: Measurement = payload.into();
                assert_eq!(m.t1_us, 1);
                assert_eq!(m.t4_us, 4);
            }
            _ => panic!("expected ServerTime"),
        }
    }

    #[test]
    fn unknown_inbound_type_fails_to_deserialize() {
        let json = r#"{"type":"server/unknown","payload":{}}"#;
        let parsed: Result<Inbound, _> = serde_json::from_str(json);
        assert!(parsed.is_err());
    }

    #[test]
    fn stream_start_decodes_base64_header() {
        use base64::Engine as _;
        let header_bytes = b"opus-header-bytes";
        let encoded_header = base64::engine::general_purpose::STANDARD.encode(header_bytes);
        let payload = StreamConfigPayload {
            codec: AudioCodec::Opus,
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
            codec_header: Some(encoded_header),
        };
        let decoded = payload.decode_header().unwrap();
        assert_eq!(decoded.as_ref(), header_bytes);
    }

    #[test]
    fn stream_start_with_malformed_header_returns_none_not_error() {
        let payload = StreamConfigPayload {
            codec: AudioCodec::Pcm,
            sample_rate: 48_000,
            channels: 2,
            bit_depth: 16,
            codec_header: Some("not valid base64 !!!".to_string()),
        };
        assert!(payload.decode_header().is_none());
    }
}
