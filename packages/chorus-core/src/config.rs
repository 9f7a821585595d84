//! Host-injected configuration. The core persists nothing itself; every
//! knob here is supplied by the embedding application (a CLI flag, a YAML
//! file, a mobile app's settings store) and plumbed straight into the
//! constructors that need it, replacing the source's global singletons.

use uuid::Uuid;

use crate::protocol::message::AudioCodec;

/// Preferred codec ordering anchor: the advertised `supported_formats`
/// list is built starting from this codec, per the wire protocol's
/// "server picks the first format it can produce" contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferredCodec {
    Pcm,
    Flac,
    Opus,
}

impl From<PreferredCodec> for AudioCodec {
    fn from(p: PreferredCodec) -> Self {
        match p {
            PreferredCodec::Pcm => AudioCodec::Pcm,
            PreferredCodec::Flac => AudioCodec::Flac,
            PreferredCodec::Opus => AudioCodec::Opus,
        }
    }
}

/// Buffer capacity tier for the renderer/sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferCapacityTier {
    /// ~32 MB, the default for a desktop/server host.
    Normal,
    /// ~8 MB, for memory-constrained embedded hosts.
    LowMemory,
}

impl BufferCapacityTier {
    #[must_use]
    pub fn bytes(self) -> usize {
        match self {
            Self::Normal => 32 * 1024 * 1024,
            Self::LowMemory => 8 * 1024 * 1024,
        }
    }
}

/// Configuration consumed by the core, enumerated in full. Nothing here
/// is read from disk or environment by the core itself; the binary crate
/// owns that layer (see `apps/chorus-client/src/config.rs`).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub preferred_codec: PreferredCodec,
    pub player_id: Uuid,
    pub device_name: String,
    /// Clamped to `[-5_000, 5_000]` on construction.
    pub static_delay_ms: i32,
    pub buffer_capacity: BufferCapacityTier,
    /// Server endpoint; `http(s)` is rewritten to `ws(s)` by
    /// `protocol::constants::rewrite_scheme` before connecting.
    pub server_url: String,
}

impl ClientConfig {
    #[must_use]
    pub fn new(player_id: Uuid, device_name: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            preferred_codec: PreferredCodec::Opus,
            player_id,
            device_name: device_name.into(),
            static_delay_ms: 0,
            buffer_capacity: BufferCapacityTier::Normal,
            server_url: server_url.into(),
        }
    }

    #[must_use]
    pub fn with_static_delay_ms(mut self, delay_ms: i32) -> Self {
        self.static_delay_ms = delay_ms.clamp(-5_000, 5_000);
        self
    }

    #[must_use]
    pub fn static_delay_us(&self) -> i64 {
        i64::from(self.static_delay_ms) * 1_000
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_delay_is_clamped_to_five_seconds_either_way() {
        let cfg = ClientConfig::new(Uuid::nil(), "kitchen", "ws://host:8927")
            .with_static_delay_ms(10_000);
        assert_eq!(cfg.static_delay_ms, 5_000);

        let cfg = ClientConfig::new(Uuid::nil(), "kitchen", "ws://host:8927")
            .with_static_delay_ms(-10_000);
        assert_eq!(cfg.static_delay_ms, -5_000);
    }

    #[test]
    fn buffer_capacity_tiers_match_spec_sizes() {
        assert_eq!(BufferCapacityTier::Normal.bytes(), 32 * 1024 * 1024);
        assert_eq!(BufferCapacityTier::LowMemory.bytes(), 8 * 1024 * 1024);
    }
}
