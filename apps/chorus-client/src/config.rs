//! Client configuration.
//!
//! Supports loading from a YAML file with environment variable overrides.

use std::path::Path;

use anyhow::{Context, Result};
use chorus_core::{BufferCapacityTier, ClientConfig, PreferredCodec};
use serde::Deserialize;
use uuid::Uuid;

/// Client configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Server URL, e.g. `ws://speaker.local:8927` or `http://` (rewritten).
    /// Override: `CHORUS_SERVER_URL`
    pub server_url: String,

    /// Stable player identity. Generated and never persisted if absent;
    /// a real deployment should pin this so the server recognizes the
    /// device across restarts.
    /// Override: `CHORUS_PLAYER_ID`
    pub player_id: Option<Uuid>,

    /// Friendly name shown in the host's group UI.
    /// Override: `CHORUS_DEVICE_NAME`
    pub device_name: String,

    /// Preferred codec: one of `pcm`, `flac`, `opus`.
    /// Override: `CHORUS_PREFERRED_CODEC`
    pub preferred_codec: String,

    /// Per-speaker playback delay in milliseconds, clamped to
    /// `[-5000, 5000]` by `ClientConfig::with_static_delay_ms`.
    /// Override: `CHORUS_STATIC_DELAY_MS`
    pub static_delay_ms: i32,

    /// Use the low-memory (~8MB) buffer tier instead of the normal
    /// (~32MB) tier.
    /// Override: `CHORUS_LOW_MEMORY`
    pub low_memory: bool,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8927".to_string(),
            player_id: None,
            device_name: "chorus-client".to_string(),
            preferred_codec: "opus".to_string(),
            static_delay_ms: 0,
            low_memory: false,
        }
    }
}

impl FileConfig {
    /// Loads configuration from a YAML file, then applies environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CHORUS_SERVER_URL") {
            self.server_url = val;
        }
        if let Ok(val) = std::env::var("CHORUS_PLAYER_ID") {
            if let Ok(id) = val.parse() {
                self.player_id = Some(id);
            }
        }
        if let Ok(val) = std::env::var("CHORUS_DEVICE_NAME") {
            self.device_name = val;
        }
        if let Ok(val) = std::env::var("CHORUS_PREFERRED_CODEC") {
            self.preferred_codec = val;
        }
        if let Ok(val) = std::env::var("CHORUS_STATIC_DELAY_MS") {
            if let Ok(ms) = val.parse() {
                self.static_delay_ms = ms;
            }
        }
        if let Ok(val) = std::env::var("CHORUS_LOW_MEMORY") {
            self.low_memory = val == "1" || val.eq_ignore_ascii_case("true");
        }
    }

    /// Converts to `chorus-core`'s `ClientConfig`, resolving a fresh player
    /// ID if none was configured.
    pub fn to_client_config(&self) -> Result<ClientConfig> {
        let preferred_codec = match self.preferred_codec.to_ascii_lowercase().as_str() {
            "pcm" => PreferredCodec::Pcm,
            "flac" => PreferredCodec::Flac,
            "opus" => PreferredCodec::Opus,
            other => anyhow::bail!("unknown preferred_codec '{other}', expected pcm|flac|opus"),
        };
        let player_id = self.player_id.unwrap_or_else(Uuid::new_v4);

        let mut config = ClientConfig::new(player_id, self.device_name.clone(), self.server_url.clone())
            .with_static_delay_ms(self.static_delay_ms);
        config.preferred_codec = preferred_codec;
        config.buffer_capacity = if self.low_memory {
            BufferCapacityTier::LowMemory
        } else {
            BufferCapacityTier::Normal
        };
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds_a_valid_client_config() {
        let file_config = FileConfig::default();
        let config = file_config.to_client_config().unwrap();
        assert_eq!(config.server_url, "ws://localhost:8927");
    }

    #[test]
    fn unknown_preferred_codec_is_rejected() {
        let mut file_config = FileConfig::default();
        file_config.preferred_codec = "mp3".to_string();
        assert!(file_config.to_client_config().is_err());
    }
}
