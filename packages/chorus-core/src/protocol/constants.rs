//! Fixed protocol constants. Nothing in this module should ever need to
//! change without a protocol version bump; kept separate from `message.rs`
//! so a reviewer can see the wire contract's load-bearing numbers at a
//! glance.

/// Default WebSocket endpoint path.
pub const DEFAULT_PATH: &str = "/sendspin";

/// Default port when none is specified in the configured URL.
pub const DEFAULT_PORT: u16 = 8927;

/// Protocol version advertised in `client/hello`.
pub const PROTOCOL_VERSION: u32 = 1;

/// Binary frame tag: compressed or raw PCM audio chunk.
pub const TAG_AUDIO: u8 = 4;

/// Binary frame tags: artwork channels 0..=3.
pub const TAG_ARTWORK_RANGE: std::ops::RangeInclusive<u8> = 8..=11;

/// Binary frame tag: visualizer data.
pub const TAG_VISUALIZER: u8 = 16;

/// Binary frame header size in bytes: 1 tag byte + 8 timestamp bytes.
pub const BINARY_HEADER_LEN: usize = 9;

/// Probes/measurements older than this are considered stale and dropped.
pub const MAX_ACCEPTABLE_RTT_US: i64 = 10_000_000;

/// Default advertised sample rate.
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

/// Default advertised channel count.
pub const DEFAULT_CHANNELS: u16 = 2;

/// Default advertised bit depth.
pub const DEFAULT_BIT_DEPTH: u16 = 16;

/// Rewrites an `http(s)` scheme to its `ws(s)` equivalent; leaves any other
/// scheme (including one that is already `ws`/`wss`) untouched.
#[must_use]
pub fn rewrite_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_http_and_https() {
        assert_eq!(rewrite_scheme("http://speaker.local:8927"), "ws://speaker.local:8927");
        assert_eq!(rewrite_scheme("https://speaker.local:8927"), "wss://speaker.local:8927");
    }

    #[test]
    fn leaves_ws_schemes_untouched() {
        assert_eq!(rewrite_scheme("ws://speaker.local:8927"), "ws://speaker.local:8927");
        assert_eq!(rewrite_scheme("wss://speaker.local:8927"), "wss://speaker.local:8927");
    }
}
