//! Centralized error types for the Chorus core library.
//!
//! A kind per failure mode rather than a bag of strings, so the session
//! coordinator can pattern match on recoverability instead of parsing
//! messages.

use thiserror::Error;

/// Trait for error types that provide a machine-readable error code.
///
/// Useful for logging and for any diagnostics surface a host wants to build
/// on top of [`ChorusError`] without matching on the full enum.
pub trait ErrorCode {
    /// Returns a machine-readable error code.
    fn code(&self) -> &'static str;
}

/// Application-wide error type for the Chorus client core.
#[derive(Debug, Error)]
pub enum ChorusError {
    /// A binary or text frame failed to parse (unknown tag, short header,
    /// JSON parse failure). Never propagated past the protocol handler;
    /// logged and counted.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Peer sent an unexpected message for the current session state
    /// (e.g. a second `server/hello`). Drives a non-1000 close.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The transport failed. `recoverable` drives whether the session
    /// coordinator attempts to reconnect or gives up.
    #[error("transport failure (recoverable={recoverable}): {message}")]
    TransportFailure { recoverable: bool, message: String },

    /// Authentication failed. Always non-recoverable; raised only by
    /// external collaborators (the transport, typically).
    #[error("authentication failed: {0}")]
    AuthError(String),

    /// An in-flight operation exceeded its deadline. The caller is
    /// responsible for removing any pending-request bookkeeping before
    /// this propagates.
    #[error("timeout exceeded: {0}")]
    TimeoutExceeded(String),

    /// The time filter is not yet ready to convert timestamps. Surfaced as
    /// a soft condition: producing callers (the renderer's `enqueue`) drop
    /// the work silently rather than treating this as an error path.
    #[error("time filter not ready")]
    FilterNotReady,

    /// The output sink rejected a configuration or write.
    #[error("output sink error: {0}")]
    Sink(String),

    /// The codec failed to decode a compressed payload after exhausting
    /// its retry budget under back-pressure.
    #[error("codec error: {0}")]
    Codec(String),

    /// An I/O error from the ambient stack (file config loading, etc).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorCode for ChorusError {
    fn code(&self) -> &'static str {
        match self {
            Self::MalformedFrame(_) => "malformed_frame",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::TransportFailure { .. } => "transport_failure",
            Self::AuthError(_) => "auth_error",
            Self::TimeoutExceeded(_) => "timeout_exceeded",
            Self::FilterNotReady => "filter_not_ready",
            Self::Sink(_) => "sink_error",
            Self::Codec(_) => "codec_error",
            Self::Io(_) => "io_error",
        }
    }
}

impl ChorusError {
    /// Whether the session coordinator should attempt a reconnect after
    /// this error. Non-recoverable errors (auth, protocol violations) move
    /// straight to `Failed`.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::TransportFailure { recoverable, .. } => *recoverable,
            Self::AuthError(_) | Self::ProtocolViolation(_) => false,
            Self::MalformedFrame(_)
            | Self::TimeoutExceeded(_)
            | Self::FilterNotReady
            | Self::Sink(_)
            | Self::Codec(_)
            | Self::Io(_) => true,
        }
    }
}

/// Classifies a transport-layer error message into a recoverable or
/// non-recoverable [`ChorusError::TransportFailure`].
///
/// Shared between the initial connect path and the reconnect path so the
/// classification never diverges between the two call sites.
#[must_use]
pub fn classify_transport_error(message: &str) -> ChorusError {
    let lower = message.to_ascii_lowercase();

    const NON_RECOVERABLE: &[&str] = &[
        "unknown host",
        "tls handshake",
        "401",
        "403",
        "refused",
    ];
    const RECOVERABLE: &[&str] = &[
        "socket error",
        "eof",
        "timeout",
        "timed out",
        "reset",
        "abort",
        "broken pipe",
    ];

    if NON_RECOVERABLE.iter().any(|needle| lower.contains(needle)) {
        return ChorusError::TransportFailure {
            recoverable: false,
            message: message.to_string(),
        };
    }

    let recoverable = RECOVERABLE.iter().any(|needle| lower.contains(needle));
    ChorusError::TransportFailure {
        recoverable,
        message: message.to_string(),
    }
}

pub type ChorusResult<T> = Result<T, ChorusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_recoverable_strings() {
        for msg in ["connection reset by peer", "read timed out", "broken pipe", "EOF"] {
            let err = classify_transport_error(msg);
            assert!(err.is_recoverable(), "{msg} should be recoverable");
        }
    }

    #[test]
    fn classifies_known_non_recoverable_strings() {
        for msg in ["unknown host example.com", "TLS handshake failure", "HTTP 401 Unauthorized"] {
            let err = classify_transport_error(msg);
            assert!(!err.is_recoverable(), "{msg} should not be recoverable");
        }
    }

    #[test]
    fn unrecognized_message_defaults_non_recoverable() {
        let err = classify_transport_error("some unfamiliar failure");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn auth_and_protocol_violation_never_recoverable() {
        assert!(!ChorusError::AuthError("bad token".into()).is_recoverable());
        assert!(!ChorusError::ProtocolViolation("duplicate hello".into()).is_recoverable());
    }
}
