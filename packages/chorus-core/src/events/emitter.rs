//! Event emitter abstraction for decoupling the session coordinator from
//! whatever transport the host uses to surface notifications (a channel to
//! a UI thread, a log line, a test probe).

use super::SessionEvent;

/// Trait for emitting [`SessionEvent`]s without knowledge of how the host
/// delivers them onward.
pub trait EventEmitter: Send + Sync {
    /// Emits a session lifecycle event.
    fn emit(&self, event: SessionEvent);
}

/// No-op emitter, useful in tests that only care about renderer/filter
/// state and not about the notification stream.
pub struct NoopEventEmitter;

impl EventEmitter for NoopEventEmitter {
    fn emit(&self, _event: SessionEvent) {}
}

/// Logging emitter: logs every event at info level. Useful as the default
/// for a headless client binary with no richer UI to notify.
pub struct LoggingEventEmitter;

impl EventEmitter for LoggingEventEmitter {
    fn emit(&self, event: SessionEvent) {
        match &event {
            SessionEvent::Error(message) => tracing::error!(%message, "session_event"),
            _ => tracing::info!(?event, "session_event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingEventEmitter {
        count: AtomicUsize,
    }

    impl EventEmitter for CountingEventEmitter {
        fn emit(&self, _event: SessionEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn counting_emitter_tracks_events() {
        let emitter = Arc::new(CountingEventEmitter {
            count: AtomicUsize::new(0),
        });

        emitter.emit(SessionEvent::Connected);
        emitter.emit(SessionEvent::Disconnected);

        assert_eq!(emitter.count.load(Ordering::SeqCst), 2);
    }
}
