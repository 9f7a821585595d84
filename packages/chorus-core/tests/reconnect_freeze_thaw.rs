//! End-to-end reconnect scenario wiring the filter, renderer, and session
//! coordinator together against a fake, in-process transport.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chorus_core::events::NoopEventEmitter;
use chorus_core::session::TransportConnector;
use chorus_core::sink::NullSink;
use chorus_core::{
    ChorusError, ClientConfig, FilterDimension, Renderer, SessionCoordinator, SessionState,
    TimeFilter, TokioSpawner, Transport, TransportEvent,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn send_text(&self, _text: String) -> bool {
        true
    }

    async fn send_binary(&self, _bytes: Bytes) -> bool {
        true
    }

    async fn close(&self, _code: u16, _reason: String) {}
}

/// Hands back a fresh event channel on every `connect`, immediately
/// queuing an `Open` + `server/hello` pair so the coordinator reaches
/// `Ready` without a real handshake. The sender for the live connection
/// is stashed so the test can later inject a `Failure` event to force a
/// reconnect.
struct FlakyConnector {
    connect_count: AtomicUsize,
    current_tx: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
}

impl FlakyConnector {
    fn new() -> Self {
        Self {
            connect_count: AtomicUsize::new(0),
            current_tx: Mutex::new(None),
        }
    }

    fn fail_current_connection(&self) {
        let tx = self.current_tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(TransportEvent::Failure {
                recoverable: true,
                message: "simulated transport drop".to_string(),
            });
        }
    }
}

#[async_trait]
impl TransportConnector for FlakyConnector {
    async fn connect(
        &self,
        _url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::UnboundedReceiver<TransportEvent>), ChorusError> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(TransportEvent::Open);
        let hello = serde_json::json!({
            "type": "server/hello",
            "payload": { "session_id": "s1", "server_name": "kitchen" }
        });
        let _ = tx.send(TransportEvent::Text(hello.to_string()));
        *self.current_tx.lock() = Some(tx);
        Ok((Arc::new(NullTransport) as Arc<dyn Transport>, rx))
    }
}

async fn wait_until(mut check: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// E6 (spec §8): bring the filter to `is_converged` with offset ~123456us,
/// trigger a recoverable transport failure, and confirm the coordinator
/// freezes on the Reconnecting transition and thaws with the offset intact
/// and covariance inflated once the reconnect succeeds.
#[tokio::test(flavor = "multi_thread")]
async fn reconnect_freezes_then_thaws_the_filter_at_the_pre_outage_estimate() {
    let filter = Arc::new(parking_lot::Mutex::new(TimeFilter::new(FilterDimension::Two)));
    {
        let mut f = filter.lock();
        let mut t = 0i64;
        for n in [300.0, -200.0, 150.0, -100.0, 250.0, -150.0, 100.0] {
            f.add_measurement(123_456.0 + n, 2_000.0, t, 4_000.0);
            t += 500_000;
        }
        assert!(f.is_converged(), "filter should have converged before the outage");
    }
    let pre_outage_offset = filter.lock().snapshot().offset_us;
    assert!((pre_outage_offset - 123_456.0).abs() < 2_000.0);

    let renderer = Arc::new(Renderer::new(filter.clone()));
    let spawner = TokioSpawner::current();
    renderer.start(&spawner, Box::new(NullSink::default()));

    let connector = Arc::new(FlakyConnector::new());
    let config = ClientConfig::new(Uuid::nil(), "kitchen", "ws://example.invalid:8927");
    let coordinator = Arc::new(SessionCoordinator::new(
        config,
        connector.clone() as Arc<dyn TransportConnector>,
        filter.clone(),
        renderer,
        Arc::new(NoopEventEmitter),
        spawner,
    ));

    coordinator.connect();

    assert!(
        wait_until(|| coordinator.state() == SessionState::Ready, Duration::from_secs(2)).await,
        "expected the first connection to reach Ready"
    );
    assert!(!filter.lock().is_frozen());

    connector.fail_current_connection();

    assert!(
        wait_until(|| filter.lock().is_frozen(), Duration::from_secs(2)).await,
        "expected the filter to freeze on the Reconnecting transition"
    );

    assert!(
        wait_until(|| coordinator.state() == SessionState::Ready, Duration::from_secs(3)).await,
        "expected the coordinator to reconnect and reach Ready again"
    );
    assert!(!filter.lock().is_frozen(), "expected the filter to thaw once reconnected");
    assert_eq!(connector.connect_count.load(Ordering::SeqCst), 2);

    let post_reconnect = filter.lock().snapshot();
    assert!(
        (post_reconnect.offset_us - 123_456.0).abs() < 1.0 + (pre_outage_offset - 123_456.0).abs(),
        "offset estimate should survive the reconnect essentially unchanged"
    );

    coordinator.disconnect();
}
