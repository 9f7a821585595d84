//! Time-sync driver: issues client-to-server time probes in bursts and at
//! steady-state cadence, feeding every usable reply to the [`TimeFilter`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::filter::{feed_measurement, Measurement, TimeFilter};
use crate::protocol::constants::MAX_ACCEPTABLE_RTT_US;
use crate::runtime::TaskSpawner;

const BURST_PROBE_COUNT: usize = 10;
const BURST_PROBE_SPACING: Duration = Duration::from_millis(50);
const BURST_SETTLE: Duration = Duration::from_millis(100);
const STEADY_STATE_PRE_CONVERGENCE: Duration = Duration::from_millis(500);
const STEADY_STATE_POST_CONVERGENCE: Duration = Duration::from_secs(4);

pub type SharedFilter = Arc<Mutex<TimeFilter>>;

/// Sends one `client/time` probe with the given client-side timestamp. The
/// coordinator supplies an implementation backed by the transport; the
/// driver itself knows nothing about frames or sockets.
pub trait ProbeSender: Send + Sync {
    fn send_probe(&self, t1_us: i64);
}

/// Result of feeding a reply to [`TimeSyncDriver::on_server_time`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedResult {
    /// Buffered for the in-flight burst; not yet applied to the filter.
    Collected,
    /// Applied to the filter (or dropped as stale) immediately.
    Consumed,
}

struct Shared {
    filter: SharedFilter,
    sender: Arc<dyn ProbeSender>,
    burst_in_progress: Mutex<bool>,
    burst_replies: Mutex<Vec<Measurement>>,
    running: AtomicBool,
}

/// RAII guard that unconditionally clears `burst_in_progress` on drop,
/// including on panic or future cancellation, so a past bug class
/// ("permanently stuck `true` after an exception") cannot recur.
struct BurstGuard {
    shared: Arc<Shared>,
}

impl Drop for BurstGuard {
    fn drop(&mut self) {
        *self.shared.burst_in_progress.lock() = false;
    }
}

/// Generates the probes that feed the filter, alternating between a
/// connect-time burst and a steady-state cadence.
pub struct TimeSyncDriver {
    shared: Arc<Shared>,
}

impl TimeSyncDriver {
    #[must_use]
    pub fn new(filter: SharedFilter, sender: Arc<dyn ProbeSender>) -> Self {
        Self {
            shared: Arc::new(Shared {
                filter,
                sender,
                burst_in_progress: Mutex::new(false),
                burst_replies: Mutex::new(Vec::with_capacity(BURST_PROBE_COUNT)),
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Idempotent: calling `start` while already running is a no-op.
    pub fn start<S: TaskSpawner>(&self, spawner: &S) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.shared.clone();
        spawner.spawn(async move {
            cadence_loop(shared).await;
        });
    }

    /// Guarantees `burst_in_progress == false` on return, regardless of
    /// which code path triggered the stop. Safe to call from any task.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        *self.shared.burst_in_progress.lock() = false;
        self.shared.burst_replies.lock().clear();
    }

    #[must_use]
    pub fn burst_in_progress(&self) -> bool {
        *self.shared.burst_in_progress.lock()
    }

    /// Feeds one reply in from the protocol handler. During an in-flight
    /// burst the reply is buffered ([`FeedResult::Collected`]); otherwise
    /// it is applied (or dropped as stale) immediately
    /// ([`FeedResult::Consumed`]).
    pub fn on_server_time(&self, measurement: Measurement) -> FeedResult {
        if measurement.rtt_us() > MAX_ACCEPTABLE_RTT_US as f64 {
            tracing::debug!(rtt_us = measurement.rtt_us(), "dropping stale time-sync reply");
            return FeedResult::Consumed;
        }

        let mut in_progress = self.shared.burst_in_progress.lock();
        if *in_progress {
            self.shared.burst_replies.lock().push(measurement);
            return FeedResult::Collected;
        }
        drop(in_progress);
        feed_measurement(&mut self.shared.filter.lock(), &measurement);
        FeedResult::Consumed
    }
}

async fn cadence_loop(shared: Arc<Shared>) {
    run_burst(&shared).await;

    while shared.running.load(Ordering::SeqCst) {
        let converged = shared.filter.lock().is_converged();
        let interval = if converged { STEADY_STATE_POST_CONVERGENCE } else { STEADY_STATE_PRE_CONVERGENCE };
        tokio::time::sleep(interval).await;

        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        if shared.filter.lock().take_network_change() {
            run_burst(&shared).await;
            continue;
        }

        issue_probe(&shared);
    }
}

async fn run_burst(shared: &Arc<Shared>) {
    {
        let mut in_progress = shared.burst_in_progress.lock();
        if *in_progress {
            // A burst is already in flight; coalesce rather than overlap.
            return;
        }
        *in_progress = true;
    }
    let _guard = BurstGuard { shared: shared.clone() };
    shared.burst_replies.lock().clear();

    for _ in 0..BURST_PROBE_COUNT {
        if !shared.running.load(Ordering::SeqCst) {
            return;
        }
        issue_probe(shared);
        tokio::time::sleep(BURST_PROBE_SPACING).await;
    }
    tokio::time::sleep(BURST_SETTLE).await;

    let best = {
        let mut replies = shared.burst_replies.lock();
        let best = replies
            .iter()
            .copied()
            .min_by(|a, b| a.rtt_us().partial_cmp(&b.rtt_us()).unwrap());
        replies.clear();
        best
    };

    if let Some(measurement) = best {
        feed_measurement(&mut shared.filter.lock(), &measurement);
    }
}

fn issue_probe(shared: &Arc<Shared>) {
    let t1_us = crate::clock::now_client_us();
    shared.sender.send_probe(t1_us);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::FilterDimension;
    use std::sync::atomic::AtomicUsize;

    struct CountingSender {
        count: AtomicUsize,
    }

    impl ProbeSender for CountingSender {
        fn send_probe(&self, _t1_us: i64) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn measurement_with_rtt(rtt_us: i64) -> Measurement {
        Measurement { t1_us: 0, t2_us: rtt_us / 2, t3_us: rtt_us / 2, t4_us: rtt_us }
    }

    #[test]
    fn stale_reply_is_dropped_not_fed() {
        let filter = Arc::new(Mutex::new(TimeFilter::new(FilterDimension::Two)));
        let sender = Arc::new(CountingSender { count: AtomicUsize::new(0) });
        let driver = TimeSyncDriver::new(filter.clone(), sender);

        let stale = measurement_with_rtt(MAX_ACCEPTABLE_RTT_US + 1);
        let result = driver.on_server_time(stale);
        assert_eq!(result, FeedResult::Consumed);
        assert_eq!(filter.lock().snapshot().measurement_count, 0);
    }

    #[test]
    fn reply_outside_burst_is_applied_immediately() {
        let filter = Arc::new(Mutex::new(TimeFilter::new(FilterDimension::Two)));
        let sender = Arc::new(CountingSender { count: AtomicUsize::new(0) });
        let driver = TimeSyncDriver::new(filter.clone(), sender);

        let result = driver.on_server_time(measurement_with_rtt(2_000));
        assert_eq!(result, FeedResult::Consumed);
        assert_eq!(filter.lock().snapshot().measurement_count, 1);
    }

    #[test]
    fn stop_clears_burst_in_progress_even_if_never_started() {
        let filter = Arc::new(Mutex::new(TimeFilter::new(FilterDimension::Two)));
        let sender = Arc::new(CountingSender { count: AtomicUsize::new(0) });
        let driver = TimeSyncDriver::new(filter, sender);
        driver.stop();
        assert!(!driver.burst_in_progress());
    }

    #[tokio::test]
    async fn burst_guard_clears_flag_on_drop() {
        let filter = Arc::new(Mutex::new(TimeFilter::new(FilterDimension::Two)));
        let sender = Arc::new(CountingSender { count: AtomicUsize::new(0) });
        let driver = TimeSyncDriver::new(filter, sender);
        {
            *driver.shared.burst_in_progress.lock() = true;
            let _guard = BurstGuard { shared: driver.shared.clone() };
        }
        assert!(!driver.burst_in_progress());
    }
}
