//! Kalman time filter: estimates the offset (and, at higher dimensions,
//! drift / drift-acceleration / RTT baseline) between the client and
//! server monotonic clocks from a stream of round-trip measurements.
//!
//! Initialization branches, outlier gate, predict, innovation, adaptive
//! forgetting, update, and adaptive process noise all run in that order
//! on every accepted measurement. Matrix operations use plain
//! `Vec<f64>`/`Vec<Vec<f64>>` sized to the active dimension rather than a
//! linear-algebra crate: the problem is bounded at 4x4, too small to
//! justify a `nalgebra`/`ndarray` dependency.

use std::collections::VecDeque;
use std::time::Duration;

/// Drift is clamped to +/-500ppm after every update.
const DRIFT_CLAMP: f64 = 5.0e-4;

/// Constant decay applied to the acceleration term's state-transition
/// coefficient in 3-D and 4-D mode.
const ACCEL_DECAY: f64 = 0.92;

/// Constant decay applied to the RTT baseline's covariance growth in 4-D
/// mode (a slow random walk, not a fast-moving quantity).
const RTT_DECAY: f64 = 0.98;

/// Base adaptive process noise for the offset term, in microseconds^2/s.
const Q_OFFSET_BASE: f64 = 100.0;

/// Capacity of the recent-accepted-offsets ring used for outlier gating.
const RECENT_OFFSETS_CAPACITY: usize = 10;

/// Capacity of the squared-normalized-innovation ring used for adaptive Q.
const INNOVATIONS_CAPACITY: usize = 20;

/// Number of accepted measurements before the outlier gate starts firing.
const OUTLIER_GATE_WARMUP_MEASUREMENTS: u64 = 5;

/// Consecutive rejections that force acceptance of the next measurement,
/// so a genuine step change isn't gated out forever.
const FORCE_ACCEPT_AFTER_REJECTIONS: u32 = 2;

/// Measurement count threshold for the warmup phase to end (also requires
/// covariance to have settled below [`WARMUP_P_THRESHOLD_US`]).
const WARMUP_MEASUREMENT_THRESHOLD: u64 = 20;
const WARMUP_P_THRESHOLD_US: f64 = 15_000.0;
/// Warmup is forced to end regardless of covariance once this many
/// measurements have been accepted.
const WARMUP_FORCED_EXIT_MEASUREMENTS: u64 = 100;

/// Convergence threshold: measurement count and sqrt(P[0,0]).
const CONVERGED_MEASUREMENT_THRESHOLD: u64 = 5;
const CONVERGED_P_THRESHOLD_US: f64 = 10_000.0;

/// `is_ready` requires at least this many accepted measurements.
const READY_MEASUREMENT_THRESHOLD: u64 = 4;

/// Adaptive-forgetting inflation factor (applied as lambda^2 to P).
const FORGETTING_LAMBDA: f64 = 1.001;

/// How many standard deviations of `max_error` trigger adaptive forgetting.
const FORGETTING_TRIGGER_SIGMAS: f64 = 0.75;

/// Filter state width. Each tier is a strict superset of the previous one's
/// state vector, so widening preserves the offset/drift estimates already
/// converged on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDimension {
    /// {offset, drift}
    Two,
    /// {offset, drift, acceleration}
    Three,
    /// {offset, drift, acceleration, expected_rtt}
    Four,
}

impl FilterDimension {
    fn size(self) -> usize {
        match self {
            Self::Two => 2,
            Self::Three => 3,
            Self::Four => 4,
        }
    }
}

/// Result of [`TimeFilter::add_measurement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    Accepted,
    Rejected,
}

/// One client-server round-trip measurement, produced by the protocol
/// handler from a `server/time` reply and consumed exactly once by the
/// time-sync driver.
#[derive(Debug, Clone, Copy)]
pub struct Measurement {
    pub t1_us: i64,
    pub t2_us: i64,
    pub t3_us: i64,
    pub t4_us: i64,
}

impl Measurement {
    /// `offset = ((T2-T1) + (T3-T4)) / 2`
    #[must_use]
    pub fn offset_us(&self) -> f64 {
        (((self.t2_us - self.t1_us) + (self.t3_us - self.t4_us)) as f64) / 2.0
    }

    /// `rtt = (T4-T1) - (T3-T2)`
    #[must_use]
    pub fn rtt_us(&self) -> f64 {
        ((self.t4_us - self.t1_us) - (self.t3_us - self.t2_us)) as f64
    }

    /// `max_error ~= rtt/2`, floored at 1.
    #[must_use]
    pub fn max_error_us(&self) -> f64 {
        (self.rtt_us() / 2.0).max(1.0)
    }
}

/// Immutable readout of the filter's current estimate, safe to publish
/// across a task boundary without exposing the mutable internals.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterSnapshot {
    pub offset_us: f64,
    pub drift_ppm: f64,
    pub measurement_count: u64,
    pub is_ready: bool,
    pub is_converged: bool,
}

#[derive(Clone)]
struct FrozenSnapshot {
    state: Vec<f64>,
    p: Vec<Vec<f64>>,
    measurement_count: u64,
    last_update_time_us: Option<i64>,
}

/// The Kalman time filter.
pub struct TimeFilter {
    dim: FilterDimension,
    /// [offset_us, drift, acceleration?, expected_rtt_us?]
    state: Vec<f64>,
    p: Vec<Vec<f64>>,
    measurement_count: u64,
    last_update_time_us: Option<i64>,
    recent_offsets: VecDeque<f64>,
    innovations: VecDeque<f64>,
    adaptive_q_offset: f64,
    consecutive_rejections: u32,
    frozen: Option<FrozenSnapshot>,
    static_delay_us: i64,
    /// Whether `server_to_client` should fold in the drift estimate.
    /// Defaults to `false`; see DESIGN.md for the rationale.
    apply_drift_in_conversion: bool,
    converged_emitted: bool,
    ready_emitted: bool,
    /// Set by [`Self::update_rtt_baseline`] when the observed RTT jumps
    /// past the network-change threshold; polled and cleared by the
    /// time-sync driver, which reacts by issuing a fresh burst.
    network_change: std::sync::atomic::AtomicBool,
}

impl TimeFilter {
    /// Creates a new filter at the given dimension with no measurements.
    #[must_use]
    pub fn new(dim: FilterDimension) -> Self {
        let size = dim.size();
        Self {
            dim,
            state: vec![0.0; size],
            p: vec![vec![0.0; size]; size],
            measurement_count: 0,
            last_update_time_us: None,
            recent_offsets: VecDeque::with_capacity(RECENT_OFFSETS_CAPACITY),
            innovations: VecDeque::with_capacity(INNOVATIONS_CAPACITY),
            adaptive_q_offset: Q_OFFSET_BASE,
            consecutive_rejections: 0,
            frozen: None,
            static_delay_us: 0,
            apply_drift_in_conversion: false,
            converged_emitted: false,
            ready_emitted: false,
            network_change: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Returns whether a network change was flagged since the last call,
    /// clearing the flag. The time-sync driver polls this each cadence
    /// tick to decide whether to issue a fresh burst.
    pub fn take_network_change(&self) -> bool {
        self.network_change.swap(false, std::sync::atomic::Ordering::Relaxed)
    }

    /// Sets the additive per-speaker playback delay applied in
    /// [`Self::server_to_client`].
    pub fn set_static_delay_us(&mut self, delay_us: i64) {
        self.static_delay_us = delay_us;
    }

    #[must_use]
    pub fn static_delay_us(&self) -> i64 {
        self.static_delay_us
    }

    /// `measurement_count >= 4 && P finite`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.measurement_count >= READY_MEASUREMENT_THRESHOLD && self.p_is_finite()
    }

    /// `measurement_count >= 5 && sqrt(P[0,0]) < 10_000us`.
    #[must_use]
    pub fn is_converged(&self) -> bool {
        self.measurement_count >= CONVERGED_MEASUREMENT_THRESHOLD
            && self.p[0][0].sqrt() < CONVERGED_P_THRESHOLD_US
    }

    fn is_warmup(&self) -> bool {
        if self.measurement_count >= WARMUP_FORCED_EXIT_MEASUREMENTS {
            return false;
        }
        !(self.measurement_count >= WARMUP_MEASUREMENT_THRESHOLD
            && self.p[0][0].sqrt() < WARMUP_P_THRESHOLD_US)
    }

    fn p_is_finite(&self) -> bool {
        self.p.iter().flatten().all(|v| v.is_finite()) && self.state.iter().all(|v| v.is_finite())
    }

    /// Pure conversion: `server_time - round(offset) + static_delay`.
    /// Drift is deliberately not applied (see DESIGN.md); applying it here
    /// was found to create an oscillating feedback loop against the
    /// renderer's own rate-adjust tier.
    #[must_use]
    pub fn server_to_client(&self, server_time_us: i64) -> i64 {
        let mut offset = self.state[0];
        if self.apply_drift_in_conversion && self.dim.size() > 1 {
            if let Some(last) = self.last_update_time_us {
                let dt = (server_time_us - last) as f64 / 1_000_000.0;
                offset += self.state[1] * dt;
            }
        }
        server_time_us - offset.round() as i64 + self.static_delay_us
    }

    /// Inverse of [`Self::server_to_client`].
    #[must_use]
    pub fn client_to_server(&self, client_time_us: i64) -> i64 {
        client_time_us + self.state[0].round() as i64 - self.static_delay_us
    }

    /// Snapshot of the current estimate, safe to hand across a task
    /// boundary.
    #[must_use]
    pub fn snapshot(&self) -> FilterSnapshot {
        FilterSnapshot {
            offset_us: self.state[0],
            drift_ppm: self.state.get(1).copied().unwrap_or(0.0) * 1.0e6,
            measurement_count: self.measurement_count,
            is_ready: self.is_ready(),
            is_converged: self.is_converged(),
        }
    }

    /// Widens or narrows the state vector, preserving the current
    /// offset/drift estimates and reinitializing covariance to a high
    /// uncertainty for any newly-added dimensions.
    pub fn set_dimension(&mut self, dim: FilterDimension) {
        let new_size = dim.size();
        let mut new_state = vec![0.0; new_size];
        let mut new_p = vec![vec![0.0; new_size]; new_size];

        let shared = new_size.min(self.state.len());
        new_state[..shared].copy_from_slice(&self.state[..shared]);
        for i in 0..shared {
            for j in 0..shared {
                new_p[i][j] = self.p[i][j];
            }
        }
        for i in shared..new_size {
            new_p[i][i] = 1.0e8;
        }

        self.dim = dim;
        self.state = new_state;
        self.p = new_p;
    }

    /// Snapshots the current state for later restoration across a
    /// reconnect. Requires [`Self::is_ready`]. Returns whether the freeze
    /// was taken.
    pub fn freeze(&mut self) -> bool {
        if !self.is_ready() {
            return false;
        }
        self.frozen = Some(FrozenSnapshot {
            state: self.state.clone(),
            p: self.p.clone(),
            measurement_count: self.measurement_count,
            last_update_time_us: self.last_update_time_us,
        });
        true
    }

    /// Restores the frozen snapshot, inflating covariance (x10 diagonal,
    /// x3 off-diagonal) to permit rapid re-convergence after the outage.
    pub fn thaw(&mut self) {
        let Some(frozen) = self.frozen.take() else {
            return;
        };
        self.state = frozen.state;
        self.measurement_count = frozen.measurement_count;
        self.last_update_time_us = frozen.last_update_time_us;

        let n = frozen.p.len();
        let mut p = frozen.p;
        for i in 0..n {
            for j in 0..n {
                p[i][j] *= if i == j { 10.0 } else { 3.0 };
            }
        }
        self.p = p;
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }

    /// Discards all accumulated state. After this returns, no measurement
    /// accepted before the reset is visible to any subsequent
    /// `server_to_client` call.
    pub fn reset_and_discard(&mut self) {
        let size = self.dim.size();
        self.state = vec![0.0; size];
        self.p = vec![vec![0.0; size]; size];
        self.measurement_count = 0;
        self.last_update_time_us = None;
        self.recent_offsets.clear();
        self.innovations.clear();
        self.adaptive_q_offset = Q_OFFSET_BASE;
        self.consecutive_rejections = 0;
        self.frozen = None;
        self.converged_emitted = false;
        self.ready_emitted = false;
        self.network_change.store(false, std::sync::atomic::Ordering::Relaxed);
    }

    /// Folds one measurement into the filter state.
    pub fn add_measurement(
        &mut self,
        offset_us: f64,
        max_error_us: f64,
        client_time_us: i64,
        rtt_us: f64,
    ) -> AddResult {
        let max_error_us = if max_error_us <= 0.0 { 1.0 } else { max_error_us };

        if !self.p_is_finite() {
            self.reset_and_discard();
        }

        let dt_us = match self.last_update_time_us {
            None => None,
            Some(last) => {
                let dt = client_time_us - last;
                if dt <= 0 {
                    return AddResult::Rejected;
                }
                Some(dt)
            }
        };

        if self.measurement_count == 0 {
            self.state[0] = offset_us;
            self.p[0][0] = max_error_us * max_error_us;
            if self.state.len() > 1 {
                self.state[1] = 0.0;
                self.p[1][1] = 0.0;
            }
            self.commit(offset_us, client_time_us);
            return AddResult::Accepted;
        }

        if self.measurement_count == 1 {
            // Deliberately do not derive drift from two points: measurement
            // noise dominates real clock drift by roughly 100x at this
            // scale, so a two-point slope is worse than assuming zero.
            if self.state.len() > 1 {
                self.state[1] = 0.0;
                const HUNDRED_PPM: f64 = 100.0e-6;
                self.p[1][1] = HUNDRED_PPM * HUNDRED_PPM;
            }
            self.commit(offset_us, client_time_us);
            return AddResult::Accepted;
        }

        let dt = dt_us.unwrap_or(0) as f64 / 1_000_000.0;

        if self.should_gate_outliers() && self.is_outlier(offset_us, max_error_us) {
            self.consecutive_rejections += 1;
            if self.consecutive_rejections <= FORCE_ACCEPT_AFTER_REJECTIONS {
                return AddResult::Rejected;
            }
            // Three consecutive rejections forces acceptance so a genuine
            // step change can land.
        }
        self.consecutive_rejections = 0;

        let n = self.state.len();
        let f = self.transition_matrix(dt);
        let offset_pred = mat_vec_row(&f, 0, &self.state);

        let q = self.process_noise(dt);
        let mut p_pred = mat_mul(&f, &self.p);
        p_pred = mat_mul_transpose(&p_pred, &f);
        for i in 0..n {
            p_pred[i][i] += q[i];
        }

        let innovation = offset_us - offset_pred;
        let s = p_pred[0][0] + max_error_us * max_error_us;

        let normalized_sq = if s > 0.0 { (innovation * innovation) / s } else { 0.0 };
        push_ring(&mut self.innovations, normalized_sq, INNOVATIONS_CAPACITY);

        // sqrt(variance) == max_error_us: variance is max_error_us^2 everywhere
        // else in this function (the initial P[0][0] assignment, S above), so
        // the trigger compares against max_error_us directly, not its sqrt.
        if !self.is_warmup() && innovation.abs() > FORGETTING_TRIGGER_SIGMAS * max_error_us {

            let lambda_sq = FORGETTING_LAMBDA * FORGETTING_LAMBDA;
            for row in p_pred.iter_mut() {
                for v in row.iter_mut() {
                    *v *= lambda_sq;
                }
            }
        }

        // Kalman gain K = P * H' / S, H = [1, 0, ..., 0].
        let k: Vec<f64> = (0..n).map(|i| p_pred[i][0] / s).collect();

        let mut state_pred = self.state.clone();
        state_pred[0] = offset_pred;
        for i in 1..n {
            state_pred[i] = mat_vec_row(&f, i, &self.state);
        }

        let mut new_state = state_pred.clone();
        for i in 0..n {
            new_state[i] += k[i] * innovation;
        }

        // P = (I - K*H) * P_pred
        let mut new_p = p_pred.clone();
        for i in 0..n {
            for j in 0..n {
                new_p[i][j] = p_pred[i][j] - k[i] * p_pred[0][j];
            }
        }

        self.state = new_state;
        self.p = new_p;

        if self.state.len() > 1 {
            self.state[1] = self.state[1].clamp(-DRIFT_CLAMP, DRIFT_CLAMP);
        }

        let mean_innovation = if self.innovations.is_empty() {
            1.0
        } else {
            self.innovations.iter().sum::<f64>() / self.innovations.len() as f64
        };
        self.adaptive_q_offset = Q_OFFSET_BASE * mean_innovation.clamp(0.5, 5.0);

        if self.dim == FilterDimension::Four {
            self.update_rtt_baseline(rtt_us);
        }

        self.commit(offset_us, client_time_us);
        AddResult::Accepted
    }

    fn commit(&mut self, offset_us: f64, client_time_us: i64) {
        self.last_update_time_us = Some(client_time_us);
        self.measurement_count += 1;
        push_ring(&mut self.recent_offsets, offset_us, RECENT_OFFSETS_CAPACITY);

        if !self.ready_emitted && self.is_ready() {
            self.ready_emitted = true;
            tracing::debug!(measurement_count = self.measurement_count, "filter_sync_ready");
        }
        if !self.converged_emitted && self.is_converged() {
            self.converged_emitted = true;
            tracing::debug!(measurement_count = self.measurement_count, "filter_converged");
        }
    }

    fn should_gate_outliers(&self) -> bool {
        self.measurement_count >= OUTLIER_GATE_WARMUP_MEASUREMENTS
    }

    fn is_outlier(&self, offset_us: f64, max_error_us: f64) -> bool {
        if self.recent_offsets.len() < 3 {
            return false;
        }
        let (median, iqr) = median_and_iqr(&self.recent_offsets);
        let threshold = (3.0 * iqr).max(max_error_us);
        (offset_us - median).abs() > threshold
    }

    /// F matrix for the active dimension.
    fn transition_matrix(&self, dt: f64) -> Vec<Vec<f64>> {
        let n = self.state.len();
        let mut f = vec![vec![0.0; n]; n];
        f[0][0] = 1.0;
        if n > 1 {
            f[0][1] = dt;
            f[1][1] = 1.0;
        }
        if n > 2 {
            f[0][2] = 0.5 * dt * dt;
            f[1][2] = dt;
            f[2][2] = ACCEL_DECAY;
        }
        if n > 3 {
            f[3][3] = 1.0; // RTT baseline updated separately, see update_rtt_baseline.
        }
        f
    }

    /// Process noise diagonal. The drift (and, where present, acceleration)
    /// terms carry zero process noise deliberately: quartz frequency is
    /// stable on the seconds-to-minutes timescale, and nonzero process
    /// noise there destabilizes the filter on jittery networks.
    fn process_noise(&self, dt: f64) -> Vec<f64> {
        let n = self.state.len();
        let mut q = vec![0.0; n];
        q[0] = self.adaptive_q_offset * dt;
        q
    }

    /// Updates the 4-D `expected_rtt` baseline with a standalone scalar
    /// Kalman step (the RTT channel has its own measurement, separate from
    /// the offset/drift/acceleration block updated by `H = [1,0,...]`).
    /// Inflates {offset, drift, acceleration} covariance x5 and flags a
    /// network change when the observed RTT deviates sharply from the
    /// baseline.
    fn update_rtt_baseline(&mut self, rtt_us: f64) -> bool {
        let idx = 3;
        let p_pred = self.p[idx][idx] / (RTT_DECAY * RTT_DECAY);
        let measurement_variance = 10_000.0f64.powi(2);
        let innovation = rtt_us - self.state[idx];

        let network_change = innovation.abs() > (3.0 * p_pred.sqrt()).max(10_000.0);
        if network_change {
            for i in 0..idx.min(self.state.len()) {
                self.p[i][i] *= 5.0;
            }
            self.network_change.store(true, std::sync::atomic::Ordering::Relaxed);
            tracing::debug!(rtt_us, expected_rtt_us = self.state[idx], "filter_network_change");
        }

        let k = p_pred / (p_pred + measurement_variance);
        self.state[idx] += k * innovation;
        self.p[idx][idx] = (1.0 - k) * p_pred;
        network_change
    }
}

fn push_ring(ring: &mut VecDeque<f64>, value: f64, capacity: usize) {
    if ring.len() == capacity {
        ring.pop_front();
    }
    ring.push_back(value);
}

fn median_and_iqr(values: &VecDeque<f64>) -> (f64, f64) {
    let mut sorted: Vec<f64> = values.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median = percentile(&sorted, 0.5);
    let q1 = percentile(&sorted, 0.25);
    let q3 = percentile(&sorted, 0.75);
    (median, (q3 - q1).abs())
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let idx = ((sorted.len() - 1) as f64 * p).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn mat_vec_row(f: &[Vec<f64>], row: usize, x: &[f64]) -> f64 {
    f[row].iter().zip(x.iter()).map(|(a, b)| a * b).sum()
}

fn mat_mul(a: &[Vec<f64>], b: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = a.len();
    let mut out = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            out[i][j] = (0..n).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// Computes `a * b'` (b transposed), used for `F * P * F'`.
fn mat_mul_transpose(a: &[Vec<f64>], b: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = a.len();
    let mut out = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            out[i][j] = (0..n).map(|k| a[i][k] * b[j][k]).sum();
        }
    }
    out
}

/// Convenience for feeding a [`Measurement`] straight through, as the
/// time-sync driver does.
pub fn feed_measurement(filter: &mut TimeFilter, m: &Measurement) -> AddResult {
    filter.add_measurement(m.offset_us(), m.max_error_us(), m.t4_us, m.rtt_us())
}

/// Converts a [`Duration`] to signed microseconds, saturating on overflow.
/// Used by the driver when building synthetic timestamps in tests.
#[must_use]
pub fn duration_as_i64_micros(d: Duration) -> i64 {
    i64::try_from(d.as_micros()).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(filter: &mut TimeFilter, offset_us: f64, client_time_us: i64, rtt_us: f64) -> AddResult {
        filter.add_measurement(offset_us, (rtt_us / 2.0).max(1.0), client_time_us, rtt_us)
    }

    #[test]
    fn first_measurement_initializes_from_nothing() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        let r = feed(&mut f, 1000.0, 0, 2000.0);
        assert_eq!(r, AddResult::Accepted);
        assert_eq!(f.state[0], 1000.0);
        assert_eq!(f.state[1], 0.0);
        assert_eq!(f.measurement_count, 1);
    }

    #[test]
    fn second_measurement_never_derives_drift_from_two_points() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        feed(&mut f, 0.0, 0, 2000.0);
        feed(&mut f, 50_000.0, 500_000, 2000.0);
        assert_eq!(f.state[1], 0.0);
    }

    #[test]
    fn zero_dt_measurement_is_silently_ignored() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        feed(&mut f, 0.0, 1000, 2000.0);
        let r = feed(&mut f, 10.0, 1000, 2000.0);
        assert_eq!(r, AddResult::Rejected);
        assert_eq!(f.measurement_count, 1);
    }

    #[test]
    fn max_error_of_zero_clamps_variance_to_one() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        f.add_measurement(500.0, 0.0, 0, 0.0);
        assert_eq!(f.p[0][0], 1.0);
    }

    #[test]
    fn drift_stays_within_clamp_after_every_accepted_update() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        let mut t = 0i64;
        for i in 0..40 {
            let offset = 1_000.0 + (i as f64) * 400.0; // aggressive synthetic drift
            feed(&mut f, offset, t, 2_000.0);
            assert!(f.state[1].abs() <= DRIFT_CLAMP + 1e-12);
            assert!(f.p[0][0] >= 0.0 && f.p[0][0].is_finite());
            t += 500_000;
        }
    }

    #[test]
    fn server_to_client_is_exactly_additive_once_converged() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        let mut t = 0i64;
        for _ in 0..10 {
            feed(&mut f, 1_000_000.0, t, 2_000.0);
            t += 500_000;
        }
        assert!(f.is_converged());
        let a = f.server_to_client(10_000_000);
        let b = f.server_to_client(9_999_999);
        assert_eq!(a - b, 1);
    }

    #[test]
    fn client_to_server_inverts_server_to_client() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        feed(&mut f, 12_345.0, 0, 2_000.0);
        let t = 123_456_789i64;
        let client = f.server_to_client(t);
        let back = f.client_to_server(client);
        assert!((back - t).abs() <= 1);
    }

    #[test]
    fn reset_discards_all_prior_measurements() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        feed(&mut f, 1_000.0, 0, 2_000.0);
        feed(&mut f, 1_000.0, 500_000, 2_000.0);
        f.reset_and_discard();
        assert_eq!(f.measurement_count, 0);
        assert_eq!(f.state[0], 0.0);
    }

    #[test]
    fn reset_twice_is_indistinguishable_from_once() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        feed(&mut f, 1_000.0, 0, 2_000.0);
        f.reset_and_discard();
        let after_one = (f.state.clone(), f.measurement_count);
        f.reset_and_discard();
        let after_two = (f.state.clone(), f.measurement_count);
        assert_eq!(after_one, after_two);
    }

    #[test]
    fn freeze_then_thaw_with_no_measurements_is_bit_identical() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        let mut t = 0i64;
        for _ in 0..6 {
            feed(&mut f, 5_000.0, t, 2_000.0);
            t += 500_000;
        }
        let before = f.state.clone();
        assert!(f.freeze());
        f.thaw();
        assert_eq!(f.state, before);
        assert!(!f.is_frozen());
    }

    #[test]
    fn freeze_requires_is_ready() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        feed(&mut f, 1_000.0, 0, 2_000.0);
        assert!(!f.is_ready());
        assert!(!f.freeze());
    }

    // E1: cold convergence.
    #[test]
    fn e1_cold_convergence() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        // Deterministic pseudo-noise instead of a RNG dependency, covering
        // a spread of +/- a few thousand microseconds.
        let noise = [
            1200.0, -2100.0, 800.0, -500.0, 2400.0, -1800.0, 300.0, -2900.0, 1600.0, -700.0,
            2000.0, -1300.0, 900.0, -2500.0, 1100.0, -400.0, 2700.0, -1900.0, 500.0, -800.0,
            1700.0, -2300.0, 600.0, -1100.0, 2200.0, -1600.0, 400.0, -2700.0, 1300.0, -900.0,
        ];
        let mut t = 0i64;
        let mut converged_at = None;
        for (i, n) in noise.iter().enumerate() {
            let offset = 1_000_000.0 + n;
            feed(&mut f, offset, t, 4_000.0);
            if converged_at.is_none() && f.is_converged() {
                converged_at = Some(i + 1);
            }
            t += 500_000;
        }
        assert!(converged_at.unwrap() <= 5, "expected convergence by 5th measurement");
        assert!((f.state[0] - 1_000_000.0).abs() < 2_000.0);
        assert!((f.state[1] * 1.0e6).abs() < 10.0);
    }

    // E2: cellular spike rejection.
    #[test]
    fn e2_cellular_spike_rejected() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        let mut t = 0i64;
        for _ in 0..15 {
            feed(&mut f, 0.0, t, 2_000.0);
            t += 500_000;
        }
        let before = f.state[0];
        let r = f.add_measurement(250_000.0, 5_000.0, t, 10_000.0);
        assert_eq!(r, AddResult::Rejected);
        assert!((f.state[0] - before).abs() <= 500.0);
    }

    // E3: genuine step change forces acceptance on the third attempt.
    #[test]
    fn e3_genuine_step_change_forces_acceptance() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        let mut t = 0i64;
        for _ in 0..15 {
            feed(&mut f, 0.0, t, 2_000.0);
            t += 500_000;
        }

        let r1 = feed(&mut f, 300_000.0, t, 2_000.0);
        t += 500_000;
        let r2 = feed(&mut f, 300_000.0, t, 2_000.0);
        t += 500_000;
        let r3 = feed(&mut f, 300_000.0, t, 2_000.0);
        t += 500_000;

        assert_eq!(r1, AddResult::Rejected);
        assert_eq!(r2, AddResult::Rejected);
        assert_eq!(r3, AddResult::Accepted);

        for _ in 0..5 {
            feed(&mut f, 300_000.0, t, 2_000.0);
            t += 500_000;
        }
        assert!((f.state[0] - 300_000.0).abs() < 50_000.0);
    }

    #[test]
    fn non_finite_covariance_reinitializes_on_next_measurement() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        feed(&mut f, 1_000.0, 0, 2_000.0);
        f.p[0][0] = f64::NAN;
        assert!(!f.is_ready());
        feed(&mut f, 2_000.0, 500_000, 2_000.0);
        assert!(f.p[0][0].is_finite());
    }

    #[test]
    fn set_dimension_preserves_offset_and_drift() {
        let mut f = TimeFilter::new(FilterDimension::Two);
        let mut t = 0i64;
        for _ in 0..6 {
            feed(&mut f, 3_000.0, t, 2_000.0);
            t += 500_000;
        }
        let offset_before = f.state[0];
        f.set_dimension(FilterDimension::Three);
        assert_eq!(f.state.len(), 3);
        assert_eq!(f.state[0], offset_before);
        assert!(f.p[2][2] > 1.0);
    }
}
