//! Throttling analyzer: turns per-window error fractions into a recommended
//! pause.
//!
//! ## Control law
//!
//! Once per analysis period the analyzer drains its [`TrafficCounter`] and
//! computes
//!
//! ```text
//! fraction = failed_bytes / (success_bytes + failed_bytes)   (0 for an empty window)
//! signal   = signal * (1 - α) + fraction * α
//! sleep    = round(signal * analysis_period), clamped to [0, analysis_period]
//! ```
//!
//! The fraction makes the response independent of traffic volume. The
//! exponential smoothing gives it memory: a burst of failures raises the pause
//! at once, and quiet periods decay it geometrically with ratio `(1 - α)`.
//!
//! ## Thread Safety
//!
//! Only the scheduler ticks an analyzer, and ticks of one analyzer never
//! overlap. The published sleep duration is a single atomic, so readers on the
//! request path never wait for a tick.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::config::validate_smoothing_factor;
use crate::counter::{TrafficCounter, Window};
use crate::error::{Result, ThrottleError};
use crate::session::Direction;

/// Fraction of the window's bytes that belonged to failed operations.
///
/// An empty window contributes no error.
pub fn period_error_fraction(window: &Window) -> f64 {
    let total = window.total_bytes();
    if total == 0 {
        return 0.0;
    }
    window.failed_bytes as f64 / total as f64
}

/// One step of the exponentially weighted moving average.
pub fn smooth(previous: f64, sample: f64, alpha: f64) -> f64 {
    (previous * (1.0 - alpha) + sample * alpha).clamp(0.0, 1.0)
}

/// Recommended pause in milliseconds for a smoothed error signal.
pub fn sleep_for_signal(signal: f64, analysis_period_ms: u64) -> u64 {
    let period = analysis_period_ms as f64;
    (signal * period).round().clamp(0.0, period) as u64
}

/// Analysis period in whole milliseconds, the unit of the recommended pause.
fn period_millis(period: Duration) -> Result<u64> {
    if period.is_zero() || period.subsec_nanos() % 1_000_000 != 0 {
        return Err(ThrottleError::InvalidPeriod);
    }
    period
        .as_millis()
        .try_into()
        .map_err(|_| ThrottleError::InvalidPeriod)
}

/// Whether the analyzer has ever seen traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerPhase {
    /// No operation recorded since subscription.
    Idle,
    /// At least one non-empty window has been analyzed.
    Active,
}

/// Outcome of a single analysis tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnalysisSample {
    pub window: Window,
    pub period_error_fraction: f64,
    pub smoothed_error_signal: f64,
    pub sleep_duration_ms: u64,
}

#[derive(Debug)]
struct AnalyzerState {
    phase: AnalyzerPhase,
    smoothed_error_signal: f64,
    ticks: u64,
    last_window: Window,
}

/// Per-direction throttling analyzer.
#[derive(Debug)]
pub struct ThrottlingAnalyzer {
    direction: Direction,
    counter: Arc<TrafficCounter>,
    analysis_period_ms: u64,
    smoothing_factor: f64,
    state: Mutex<AnalyzerState>,
    sleep_duration_ms: AtomicU64,
}

impl ThrottlingAnalyzer {
    pub fn new(
        direction: Direction,
        counter: Arc<TrafficCounter>,
        analysis_period: Duration,
        smoothing_factor: f64,
    ) -> Result<Self> {
        let analysis_period_ms = period_millis(analysis_period)?;
        validate_smoothing_factor(smoothing_factor)?;

        Ok(Self {
            direction,
            counter,
            analysis_period_ms,
            smoothing_factor,
            state: Mutex::new(AnalyzerState {
                phase: AnalyzerPhase::Idle,
                smoothed_error_signal: 0.0,
                ticks: 0,
                last_window: Window::default(),
            }),
            sleep_duration_ms: AtomicU64::new(0),
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn counter(&self) -> &Arc<TrafficCounter> {
        &self.counter
    }

    pub fn analysis_period(&self) -> Duration {
        Duration::from_millis(self.analysis_period_ms)
    }

    /// Current recommended pause. Reflects the most recently completed tick.
    pub fn sleep_duration(&self) -> Duration {
        Duration::from_millis(self.sleep_duration_ms())
    }

    pub fn sleep_duration_ms(&self) -> u64 {
        self.sleep_duration_ms.load(Ordering::Acquire)
    }

    /// Drain the counter and update the recommendation.
    pub fn tick(&self) -> AnalysisSample {
        let window = self.counter.snapshot_and_reset();
        self.apply(window)
    }

    /// Account for `periods` elapsed analysis periods that were never ticked.
    ///
    /// The preceding tick drained everything recorded meanwhile, so each missed
    /// period counts as an empty window and only decays the signal by `(1 - α)`.
    pub fn decay_idle_periods(&self, periods: u64) -> AnalysisSample {
        let mut state = self.state.lock();
        if periods > 0 {
            let exponent = i32::try_from(periods).unwrap_or(i32::MAX);
            let decay = (1.0 - self.smoothing_factor).powi(exponent);
            state.smoothed_error_signal = (state.smoothed_error_signal * decay).clamp(0.0, 1.0);
            state.ticks = state.ticks.saturating_add(periods);
            state.last_window = Window::default();
        }
        self.publish(&state, 0.0)
    }

    fn apply(&self, window: Window) -> AnalysisSample {
        let mut state = self.state.lock();

        let fraction = period_error_fraction(&window);
        if !window.is_empty() {
            state.phase = AnalyzerPhase::Active;
        }
        state.smoothed_error_signal =
            smooth(state.smoothed_error_signal, fraction, self.smoothing_factor);
        state.ticks += 1;
        state.last_window = window;

        self.publish(&state, fraction)
    }

    fn publish(&self, state: &AnalyzerState, fraction: f64) -> AnalysisSample {
        let sleep_ms = sleep_for_signal(state.smoothed_error_signal, self.analysis_period_ms);
        let previous_ms = self.sleep_duration_ms.swap(sleep_ms, Ordering::AcqRel);

        if previous_ms != sleep_ms {
            tracing::debug!(
                direction = %self.direction,
                previous_ms,
                sleep_ms,
                error_fraction = fraction,
                signal = state.smoothed_error_signal,
                "Throttle sleep duration changed"
            );
        } else {
            tracing::trace!(
                direction = %self.direction,
                sleep_ms,
                signal = state.smoothed_error_signal,
                "Throttle analysis tick"
            );
        }

        AnalysisSample {
            window: state.last_window,
            period_error_fraction: fraction,
            smoothed_error_signal: state.smoothed_error_signal,
            sleep_duration_ms: sleep_ms,
        }
    }

    pub fn stats(&self) -> AnalyzerStats {
        let state = self.state.lock();
        AnalyzerStats {
            direction: self.direction,
            phase: state.phase,
            smoothed_error_signal: state.smoothed_error_signal,
            sleep_duration: self.sleep_duration(),
            analysis_period: self.analysis_period(),
            ticks: state.ticks,
            last_window: state.last_window,
            pending_window: self.counter.peek(),
        }
    }
}

/// Snapshot of analyzer state for logging and debugging.
#[derive(Debug, Clone)]
pub struct AnalyzerStats {
    pub direction: Direction,
    pub phase: AnalyzerPhase,
    pub smoothed_error_signal: f64,
    pub sleep_duration: Duration,
    pub analysis_period: Duration,
    /// Number of completed ticks.
    pub ticks: u64,
    /// Window consumed by the latest tick.
    pub last_window: Window,
    /// Traffic recorded since the latest tick.
    pub pending_window: Window,
}

impl fmt::Display for AnalyzerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "throttle[{}/{:?}] sleep={}ms signal={:.3} ticks={} last={}/{} failed",
            self.direction,
            self.phase,
            self.sleep_duration.as_millis(),
            self.smoothed_error_signal,
            self.ticks,
            format_bytes(self.last_window.failed_bytes),
            format_bytes(self.last_window.total_bytes()),
        )
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes >= 1_000_000 {
        format!("{:.1}MB", bytes as f64 / 1_000_000.0)
    } else if bytes >= 1_000 {
        format!("{:.1}KB", bytes as f64 / 1_000.0)
    } else {
        format!("{}B", bytes)
    }
}
