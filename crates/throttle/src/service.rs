//! Session registry and the facade used by storage clients.
//!
//! # Usage
//!
//! ```ignore
//! let service = ThrottleService::new(ThrottleConfig::default())?;
//! service.subscribe(session.clone(), Duration::from_secs(1))?;
//!
//! // Before issuing an operation:
//! let pause = service.sleep_duration(&session, Direction::Write)?;
//! if !pause.is_zero() {
//!     tokio::time::sleep(pause).await;
//! }
//!
//! // When the operation completes:
//! service.record(&session, Direction::Write, bytes, failed)?;
//! ```

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::analyzer::{AnalyzerStats, ThrottlingAnalyzer};
use crate::config::ThrottleConfig;
use crate::counter::{TrafficCounter, Window};
use crate::error::{Result, ThrottleError};
use crate::scheduler::{AnalysisScheduler, ScheduledAnalysis, SubscriptionId};
use crate::session::{Direction, StorageSession};

/// Read and write analyzers of one subscribed session.
#[derive(Debug)]
pub(crate) struct SessionThrottle {
    label: String,
    read: ThrottlingAnalyzer,
    write: ThrottlingAnalyzer,
    retired: AtomicBool,
    /// Held for the duration of a tick and while retiring.
    tick_fence: Mutex<()>,
}

impl SessionThrottle {
    fn new(label: String, analysis_period: Duration, smoothing_factor: f64) -> Result<Self> {
        let analyzer = |direction| {
            ThrottlingAnalyzer::new(
                direction,
                Arc::new(TrafficCounter::new()),
                analysis_period,
                smoothing_factor,
            )
        };
        Ok(Self {
            label,
            read: analyzer(Direction::Read)?,
            write: analyzer(Direction::Write)?,
            retired: AtomicBool::new(false),
            tick_fence: Mutex::new(()),
        })
    }

    fn analyzer(&self, direction: Direction) -> &ThrottlingAnalyzer {
        match direction {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    /// Stop all further ticks. Waits for a tick that is already running.
    fn retire(&self) {
        let _fence = self.tick_fence.lock();
        self.retired.store(true, Ordering::Release);
    }

    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }
}

impl ScheduledAnalysis for SessionThrottle {
    fn run_tick(&self, missed_periods: u64) -> bool {
        let _fence = self.tick_fence.lock();
        if self.is_retired() {
            return false;
        }
        let _span = tracing::trace_span!("throttle_tick", session = %self.label).entered();
        for analyzer in [&self.read, &self.write] {
            analyzer.tick();
            if missed_periods > 0 {
                analyzer.decay_idle_periods(missed_periods);
            }
        }
        true
    }

    fn label(&self) -> &str {
        &self.label
    }
}

/// Live, read-only view of a session's recommended pauses.
///
/// Always reflects the most recently completed tick. Once the session is
/// unsubscribed or re-subscribed the handle recommends no pause at all; the
/// last analyzed state stays available through [`AnalysisResult::stats`].
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    throttle: Arc<SessionThrottle>,
}

impl AnalysisResult {
    pub fn read(&self) -> DirectionResult<'_> {
        self.direction(Direction::Read)
    }

    pub fn write(&self) -> DirectionResult<'_> {
        self.direction(Direction::Write)
    }

    pub fn direction(&self, direction: Direction) -> DirectionResult<'_> {
        DirectionResult {
            throttle: &self.throttle,
            direction,
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            read: self.throttle.read.stats(),
            write: self.throttle.write.stats(),
        }
    }

    /// False once the session was unsubscribed or re-subscribed.
    pub fn is_live(&self) -> bool {
        !self.throttle.is_retired()
    }
}

/// Recommendation for one direction of a session.
#[derive(Debug, Clone, Copy)]
pub struct DirectionResult<'a> {
    throttle: &'a SessionThrottle,
    direction: Direction,
}

impl DirectionResult<'_> {
    /// Zero once the session is no longer subscribed.
    pub fn sleep_duration(&self) -> Duration {
        Duration::from_millis(self.sleep_duration_ms())
    }

    pub fn sleep_duration_ms(&self) -> u64 {
        if self.throttle.is_retired() {
            return 0;
        }
        self.throttle.analyzer(self.direction).sleep_duration_ms()
    }
}

/// Traffic counters of a session, one per direction.
#[derive(Debug, Clone)]
pub struct TrafficMetrics {
    throttle: Arc<SessionThrottle>,
}

impl TrafficMetrics {
    pub fn read(&self) -> DirectionMetrics<'_> {
        self.direction(Direction::Read)
    }

    pub fn write(&self) -> DirectionMetrics<'_> {
        self.direction(Direction::Write)
    }

    pub fn direction(&self, direction: Direction) -> DirectionMetrics<'_> {
        DirectionMetrics {
            throttle: &self.throttle,
            direction,
        }
    }
}

/// Counter of one direction of a session.
#[derive(Debug, Clone, Copy)]
pub struct DirectionMetrics<'a> {
    throttle: &'a SessionThrottle,
    direction: Direction,
}

impl DirectionMetrics<'_> {
    fn counter(&self) -> &TrafficCounter {
        self.throttle.analyzer(self.direction).counter()
    }

    /// Report a completed operation. Dropped once the session is no longer
    /// subscribed, since nothing analyzes the counter anymore.
    pub fn record(&self, byte_count: u64, failed: bool) {
        if self.throttle.is_retired() {
            tracing::debug!(
                session = %self.throttle.label,
                direction = %self.direction,
                byte_count,
                failed,
                "Dropping record for unsubscribed session"
            );
            return;
        }
        self.counter().record(byte_count, failed);
    }

    /// See [`TrafficCounter::peek`].
    pub fn peek(&self) -> Window {
        self.counter().peek()
    }

    /// See [`TrafficCounter::lifetime`].
    pub fn lifetime(&self) -> Window {
        self.counter().lifetime()
    }
}

#[derive(Debug, Clone)]
pub struct SessionStats {
    pub read: AnalyzerStats,
    pub write: AnalyzerStats,
}

struct Subscription {
    id: SubscriptionId,
    throttle: Arc<SessionThrottle>,
}

/// Registry of throttled sessions, driven by one shared analysis scheduler.
///
/// Entries in the registry are the only strong owners of a session's analyzers;
/// the scheduler holds them weakly. Dropping the service stops the scheduler.
pub struct ThrottleService<K = StorageSession> {
    config: ThrottleConfig,
    sessions: DashMap<K, Subscription>,
    scheduler: AnalysisScheduler,
}

impl<K> ThrottleService<K>
where
    K: Hash + Eq + Clone + Debug + Send + Sync + 'static,
{
    /// Create a service whose scheduler runs on the current tokio runtime.
    pub fn new(config: ThrottleConfig) -> Result<Self> {
        let handle = Handle::try_current().map_err(|_| ThrottleError::NoRuntime)?;
        Self::with_handle(config, &handle)
    }

    pub fn with_handle(config: ThrottleConfig, handle: &Handle) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sessions: DashMap::new(),
            scheduler: AnalysisScheduler::start(handle),
        })
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Start analyzing `session` with the given period.
    ///
    /// Subscribing a session that is already subscribed discards its previous
    /// state and starts over from zero.
    pub fn subscribe(&self, session: K, analysis_period: Duration) -> Result<AnalysisResult> {
        if analysis_period.is_zero() {
            return Err(ThrottleError::InvalidPeriod);
        }
        let throttle = Arc::new(SessionThrottle::new(
            format!("{session:?}"),
            analysis_period,
            self.config.smoothing_factor,
        )?);
        let target = Arc::downgrade(&throttle) as Weak<dyn ScheduledAnalysis>;
        let id = self.scheduler.register(target, analysis_period)?;

        let subscription = Subscription {
            id,
            throttle: Arc::clone(&throttle),
        };
        match self.sessions.insert(session.clone(), subscription) {
            Some(previous) => {
                previous.throttle.retire();
                self.scheduler.cancel(previous.id);
                tracing::info!(
                    ?session,
                    period_ms = analysis_period.as_millis() as u64,
                    "Session re-subscribed for throttling analysis, previous state discarded"
                );
            }
            None => {
                tracing::info!(
                    ?session,
                    period_ms = analysis_period.as_millis() as u64,
                    "Session subscribed for throttling analysis"
                );
            }
        }

        Ok(AnalysisResult { throttle })
    }

    /// Subscribe with the configured default analysis period.
    pub fn subscribe_default(&self, session: K) -> Result<AnalysisResult> {
        self.subscribe(session, self.config.analysis_period())
    }

    /// Stop analyzing `session` and release its state.
    ///
    /// If a tick for the session is running it completes first; no tick starts
    /// after this returns.
    pub fn unsubscribe(&self, session: &K) -> Result<()> {
        let (_, subscription) = self
            .sessions
            .remove(session)
            .ok_or_else(|| ThrottleError::not_subscribed(session))?;
        subscription.throttle.retire();
        self.scheduler.cancel(subscription.id);
        tracing::info!(?session, "Session unsubscribed from throttling analysis");
        Ok(())
    }

    pub fn is_subscribed(&self, session: &K) -> bool {
        self.sessions.contains_key(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn result(&self, session: &K) -> Result<AnalysisResult> {
        self.with_session(session, |throttle| AnalysisResult {
            throttle: Arc::clone(throttle),
        })
    }

    pub fn metrics(&self, session: &K) -> Result<TrafficMetrics> {
        self.with_session(session, |throttle| TrafficMetrics {
            throttle: Arc::clone(throttle),
        })
    }

    pub fn stats(&self, session: &K) -> Result<SessionStats> {
        self.with_session(session, |throttle| SessionStats {
            read: throttle.read.stats(),
            write: throttle.write.stats(),
        })
    }

    /// Recommended pause before the next operation in `direction`.
    pub fn sleep_duration(&self, session: &K, direction: Direction) -> Result<Duration> {
        self.with_session(session, |throttle| {
            throttle.analyzer(direction).sleep_duration()
        })
    }

    /// Report a completed operation.
    pub fn record(
        &self,
        session: &K,
        direction: Direction,
        byte_count: u64,
        failed: bool,
    ) -> Result<()> {
        self.with_session(session, |throttle| {
            throttle.analyzer(direction).counter().record(byte_count, failed)
        })
    }

    /// Stop the scheduler. Subscriptions stay readable but no longer tick, and
    /// new subscriptions fail with [`ThrottleError::SchedulerStopped`].
    pub fn shutdown(&self) {
        tracing::debug!(sessions = self.sessions.len(), "Shutting down throttle service");
        self.scheduler.shutdown();
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    fn with_session<T>(
        &self,
        session: &K,
        f: impl FnOnce(&Arc<SessionThrottle>) -> T,
    ) -> Result<T> {
        let entry = self
            .sessions
            .get(session)
            .ok_or_else(|| ThrottleError::not_subscribed(session))?;
        Ok(f(&entry.throttle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERIOD: Duration = Duration::from_millis(1000);

    fn session(name: &str) -> StorageSession {
        StorageSession::new("testaccount.dfs.core.windows.net", "dGVzdFN0cmluZw==", name)
    }

    #[test]
    fn test_tick_after_retire_is_refused() {
        let throttle = SessionThrottle::new("test".into(), PERIOD, 0.5).unwrap();
        throttle.write.counter().record(10, true);
        assert!(throttle.run_tick(0));
        assert_eq!(throttle.write.sleep_duration_ms(), 500);

        throttle.retire();
        throttle.write.counter().record(10, true);
        assert!(!throttle.run_tick(0));
        assert_eq!(throttle.write.sleep_duration_ms(), 500);
        assert_eq!(throttle.write.stats().ticks, 1);
    }

    #[test]
    fn test_missed_periods_decay_both_directions() {
        let throttle = SessionThrottle::new("test".into(), PERIOD, 0.5).unwrap();
        throttle.read.counter().record(10, true);
        throttle.write.counter().record(10, true);

        // One drained window followed by two idle periods: 0.5 -> 0.25 -> 0.125
        assert!(throttle.run_tick(2));
        for analyzer in [&throttle.read, &throttle.write] {
            let stats = analyzer.stats();
            assert_eq!(stats.ticks, 3);
            assert_eq!(stats.smoothed_error_signal, 0.125);
            assert_eq!(analyzer.sleep_duration_ms(), 125);
        }
    }

    #[test]
    fn test_retire_waits_for_in_flight_tick() {
        let throttle = Arc::new(SessionThrottle::new("fence".into(), PERIOD, 0.5).unwrap());

        let ticker = {
            let throttle = Arc::clone(&throttle);
            std::thread::spawn(move || {
                let mut ticks = 0u64;
                while throttle.run_tick(0) {
                    ticks += 1;
                }
                ticks
            })
        };

        while throttle.write.stats().ticks < 200 {
            throttle.read.counter().record(10, false);
            throttle.write.counter().record(10, true);
            std::thread::yield_now();
        }
        throttle.retire();

        // No tick is half done once retire returns.
        let read_ticks = throttle.read.stats().ticks;
        let write_ticks = throttle.write.stats().ticks;
        assert_eq!(read_ticks, write_ticks);

        let ticked = ticker.join().expect("ticker thread should not panic");
        assert_eq!(ticked, write_ticks);

        std::thread::sleep(Duration::from_millis(10));
        assert!(!throttle.run_tick(0));
        assert_eq!(throttle.read.stats().ticks, read_ticks);
        assert_eq!(throttle.write.stats().ticks, write_ticks);
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = ThrottleService::<StorageSession>::new(ThrottleConfig::default());
        assert!(matches!(result, Err(ThrottleError::NoRuntime)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_invalid_config_and_period() {
        let config = ThrottleConfig::default().with_smoothing_factor(0.0);
        assert!(matches!(
            ThrottleService::<StorageSession>::new(config),
            Err(ThrottleError::InvalidSmoothingFactor(_))
        ));

        let service = ThrottleService::new(ThrottleConfig::default()).unwrap();
        assert!(matches!(
            service.subscribe(session("fs"), Duration::ZERO),
            Err(ThrottleError::InvalidPeriod)
        ));
        assert!(service.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_session_is_not_subscribed() {
        let service = ThrottleService::new(ThrottleConfig::default()).unwrap();
        let unknown = session("missing");

        assert!(matches!(
            service.result(&unknown),
            Err(ThrottleError::NotSubscribed { .. })
        ));
        assert!(matches!(
            service.record(&unknown, Direction::Read, 1, false),
            Err(ThrottleError::NotSubscribed { .. })
        ));
        assert!(matches!(
            service.unsubscribe(&unknown),
            Err(ThrottleError::NotSubscribed { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_directions_are_independent() {
        let service = ThrottleService::new(ThrottleConfig::default()).unwrap();
        let fs = session("fs");
        let result = service.subscribe(fs.clone(), PERIOD).unwrap();

        service.record(&fs, Direction::Write, 1024, true).unwrap();
        service.record(&fs, Direction::Read, 1024, false).unwrap();
        tokio::time::sleep(PERIOD + PERIOD / 10).await;

        assert_eq!(result.write().sleep_duration_ms(), 500);
        assert_eq!(result.read().sleep_duration_ms(), 0);
        assert_eq!(
            service.sleep_duration(&fs, Direction::Write).unwrap(),
            Duration::from_millis(500)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_discards_state() {
        let service = ThrottleService::new(ThrottleConfig::default()).unwrap();
        let fs = session("fs");
        let first = service.subscribe(fs.clone(), PERIOD).unwrap();
        service.record(&fs, Direction::Write, 1, true).unwrap();
        tokio::time::sleep(PERIOD + PERIOD / 10).await;
        assert_eq!(first.write().sleep_duration_ms(), 500);

        let first_metrics = service.metrics(&fs).unwrap();
        let second = service.subscribe(fs.clone(), PERIOD).unwrap();
        assert!(!first.is_live());
        assert!(second.is_live());
        assert_eq!(first.write().sleep_duration(), Duration::ZERO);
        assert_eq!(first.stats().write.sleep_duration, Duration::from_millis(500));

        first_metrics.write().record(1, true);
        assert!(first_metrics.write().peek().is_empty());
        assert!(service.metrics(&fs).unwrap().write().peek().is_empty());
        assert_eq!(service.len(), 1);
        assert_eq!(second.write().sleep_duration_ms(), 0);
        assert_eq!(service.sleep_duration(&fs, Direction::Write).unwrap(), Duration::ZERO);

        tokio::time::sleep(PERIOD * 3 + PERIOD / 10).await;
        assert_eq!(first.stats().write.ticks, 1);
        assert_eq!(second.stats().write.ticks, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_metrics_share_counters_with_analyzers() {
        let service = ThrottleService::new(ThrottleConfig::default()).unwrap();
        let fs = session("fs");
        let result = service.subscribe(fs.clone(), PERIOD).unwrap();
        let metrics = service.metrics(&fs).unwrap();

        metrics.write().record(2 * 1024 * 1024, true);
        metrics.direction(Direction::Write).record(8 * 1024 * 1024, false);
        assert_eq!(metrics.write().peek().total_bytes(), 10 * 1024 * 1024);

        tokio::time::sleep(PERIOD + PERIOD / 10).await;
        assert_eq!(result.write().sleep_duration_ms(), 100);
        assert!(metrics.write().peek().is_empty());
        assert_eq!(metrics.write().lifetime().total_bytes(), 10 * 1024 * 1024);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_scheduling() {
        let service = ThrottleService::new(ThrottleConfig::default()).unwrap();
        let fs = session("fs");
        let result = service.subscribe(fs.clone(), PERIOD).unwrap();

        service.shutdown();
        tokio::time::sleep(PERIOD * 2).await;
        assert!(!service.is_running());
        assert_eq!(result.stats().write.ticks, 0);
        assert!(matches!(
            service.subscribe_default(session("other")),
            Err(ThrottleError::SchedulerStopped)
        ));
        // Still readable after shutdown
        assert!(service.result(&fs).is_ok());
    }
}
