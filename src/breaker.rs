//! Circuit breaker with percentage thresholds and sample-counted half-open
//!
//! CLOSED opens when the failure fraction over at least `min_requests`
//! reaches `failure_threshold`. OPEN admits nothing until `recovery` elapses,
//! then HALF_OPEN admits up to `half_open_max` probes and holds the state
//! until every admitted probe has completed; the decision is sample-count
//! based, not time based.

use crate::clock::{Clock, MonotonicClock};
use crate::error::ExecError;
use crate::persistence::StatePersistence;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker thresholds. Fractions are in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Failure fraction that opens the circuit.
    pub failure_threshold: f64,
    /// Minimum window size before the failure fraction is evaluated.
    pub min_requests: u32,
    /// How long OPEN refuses before probing.
    pub recovery: Duration,
    /// Success fraction over the half-open sample that closes the circuit.
    pub success_threshold: f64,
    /// Probes admitted concurrently while HALF_OPEN.
    pub half_open_max: u32,
    /// Also track per-attempt outcomes with their own threshold.
    pub track_individual_attempts: bool,
    /// Failure fraction over per-attempt outcomes that opens the circuit
    /// (only consulted when `track_individual_attempts` is set).
    pub attempt_failure_threshold: f64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 0.5,
            min_requests: 5,
            recovery: Duration::from_secs(30),
            success_threshold: 0.5,
            half_open_max: 3,
            track_individual_attempts: false,
            attempt_failure_threshold: 0.7,
        }
    }
}

impl BreakerConfig {
    /// A breaker that never opens.
    pub fn disabled() -> Self {
        Self { failure_threshold: f64::INFINITY, min_requests: u32::MAX, ..Self::default() }
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize, serde::Deserialize)]
struct Window {
    total: u64,
    failed: u64,
    successful: u64,
}

impl Window {
    fn record(&mut self, success: bool) {
        self.total += 1;
        if success {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
    }

    fn failure_fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.failed as f64 / self.total as f64
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    window: Window,
    attempt_window: Window,
    totals: Window,
    opened_at_ms: u64,
    last_state_change_ms: u64,
    open_count: u64,
    total_open_ms: u64,
    half_open_admitted: u32,
    half_open_completed: u32,
    half_open_successes: u32,
}

/// Outcome of consulting the breaker before an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Refused; `open_for` is how long the circuit has been open.
    Rejected { open_for: Duration },
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Admission::Allowed)
    }
}

/// Point-in-time breaker counters and transition history.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct BreakerMetrics {
    pub state: BreakerState,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub successful_requests: u64,
    pub open_count: u64,
    pub total_open_ms: u64,
    pub last_state_change_ms: u64,
    pub window_total: u64,
    pub window_failed: u64,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct BreakerSnapshot {
    state: BreakerState,
    window: Window,
    totals: Window,
    open_count: u64,
    total_open_ms: u64,
}

/// Shared circuit breaker. Thread-safe; clone the `Arc` to share.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    clock: Arc<dyn Clock>,
    persistence: Option<Arc<dyn StatePersistence>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now_millis();
        Self {
            name: "breaker".to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                window: Window::default(),
                attempt_window: Window::default(),
                totals: Window::default(),
                opened_at_ms: 0,
                last_state_change_ms: now,
                open_count: 0,
                total_open_ms: 0,
                half_open_admitted: 0,
                half_open_completed: 0,
                half_open_successes: 0,
            }),
            clock,
            persistence: None,
        }
    }

    pub fn shared(config: BreakerConfig) -> Arc<Self> {
        Arc::new(Self::new(config))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn StatePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    /// Gate an attempt. OPEN past the recovery window flips to HALF_OPEN and
    /// admits the caller as the first probe.
    pub fn can_execute(&self) -> Admission {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        match inner.state {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let open_for = now.saturating_sub(inner.opened_at_ms);
                if open_for >= self.config.recovery.as_millis() as u64 {
                    Self::transition(&mut inner, BreakerState::HalfOpen, now, &self.name);
                    inner.half_open_admitted = 1;
                    Admission::Allowed
                } else {
                    Admission::Rejected { open_for: Duration::from_millis(open_for) }
                }
            }
            BreakerState::HalfOpen => {
                if inner.half_open_admitted < self.config.half_open_max.max(1) {
                    inner.half_open_admitted += 1;
                    Admission::Allowed
                } else {
                    let open_for = now.saturating_sub(inner.last_state_change_ms);
                    Admission::Rejected { open_for: Duration::from_millis(open_for) }
                }
            }
        }
    }

    pub fn record_success(&self) {
        self.record(true);
    }

    pub fn record_failure(&self) {
        self.record(false);
    }

    fn record(&self, success: bool) {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.totals.record(success);
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_completed += 1;
                if success {
                    inner.half_open_successes += 1;
                }
                // Hold the state until the whole admitted sample is in.
                let sample = self.config.half_open_max.max(1);
                if inner.half_open_completed >= sample {
                    let fraction =
                        inner.half_open_successes as f64 / inner.half_open_completed as f64;
                    let next = if fraction >= self.config.success_threshold {
                        BreakerState::Closed
                    } else {
                        BreakerState::Open
                    };
                    Self::transition(&mut inner, next, now, &self.name);
                }
            }
            BreakerState::Closed => {
                inner.window.record(success);
                if inner.window.total >= self.config.min_requests as u64
                    && inner.window.failure_fraction() >= self.config.failure_threshold
                {
                    Self::transition(&mut inner, BreakerState::Open, now, &self.name);
                }
            }
            // A call admitted before the circuit opened can finish late.
            BreakerState::Open => {}
        }
    }

    /// Per-attempt outcome stream; only meaningful when
    /// `track_individual_attempts` is set. Its window can open the circuit
    /// under its own threshold.
    pub fn record_attempt(&self, success: bool) {
        if !self.config.track_individual_attempts {
            return;
        }
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.attempt_window.record(success);
        if inner.state == BreakerState::Closed
            && inner.attempt_window.total >= self.config.min_requests as u64
            && inner.attempt_window.failure_fraction() >= self.config.attempt_failure_threshold
        {
            Self::transition(&mut inner, BreakerState::Open, now, &self.name);
        }
    }

    fn transition(inner: &mut BreakerInner, to: BreakerState, now: u64, name: &str) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        if from == BreakerState::Open {
            inner.total_open_ms += now.saturating_sub(inner.opened_at_ms);
        }
        if to == BreakerState::Open {
            inner.open_count += 1;
            inner.opened_at_ms = now;
        }
        inner.state = to;
        inner.last_state_change_ms = now;
        inner.window = Window::default();
        inner.attempt_window = Window::default();
        inner.half_open_admitted = 0;
        inner.half_open_completed = 0;
        inner.half_open_successes = 0;
        tracing::info!(breaker = name, ?from, ?to, "circuit state transition");
    }

    /// Convenience wrapper: gate, invoke, record.
    pub async fn execute<T, Fut, Op>(&self, operation: Op) -> Result<T, ExecError>
    where
        Fut: Future<Output = Result<T, ExecError>>,
        Op: FnOnce() -> Fut,
    {
        match self.can_execute() {
            Admission::Rejected { open_for } => Err(ExecError::CircuitOpen { open_for }),
            Admission::Allowed => {
                let result = operation().await;
                match &result {
                    Ok(_) => self.record_success(),
                    Err(_) => self.record_failure(),
                }
                result
            }
        }
    }

    pub fn metrics(&self) -> BreakerMetrics {
        let now = self.clock.now_millis();
        let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let mut total_open_ms = inner.total_open_ms;
        if inner.state == BreakerState::Open {
            total_open_ms += now.saturating_sub(inner.opened_at_ms);
        }
        BreakerMetrics {
            state: inner.state,
            total_requests: inner.totals.total,
            failed_requests: inner.totals.failed,
            successful_requests: inner.totals.successful,
            open_count: inner.open_count,
            total_open_ms,
            last_state_change_ms: inner.last_state_change_ms,
            window_total: inner.window.total,
            window_failed: inner.window.failed,
        }
    }

    /// Best-effort save through the persistence collaborator. Failures are
    /// logged, never raised.
    pub async fn persist(&self) {
        let Some(persistence) = &self.persistence else { return };
        let snapshot = {
            let inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            BreakerSnapshot {
                state: inner.state,
                window: inner.window,
                totals: inner.totals,
                open_count: inner.open_count,
                total_open_ms: inner.total_open_ms,
            }
        };
        let value = match serde_json::to_value(&snapshot) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(breaker = %self.name, error = %e, "breaker snapshot failed");
                return;
            }
        };
        if let Err(e) = persistence.store(&format!("breaker.{}", self.name), value).await {
            tracing::warn!(breaker = %self.name, error = %e, "breaker persist failed");
        }
    }

    /// Best-effort restore; missing or malformed state leaves the breaker
    /// fresh.
    pub async fn hydrate(&self) {
        let Some(persistence) = &self.persistence else { return };
        let loaded = match persistence.load(&format!("breaker.{}", self.name)).await {
            Ok(Some(v)) => v,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(breaker = %self.name, error = %e, "breaker hydrate failed");
                return;
            }
        };
        let Ok(snapshot) = serde_json::from_value::<BreakerSnapshot>(loaded) else {
            tracing::warn!(breaker = %self.name, "discarding malformed breaker snapshot");
            return;
        };
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.state = snapshot.state;
        inner.window = snapshot.window;
        inner.totals = snapshot.totals;
        inner.open_count = snapshot.open_count;
        inner.total_open_ms = snapshot.total_open_ms;
        if snapshot.state == BreakerState::Open {
            inner.opened_at_ms = self.clock.now_millis();
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn breaker(config: BreakerConfig) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        (CircuitBreaker::with_clock(config, Arc::new(clock.clone())), clock)
    }

    fn config(failure: f64, min: u32, recovery_ms: u64, success: f64, probes: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: failure,
            min_requests: min,
            recovery: Duration::from_millis(recovery_ms),
            success_threshold: success,
            half_open_max: probes,
            ..BreakerConfig::default()
        }
    }

    #[test]
    fn stays_closed_below_min_requests() {
        let (breaker, _clock) = breaker(config(0.5, 5, 100, 0.5, 1));
        for _ in 0..4 {
            assert!(breaker.can_execute().is_allowed());
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn opens_at_failure_fraction() {
        let (breaker, _clock) = breaker(config(0.5, 4, 100, 0.5, 1));
        breaker.record_success();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(breaker.can_execute(), Admission::Rejected { .. }));
    }

    #[test]
    fn open_transitions_to_half_open_after_recovery() {
        let (breaker, clock) = breaker(config(0.5, 2, 100, 0.5, 1));
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_execute().is_allowed());
        clock.advance(150);
        assert!(breaker.can_execute().is_allowed());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_admits_bounded_probes() {
        let (breaker, clock) = breaker(config(0.5, 2, 100, 0.5, 2));
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(150);
        assert!(breaker.can_execute().is_allowed());
        assert!(breaker.can_execute().is_allowed());
        assert!(!breaker.can_execute().is_allowed());
    }

    #[test]
    fn half_open_waits_for_full_sample() {
        let (breaker, clock) = breaker(config(0.5, 2, 100, 0.5, 2));
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(150);
        assert!(breaker.can_execute().is_allowed());
        assert!(breaker.can_execute().is_allowed());
        breaker.record_success();
        // One probe still outstanding; the state must hold.
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_failure();
        // 1/2 successes meets the 0.5 threshold.
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn failed_probe_sample_reopens() {
        let (breaker, clock) = breaker(config(0.5, 2, 100, 0.6, 2));
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(150);
        assert!(breaker.can_execute().is_allowed());
        assert!(breaker.can_execute().is_allowed());
        breaker.record_success();
        breaker.record_failure();
        // 0.5 < 0.6 threshold.
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.metrics().open_count, 2);
    }

    #[test]
    fn never_closed_to_half_open() {
        let (breaker, clock) = breaker(config(0.5, 2, 100, 0.5, 1));
        clock.advance(10_000);
        // No failures recorded: repeated gating never leaves Closed.
        for _ in 0..10 {
            assert!(breaker.can_execute().is_allowed());
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn open_history_accumulates() {
        let (breaker, clock) = breaker(config(0.5, 2, 100, 0.5, 1));
        breaker.record_failure();
        breaker.record_failure();
        clock.advance(120);
        assert!(breaker.can_execute().is_allowed());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        let metrics = breaker.metrics();
        assert_eq!(metrics.open_count, 1);
        assert!(metrics.total_open_ms >= 120);
        assert_eq!(metrics.total_requests, 3);
        assert_eq!(metrics.failed_requests, 2);
        assert_eq!(metrics.successful_requests, 1);
    }

    #[test]
    fn disabled_breaker_never_opens() {
        let (breaker, _clock) = breaker(BreakerConfig::disabled());
        for _ in 0..1_000 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn attempt_window_opens_under_own_threshold() {
        let mut cfg = config(0.99, 1_000, 100, 0.5, 1);
        cfg.track_individual_attempts = true;
        cfg.attempt_failure_threshold = 0.6;
        cfg.min_requests = 5;
        let (breaker, _clock) = breaker(cfg);
        for _ in 0..2 {
            breaker.record_attempt(true);
        }
        for _ in 0..4 {
            breaker.record_attempt(false);
        }
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn execute_gates_and_records() {
        let (breaker, _clock) = breaker(config(0.5, 2, 10_000, 0.5, 1));
        for _ in 0..2 {
            let result: Result<(), ExecError> = breaker
                .execute(|| async {
                    Err(ExecError::Transport { status: Some(503), code: None, message: "x".into() })
                })
                .await;
            assert!(result.is_err());
        }
        let result: Result<i32, ExecError> = breaker.execute(|| async { Ok(7) }).await;
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test]
    async fn snapshot_round_trips_through_persistence() {
        use crate::persistence::MemoryPersistence;
        let store = MemoryPersistence::shared();
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::with_clock(config(0.5, 2, 100, 0.5, 1), Arc::new(clock))
            .named("api")
            .with_persistence(store.clone());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        breaker.persist().await;

        let clock2 = ManualClock::new();
        let revived = CircuitBreaker::with_clock(config(0.5, 2, 100, 0.5, 1), Arc::new(clock2))
            .named("api")
            .with_persistence(store);
        revived.hydrate().await;
        assert_eq!(revived.state(), BreakerState::Open);
        assert_eq!(revived.metrics().total_requests, 2);
    }
}
