//! Clock abstractions used by breakers, limiters, the buffer, and the scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Clock abstraction so timing can be faked in tests.
///
/// `now_millis` is a monotonic reading used for intervals (breaker recovery,
/// token refill). `epoch_millis` is wall-clock time used for log timestamps
/// and schedule computation.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now_millis(&self) -> u64;

    fn epoch_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Monotonic clock backed by `Instant::now()`; wall time from the system.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self { start: Instant::now() }
    }
}

impl Clock for MonotonicClock {
    fn now_millis(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Hand-advanced clock for deterministic tests.
///
/// Both readings move together: `advance` shifts the monotonic reading and the
/// epoch reading by the same amount.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
    epoch_base: i64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the wall clock at a specific epoch timestamp.
    pub fn starting_at_epoch(epoch_millis: i64) -> Self {
        Self { now: Arc::new(AtomicU64::new(0)), epoch_base: epoch_millis }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn epoch_millis(&self) -> i64 {
        self.epoch_base + self.now.load(Ordering::SeqCst) as i64
    }
}
