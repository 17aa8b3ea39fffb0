//! Concurrency limiting with a FIFO wait queue
//!
//! Unlike a rejecting bulkhead, callers suspend until a slot frees up or
//! their cancellation token fires. Queue depth and wait times are tracked.

use crate::error::ExecError;
use crate::persistence::StatePersistence;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

/// Point-in-time limiter counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct ConcurrencyMetrics {
    pub max_concurrent: usize,
    pub in_flight: usize,
    pub waiting: usize,
    pub peak_queue: usize,
    pub acquired: u64,
    pub avg_wait_ms: u64,
}

/// FIFO semaphore shared across attempts or across a whole gateway.
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    waiting: AtomicUsize,
    peak_queue: AtomicUsize,
    acquired: AtomicU64,
    total_wait_ms: AtomicU64,
    name: String,
    persistence: Option<Arc<dyn StatePersistence>>,
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("semaphore", &self.semaphore)
            .field("max_concurrent", &self.max_concurrent)
            .field("waiting", &self.waiting)
            .field("peak_queue", &self.peak_queue)
            .field("acquired", &self.acquired)
            .field("total_wait_ms", &self.total_wait_ms)
            .field("name", &self.name)
            .field("persistence", &self.persistence.is_some())
            .finish()
    }
}

/// A held slot; releasing is dropping.
#[derive(Debug)]
pub struct ConcurrencySlot {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            waiting: AtomicUsize::new(0),
            peak_queue: AtomicUsize::new(0),
            acquired: AtomicU64::new(0),
            total_wait_ms: AtomicU64::new(0),
            name: "concurrency".to_string(),
            persistence: None,
        }
    }

    pub fn shared(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self::new(max_concurrent))
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_persistence(mut self, persistence: Arc<dyn StatePersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Save the accumulated counters; in-flight slots are process-local and
    /// never persisted.
    pub async fn persist(&self) {
        let Some(persistence) = &self.persistence else { return };
        let snapshot = serde_json::json!({
            "peak_queue": self.peak_queue.load(Ordering::SeqCst),
            "acquired": self.acquired.load(Ordering::Relaxed),
            "total_wait_ms": self.total_wait_ms.load(Ordering::Relaxed),
        });
        if let Err(e) = persistence.store(&format!("concurrency.{}", self.name), snapshot).await {
            tracing::warn!(limiter = %self.name, error = %e, "concurrency persist failed");
        }
    }

    pub async fn hydrate(&self) {
        let Some(persistence) = &self.persistence else { return };
        let loaded = match persistence.load(&format!("concurrency.{}", self.name)).await {
            Ok(Some(v)) => v,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(limiter = %self.name, error = %e, "concurrency hydrate failed");
                return;
            }
        };
        let read = |name: &str| loaded.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
        self.peak_queue.store(read("peak_queue") as usize, Ordering::SeqCst);
        self.acquired.store(read("acquired"), Ordering::Relaxed);
        self.total_wait_ms.store(read("total_wait_ms"), Ordering::Relaxed);
    }

    /// Wait for a slot. Tokio's semaphore hands out permits in request
    /// order, which gives the FIFO guarantee.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<ConcurrencySlot, ExecError> {
        let started = Instant::now();
        let queued = self.waiting.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_queue.fetch_max(queued, Ordering::SeqCst);

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                return Err(ExecError::Cancelled);
            }
            permit = self.semaphore.clone().acquire_owned() => permit,
        };
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        match permit {
            Ok(permit) => {
                self.acquired.fetch_add(1, Ordering::Relaxed);
                self.total_wait_ms
                    .fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                Ok(ConcurrencySlot { _permit: permit })
            }
            // The semaphore is never closed while the limiter is alive.
            Err(_) => Err(ExecError::Cancelled),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn metrics(&self) -> ConcurrencyMetrics {
        let acquired = self.acquired.load(Ordering::Relaxed);
        let total_wait = self.total_wait_ms.load(Ordering::Relaxed);
        ConcurrencyMetrics {
            max_concurrent: self.max_concurrent,
            in_flight: self.in_flight(),
            waiting: self.waiting.load(Ordering::SeqCst),
            peak_queue: self.peak_queue.load(Ordering::SeqCst),
            acquired,
            avg_wait_ms: if acquired == 0 { 0 } else { total_wait / acquired },
        }
    }
}
