//! Transactional shared buffer
//!
//! The single place workflows keep mutable shared state. Mutations run one
//! at a time behind a fair lock, each against a snapshot: a mutator that
//! fails leaves the state untouched. Every commit (or failed attempt) emits
//! a log record; the ordered log replays deterministically through
//! caller-supplied handlers.

use crate::clock::{Clock, MonotonicClock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Buffer state is a plain string-keyed JSON map.
pub type BufferState = HashMap<String, Value>;

/// One transaction log record. The log is the only canonical persistence
/// format the system defines.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct TxRecord {
    pub tx_id: String,
    pub queued_at: i64,
    pub started_at: i64,
    pub finished_at: i64,
    pub duration_ms: u64,
    pub queue_wait_ms: u64,
    pub activity: String,
    pub hook_name: String,
    pub state_before: Value,
    pub state_after: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_context: Option<Value>,
}

/// Labels attached to a mutation for the log.
#[derive(Debug, Clone, Default)]
pub struct TxOptions {
    pub activity: String,
    pub hook_name: String,
    pub execution_context: Option<Value>,
}

impl TxOptions {
    pub fn new(activity: impl Into<String>, hook_name: impl Into<String>) -> Self {
        Self { activity: activity.into(), hook_name: hook_name.into(), execution_context: None }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.execution_context = Some(context);
        self
    }
}

/// Point-in-time buffer counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct BufferMetrics {
    pub transactions: u64,
    pub failed_transactions: u64,
    pub avg_commit_ms: u64,
    pub avg_queue_wait_ms: u64,
    pub keys: usize,
}

struct BufferInner {
    state: tokio::sync::Mutex<BufferState>,
    log: std::sync::Mutex<Vec<TxRecord>>,
    clock: Arc<dyn Clock>,
}

/// Cheaply cloneable handle to one buffer.
#[derive(Clone)]
pub struct SharedBuffer {
    inner: Arc<BufferInner>,
}

impl Default for SharedBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                state: tokio::sync::Mutex::new(BufferState::new()),
                log: std::sync::Mutex::new(Vec::new()),
                clock,
            }),
        }
    }

    pub fn with_initial_state(state: BufferState) -> Self {
        let buffer = Self::new();
        {
            let mut guard = buffer
                .inner
                .state
                .try_lock()
                .expect("freshly created buffer is uncontended");
            *guard = state;
        }
        buffer
    }

    /// Run one serialized mutation.
    ///
    /// The mutator receives a working copy; only a successful return swaps it
    /// in. The fair lock makes queued mutations commit in arrival order.
    pub async fn run<T, E, F>(&self, opts: TxOptions, mutator: F) -> Result<T, E>
    where
        F: FnOnce(&mut BufferState) -> Result<T, E>,
        E: std::fmt::Display,
    {
        let queued_at = self.inner.clock.epoch_millis();
        let queued_mono = self.inner.clock.now_millis();
        let mut state = self.inner.state.lock().await;
        let started_at = self.inner.clock.epoch_millis();
        let started_mono = self.inner.clock.now_millis();
        let queue_wait_ms = started_mono.saturating_sub(queued_mono);

        let state_before = snapshot(&state);
        let mut working = state.clone();
        let result = mutator(&mut working);

        let finished_at = self.inner.clock.epoch_millis();
        let duration_ms = self.inner.clock.now_millis().saturating_sub(started_mono);
        let record = TxRecord {
            tx_id: Uuid::new_v4().to_string(),
            queued_at,
            started_at,
            finished_at,
            duration_ms,
            queue_wait_ms,
            activity: opts.activity,
            hook_name: opts.hook_name,
            state_before,
            state_after: Value::Null,
            success: result.is_ok(),
            error_message: result.as_ref().err().map(|e| e.to_string()),
            execution_context: opts.execution_context,
        };

        match result {
            Ok(value) => {
                *state = working;
                let mut record = record;
                record.state_after = snapshot(&state);
                drop(state);
                self.push_record(record);
                Ok(value)
            }
            Err(err) => {
                // State untouched; after == before.
                let mut record = record;
                record.state_after = record.state_before.clone();
                drop(state);
                self.push_record(record);
                Err(err)
            }
        }
    }

    fn push_record(&self, record: TxRecord) {
        self.inner.log.lock().unwrap_or_else(|p| p.into_inner()).push(record);
    }

    /// Defensive copy of one key.
    pub async fn read(&self, key: &str) -> Option<Value> {
        self.inner.state.lock().await.get(key).cloned()
    }

    /// Defensive copy of the whole state.
    pub async fn state(&self) -> BufferState {
        self.inner.state.lock().await.clone()
    }

    /// Bulk replacement, serialized and logged like any other mutation.
    pub async fn set_state(&self, next: BufferState) {
        let _: Result<(), std::convert::Infallible> = self
            .run(TxOptions::new("set_state", "set_state"), move |state| {
                *state = next;
                Ok(())
            })
            .await;
    }

    /// Copy of the transaction log, in commit order.
    pub fn log(&self) -> Vec<TxRecord> {
        self.inner.log.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn metrics(&self) -> BufferMetrics {
        let log = self.inner.log.lock().unwrap_or_else(|p| p.into_inner());
        let transactions = log.len() as u64;
        let failed = log.iter().filter(|r| !r.success).count() as u64;
        let total_commit: u64 = log.iter().map(|r| r.duration_ms).sum();
        let total_wait: u64 = log.iter().map(|r| r.queue_wait_ms).sum();
        let keys = match self.inner.state.try_lock() {
            Ok(state) => state.len(),
            Err(_) => 0,
        };
        BufferMetrics {
            transactions,
            failed_transactions: failed,
            avg_commit_ms: if transactions == 0 { 0 } else { total_commit / transactions },
            avg_queue_wait_ms: if transactions == 0 { 0 } else { total_wait / transactions },
            keys,
        }
    }
}

impl std::fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("transactions", &self.metrics().transactions)
            .finish()
    }
}

fn snapshot(state: &BufferState) -> Value {
    Value::Object(state.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
}

fn snapshot_to_state(value: &Value) -> BufferState {
    match value {
        Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        _ => BufferState::new(),
    }
}

// --- Replay ---

/// Applies one logged mutation to the evolving state during replay.
pub type ReplayHandler =
    Arc<dyn Fn(&mut BufferState, &TxRecord) -> Result<(), String> + Send + Sync>;

/// Observer over replay progress.
pub type ReplayObserver = Arc<dyn Fn(&TxRecord) + Send + Sync>;

#[derive(Default)]
pub struct ReplayOptions {
    pub handlers: HashMap<String, ReplayHandler>,
    pub allow_unknown_hooks: bool,
    pub activity_filter: Option<Arc<dyn Fn(&TxRecord) -> bool + Send + Sync>>,
    pub on_apply: Option<ReplayObserver>,
    pub on_skip: Option<ReplayObserver>,
    pub on_error: Option<ReplayObserver>,
}

impl ReplayOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler(mut self, hook_name: impl Into<String>, handler: ReplayHandler) -> Self {
        self.handlers.insert(hook_name.into(), handler);
        self
    }

    pub fn allow_unknown_hooks(mut self, allow: bool) -> Self {
        self.allow_unknown_hooks = allow;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("no replay handler registered for hook '{0}'")]
    UnknownHook(String),
    #[error("replay handler for hook '{hook}' failed on tx {tx_id}: {message}")]
    HandlerFailed { hook: String, tx_id: String, message: String },
}

/// Rebuild a buffer by applying handlers over an ordered log.
///
/// Records are ordered by `started_at` then `tx_id`, deduplicated by `tx_id`;
/// failed records never changed state, so they are skipped. When every
/// referenced handler is deterministic, the result equals the original final
/// state.
pub fn replay(
    initial: BufferState,
    log: &[TxRecord],
    opts: &ReplayOptions,
) -> Result<SharedBuffer, ReplayError> {
    let mut ordered: Vec<&TxRecord> = log.iter().collect();
    ordered.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.tx_id.cmp(&b.tx_id)));

    let mut seen = HashSet::new();
    let mut state = initial;
    for record in ordered {
        if !seen.insert(record.tx_id.clone()) {
            continue;
        }
        if !record.success {
            notify(&opts.on_skip, record);
            continue;
        }
        if let Some(filter) = &opts.activity_filter {
            if !filter(record) {
                notify(&opts.on_skip, record);
                continue;
            }
        }
        match opts.handlers.get(&record.hook_name) {
            Some(handler) => {
                if let Err(message) = handler(&mut state, record) {
                    notify(&opts.on_error, record);
                    return Err(ReplayError::HandlerFailed {
                        hook: record.hook_name.clone(),
                        tx_id: record.tx_id.clone(),
                        message,
                    });
                }
                notify(&opts.on_apply, record);
            }
            None if opts.allow_unknown_hooks => notify(&opts.on_skip, record),
            None => {
                notify(&opts.on_error, record);
                return Err(ReplayError::UnknownHook(record.hook_name.clone()));
            }
        }
    }
    Ok(SharedBuffer::with_initial_state(state))
}

/// Replay using each record's own `state_after` snapshot; useful when the
/// original hooks are unavailable but the log is trusted.
pub fn snapshot_handler() -> ReplayHandler {
    Arc::new(|state, record| {
        *state = snapshot_to_state(&record.state_after);
        Ok(())
    })
}

fn notify(observer: &Option<ReplayObserver>, record: &TxRecord) {
    if let Some(observer) = observer {
        observer(record);
    }
}
