//! Recurring job execution
//!
//! A tick loop computes due times per schedule, feeds a bounded queue
//! (overflow is dropped and counted), and a worker pool drains it. Runs are
//! bounded by an execution timeout and retried per policy. State survives
//! restarts through the persistence collaborator; with a distributed adapter
//! configured, only the elected leader dispatches while followers keep their
//! state warm and campaign on lease loss.

use crate::buffer::SharedBuffer;
use crate::clock::{Clock, MonotonicClock};
use crate::distributed::DistributedAdapter;
use crate::error::{ConfigError, ExecError};
use crate::infra::Infra;
use crate::metrics::{validate_scheduler, MetricsGuardrails, SchedulerMetrics, ValidationReport};
use crate::persistence::StatePersistence;
use crate::sleeper::{Sleeper, TokioSleeper};
use chrono::TimeZone;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// When a job should run.
#[derive(Clone)]
pub enum Schedule {
    Cron { schedule: cron::Schedule, timezone: chrono_tz::Tz },
    Interval { every: Duration, start_at: Option<i64> },
    At(i64),
    AtList(Vec<i64>),
}

impl Schedule {
    /// Parse a cron expression (seconds field included) with an optional
    /// IANA timezone; defaults to UTC.
    pub fn cron(expr: &str, timezone: Option<&str>) -> Result<Self, ConfigError> {
        let schedule = cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidCron {
            expr: expr.to_string(),
            message: e.to_string(),
        })?;
        let timezone = match timezone {
            Some(name) => name
                .parse::<chrono_tz::Tz>()
                .map_err(|_| ConfigError::UnknownTimezone(name.to_string()))?,
            None => chrono_tz::Tz::UTC,
        };
        Ok(Schedule::Cron { schedule, timezone })
    }

    pub fn interval(every: Duration) -> Self {
        Schedule::Interval { every, start_at: None }
    }

    pub fn at(epoch_ms: i64) -> Self {
        Schedule::At(epoch_ms)
    }

    pub fn at_list(mut timestamps: Vec<i64>) -> Self {
        timestamps.sort_unstable();
        Schedule::AtList(timestamps)
    }

    /// Next due time strictly after `now_ms`, given the job's remaining
    /// timestamp list. `None` means the schedule is exhausted.
    pub fn next_run_after(&self, now_ms: i64, remaining: &[i64]) -> Option<i64> {
        match self {
            Schedule::Cron { schedule, timezone } => {
                let now = timezone.timestamp_millis_opt(now_ms).single()?;
                schedule.after(&now).next().map(|dt| dt.timestamp_millis())
            }
            Schedule::Interval { every, start_at } => match start_at {
                Some(start) if *start > now_ms => Some(*start),
                _ => Some(now_ms + every.as_millis() as i64),
            },
            Schedule::At(when) => Some((*when).max(now_ms)),
            Schedule::AtList(_) => remaining.first().copied(),
        }
    }

    fn initial_remaining(&self) -> Vec<i64> {
        match self {
            Schedule::AtList(list) => list.clone(),
            _ => Vec::new(),
        }
    }

    fn is_one_shot(&self) -> bool {
        matches!(self, Schedule::At(_))
    }
}

impl std::fmt::Debug for Schedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Schedule::Cron { timezone, .. } => {
                f.debug_struct("Cron").field("timezone", timezone).finish()
            }
            Schedule::Interval { every, start_at } => f
                .debug_struct("Interval")
                .field("every", every)
                .field("start_at", start_at)
                .finish(),
            Schedule::At(t) => f.debug_tuple("At").field(t).finish(),
            Schedule::AtList(l) => f.debug_tuple("AtList").field(&l.len()).finish(),
        }
    }
}

/// What a job handler receives on every run.
#[derive(Clone)]
pub struct RunContext {
    pub job_id: String,
    pub run_number: u64,
    pub scheduled_for: i64,
    pub buffer: Option<SharedBuffer>,
    pub infra: Infra,
    pub cancel: CancellationToken,
}

pub type JobHandler =
    Arc<dyn Fn(RunContext) -> BoxFuture<'static, Result<Value, ExecError>> + Send + Sync>;

/// One registered job.
#[derive(Clone)]
pub struct JobSpec {
    pub id: String,
    pub schedule: Schedule,
    pub handler: JobHandler,
    /// Stop after the first completed run even for recurring schedules.
    pub run_once: bool,
}

impl JobSpec {
    pub fn new<F, Fut>(id: impl Into<String>, schedule: Schedule, handler: F) -> Self
    where
        F: Fn(RunContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ExecError>> + Send + 'static,
    {
        Self {
            id: id.into(),
            schedule,
            handler: Arc::new(move |ctx| Box::pin(handler(ctx))),
            run_once: false,
        }
    }

    pub fn once(mut self) -> Self {
        self.run_once = true;
        self
    }
}

/// Retry policy for failed job runs.
#[derive(Debug, Clone)]
pub struct JobRetry {
    pub attempts: u32,
    pub delay: Duration,
    pub backoff_multiplier: f64,
    pub max_delay: Duration,
}

impl Default for JobRetry {
    fn default() -> Self {
        Self {
            attempts: 1,
            delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl JobRetry {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let raw = self.delay.as_secs_f64() * factor;
        Duration::from_secs_f64(raw).min(self.max_delay)
    }
}

/// Leadership wiring for multi-process deployments.
#[derive(Clone)]
pub struct LeaderElection {
    pub adapter: Arc<dyn DistributedAdapter>,
    pub group: String,
    pub candidate_id: String,
    pub lease: Duration,
    /// Fires when a held leadership is lost (lease expiry or partition).
    pub on_leadership_lost: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Scheduler construction knobs.
#[derive(Clone)]
pub struct SchedulerConfig {
    pub max_parallel: usize,
    pub tick_interval: Duration,
    pub queue_limit: usize,
    pub retry: Option<JobRetry>,
    pub execution_timeout: Option<Duration>,
    pub persistence: Option<Arc<dyn StatePersistence>>,
    pub persistence_debounce: Duration,
    pub shared_buffer: Option<SharedBuffer>,
    pub shared_infra: Infra,
    pub guardrails: Option<Arc<MetricsGuardrails>>,
    pub leader_election: Option<LeaderElection>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            tick_interval: Duration::from_millis(500),
            queue_limit: 128,
            retry: None,
            execution_timeout: None,
            persistence: None,
            persistence_debounce: Duration::from_millis(250),
            shared_buffer: None,
            shared_infra: Infra::default(),
            guardrails: None,
            leader_election: None,
        }
    }
}

struct JobState {
    spec: JobSpec,
    next_run_at: Option<i64>,
    last_run_at: Option<i64>,
    remaining: Vec<i64>,
    active: bool,
    retry_attempts: u32,
    runs: u64,
}

struct QueuedRun {
    job_id: String,
    scheduled_for: i64,
    enqueued_mono: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    runs: AtomicU64,
    total_exec_ms: AtomicU64,
    total_queue_delay_ms: AtomicU64,
}

struct SchedulerInner {
    config: SchedulerConfig,
    jobs: tokio::sync::Mutex<HashMap<String, JobState>>,
    queue: Mutex<VecDeque<QueuedRun>>,
    counters: Counters,
    running: AtomicUsize,
    shutdown: CancellationToken,
    started: AtomicBool,
    is_leader: AtomicBool,
    dirty: AtomicBool,
    last_save_mono: AtomicU64,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

/// The scheduler. Cheap to clone; `start` spawns the tick loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_parts(config, Arc::new(MonotonicClock::default()), Arc::new(TokioSleeper))
    }

    pub fn with_parts(
        config: SchedulerConfig,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                jobs: tokio::sync::Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                counters: Counters::default(),
                running: AtomicUsize::new(0),
                shutdown: CancellationToken::new(),
                started: AtomicBool::new(false),
                is_leader: AtomicBool::new(false),
                dirty: AtomicBool::new(false),
                last_save_mono: AtomicU64::new(0),
                clock,
                sleeper,
            }),
        }
    }

    pub async fn add_job(&self, spec: JobSpec) -> Result<(), ConfigError> {
        let mut jobs = self.inner.jobs.lock().await;
        if jobs.contains_key(&spec.id) {
            return Err(ConfigError::DuplicateJob(spec.id));
        }
        let now = self.inner.clock.epoch_millis();
        let remaining = spec.schedule.initial_remaining();
        let next_run_at = spec.schedule.next_run_after(now, &remaining);
        jobs.insert(
            spec.id.clone(),
            JobState {
                spec,
                next_run_at,
                last_run_at: None,
                remaining,
                active: false,
                retry_attempts: 0,
                runs: 0,
            },
        );
        self.inner.dirty.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn remove_job(&self, id: &str) -> bool {
        let removed = self.inner.jobs.lock().await.remove(id).is_some();
        if removed {
            self.inner.dirty.store(true, Ordering::SeqCst);
        }
        removed
    }

    /// Spawn the tick loop. Idempotent.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.load_persisted().await;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.sleeper.sleep(inner.config.tick_interval) => {}
                }
                inner.clone().tick().await;
            }
            inner.flush_persistence().await;
        });
    }

    /// Stop dispatching and flush persisted state. In-flight runs see their
    /// cancellation token fire.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.flush_persistence().await;
    }

    pub fn is_leader(&self) -> bool {
        // Without an election configured, a started scheduler leads itself.
        self.inner.config.leader_election.is_none()
            || self.inner.is_leader.load(Ordering::SeqCst)
    }

    pub async fn metrics(&self) -> SchedulerMetrics {
        let jobs = self.inner.jobs.lock().await;
        let completed = self.inner.counters.completed.load(Ordering::Relaxed);
        let failed = self.inner.counters.failed.load(Ordering::Relaxed);
        let runs = self.inner.counters.runs.load(Ordering::Relaxed);
        let finished = completed + failed;
        SchedulerMetrics {
            total_jobs: jobs.len() as u64,
            queued: self.inner.queue.lock().unwrap_or_else(|p| p.into_inner()).len() as u64,
            running: self.inner.running.load(Ordering::SeqCst) as u64,
            completed,
            failed,
            dropped: self.inner.counters.dropped.load(Ordering::Relaxed),
            success_rate: if finished == 0 { 1.0 } else { completed as f64 / finished as f64 },
            avg_execution_ms: if runs == 0 {
                0
            } else {
                self.inner.counters.total_exec_ms.load(Ordering::Relaxed) / runs
            },
            avg_queue_delay_ms: if runs == 0 {
                0
            } else {
                self.inner.counters.total_queue_delay_ms.load(Ordering::Relaxed) / runs
            },
        }
    }

    pub async fn validate_metrics(&self) -> Option<ValidationReport> {
        let guardrails = self.inner.config.guardrails.clone()?;
        Some(validate_scheduler(&self.metrics().await, &guardrails.scheduler))
    }
}

impl SchedulerInner {
    async fn tick(self: Arc<Self>) {
        if !self.ensure_leadership().await {
            return;
        }
        self.enqueue_due_jobs().await;
        self.clone().drain_queue().await;
        self.maybe_persist().await;
    }

    /// Campaign every tick; the campaign doubles as the heartbeat since an
    /// elected leader re-extends its own lease.
    async fn ensure_leadership(&self) -> bool {
        let Some(election) = &self.config.leader_election else { return true };
        let was_leader = self.is_leader.load(Ordering::SeqCst);
        let elected = match election
            .adapter
            .campaign(&election.group, &election.candidate_id, election.lease)
            .await
        {
            Ok(outcome) => outcome.is_elected(),
            Err(e) => {
                tracing::warn!(error = %e, "leadership campaign failed");
                false
            }
        };
        self.is_leader.store(elected, Ordering::SeqCst);
        if was_leader && !elected {
            tracing::warn!(group = %election.group, "leadership lost");
            if let Some(callback) = &election.on_leadership_lost {
                callback();
            }
        }
        elected
    }

    async fn enqueue_due_jobs(&self) {
        let now = self.clock.epoch_millis();
        let mut jobs = self.jobs.lock().await;
        for (id, job) in jobs.iter_mut() {
            if job.active {
                continue;
            }
            let Some(due) = job.next_run_at else { continue };
            if due > now {
                continue;
            }
            let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
            if queue.len() >= self.config.queue_limit {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(job = %id, "queue full; run dropped");
            } else {
                queue.push_back(QueuedRun {
                    job_id: id.clone(),
                    scheduled_for: due,
                    enqueued_mono: self.clock.now_millis(),
                });
                job.active = true;
            }
            // The consumed occurrence advances the schedule either way.
            if let Schedule::AtList(_) = job.spec.schedule {
                if !job.remaining.is_empty() {
                    job.remaining.remove(0);
                }
            }
            job.next_run_at = if job.spec.schedule.is_one_shot() || job.spec.run_once {
                None
            } else {
                job.spec.schedule.next_run_after(now, &job.remaining)
            };
            self.dirty.store(true, Ordering::SeqCst);
        }
    }

    async fn drain_queue(self: Arc<Self>) {
        loop {
            if self.running.load(Ordering::SeqCst) >= self.config.max_parallel {
                return;
            }
            let run = {
                let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
                queue.pop_front()
            };
            let Some(run) = run else { return };
            self.running.fetch_add(1, Ordering::SeqCst);
            let inner = self.clone();
            tokio::spawn(async move {
                inner.execute(run).await;
                inner.running.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    async fn execute(&self, run: QueuedRun) {
        let queue_delay = self.clock.now_millis().saturating_sub(run.enqueued_mono);
        let (handler, run_number) = {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.get_mut(&run.job_id) else {
                return;
            };
            job.runs += 1;
            (job.spec.handler.clone(), job.runs)
        };

        let retry = self.config.retry.clone().unwrap_or_default();
        let started_mono = self.clock.now_millis();
        let mut attempt = 0u32;
        let succeeded = loop {
            attempt += 1;
            let ctx = RunContext {
                job_id: run.job_id.clone(),
                run_number,
                scheduled_for: run.scheduled_for,
                buffer: self.config.shared_buffer.clone(),
                infra: self.config.shared_infra.clone(),
                cancel: self.shutdown.child_token(),
            };
            let fut = (handler)(ctx);
            let result = match self.config.execution_timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(ExecError::Timeout { elapsed: limit, limit }),
                },
                None => fut.await,
            };
            match result {
                Ok(_) => break true,
                Err(error) => {
                    tracing::warn!(job = %run.job_id, attempt, error = %error, "job run failed");
                    if attempt >= retry.attempts.max(1) || self.shutdown.is_cancelled() {
                        break false;
                    }
                    let delay = retry.delay_for(attempt);
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => break false,
                        _ = self.sleeper.sleep(delay) => {}
                    }
                }
            }
        };

        let exec_ms = self.clock.now_millis().saturating_sub(started_mono);
        self.counters.runs.fetch_add(1, Ordering::Relaxed);
        self.counters.total_exec_ms.fetch_add(exec_ms, Ordering::Relaxed);
        self.counters.total_queue_delay_ms.fetch_add(queue_delay, Ordering::Relaxed);
        if succeeded {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }

        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(&run.job_id) {
            job.active = false;
            job.last_run_at = Some(self.clock.epoch_millis());
            job.retry_attempts = if succeeded { 0 } else { attempt };
            if job.spec.run_once {
                job.next_run_at = None;
            }
        }
        drop(jobs);
        self.dirty.store(true, Ordering::SeqCst);
    }

    async fn maybe_persist(&self) {
        if self.config.persistence.is_none() || !self.dirty.load(Ordering::SeqCst) {
            return;
        }
        let now = self.clock.now_millis();
        let last = self.last_save_mono.load(Ordering::SeqCst);
        if now.saturating_sub(last) < self.config.persistence_debounce.as_millis() as u64 {
            return;
        }
        self.flush_persistence().await;
    }

    async fn flush_persistence(&self) {
        let Some(persistence) = &self.config.persistence else { return };
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return;
        }
        let snapshot = self.snapshot().await;
        if let Err(e) = persistence.store("scheduler.state", snapshot).await {
            tracing::warn!(error = %e, "scheduler state save failed");
            self.dirty.store(true, Ordering::SeqCst);
        }
        self.last_save_mono.store(self.clock.now_millis(), Ordering::SeqCst);
    }

    async fn snapshot(&self) -> Value {
        let jobs = self.jobs.lock().await;
        let job_states: serde_json::Map<String, Value> = jobs
            .iter()
            .map(|(id, job)| {
                (
                    id.clone(),
                    json!({
                        "next_run_at": job.next_run_at,
                        "last_run_at": job.last_run_at,
                        "remaining": job.remaining,
                        "retry_attempts": job.retry_attempts,
                        "runs": job.runs,
                    }),
                )
            })
            .collect();
        json!({
            "jobs": Value::Object(job_states),
            "counters": {
                "completed": self.counters.completed.load(Ordering::Relaxed),
                "failed": self.counters.failed.load(Ordering::Relaxed),
                "dropped": self.counters.dropped.load(Ordering::Relaxed),
                "runs": self.counters.runs.load(Ordering::Relaxed),
            }
        })
    }

    async fn load_persisted(&self) {
        let Some(persistence) = &self.config.persistence else { return };
        let state = match persistence.load("scheduler.state").await {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(error = %e, "scheduler state load failed");
                return;
            }
        };
        let mut jobs = self.jobs.lock().await;
        if let Some(saved_jobs) = state.get("jobs").and_then(|j| j.as_object()) {
            for (id, saved) in saved_jobs {
                if let Some(job) = jobs.get_mut(id) {
                    job.last_run_at = saved.get("last_run_at").and_then(|v| v.as_i64());
                    job.runs = saved.get("runs").and_then(|v| v.as_u64()).unwrap_or(0);
                    job.retry_attempts =
                        saved.get("retry_attempts").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                    if let Some(remaining) = saved.get("remaining").and_then(|v| v.as_array()) {
                        job.remaining = remaining.iter().filter_map(|v| v.as_i64()).collect();
                        if let Schedule::AtList(_) = job.spec.schedule {
                            job.next_run_at = job.remaining.first().copied();
                        }
                    }
                }
            }
        }
        if let Some(counters) = state.get("counters") {
            let load = |name: &str| counters.get(name).and_then(|v| v.as_u64()).unwrap_or(0);
            self.counters.completed.store(load("completed"), Ordering::Relaxed);
            self.counters.failed.store(load("failed"), Ordering::Relaxed);
            self.counters.dropped.store(load("dropped"), Ordering::Relaxed);
            self.counters.runs.store(load("runs"), Ordering::Relaxed);
        }
    }
}
