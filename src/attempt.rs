//! The per-leaf retry loop
//!
//! One operation runs through: pre-execution hook, then per attempt: cache
//! lookup, circuit gate, rate and concurrency gates, trial-mode injection,
//! invocation under its deadline, outcome classification, breaker recording,
//! guarded observer hooks, and backoff. Hook, cache, and persistence failures
//! never surface as operation failures.

use crate::clock::{Clock, MonotonicClock};
use crate::config::EffectiveConfig;
use crate::error::ExecError;
use crate::hooks::{AnalyzerInput, AttemptOutcome, FinalErrorInput, FuncContext, PreExecutionInput};
use crate::http::{HttpCall, HttpResponse};
use crate::metrics::{validate_request, RequestMetrics, ValidationReport};
use crate::operation::{Operation, OperationKind};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::http::Transport;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One attempt's outcome, in attempt order inside the report logs.
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub ok: bool,
    pub retryable: bool,
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: i64,
    pub duration_ms: u64,
    pub from_cache: bool,
}

/// Final outcome of one leaf.
#[derive(Debug, Clone, Default)]
pub struct OperationReport {
    pub operation_id: String,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ExecError>,
    /// The final-error analyzer swallowed the failure.
    pub suppressed: bool,
    /// `throw_on_failed_error_analysis` asked for this failure to be raised.
    pub should_raise: bool,
    pub terminated_early: bool,
    pub error_log: Vec<AttemptRecord>,
    pub success_log: Vec<AttemptRecord>,
    pub metrics: RequestMetrics,
    pub validation: Option<ValidationReport>,
}

impl OperationReport {
    fn new(operation_id: &str) -> Self {
        Self { operation_id: operation_id.to_string(), ..Self::default() }
    }

    /// Convert into `Err` when the report was marked for raising.
    pub fn into_result(self) -> Result<OperationReport, ExecError> {
        if self.should_raise {
            Err(self.error.clone().unwrap_or(ExecError::Func {
                message: "final error analysis failed".into(),
            }))
        } else {
            Ok(self)
        }
    }
}

struct InvokeSuccess {
    status: Option<u16>,
    body: Value,
    response: Option<HttpResponse>,
}

/// Runs single operations. Cheap to clone; engines share one.
#[derive(Clone)]
pub struct AttemptRunner {
    transport: Option<Arc<dyn Transport>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    rng: Arc<Mutex<StdRng>>,
}

impl Default for AttemptRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl AttemptRunner {
    pub fn new() -> Self {
        Self {
            transport: None,
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            rng: Arc::new(Mutex::new(StdRng::from_os_rng())),
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Deterministic jitter and trial-mode rolls for tests.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed)));
        self
    }

    pub fn transport(&self) -> Option<Arc<dyn Transport>> {
        self.transport.clone()
    }

    /// Run one operation to completion under the resolved configuration.
    pub async fn run(
        &self,
        op: &Operation,
        cfg: &EffectiveConfig,
        cancel: &CancellationToken,
    ) -> OperationReport {
        let mut report = OperationReport::new(&op.id);
        if let Err(e) = cfg.validate() {
            report.error = Some(ExecError::Func { message: e.to_string() });
            return report;
        }
        let backoff = match cfg.backoff() {
            Ok(b) => b,
            Err(e) => {
                report.error = Some(ExecError::Func { message: e.to_string() });
                return report;
            }
        };

        let started_mono = self.clock.now_millis();
        let mut call = op.call().map(|c| merged_call(c, cfg));

        // Pre-execution hook gates the whole loop.
        if let Some(pre) = &cfg.pre_execution {
            let input = PreExecutionInput {
                operation_id: op.id.clone(),
                buffer: cfg.buffer.clone(),
                params: cfg.hook_params.clone(),
            };
            match pre(input).await {
                Ok(Some(overrides)) if cfg.apply_pre_execution_overrides => {
                    if let Some(call) = call.as_mut() {
                        apply_overrides(call, overrides);
                    }
                }
                Ok(_) => {}
                Err(message) => {
                    tracing::warn!(operation = %op.id, error = %message, "pre-execution hook failed");
                    if !cfg.continue_on_pre_execution_failure {
                        report.error =
                            Some(ExecError::Hook { hook: "pre_execution".into(), message });
                        self.finish(op, cfg, &mut report, started_mono).await;
                        return report;
                    }
                }
            }
        }

        let mut last_error: Option<ExecError> = None;
        for attempt in 1..=cfg.attempts {
            if cancel.is_cancelled() {
                report.terminated_early = true;
                last_error = Some(ExecError::Cancelled);
                break;
            }

            // Cache consultation short-circuits everything else.
            if let (Some(cache), Some(call)) = (&cfg.infra.cache, call.as_ref()) {
                if cache.admits(call) {
                    if let Some(entry) = cache.get(&cache.derive_key(call)) {
                        // A hit still queues at the rate and concurrency
                        // gates unless bypass is on.
                        if !cfg.cache_hits_bypass_gates {
                            if let Some(limiter) = &cfg.infra.rate_limiter {
                                if let Err(error) = limiter.acquire(cancel).await {
                                    report.terminated_early = true;
                                    last_error = Some(error);
                                    break;
                                }
                            }
                            if let Some(limiter) = &cfg.infra.concurrency {
                                match limiter.acquire(cancel).await {
                                    // Released immediately; a hit performs
                                    // no further work.
                                    Ok(slot) => drop(slot),
                                    Err(error) => {
                                        report.terminated_early = true;
                                        last_error = Some(error);
                                        break;
                                    }
                                }
                            }
                        }
                        let record = AttemptRecord {
                            attempt,
                            ok: true,
                            retryable: false,
                            status_code: Some(entry.status),
                            body: Some(entry.body.clone()),
                            error: None,
                            timestamp: self.clock.epoch_millis(),
                            duration_ms: 0,
                            from_cache: true,
                        };
                        report.success = true;
                        report.data = Some(entry.body);
                        report.metrics.from_cache = true;
                        report.success_log.push(record);
                        self.finish(op, cfg, &mut report, started_mono).await;
                        return report;
                    }
                }
            }

            let attempt_started = self.clock.now_millis();
            let (outcome, invoked) =
                self.attempt_once(op, call.as_ref(), attempt, cfg, started_mono, cancel).await;
            let duration_ms = self.clock.now_millis().saturating_sub(attempt_started);

            match outcome {
                Ok(success) => {
                    if invoked {
                        if let Some(breaker) = &cfg.infra.breaker {
                            breaker.record_success();
                            breaker.record_attempt(true);
                        }
                    }
                    let record = AttemptRecord {
                        attempt,
                        ok: true,
                        retryable: false,
                        status_code: success.status,
                        body: Some(success.body.clone()),
                        error: None,
                        timestamp: self.clock.epoch_millis(),
                        duration_ms,
                        from_cache: false,
                    };
                    if cfg.log_attempts {
                        tracing::debug!(operation = %op.id, attempt, status = ?success.status, "attempt succeeded");
                    }
                    self.dispatch_success(op, cfg, &record).await;
                    report.success = true;
                    report.data = Some(success.body);
                    report.success_log.push(record);
                    if !cfg.perform_all_attempts {
                        break;
                    }
                }
                Err(error) => {
                    let mut retryable = error.is_retryable();
                    // Demotion makes an otherwise transient failure terminal.
                    if retryable && invoked {
                        let demote = {
                            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
                            cfg.trial.demote_retry(&mut *rng)
                        };
                        if demote {
                            retryable = false;
                        }
                    }
                    if invoked {
                        if let Some(breaker) = &cfg.infra.breaker {
                            breaker.record_failure();
                            breaker.record_attempt(false);
                        }
                    }
                    let cancelled = error.is_cancelled();
                    let record = AttemptRecord {
                        attempt,
                        ok: false,
                        retryable,
                        status_code: error.status(),
                        body: None,
                        error: Some(error.to_string()),
                        timestamp: self.clock.epoch_millis(),
                        duration_ms,
                        from_cache: false,
                    };
                    if cfg.log_attempts {
                        tracing::debug!(operation = %op.id, attempt, error = %error, "attempt failed");
                    }
                    self.dispatch_error(op, cfg, &record).await;
                    report.error_log.push(record);
                    last_error = Some(error);
                    if cancelled {
                        report.terminated_early = true;
                        break;
                    }
                    if !retryable {
                        break;
                    }
                }
            }

            // Backoff before the next attempt, cancellable.
            if attempt < cfg.attempts {
                let wait = {
                    let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
                    backoff.jittered_delay(attempt as usize, &mut *rng)
                };
                if !wait.is_zero() {
                    let interrupted = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => true,
                        _ = self.sleeper.sleep(wait) => false,
                    };
                    if interrupted {
                        report.terminated_early = true;
                        if !report.success {
                            last_error = Some(ExecError::Cancelled);
                        }
                        break;
                    }
                }
            }
        }

        if !report.success {
            let attempts_made = report.error_log.len() as u32;
            let error = match last_error {
                Some(ExecError::Cancelled) => Some(ExecError::Cancelled),
                Some(err) if attempts_made > 1 => Some(ExecError::AttemptsExhausted {
                    attempts: attempts_made as usize,
                    last: Box::new(err),
                }),
                Some(err) => Some(err),
                None => None,
            };
            report.error = error;
            self.final_error_pass(op, cfg, &mut report).await;
        }

        self.finish(op, cfg, &mut report, started_mono).await;
        report
    }

    /// One gated, classified invocation. The `bool` says whether the
    /// operation (or a synthetic stand-in) actually ran; gate rejections
    /// must not feed the breaker.
    async fn attempt_once(
        &self,
        op: &Operation,
        call: Option<&HttpCall>,
        attempt: u32,
        cfg: &EffectiveConfig,
        started_mono: u64,
        cancel: &CancellationToken,
    ) -> (Result<InvokeSuccess, ExecError>, bool) {
        if let Some(breaker) = &cfg.infra.breaker {
            if let crate::breaker::Admission::Rejected { open_for } = breaker.can_execute() {
                return (Err(ExecError::CircuitOpen { open_for }), false);
            }
        }

        // Both gates release on drop, whatever the outcome.
        if let Some(limiter) = &cfg.infra.rate_limiter {
            if let Err(e) = limiter.acquire(cancel).await {
                return (Err(e), false);
            }
        }
        let _slot = match &cfg.infra.concurrency {
            Some(limiter) => match limiter.acquire(cancel).await {
                Ok(slot) => Some(slot),
                Err(e) => return (Err(e), false),
            },
            None => None,
        };

        let inject = {
            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
            cfg.trial.inject_failure(&mut *rng)
        };
        if inject {
            return (Err(ExecError::Injected { retryable: true }), true);
        }

        let deadline = self.deadline(call, cfg, started_mono);
        if deadline == Some(Duration::ZERO) {
            return (
                Err(ExecError::Timeout { elapsed: Duration::ZERO, limit: Duration::ZERO }),
                false,
            );
        }

        let result = self.invoke(op, call, attempt, cfg, deadline, cancel).await;
        let result = match result {
            Ok(success) => self.analyze(call, attempt, cfg, success).await,
            Err(e) => Err(e),
        };
        (result, true)
    }

    /// Innermost bound wins: per-attempt timeout (request envelopes carry
    /// their own default) and whatever remains of the overall execution
    /// timeout.
    fn deadline(
        &self,
        call: Option<&HttpCall>,
        cfg: &EffectiveConfig,
        started_mono: u64,
    ) -> Option<Duration> {
        let per_attempt = cfg.timeout_per_attempt.or_else(|| call.map(|c| c.timeout));
        let remaining = cfg.execution_timeout.map(|total| {
            let elapsed = self.clock.now_millis().saturating_sub(started_mono);
            total.saturating_sub(Duration::from_millis(elapsed))
        });
        match (per_attempt, remaining) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    async fn invoke(
        &self,
        op: &Operation,
        call: Option<&HttpCall>,
        attempt: u32,
        cfg: &EffectiveConfig,
        deadline: Option<Duration>,
        cancel: &CancellationToken,
    ) -> Result<InvokeSuccess, ExecError> {
        let child = cancel.child_token();
        let fut = async {
            match (&op.kind, call) {
                (OperationKind::Request(_), Some(call)) => {
                    let transport = self.transport.as_ref().ok_or_else(|| ExecError::Transport {
                        status: None,
                        code: None,
                        message: "no transport configured".into(),
                    })?;
                    let response = transport.send(call, child.clone()).await.map_err(ExecError::from)?;
                    if response.status >= 400 {
                        return Err(ExecError::Transport {
                            status: Some(response.status),
                            code: None,
                            message: response.status_text.clone(),
                        });
                    }
                    Ok(InvokeSuccess {
                        status: Some(response.status),
                        body: response.body.clone(),
                        response: Some(response),
                    })
                }
                (OperationKind::Func(f), _) => {
                    let ctx = FuncContext {
                        attempt,
                        buffer: cfg.buffer.clone(),
                        params: cfg.hook_params.clone(),
                        cancel: child.clone(),
                    };
                    let body = f(ctx).await?;
                    Ok(InvokeSuccess { status: None, body, response: None })
                }
                (OperationKind::Request(_), None) => unreachable!("request operations carry a call"),
            }
        };
        let timed = async {
            match deadline {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(ExecError::Timeout { elapsed: limit, limit }),
                },
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExecError::Cancelled),
            result = timed => result,
        }
    }

    /// Content analysis plus the cache write for accepted responses.
    async fn analyze(
        &self,
        call: Option<&HttpCall>,
        attempt: u32,
        cfg: &EffectiveConfig,
        success: InvokeSuccess,
    ) -> Result<InvokeSuccess, ExecError> {
        if let Some(analyzer) = &cfg.analyzer {
            let input = AnalyzerInput {
                body: success.body.clone(),
                status: success.status,
                attempt,
                buffer: cfg.buffer.clone(),
                params: cfg.hook_params.clone(),
            };
            match analyzer(input).await {
                Ok(true) => {}
                Ok(false) => return Err(ExecError::InvalidContent { reason: None }),
                Err(message) => {
                    return Err(ExecError::InvalidContent { reason: Some(message) });
                }
            }
        }
        if let (Some(cache), Some(call), Some(response)) =
            (&cfg.infra.cache, call, success.response.as_ref())
        {
            // Cache write failures degrade silently.
            cache.store(call, response);
        }
        Ok(success)
    }

    async fn dispatch_error(&self, op: &Operation, cfg: &EffectiveConfig, record: &AttemptRecord) {
        if let Some(hook) = &cfg.on_error {
            let outcome = AttemptOutcome {
                operation_id: op.id.clone(),
                attempt: record.attempt,
                status: record.status_code,
                body: None,
                error: record.error.clone(),
                buffer: cfg.buffer.clone(),
                params: cfg.hook_params.clone(),
            };
            if let Err(message) = hook(outcome).await {
                tracing::warn!(operation = %op.id, error = %message, "error hook failed");
            }
        }
    }

    async fn dispatch_success(
        &self,
        op: &Operation,
        cfg: &EffectiveConfig,
        record: &AttemptRecord,
    ) {
        if let Some(hook) = &cfg.on_success {
            let outcome = AttemptOutcome {
                operation_id: op.id.clone(),
                attempt: record.attempt,
                status: record.status_code,
                body: record.body.clone(),
                error: None,
                buffer: cfg.buffer.clone(),
                params: cfg.hook_params.clone(),
            };
            if let Err(message) = hook(outcome).await {
                tracing::warn!(operation = %op.id, error = %message, "success hook failed");
            }
        }
    }

    /// Post-pass: the final-error analyzer may swallow the aggregate failure.
    async fn final_error_pass(
        &self,
        op: &Operation,
        cfg: &EffectiveConfig,
        report: &mut OperationReport,
    ) {
        let Some(analyzer) = &cfg.final_error_analyzer else { return };
        let Some(error) = report.error.clone() else { return };
        if error.is_cancelled() {
            return;
        }
        let input = FinalErrorInput {
            operation_id: op.id.clone(),
            error,
            attempts: report.error_log.len() as u32,
            buffer: cfg.buffer.clone(),
            params: cfg.hook_params.clone(),
        };
        match analyzer(input).await {
            Ok(true) => {
                report.suppressed = true;
                report.error = None;
                report.data = Some(Value::Bool(false));
            }
            Ok(false) | Err(_) => {
                if cfg.throw_on_failed_error_analysis {
                    report.should_raise = true;
                }
            }
        }
    }

    async fn finish(
        &self,
        _op: &Operation,
        cfg: &EffectiveConfig,
        report: &mut OperationReport,
        started_mono: u64,
    ) {
        let attempts = (report.error_log.len() + report.success_log.len()) as u64;
        let total = self.clock.now_millis().saturating_sub(started_mono);
        report.metrics.attempts = attempts;
        report.metrics.successes = report.success_log.len() as u64;
        report.metrics.failures = report.error_log.len() as u64;
        report.metrics.total_duration_ms = total;
        report.metrics.avg_attempt_ms = if attempts == 0 { 0 } else { total / attempts };
        if let Some(guardrails) = &cfg.guardrails {
            report.validation = Some(validate_request(&report.metrics, &guardrails.request));
        }
        if let Some(breaker) = &cfg.infra.breaker {
            breaker.persist().await;
        }
    }
}

/// Cascade headers/query sit beneath the leaf's own entries.
fn merged_call(call: &HttpCall, cfg: &EffectiveConfig) -> HttpCall {
    let mut merged = call.clone();
    for (k, v) in &cfg.headers {
        merged.headers.entry(k.clone()).or_insert_with(|| v.clone());
    }
    for (k, v) in &cfg.query {
        merged.query.entry(k.clone()).or_insert_with(|| v.clone());
    }
    merged
}

fn apply_overrides(call: &mut HttpCall, overrides: crate::hooks::RequestOverrides) {
    call.headers.extend(overrides.headers);
    call.query.extend(overrides.query);
    if let Some(body) = overrides.body {
        call.body = Some(body);
    }
}
