//! Quantitative outcomes and guardrail validation
//!
//! Every execution layer reports a metric block; guardrails bound individual
//! metrics and validation is a pure function over (metrics, guardrails).
//! Each bucket validates a fixed, ordered key list so anomaly positions are
//! deterministic and tests can pin names.

use crate::buffer::BufferMetrics;
use crate::infra::InfraMetrics;
use std::collections::HashMap;

/// Numeric bound for one metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Guardrail {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub expected: Option<f64>,
    pub tolerance_pct: Option<f64>,
}

impl Guardrail {
    pub fn min(value: f64) -> Self {
        Self { min: Some(value), ..Self::default() }
    }

    pub fn max(value: f64) -> Self {
        Self { max: Some(value), ..Self::default() }
    }

    pub fn range(min: f64, max: f64) -> Self {
        Self { min: Some(min), max: Some(max), ..Self::default() }
    }

    pub fn expected(value: f64, tolerance_pct: f64) -> Self {
        Self { expected: Some(value), tolerance_pct: Some(tolerance_pct), ..Self::default() }
    }
}

/// Guardrails keyed by metric name within one bucket.
pub type GuardrailSet = HashMap<String, Guardrail>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Violation {
    BelowMin,
    AboveMax,
    OutsideTolerance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// One violated guardrail.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Anomaly {
    pub name: String,
    pub value: f64,
    pub violation: Violation,
    pub bound: f64,
    pub severity: Severity,
}

/// Outcome of validating one bucket. Violations never halt execution; they
/// ride along with the result.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct ValidationReport {
    pub anomalies: Vec<Anomaly>,
    pub checked: usize,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.anomalies.is_empty()
    }

    pub fn worst(&self) -> Option<Severity> {
        self.anomalies.iter().map(|a| a.severity).max()
    }

    pub fn merge(mut self, other: ValidationReport) -> ValidationReport {
        self.anomalies.extend(other.anomalies);
        self.checked += other.checked;
        self
    }
}

/// Severity from percentage deviation off the violated bound.
fn bound_severity(value: f64, bound: f64) -> Severity {
    let deviation = if bound == 0.0 {
        if value == 0.0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        ((value - bound).abs()) / bound.abs()
    };
    if deviation > 0.5 {
        Severity::Critical
    } else if deviation > 0.2 {
        Severity::Warning
    } else {
        Severity::Info
    }
}

/// Severity for tolerance violations compares deviation against the
/// tolerance itself.
fn tolerance_severity(deviation_pct: f64, tolerance_pct: f64) -> Severity {
    if deviation_pct > 2.0 * tolerance_pct {
        Severity::Critical
    } else if deviation_pct > 1.5 * tolerance_pct {
        Severity::Warning
    } else {
        Severity::Info
    }
}

/// Check one metric against one guardrail. Pure; same inputs, same anomalies.
pub fn check_metric(name: &str, value: f64, guardrail: &Guardrail) -> Vec<Anomaly> {
    let mut anomalies = Vec::new();
    if let Some(min) = guardrail.min {
        if value < min {
            anomalies.push(Anomaly {
                name: name.to_string(),
                value,
                violation: Violation::BelowMin,
                bound: min,
                severity: bound_severity(value, min),
            });
        }
    }
    if let Some(max) = guardrail.max {
        if value > max {
            anomalies.push(Anomaly {
                name: name.to_string(),
                value,
                violation: Violation::AboveMax,
                bound: max,
                severity: bound_severity(value, max),
            });
        }
    }
    if let (Some(expected), Some(tolerance)) = (guardrail.expected, guardrail.tolerance_pct) {
        let band = expected.abs() * tolerance / 100.0;
        if value < expected - band || value > expected + band {
            let deviation_pct = if expected == 0.0 {
                f64::INFINITY
            } else {
                (value - expected).abs() / expected.abs() * 100.0
            };
            anomalies.push(Anomaly {
                name: name.to_string(),
                value,
                violation: Violation::OutsideTolerance,
                bound: expected,
                severity: tolerance_severity(deviation_pct, tolerance),
            });
        }
    }
    anomalies
}

/// Validate an ordered (name, value) list against a guardrail set.
pub fn validate_keys(pairs: &[(&str, f64)], guardrails: &GuardrailSet) -> ValidationReport {
    let mut report = ValidationReport::default();
    for (name, value) in pairs {
        if let Some(guardrail) = guardrails.get(*name) {
            report.checked += 1;
            report.anomalies.extend(check_metric(name, *value, guardrail));
        }
    }
    report
}

// --- Metric blocks ---

/// Per-leaf outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct RequestMetrics {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_duration_ms: u64,
    pub avg_attempt_ms: u64,
    pub from_cache: bool,
}

/// Ordered key list for the request bucket.
pub const REQUEST_METRIC_KEYS: &[&str] =
    &["attempts", "successes", "failures", "total_duration_ms", "avg_attempt_ms"];

pub fn validate_request(metrics: &RequestMetrics, guardrails: &GuardrailSet) -> ValidationReport {
    validate_keys(
        &[
            ("attempts", metrics.attempts as f64),
            ("successes", metrics.successes as f64),
            ("failures", metrics.failures as f64),
            ("total_duration_ms", metrics.total_duration_ms as f64),
            ("avg_attempt_ms", metrics.avg_attempt_ms as f64),
        ],
        guardrails,
    )
}

/// Per-gateway aggregate counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct GatewayMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub skipped_requests: u64,
    pub duration_ms: u64,
    pub avg_request_ms: u64,
}

pub const GATEWAY_METRIC_KEYS: &[&str] = &[
    "total_requests",
    "successful_requests",
    "failed_requests",
    "skipped_requests",
    "duration_ms",
    "avg_request_ms",
];

pub fn validate_gateway(metrics: &GatewayMetrics, guardrails: &GuardrailSet) -> ValidationReport {
    validate_keys(
        &[
            ("total_requests", metrics.total_requests as f64),
            ("successful_requests", metrics.successful_requests as f64),
            ("failed_requests", metrics.failed_requests as f64),
            ("skipped_requests", metrics.skipped_requests as f64),
            ("duration_ms", metrics.duration_ms as f64),
            ("avg_request_ms", metrics.avg_request_ms as f64),
        ],
        guardrails,
    )
}

/// Per-phase counters (gateway counters plus execution bookkeeping).
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct PhaseMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub duration_ms: u64,
    pub execution_number: u32,
}

pub const PHASE_METRIC_KEYS: &[&str] = &[
    "total_requests",
    "successful_requests",
    "failed_requests",
    "duration_ms",
    "execution_number",
];

pub fn validate_phase(metrics: &PhaseMetrics, guardrails: &GuardrailSet) -> ValidationReport {
    validate_keys(
        &[
            ("total_requests", metrics.total_requests as f64),
            ("successful_requests", metrics.successful_requests as f64),
            ("failed_requests", metrics.failed_requests as f64),
            ("duration_ms", metrics.duration_ms as f64),
            ("execution_number", metrics.execution_number as f64),
        ],
        guardrails,
    )
}

/// Per-branch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct BranchMetrics {
    pub total_phases: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub duration_ms: u64,
}

pub const BRANCH_METRIC_KEYS: &[&str] = &[
    "total_phases",
    "total_requests",
    "successful_requests",
    "failed_requests",
    "duration_ms",
];

pub fn validate_branch(metrics: &BranchMetrics, guardrails: &GuardrailSet) -> ValidationReport {
    validate_keys(
        &[
            ("total_phases", metrics.total_phases as f64),
            ("total_requests", metrics.total_requests as f64),
            ("successful_requests", metrics.successful_requests as f64),
            ("failed_requests", metrics.failed_requests as f64),
            ("duration_ms", metrics.duration_ms as f64),
        ],
        guardrails,
    )
}

/// Whole-workflow counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct WorkflowMetrics {
    pub total_phases: u64,
    pub executed_phases: u64,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub duration_ms: u64,
    pub iterations: u64,
}

pub const WORKFLOW_METRIC_KEYS: &[&str] = &[
    "total_phases",
    "executed_phases",
    "total_requests",
    "successful_requests",
    "failed_requests",
    "duration_ms",
    "iterations",
];

pub fn validate_workflow(metrics: &WorkflowMetrics, guardrails: &GuardrailSet) -> ValidationReport {
    validate_keys(
        &[
            ("total_phases", metrics.total_phases as f64),
            ("executed_phases", metrics.executed_phases as f64),
            ("total_requests", metrics.total_requests as f64),
            ("successful_requests", metrics.successful_requests as f64),
            ("failed_requests", metrics.failed_requests as f64),
            ("duration_ms", metrics.duration_ms as f64),
            ("iterations", metrics.iterations as f64),
        ],
        guardrails,
    )
}

/// Scheduler loop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct SchedulerMetrics {
    pub total_jobs: u64,
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub success_rate: f64,
    pub avg_execution_ms: u64,
    pub avg_queue_delay_ms: u64,
}

pub const SCHEDULER_METRIC_KEYS: &[&str] = &[
    "total_jobs",
    "queued",
    "running",
    "completed",
    "failed",
    "dropped",
    "success_rate",
    "avg_execution_ms",
    "avg_queue_delay_ms",
];

pub fn validate_scheduler(
    metrics: &SchedulerMetrics,
    guardrails: &GuardrailSet,
) -> ValidationReport {
    validate_keys(
        &[
            ("total_jobs", metrics.total_jobs as f64),
            ("queued", metrics.queued as f64),
            ("running", metrics.running as f64),
            ("completed", metrics.completed as f64),
            ("failed", metrics.failed as f64),
            ("dropped", metrics.dropped as f64),
            ("success_rate", metrics.success_rate),
            ("avg_execution_ms", metrics.avg_execution_ms as f64),
            ("avg_queue_delay_ms", metrics.avg_queue_delay_ms as f64),
        ],
        guardrails,
    )
}

/// Distributed-adapter counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct DistributedMetrics {
    pub locks_acquired: u64,
    pub locks_released: u64,
    pub campaigns: u64,
    pub leadership_changes: u64,
    pub publishes: u64,
    pub deliveries: u64,
}

pub const DISTRIBUTED_METRIC_KEYS: &[&str] = &[
    "locks_acquired",
    "locks_released",
    "campaigns",
    "leadership_changes",
    "publishes",
    "deliveries",
];

pub fn validate_distributed(
    metrics: &DistributedMetrics,
    guardrails: &GuardrailSet,
) -> ValidationReport {
    validate_keys(
        &[
            ("locks_acquired", metrics.locks_acquired as f64),
            ("locks_released", metrics.locks_released as f64),
            ("campaigns", metrics.campaigns as f64),
            ("leadership_changes", metrics.leadership_changes as f64),
            ("publishes", metrics.publishes as f64),
            ("deliveries", metrics.deliveries as f64),
        ],
        guardrails,
    )
}

/// Buffer bucket: validates [`BufferMetrics`].
pub const BUFFER_METRIC_KEYS: &[&str] = &[
    "transactions",
    "failed_transactions",
    "avg_commit_ms",
    "avg_queue_wait_ms",
    "keys",
];

pub fn validate_buffer(metrics: &BufferMetrics, guardrails: &GuardrailSet) -> ValidationReport {
    validate_keys(
        &[
            ("transactions", metrics.transactions as f64),
            ("failed_transactions", metrics.failed_transactions as f64),
            ("avg_commit_ms", metrics.avg_commit_ms as f64),
            ("avg_queue_wait_ms", metrics.avg_queue_wait_ms as f64),
            ("keys", metrics.keys as f64),
        ],
        guardrails,
    )
}

/// Infrastructure bucket: each present primitive contributes prefixed keys in
/// a fixed order (breaker, rate limiter, concurrency, cache).
pub fn validate_infrastructure(
    metrics: &InfraMetrics,
    guardrails: &GuardrailSet,
) -> ValidationReport {
    let mut pairs: Vec<(&str, f64)> = Vec::new();
    if let Some(b) = &metrics.breaker {
        pairs.push(("breaker.total_requests", b.total_requests as f64));
        pairs.push(("breaker.failed_requests", b.failed_requests as f64));
        pairs.push(("breaker.open_count", b.open_count as f64));
        pairs.push(("breaker.total_open_ms", b.total_open_ms as f64));
    }
    if let Some(r) = &metrics.rate_limiter {
        pairs.push(("rate_limiter.admitted", r.admitted as f64));
        pairs.push(("rate_limiter.throttled", r.throttled as f64));
        pairs.push(("rate_limiter.peak_queue", r.peak_queue as f64));
        pairs.push(("rate_limiter.avg_wait_ms", r.avg_wait_ms as f64));
    }
    if let Some(c) = &metrics.concurrency {
        pairs.push(("concurrency.acquired", c.acquired as f64));
        pairs.push(("concurrency.peak_queue", c.peak_queue as f64));
        pairs.push(("concurrency.avg_wait_ms", c.avg_wait_ms as f64));
    }
    if let Some(c) = &metrics.cache {
        pairs.push(("cache.hits", c.hits as f64));
        pairs.push(("cache.misses", c.misses as f64));
        pairs.push(("cache.evictions", c.evictions as f64));
        pairs.push(("cache.size", c.size as f64));
    }
    validate_keys(&pairs, guardrails)
}

/// Guardrail buckets a caller can attach to a run.
#[derive(Debug, Clone, Default)]
pub struct MetricsGuardrails {
    pub request: GuardrailSet,
    pub gateway: GuardrailSet,
    pub phase: GuardrailSet,
    pub branch: GuardrailSet,
    pub workflow: GuardrailSet,
    pub infrastructure: GuardrailSet,
    pub scheduler: GuardrailSet,
    pub buffer: GuardrailSet,
    pub distributed: GuardrailSet,
}

impl MetricsGuardrails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.request.is_empty()
            && self.gateway.is_empty()
            && self.phase.is_empty()
            && self.branch.is_empty()
            && self.workflow.is_empty()
            && self.infrastructure.is_empty()
            && self.scheduler.is_empty()
            && self.buffer.is_empty()
            && self.distributed.is_empty()
    }
}
