//! Batch execution of leaf operations
//!
//! A gateway runs a list of operations either sequentially (input order,
//! optional short-circuit) or concurrently (settle-all, optional racing where
//! the first success cancels the rest). Group configs cascade between each
//! leaf's own config and the enclosing phase/workflow levels. A batch-wide
//! wall clock cancels and fails whatever is still pending.

use crate::attempt::{AttemptRunner, OperationReport};
use crate::concurrency::ConcurrencyLimiter;
use crate::config::{resolve, CommonConfig, EffectiveConfig};
use crate::error::ExecError;
use crate::metrics::{validate_gateway, GatewayMetrics, ValidationReport};
use crate::operation::Operation;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Named config level shared by the leaves that point at it.
#[derive(Clone, Default)]
pub struct Group {
    pub id: String,
    pub config: CommonConfig,
}

impl Group {
    pub fn new(id: impl Into<String>, config: CommonConfig) -> Self {
        Self { id: id.into(), config }
    }
}

/// Batch-level execution controls.
#[derive(Clone, Debug)]
pub struct GatewayOptions {
    /// Dispatch all leaves together instead of walking them in order.
    pub concurrent: bool,
    /// Sequential mode only: stop after the first failed leaf; the remaining
    /// leaves are omitted, not failed.
    pub stop_on_first_error: bool,
    /// Concurrent mode only: first success wins, the rest are cancelled and
    /// reported skipped.
    pub enable_racing: bool,
    /// Executor-level concurrency bound, separate from any per-leaf limiter.
    pub max_concurrent_requests: Option<usize>,
    /// Wall-clock bound for the whole batch.
    pub max_timeout: Option<Duration>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            concurrent: true,
            stop_on_first_error: false,
            enable_racing: false,
            max_concurrent_requests: None,
            max_timeout: None,
        }
    }
}

impl GatewayOptions {
    pub fn sequential() -> Self {
        Self { concurrent: false, ..Self::default() }
    }

    pub fn racing() -> Self {
        Self { enable_racing: true, ..Self::default() }
    }
}

/// One leaf's outcome inside a batch, in original input order.
#[derive(Debug, Clone)]
pub struct GatewayEntry {
    pub request_id: String,
    pub group_id: Option<String>,
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<ExecError>,
    pub skipped: bool,
    pub report: Option<OperationReport>,
}

/// Whole-batch outcome.
#[derive(Debug, Clone, Default)]
pub struct GatewayReport {
    pub entries: Vec<GatewayEntry>,
    pub metrics: GatewayMetrics,
    pub validation: Option<ValidationReport>,
    pub terminated_early: bool,
}

impl GatewayReport {
    pub fn successes(&self) -> usize {
        self.entries.iter().filter(|e| e.success).count()
    }
}

/// Runs batches. Holds the shared attempt runner.
#[derive(Clone)]
pub struct GatewayExecutor {
    runner: AttemptRunner,
}

impl GatewayExecutor {
    pub fn new(runner: AttemptRunner) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &AttemptRunner {
        &self.runner
    }

    /// Execute a batch. `parent_levels` is the config chain outside the
    /// gateway, ordered inner to outer (phase, branch, workflow).
    pub async fn run(
        &self,
        ops: &[Operation],
        groups: &[Group],
        options: &GatewayOptions,
        parent_levels: &[&CommonConfig],
        cancel: &CancellationToken,
    ) -> GatewayReport {
        let started = Instant::now();
        let group_index: HashMap<&str, &Group> =
            groups.iter().map(|g| (g.id.as_str(), g)).collect();
        let batch_cancel = cancel.child_token();

        let (entries, timed_out) = if options.concurrent {
            self.run_concurrent(ops, &group_index, options, parent_levels, &batch_cancel).await
        } else {
            self.run_sequential(ops, &group_index, options, parent_levels, &batch_cancel).await
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let successful = entries.iter().filter(|e| e.success).count() as u64;
        let skipped = entries.iter().filter(|e| e.skipped).count() as u64;
        let total = entries.len() as u64;
        let metrics = GatewayMetrics {
            total_requests: total,
            successful_requests: successful,
            failed_requests: total - successful - skipped,
            skipped_requests: skipped,
            duration_ms,
            avg_request_ms: if total == 0 { 0 } else { duration_ms / total },
        };
        let gateway_cfg = resolve(parent_levels);
        let validation = gateway_cfg
            .guardrails
            .as_ref()
            .map(|g| validate_gateway(&metrics, &g.gateway));

        GatewayReport {
            entries,
            metrics,
            validation,
            terminated_early: timed_out || cancel.is_cancelled(),
        }
    }

    fn resolve_for(
        &self,
        op: &Operation,
        group_index: &HashMap<&str, &Group>,
        parent_levels: &[&CommonConfig],
    ) -> EffectiveConfig {
        let mut chain: Vec<&CommonConfig> = vec![&op.config];
        if let Some(group) = op.group.as_deref().and_then(|id| group_index.get(id)) {
            chain.push(&group.config);
        }
        chain.extend_from_slice(parent_levels);
        resolve(&chain)
    }

    async fn run_sequential(
        &self,
        ops: &[Operation],
        group_index: &HashMap<&str, &Group>,
        options: &GatewayOptions,
        parent_levels: &[&CommonConfig],
        batch_cancel: &CancellationToken,
    ) -> (Vec<GatewayEntry>, bool) {
        let deadline = options.max_timeout.map(|d| Instant::now() + d);
        let mut entries = Vec::with_capacity(ops.len());
        let mut timed_out = false;

        for op in ops {
            if batch_cancel.is_cancelled() && !timed_out {
                break;
            }
            if timed_out || deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                if !timed_out {
                    timed_out = true;
                    batch_cancel.cancel();
                }
                entries.push(timeout_entry(op, options.max_timeout.unwrap_or_default()));
                continue;
            }
            let cfg = self.resolve_for(op, group_index, parent_levels);
            let report = match deadline {
                Some(d) => {
                    let remaining = d.saturating_duration_since(Instant::now());
                    match tokio::time::timeout(remaining, self.runner.run(op, &cfg, batch_cancel))
                        .await
                    {
                        Ok(report) => report,
                        Err(_) => {
                            timed_out = true;
                            batch_cancel.cancel();
                            entries
                                .push(timeout_entry(op, options.max_timeout.unwrap_or_default()));
                            continue;
                        }
                    }
                }
                None => self.runner.run(op, &cfg, batch_cancel).await,
            };
            let failed = !report.success;
            entries.push(entry_from_report(op, report));
            if failed && options.stop_on_first_error {
                break;
            }
        }
        (entries, timed_out)
    }

    async fn run_concurrent(
        &self,
        ops: &[Operation],
        group_index: &HashMap<&str, &Group>,
        options: &GatewayOptions,
        parent_levels: &[&CommonConfig],
        batch_cancel: &CancellationToken,
    ) -> (Vec<GatewayEntry>, bool) {
        let executor_limiter = options.max_concurrent_requests.map(ConcurrencyLimiter::shared);
        let mut futs = FuturesUnordered::new();
        for (index, op) in ops.iter().enumerate() {
            let cfg = self.resolve_for(op, group_index, parent_levels);
            let runner = self.runner.clone();
            let limiter = executor_limiter.clone();
            let token = batch_cancel.clone();
            let op = op.clone();
            futs.push(async move {
                let slot = match &limiter {
                    Some(limiter) => match limiter.acquire(&token).await {
                        Ok(slot) => Some(slot),
                        Err(_) => {
                            let mut report = OperationReport::default();
                            report.operation_id = op.id.clone();
                            report.error = Some(ExecError::Cancelled);
                            report.terminated_early = true;
                            return (index, op, report);
                        }
                    },
                    None => None,
                };
                let report = runner.run(&op, &cfg, &token).await;
                drop(slot);
                (index, op, report)
            });
        }

        let deadline = options.max_timeout.map(|d| tokio::time::Instant::now() + d);
        let mut timed_out = false;
        let mut winner: Option<usize> = None;
        let mut slots: Vec<Option<GatewayEntry>> = vec![None; ops.len()];

        loop {
            if futs.is_empty() {
                break;
            }
            let item = match (deadline, timed_out) {
                (Some(d), false) => {
                    tokio::select! {
                        biased;
                        _ = tokio::time::sleep_until(d) => {
                            timed_out = true;
                            batch_cancel.cancel();
                            continue;
                        }
                        item = futs.next() => item,
                    }
                }
                _ => futs.next().await,
            };
            let Some((index, op, report)) = item else { break };

            if timed_out && !report.success {
                slots[index] = Some(timeout_entry(&op, options.max_timeout.unwrap_or_default()));
                continue;
            }
            if options.enable_racing {
                if let Some(winner_index) = winner {
                    if index != winner_index && !report.success {
                        slots[index] = Some(skipped_entry(&op));
                        continue;
                    }
                } else if report.success {
                    winner = Some(index);
                    batch_cancel.cancel();
                }
            }
            slots[index] = Some(entry_from_report(&op, report));
        }

        // Results in original input order; anything unresolved (should not
        // happen) counts as skipped.
        let entries = ops
            .iter()
            .zip(slots)
            .map(|(op, slot)| slot.unwrap_or_else(|| skipped_entry(op)))
            .collect();
        (entries, timed_out)
    }
}

fn entry_from_report(op: &Operation, report: OperationReport) -> GatewayEntry {
    GatewayEntry {
        request_id: op.id.clone(),
        group_id: op.group.clone(),
        success: report.success,
        data: report.data.clone(),
        error: report.error.clone(),
        skipped: false,
        report: Some(report),
    }
}

fn skipped_entry(op: &Operation) -> GatewayEntry {
    GatewayEntry {
        request_id: op.id.clone(),
        group_id: op.group.clone(),
        success: false,
        data: None,
        error: Some(ExecError::Cancelled),
        skipped: true,
        report: None,
    }
}

fn timeout_entry(op: &Operation, limit: Duration) -> GatewayEntry {
    GatewayEntry {
        request_id: op.id.clone(),
        group_id: op.group.clone(),
        success: false,
        data: None,
        error: Some(ExecError::Timeout { elapsed: limit, limit }),
        skipped: false,
        report: None,
    }
}
