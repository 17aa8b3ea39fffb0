//! Workflow execution: linear, concurrent, mixed, and non-linear drivers
//!
//! Non-linear execution is an iteration-bounded interpreter keyed by phase
//! id; every decision action is evaluated in one place. Hooks always observe
//! committed buffer state because all mutations go through the shared buffer.

use crate::config::{resolve, CommonConfig};
use crate::error::ConfigError;
use crate::hooks::{Decision, DecisionAction, DecisionInput};
use crate::metrics::{validate_workflow, ValidationReport, WorkflowMetrics};
use crate::phase::{Phase, PhaseEngine, PhaseReport};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Default bound on non-linear interpreter steps.
pub const DEFAULT_MAX_WORKFLOW_ITERATIONS: u32 = 1000;

/// Workflow-level controls and the outermost config level.
#[derive(Clone, Default)]
pub struct WorkflowOptions {
    pub global: CommonConfig,
    /// Linear/mixed: short-circuit on any failed leaf within a phase.
    pub stop_on_first_phase_error: bool,
    /// Dispatch every phase in parallel.
    pub concurrent_phase_execution: bool,
    /// Sequential driver; maximal runs of adjacent marked phases execute as
    /// concurrent groups.
    pub enable_mixed_execution: bool,
    /// Decision-driven interpreter keyed by phase id.
    pub enable_non_linear_execution: bool,
    pub max_workflow_iterations: Option<u32>,
}

impl WorkflowOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global(mut self, global: CommonConfig) -> Self {
        self.global = global;
        self
    }

    pub fn non_linear(mut self) -> Self {
        self.enable_non_linear_execution = true;
        self
    }

    pub fn mixed(mut self) -> Self {
        self.enable_mixed_execution = true;
        self
    }

    pub fn concurrent(mut self) -> Self {
        self.concurrent_phase_execution = true;
        self
    }

    fn iteration_bound(&self) -> u32 {
        self.max_workflow_iterations.unwrap_or(DEFAULT_MAX_WORKFLOW_ITERATIONS)
    }
}

/// Append-only record of every phase execution, available to decision hooks.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HistoryEntry {
    pub phase_id: String,
    pub phase_index: usize,
    pub execution_number: u32,
    pub timestamp: i64,
    pub success: bool,
    pub execution_time_ms: u64,
    pub decision: Option<DecisionAction>,
}

impl HistoryEntry {
    fn from_report(report: &PhaseReport) -> Self {
        Self {
            phase_id: report.phase_id.clone(),
            phase_index: report.phase_index,
            execution_number: report.execution_number,
            timestamp: report.timestamp,
            success: report.success,
            execution_time_ms: report.execution_time_ms,
            decision: report.decision,
        }
    }
}

/// Whole-workflow outcome.
#[derive(Debug, Clone, Default)]
pub struct WorkflowReport {
    pub success: bool,
    pub phases: Vec<PhaseReport>,
    pub history: Vec<HistoryEntry>,
    pub terminated_early: bool,
    pub termination_reason: Option<String>,
    pub metrics: WorkflowMetrics,
    pub validation: Option<ValidationReport>,
}

/// Drives phases through one of the four execution modes.
#[derive(Clone)]
pub struct WorkflowEngine {
    phase_engine: PhaseEngine,
}

impl WorkflowEngine {
    pub fn new(phase_engine: PhaseEngine) -> Self {
        Self { phase_engine }
    }

    pub fn phase_engine(&self) -> &PhaseEngine {
        &self.phase_engine
    }

    /// Run a workflow. Configuration misuse (empty list, duplicate ids) is
    /// rejected before any execution; everything after that is captured in
    /// the report, never thrown.
    pub async fn run(
        &self,
        phases: Vec<Phase>,
        options: &WorkflowOptions,
        cancel: &CancellationToken,
    ) -> Result<WorkflowReport, ConfigError> {
        if phases.is_empty() {
            return Err(ConfigError::EmptyWorkflow);
        }
        let mut seen = std::collections::HashSet::new();
        for phase in &phases {
            if !seen.insert(phase.id.clone()) {
                return Err(ConfigError::DuplicatePhaseId(phase.id.clone()));
            }
        }

        let started = Instant::now();
        let total_declared = phases.len();
        let mut report = if options.enable_non_linear_execution {
            self.run_non_linear(phases, options, cancel).await
        } else if options.concurrent_phase_execution {
            self.run_concurrent(phases, options, cancel).await
        } else if options.enable_mixed_execution {
            self.run_mixed(phases, options, cancel).await
        } else {
            self.run_linear(phases, options, cancel).await
        };

        let executed: Vec<&PhaseReport> =
            report.phases.iter().filter(|p| !p.skipped).collect();
        report.success =
            !executed.is_empty() && executed.iter().all(|p| p.success);
        report.metrics.total_phases = report.metrics.total_phases.max(total_declared as u64);
        report.metrics.executed_phases = executed.len() as u64;
        report.metrics.total_requests = executed.iter().map(|p| p.total_requests).sum();
        report.metrics.successful_requests =
            executed.iter().map(|p| p.successful_requests).sum();
        report.metrics.failed_requests = executed.iter().map(|p| p.failed_requests).sum();
        report.metrics.duration_ms = started.elapsed().as_millis() as u64;

        let effective = resolve(&[&options.global]);
        report.validation =
            effective.guardrails.as_ref().map(|g| validate_workflow(&report.metrics, &g.workflow));
        Ok(report)
    }

    async fn decide(
        &self,
        phase: &Phase,
        report: &PhaseReport,
        history: &[HistoryEntry],
        options: &WorkflowOptions,
        concurrent_results: Option<Vec<PhaseReport>>,
    ) -> Option<Decision> {
        let hook = phase.decision_hook.as_ref()?;
        let buffer = resolve(&[&phase.config, &options.global]).buffer;
        let input = DecisionInput {
            phase: report.clone(),
            history: history.to_vec(),
            buffer,
            concurrent_results,
        };
        match hook(input).await {
            Ok(decision) => Some(decision),
            Err(message) => {
                tracing::warn!(phase = %phase.id, error = %message, "decision hook failed");
                None
            }
        }
    }

    async fn run_linear(
        &self,
        phases: Vec<Phase>,
        options: &WorkflowOptions,
        cancel: &CancellationToken,
    ) -> WorkflowReport {
        let mut report = WorkflowReport::default();
        for (index, phase) in phases.iter().enumerate() {
            if cancel.is_cancelled() {
                report.terminated_early = true;
                report.termination_reason = Some("cancelled".into());
                break;
            }
            let mut phase_report = self
                .phase_engine
                .run_phase(phase, index, 1, &[&options.global], cancel)
                .await;
            report.metrics.iterations += 1;

            let decision =
                self.decide(phase, &phase_report, &report.history, options, None).await;
            if let Some(decision) = &decision {
                let action = decision.action_or_continue();
                phase_report.decision = Some(action);
                match action {
                    DecisionAction::Terminate => {
                        report.history.push(HistoryEntry::from_report(&phase_report));
                        report.phases.push(phase_report);
                        report.terminated_early = true;
                        report.termination_reason = Some("terminated by decision".into());
                        break;
                    }
                    DecisionAction::Continue => {}
                    other => {
                        tracing::warn!(
                            phase = %phase.id,
                            action = ?other,
                            "decision ignored outside non-linear execution"
                        );
                    }
                }
            }

            let failed = !phase_report.success;
            report.history.push(HistoryEntry::from_report(&phase_report));
            report.phases.push(phase_report);
            if failed && options.stop_on_first_phase_error {
                report.terminated_early = true;
                report.termination_reason = Some("phase failed".into());
                break;
            }
        }
        report
    }

    async fn run_concurrent(
        &self,
        phases: Vec<Phase>,
        options: &WorkflowOptions,
        cancel: &CancellationToken,
    ) -> WorkflowReport {
        let mut report = WorkflowReport::default();
        let results = self.run_group(&phases, 0, options, cancel).await;
        report.metrics.iterations = 1;

        let all: Vec<PhaseReport> = results.clone();
        for (phase, mut phase_report) in phases.iter().zip(results) {
            if let Some(decision) = self
                .decide(phase, &phase_report, &report.history, options, Some(all.clone()))
                .await
            {
                phase_report.decision = Some(decision.action_or_continue());
            }
            report.history.push(HistoryEntry::from_report(&phase_report));
            report.phases.push(phase_report);
        }
        if cancel.is_cancelled() {
            report.terminated_early = true;
            report.termination_reason = Some("cancelled".into());
        }
        report
    }

    async fn run_mixed(
        &self,
        phases: Vec<Phase>,
        options: &WorkflowOptions,
        cancel: &CancellationToken,
    ) -> WorkflowReport {
        let mut report = WorkflowReport::default();
        let mut index = 0;
        'outer: while index < phases.len() {
            if cancel.is_cancelled() {
                report.terminated_early = true;
                report.termination_reason = Some("cancelled".into());
                break;
            }
            let group_len = marked_run_len(&phases, index);
            report.metrics.iterations += 1;

            if group_len > 1 {
                let group = &phases[index..index + group_len];
                let results = self.run_group(group, index, options, cancel).await;
                // The group's decision comes from its last phase.
                let decision = self
                    .decide(
                        &group[group_len - 1],
                        &results[group_len - 1],
                        &report.history,
                        options,
                        Some(results.clone()),
                    )
                    .await;
                let mut group_failed = false;
                for mut phase_report in results {
                    group_failed |= !phase_report.success;
                    if phase_report.phase_index == index + group_len - 1 {
                        phase_report.decision = decision.as_ref().map(|d| d.action_or_continue());
                    }
                    report.history.push(HistoryEntry::from_report(&phase_report));
                    report.phases.push(phase_report);
                }
                if let Some(decision) = decision {
                    if decision.action_or_continue() == DecisionAction::Terminate {
                        report.terminated_early = true;
                        report.termination_reason = Some("terminated by decision".into());
                        break 'outer;
                    }
                }
                if group_failed && options.stop_on_first_phase_error {
                    report.terminated_early = true;
                    report.termination_reason = Some("phase failed".into());
                    break;
                }
                index += group_len;
            } else {
                let phase = &phases[index];
                let mut phase_report = self
                    .phase_engine
                    .run_phase(phase, index, 1, &[&options.global], cancel)
                    .await;
                let decision =
                    self.decide(phase, &phase_report, &report.history, options, None).await;
                if let Some(decision) = &decision {
                    phase_report.decision = Some(decision.action_or_continue());
                }
                let failed = !phase_report.success;
                report.history.push(HistoryEntry::from_report(&phase_report));
                report.phases.push(phase_report);
                if let Some(decision) = decision {
                    if decision.action_or_continue() == DecisionAction::Terminate {
                        report.terminated_early = true;
                        report.termination_reason = Some("terminated by decision".into());
                        break;
                    }
                }
                if failed && options.stop_on_first_phase_error {
                    report.terminated_early = true;
                    report.termination_reason = Some("phase failed".into());
                    break;
                }
                index += 1;
            }
        }
        report
    }

    /// Dispatch a slice of phases together; results come back in positional
    /// order even though completion order is unspecified.
    async fn run_group(
        &self,
        group: &[Phase],
        base_index: usize,
        options: &WorkflowOptions,
        cancel: &CancellationToken,
    ) -> Vec<PhaseReport> {
        let mut futs = FuturesUnordered::new();
        for (offset, phase) in group.iter().enumerate() {
            let engine = self.phase_engine.clone();
            let global = options.global.clone();
            let cancel = cancel.clone();
            let phase = phase.clone();
            futs.push(async move {
                let report = engine
                    .run_phase(&phase, base_index + offset, 1, &[&global], &cancel)
                    .await;
                (offset, report)
            });
        }
        let mut slots: Vec<Option<PhaseReport>> = vec![None; group.len()];
        while let Some((offset, report)) = futs.next().await {
            slots[offset] = Some(report);
        }
        slots
            .into_iter()
            .enumerate()
            .map(|(offset, slot)| {
                slot.unwrap_or_else(|| PhaseReport::skipped(&group[offset].id, base_index + offset))
            })
            .collect()
    }

    async fn run_non_linear(
        &self,
        phases: Vec<Phase>,
        options: &WorkflowOptions,
        cancel: &CancellationToken,
    ) -> WorkflowReport {
        let mut report = WorkflowReport::default();
        let mut order: Vec<String> = phases.iter().map(|p| p.id.clone()).collect();
        let mut registry: HashMap<String, Phase> =
            phases.into_iter().map(|p| (p.id.clone(), p)).collect();
        let mut exec_counts: HashMap<String, u32> = HashMap::new();
        let mut pos = 0usize;
        let mut iterations = 0u32;

        while pos < order.len() {
            if cancel.is_cancelled() {
                report.terminated_early = true;
                report.termination_reason = Some("cancelled".into());
                break;
            }
            if iterations >= options.iteration_bound() {
                report.terminated_early = true;
                report.termination_reason =
                    Some(format!("exceeded {} workflow iterations", options.iteration_bound()));
                break;
            }
            iterations += 1;

            let group_len = marked_run_len_ids(&order, &registry, pos);
            let (decision, advance) = if group_len > 1 {
                let group: Vec<Phase> =
                    order[pos..pos + group_len].iter().map(|id| registry[id].clone()).collect();
                let results = self.run_group(&group, pos, options, cancel).await;
                let decision = self
                    .decide(
                        &group[group_len - 1],
                        &results[group_len - 1],
                        &report.history,
                        options,
                        Some(results.clone()),
                    )
                    .await;
                for (offset, mut phase_report) in results.into_iter().enumerate() {
                    *exec_counts.entry(group[offset].id.clone()).or_insert(0) += 1;
                    if offset == group_len - 1 {
                        phase_report.decision = decision.as_ref().map(|d| d.action_or_continue());
                    }
                    report.history.push(HistoryEntry::from_report(&phase_report));
                    report.phases.push(phase_report);
                }
                // Replaying a whole group is unsupported.
                let decision = match decision {
                    Some(d) if d.action_or_continue() == DecisionAction::Replay => {
                        tracing::warn!("group replay is unsupported; continuing");
                        None
                    }
                    other => other,
                };
                (decision, group_len)
            } else {
                let phase_id = order[pos].clone();
                let phase = registry[&phase_id].clone();
                let execution_number = exec_counts.get(&phase_id).copied().unwrap_or(0) + 1;
                let mut phase_report = self
                    .phase_engine
                    .run_phase(&phase, pos, execution_number, &[&options.global], cancel)
                    .await;
                exec_counts.insert(phase_id, execution_number);
                let decision =
                    self.decide(&phase, &phase_report, &report.history, options, None).await;
                if let Some(decision) = &decision {
                    phase_report.decision = Some(decision.action_or_continue());
                }
                report.history.push(HistoryEntry::from_report(&phase_report));
                report.phases.push(phase_report);
                (decision, 1)
            };

            // Every transition is decided here, in one place.
            let current = registry[&order[pos]].clone();
            let action = decision.as_ref().map(|d| d.action_or_continue());
            let target = decision.as_ref().and_then(|d| d.target_phase_id.clone());
            if let Some(decision) = &decision {
                for phase in &decision.add_phases {
                    if registry.contains_key(&phase.id) {
                        tracing::warn!(phase = %phase.id, "added phase id already exists; ignored");
                        continue;
                    }
                    order.push(phase.id.clone());
                    registry.insert(phase.id.clone(), phase.clone());
                }
            }

            match action.unwrap_or(DecisionAction::Continue) {
                DecisionAction::Continue => pos += advance,
                DecisionAction::Terminate => {
                    report.terminated_early = true;
                    report.termination_reason = Some(
                        decision
                            .as_ref()
                            .and_then(|d| d.metadata.as_ref())
                            .and_then(|m| m.get("reason"))
                            .and_then(|r| r.as_str())
                            .unwrap_or("terminated by decision")
                            .to_string(),
                    );
                    break;
                }
                DecisionAction::Replay => {
                    let count = exec_counts.get(&current.id).copied().unwrap_or(0);
                    if current.replay_allowed() && count <= current.max_replay_count {
                        // Same position runs again.
                    } else {
                        tracing::warn!(
                            phase = %current.id,
                            "replay not permitted; continuing to next phase"
                        );
                        pos += advance;
                    }
                }
                DecisionAction::Jump => match target {
                    Some(target) => match self.transition_target(&order, &registry, &target) {
                        TargetLookup::At(next) => pos = next,
                        TargetLookup::InsideConcurrentGroup => {
                            report.terminated_early = true;
                            report.termination_reason = Some(format!(
                                "jump target '{}' lies inside a concurrent group",
                                target
                            ));
                            break;
                        }
                        TargetLookup::Missing => {
                            tracing::warn!(target = %target, "jump target not found; advancing");
                            pos += advance;
                        }
                    },
                    None => {
                        tracing::warn!("jump without target; advancing");
                        pos += advance;
                    }
                },
                DecisionAction::Skip => {
                    if !current.skip_allowed() {
                        tracing::warn!(phase = %current.id, "skip not permitted; advancing");
                        pos += advance;
                    } else {
                        match target {
                            Some(target) => {
                                match self.transition_target(&order, &registry, &target) {
                                    TargetLookup::At(next) => pos = next,
                                    TargetLookup::InsideConcurrentGroup => {
                                        report.terminated_early = true;
                                        report.termination_reason = Some(format!(
                                            "skip target '{}' lies inside a concurrent group",
                                            target
                                        ));
                                        break;
                                    }
                                    TargetLookup::Missing => {
                                        tracing::warn!(target = %target, "skip target not found; advancing");
                                        pos += advance;
                                    }
                                }
                            }
                            // Skip the immediately following phase.
                            None => pos += advance + 1,
                        }
                    }
                }
            }
        }
        report.metrics.iterations = iterations as u64;
        report.metrics.total_phases = order.len() as u64;
        report
    }

    fn transition_target(
        &self,
        order: &[String],
        registry: &HashMap<String, Phase>,
        target: &str,
    ) -> TargetLookup {
        let Some(position) = order.iter().position(|id| id == target) else {
            return TargetLookup::Missing;
        };
        // A marked phase with a marked neighbor sits inside a concurrent
        // group; entering mid-group would make ordering timing-dependent.
        if registry[target].mark_concurrent {
            let before = position
                .checked_sub(1)
                .map(|i| registry[&order[i]].mark_concurrent)
                .unwrap_or(false);
            let after = order
                .get(position + 1)
                .map(|id| registry[id].mark_concurrent)
                .unwrap_or(false);
            if before || after {
                return TargetLookup::InsideConcurrentGroup;
            }
        }
        TargetLookup::At(position)
    }
}

enum TargetLookup {
    At(usize),
    InsideConcurrentGroup,
    Missing,
}

fn marked_run_len(phases: &[Phase], start: usize) -> usize {
    if !phases[start].mark_concurrent {
        return 1;
    }
    phases[start..].iter().take_while(|p| p.mark_concurrent).count().max(1)
}

fn marked_run_len_ids(
    order: &[String],
    registry: &HashMap<String, Phase>,
    start: usize,
) -> usize {
    if !registry[&order[start]].mark_concurrent {
        return 1;
    }
    order[start..]
        .iter()
        .take_while(|id| registry[*id].mark_concurrent)
        .count()
        .max(1)
}
