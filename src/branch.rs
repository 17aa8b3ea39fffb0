//! Branch execution: ordered phase lists with branch-level decisions
//!
//! Branches run sequentially, all together, or as a race where the first
//! branch to complete wins and the rest are cancelled and reported skipped.

use crate::config::{resolve, CommonConfig};
use crate::error::ConfigError;
use crate::hooks::{BranchDecisionHook, BranchDecisionInput, DecisionAction};
use crate::metrics::{validate_branch, BranchMetrics, ValidationReport, WorkflowMetrics};
use crate::phase::{Phase, PhaseEngine, PhaseReport, DEFAULT_MAX_REPLAY_COUNT};
use crate::workflow::{HistoryEntry, DEFAULT_MAX_WORKFLOW_ITERATIONS};
use futures::stream::{FuturesUnordered, StreamExt};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Error text attached to branches that lost a race.
pub const RACE_LOSER_ERROR: &str = "cancelled — another branch won the race";

/// An ordered list of phases with its own config and decision hook.
#[derive(Clone, Default)]
pub struct Branch {
    pub id: String,
    pub phases: Vec<Phase>,
    pub config: CommonConfig,
    pub mark_concurrent: bool,
    pub allow_replay: Option<bool>,
    pub max_replay_count: u32,
    pub allow_skip: Option<bool>,
    pub decision_hook: Option<BranchDecisionHook>,
}

impl Branch {
    pub fn new(id: impl Into<String>, phases: Vec<Phase>) -> Self {
        Self {
            id: id.into(),
            phases,
            max_replay_count: DEFAULT_MAX_REPLAY_COUNT,
            ..Self::default()
        }
    }

    pub fn with_config(mut self, config: CommonConfig) -> Self {
        self.config = config;
        self
    }

    pub fn marked_concurrent(mut self) -> Self {
        self.mark_concurrent = true;
        self
    }

    pub fn with_decision_hook(mut self, hook: BranchDecisionHook) -> Self {
        self.decision_hook = Some(hook);
        self
    }

    pub fn replay_allowed(&self) -> bool {
        self.allow_replay != Some(false)
    }

    pub fn skip_allowed(&self) -> bool {
        self.allow_skip != Some(false)
    }
}

impl std::fmt::Debug for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("phases", &self.phases.len())
            .field("mark_concurrent", &self.mark_concurrent)
            .finish()
    }
}

/// Branch-run controls.
#[derive(Clone, Default)]
pub struct BranchOptions {
    pub global: CommonConfig,
    /// Dispatch every branch together (also implied when all branches are
    /// marked concurrent).
    pub concurrent_branches: bool,
    /// First branch to complete wins; the rest are cancelled.
    pub enable_branch_racing: bool,
    /// Within a branch, stop its phase list after a failed phase.
    pub stop_on_first_phase_error: bool,
    pub max_iterations: Option<u32>,
}

/// One branch's outcome.
#[derive(Debug, Clone, Default)]
pub struct BranchReport {
    pub branch_id: String,
    pub branch_index: usize,
    pub execution_number: u32,
    pub success: bool,
    pub phases: Vec<PhaseReport>,
    pub skipped: bool,
    pub error: Option<String>,
    pub decision: Option<DecisionAction>,
    pub metrics: BranchMetrics,
    pub validation: Option<ValidationReport>,
}

/// Whole-run outcome across branches.
#[derive(Debug, Clone, Default)]
pub struct BranchRunReport {
    pub success: bool,
    pub branches: Vec<BranchReport>,
    pub history: Vec<HistoryEntry>,
    pub terminated_early: bool,
    pub termination_reason: Option<String>,
    pub metrics: WorkflowMetrics,
}

/// Runs branches over the shared phase engine.
#[derive(Clone)]
pub struct BranchEngine {
    phase_engine: PhaseEngine,
}

impl BranchEngine {
    pub fn new(phase_engine: PhaseEngine) -> Self {
        Self { phase_engine }
    }

    pub async fn run(
        &self,
        branches: Vec<Branch>,
        options: &BranchOptions,
        cancel: &CancellationToken,
    ) -> Result<BranchRunReport, ConfigError> {
        if branches.is_empty() {
            return Err(ConfigError::EmptyWorkflow);
        }
        let mut seen = std::collections::HashSet::new();
        for branch in &branches {
            if !seen.insert(branch.id.clone()) {
                return Err(ConfigError::DuplicatePhaseId(branch.id.clone()));
            }
        }

        let started = Instant::now();
        let concurrent = options.concurrent_branches
            || options.enable_branch_racing
            || branches.iter().all(|b| b.mark_concurrent);
        let mut report = if concurrent {
            self.run_concurrent(branches, options, cancel).await
        } else {
            self.run_sequential(branches, options, cancel).await
        };

        let executed: Vec<&BranchReport> =
            report.branches.iter().filter(|b| !b.skipped).collect();
        report.success = !executed.is_empty() && executed.iter().all(|b| b.success);
        report.metrics.total_phases =
            report.branches.iter().map(|b| b.phases.len() as u64).sum();
        report.metrics.executed_phases = executed.iter().map(|b| b.phases.len() as u64).sum();
        report.metrics.total_requests =
            executed.iter().map(|b| b.metrics.total_requests).sum();
        report.metrics.successful_requests =
            executed.iter().map(|b| b.metrics.successful_requests).sum();
        report.metrics.failed_requests =
            executed.iter().map(|b| b.metrics.failed_requests).sum();
        report.metrics.duration_ms = started.elapsed().as_millis() as u64;
        Ok(report)
    }

    /// Run one branch's phases in order.
    async fn run_branch(
        &self,
        branch: &Branch,
        branch_index: usize,
        execution_number: u32,
        options: &BranchOptions,
        cancel: &CancellationToken,
    ) -> BranchReport {
        let started = Instant::now();
        let mut phases = Vec::new();
        let levels: [&CommonConfig; 2] = [&branch.config, &options.global];
        for (index, phase) in branch.phases.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let phase_report =
                self.phase_engine.run_phase(phase, index, 1, &levels, cancel).await;
            let failed = !phase_report.success;
            phases.push(phase_report);
            if failed && options.stop_on_first_phase_error {
                break;
            }
        }

        let metrics = BranchMetrics {
            total_phases: phases.len() as u64,
            total_requests: phases.iter().map(|p| p.total_requests).sum(),
            successful_requests: phases.iter().map(|p| p.successful_requests).sum(),
            failed_requests: phases.iter().map(|p| p.failed_requests).sum(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        let effective = resolve(&[&branch.config, &options.global]);
        let validation =
            effective.guardrails.as_ref().map(|g| validate_branch(&metrics, &g.branch));

        let success = !phases.is_empty() && phases.iter().all(|p| p.success);
        let cancelled = cancel.is_cancelled();
        BranchReport {
            branch_id: branch.id.clone(),
            branch_index,
            execution_number,
            success: success && !cancelled,
            error: if cancelled { Some(RACE_LOSER_ERROR.to_string()) } else { None },
            phases,
            skipped: false,
            decision: None,
            metrics,
            validation,
        }
    }

    async fn decide(
        &self,
        branch: &Branch,
        report: &BranchReport,
        history: &[HistoryEntry],
        options: &BranchOptions,
    ) -> Option<crate::hooks::Decision> {
        let hook = branch.decision_hook.as_ref()?;
        let buffer = resolve(&[&branch.config, &options.global]).buffer;
        let input = BranchDecisionInput {
            branch_id: branch.id.clone(),
            phases: report.phases.clone(),
            history: history.to_vec(),
            buffer,
        };
        match hook(input).await {
            Ok(decision) => Some(decision),
            Err(message) => {
                tracing::warn!(branch = %branch.id, error = %message, "branch decision hook failed");
                None
            }
        }
    }

    async fn run_sequential(
        &self,
        branches: Vec<Branch>,
        options: &BranchOptions,
        cancel: &CancellationToken,
    ) -> BranchRunReport {
        let mut report = BranchRunReport::default();
        let mut exec_counts: Vec<u32> = vec![0; branches.len()];
        let mut pos = 0usize;
        let mut iterations = 0u32;
        let bound = options.max_iterations.unwrap_or(DEFAULT_MAX_WORKFLOW_ITERATIONS);

        while pos < branches.len() {
            if cancel.is_cancelled() {
                report.terminated_early = true;
                report.termination_reason = Some("cancelled".into());
                break;
            }
            if iterations >= bound {
                report.terminated_early = true;
                report.termination_reason = Some(format!("exceeded {} iterations", bound));
                break;
            }
            iterations += 1;

            let branch = &branches[pos];
            exec_counts[pos] += 1;
            let mut branch_report =
                self.run_branch(branch, pos, exec_counts[pos], options, cancel).await;
            let decision =
                self.decide(branch, &branch_report, &report.history, options).await;
            if let Some(decision) = &decision {
                branch_report.decision = Some(decision.action_or_continue());
            }
            for phase in &branch_report.phases {
                report.history.push(history_entry(phase));
            }
            report.branches.push(branch_report);

            let action = decision
                .as_ref()
                .map(|d| d.action_or_continue())
                .unwrap_or(DecisionAction::Continue);
            let target = decision.as_ref().and_then(|d| d.target_phase_id.clone());
            match action {
                DecisionAction::Continue => pos += 1,
                DecisionAction::Terminate => {
                    report.terminated_early = true;
                    report.termination_reason = Some("terminated by branch decision".into());
                    break;
                }
                DecisionAction::Jump => match target
                    .and_then(|t| branches.iter().position(|b| b.id == t))
                {
                    Some(next) => pos = next,
                    None => {
                        tracing::warn!("branch jump target not found; advancing");
                        pos += 1;
                    }
                },
                DecisionAction::Replay => {
                    if branch.replay_allowed() && exec_counts[pos] <= branch.max_replay_count {
                        // Run the same branch again.
                    } else {
                        tracing::warn!(branch = %branch.id, "branch replay not permitted; advancing");
                        pos += 1;
                    }
                }
                DecisionAction::Skip => {
                    if branch.skip_allowed() {
                        pos += 2;
                    } else {
                        tracing::warn!(branch = %branch.id, "branch skip not permitted; advancing");
                        pos += 1;
                    }
                }
            }
        }
        report.metrics.iterations = iterations as u64;
        report
    }

    async fn run_concurrent(
        &self,
        branches: Vec<Branch>,
        options: &BranchOptions,
        cancel: &CancellationToken,
    ) -> BranchRunReport {
        let mut report = BranchRunReport::default();
        let race_cancel = cancel.child_token();
        let mut futs = FuturesUnordered::new();
        for (index, branch) in branches.iter().enumerate() {
            let engine = self.clone();
            let options = options.clone();
            let token = race_cancel.clone();
            let branch = branch.clone();
            futs.push(async move {
                let result = engine.run_branch(&branch, index, 1, &options, &token).await;
                (index, branch, result)
            });
        }

        let mut winner: Option<usize> = None;
        let mut slots: Vec<Option<BranchReport>> = vec![None; branches.len()];
        while let Some((index, branch, mut branch_report)) = futs.next().await {
            if options.enable_branch_racing {
                if winner.is_none() {
                    winner = Some(index);
                    race_cancel.cancel();
                } else if winner != Some(index) {
                    branch_report.skipped = true;
                    branch_report.success = false;
                    branch_report.error = Some(RACE_LOSER_ERROR.to_string());
                    for phase in &mut branch_report.phases {
                        phase.skipped = true;
                    }
                }
            }
            if let Some(decision) =
                self.decide(&branch, &branch_report, &report.history, options).await
            {
                branch_report.decision = Some(decision.action_or_continue());
            }
            slots[index] = Some(branch_report);
        }

        for (index, slot) in slots.into_iter().enumerate() {
            let branch_report = slot.unwrap_or_else(|| BranchReport {
                branch_id: branches[index].id.clone(),
                branch_index: index,
                skipped: true,
                error: Some(RACE_LOSER_ERROR.to_string()),
                ..BranchReport::default()
            });
            if !branch_report.skipped {
                for phase in &branch_report.phases {
                    report.history.push(history_entry(phase));
                }
            }
            report.branches.push(branch_report);
        }
        report.metrics.iterations = 1;
        report
    }
}

fn history_entry(phase: &PhaseReport) -> HistoryEntry {
    HistoryEntry {
        phase_id: phase.phase_id.clone(),
        phase_index: phase.phase_index,
        execution_number: phase.execution_number,
        timestamp: phase.timestamp,
        success: phase.success,
        execution_time_ms: phase.execution_time_ms,
        decision: phase.decision,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::AttemptRunner;
    use crate::backoff::WaitStrategy;
    use crate::gateway::GatewayExecutor;
    use crate::hooks::{self, Decision};
    use crate::http::{HttpCall, HttpResponse, Transport, TransportFailure};
    use crate::operation::Operation;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    struct SlowTransport {
        delays: HashMap<String, Duration>,
        visited: Mutex<Vec<String>>,
    }

    impl SlowTransport {
        fn new(delays: Vec<(&str, Duration)>) -> Arc<Self> {
            Arc::new(Self {
                delays: delays.into_iter().map(|(p, d)| (p.to_string(), d)).collect(),
                visited: Mutex::new(Vec::new()),
            })
        }

        fn visited(&self) -> Vec<String> {
            self.visited.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for SlowTransport {
        async fn send(
            &self,
            call: &HttpCall,
            cancel: CancellationToken,
        ) -> Result<HttpResponse, TransportFailure> {
            if let Some(delay) = self.delays.get(&call.path) {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(TransportFailure::network(
                            crate::error::NetworkErrorCode::ConnReset,
                            "cancelled",
                        ));
                    }
                    _ = tokio::time::sleep(*delay) => {}
                }
            }
            self.visited.lock().unwrap().push(call.path.clone());
            Ok(HttpResponse {
                status: 200,
                status_text: "".into(),
                headers: BTreeMap::new(),
                body: json!({"path": call.path}),
            })
        }
    }

    fn fast() -> CommonConfig {
        CommonConfig::new().with_attempts(1).with_backoff(WaitStrategy::Fixed, Duration::ZERO)
    }

    fn phase(id: &str) -> Phase {
        Phase::new(
            id,
            vec![Operation::request(
                format!("{}-op", id),
                HttpCall::get("api.example.com", format!("/{}", id)).unwrap(),
            )],
        )
    }

    fn engine(transport: Arc<dyn Transport>) -> BranchEngine {
        BranchEngine::new(PhaseEngine::new(GatewayExecutor::new(
            AttemptRunner::new().with_transport(transport),
        )))
    }

    fn options() -> BranchOptions {
        BranchOptions { global: fast(), ..BranchOptions::default() }
    }

    #[tokio::test]
    async fn sequential_branches_run_in_order() {
        let transport = SlowTransport::new(vec![]);
        let engine = engine(transport.clone());
        let branches = vec![
            Branch::new("first", vec![phase("a"), phase("b")]),
            Branch::new("second", vec![phase("c")]),
        ];
        let report =
            engine.run(branches, &options(), &CancellationToken::new()).await.unwrap();
        assert!(report.success);
        assert_eq!(report.branches.len(), 2);
        assert_eq!(transport.visited(), vec!["/a", "/b", "/c"]);
        assert_eq!(report.metrics.total_requests, 3);
        assert_eq!(report.branches[0].metrics.total_phases, 2);
    }

    #[tokio::test]
    async fn branch_decision_terminate_stops_the_run() {
        let transport = SlowTransport::new(vec![]);
        let engine = engine(transport.clone());
        let stopper = Branch::new("stopper", vec![phase("a")]).with_decision_hook(
            hooks::branch_decision(|_| async { Ok(Decision::terminate()) }),
        );
        let branches = vec![stopper, Branch::new("never", vec![phase("b")])];
        let report =
            engine.run(branches, &options(), &CancellationToken::new()).await.unwrap();
        assert!(report.terminated_early);
        assert_eq!(report.branches.len(), 1);
        assert!(!transport.visited().contains(&"/b".to_string()));
    }

    #[tokio::test]
    async fn branch_decision_jump_targets_by_id() {
        let transport = SlowTransport::new(vec![]);
        let engine = engine(transport.clone());
        let jumper = Branch::new("jumper", vec![phase("a")]).with_decision_hook(
            hooks::branch_decision(|_| async { Ok(Decision::jump_to("third")) }),
        );
        let branches = vec![
            jumper,
            Branch::new("second", vec![phase("b")]),
            Branch::new("third", vec![phase("c")]),
        ];
        let report =
            engine.run(branches, &options(), &CancellationToken::new()).await.unwrap();
        assert!(report.success);
        assert_eq!(transport.visited(), vec!["/a", "/c"]);
    }

    #[tokio::test]
    async fn concurrent_branches_all_settle() {
        let transport = SlowTransport::new(vec![
            ("/a", Duration::from_millis(30)),
            ("/c", Duration::from_millis(5)),
        ]);
        let engine = engine(transport.clone());
        let mut opts = options();
        opts.concurrent_branches = true;
        let branches = vec![
            Branch::new("slow", vec![phase("a")]),
            Branch::new("fast", vec![phase("c")]),
        ];
        let report = engine.run(branches, &opts, &CancellationToken::new()).await.unwrap();
        assert!(report.success);
        assert_eq!(report.branches.len(), 2);
        assert!(report.branches.iter().all(|b| !b.skipped));
    }

    #[tokio::test]
    async fn racing_branches_cancel_losers() {
        let transport = SlowTransport::new(vec![
            ("/slow", Duration::from_millis(500)),
            ("/quick", Duration::from_millis(10)),
        ]);
        let engine = engine(transport);
        let mut opts = options();
        opts.enable_branch_racing = true;
        let branches = vec![
            Branch::new("loser", vec![phase("slow")]),
            Branch::new("winner", vec![phase("quick")]),
        ];
        let report = engine.run(branches, &opts, &CancellationToken::new()).await.unwrap();
        let winner = report.branches.iter().find(|b| b.branch_id == "winner").unwrap();
        assert!(winner.success);
        assert!(!winner.skipped);
        let loser = report.branches.iter().find(|b| b.branch_id == "loser").unwrap();
        assert!(loser.skipped || !loser.success);
        assert_eq!(loser.error.as_deref(), Some(RACE_LOSER_ERROR));
        // Overall success considers only the winner.
        assert!(report.success);
    }

    #[tokio::test]
    async fn all_marked_concurrent_implies_concurrent_mode() {
        let transport = SlowTransport::new(vec![
            ("/a", Duration::from_millis(20)),
            ("/b", Duration::from_millis(20)),
        ]);
        let engine = engine(transport);
        let branches = vec![
            Branch::new("x", vec![phase("a")]).marked_concurrent(),
            Branch::new("y", vec![phase("b")]).marked_concurrent(),
        ];
        let started = Instant::now();
        let report =
            engine.run(branches, &options(), &CancellationToken::new()).await.unwrap();
        assert!(report.success);
        // Parallel: well under the 40ms serial floor.
        assert!(started.elapsed() < Duration::from_millis(38));
    }
}
