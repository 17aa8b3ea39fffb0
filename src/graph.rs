//! Graph execution: phases, branches, conditionals, parallel groups, and
//! merge points connected by conditional edges
//!
//! Validation runs before anything executes: unknown references and
//! undecidable cycles are configuration errors; unreachable and orphan nodes
//! are warnings (and are dropped when optimization is on). Traversal visits
//! each node at most once; merge points hold until everything they wait for
//! has been visited, where a raced-out branch still counts as visited.

use crate::branch::{Branch, BranchEngine, BranchOptions, BranchReport};
use crate::buffer::SharedBuffer;
use crate::config::{resolve, CommonConfig};
use crate::error::ConfigError;
use crate::hooks::{DecisionAction, DecisionInput};
use crate::metrics::{validate_workflow, ValidationReport, WorkflowMetrics};
use crate::phase::{Phase, PhaseEngine, PhaseReport};
use crate::workflow::HistoryEntry;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Picks the next node id.
pub type ConditionalEvaluator =
    Arc<dyn Fn(EdgeContext) -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// Caller predicate over traversal state.
pub type EdgePredicate = Arc<dyn Fn(EdgeContext) -> BoxFuture<'static, bool> + Send + Sync>;

/// What edge predicates and conditional evaluators see.
#[derive(Clone)]
pub struct EdgeContext {
    pub results: HashMap<String, NodeOutcome>,
    pub buffer: Option<SharedBuffer>,
    pub history: Vec<HistoryEntry>,
    pub current_node_id: String,
}

/// Summary of one visited node.
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub node_id: String,
    pub success: bool,
    pub skipped: bool,
}

#[derive(Clone)]
pub enum NodeKind {
    Phase(Phase),
    Branch(Branch),
    Conditional(ConditionalEvaluator),
    ParallelGroup { nodes: Vec<String> },
    MergePoint { wait_for: Vec<String> },
}

#[derive(Clone)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
}

impl Node {
    pub fn phase(phase: Phase) -> Self {
        Self { id: phase.id.clone(), kind: NodeKind::Phase(phase) }
    }

    pub fn branch(branch: Branch) -> Self {
        Self { id: branch.id.clone(), kind: NodeKind::Branch(branch) }
    }

    pub fn conditional(id: impl Into<String>, evaluator: ConditionalEvaluator) -> Self {
        Self { id: id.into(), kind: NodeKind::Conditional(evaluator) }
    }

    pub fn parallel(id: impl Into<String>, nodes: Vec<String>) -> Self {
        Self { id: id.into(), kind: NodeKind::ParallelGroup { nodes } }
    }

    pub fn merge(id: impl Into<String>, wait_for: Vec<String>) -> Self {
        Self { id: id.into(), kind: NodeKind::MergePoint { wait_for } }
    }

    fn can_terminate_cycle(&self) -> bool {
        match &self.kind {
            NodeKind::Phase(p) => p.decision_hook.is_some(),
            NodeKind::Branch(b) => b.decision_hook.is_some(),
            NodeKind::Conditional(_) => true,
            _ => false,
        }
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            NodeKind::Phase(_) => "phase",
            NodeKind::Branch(_) => "branch",
            NodeKind::Conditional(_) => "conditional",
            NodeKind::ParallelGroup { .. } => "parallel_group",
            NodeKind::MergePoint { .. } => "merge_point",
        };
        f.debug_struct("Node").field("id", &self.id).field("kind", &kind).finish()
    }
}

#[derive(Clone)]
pub enum EdgeCondition {
    Success,
    Failure,
    Always,
    Custom(EdgePredicate),
}

#[derive(Clone)]
pub struct Edge {
    pub to: String,
    pub condition: EdgeCondition,
}

impl Edge {
    pub fn on_success(to: impl Into<String>) -> Self {
        Self { to: to.into(), condition: EdgeCondition::Success }
    }

    pub fn on_failure(to: impl Into<String>) -> Self {
        Self { to: to.into(), condition: EdgeCondition::Failure }
    }

    pub fn always(to: impl Into<String>) -> Self {
        Self { to: to.into(), condition: EdgeCondition::Always }
    }

    pub fn custom(to: impl Into<String>, predicate: EdgePredicate) -> Self {
        Self { to: to.into(), condition: EdgeCondition::Custom(predicate) }
    }
}

/// The workflow graph.
#[derive(Clone, Default)]
pub struct Graph {
    pub nodes: HashMap<String, Node>,
    pub edges: HashMap<String, Vec<Edge>>,
    pub entry_point: String,
    pub exit_points: Vec<String>,
}

impl Graph {
    pub fn new(entry_point: impl Into<String>) -> Self {
        Self { entry_point: entry_point.into(), ..Self::default() }
    }

    pub fn add_node(mut self, node: Node) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn add_edge(mut self, from: impl Into<String>, edge: Edge) -> Self {
        self.edges.entry(from.into()).or_default().push(edge);
        self
    }
}

/// Graph-run controls.
#[derive(Clone)]
pub struct GraphOptions {
    pub global: CommonConfig,
    pub validate_graph: bool,
    pub optimize_execution: bool,
    pub max_graph_depth: Option<usize>,
    /// Race parallel groups whose members are all branches.
    pub enable_racing: bool,
}

impl Default for GraphOptions {
    fn default() -> Self {
        Self {
            global: CommonConfig::default(),
            validate_graph: true,
            optimize_execution: false,
            max_graph_depth: None,
            enable_racing: false,
        }
    }
}

/// Whole-graph outcome.
#[derive(Debug, Clone, Default)]
pub struct GraphReport {
    pub success: bool,
    /// Node ids in visit order.
    pub node_order: Vec<String>,
    pub phases: Vec<PhaseReport>,
    pub branches: Vec<BranchReport>,
    pub history: Vec<HistoryEntry>,
    pub warnings: Vec<String>,
    pub terminated_early: bool,
    pub termination_reason: Option<String>,
    pub metrics: WorkflowMetrics,
    pub validation: Option<ValidationReport>,
}

/// Executes graphs over the shared phase and branch engines.
#[derive(Clone)]
pub struct GraphEngine {
    phase_engine: PhaseEngine,
    branch_engine: BranchEngine,
}

impl GraphEngine {
    pub fn new(phase_engine: PhaseEngine) -> Self {
        let branch_engine = BranchEngine::new(phase_engine.clone());
        Self { phase_engine, branch_engine }
    }

    pub async fn run(
        &self,
        graph: &Graph,
        options: &GraphOptions,
        cancel: &CancellationToken,
    ) -> Result<GraphReport, ConfigError> {
        let mut warnings = Vec::new();
        if options.validate_graph {
            self.validate(graph, options, &mut warnings)?;
        }
        let mut working = graph.clone();
        if options.optimize_execution {
            let reachable = reachable_set(&working);
            working.nodes.retain(|id, _| reachable.contains(id));
            working.edges.retain(|id, _| reachable.contains(id));
        }

        let started = Instant::now();
        let mut report = self.traverse(&working, options, cancel, warnings).await;

        let executed_phases: Vec<&PhaseReport> =
            report.phases.iter().filter(|p| !p.skipped).collect();
        report.metrics.total_phases = report.phases.len() as u64;
        report.metrics.executed_phases = executed_phases.len() as u64;
        report.metrics.total_requests = executed_phases.iter().map(|p| p.total_requests).sum();
        report.metrics.successful_requests =
            executed_phases.iter().map(|p| p.successful_requests).sum();
        report.metrics.failed_requests =
            executed_phases.iter().map(|p| p.failed_requests).sum();
        report.metrics.duration_ms = started.elapsed().as_millis() as u64;

        let effective = resolve(&[&options.global]);
        report.validation = effective
            .guardrails
            .as_ref()
            .map(|g| validate_workflow(&report.metrics, &g.workflow));
        Ok(report)
    }

    fn validate(
        &self,
        graph: &Graph,
        options: &GraphOptions,
        warnings: &mut Vec<String>,
    ) -> Result<(), ConfigError> {
        if !graph.nodes.contains_key(&graph.entry_point) {
            return Err(ConfigError::MissingEntryPoint(graph.entry_point.clone()));
        }
        // Every reference must resolve.
        for (from, edges) in &graph.edges {
            for edge in edges {
                if !graph.nodes.contains_key(&edge.to) {
                    return Err(ConfigError::UnknownNode(from.clone(), edge.to.clone()));
                }
            }
        }
        for node in graph.nodes.values() {
            let referenced: Vec<&String> = match &node.kind {
                NodeKind::ParallelGroup { nodes } => nodes.iter().collect(),
                NodeKind::MergePoint { wait_for } => wait_for.iter().collect(),
                _ => Vec::new(),
            };
            for id in referenced {
                if !graph.nodes.contains_key(id) {
                    return Err(ConfigError::UnknownNode(node.id.clone(), id.clone()));
                }
            }
        }

        let reachable = reachable_set(graph);
        for id in graph.nodes.keys() {
            if !reachable.contains(id) {
                warnings.push(format!("node '{}' is unreachable from the entry point", id));
            }
        }
        // Orphans: no inbound reference and not the entry point.
        let mut inbound: HashSet<&String> = HashSet::new();
        for edges in graph.edges.values() {
            for edge in edges {
                inbound.insert(&edge.to);
            }
        }
        for node in graph.nodes.values() {
            if let NodeKind::ParallelGroup { nodes } = &node.kind {
                for id in nodes {
                    inbound.insert(id);
                }
            }
        }
        for id in graph.nodes.keys() {
            if id != &graph.entry_point && !inbound.contains(id) {
                warnings.push(format!("node '{}' has no inbound edge", id));
            }
        }

        // Cycles are tolerated only when some node on the cycle can decide
        // its way out.
        if let Some(cycle) = find_cycle(graph) {
            let decidable = cycle.iter().any(|id| {
                graph.nodes[id].can_terminate_cycle()
                    || graph
                        .edges
                        .get(id)
                        .map(|edges| {
                            edges.iter().any(|e| {
                                matches!(
                                    e.condition,
                                    EdgeCondition::Custom(_)
                                        | EdgeCondition::Failure
                                        | EdgeCondition::Success
                                )
                            })
                        })
                        .unwrap_or(false)
            });
            if decidable {
                warnings.push(format!("cycle detected through '{}'", cycle[0]));
            } else {
                return Err(ConfigError::UnterminatedCycle(cycle[0].clone()));
            }
        }

        if let Some(max) = options.max_graph_depth {
            let depth = bfs_depth(graph);
            if depth > max {
                return Err(ConfigError::DepthExceeded { depth, max });
            }
        }
        Ok(())
    }

    async fn traverse(
        &self,
        graph: &Graph,
        options: &GraphOptions,
        cancel: &CancellationToken,
        warnings: Vec<String>,
    ) -> GraphReport {
        let mut report = GraphReport { warnings, ..GraphReport::default() };
        let mut visited: HashSet<String> = HashSet::new();
        let mut outcomes: HashMap<String, NodeOutcome> = HashMap::new();
        let mut queue: VecDeque<String> = VecDeque::new();
        queue.push_back(graph.entry_point.clone());
        let mut stalled = 0usize;

        'traversal: while let Some(node_id) = queue.pop_front() {
            if cancel.is_cancelled() {
                report.terminated_early = true;
                report.termination_reason = Some("cancelled".into());
                break;
            }
            if visited.contains(&node_id) {
                continue;
            }
            let Some(node) = graph.nodes.get(&node_id) else { continue };

            if let NodeKind::MergePoint { wait_for } = &node.kind {
                if !wait_for.iter().all(|id| visited.contains(id)) {
                    // Not ready: rotate to the back, give up once nothing
                    // else can make progress.
                    stalled += 1;
                    if stalled > queue.len() + 1 {
                        report.terminated_early = true;
                        report.termination_reason = Some(format!(
                            "merge point '{}' waits on nodes that can never complete",
                            node_id
                        ));
                        break;
                    }
                    queue.push_back(node_id);
                    continue;
                }
            }
            stalled = 0;

            report.metrics.iterations += 1;
            visited.insert(node_id.clone());
            report.node_order.push(node_id.clone());

            let outcome = match &node.kind {
                NodeKind::Phase(phase) => {
                    match self.run_phase_node(phase, options, &mut report, cancel).await {
                        PhaseNodeOutcome::Done(success) => {
                            NodeOutcome { node_id: node_id.clone(), success, skipped: false }
                        }
                        PhaseNodeOutcome::Terminated(reason) => {
                            outcomes.insert(
                                node_id.clone(),
                                NodeOutcome { node_id: node_id.clone(), success: false, skipped: false },
                            );
                            report.terminated_early = true;
                            report.termination_reason = Some(reason);
                            break 'traversal;
                        }
                    }
                }
                NodeKind::Branch(branch) => {
                    let success =
                        self.run_branch_node(branch, false, options, &mut report, cancel).await;
                    NodeOutcome { node_id: node_id.clone(), success, skipped: false }
                }
                NodeKind::Conditional(evaluator) => {
                    let context = EdgeContext {
                        results: outcomes.clone(),
                        buffer: resolve(&[&options.global]).buffer,
                        history: report.history.clone(),
                        current_node_id: node_id.clone(),
                    };
                    match evaluator(context).await {
                        Ok(next) if graph.nodes.contains_key(&next) => {
                            outcomes.insert(
                                node_id.clone(),
                                NodeOutcome { node_id: node_id.clone(), success: true, skipped: false },
                            );
                            queue.push_back(next);
                            continue;
                        }
                        Ok(next) => {
                            report.terminated_early = true;
                            report.termination_reason =
                                Some(format!("conditional chose unknown node '{}'", next));
                            break;
                        }
                        Err(message) => {
                            report.terminated_early = true;
                            report.termination_reason =
                                Some(format!("conditional evaluator failed: {}", message));
                            break;
                        }
                    }
                }
                NodeKind::ParallelGroup { nodes } => {
                    let member_outcomes = self
                        .run_parallel_group(graph, nodes, options, &mut report, cancel)
                        .await;
                    let success = member_outcomes.iter().all(|o| o.success || o.skipped);
                    for outcome in member_outcomes {
                        visited.insert(outcome.node_id.clone());
                        report.node_order.push(outcome.node_id.clone());
                        outcomes.insert(outcome.node_id.clone(), outcome);
                    }
                    NodeOutcome { node_id: node_id.clone(), success, skipped: false }
                }
                NodeKind::MergePoint { .. } => {
                    NodeOutcome { node_id: node_id.clone(), success: true, skipped: false }
                }
            };
            outcomes.insert(node_id.clone(), outcome.clone());

            // Follow every matching outgoing edge.
            if let Some(edges) = graph.edges.get(&node_id) {
                for edge in edges {
                    let matched = match &edge.condition {
                        EdgeCondition::Always => true,
                        EdgeCondition::Success => outcome.success,
                        EdgeCondition::Failure => !outcome.success,
                        EdgeCondition::Custom(predicate) => {
                            let context = EdgeContext {
                                results: outcomes.clone(),
                                buffer: resolve(&[&options.global]).buffer,
                                history: report.history.clone(),
                                current_node_id: node_id.clone(),
                            };
                            predicate(context).await
                        }
                    };
                    if matched {
                        queue.push_back(edge.to.clone());
                    }
                }
            }
        }

        let executed: Vec<&PhaseReport> = report.phases.iter().filter(|p| !p.skipped).collect();
        report.success = !report.terminated_early
            && !executed.is_empty()
            && executed.iter().all(|p| p.success)
            && report.branches.iter().all(|b| b.success || b.skipped);
        report
    }

    /// Phase node with the phase-level REPLAY semantics mirrored.
    async fn run_phase_node(
        &self,
        phase: &Phase,
        options: &GraphOptions,
        report: &mut GraphReport,
        cancel: &CancellationToken,
    ) -> PhaseNodeOutcome {
        let mut execution_number = 1;
        loop {
            let mut phase_report = self
                .phase_engine
                .run_phase(phase, report.node_order.len(), execution_number, &[&options.global], cancel)
                .await;
            let decision = match &phase.decision_hook {
                Some(hook) => {
                    let input = DecisionInput {
                        phase: phase_report.clone(),
                        history: report.history.clone(),
                        buffer: resolve(&[&phase.config, &options.global]).buffer,
                        concurrent_results: None,
                    };
                    match hook(input).await {
                        Ok(decision) => Some(decision),
                        Err(message) => {
                            tracing::warn!(phase = %phase.id, error = %message, "decision hook failed");
                            None
                        }
                    }
                }
                None => None,
            };
            if let Some(decision) = &decision {
                phase_report.decision = Some(decision.action_or_continue());
            }
            let success = phase_report.success;
            report.history.push(HistoryEntry {
                phase_id: phase_report.phase_id.clone(),
                phase_index: phase_report.phase_index,
                execution_number: phase_report.execution_number,
                timestamp: phase_report.timestamp,
                success,
                execution_time_ms: phase_report.execution_time_ms,
                decision: phase_report.decision,
            });
            report.phases.push(phase_report);

            match decision.map(|d| d.action_or_continue()) {
                Some(DecisionAction::Terminate) => {
                    return PhaseNodeOutcome::Terminated("terminated by decision".into());
                }
                Some(DecisionAction::Replay)
                    if phase.replay_allowed() && execution_number <= phase.max_replay_count =>
                {
                    execution_number += 1;
                    continue;
                }
                Some(DecisionAction::Replay) => {
                    tracing::warn!(phase = %phase.id, "replay not permitted; continuing");
                    return PhaseNodeOutcome::Done(success);
                }
                Some(DecisionAction::Jump) | Some(DecisionAction::Skip) => {
                    tracing::warn!(
                        phase = %phase.id,
                        "graph transitions are edge-driven; decision ignored"
                    );
                    return PhaseNodeOutcome::Done(success);
                }
                _ => return PhaseNodeOutcome::Done(success),
            }
        }
    }

    async fn run_branch_node(
        &self,
        branch: &Branch,
        racing: bool,
        options: &GraphOptions,
        report: &mut GraphReport,
        cancel: &CancellationToken,
    ) -> bool {
        let branch_options = BranchOptions {
            global: options.global.clone(),
            enable_branch_racing: racing,
            ..BranchOptions::default()
        };
        match self.branch_engine.run(vec![branch.clone()], &branch_options, cancel).await {
            Ok(run) => {
                let success = run.success;
                report.history.extend(run.history);
                for branch_report in run.branches {
                    report.phases.extend(branch_report.phases.clone());
                    report.branches.push(branch_report);
                }
                success
            }
            Err(e) => {
                tracing::warn!(branch = %branch.id, error = %e, "branch node failed to start");
                false
            }
        }
    }

    /// Run a parallel group. All-branch groups may race; losers come back
    /// skipped but still count as visited.
    async fn run_parallel_group(
        &self,
        graph: &Graph,
        members: &[String],
        options: &GraphOptions,
        report: &mut GraphReport,
        cancel: &CancellationToken,
    ) -> Vec<NodeOutcome> {
        let all_branches = members
            .iter()
            .all(|id| matches!(graph.nodes.get(id).map(|n| &n.kind), Some(NodeKind::Branch(_))));

        if all_branches && options.enable_racing {
            let branches: Vec<Branch> = members
                .iter()
                .filter_map(|id| match &graph.nodes[id].kind {
                    NodeKind::Branch(b) => Some(b.clone()),
                    _ => None,
                })
                .collect();
            let branch_options = BranchOptions {
                global: options.global.clone(),
                enable_branch_racing: true,
                ..BranchOptions::default()
            };
            return match self.branch_engine.run(branches, &branch_options, cancel).await {
                Ok(run) => {
                    report.history.extend(run.history);
                    let mut outcomes = Vec::new();
                    for branch_report in run.branches {
                        outcomes.push(NodeOutcome {
                            node_id: branch_report.branch_id.clone(),
                            success: branch_report.success,
                            skipped: branch_report.skipped,
                        });
                        report.phases.extend(branch_report.phases.clone());
                        report.branches.push(branch_report);
                    }
                    outcomes
                }
                Err(e) => {
                    tracing::warn!(error = %e, "racing group failed to start");
                    members
                        .iter()
                        .map(|id| NodeOutcome {
                            node_id: id.clone(),
                            success: false,
                            skipped: true,
                        })
                        .collect()
                }
            };
        }

        // Plain concurrent execution of phase/branch members.
        let mut futs = FuturesUnordered::new();
        for (offset, member_id) in members.iter().enumerate() {
            let node = graph.nodes[member_id].clone();
            let engine = self.clone();
            let options = options.clone();
            let cancel = cancel.clone();
            futs.push(async move {
                let result = match node.kind {
                    NodeKind::Phase(phase) => {
                        let phase_report = engine
                            .phase_engine
                            .run_phase(&phase, offset, 1, &[&options.global], &cancel)
                            .await;
                        MemberResult::Phase(phase_report)
                    }
                    NodeKind::Branch(branch) => {
                        let branch_options =
                            BranchOptions { global: options.global.clone(), ..BranchOptions::default() };
                        match engine
                            .branch_engine
                            .run(vec![branch], &branch_options, &cancel)
                            .await
                        {
                            Ok(run) => MemberResult::Branches(run),
                            Err(_) => MemberResult::Failed,
                        }
                    }
                    _ => MemberResult::Failed,
                };
                (offset, result)
            });
        }
        let mut slots: Vec<Option<MemberResult>> = (0..members.len()).map(|_| None).collect();
        while let Some((offset, result)) = futs.next().await {
            slots[offset] = Some(result);
        }

        let mut outcomes = Vec::new();
        for (offset, slot) in slots.into_iter().enumerate() {
            let node_id = members[offset].clone();
            match slot {
                Some(MemberResult::Phase(phase_report)) => {
                    let success = phase_report.success;
                    report.history.push(HistoryEntry {
                        phase_id: phase_report.phase_id.clone(),
                        phase_index: phase_report.phase_index,
                        execution_number: phase_report.execution_number,
                        timestamp: phase_report.timestamp,
                        success,
                        execution_time_ms: phase_report.execution_time_ms,
                        decision: phase_report.decision,
                    });
                    report.phases.push(phase_report);
                    outcomes.push(NodeOutcome { node_id, success, skipped: false });
                }
                Some(MemberResult::Branches(run)) => {
                    let success = run.success;
                    report.history.extend(run.history);
                    for branch_report in run.branches {
                        report.phases.extend(branch_report.phases.clone());
                        report.branches.push(branch_report);
                    }
                    outcomes.push(NodeOutcome { node_id, success, skipped: false });
                }
                Some(MemberResult::Failed) | None => {
                    outcomes.push(NodeOutcome { node_id, success: false, skipped: true });
                }
            }
        }
        outcomes
    }
}

enum PhaseNodeOutcome {
    Done(bool),
    Terminated(String),
}

enum MemberResult {
    Phase(PhaseReport),
    Branches(crate::branch::BranchRunReport),
    Failed,
}

/// Everything reachable from the entry point, through edges and structural
/// references.
fn reachable_set(graph: &Graph) -> HashSet<String> {
    let mut reachable = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(graph.entry_point.clone());
    while let Some(id) = queue.pop_front() {
        if !reachable.insert(id.clone()) {
            continue;
        }
        if let Some(node) = graph.nodes.get(&id) {
            match &node.kind {
                NodeKind::ParallelGroup { nodes } => {
                    for n in nodes {
                        queue.push_back(n.clone());
                    }
                }
                NodeKind::MergePoint { .. } => {}
                _ => {}
            }
        }
        if let Some(edges) = graph.edges.get(&id) {
            for edge in edges {
                queue.push_back(edge.to.clone());
            }
        }
    }
    reachable
}

/// DFS cycle detection over edges; returns the nodes of one cycle.
fn find_cycle(graph: &Graph) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }
    fn visit(
        id: &str,
        graph: &Graph,
        marks: &mut HashMap<String, Mark>,
        stack: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        match marks.get(id) {
            Some(Mark::Done) => return None,
            Some(Mark::InProgress) => {
                let start = stack.iter().position(|s| s == id).unwrap_or(0);
                return Some(stack[start..].to_vec());
            }
            None => {}
        }
        marks.insert(id.to_string(), Mark::InProgress);
        stack.push(id.to_string());
        if let Some(edges) = graph.edges.get(id) {
            for edge in edges {
                if let Some(cycle) = visit(&edge.to, graph, marks, stack) {
                    return Some(cycle);
                }
            }
        }
        stack.pop();
        marks.insert(id.to_string(), Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    for id in graph.nodes.keys() {
        if let Some(cycle) = visit(id, graph, &mut marks, &mut stack) {
            return Some(cycle);
        }
    }
    None
}

/// Longest shortest-path depth from the entry point.
fn bfs_depth(graph: &Graph) -> usize {
    let mut depths: HashMap<String, usize> = HashMap::new();
    let mut queue = VecDeque::new();
    depths.insert(graph.entry_point.clone(), 0);
    queue.push_back(graph.entry_point.clone());
    let mut max_depth = 0;
    while let Some(id) = queue.pop_front() {
        let depth = depths[&id];
        max_depth = max_depth.max(depth);
        if let Some(edges) = graph.edges.get(&id) {
            for edge in edges {
                if !depths.contains_key(&edge.to) {
                    depths.insert(edge.to.clone(), depth + 1);
                    queue.push_back(edge.to.clone());
                }
            }
        }
    }
    max_depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::AttemptRunner;
    use crate::backoff::WaitStrategy;
    use crate::branch::RACE_LOSER_ERROR;
    use crate::gateway::GatewayExecutor;
    use crate::hooks::{self, Decision};
    use crate::http::{HttpCall, HttpResponse, Transport, TransportFailure};
    use crate::operation::Operation;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    struct GraphTransport {
        delays: HashMap<String, Duration>,
        statuses: HashMap<String, u16>,
        visited: Mutex<Vec<String>>,
    }

    impl GraphTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delays: HashMap::new(),
                statuses: HashMap::new(),
                visited: Mutex::new(Vec::new()),
            })
        }

        fn with_delay(mut self: Arc<Self>, path: &str, delay: Duration) -> Arc<Self> {
            Arc::get_mut(&mut self).unwrap().delays.insert(path.to_string(), delay);
            self
        }

        fn with_status(mut self: Arc<Self>, path: &str, status: u16) -> Arc<Self> {
            Arc::get_mut(&mut self).unwrap().statuses.insert(path.to_string(), status);
            self
        }

        fn visited(&self) -> Vec<String> {
            self.visited.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for GraphTransport {
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
            let status = self.statuses.get(&call.path).copied().unwrap_or(200);
            Ok(HttpResponse {
                status,
                status_text: "".into(),
                headers: BTreeMap::new(),
                body: json!({}),
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

    fn engine(transport: Arc<dyn Transport>) -> GraphEngine {
        GraphEngine::new(PhaseEngine::new(GatewayExecutor::new(
            AttemptRunner::new().with_transport(transport),
        )))
    }

    fn options() -> GraphOptions {
        GraphOptions { global: fast(), ..GraphOptions::default() }
    }

    #[tokio::test]
    async fn linear_chain_follows_success_edges() {
        let transport = GraphTransport::new();
        let engine = engine(transport.clone());
        let graph = Graph::new("start")
            .add_node(Node::phase(phase("start")))
            .add_node(Node::phase(phase("middle")))
            .add_node(Node::phase(phase("end")))
            .add_edge("start", Edge::on_success("middle"))
            .add_edge("middle", Edge::on_success("end"));
        let report = engine.run(&graph, &options(), &CancellationToken::new()).await.unwrap();
        assert!(report.success);
        assert_eq!(report.node_order, vec!["start", "middle", "end"]);
        assert_eq!(transport.visited(), vec!["/start", "/middle", "/end"]);
    }

    #[tokio::test]
    async fn failure_edges_route_errors() {
        let transport = GraphTransport::new().with_status("/start", 500);
        let engine = engine(transport.clone());
        let graph = Graph::new("start")
            .add_node(Node::phase(phase("start")))
            .add_node(Node::phase(phase("recover")))
            .add_node(Node::phase(phase("happy")))
            .add_edge("start", Edge::on_success("happy"))
            .add_edge("start", Edge::on_failure("recover"));
        let report = engine.run(&graph, &options(), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.node_order, vec!["start", "recover"]);
        assert!(!transport.visited().contains(&"/happy".to_string()));
    }

    #[tokio::test]
    async fn conditional_picks_next_node() {
        let transport = GraphTransport::new();
        let engine = engine(transport.clone());
        let graph = Graph::new("decide")
            .add_node(Node::conditional(
                "decide",
                Arc::new(|_ctx| Box::pin(async { Ok("right".to_string()) })),
            ))
            .add_node(Node::phase(phase("left")))
            .add_node(Node::phase(phase("right")));
        let report = engine.run(&graph, &options(), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.node_order, vec!["decide", "right"]);
        assert!(!transport.visited().contains(&"/left".to_string()));
    }

    #[tokio::test]
    async fn merge_point_waits_for_parallel_members() {
        let transport = GraphTransport::new()
            .with_delay("/a", Duration::from_millis(30))
            .with_delay("/b", Duration::from_millis(5));
        let engine = engine(transport.clone());
        let graph = Graph::new("fork")
            .add_node(Node::parallel("fork", vec!["a".into(), "b".into()]))
            .add_node(Node::phase(phase("a")))
            .add_node(Node::phase(phase("b")))
            .add_node(Node::merge("join", vec!["a".into(), "b".into()]))
            .add_node(Node::phase(phase("end")))
            .add_edge("fork", Edge::always("join"))
            .add_edge("join", Edge::always("end"));
        let report = engine.run(&graph, &options(), &CancellationToken::new()).await.unwrap();
        assert!(report.success);
        let end_pos = report.node_order.iter().position(|n| n == "end").unwrap();
        let join_pos = report.node_order.iter().position(|n| n == "join").unwrap();
        let a_pos = report.node_order.iter().position(|n| n == "a").unwrap();
        let b_pos = report.node_order.iter().position(|n| n == "b").unwrap();
        assert!(a_pos < join_pos && b_pos < join_pos && join_pos < end_pos);
        // End executes exactly once.
        assert_eq!(report.node_order.iter().filter(|n| *n == "end").count(), 1);
    }

    #[tokio::test]
    async fn racing_branch_group_skips_losers_and_reaches_merge() {
        let transport = GraphTransport::new()
            .with_delay("/slow", Duration::from_millis(500))
            .with_delay("/quick", Duration::from_millis(10));
        let engine = engine(transport);
        let branch_a = Branch::new("a", vec![phase("slow")]);
        let branch_b = Branch::new("b", vec![phase("quick")]);
        let graph = Graph::new("race")
            .add_node(Node::parallel("race", vec!["a".into(), "b".into()]))
            .add_node(Node::branch(branch_a))
            .add_node(Node::branch(branch_b))
            .add_node(Node::merge("join", vec!["a".into(), "b".into()]))
            .add_node(Node::phase(phase("end")))
            .add_edge("race", Edge::always("join"))
            .add_edge("join", Edge::always("end"));
        let mut opts = options();
        opts.enable_racing = true;
        let report = engine.run(&graph, &opts, &CancellationToken::new()).await.unwrap();

        let loser = report.branches.iter().find(|b| b.branch_id == "a").unwrap();
        assert!(loser.skipped || !loser.success);
        assert_eq!(loser.error.as_deref(), Some(RACE_LOSER_ERROR));
        let winner = report.branches.iter().find(|b| b.branch_id == "b").unwrap();
        assert!(winner.success);
        // The merge point fires even though one child lost the race.
        assert_eq!(report.node_order.iter().filter(|n| *n == "end").count(), 1);
        assert!(report.success);
    }

    #[tokio::test]
    async fn validation_rejects_unknown_references() {
        let graph = Graph::new("start")
            .add_node(Node::phase(phase("start")))
            .add_edge("start", Edge::on_success("ghost"));
        let engine = engine(GraphTransport::new());
        let err = engine.run(&graph, &options(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ConfigError::UnknownNode(_, _)));

        let graph = Graph::new("missing");
        let err = engine.run(&graph, &options(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ConfigError::MissingEntryPoint(_)));
    }

    #[tokio::test]
    async fn undecidable_cycle_is_fatal_decidable_cycle_warns() {
        let engine = engine(GraphTransport::new());
        // a -> b -> a with unconditional edges and no decision capability.
        let graph = Graph::new("a")
            .add_node(Node::phase(phase("a")))
            .add_node(Node::phase(phase("b")))
            .add_edge("a", Edge::always("b"))
            .add_edge("b", Edge::always("a"));
        let err = engine.run(&graph, &options(), &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ConfigError::UnterminatedCycle(_)));

        // The same shape with a decision hook is tolerated with a warning;
        // the hook terminates the second pass. Visit-once traversal still
        // bounds execution.
        let decider = phase("a").with_decision_hook(hooks::phase_decision(|_| async {
            Ok(Decision::proceed())
        }));
        let graph = Graph::new("a")
            .add_node(Node::phase(decider))
            .add_node(Node::phase(phase("b")))
            .add_edge("a", Edge::always("b"))
            .add_edge("b", Edge::always("a"));
        let report = engine.run(&graph, &options(), &CancellationToken::new()).await.unwrap();
        assert!(report.warnings.iter().any(|w| w.contains("cycle")));
        assert_eq!(report.node_order, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn depth_bound_is_enforced() {
        let engine = engine(GraphTransport::new());
        let graph = Graph::new("one")
            .add_node(Node::phase(phase("one")))
            .add_node(Node::phase(phase("two")))
            .add_node(Node::phase(phase("three")))
            .add_edge("one", Edge::always("two"))
            .add_edge("two", Edge::always("three"));
        let mut opts = options();
        opts.max_graph_depth = Some(1);
        let err = engine.run(&graph, &opts, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ConfigError::DepthExceeded { depth: 2, max: 1 }));
    }

    #[tokio::test]
    async fn optimization_drops_unreachable_nodes() {
        let transport = GraphTransport::new();
        let engine = engine(transport.clone());
        let graph = Graph::new("start")
            .add_node(Node::phase(phase("start")))
            .add_node(Node::phase(phase("island")));
        let mut opts = options();
        opts.optimize_execution = true;
        let report = engine.run(&graph, &opts, &CancellationToken::new()).await.unwrap();
        assert!(report.warnings.iter().any(|w| w.contains("island")));
        assert_eq!(report.node_order, vec!["start"]);
    }

    #[tokio::test]
    async fn phase_node_replay_decision_reruns() {
        let transport = GraphTransport::new();
        let engine = engine(transport.clone());
        let flaky = phase("flaky")
            .with_max_replay_count(1)
            .with_decision_hook(hooks::phase_decision(|input| async move {
                if input.phase.execution_number == 1 {
                    Ok(Decision::replay())
                } else {
                    Ok(Decision::proceed())
                }
            }));
        let graph = Graph::new("flaky").add_node(Node::phase(flaky));
        let report = engine.run(&graph, &options(), &CancellationToken::new()).await.unwrap();
        assert_eq!(report.phases.len(), 2);
        assert_eq!(report.phases[1].execution_number, 2);
        assert_eq!(transport.visited().len(), 2);
    }
}
