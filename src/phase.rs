//! A phase: one gateway plus decision-hook plumbing
//!
//! The phase itself only shapes and runs its batch; decision hooks are
//! invoked by the workflow engine, which owns the history and transition
//! rules. `mark_concurrent` is likewise consumed by the workflow engine.

use crate::config::{resolve, CommonConfig};
use crate::gateway::{GatewayEntry, GatewayExecutor, GatewayOptions, Group};
use crate::hooks::{DecisionAction, PhaseDecisionHook};
use crate::metrics::{validate_phase, PhaseMetrics, ValidationReport};
use crate::operation::Operation;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default ceiling on replays of a single phase.
pub const DEFAULT_MAX_REPLAY_COUNT: u32 = 3;

/// One workflow step.
#[derive(Clone, Default)]
pub struct Phase {
    pub id: String,
    pub operations: Vec<Operation>,
    pub groups: Vec<Group>,
    pub config: CommonConfig,
    /// Run this phase's batch concurrently.
    pub concurrent_execution: bool,
    pub stop_on_first_error: bool,
    /// Adjacent marked phases execute together in mixed mode.
    pub mark_concurrent: bool,
    pub enable_racing: bool,
    pub max_timeout: Option<Duration>,
    pub max_concurrent_requests: Option<usize>,
    /// `Some(false)` forbids REPLAY decisions for this phase.
    pub allow_replay: Option<bool>,
    pub max_replay_count: u32,
    /// `Some(false)` forbids SKIP decisions issued by this phase.
    pub allow_skip: Option<bool>,
    pub decision_hook: Option<PhaseDecisionHook>,
}

impl Phase {
    pub fn new(id: impl Into<String>, operations: Vec<Operation>) -> Self {
        Self {
            id: id.into(),
            operations,
            max_replay_count: DEFAULT_MAX_REPLAY_COUNT,
            ..Self::default()
        }
    }

    pub fn with_config(mut self, config: CommonConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_groups(mut self, groups: Vec<Group>) -> Self {
        self.groups = groups;
        self
    }

    pub fn concurrent(mut self) -> Self {
        self.concurrent_execution = true;
        self
    }

    pub fn marked_concurrent(mut self) -> Self {
        self.mark_concurrent = true;
        self
    }

    pub fn stop_on_first_error(mut self) -> Self {
        self.stop_on_first_error = true;
        self
    }

    pub fn with_decision_hook(mut self, hook: PhaseDecisionHook) -> Self {
        self.decision_hook = Some(hook);
        self
    }

    pub fn with_max_replay_count(mut self, count: u32) -> Self {
        self.max_replay_count = count;
        self
    }

    pub fn forbid_replay(mut self) -> Self {
        self.allow_replay = Some(false);
        self
    }

    pub fn forbid_skip(mut self) -> Self {
        self.allow_skip = Some(false);
        self
    }

    pub fn replay_allowed(&self) -> bool {
        self.allow_replay != Some(false)
    }

    pub fn skip_allowed(&self) -> bool {
        self.allow_skip != Some(false)
    }

    fn gateway_options(&self) -> GatewayOptions {
        GatewayOptions {
            concurrent: self.concurrent_execution,
            stop_on_first_error: self.stop_on_first_error,
            enable_racing: self.enable_racing,
            max_concurrent_requests: self.max_concurrent_requests,
            max_timeout: self.max_timeout,
        }
    }
}

impl std::fmt::Debug for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("id", &self.id)
            .field("operations", &self.operations.len())
            .field("concurrent_execution", &self.concurrent_execution)
            .field("mark_concurrent", &self.mark_concurrent)
            .finish()
    }
}

/// One phase execution's outcome.
#[derive(Debug, Clone, Default)]
pub struct PhaseReport {
    pub phase_id: String,
    pub phase_index: usize,
    pub execution_number: u32,
    pub success: bool,
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub responses: Vec<GatewayEntry>,
    pub execution_time_ms: u64,
    pub timestamp: i64,
    pub decision: Option<DecisionAction>,
    pub skipped: bool,
    pub error: Option<String>,
    pub metrics: PhaseMetrics,
    pub validation: Option<ValidationReport>,
}

impl PhaseReport {
    /// Placeholder report for a phase that never ran.
    pub fn skipped(phase_id: &str, phase_index: usize) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            phase_index,
            skipped: true,
            ..Self::default()
        }
    }
}

/// Runs phases by delegating to the gateway executor.
#[derive(Clone)]
pub struct PhaseEngine {
    gateway: GatewayExecutor,
}

impl PhaseEngine {
    pub fn new(gateway: GatewayExecutor) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &GatewayExecutor {
        &self.gateway
    }

    /// Execute the phase's batch once. `parent_levels` is the chain outside
    /// the phase (branch, workflow), inner to outer.
    pub async fn run_phase(
        &self,
        phase: &Phase,
        phase_index: usize,
        execution_number: u32,
        parent_levels: &[&CommonConfig],
        cancel: &CancellationToken,
    ) -> PhaseReport {
        let mut levels: Vec<&CommonConfig> = vec![&phase.config];
        levels.extend_from_slice(parent_levels);

        let gateway_report = self
            .gateway
            .run(&phase.operations, &phase.groups, &phase.gateway_options(), &levels, cancel)
            .await;

        let metrics = PhaseMetrics {
            total_requests: gateway_report.metrics.total_requests,
            successful_requests: gateway_report.metrics.successful_requests,
            failed_requests: gateway_report.metrics.failed_requests,
            duration_ms: gateway_report.metrics.duration_ms,
            execution_number,
        };
        let effective = resolve(&levels);
        let validation =
            effective.guardrails.as_ref().map(|g| validate_phase(&metrics, &g.phase));

        let success = metrics.failed_requests == 0 && !gateway_report.terminated_early;
        let error = if success {
            None
        } else {
            gateway_report
                .entries
                .iter()
                .find(|e| !e.success && !e.skipped)
                .and_then(|e| e.error.as_ref().map(|err| err.to_string()))
        };

        PhaseReport {
            phase_id: phase.id.clone(),
            phase_index,
            execution_number,
            success,
            total_requests: metrics.total_requests,
            successful_requests: metrics.successful_requests,
            failed_requests: metrics.failed_requests,
            responses: gateway_report.entries,
            execution_time_ms: metrics.duration_ms,
            timestamp: chrono::Utc::now().timestamp_millis(),
            decision: None,
            skipped: false,
            error,
            metrics,
            validation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::AttemptRunner;
    use crate::backoff::WaitStrategy;
    use crate::http::{HttpCall, HttpResponse, Transport, TransportFailure};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    struct FixedTransport {
        status: u16,
    }

    #[async_trait]
    impl Transport for FixedTransport {
        async fn send(
            &self,
            _call: &HttpCall,
            _cancel: CancellationToken,
        ) -> Result<HttpResponse, TransportFailure> {
            Ok(HttpResponse {
                status: self.status,
                status_text: "".into(),
                headers: BTreeMap::new(),
                body: json!({"ok": self.status < 400}),
            })
        }
    }

    fn engine(status: u16) -> PhaseEngine {
        let runner =
            AttemptRunner::new().with_transport(Arc::new(FixedTransport { status }));
        PhaseEngine::new(GatewayExecutor::new(runner))
    }

    fn fast() -> CommonConfig {
        CommonConfig::new().with_attempts(1).with_backoff(WaitStrategy::Fixed, Duration::ZERO)
    }

    fn ops(n: usize) -> Vec<Operation> {
        (0..n)
            .map(|i| {
                Operation::request(
                    format!("op{}", i),
                    HttpCall::get("api.example.com", format!("/{}", i)).unwrap(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn successful_phase_counts_its_requests() {
        let phase = Phase::new("ingest", ops(3)).with_config(fast());
        let report =
            engine(200).run_phase(&phase, 0, 1, &[], &CancellationToken::new()).await;
        assert!(report.success);
        assert_eq!(report.total_requests, 3);
        assert_eq!(report.successful_requests, 3);
        assert_eq!(report.failed_requests, 0);
        assert_eq!(report.execution_number, 1);
        assert_eq!(report.responses.len(), 3);
    }

    #[tokio::test]
    async fn failed_leaf_fails_the_phase_with_its_error() {
        let phase = Phase::new("ingest", ops(2)).with_config(fast());
        let report =
            engine(500).run_phase(&phase, 0, 1, &[], &CancellationToken::new()).await;
        assert!(!report.success);
        assert_eq!(report.failed_requests, 2);
        assert!(report.error.as_ref().unwrap().contains("500"));
    }

    #[tokio::test]
    async fn replay_and_skip_default_to_allowed() {
        let phase = Phase::new("p", vec![]);
        assert!(phase.replay_allowed());
        assert!(phase.skip_allowed());
        let phase = phase.forbid_replay().forbid_skip();
        assert!(!phase.replay_allowed());
        assert!(!phase.skip_allowed());
        assert_eq!(Phase::new("q", vec![]).max_replay_count, DEFAULT_MAX_REPLAY_COUNT);
    }
}
