//! Caller hooks: analyzers, attempt observers, and decision hooks
//!
//! Every hook takes an explicit input record and returns a typed value; there
//! are no positional parameter bags. Hook failures are strings; the engines
//! log them and keep going (only the pre-execution gate can fail a leaf, and
//! only when the policy says so).

use crate::buffer::SharedBuffer;
use crate::error::ExecError;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Context handed to function operations.
#[derive(Clone)]
pub struct FuncContext {
    pub attempt: u32,
    pub buffer: Option<SharedBuffer>,
    pub params: Option<Value>,
    pub cancel: tokio_util::sync::CancellationToken,
}

/// What a content analyzer sees for one successful attempt.
#[derive(Clone)]
pub struct AnalyzerInput {
    pub body: Value,
    pub status: Option<u16>,
    pub attempt: u32,
    pub buffer: Option<SharedBuffer>,
    pub params: Option<Value>,
}

/// Accept/reject predicate over a successful response. `Err` counts as a
/// rejection with the message recorded.
pub type ContentAnalyzer =
    Arc<dyn Fn(AnalyzerInput) -> BoxFuture<'static, Result<bool, String>> + Send + Sync>;

/// One finished attempt, success or failure, as seen by observers.
#[derive(Clone)]
pub struct AttemptOutcome {
    pub operation_id: String,
    pub attempt: u32,
    pub status: Option<u16>,
    pub body: Option<Value>,
    pub error: Option<String>,
    pub buffer: Option<SharedBuffer>,
    pub params: Option<Value>,
}

/// Observer for failed attempts; isolated, never aborts the loop.
pub type ErrorHook =
    Arc<dyn Fn(AttemptOutcome) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Observer for successful attempts; isolated, never aborts the loop.
pub type SuccessHook =
    Arc<dyn Fn(AttemptOutcome) -> BoxFuture<'static, Result<(), String>> + Send + Sync>;

/// Input to the pre-execution hook.
#[derive(Clone)]
pub struct PreExecutionInput {
    pub operation_id: String,
    pub buffer: Option<SharedBuffer>,
    pub params: Option<Value>,
}

/// Partial request rewrite returned by a pre-execution hook. Maps are
/// shallow-merged over the leaf with hook values winning; a body replaces the
/// leaf body outright.
#[derive(Debug, Clone, Default)]
pub struct RequestOverrides {
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub body: Option<Value>,
}

impl RequestOverrides {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty() && self.query.is_empty() && self.body.is_none()
    }
}

/// Runs before the first attempt; may rewrite the request.
pub type PreExecutionHook = Arc<
    dyn Fn(PreExecutionInput) -> BoxFuture<'static, Result<Option<RequestOverrides>, String>>
        + Send
        + Sync,
>;

/// What the final-error analyzer sees after the loop gives up.
#[derive(Clone)]
pub struct FinalErrorInput {
    pub operation_id: String,
    pub error: ExecError,
    pub attempts: u32,
    pub buffer: Option<SharedBuffer>,
    pub params: Option<Value>,
}

/// Returning `Ok(true)` suppresses the failure (the leaf reports
/// `success=false, data=false` instead of an error).
pub type FinalErrorAnalyzer =
    Arc<dyn Fn(FinalErrorInput) -> BoxFuture<'static, Result<bool, String>> + Send + Sync>;

// --- Decisions ---

/// What a decision hook tells the workflow engine to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DecisionAction {
    Continue,
    Replay,
    Skip,
    Jump,
    Terminate,
}

/// Tagged decision with optional targeting, metadata, and appended phases.
#[derive(Clone, Default)]
pub struct Decision {
    pub action: Option<DecisionAction>,
    pub target_phase_id: Option<String>,
    pub metadata: Option<Value>,
    pub add_phases: Vec<crate::phase::Phase>,
}

impl Decision {
    pub fn proceed() -> Self {
        Self { action: Some(DecisionAction::Continue), ..Self::default() }
    }

    pub fn replay() -> Self {
        Self { action: Some(DecisionAction::Replay), ..Self::default() }
    }

    pub fn skip() -> Self {
        Self { action: Some(DecisionAction::Skip), ..Self::default() }
    }

    pub fn skip_to(target: impl Into<String>) -> Self {
        Self {
            action: Some(DecisionAction::Skip),
            target_phase_id: Some(target.into()),
            ..Self::default()
        }
    }

    pub fn jump_to(target: impl Into<String>) -> Self {
        Self {
            action: Some(DecisionAction::Jump),
            target_phase_id: Some(target.into()),
            ..Self::default()
        }
    }

    pub fn terminate() -> Self {
        Self { action: Some(DecisionAction::Terminate), ..Self::default() }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn adding_phases(mut self, phases: Vec<crate::phase::Phase>) -> Self {
        self.add_phases = phases;
        self
    }

    pub fn action_or_continue(&self) -> DecisionAction {
        self.action.unwrap_or(DecisionAction::Continue)
    }
}

impl std::fmt::Debug for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Decision")
            .field("action", &self.action)
            .field("target_phase_id", &self.target_phase_id)
            .field("add_phases", &self.add_phases.len())
            .finish()
    }
}

/// Input to a phase decision hook.
#[derive(Clone)]
pub struct DecisionInput {
    pub phase: crate::phase::PhaseReport,
    pub history: Vec<crate::workflow::HistoryEntry>,
    pub buffer: Option<SharedBuffer>,
    /// Present when the phase ran inside a concurrent group.
    pub concurrent_results: Option<Vec<crate::phase::PhaseReport>>,
}

pub type PhaseDecisionHook =
    Arc<dyn Fn(DecisionInput) -> BoxFuture<'static, Result<Decision, String>> + Send + Sync>;

/// Input to a branch decision hook.
#[derive(Clone)]
pub struct BranchDecisionInput {
    pub branch_id: String,
    pub phases: Vec<crate::phase::PhaseReport>,
    pub history: Vec<crate::workflow::HistoryEntry>,
    pub buffer: Option<SharedBuffer>,
}

pub type BranchDecisionHook =
    Arc<dyn Fn(BranchDecisionInput) -> BoxFuture<'static, Result<Decision, String>> + Send + Sync>;

// --- Constructors ---
// Small adapters so call sites don't spell out BoxFuture.

pub fn content_analyzer<F, Fut>(f: F) -> ContentAnalyzer
where
    F: Fn(AnalyzerInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, String>> + Send + 'static,
{
    Arc::new(move |input| Box::pin(f(input)))
}

/// Analyzer from a plain sync predicate over the body.
pub fn body_analyzer<F>(f: F) -> ContentAnalyzer
where
    F: Fn(&Value) -> bool + Send + Sync + 'static,
{
    Arc::new(move |input| {
        let verdict = f(&input.body);
        Box::pin(async move { Ok(verdict) })
    })
}

pub fn error_hook<F, Fut>(f: F) -> ErrorHook
where
    F: Fn(AttemptOutcome) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(move |outcome| Box::pin(f(outcome)))
}

pub fn success_hook<F, Fut>(f: F) -> SuccessHook
where
    F: Fn(AttemptOutcome) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    Arc::new(move |outcome| Box::pin(f(outcome)))
}

pub fn pre_execution_hook<F, Fut>(f: F) -> PreExecutionHook
where
    F: Fn(PreExecutionInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<RequestOverrides>, String>> + Send + 'static,
{
    Arc::new(move |input| Box::pin(f(input)))
}

pub fn final_error_analyzer<F, Fut>(f: F) -> FinalErrorAnalyzer
where
    F: Fn(FinalErrorInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool, String>> + Send + 'static,
{
    Arc::new(move |input| Box::pin(f(input)))
}

/// Final-error analyzer that always suppresses.
pub fn suppress_final_error() -> FinalErrorAnalyzer {
    final_error_analyzer(|_| async { Ok(true) })
}

pub fn phase_decision<F, Fut>(f: F) -> PhaseDecisionHook
where
    F: Fn(DecisionInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Decision, String>> + Send + 'static,
{
    Arc::new(move |input| Box::pin(f(input)))
}

pub fn branch_decision<F, Fut>(f: F) -> BranchDecisionHook
where
    F: Fn(BranchDecisionInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Decision, String>> + Send + 'static,
{
    Arc::new(move |input| Box::pin(f(input)))
}
