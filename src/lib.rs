#![forbid(unsafe_code)]

//! # Convoy
//!
//! A resilient execution orchestrator for async Rust: single operations with
//! retries, batched gateways, and phase/branch/graph workflows, all sharing
//! one infrastructure substrate (circuit breakers, rate limiters,
//! concurrency limiters, response caches, and a transactional shared
//! buffer), plus a scheduler that drives recurring jobs on top.
//!
//! ## Features
//!
//! - **Attempt engine** with backoff strategies, content analysis,
//!   trial-mode fault injection, response caching, and guarded hooks
//! - **Gateways**: sequential, concurrent, and racing batches with grouped
//!   configuration cascading
//! - **Workflows**: linear, concurrent, mixed, and non-linear (decision
//!   driven) phase execution; branches and full graph traversal
//! - **Transactional buffer**: strictly serialized shared state with an
//!   append-only, replayable transaction log
//! - **Scheduler**: cron/interval/timestamp jobs with retries, persistence,
//!   and leader election over a pluggable distributed adapter
//! - **Guardrails**: every layer reports metrics validated against
//!   min/max/expected bounds
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use convoy::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(transport: Arc<dyn convoy::Transport>) {
//! // One operation with exponential retries.
//! let op = Operation::request(
//!     "fetch-data",
//!     HttpCall::get("api.example.com", "/data").unwrap(),
//! );
//! let config = CommonConfig::new()
//!     .with_attempts(3)
//!     .with_backoff(WaitStrategy::Exponential, Duration::from_millis(200))
//!     .with_jitter(0.25);
//!
//! let runner = AttemptRunner::new().with_transport(transport);
//! let report = runner
//!     .run(&op, &convoy::config::resolve(&[&config]), &CancellationToken::new())
//!     .await;
//! assert!(report.success);
//!
//! // The same operation inside a workflow phase.
//! let engine = WorkflowEngine::new(PhaseEngine::new(GatewayExecutor::new(runner)));
//! let phases = vec![Phase::new("ingest", vec![op])];
//! let outcome = engine
//!     .run(phases, &WorkflowOptions::new().with_global(config), &CancellationToken::new())
//!     .await
//!     .unwrap();
//! assert!(outcome.success);
//! # }
//! ```

mod attempt;
mod backoff;
mod branch;
mod breaker;
mod buffer;
mod cache;
mod clock;
mod concurrency;
pub mod config;
mod distributed;
mod error;
mod gateway;
mod graph;
pub mod hooks;
mod http;
mod infra;
pub mod metrics;
mod operation;
mod persistence;
mod phase;
mod rate_limit;
mod scheduler;
mod sleeper;
mod trial;
mod workflow;

// Re-exports
pub use attempt::{AttemptRecord, AttemptRunner, OperationReport};
pub use backoff::{Backoff, WaitStrategy};
pub use branch::{
    Branch, BranchEngine, BranchOptions, BranchReport, BranchRunReport, RACE_LOSER_ERROR,
};
pub use breaker::{Admission, BreakerConfig, BreakerMetrics, BreakerState, CircuitBreaker};
pub use buffer::{
    replay, snapshot_handler, BufferMetrics, BufferState, ReplayError, ReplayHandler,
    ReplayOptions, SharedBuffer, TxOptions, TxRecord,
};
pub use cache::{CacheEntry, CacheMetrics, CachePolicy, ContentCache};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use concurrency::{ConcurrencyLimiter, ConcurrencyMetrics, ConcurrencySlot};
pub use config::{resolve, CommonConfig, EffectiveConfig};
pub use distributed::{
    AdapterError, CampaignOutcome, DeliveryMode, DistributedAdapter, InMemoryAdapter, KvOp,
    LockGrant, Subscription, VersionedValue,
};
pub use error::{ConfigError, ExecError, NetworkErrorCode};
pub use gateway::{GatewayEntry, GatewayExecutor, GatewayOptions, GatewayReport, Group};
pub use graph::{
    Edge, EdgeCondition, EdgeContext, Graph, GraphEngine, GraphOptions, GraphReport, Node,
    NodeKind, NodeOutcome,
};
pub use hooks::{Decision, DecisionAction};
pub use http::{
    HttpCall, HttpResponse, Method, Protocol, Transport, TransportFailure,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use infra::{Infra, InfraMetrics};
pub use metrics::{
    Anomaly, Guardrail, GuardrailSet, MetricsGuardrails, Severity, ValidationReport, Violation,
};
pub use operation::{OpFunc, Operation, OperationKind};
pub use persistence::{MemoryPersistence, PersistenceError, StatePersistence};
pub use phase::{Phase, PhaseEngine, PhaseReport, DEFAULT_MAX_REPLAY_COUNT};
pub use rate_limit::{RateLimiter, RateLimiterMetrics};
pub use scheduler::{
    JobHandler, JobRetry, JobSpec, LeaderElection, RunContext, Schedule, Scheduler,
    SchedulerConfig,
};
pub use sleeper::{InstantSleeper, RecordingSleeper, Sleeper, TokioSleeper};
pub use trial::TrialMode;
pub use workflow::{
    HistoryEntry, WorkflowEngine, WorkflowOptions, WorkflowReport,
    DEFAULT_MAX_WORKFLOW_ITERATIONS,
};

pub mod prelude;
