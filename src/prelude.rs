//! Convenient re-exports for common Convoy types.

pub use crate::attempt::{AttemptRunner, OperationReport};
pub use crate::backoff::{Backoff, WaitStrategy};
pub use crate::branch::{Branch, BranchEngine, BranchOptions};
pub use crate::breaker::{BreakerConfig, CircuitBreaker};
pub use crate::buffer::{SharedBuffer, TxOptions};
pub use crate::cache::{CachePolicy, ContentCache};
pub use crate::concurrency::ConcurrencyLimiter;
pub use crate::config::CommonConfig;
pub use crate::error::{ConfigError, ExecError};
pub use crate::gateway::{GatewayExecutor, GatewayOptions, Group};
pub use crate::graph::{Edge, Graph, GraphEngine, GraphOptions, Node};
pub use crate::hooks::{Decision, DecisionAction};
pub use crate::http::{HttpCall, HttpResponse, Method, Protocol, Transport};
pub use crate::infra::Infra;
pub use crate::metrics::{Guardrail, MetricsGuardrails};
pub use crate::operation::Operation;
pub use crate::phase::{Phase, PhaseEngine};
pub use crate::rate_limit::RateLimiter;
pub use crate::scheduler::{JobSpec, Schedule, Scheduler, SchedulerConfig};
pub use crate::trial::TrialMode;
pub use crate::workflow::{WorkflowEngine, WorkflowOptions};
