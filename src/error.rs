//! Error types for execution and configuration failures

use std::fmt;
use std::time::Duration;

/// Network-level failure classification reported by transports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum NetworkErrorCode {
    /// Connection reset by peer.
    ConnReset,
    /// The socket or request timed out.
    TimedOut,
    /// Connection refused.
    ConnRefused,
    /// DNS name not found.
    DnsUnknown,
    /// Transient DNS resolution failure.
    DnsAgain,
    /// Any other network failure.
    Other,
}

impl NetworkErrorCode {
    /// Transient network failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, NetworkErrorCode::Other)
    }
}

/// Unified error type produced while executing a single operation.
///
/// Every variant is classified as retryable or not via [`ExecError::is_retryable`];
/// the attempt loop drives retries off that classification. Trial-mode demotion
/// of a retryable failure happens in the loop, not here.
#[derive(Debug, Clone)]
pub enum ExecError {
    /// Transport or HTTP failure, carrying whichever classification the
    /// transport exposed.
    Transport {
        status: Option<u16>,
        code: Option<NetworkErrorCode>,
        message: String,
    },
    /// A successful response was rejected by the content analyzer.
    InvalidContent { reason: Option<String> },
    /// The caller's cancellation token fired.
    Cancelled,
    /// The circuit breaker refused the call without invoking the operation.
    CircuitOpen { open_for: Duration },
    /// The rate limiter could not admit the request.
    Throttled { queued: usize },
    /// An attempt or operation deadline elapsed.
    Timeout { elapsed: Duration, limit: Duration },
    /// Trial mode injected a synthetic failure.
    Injected { retryable: bool },
    /// A function operation failed.
    Func { message: String },
    /// The configured pre-execution hook failed and the policy forbids
    /// continuing without it.
    Hook { hook: String, message: String },
    /// Every attempt failed; carries the terminal failure.
    AttemptsExhausted { attempts: usize, last: Box<ExecError> },
}

impl ExecError {
    /// Whether the retry loop may try again after this failure.
    ///
    /// Transport failures retry on 408/409/429/5xx or a transient network
    /// code. Content rejection, open circuits, throttling, and timeouts are
    /// transient. Cancellation and hook gate failures never retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecError::Transport { status, code, .. } => {
                let status_retryable = matches!(status, Some(408) | Some(409) | Some(429))
                    || matches!(status, Some(s) if *s >= 500 && *s < 600);
                let code_retryable = code.map(|c| c.is_retryable()).unwrap_or(false);
                status_retryable || code_retryable
            }
            ExecError::InvalidContent { .. } => true,
            ExecError::Cancelled => false,
            ExecError::CircuitOpen { .. } => true,
            ExecError::Throttled { .. } => true,
            ExecError::Timeout { .. } => true,
            ExecError::Injected { retryable } => *retryable,
            ExecError::Func { .. } => true,
            ExecError::Hook { .. } => false,
            ExecError::AttemptsExhausted { .. } => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled)
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ExecError::CircuitOpen { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ExecError::Timeout { .. })
    }

    pub fn is_invalid_content(&self) -> bool {
        matches!(self, ExecError::InvalidContent { .. })
    }

    /// HTTP status carried by a transport failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            ExecError::Transport { status, .. } => *status,
            ExecError::AttemptsExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    /// The terminal failure behind an exhausted retry loop, or `self`.
    pub fn terminal(&self) -> &ExecError {
        match self {
            ExecError::AttemptsExhausted { last, .. } => last.terminal(),
            other => other,
        }
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecError::Transport { status, code, message } => match (status, code) {
                (Some(s), _) => write!(f, "transport failed with status {}: {}", s, message),
                (None, Some(c)) => write!(f, "network failure ({:?}): {}", c, message),
                (None, None) => write!(f, "transport failure: {}", message),
            },
            ExecError::InvalidContent { reason } => match reason {
                Some(r) => write!(f, "content analyzer rejected response: {}", r),
                None => write!(f, "content analyzer rejected response"),
            },
            ExecError::Cancelled => write!(f, "operation cancelled"),
            ExecError::CircuitOpen { open_for } => {
                write!(f, "circuit breaker open for {:?}", open_for)
            }
            ExecError::Throttled { queued } => {
                write!(f, "rate limiter rejected request ({} queued)", queued)
            }
            ExecError::Timeout { elapsed, limit } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, limit)
            }
            ExecError::Injected { retryable } => {
                write!(f, "injected trial-mode failure (retryable: {})", retryable)
            }
            ExecError::Func { message } => write!(f, "function operation failed: {}", message),
            ExecError::Hook { hook, message } => {
                write!(f, "hook '{}' failed: {}", hook, message)
            }
            ExecError::AttemptsExhausted { attempts, last } => {
                write!(f, "all {} attempts failed, last error: {}", attempts, last)
            }
        }
    }
}

impl std::error::Error for ExecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExecError::AttemptsExhausted { last, .. } => Some(last.as_ref()),
            _ => None,
        }
    }
}

/// Misuse of the orchestrator surface: malformed graphs, invalid policies,
/// unparseable schedules. Raised before any execution starts.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("attempts must be >= 1 (got {0})")]
    InvalidAttempts(usize),
    #[error("jitter fraction must be within [0, 1] (got {0})")]
    InvalidJitter(f64),
    #[error("request path must start with '/' (got '{0}')")]
    InvalidPath(String),
    #[error("workflow has no phases")]
    EmptyWorkflow,
    #[error("duplicate phase id '{0}'")]
    DuplicatePhaseId(String),
    #[error("graph entry point '{0}' does not exist")]
    MissingEntryPoint(String),
    #[error("graph node '{0}' references unknown node '{1}'")]
    UnknownNode(String, String),
    #[error("graph cycle through '{0}' has no terminating decision or edge")]
    UnterminatedCycle(String),
    #[error("graph depth {depth} exceeds maximum {max}")]
    DepthExceeded { depth: usize, max: usize },
    #[error("invalid cron expression '{expr}': {message}")]
    InvalidCron { expr: String, message: String },
    #[error("unknown timezone '{0}'")]
    UnknownTimezone(String),
    #[error("scheduler job '{0}' already exists")]
    DuplicateJob(String),
}
