//! Configuration cascading
//!
//! Every level (leaf, group, phase, branch, workflow) carries the same
//! optional knob set; resolution walks the chain from the leaf outward and
//! the first set value wins. Headers and query partials are the exception:
//! they shallow-merge with leaf-last precedence. Infra primitives and the
//! shared buffer propagate downward unless shadowed.

use crate::backoff::{Backoff, WaitStrategy};
use crate::buffer::SharedBuffer;
use crate::error::ConfigError;
use crate::hooks::{
    ContentAnalyzer, ErrorHook, FinalErrorAnalyzer, PreExecutionHook, SuccessHook,
};
use crate::infra::Infra;
use crate::metrics::MetricsGuardrails;
use crate::trial::TrialMode;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// One level's worth of optional settings.
#[derive(Clone, Default)]
pub struct CommonConfig {
    pub attempts: Option<u32>,
    pub base_wait: Option<Duration>,
    pub max_wait: Option<Duration>,
    pub strategy: Option<WaitStrategy>,
    pub jitter_fraction: Option<f64>,
    pub perform_all_attempts: Option<bool>,
    pub timeout_per_attempt: Option<Duration>,
    pub execution_timeout: Option<Duration>,

    pub analyzer: Option<ContentAnalyzer>,
    pub on_error: Option<ErrorHook>,
    pub on_success: Option<SuccessHook>,
    pub pre_execution: Option<PreExecutionHook>,
    pub continue_on_pre_execution_failure: Option<bool>,
    pub apply_pre_execution_overrides: Option<bool>,
    pub final_error_analyzer: Option<FinalErrorAnalyzer>,
    pub throw_on_failed_error_analysis: Option<bool>,
    pub hook_params: Option<Value>,

    pub infra: Infra,
    pub cache_hits_bypass_gates: Option<bool>,
    pub trial: Option<TrialMode>,
    pub buffer: Option<SharedBuffer>,
    pub guardrails: Option<Arc<MetricsGuardrails>>,
    pub log_attempts: Option<bool>,

    /// Shallow-merged (leaf-last) into request headers.
    pub headers: BTreeMap<String, String>,
    /// Shallow-merged (leaf-last) into request query parameters.
    pub query: BTreeMap<String, String>,
}

impl CommonConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn with_backoff(mut self, strategy: WaitStrategy, base: Duration) -> Self {
        self.strategy = Some(strategy);
        self.base_wait = Some(base);
        self
    }

    pub fn with_max_wait(mut self, max: Duration) -> Self {
        self.max_wait = Some(max);
        self
    }

    pub fn with_jitter(mut self, fraction: f64) -> Self {
        self.jitter_fraction = Some(fraction);
        self
    }

    pub fn with_analyzer(mut self, analyzer: ContentAnalyzer) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn with_buffer(mut self, buffer: SharedBuffer) -> Self {
        self.buffer = Some(buffer);
        self
    }

    pub fn with_infra(mut self, infra: Infra) -> Self {
        self.infra = infra;
        self
    }

    pub fn with_trial(mut self, trial: TrialMode) -> Self {
        self.trial = Some(trial);
        self
    }
}

impl std::fmt::Debug for CommonConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommonConfig")
            .field("attempts", &self.attempts)
            .field("strategy", &self.strategy)
            .field("base_wait", &self.base_wait)
            .field("infra", &self.infra)
            .finish()
    }
}

/// Fully resolved settings the attempt engine runs with.
#[derive(Clone)]
pub struct EffectiveConfig {
    pub attempts: u32,
    pub base_wait: Duration,
    pub max_wait: Option<Duration>,
    pub strategy: WaitStrategy,
    pub jitter_fraction: f64,
    pub perform_all_attempts: bool,
    pub timeout_per_attempt: Option<Duration>,
    pub execution_timeout: Option<Duration>,

    pub analyzer: Option<ContentAnalyzer>,
    pub on_error: Option<ErrorHook>,
    pub on_success: Option<SuccessHook>,
    pub pre_execution: Option<PreExecutionHook>,
    pub continue_on_pre_execution_failure: bool,
    pub apply_pre_execution_overrides: bool,
    pub final_error_analyzer: Option<FinalErrorAnalyzer>,
    pub throw_on_failed_error_analysis: bool,
    pub hook_params: Option<Value>,

    pub infra: Infra,
    pub cache_hits_bypass_gates: bool,
    pub trial: TrialMode,
    pub buffer: Option<SharedBuffer>,
    pub guardrails: Option<Arc<MetricsGuardrails>>,
    pub log_attempts: bool,

    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
}

impl EffectiveConfig {
    /// Backoff computation for the resolved policy.
    pub fn backoff(&self) -> Result<Backoff, ConfigError> {
        let mut backoff = Backoff::with_strategy(self.strategy, self.base_wait)
            .with_jitter(self.jitter_fraction)?;
        if let Some(max) = self.max_wait {
            backoff = backoff.with_max(max);
        }
        Ok(backoff)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attempts == 0 {
            return Err(ConfigError::InvalidAttempts(0));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(ConfigError::InvalidJitter(self.jitter_fraction));
        }
        Ok(())
    }
}

impl Default for EffectiveConfig {
    fn default() -> Self {
        resolve(&[])
    }
}

macro_rules! first_set {
    ($levels:expr, $field:ident) => {
        $levels.iter().find_map(|level| level.$field.clone())
    };
}

/// Resolve a cascade. `levels` is ordered from the leaf outward
/// (leaf, group, phase, branch, workflow); the first set value wins.
pub fn resolve(levels: &[&CommonConfig]) -> EffectiveConfig {
    // Merged maps build outermost-first so inner levels overwrite.
    let mut headers = BTreeMap::new();
    let mut query = BTreeMap::new();
    for level in levels.iter().rev() {
        headers.extend(level.headers.clone());
        query.extend(level.query.clone());
    }

    // Infra inherits outward: a leaf-level primitive shadows the parents'.
    let mut infra = Infra::default();
    for level in levels {
        infra = infra.inherit(&level.infra);
    }

    EffectiveConfig {
        attempts: first_set!(levels, attempts).unwrap_or(3),
        base_wait: first_set!(levels, base_wait).unwrap_or(Duration::from_secs(1)),
        max_wait: first_set!(levels, max_wait),
        strategy: first_set!(levels, strategy).unwrap_or(WaitStrategy::Exponential),
        jitter_fraction: first_set!(levels, jitter_fraction).unwrap_or(0.0),
        perform_all_attempts: first_set!(levels, perform_all_attempts).unwrap_or(false),
        timeout_per_attempt: first_set!(levels, timeout_per_attempt),
        execution_timeout: first_set!(levels, execution_timeout),

        analyzer: first_set!(levels, analyzer),
        on_error: first_set!(levels, on_error),
        on_success: first_set!(levels, on_success),
        pre_execution: first_set!(levels, pre_execution),
        continue_on_pre_execution_failure: first_set!(levels, continue_on_pre_execution_failure)
            .unwrap_or(false),
        apply_pre_execution_overrides: first_set!(levels, apply_pre_execution_overrides)
            .unwrap_or(true),
        final_error_analyzer: first_set!(levels, final_error_analyzer),
        throw_on_failed_error_analysis: first_set!(levels, throw_on_failed_error_analysis)
            .unwrap_or(false),
        hook_params: first_set!(levels, hook_params),

        infra,
        cache_hits_bypass_gates: first_set!(levels, cache_hits_bypass_gates).unwrap_or(true),
        trial: first_set!(levels, trial).unwrap_or_else(TrialMode::disabled),
        buffer: first_set!(levels, buffer),
        guardrails: first_set!(levels, guardrails),
        log_attempts: first_set!(levels, log_attempts).unwrap_or(true),

        headers,
        query,
    }
}
