//! Wait strategies between attempts

use crate::error::ConfigError;
use rand::Rng;
use std::time::Duration;

/// How the base wait grows across attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum WaitStrategy {
    /// Same wait after every attempt.
    Fixed,
    /// `base * attempt`.
    Linear,
    /// `base * 2^(attempt - 1)`.
    Exponential,
}

/// Wait computation for the retry loop: a strategy over a base wait, an
/// optional cap, and a fractional jitter applied as `delay * (1 + r)` with
/// `r` drawn uniformly from `[-jitter, +jitter]`.
#[derive(Debug, Clone)]
pub struct Backoff {
    strategy: WaitStrategy,
    base: Duration,
    max: Option<Duration>,
    jitter: f64,
}

impl Backoff {
    pub fn fixed(base: Duration) -> Self {
        Self { strategy: WaitStrategy::Fixed, base, max: None, jitter: 0.0 }
    }

    pub fn linear(base: Duration) -> Self {
        Self { strategy: WaitStrategy::Linear, base, max: None, jitter: 0.0 }
    }

    pub fn exponential(base: Duration) -> Self {
        Self { strategy: WaitStrategy::Exponential, base, max: None, jitter: 0.0 }
    }

    pub fn with_strategy(strategy: WaitStrategy, base: Duration) -> Self {
        Self { strategy, base, max: None, jitter: 0.0 }
    }

    /// Cap every computed delay (applied before jitter).
    pub fn with_max(mut self, max: Duration) -> Self {
        self.max = Some(max);
        self
    }

    /// Fractional jitter in `[0, 1]`.
    pub fn with_jitter(mut self, fraction: f64) -> Result<Self, ConfigError> {
        if !(0.0..=1.0).contains(&fraction) || fraction.is_nan() {
            return Err(ConfigError::InvalidJitter(fraction));
        }
        self.jitter = fraction;
        Ok(self)
    }

    pub fn strategy(&self) -> WaitStrategy {
        self.strategy
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn jitter_fraction(&self) -> f64 {
        self.jitter
    }

    /// Delay for a 1-indexed attempt, clamped to the cap, before jitter.
    pub fn delay(&self, attempt: usize) -> Duration {
        let raw = match self.strategy {
            WaitStrategy::Fixed => self.base,
            WaitStrategy::Linear => self
                .base
                .checked_mul(attempt as u32)
                .unwrap_or(Duration::from_secs(u64::MAX)),
            WaitStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let multiplier = 2u32.saturating_pow(exponent);
                self.base
                    .checked_mul(multiplier)
                    .unwrap_or(Duration::from_secs(u64::MAX))
            }
        };
        match self.max {
            Some(max) => raw.min(max),
            None => raw,
        }
    }

    /// Delay with jitter applied, using the provided rng so tests stay
    /// deterministic.
    pub fn jittered_delay<R: Rng>(&self, attempt: usize, rng: &mut R) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = 1.0 + rng.random_range(-self.jitter..=self.jitter);
        let jittered = delay.as_secs_f64() * factor.max(0.0);
        let jittered = Duration::from_secs_f64(jittered);
        match self.max {
            Some(max) => jittered.min(max),
            None => jittered,
        }
    }
}
