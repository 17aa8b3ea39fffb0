//! Trial-mode fault injection
//!
//! Two independent probabilities: one produces synthetic request failures
//! before the operation is invoked, the other demotes a failure that would
//! otherwise retry into a terminal one. The rng is injectable so tests can
//! pin outcomes.

use rand::Rng;

/// Fault-injection knobs for an attempt loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrialMode {
    request_failure_probability: f64,
    retry_failure_probability: f64,
}

impl TrialMode {
    /// Probabilities are clamped into `[0, 1]`.
    pub fn new(request_failure_probability: f64, retry_failure_probability: f64) -> Self {
        Self {
            request_failure_probability: request_failure_probability.clamp(0.0, 1.0),
            retry_failure_probability: retry_failure_probability.clamp(0.0, 1.0),
        }
    }

    /// Injection disabled; every roll passes through.
    pub fn disabled() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn request_failure_probability(&self) -> f64 {
        self.request_failure_probability
    }

    pub fn retry_failure_probability(&self) -> f64 {
        self.retry_failure_probability
    }

    /// Roll for a synthetic failure before invoking the operation.
    pub fn inject_failure<R: Rng>(&self, rng: &mut R) -> bool {
        self.request_failure_probability > 0.0
            && rng.random_bool(self.request_failure_probability)
    }

    /// Roll for demoting a generated failure to non-retryable.
    pub fn demote_retry<R: Rng>(&self, rng: &mut R) -> bool {
        self.retry_failure_probability > 0.0 && rng.random_bool(self.retry_failure_probability)
    }
}

impl Default for TrialMode {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn probabilities_are_clamped() {
        let trial = TrialMode::new(1.5, -0.5);
        assert_eq!(trial.request_failure_probability(), 1.0);
        assert_eq!(trial.retry_failure_probability(), 0.0);
    }

    #[test]
    fn certain_injection_always_fires() {
        let trial = TrialMode::new(1.0, 0.0);
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..50 {
            assert!(trial.inject_failure(&mut rng));
            assert!(!trial.demote_retry(&mut rng));
        }
    }

    #[test]
    fn disabled_never_fires() {
        let trial = TrialMode::disabled();
        let mut rng = StdRng::seed_from_u64(2);
        for _ in 0..50 {
            assert!(!trial.inject_failure(&mut rng));
            assert!(!trial.demote_retry(&mut rng));
        }
    }

    #[test]
    fn fractional_probability_fires_sometimes() {
        let trial = TrialMode::new(0.5, 0.0);
        let mut rng = StdRng::seed_from_u64(3);
        let fired = (0..200).filter(|_| trial.inject_failure(&mut rng)).count();
        assert!(fired > 50 && fired < 150, "got {}", fired);
    }
}
