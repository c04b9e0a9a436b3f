use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default jitter applied to redial delays (±12.5% around the nominal delay).
pub const DEFAULT_JITTER_FACTOR: f64 = 0.25;

/// Bounded exponential backoff with jitter for redialling an unreachable endpoint.
///
/// The nominal delay for attempt `n` (zero-based) is `base * 2^n`, capped at `max`.
/// A random offset of up to `jitter_factor * delay` is spread around the nominal
/// value so that nodes that failed together do not redial in lockstep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub jitter_factor: f64,
    /// `None` redials forever.
    pub max_attempts: Option<u32>,
}

impl BackoffPolicy {
    /// Creates an unbounded policy with the default jitter.
    #[must_use]
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max, jitter_factor: DEFAULT_JITTER_FACTOR, max_attempts: None }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Delay before the given zero-based attempt, without jitter.
    #[must_use]
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(1u32 << attempt.min(10)).min(self.max)
    }

    /// Delay before the given zero-based attempt, with jitter applied.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped_delay = u64::try_from(self.nominal_delay(attempt).as_millis()).unwrap_or(u64::MAX);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
        let jitter_range = (capped_delay as f64 * self.jitter_factor.clamp(0.0, 1.0)) as u64;
        let jitter_offset =
            if jitter_range > 0 { rand::rng().random_range(0..jitter_range) } else { 0 };

        Duration::from_millis(capped_delay.saturating_sub(jitter_range / 2) + jitter_offset)
    }

    /// Returns `true` once `attempts` redials have been spent.
    #[must_use]
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }

    /// Checks the policy for values that would never make progress.
    pub fn validate(&self) -> Result<(), String> {
        if self.base.is_zero() {
            return Err("backoff base must be greater than 0".to_string());
        }
        if self.base > self.max {
            return Err(format!(
                "backoff base ({:?}) must not exceed backoff max ({:?})",
                self.base, self.max
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(format!("jitter factor must be within [0, 1], got {}", self.jitter_factor));
        }
        Ok(())
    }
}
