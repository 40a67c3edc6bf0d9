//! Exponential backoff as a pure function of the attempt number.
//!
//! Used for database connection retries and for waiting out a concurrently
//! running batch while finalizing a migration.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
    /// Extra random delay as a fraction of the computed delay (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            jitter_factor: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration, jitter_factor: f64) -> Self {
        Self {
            base,
            max,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped at `max`.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.min(31)).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// [`next_delay`](Self::next_delay) plus a random share of up to `jitter_factor` of it.
    ///
    /// The jittered value never exceeds `max`.
    pub fn next_delay_with_jitter<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.next_delay(attempt);
        if self.jitter_factor <= 0.0 {
            return delay;
        }
        let extra = delay.as_secs_f64() * self.jitter_factor * rng.gen_range(0.0..=1.0);
        (delay + Duration::from_secs_f64(extra)).min(self.max)
    }
}
