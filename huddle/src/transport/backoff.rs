//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// First delay.
    pub base: Duration,
    /// Upper bound for any delay, jitter included.
    pub cap: Duration,
    /// Jitter as a fraction of the nominal delay, in `0.0..=1.0`.
    pub jitter: f64,
    /// A connection that stayed up this long resets the backoff to `base`.
    pub stable_after: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter: 0.2,
            stable_after: Duration::from_secs(60),
        }
    }
}

/// Delay generator: nominal delay doubles per consecutive failure.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    failures: u32,
}

impl Backoff {
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            config,
            failures: 0,
        }
    }

    /// Consecutive failures counted so far.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// The nominal (unjittered) delay the next failure will use.
    #[must_use]
    pub fn nominal(&self) -> Duration {
        let factor = 2_u32.saturating_pow(self.failures);
        self.config
            .base
            .saturating_mul(factor)
            .min(self.config.cap)
    }

    /// Returns the delay before the next attempt and counts a failure.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::rng())
    }

    /// [`next_delay`](Self::next_delay) with a caller-provided RNG.
    pub fn next_delay_with(&mut self, rng: &mut impl Rng) -> Duration {
        let nominal = self.nominal();
        self.failures = self.failures.saturating_add(1);

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let factor = if jitter > 0.0 {
            1.0 + rng.random_range(-jitter..=jitter)
        } else {
            1.0
        };
        nominal.mul_f64(factor).min(self.config.cap)
    }

    /// Back to `base`, after a connection proved stable.
    pub const fn reset(&mut self) {
        self.failures = 0;
    }

    /// Whether a connection that lasted `uptime` counts as stable.
    #[must_use]
    pub fn is_stable(&self, uptime: Duration) -> bool {
        uptime >= self.config.stable_after
    }
}
