//! Reconnect backoff policy

use std::time::Duration;

/// Exponential backoff with a cap, jitter and a degradation threshold
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound on any single delay
    pub max: Duration,
    /// Jitter as a fraction of the delay (0.2 = ±20%)
    pub jitter: f64,
    /// Consecutive failed attempts after which the channel reports `Degraded`
    pub degrade_after: u32,
    /// A connection that drops sooner, without delivering a frame, counts
    /// as a failed attempt
    pub stable_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.2,
            degrade_after: 5,
            stable_after: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Un-jittered delay before retry number `attempt` (1-based):
    /// `min(max, base * 2^(attempt - 1))`
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Delay before retry number `attempt`, with jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return nominal;
        }
        // Uniform in [-jitter, +jitter]
        let factor = 1.0 + jitter * (rand::random::<f64>() * 2.0 - 1.0);
        nominal.mul_f64(factor).min(self.max)
    }

    pub fn is_degraded(&self, consecutive_failures: u32) -> bool {
        self.degrade_after > 0 && consecutive_failures >= self.degrade_after
    }
}
