use crate::config::ClientConfig;
use rand::Rng;
use std::time::Duration;

/// Reconnect schedule of the client runtime.
///
/// The delay before retry `n` (1-based) is `min(base * 2^(n-1), cap)`. With jitter
/// enabled the delay is scaled by a random factor in `[0.5, 1.0]`, so it never
/// exceeds the plain schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts after which the runtime gives up.
    pub max_attempts: u32,
    pub jitter: bool,
}

impl ReconnectPolicy {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            max_attempts: config.max_reconnect_attempts,
            jitter: config.jitter,
        }
    }

    /// Delay before retry number `attempt`, without jitter.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay before retry number `attempt`, jitter applied when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.jitter {
            return delay;
        }
        let factor: f64 = rand::rng().random_range(0.5..=1.0);
        delay.mul_f64(factor)
    }

    /// `false` once `failures` consecutive attempts have failed.
    pub fn should_retry(&self, failures: u32) -> bool {
        failures < self.max_attempts
    }
}
