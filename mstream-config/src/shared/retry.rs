use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Back-off applied when a change stream keeps failing with transient errors.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay, in milliseconds, before the first reconnect after consecutive failures.
    pub initial_delay_ms: u64,
    /// Upper bound for the delay between reconnects.
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after each consecutive failure.
    pub backoff_factor: f32,
}

impl RetryConfig {
    /// Delay before reconnect attempt number `attempt`, where `0` reconnects immediately.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = (attempt - 1).min(32) as i32;
        let delay = self.initial_delay_ms as f64 * (self.backoff_factor as f64).powi(exponent);

        Duration::from_millis(delay.min(self.max_delay_ms as f64) as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_until_capped() {
        let retry = RetryConfig::default();

        assert_eq!(retry.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(1000));
        assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(2000));
        assert_eq!(retry.delay_for_attempt(20), Duration::from_millis(10_000));
    }
}
