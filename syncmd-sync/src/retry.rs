//! Exponential backoff with jitter

use std::time::Duration;

/// Retry policy for reconnects and peer reconnect attempts
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between attempts
    pub backoff_multiplier: f64,
    /// Jitter factor to randomize delays (0.0 - 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Short delays, more attempts; used in tests and on fast links
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 1.5,
            jitter_factor: 0.2,
        }
    }

    /// Spacing for re-probing peers that stopped answering
    pub fn peer_backoff() -> Self {
        Self {
            max_attempts: u32::MAX,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }

    /// Delay before retry number `attempt` (1-based); zero for attempt 0
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay_ms = self.base_delay.as_millis() as f64;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_ms = base_delay_ms * self.backoff_multiplier.powi(exponent);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        // Spread synchronized reconnects
        let jitter = 1.0 + (rand::random::<f64>() - 0.5) * 2.0 * self.jitter_factor;
        let final_delay_ms = (delay_ms * jitter).min(self.max_delay.as_millis() as f64);

        Duration::from_millis(final_delay_ms.max(0.0) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
