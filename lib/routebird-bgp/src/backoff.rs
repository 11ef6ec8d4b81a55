//! Reconnect backoff

use std::time::Duration;

/// Exponential backoff with additive random jitter
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub minimum_delay: Duration,
    pub maximum_delay: Duration,
    pub factor: f64,
    pub jitter: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            minimum_delay: Duration::from_secs(1),
            maximum_delay: Duration::from_secs(60),
            factor: 2.0,
            jitter: Duration::from_millis(500),
        }
    }
}

impl ExponentialBackoff {
    /// Delay before the given retry attempt, counting from zero
    pub fn duration(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let backoff = self.minimum_delay.as_secs_f64() * self.factor.powi(exponent);
        let backoff = backoff + rand::random::<f64>() * self.jitter.as_secs_f64();
        Duration::from_secs_f64(backoff.min(self.maximum_delay.as_secs_f64()))
    }
}
