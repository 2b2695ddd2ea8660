//! Retry backoff: exponential with a cap and proportional jitter.

use std::time::Duration;

use rand::Rng;

use crate::error::ConfigError;

/// Exponential backoff settings for retrying failed runs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Upper bound on any delay, jitter included.
    pub cap: Duration,
    /// Fraction of the nominal delay added or removed at random (0.2 = ±20%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::InvalidValue {
                key: "retry.jitter".to_string(),
                message: format!("{} is outside [0, 1)", self.jitter),
            });
        }
        if self.cap < self.base {
            return Err(ConfigError::InvalidValue {
                key: "retry.cap".to_string(),
                message: format!("cap {:?} is below base {:?}", self.cap, self.base),
            });
        }
        Ok(())
    }

    /// `base * 2^attempt`, capped. Non-decreasing in `attempt`.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Nominal delay with jitter applied, never above the cap.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        nominal.mul_f64(1.0 + spread).min(self.cap)
    }
}
