//! Retry policy with backoff and jitter

use crate::config::SchedulerConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// `base_delay * (retry + 1)`
    Linear,
    /// `base_delay * factor^retry`
    Exponential { factor: f64 },
}

/// Retry policy for a discovery job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; total attempts = max_retries + 1
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    pub backoff: BackoffStrategy,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// Delay is scaled by a random factor in `1 ± jitter_factor`
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            backoff: BackoffStrategy::Exponential { factor: 2.0 },
            max_delay: Duration::from_secs(300),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay,
            backoff: BackoffStrategy::Exponential {
                factor: config.backoff_factor,
            },
            max_delay: config.max_retry_delay,
            jitter_factor: config.jitter_factor,
        }
    }

    /// Never retry
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor;
        self
    }

    /// Whether a job that has failed `failures` times gets another attempt
    pub fn should_retry(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }

    /// Delay before retry number `retry` (0-based), without jitter, capped
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let secs = match self.backoff {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Linear => base * (retry as f64 + 1.0),
            BackoffStrategy::Exponential { factor } => base * factor.powi(retry as i32),
        };
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped > 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            Duration::ZERO
        }
    }

    /// Delay before retry number `retry` with jitter applied, still capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.base_delay_for(retry);
        let jitter = self.jitter_factor.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let scale = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        delay.mul_f64(scale).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth_is_capped() {
        let policy = RetryPolicy::default()
            .with_jitter(0.0)
            .with_base_delay(Duration::from_secs(1));
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(20), Duration::from_secs(300));
    }

    #[test]
    fn test_fixed_and_linear() {
        let fixed = RetryPolicy::default().with_jitter(0.0).with_backoff(BackoffStrategy::Fixed);
        assert_eq!(fixed.delay_for(5), Duration::from_secs(1));

        let linear = RetryPolicy::default().with_jitter(0.0).with_backoff(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(2), Duration::from_secs(3));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::default().with_jitter(0.2);
        for _ in 0..100 {
            let delay = policy.delay_for(2).as_secs_f64();
            assert!((3.19..=4.81).contains(&delay), "delay {delay} out of band");
        }
    }

    #[test]
    fn test_should_retry_counts_failures() {
        let policy = RetryPolicy::default().with_max_retries(3);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(3));
        assert!(!policy.should_retry(4));
        assert!(!RetryPolicy::none().should_retry(1));
    }
}
