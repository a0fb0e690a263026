//! Adaptive spacing for recurring jobs

use crate::config::AdaptiveConfig;
use std::time::Duration;

/// Interval of a recurring job that reacts to discovery yield.
///
/// Runs that find at least `shorten_threshold` new devices pull the next run
/// closer; empty or failed runs push it out. The result is clamped to
/// `[min_interval, max_interval]`.
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    base: Duration,
    current: Duration,
    config: AdaptiveConfig,
}

impl AdaptiveInterval {
    pub fn new(base: Duration, config: AdaptiveConfig) -> Self {
        let mut interval = Self {
            base,
            current: base,
            config,
        };
        if interval.config.enabled {
            interval.current = interval.clamp(base);
        }
        interval
    }

    /// Fixed interval that never adapts
    pub fn fixed(interval: Duration) -> Self {
        Self::new(
            interval,
            AdaptiveConfig {
                enabled: false,
                ..Default::default()
            },
        )
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    /// Feed back one completed run and return the interval until the next
    pub fn record_run(&mut self, success: bool, new_devices: usize, devices_found: usize) -> Duration {
        if !self.config.enabled {
            return self.current;
        }

        let factor = if !success || devices_found == 0 {
            self.config.lengthen_factor
        } else if new_devices >= self.config.shorten_threshold.max(1) {
            self.config.shorten_factor
        } else {
            1.0
        };

        if factor > 0.0 && factor.is_finite() {
            self.current = self.clamp(self.current.mul_f64(factor));
        }
        self.current
    }

    pub fn reset(&mut self) {
        self.current = if self.config.enabled {
            self.clamp(self.base)
        } else {
            self.base
        };
    }

    fn clamp(&self, interval: Duration) -> Duration {
        let min = self.config.min_interval;
        let max = self.config.max_interval.max(min);
        interval.clamp(min, max)
    }
}
