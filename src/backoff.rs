//! Retry cadence for requests whose upstream call failed.
//!
//! Attempt `1` is the first retry after the initial execution. Delays double from `base` and
//! saturate at `max`; full jitter draws uniformly from `[0, delay]` with rand's thread-local RNG.
//!
//! ```rust
//! use std::time::Duration;
//! use ratewarden::backoff::RetryBackoff;
//!
//! let backoff = RetryBackoff::new(Duration::from_millis(100), Duration::from_secs(1)).unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(3), Duration::from_millis(400));
//! assert_eq!(backoff.delay(10), Duration::from_secs(1));
//! ```

use crate::config::QueueConfig;
use crate::error::ConfigError;
use rand::{rng, Rng};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl RetryBackoff {
    /// Exponential backoff without jitter. Fails if `max < base`.
    pub fn new(base: Duration, max: Duration) -> Result<Self, ConfigError> {
        if max < base {
            return Err(ConfigError::BackoffMaxBelowBase { base, max });
        }
        Ok(Self { base, max, jitter: false })
    }

    pub fn from_config(config: &QueueConfig) -> Result<Self, ConfigError> {
        let backoff = Self::new(config.retry_backoff, config.retry_backoff_max)?;
        Ok(backoff.with_jitter(config.retry_jitter))
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Deterministic delay before retry number `attempt` (`0` means no delay).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u128.saturating_pow(attempt - 1);
        let nanos = self.base.as_nanos().saturating_mul(multiplier).min(self.max.as_nanos());
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Delay with jitter applied when enabled.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.next_delay_with_rng(attempt, &mut rng())
    }

    pub fn next_delay_with_rng<R: Rng>(&self, attempt: u32, rng: &mut R) -> Duration {
        let delay = self.delay(attempt);
        if !self.jitter {
            return delay;
        }
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.random_range(0..=millis))
    }
}
