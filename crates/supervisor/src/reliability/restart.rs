//! Restart backoff policy

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::{duration_millis, ConfigError};

/// Backoff applied by the health monitor when a worker fails to restart
///
/// The default is a fixed 30 second backoff with no attempt cap: a broken
/// worker keeps being retried for as long as the pool runs. Set
/// `max_attempts` to give up after that many consecutive failures.
///
/// # Example
///
/// ```
/// use taskpool_supervisor::RestartPolicy;
/// use std::time::Duration;
///
/// let policy = RestartPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_backoff(Duration::from_secs(1))
///     .with_max_backoff(Duration::from_secs(60));
///
/// // First retry after ~1 second
/// // Second retry after ~2 seconds
/// // Third retry after ~4 seconds
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestartPolicy {
    /// Consecutive failed restarts tolerated (None = unbounded)
    #[serde(default)]
    pub max_attempts: Option<u32>,

    /// Delay after the first failed restart
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,

    /// Upper bound for the delay
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,

    /// Backoff multiplier (1.0 = fixed)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0)
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(30))
    }
}

impl RestartPolicy {
    /// Fixed backoff, unbounded attempts
    pub fn fixed(interval: Duration) -> Self {
        Self {
            max_attempts: None,
            initial_backoff: interval,
            max_backoff: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Exponential backoff with sensible defaults
    ///
    /// - unbounded attempts
    /// - 1 second initial backoff
    /// - 5 minute max backoff
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(300),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Cap consecutive restart failures
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the initial backoff
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Set the maximum backoff
    pub fn with_max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Reject values the builders would have clamped
    ///
    /// Deserialized policies bypass the builders, so loaders call this.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_coefficient.is_finite() || self.backoff_coefficient < 1.0 {
            return Err(ConfigError::Invalid(format!(
                "restart_policy.backoff_coefficient must be a finite number >= 1.0, got {}",
                self.backoff_coefficient
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid(format!(
                "restart_policy.jitter must be between 0.0 and 1.0, got {}",
                self.jitter
            )));
        }
        Ok(())
    }

    /// Delay before retrying after the given number of consecutive failures (1-based)
    ///
    /// Out-of-range coefficient and jitter values are clamped, so this never
    /// panics even for a policy that failed [`validate`](Self::validate).
    pub fn delay_for_attempt(&self, failures: u32) -> Duration {
        let coefficient = if self.backoff_coefficient.is_finite() {
            self.backoff_coefficient.max(1.0)
        } else {
            1.0
        };
        let jitter = if self.jitter.is_nan() {
            0.0
        } else {
            self.jitter.clamp(0.0, 1.0)
        };

        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.initial_backoff.as_secs_f64() * coefficient.powi(exponent);
        let capped = base.min(self.max_backoff.as_secs_f64());

        let jittered = if jitter > 0.0 && capped > 0.0 {
            let jitter_range = capped * jitter;
            let offset = rand::thread_rng().gen_range(-jitter_range..jitter_range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::try_from_secs_f64(jittered).unwrap_or(self.max_backoff)
    }

    /// Whether another restart may be attempted after `failures` consecutive failures
    pub fn has_attempts_remaining(&self, failures: u32) -> bool {
        match self.max_attempts {
            Some(max) => failures < max,
            None => true,
        }
    }
}
