//! Per-recipient retry with exponential backoff

use std::time::Duration;

use cadence_common::Timestamp;
use rand::Rng;
use serde::Deserialize;

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_retry_delay() -> u64 {
    60
}

const fn default_max_retry_delay() -> u64 {
    3600
}

const fn default_retry_jitter_factor() -> f64 {
    0.2
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryPolicy {
    /// Transport attempts per recipient before the failure is permanent
    ///
    /// Default: 3
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay for exponential backoff (in seconds)
    ///
    /// Default: 60 seconds
    #[serde(default = "default_base_retry_delay")]
    pub base_retry_delay_secs: u64,

    /// Cap on the backoff delay (in seconds)
    ///
    /// Default: 3600 seconds
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_secs: u64,

    /// Jitter factor (0.0 to 1.0), 0.2 meaning ±20%
    ///
    /// Default: 0.2
    #[serde(default = "default_retry_jitter_factor")]
    pub retry_jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_retry_delay_secs: default_base_retry_delay(),
            max_retry_delay_secs: default_max_retry_delay(),
            retry_jitter_factor: default_retry_jitter_factor(),
        }
    }
}

impl RetryPolicy {
    /// Whether a failed `attempt` may be followed by another
    #[must_use]
    pub const fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// When the recipient may be retried after failed `attempt`
    #[must_use]
    pub fn next_retry_at(&self, attempt: u32, now: Timestamp) -> Timestamp {
        let delay = calculate_retry_delay(
            attempt,
            self.base_retry_delay_secs,
            self.max_retry_delay_secs,
            self.retry_jitter_factor,
        );
        now.saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX))
    }
}

/// `min(base * 2^(attempt - 1), max) * (1 ± jitter)`
pub fn calculate_retry_delay(
    attempt: u32,
    base_delay_secs: u64,
    max_delay_secs: u64,
    jitter_factor: f64,
) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let delay = if exponent >= 63 {
        max_delay_secs
    } else {
        base_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(max_delay_secs)
    };

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let jittered = {
        let range = (delay as f64) * jitter_factor;
        let jitter: f64 = if range > 0.0 {
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };
        ((delay as f64) + jitter).max(0.0) as u64
    };

    Duration::from_secs(jittered)
}
