//! Per-provider rate limiting using the token bucket algorithm
//!
//! Email providers enforce a per-second sending ceiling. Each provider key
//! gets its own bucket:
//!
//! - Tokens are added at a constant rate (`messages_per_second`)
//! - Each send consumes one token
//! - The bucket holds at most `burst_size` tokens
//!
//! ```text
//! Rate limit: 10 msg/sec, burst: 20
//! - Bucket starts with 20 tokens
//! - 20 sends may go out immediately
//! - Then sustained at 10/sec
//! ```

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use cadence_common::internal;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Provider the processor sends through
    ///
    /// Default: "default"
    #[serde(default = "default_provider")]
    pub provider: String,

    /// Messages per second for providers without an override
    ///
    /// Default: 10
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: f64,

    /// Bucket capacity for providers without an override
    ///
    /// Default: 20
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,

    /// Per-provider overrides
    #[serde(default)]
    pub providers: ahash::AHashMap<String, ProviderRateLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            messages_per_second: default_messages_per_second(),
            burst_size: default_burst_size(),
            providers: ahash::AHashMap::default(),
        }
    }
}

fn default_provider() -> String {
    "default".to_string()
}

const fn default_messages_per_second() -> f64 {
    10.0
}

const fn default_burst_size() -> u32 {
    20
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProviderRateLimit {
    pub messages_per_second: f64,
    pub burst_size: u32,
}

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(messages_per_second: f64, burst_size: u32) -> Self {
        let capacity = f64::from(burst_size.max(1));
        Self {
            tokens: capacity,
            capacity,
            refill_rate: messages_per_second,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = elapsed.mul_add(self.refill_rate, self.tokens).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();

        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }

        if self.refill_rate <= 0.0 {
            return Duration::from_secs(1);
        }

        Duration::from_secs_f64((1.0 - self.tokens) / self.refill_rate)
    }
}

/// Token buckets keyed by provider
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Arc<parking_lot::Mutex<TokenBucket>>>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// The provider sends are dispatched through
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.config.provider
    }

    fn bucket(&self, provider: &str) -> Arc<parking_lot::Mutex<TokenBucket>> {
        self.buckets
            .entry(provider.to_string())
            .or_insert_with(|| {
                let (messages_per_second, burst_size) =
                    self.config.providers.get(provider).map_or(
                        (self.config.messages_per_second, self.config.burst_size),
                        |limit| (limit.messages_per_second, limit.burst_size),
                    );

                Arc::new(parking_lot::Mutex::new(TokenBucket::new(
                    messages_per_second,
                    burst_size,
                )))
            })
            .clone()
    }

    /// Take a token for `provider`.
    ///
    /// Returns `Err(wait)` with the time until a token is available when the
    /// bucket is empty.
    pub fn check_rate_limit(&self, provider: &str) -> Result<(), Duration> {
        let bucket = self.bucket(provider);
        let mut bucket = bucket.lock();

        if bucket.try_consume() {
            Ok(())
        } else {
            let wait = bucket.time_until_available();
            drop(bucket);
            internal!(
                level = DEBUG,
                provider = %provider,
                wait_seconds = wait.as_secs_f64(),
                "Provider rate limit reached, must wait"
            );
            Err(wait)
        }
    }

    /// Wait until a token for `provider` is available and take it
    pub async fn acquire(&self, provider: &str) {
        while let Err(wait) = self.check_rate_limit(provider) {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn buckets_allow_a_burst_then_refuse() {
        let mut bucket = TokenBucket::new(10.0, 20);

        for _ in 0..20 {
            assert!(bucket.try_consume());
        }
        assert!(!bucket.try_consume());
        assert!(bucket.time_until_available() > Duration::ZERO);
    }

    #[test]
    fn providers_have_independent_buckets() {
        let mut providers = ahash::AHashMap::default();
        providers.insert(
            "slow".to_string(),
            ProviderRateLimit {
                messages_per_second: 1.0,
                burst_size: 1,
            },
        );
        let limiter = RateLimiter::new(RateLimitConfig {
            providers,
            ..RateLimitConfig::default()
        });

        assert!(limiter.check_rate_limit("slow").is_ok());
        let wait = limiter.check_rate_limit("slow").unwrap_err();
        assert!(wait <= Duration::from_secs(1));

        assert!(limiter.check_rate_limit("default").is_ok());
    }

    #[tokio::test]
    async fn acquire_waits_for_a_refill() {
        let mut providers = ahash::AHashMap::default();
        providers.insert(
            "fast".to_string(),
            ProviderRateLimit {
                messages_per_second: 100.0,
                burst_size: 1,
            },
        );
        let limiter = RateLimiter::new(RateLimitConfig {
            providers,
            ..RateLimitConfig::default()
        });

        let start = Instant::now();
        limiter.acquire("fast").await;
        limiter.acquire("fast").await;
        assert!(start.elapsed() >= Duration::from_millis(5));
    }
}
