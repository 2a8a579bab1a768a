//! Token-bucket rate limiting for destination flushes.
//!
//! One token is spent per flush. Tokens refill continuously at
//! `requests_per_second` up to `burst`; an empty bucket makes the writer
//! wait instead of failing.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Rate limit settings. `requests_per_second == 0` disables limiting.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfig {
    pub requests_per_second: f64,
    /// Bucket capacity, also the number of flushes allowed back to back.
    pub burst: u32,
}

impl RateLimitConfig {
    #[must_use]
    pub fn unlimited() -> Self {
        Self {
            requests_per_second: 0.0,
            burst: 0,
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.requests_per_second > 0.0
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::unlimited()
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by the write stage of one execution.
pub struct TokenBucketRateLimiter {
    config: RateLimitConfig,
    capacity: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucketRateLimiter {
    /// The bucket starts full.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = f64::from(config.burst.max(1));
        Self {
            config,
            capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    ///
    /// Returns the time spent waiting.
    pub async fn acquire(&self) -> Duration {
        if !self.config.is_enabled() {
            return Duration::ZERO;
        }

        let start = Instant::now();
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                let now = Instant::now();
                let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
                bucket.tokens =
                    (bucket.tokens + elapsed * self.config.requests_per_second).min(self.capacity);
                bucket.last_refill = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    let waited = start.elapsed();
                    if !waited.is_zero() {
                        debug!(waited = ?waited, "Rate limiter delayed flush");
                    }
                    return waited;
                }
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.config.requests_per_second)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_passes_without_waiting() {
        let limiter = TokenBucketRateLimiter::new(RateLimitConfig {
            requests_per_second: 1.0,
            burst: 3,
        });
        for _ in 0..3 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_when_bucket_empty() {
        let limiter = TokenBucketRateLimiter::new(RateLimitConfig {
            requests_per_second: 2.0,
            burst: 1,
        });
        assert_eq!(limiter.acquire().await, Duration::ZERO);

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refills_over_time() {
        let limiter = TokenBucketRateLimiter::new(RateLimitConfig {
            requests_per_second: 10.0,
            burst: 1,
        });
        limiter.acquire().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(limiter.acquire().await, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_disabled_never_waits() {
        let limiter = TokenBucketRateLimiter::new(RateLimitConfig::unlimited());
        for _ in 0..100 {
            assert_eq!(limiter.acquire().await, Duration::ZERO);
        }
    }
}
