//! Retry pacing for failing reconciles.
//!
//! The controller asks a [`RateLimiter`] how long to hold a key back before
//! its next attempt. The default combines a per-item exponential policy with
//! a global token bucket, taking whichever delay is larger.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Computes the delay before an attempt may be dispatched.
pub trait RateLimiter: Send + Sync {
    /// Delay for a key that has failed `attempts` times already.
    fn when(&self, attempts: u32) -> Duration;
}

/// Exponential per-item policy: `base_delay · 2^attempts`, capped.
pub struct ItemExponentialRateLimiter {
    base_delay: Duration,
    max_delay: Duration,
}

impl ItemExponentialRateLimiter {
    /// Policy growing from `base_delay` and capping at `max_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { base_delay, max_delay }
    }
}

impl Default for ItemExponentialRateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_secs(1000))
    }
}

impl RateLimiter for ItemExponentialRateLimiter {
    fn when(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

/// Global token bucket: sustained `qps` with a `burst` allowance.
///
/// Reservation-style: every call takes a token, and a drained bucket hands
/// out increasing delays instead of refusing.
pub struct TokenBucketRateLimiter {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucketRateLimiter {
    /// Bucket refilling at `qps` tokens per second, holding at most `burst`.
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: f64::from(burst),
            state: Mutex::new(BucketState {
                tokens: f64::from(burst),
                last_refill: Instant::now(),
            }),
        }
    }
}

impl Default for TokenBucketRateLimiter {
    fn default() -> Self {
        Self::new(10.0, 100)
    }
}

impl RateLimiter for TokenBucketRateLimiter {
    fn when(&self, _attempts: u32) -> Duration {
        let now = Instant::now();
        let mut state = self.state.lock();
        let refilled = state.tokens + now.duration_since(state.last_refill).as_secs_f64() * self.qps;
        state.tokens = refilled.min(self.burst) - 1.0;
        state.last_refill = now;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.qps)
        }
    }
}

/// Combines limiters by taking the worst (largest) delay.
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    /// Combine the given limiters.
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, attempts: u32) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(attempts))
            .max()
            .unwrap_or(Duration::ZERO)
    }
}

/// The controller default: 5ms..1000s per-item exponential plus a
/// 10 qps / 100 burst bucket.
pub fn default_rate_limiter() -> MaxOfRateLimiter {
    MaxOfRateLimiter::new(vec![
        Box::new(ItemExponentialRateLimiter::default()),
        Box::new(TokenBucketRateLimiter::default()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_until_capped() {
        let limiter = ItemExponentialRateLimiter::new(Duration::from_millis(5), Duration::from_secs(10));
        assert_eq!(limiter.when(0), Duration::from_millis(5));
        assert_eq!(limiter.when(1), Duration::from_millis(10));
        assert_eq!(limiter.when(4), Duration::from_millis(80));
        assert_eq!(limiter.when(32), Duration::from_secs(10));
        assert_eq!(limiter.when(u32::MAX), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_paces() {
        let limiter = TokenBucketRateLimiter::new(10.0, 3);
        assert_eq!(limiter.when(0), Duration::ZERO);
        assert_eq!(limiter.when(0), Duration::ZERO);
        assert_eq!(limiter.when(0), Duration::ZERO);
        // bucket drained: the fourth caller waits one refill interval
        let delay = limiter.when(0);
        assert!(delay > Duration::from_millis(90) && delay <= Duration::from_millis(110));
        // and the debt keeps growing
        assert!(limiter.when(0) > delay);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let limiter = TokenBucketRateLimiter::new(10.0, 1);
        assert_eq!(limiter.when(0), Duration::ZERO);
        assert!(limiter.when(0) > Duration::ZERO);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(limiter.when(0), Duration::ZERO);
    }

    #[test]
    fn max_of_takes_the_larger_delay() {
        let slow = ItemExponentialRateLimiter::new(Duration::from_secs(1), Duration::from_secs(100));
        let fast = ItemExponentialRateLimiter::new(Duration::from_millis(1), Duration::from_secs(100));
        let max = MaxOfRateLimiter::new(vec![Box::new(slow), Box::new(fast)]);
        assert_eq!(max.when(2), Duration::from_secs(4));
    }
}
