//! Sliding-window rate limiter keyed by action.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::warn;

/// Limiter configuration.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    /// Cooldown applied when the window fills up.
    pub block_duration: Duration,
    /// Sliding window (true) or fixed window anchored at the first request.
    pub sliding_window: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 30,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(300),
            sliding_window: true,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        use std::env;

        let defaults = Self::default();
        let max_requests = env::var("CONNECT_RATE_LIMIT_MAX_REQUESTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_requests);
        let window = env::var("CONNECT_RATE_LIMIT_WINDOW_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.window);
        let block_duration = env::var("CONNECT_RATE_LIMIT_BLOCK_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.block_duration);

        Self {
            max_requests,
            window,
            block_duration,
            ..defaults
        }
    }
}

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Denied { retry_after } => Some(*retry_after),
            Self::Allowed { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
struct Bucket {
    timestamps: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

/// Per-action request throttle. Single mutator per keyed bucket; the map
/// guard serializes concurrent checks on the same action.
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    fn prune(&self, bucket: &mut Bucket, now: Instant) {
        if self.config.sliding_window {
            let cutoff = now.checked_sub(self.config.window);
            while let Some(first) = bucket.timestamps.front() {
                match cutoff {
                    Some(cutoff) if *first <= cutoff => {
                        bucket.timestamps.pop_front();
                    }
                    _ => break,
                }
            }
        } else if let Some(first) = bucket.timestamps.front()
            && now.duration_since(*first) >= self.config.window
        {
            bucket.timestamps.clear();
        }
    }

    /// Check and record one request for `action`.
    pub fn check(&self, action: &str) -> RateDecision {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(action.to_string()).or_default();

        if let Some(blocked_until) = bucket.blocked_until {
            if blocked_until > now {
                return RateDecision::Denied {
                    retry_after: blocked_until - now,
                };
            }
            bucket.blocked_until = None;
        }

        self.prune(&mut bucket, now);

        if bucket.timestamps.len() as u32 >= self.config.max_requests {
            let blocked_until = now + self.config.block_duration;
            bucket.blocked_until = Some(blocked_until);
            warn!(action, "Rate limit exceeded, blocking");
            return RateDecision::Denied {
                retry_after: self.config.block_duration,
            };
        }

        bucket.timestamps.push_back(now);
        RateDecision::Allowed {
            remaining: self.config.max_requests - bucket.timestamps.len() as u32,
        }
    }

    /// Like [`RateLimiter::check`] without recording the request or
    /// installing a block.
    pub fn peek(&self, action: &str) -> RateDecision {
        let now = Instant::now();
        let mut bucket = self.buckets.entry(action.to_string()).or_default();

        if let Some(blocked_until) = bucket.blocked_until
            && blocked_until > now
        {
            return RateDecision::Denied {
                retry_after: blocked_until - now,
            };
        }

        self.prune(&mut bucket, now);

        if bucket.timestamps.len() as u32 >= self.config.max_requests {
            RateDecision::Denied {
                retry_after: self.config.block_duration,
            }
        } else {
            RateDecision::Allowed {
                remaining: self.config.max_requests - bucket.timestamps.len() as u32,
            }
        }
    }

    /// Manually block an action, with an optional override duration.
    pub fn block(&self, action: &str, duration: Option<Duration>) {
        let until = Instant::now() + duration.unwrap_or(self.config.block_duration);
        self.buckets.entry(action.to_string()).or_default().blocked_until = Some(until);
    }

    pub fn unblock(&self, action: &str) {
        if let Some(mut bucket) = self.buckets.get_mut(action) {
            bucket.blocked_until = None;
        }
    }

    /// Drop all state for an action.
    pub fn reset(&self, action: &str) {
        self.buckets.remove(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: u64, block_ms: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests: max,
            window: Duration::from_millis(window_ms),
            block_duration: Duration::from_millis(block_ms),
            sliding_window: true,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_allows_then_blocks_with_retry_after() {
        let l = limiter(3, 5000, 10_000);

        assert_eq!(l.check("x"), RateDecision::Allowed { remaining: 2 });
        assert_eq!(l.check("x"), RateDecision::Allowed { remaining: 1 });
        assert_eq!(l.check("x"), RateDecision::Allowed { remaining: 0 });

        let denied = l.check("x");
        assert_eq!(denied.retry_after(), Some(Duration::from_millis(10_000)));

        let denied_again = l.check("x");
        let retry = denied_again.retry_after().unwrap();
        assert!(retry <= Duration::from_millis(10_000));
        assert!(retry >= Duration::from_millis(9_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides_at_exact_edges() {
        let l = limiter(1, 5000, 60_000);
        assert!(l.check("x").is_allowed());

        // One ms inside the window still counts against the limit.
        tokio::time::advance(Duration::from_millis(4999)).await;
        assert!(!l.peek("x").is_allowed());

        // One ms past the window the old request has aged out.
        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(l.peek("x").is_allowed());
        assert!(l.check("x").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_expires_after_duration() {
        let l = limiter(1, 1000, 2000);
        assert!(l.check("x").is_allowed());
        assert!(!l.check("x").is_allowed());

        tokio::time::advance(Duration::from_millis(2001)).await;
        assert!(l.check("x").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_does_not_mutate() {
        let l = limiter(2, 1000, 1000);
        assert_eq!(l.peek("x"), RateDecision::Allowed { remaining: 2 });
        assert_eq!(l.peek("x"), RateDecision::Allowed { remaining: 2 });
        assert_eq!(l.check("x"), RateDecision::Allowed { remaining: 1 });
        // Peek at the limit reports denied but installs no block.
        assert!(l.check("x").is_allowed());
        assert!(!l.peek("x").is_allowed());
        tokio::time::advance(Duration::from_millis(1001)).await;
        assert!(l.check("x").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_block_and_unblock() {
        let l = limiter(10, 1000, 1000);
        l.block("x", Some(Duration::from_secs(60)));
        assert!(!l.check("x").is_allowed());
        l.unblock("x");
        assert!(l.check("x").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let l = limiter(1, 1000, 1000);
        assert!(l.check("a").is_allowed());
        assert!(!l.check("a").is_allowed());
        assert!(l.check("b").is_allowed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_allowed_count_never_exceeds_max_within_window() {
        let l = limiter(5, 10_000, 10_000);
        let mut allowed = 0;
        for _ in 0..50 {
            if l.check("x").is_allowed() {
                allowed += 1;
            }
            tokio::time::advance(Duration::from_millis(10)).await;
        }
        assert!(allowed <= 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_clears_bucket() {
        let l = limiter(1, 60_000, 60_000);
        assert!(l.check("x").is_allowed());
        assert!(!l.check("x").is_allowed());
        l.reset("x");
        assert!(l.check("x").is_allowed());
    }
}
