//! Retry with jittered exponential backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::domain::WalletError;

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempt budget, including the first try.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Multiply each delay by a uniform factor in `[0.75, 1.25]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn from_env() -> Self {
        use std::env;

        let defaults = Self::default();
        let max_attempts = env::var("CONNECT_RETRY_MAX_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.max_attempts);
        let base_delay_ms = env::var("CONNECT_RETRY_BASE_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.base_delay);
        let max_delay_ms = env::var("CONNECT_RETRY_MAX_DELAY_MS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.max_delay);

        Self {
            max_attempts,
            base_delay: base_delay_ms,
            max_delay: max_delay_ms,
            ..defaults
        }
    }

    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry `k` (zero-based): `min(max, base * multiplier^k)`,
    /// jittered when enabled.
    pub fn delay_for(&self, k: u32) -> Duration {
        let exp = self.base_delay.as_secs_f64() * self.multiplier.powi(k as i32);
        let capped = exp.min(self.max_delay.as_secs_f64());
        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.75..=1.25)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }
}

/// Per-attempt observability hooks.
#[derive(Default)]
pub struct RetryHooks<'a> {
    /// Invoked after every failed attempt with (attempt index, error).
    pub on_attempt: Option<&'a (dyn Fn(u32, &WalletError) + Send + Sync)>,
    /// Invoked once when the attempt budget is exhausted.
    pub on_exhausted: Option<&'a (dyn Fn(&WalletError) + Send + Sync)>,
}

/// Run `operation` with the default retryable-kind predicate.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, WalletError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, WalletError>>,
{
    with_retry_if(config, operation, |e| e.kind.is_retryable(), RetryHooks::default()).await
}

/// Run `operation` up to `max_attempts` times. An error is retried iff
/// `should_retry` returns true; non-retryable errors short-circuit.
pub async fn with_retry_if<T, F, Fut>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: impl Fn(&WalletError) -> bool,
    hooks: RetryHooks<'_>,
) -> Result<T, WalletError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, WalletError>>,
{
    let attempts = config.max_attempts.max(1);
    let mut last_error: Option<WalletError> = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            tokio::time::sleep(config.delay_for(attempt - 1)).await;
        }

        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if let Some(on_attempt) = hooks.on_attempt {
                    on_attempt(attempt, &error);
                }
                if !should_retry(&error) {
                    debug!(attempt, kind = error.kind.code(), "Error not retryable, giving up");
                    return Err(error);
                }
                warn!(
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    kind = error.kind.code(),
                    error = %error,
                    "Attempt failed, will retry"
                );
                last_error = Some(error);
            }
        }
    }

    let error = last_error.expect("at least one attempt ran");
    if let Some(on_exhausted) = hooks.on_exhausted {
        on_exhausted(&error);
    }
    Err(error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn net_err() -> WalletError {
        WalletError::new(ErrorKind::NetworkError, "flaky")
    }

    #[tokio::test]
    async fn test_fails_twice_then_succeeds_after_three_invocations() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);

        let result = with_retry_if(
            &config,
            move |_| {
                let calls = Arc::clone(&calls_in);
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(net_err())
                    } else {
                        Ok("ok")
                    }
                }
            },
            |_| true,
            RetryHooks::default(),
        )
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_short_circuits() {
        let config = RetryConfig::default().with_base_delay(Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);

        let result: Result<(), _> = with_retry(&config, move |_| {
            let calls = Arc::clone(&calls_in);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(WalletError::new(ErrorKind::UserRejected, "declined"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().kind, ErrorKind::UserRejected);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_budget_respected_and_exhaustion_reported() {
        let config = RetryConfig {
            max_attempts: 4,
            base_delay: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        };
        let calls = Arc::new(AtomicU32::new(0));
        let exhausted = Arc::new(AtomicU32::new(0));
        let calls_in = Arc::clone(&calls);
        let exhausted_cb = Arc::clone(&exhausted);
        let on_exhausted = move |_: &WalletError| {
            exhausted_cb.fetch_add(1, Ordering::SeqCst);
        };

        let result: Result<(), _> = with_retry_if(
            &config,
            move |_| {
                let calls = Arc::clone(&calls_in);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(net_err())
                }
            },
            |_| true,
            RetryHooks {
                on_attempt: None,
                on_exhausted: Some(&on_exhausted),
            },
        )
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(exhausted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let config = RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(450),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(400));
        // capped
        assert_eq!(config.delay_for(3), Duration::from_millis(450));
    }

    #[test]
    fn test_jitter_bounds() {
        let config = RetryConfig {
            base_delay: Duration::from_millis(100),
            jitter: true,
            ..Default::default()
        };
        for _ in 0..50 {
            let d = config.delay_for(0);
            assert!(d >= Duration::from_micros(74_900), "jitter below bound: {d:?}");
            assert!(d <= Duration::from_micros(125_100), "jitter above bound: {d:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_elapsed_at_least_backoff_sum() {
        let config = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: false,
        };
        let start = tokio::time::Instant::now();
        let _: Result<(), _> = with_retry_if(
            &config,
            |_| async { Err(net_err()) },
            |_| true,
            RetryHooks::default(),
        )
        .await;
        // delays: 100ms + 200ms
        assert!(start.elapsed() >= Duration::from_millis(300));
    }
}
