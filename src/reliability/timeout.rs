//! Operation timeouts with an early warning threshold.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::domain::{ErrorKind, WalletError};

/// Fraction of the timeout after which the warning fires.
pub const DEFAULT_WARN_FRACTION: f64 = 0.8;

/// Wrap `operation` with a deadline. At `warn_fraction * timeout` an
/// informational warning fires; at `timeout` the operation fails with a
/// timeout error. A completion racing the deadline wins at most once; late
/// results are discarded with the future.
pub async fn with_timeout<T, Fut>(
    operation: Fut,
    timeout: Duration,
    name: &str,
) -> Result<T, WalletError>
where
    Fut: Future<Output = Result<T, WalletError>>,
{
    with_timeout_warn(operation, timeout, name, DEFAULT_WARN_FRACTION, |elapsed| {
        warn!(operation = name, elapsed_ms = elapsed.as_millis() as u64, "Operation nearing timeout");
    })
    .await
}

/// [`with_timeout`] with a caller-supplied warning callback and fraction.
pub async fn with_timeout_warn<T, Fut>(
    operation: Fut,
    timeout: Duration,
    name: &str,
    warn_fraction: f64,
    warn_fn: impl FnOnce(Duration),
) -> Result<T, WalletError>
where
    Fut: Future<Output = Result<T, WalletError>>,
{
    let warn_after = timeout.mul_f64(warn_fraction.clamp(0.0, 1.0));

    tokio::pin!(operation);

    tokio::select! {
        result = &mut operation => return result,
        _ = tokio::time::sleep(warn_after) => {
            warn_fn(warn_after);
        }
    }

    let remaining = timeout.saturating_sub(warn_after);
    tokio::select! {
        result = &mut operation => result,
        _ = tokio::time::sleep(remaining) => Err(WalletError::new(
            ErrorKind::ConnectionTimeout,
            format!("{name} timed out after {}ms", timeout.as_millis()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_completes_before_warning() {
        let warned = Arc::new(AtomicBool::new(false));
        let w = Arc::clone(&warned);
        let result = with_timeout_warn(
            async { Ok::<_, WalletError>(5) },
            Duration::from_secs(1),
            "fast",
            0.8,
            move |_| w.store(true, Ordering::SeqCst),
        )
        .await;
        assert_eq!(result.unwrap(), 5);
        assert!(!warned.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_warns_then_completes() {
        let warned = Arc::new(AtomicBool::new(false));
        let w = Arc::clone(&warned);
        let result = with_timeout_warn(
            async {
                tokio::time::sleep(Duration::from_millis(900)).await;
                Ok::<_, WalletError>("late but fine")
            },
            Duration::from_secs(1),
            "slowish",
            0.8,
            move |_| w.store(true, Ordering::SeqCst),
        )
        .await;
        assert_eq!(result.unwrap(), "late but fine");
        assert!(warned.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_with_timeout_kind() {
        let result: Result<(), _> = with_timeout(
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
            Duration::from_secs(1),
            "stuck",
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConnectionTimeout);
        assert!(err.message.contains("stuck"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_error_passes_through() {
        let result: Result<(), _> = with_timeout(
            async { Err(WalletError::new(ErrorKind::RpcError, "rpc down")) },
            Duration::from_secs(1),
            "rpc",
        )
        .await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::RpcError);
    }
}
