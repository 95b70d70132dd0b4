//! Bounded poll-until-success.
//!
//! Used where an operation races with something outside our control, such as
//! a pod that is `Running` before its network namespace accepts connections.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{DevError, Result};

/// Interval and total budget for [`poll_immediate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl RetryPolicy {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }
}

/// Run `probe` now and then every `interval` until it reports `Ok(true)`.
///
/// `Ok(false)` means "not yet"; an `Err` from the probe aborts immediately.
/// Fails with [`DevError::RetryTimeout`] once the budget is spent and with
/// [`DevError::Cancelled`] if `token` fires first.
pub async fn poll_immediate<F, Fut>(
    policy: RetryPolicy,
    token: &CancellationToken,
    mut probe: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now() + policy.timeout;
    loop {
        if token.is_cancelled() {
            return Err(DevError::Cancelled);
        }
        if probe().await? {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(DevError::RetryTimeout(policy.timeout));
        }
        let wait = policy.interval.min(deadline - now);
        tokio::select! {
            _ = token.cancelled() => return Err(DevError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const FAST: RetryPolicy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(200));

    #[tokio::test]
    async fn test_succeeds_after_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        poll_immediate(FAST, &CancellationToken::new(), || {
            let n = c.fetch_add(1, Ordering::SeqCst);
            async move { Ok(n >= 2) }
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_times_out() {
        let policy = RetryPolicy::new(Duration::from_millis(2), Duration::from_millis(10));
        let err = poll_immediate(policy, &CancellationToken::new(), || async { Ok(false) })
            .await
            .unwrap_err();
        assert!(matches!(err, DevError::RetryTimeout(_)));
    }

    #[tokio::test]
    async fn test_probe_error_aborts() {
        let err = poll_immediate(FAST, &CancellationToken::new(), || async {
            Err(DevError::Cluster("gone".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, DevError::Cluster(_)));
    }

    #[tokio::test]
    async fn test_cancelled_token() {
        let token = CancellationToken::new();
        token.cancel();
        let err = poll_immediate(FAST, &token, || async { Ok(true) })
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
