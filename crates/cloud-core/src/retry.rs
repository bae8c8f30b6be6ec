//! Generic polling helper backing the engine's wait primitives.
//!
//! A labeled, logged retry loop with a *fixed* timeout and poll interval
//! rather than exponential backoff: lock-wait/status-wait/guest-agent-wait/
//! creation-wait are each a `(timeout, poll_interval)` pair, and exceeding
//! the timeout is always `ResourceUnavailable`, never a silent pass.

use std::time::Duration;

use tracing::warn;

use crate::error::EngineError;

/// Poll `check` every `poll_interval` until it resolves `Ok(Some(t))` or
/// `timeout` elapses. `check` errors are treated as transient and logged;
/// only a timeout produces `EngineError::ResourceUnavailable`.
pub async fn wait_until<F, Fut, T>(
    label: &str,
    timeout: Duration,
    poll_interval: Duration,
    mut check: F,
) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<Option<T>>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match check().await {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) => warn!(label, error = %e, "poll attempt failed, retrying"),
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(EngineError::ResourceUnavailable(format!(
                "timed out waiting for {label}"
            )));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn succeeds_once_predicate_is_true() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = wait_until("thing ready", Duration::from_secs(5), Duration::from_millis(100), move || {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok(if n >= 2 { Some(42) } else { None })
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 42);
        assert!(calls.load(Ordering::SeqCst) >= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_as_resource_unavailable() {
        let result: Result<(), EngineError> = wait_until(
            "never ready",
            Duration::from_millis(300),
            Duration::from_millis(100),
            || async { Ok(None) },
        )
        .await;
        assert!(matches!(result, Err(EngineError::ResourceUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_do_not_abort_early() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = wait_until("flaky check", Duration::from_secs(5), Duration::from_millis(100), move || {
            let calls = calls2.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    anyhow::bail!("transient failure")
                }
                Ok(Some(()))
            }
        })
        .await;
        assert!(result.is_ok());
    }
}
