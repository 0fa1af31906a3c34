//! Retry loop: run an async attempt until success or the policy says stop.

use anyhow::Result;
use std::future::Future;

use super::classify;
use super::policy::{RetryDecision, RetryPolicy};
use crate::stop::StopToken;

/// Runs `f` until it succeeds or the retry policy gives up. Polls the stop
/// token before every attempt so a pause/cancel is observed instead of a
/// backoff sleep. The first non-retryable error is returned unchanged.
pub async fn run_with_retry<T, F, Fut>(policy: &RetryPolicy, stop: &StopToken, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1u32;
    loop {
        stop.check()?;
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let kind = classify::classify(&e);
                match policy.decide(attempt, kind.is_retryable()) {
                    RetryDecision::NoRetry => return Err(e),
                    RetryDecision::RetryAfter(delay) => {
                        tracing::debug!(attempt, ?kind, "retrying in {:?}: {:#}", delay, e);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::error::HttpStatusError;
    use crate::stop::{StopMode, Stopped};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: retries + 1,
            base_delay: std::time::Duration::from_millis(1),
            max_delay: std::time::Duration::from_millis(2),
        }
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let stop = StopToken::new();
        let out = run_with_retry(&fast_policy(3), &stop, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(HttpStatusError::new(503, b"").into())
            } else {
                Ok(7u32)
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn budget_exhaustion_returns_last_error() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let stop = StopToken::new();
        let err = run_with_retry(&fast_policy(2), &stop, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(HttpStatusError::new(429, b"limit").into())
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("bad status: 429"));
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let stop = StopToken::new();
        let err = run_with_retry(&fast_policy(5), &stop, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(HttpStatusError::new(404, b"not found").into())
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn stop_signal_wins_over_backoff() {
        let stop = StopToken::new();
        stop.signal(StopMode::Pause);
        let err = run_with_retry(&fast_policy(2), &stop, || async { Ok(()) })
            .await
            .unwrap_err();
        let stopped = err.downcast_ref::<Stopped>().expect("stopped");
        assert_eq!(stopped.mode, StopMode::Pause);
    }
}
