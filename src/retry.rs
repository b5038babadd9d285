// # Retry Executor
//
// Drives an operation under a `RetryPolicy`. Only errors classified as
// retryable (deadlock, lock-wait timeout, read-only, unavailable) are
// re-driven; everything else surfaces unchanged. Backoff sleeps select on
// the context so cancellation cuts a wait short.

use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::RetryPolicy;
use crate::context::Context;
use crate::error::Result;

fn backoff_for_attempt(policy: &RetryPolicy, attempt: u32) -> Duration {
    let scaled = policy
        .base_backoff
        .checked_mul(attempt)
        .unwrap_or(policy.max_backoff);
    scaled.min(policy.max_backoff)
}

fn apply_jitter(sleep: Duration) -> Duration {
    let nanos = sleep.as_nanos() as u64;
    if nanos == 0 {
        return sleep;
    }
    Duration::from_nanos(rand::rng().random_range(0..nanos))
}

/// Run `op` up to `policy.max_attempts` times. The attempt number passed to
/// `op` is 1-indexed. Stops early on success, on a non-retryable error, on
/// context cancellation, or once `max_elapsed` is exceeded; exhaustion
/// returns the last error.
pub async fn run<T, F, Fut>(ctx: &Context, policy: &RetryPolicy, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut last_err = None;

    for attempt in 1..=policy.max_attempts {
        ctx.check()?;

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                tracing::debug!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %e,
                    "retryable failure"
                );
                last_err = Some(e);
            }
        }

        if attempt == policy.max_attempts {
            break;
        }
        if !policy.max_elapsed.is_zero() && started.elapsed() >= policy.max_elapsed {
            break;
        }

        let mut sleep = backoff_for_attempt(policy, attempt);
        if policy.jitter {
            sleep = apply_jitter(sleep);
        }
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = ctx.done() => return Err(ctx.err().expect("context done")),
        }
    }

    Err(last_err.expect("retry loop exited without an error"))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::error::DbError;

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            jitter: false,
            max_elapsed: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_success_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result = run(&Context::background(), &policy(3), |_| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_deadlock_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result: Result<&str> = run(&Context::background(), &policy(3), |_| {
            let counted = counted.clone();
            async move {
                if counted.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DbError::query(1213, "Deadlock found"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result: Result<()> = run(&Context::background(), &policy(5), |_| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err(DbError::query(1062, "Duplicate entry"))
            }
        })
        .await;
        assert_eq!(result.unwrap_err().code(), Some(1062));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let result: Result<()> = run(&Context::background(), &policy(4), |_| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Err(DbError::query(1205, "Lock wait timeout"))
            }
        })
        .await;
        assert_eq!(result.unwrap_err().code(), Some(1205));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_attempt_numbers_are_one_indexed() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _: Result<()> = run(&Context::background(), &policy(3), |attempt| {
            sink.lock().push(attempt);
            async { Err(DbError::query(1213, "Deadlock found")) }
        })
        .await;
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff() {
        let ctx = Context::background();
        let slow = RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
            jitter: false,
            max_elapsed: Duration::ZERO,
        };
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        let result: Result<()> = run(&ctx, &slow, |_| async {
            Err(DbError::query(1213, "Deadlock found"))
        })
        .await;
        assert!(matches!(result, Err(DbError::Cancelled(_))));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_max_elapsed_stops_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counted = calls.clone();
        let bounded = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(20),
            jitter: false,
            max_elapsed: Duration::from_millis(1),
        };
        let _: Result<()> = run(&Context::background(), &bounded, |_| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                Err(DbError::query(1213, "Deadlock found"))
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
            jitter: false,
            max_elapsed: Duration::ZERO,
        };
        assert_eq!(backoff_for_attempt(&policy, 1), Duration::from_millis(100));
        assert_eq!(backoff_for_attempt(&policy, 2), Duration::from_millis(200));
        assert_eq!(backoff_for_attempt(&policy, 3), Duration::from_millis(250));
        assert_eq!(backoff_for_attempt(&policy, 9), Duration::from_millis(250));
    }

    #[test]
    fn test_jitter_stays_below_base() {
        for _ in 0..100 {
            let jittered = apply_jitter(Duration::from_millis(50));
            assert!(jittered < Duration::from_millis(50));
        }
    }
}
