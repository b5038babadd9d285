// # Cancellation Context
//
// Every data-plane operation takes an explicit `&Context` as its first
// parameter. The context carries a cancellation token and an optional
// deadline; both surface to callers as `DbError::Cancelled`. Internal waits
// (pool acquire, retry backoff, driver round-trips, row iteration, monitor
// ticks) select on `Context::done()`.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{DbError, Result};

#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and carries no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A fresh context that expires after `timeout`.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// A fresh context that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    /// Derive a child context. Cancelling the parent cancels the child;
    /// cancelling the child leaves the parent untouched.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Derive a child context whose deadline is the sooner of the parent's
    /// deadline and `now + timeout`.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(d) => d.min(candidate),
            None => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    /// Cancel this context and all contexts derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left until the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// The context error, when the context is already done.
    pub fn err(&self) -> Option<DbError> {
        if self.token.is_cancelled() {
            Some(DbError::Cancelled("context cancelled".into()))
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(DbError::Cancelled("deadline exceeded".into()))
        } else {
            None
        }
    }

    /// Fail fast when the context is already done.
    pub fn check(&self) -> Result<()> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    /// Pending forever for a background context.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Drive `fut` to completion unless the context finishes first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            result = fut => result,
            _ = self.done() => Err(self.err().unwrap_or_else(|| {
                DbError::Cancelled("context cancelled".into())
            })),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_background_never_done() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert!(ctx.err().is_none());
        assert!(ctx.check().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_child() {
        let ctx = Context::background();
        let child = ctx.child();
        ctx.cancel();
        assert!(child.is_done());
        assert!(matches!(child.err(), Some(DbError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let ctx = Context::background();
        let child = ctx.child();
        child.cancel();
        assert!(!ctx.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_expires() {
        let ctx = Context::with_timeout(Duration::from_millis(50));
        assert!(!ctx.is_done());
        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(ctx.is_done());
        assert!(matches!(ctx.err(), Some(DbError::Cancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_cut_short_by_deadline() {
        let ctx = Context::with_timeout(Duration::from_millis(10));
        let result: Result<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(DbError::Cancelled(_))));
    }

    #[tokio::test]
    async fn test_run_completes_before_deadline() {
        let ctx = Context::with_timeout(Duration::from_secs(5));
        let result = ctx.run(async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_deadline_is_sooner_of_both() {
        let parent = Context::with_timeout(Duration::from_millis(100));
        let child = parent.child_with_timeout(Duration::from_secs(10));
        tokio::time::advance(Duration::from_millis(110)).await;
        assert!(child.is_done());
    }
}
