// # Transaction Executor
//
// `within_tx` drives a user closure under the pool's retry policy: every
// attempt borrows a fresh connection and begins a fresh transaction, commits
// on success, rolls back on failure, and re-drives the whole attempt when
// the error classifies as retryable. There are no savepoints; an attempt is
// all-or-nothing.
//
// `Transaction` is also usable directly via `PooledConn::begin` for callers
// that need manual demarcation. Dropping an unterminated transaction marks
// the connection dirty so the pool closes it instead of reusing it (the
// server rolls back on connection close).

use std::time::Instant;

use futures::future::BoxFuture;
use tracing::Instrument;

use crate::builder::NamedParams;
use crate::context::Context;
use crate::driver::{BoxRowCursor, ExecOutcome, Row, Value};
use crate::error::{DbError, Result};
use crate::observe::metric;
use crate::pool::{ConnectionPool, PooledConn};
use crate::retry;

/// An open transaction on a borrowed connection. Terminates in exactly one
/// of: committed, rolled back, or (via drop) connection teardown.
pub struct Transaction<'c> {
    conn: &'c mut PooledConn,
    finished: bool,
}

impl<'c> Transaction<'c> {
    pub async fn exec(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> Result<ExecOutcome> {
        self.conn.exec(ctx, sql, args).await
    }

    pub async fn query(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> Result<BoxRowCursor> {
        self.conn.query(ctx, sql, args).await
    }

    pub async fn query_row(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> Result<Option<Row>> {
        self.conn.query_row(ctx, sql, args).await
    }

    pub async fn named_exec(
        &mut self,
        ctx: &Context,
        sql: &str,
        params: &NamedParams,
    ) -> Result<ExecOutcome> {
        self.conn.named_exec(ctx, sql, params).await
    }

    pub async fn bulk_insert(
        &mut self,
        ctx: &Context,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Value>],
    ) -> Result<ExecOutcome> {
        self.conn.bulk_insert(ctx, table, columns, rows).await
    }

    /// Commit and consume the transaction. A failed commit needs no
    /// rollback; the server discards the transaction on its own.
    pub async fn commit(mut self, ctx: &Context) -> Result<()> {
        self.finished = true;
        self.conn.raw_commit(ctx).await
    }

    /// Roll back and consume the transaction.
    pub async fn rollback(mut self, ctx: &Context) -> Result<()> {
        self.finished = true;
        self.conn.raw_rollback(ctx).await
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // tx_open stays set on the borrow; the pool will close the
            // connection on release instead of pooling it.
            tracing::warn!(
                connection_id = self.conn.id(),
                "transaction dropped without commit or rollback"
            );
        }
    }
}

impl PooledConn {
    /// Begin a transaction on this borrow. The borrow is unusable for other
    /// statements until the transaction commits or rolls back.
    pub async fn begin(&mut self, ctx: &Context) -> Result<Transaction<'_>> {
        self.raw_begin(ctx).await?;
        Ok(Transaction {
            conn: self,
            finished: false,
        })
    }
}

/// The closure type driven by `within_tx`.
pub type TxBody<'t> = BoxFuture<'t, Result<()>>;

impl ConnectionPool {
    /// Run `f` inside a transaction, retrying retryable failures under the
    /// pool's retry policy. Each attempt runs on a freshly borrowed
    /// connection with a freshly begun transaction.
    ///
    /// - `f` returns `Ok`: the transaction commits; a commit failure is
    ///   returned as-is.
    /// - `f` returns `Err`: the transaction rolls back (rollback errors are
    ///   ignored) and the error is classified for retry.
    ///
    /// Exhausting the retry budget on a retryable error yields
    /// `TransactionAborted` wrapping the last cause; non-retryable errors
    /// surface unchanged.
    pub async fn within_tx<F>(&self, ctx: &Context, f: F) -> Result<()>
    where
        F: for<'t, 'c> Fn(&'t mut Transaction<'c>, &'t Context) -> TxBody<'t>,
    {
        let policy = self.config().retry.clone();
        // One span wraps every attempt.
        let span = if self.config().observability.tracing {
            tracing::info_span!("db.within_tx")
        } else {
            tracing::Span::none()
        };

        let result = retry::run(ctx, &policy, |attempt| {
            if attempt > 1 && self.config().observability.metrics {
                self.inner.metrics_sink().inc_counter(metric::TX_RETRIES, 1);
            }
            self.tx_attempt(ctx, &f)
        })
        .instrument(span)
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_retryable() => {
                // The retry budget ran out on a retryable failure.
                Err(DbError::TransactionAborted { source: Box::new(e) })
            }
            Err(e) => Err(e),
        }
    }

    async fn tx_attempt<F>(&self, ctx: &Context, f: &F) -> Result<()>
    where
        F: for<'t, 'c> Fn(&'t mut Transaction<'c>, &'t Context) -> TxBody<'t>,
    {
        let mut conn = self.acquire(ctx).await?;
        let started = Instant::now();

        let outcome = {
            let mut tx = conn.begin(ctx).await?;
            match f(&mut tx, ctx).await {
                Ok(()) => tx.commit(ctx).await,
                Err(e) => {
                    if let Err(rollback_err) = tx.rollback(ctx).await {
                        tracing::warn!(error = %rollback_err, "rollback failed");
                    }
                    Err(e)
                }
            }
        };

        if self.config().observability.metrics {
            let sink = self.inner.metrics_sink();
            match &outcome {
                Ok(()) => sink.inc_counter(metric::TX_COMMITS, 1),
                Err(_) => sink.inc_counter(metric::TX_ROLLBACKS, 1),
            }
        }
        tracing::debug!(
            target: "rusty_mysql::tx",
            duration_ms = started.elapsed().as_millis() as u64,
            ok = outcome.is_ok(),
            "transaction attempt finished"
        );

        if let Err(e) = conn.release().await {
            tracing::warn!(error = %e, "release after transaction failed");
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::DbConfig;
    use crate::driver::mock::{MockDriver, MockHandle};

    async fn pool_with(config_fn: impl FnOnce(&mut DbConfig)) -> (ConnectionPool, MockHandle) {
        let driver = Arc::new(MockDriver::new());
        let handle = driver.handle();
        let mut config = DbConfig::for_driver("mock");
        config.endpoint.database = "test".into();
        config_fn(&mut config);
        let pool = ConnectionPool::connect_with_driver(config, driver)
            .await
            .unwrap();
        (pool, handle)
    }

    #[tokio::test]
    async fn test_commit_path() {
        let (pool, handle) = pool_with(|_| {}).await;
        let ctx = Context::background();

        pool.within_tx(&ctx, |tx, ctx| {
            Box::pin(async move {
                tx.exec(ctx, "INSERT INTO t(a) VALUES(?)", &[Value::Int(1)])
                    .await?;
                Ok(())
            })
        })
        .await
        .unwrap();

        assert_eq!(handle.committed_matching("INSERT INTO t"), 1);
        assert!(handle.rolled_back().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_path_returns_sentinel() {
        let (pool, handle) = pool_with(|_| {}).await;
        let ctx = Context::background();

        let result = pool
            .within_tx(&ctx, |tx, ctx| {
                Box::pin(async move {
                    tx.exec(ctx, "INSERT INTO t(a) VALUES(?)", &[Value::Int(1)])
                        .await?;
                    Err(DbError::Builder("sentinel".into()))
                })
            })
            .await;

        match result {
            Err(DbError::Builder(message)) => assert_eq!(message, "sentinel"),
            other => panic!("expected the sentinel error, got {other:?}"),
        }
        assert_eq!(handle.committed_matching("INSERT INTO t"), 0);
        assert_eq!(handle.rolled_back().len(), 1);
    }

    #[tokio::test]
    async fn test_deadlock_then_success() {
        let (pool, handle) = pool_with(|c| {
            c.retry.max_attempts = 2;
            c.retry.base_backoff = Duration::from_millis(1);
            c.retry.max_backoff = Duration::from_millis(2);
            c.retry.jitter = false;
        })
        .await;
        let ctx = Context::background();
        handle.script_error("UPDATE t", 1213, "Deadlock found", 1);

        pool.within_tx(&ctx, |tx, ctx| {
            Box::pin(async move {
                tx.exec(ctx, "UPDATE t SET a=2 WHERE id=1", &[]).await?;
                Ok(())
            })
        })
        .await
        .unwrap();

        // Two attempts hit the driver; only the second committed.
        assert_eq!(handle.statements_matching("UPDATE t"), 2);
        assert_eq!(handle.committed_matching("UPDATE t"), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_wrap_cause() {
        let (pool, handle) = pool_with(|c| {
            c.retry.max_attempts = 2;
            c.retry.base_backoff = Duration::from_millis(1);
            c.retry.max_backoff = Duration::from_millis(2);
            c.retry.jitter = false;
        })
        .await;
        let ctx = Context::background();
        handle.script_error("UPDATE t", 1213, "Deadlock found", 10);

        let attempts = Arc::new(AtomicU32::new(0));
        let counted = attempts.clone();
        let result = pool
            .within_tx(&ctx, move |tx, ctx| {
                counted.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    tx.exec(ctx, "UPDATE t SET a=2 WHERE id=1", &[]).await?;
                    Ok(())
                })
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        match result {
            Err(DbError::TransactionAborted { source }) => {
                assert_eq!(source.code(), Some(1213));
            }
            other => panic!("expected TransactionAborted, got {other:?}"),
        }
        assert_eq!(handle.committed_matching("UPDATE t"), 0);
    }

    #[tokio::test]
    async fn test_every_attempt_uses_fresh_transaction() {
        let (pool, handle) = pool_with(|c| {
            c.retry.max_attempts = 3;
            c.retry.base_backoff = Duration::from_millis(1);
            c.retry.max_backoff = Duration::from_millis(2);
            c.retry.jitter = false;
        })
        .await;
        let ctx = Context::background();
        // First statement of each attempt succeeds; the second fails twice.
        handle.script_error("UPDATE t SET b", 1213, "Deadlock found", 2);

        pool.within_tx(&ctx, |tx, ctx| {
            Box::pin(async move {
                tx.exec(ctx, "UPDATE t SET a=1 WHERE id=1", &[]).await?;
                tx.exec(ctx, "UPDATE t SET b=2 WHERE id=1", &[]).await?;
                Ok(())
            })
        })
        .await
        .unwrap();

        // Two aborted attempts rolled back their first statement; the third
        // committed both. No partial state leaked across attempts.
        assert_eq!(handle.committed_matching("UPDATE t SET a"), 1);
        assert_eq!(handle.committed_matching("UPDATE t SET b"), 1);
        assert_eq!(handle.rolled_back().len(), 2);
    }

    #[tokio::test]
    async fn test_manual_transaction_commit() {
        let (pool, handle) = pool_with(|_| {}).await;
        let ctx = Context::background();

        let mut conn = pool.acquire(&ctx).await.unwrap();
        let mut tx = conn.begin(&ctx).await.unwrap();
        tx.exec(&ctx, "INSERT INTO t(a) VALUES(?)", &[Value::Int(5)])
            .await
            .unwrap();
        tx.commit(&ctx).await.unwrap();
        conn.release().await.unwrap();

        assert_eq!(handle.committed_matching("INSERT INTO t"), 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_poisons_connection() {
        let (pool, handle) = pool_with(|c| {
            c.pool.max_open = 1;
            c.pool.max_idle = 1;
        })
        .await;
        let ctx = Context::background();

        let mut conn = pool.acquire(&ctx).await.unwrap();
        {
            let mut tx = conn.begin(&ctx).await.unwrap();
            tx.exec(&ctx, "INSERT INTO t(a) VALUES(?)", &[Value::Int(1)])
                .await
                .unwrap();
            // Dropped without commit or rollback.
        }
        conn.release().await.unwrap();

        // The poisoned connection was closed, not pooled.
        assert_eq!(handle.closed_connections(), 1);
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(handle.committed_matching("INSERT INTO t"), 0);
    }

    #[tokio::test]
    async fn test_cancellation_between_attempts() {
        let (pool, handle) = pool_with(|c| {
            c.retry.max_attempts = 5;
            c.retry.base_backoff = Duration::from_millis(50);
            c.retry.max_backoff = Duration::from_millis(50);
            c.retry.jitter = false;
        })
        .await;
        handle.script_error("UPDATE t", 1213, "Deadlock found", 10);

        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let result = pool
            .within_tx(&ctx, |tx, ctx| {
                Box::pin(async move {
                    tx.exec(ctx, "UPDATE t SET a=2 WHERE id=1", &[]).await?;
                    Ok(())
                })
            })
            .await;
        assert!(matches!(result, Err(DbError::Cancelled(_))));
        assert!(handle.statements_matching("UPDATE t") < 5);
    }
}
