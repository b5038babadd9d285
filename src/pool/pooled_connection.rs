// # Pooled Connection (Borrow)
//
// A borrow exclusively owns one driver connection from acquisition until
// release. Every data-plane operation runs through the observability fan-out:
// a tracing span when enabled, operation metrics, a query log line, and the
// slow-query recorder. Operations after release fail `ConnectionClosed`;
// release returns the connection to the pool exactly once, with `Drop` as a
// spawned safety net.

use std::sync::Arc;
use std::time::Instant;

use tracing::Instrument;

use super::connection_pool::PoolInner;
use super::statement_cache::{StatementCache, StatementCacheStats};
use crate::builder::{self, NamedParams};
use crate::context::Context;
use crate::driver::{BoxDriverConnection, BoxRowCursor, ExecOutcome, Row, Value};
use crate::error::{DbError, Result};
use crate::observe::metric;

pub struct PooledConn {
    pub(super) conn: Option<BoxDriverConnection>,
    pub(super) pool: Arc<PoolInner>,
    pub(super) id: u64,
    pub(super) created_at: Instant,
    pub(super) acquired_at: Instant,
    pub(super) cache: Option<StatementCache>,
    pub(super) tx_open: bool,
}

impl PooledConn {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Age of the underlying driver connection.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// How long this borrow has been held.
    pub fn held_for(&self) -> std::time::Duration {
        self.acquired_at.elapsed()
    }

    pub fn cache_stats(&self) -> Option<StatementCacheStats> {
        self.cache.as_ref().map(|c| c.stats())
    }

    fn conn_mut(&mut self) -> Result<&mut BoxDriverConnection> {
        self.conn.as_mut().ok_or(DbError::ConnectionClosed)
    }

    fn finish_op(
        &self,
        op: &'static str,
        sql: &str,
        args: &[Value],
        started: Instant,
        error: Option<&DbError>,
    ) {
        let duration = started.elapsed();
        let obs = &self.pool.config.observability;

        if obs.logging {
            match error {
                Some(e) => tracing::warn!(
                    target: "rusty_mysql::query",
                    op,
                    sql,
                    duration_ms = duration.as_millis() as u64,
                    error = %e,
                    "operation failed"
                ),
                None => tracing::debug!(
                    target: "rusty_mysql::query",
                    op,
                    sql,
                    duration_ms = duration.as_millis() as u64,
                    "operation complete"
                ),
            }
        }

        if obs.metrics {
            let sink = self.pool.metrics_sink();
            let counter = if op.starts_with("query") {
                metric::OP_QUERY
            } else {
                metric::OP_EXEC
            };
            sink.inc_counter(counter, 1);
            sink.observe_histogram(metric::OP_DURATION_MS, duration.as_secs_f64() * 1000.0);
            if error.is_some() {
                sink.inc_counter(metric::OP_ERRORS, 1);
            }
        }

        if let Some(recorder) = &self.pool.recorder {
            recorder.observe(sql, args, duration, error);
        }
    }

    /// Execute a statement with positional `?` placeholders.
    pub async fn exec(&mut self, ctx: &Context, sql: &str, args: &[Value]) -> Result<ExecOutcome> {
        let started = Instant::now();
        let traced = self.pool.config.observability.tracing;
        let result = match self.conn.as_mut() {
            Some(conn) => {
                let fut = ctx.run(conn.exec(sql, args));
                if traced {
                    fut.instrument(tracing::info_span!("db.exec", sql)).await
                } else {
                    fut.await
                }
            }
            None => Err(DbError::ConnectionClosed),
        };
        self.finish_op("exec", sql, args, started, result.as_ref().err());
        result
    }

    /// Run a query and return a lazy row cursor.
    pub async fn query(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> Result<BoxRowCursor> {
        let started = Instant::now();
        let traced = self.pool.config.observability.tracing;
        let result = match self.conn.as_mut() {
            Some(conn) => {
                let fut = ctx.run(conn.query(sql, args));
                if traced {
                    fut.instrument(tracing::info_span!("db.query", sql)).await
                } else {
                    fut.await
                }
            }
            None => Err(DbError::ConnectionClosed),
        };
        self.finish_op("query", sql, args, started, result.as_ref().err());
        result
    }

    /// Run a query expected to produce at most one row.
    pub async fn query_row(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> Result<Option<Row>> {
        let mut cursor = self.query(ctx, sql, args).await?;
        ctx.run(cursor.next_row()).await
    }

    /// Stream rows through `on_row`, stopping early when the callback fails.
    /// Returns the number of rows delivered.
    pub async fn query_stream<F>(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
        mut on_row: F,
    ) -> Result<u64>
    where
        F: FnMut(&Row) -> Result<()>,
    {
        let mut cursor = self.query(ctx, sql, args).await?;
        let mut delivered = 0u64;
        while let Some(row) = ctx.run(cursor.next_row()).await? {
            on_row(&row)?;
            delivered += 1;
        }
        Ok(delivered)
    }

    /// `exec` through the prepared-statement cache. Degrades to plain `exec`
    /// when caching is disabled.
    pub async fn exec_cached(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> Result<ExecOutcome> {
        if self.cache.is_none() {
            return self.exec(ctx, sql, args).await;
        }
        let started = Instant::now();
        let result = match (&self.cache, self.conn.as_mut()) {
            (Some(cache), Some(conn)) => {
                ctx.run(async {
                    let stmt = cache.get_or_prepare(conn.as_mut(), sql).await?;
                    conn.exec_prepared(stmt, args).await
                })
                .await
            }
            _ => Err(DbError::ConnectionClosed),
        };
        self.finish_op("exec_cached", sql, args, started, result.as_ref().err());
        result
    }

    /// `query` through the prepared-statement cache. Degrades to plain
    /// `query` when caching is disabled.
    pub async fn query_cached(
        &mut self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> Result<BoxRowCursor> {
        if self.cache.is_none() {
            return self.query(ctx, sql, args).await;
        }
        let started = Instant::now();
        let result = match (&self.cache, self.conn.as_mut()) {
            (Some(cache), Some(conn)) => {
                ctx.run(async {
                    let stmt = cache.get_or_prepare(conn.as_mut(), sql).await?;
                    conn.query_prepared(stmt, args).await
                })
                .await
            }
            _ => Err(DbError::ConnectionClosed),
        };
        self.finish_op("query_cached", sql, args, started, result.as_ref().err());
        result
    }

    /// Execute a `:name`-parameterized statement.
    pub async fn named_exec(
        &mut self,
        ctx: &Context,
        sql: &str,
        params: &NamedParams,
    ) -> Result<ExecOutcome> {
        let (bound, args) = builder::bind_named(sql, params)?;
        self.exec(ctx, &bound, &args).await
    }

    /// Execute a `:name`-parameterized statement once per parameter set.
    /// Affected-row counts accumulate; the last insert id is the final one.
    pub async fn named_exec_each(
        &mut self,
        ctx: &Context,
        sql: &str,
        params: &[NamedParams],
    ) -> Result<ExecOutcome> {
        if params.is_empty() {
            return Err(DbError::Builder("named exec over an empty slice".into()));
        }
        let mut total = ExecOutcome::default();
        for set in params {
            let outcome = self.named_exec(ctx, sql, set).await?;
            total.rows_affected += outcome.rows_affected;
            total.last_insert_id = outcome.last_insert_id;
        }
        Ok(total)
    }

    /// Query with `:name` placeholders.
    pub async fn named_query(
        &mut self,
        ctx: &Context,
        sql: &str,
        params: &NamedParams,
    ) -> Result<BoxRowCursor> {
        let (bound, args) = builder::bind_named(sql, params)?;
        self.query(ctx, &bound, &args).await
    }

    /// Insert `rows` in one multi-row statement.
    pub async fn bulk_insert(
        &mut self,
        ctx: &Context,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Value>],
    ) -> Result<ExecOutcome> {
        let (sql, args) = builder::build_bulk_insert(table, columns, rows)?;
        self.exec(ctx, &sql, &args).await
    }

    /// Bulk insert upgrading to `ON DUPLICATE KEY UPDATE` for
    /// `update_columns`. Empty `update_columns` behaves like `bulk_insert`.
    pub async fn insert_on_duplicate(
        &mut self,
        ctx: &Context,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Value>],
        update_columns: &[&str],
    ) -> Result<ExecOutcome> {
        let (sql, args) =
            builder::build_insert_on_duplicate(table, columns, rows, update_columns)?;
        self.exec(ctx, &sql, &args).await
    }

    pub async fn ping(&mut self, ctx: &Context) -> Result<()> {
        let conn = self.conn_mut()?;
        ctx.run(conn.ping()).await
    }

    pub(crate) async fn raw_begin(&mut self, ctx: &Context) -> Result<()> {
        let started = Instant::now();
        let conn = self.conn_mut()?;
        ctx.run(conn.begin()).await?;
        self.tx_open = true;
        tracing::debug!(
            target: "rusty_mysql::tx",
            connection_id = self.id,
            duration_ms = started.elapsed().as_millis() as u64,
            "begin"
        );
        Ok(())
    }

    pub(crate) async fn raw_commit(&mut self, ctx: &Context) -> Result<()> {
        let started = Instant::now();
        let conn = self.conn_mut()?;
        let result = ctx.run(conn.commit()).await;
        if result.is_ok() {
            self.tx_open = false;
        }
        tracing::debug!(
            target: "rusty_mysql::tx",
            connection_id = self.id,
            duration_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "commit"
        );
        result
    }

    pub(crate) async fn raw_rollback(&mut self, ctx: &Context) -> Result<()> {
        let started = Instant::now();
        let conn = self.conn_mut()?;
        let result = ctx.run(conn.rollback()).await;
        if result.is_ok() {
            self.tx_open = false;
        }
        tracing::debug!(
            target: "rusty_mysql::tx",
            connection_id = self.id,
            duration_ms = started.elapsed().as_millis() as u64,
            ok = result.is_ok(),
            "rollback"
        );
        result
    }

    /// Close the statement cache and hand the connection back to the pool.
    /// Releasing an already-released borrow is a no-op.
    pub async fn release(&mut self) -> Result<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        if let Some(cache) = self.cache.take() {
            cache.close_all(conn.as_mut()).await;
        }
        self.pool
            .restore(self.id, conn, self.created_at, self.acquired_at, self.tx_open)
            .await;
        Ok(())
    }
}

impl Drop for PooledConn {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        let pool = self.pool.clone();
        let cache = self.cache.take();
        let (id, created_at, acquired_at, dirty) =
            (self.id, self.created_at, self.acquired_at, self.tx_open);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Some(cache) = cache {
                        cache.close_all(conn.as_mut()).await;
                    }
                    pool.restore(id, conn, created_at, acquired_at, dirty).await;
                });
            }
            Err(_) => {
                tracing::warn!(
                    connection_id = id,
                    "borrow dropped outside the runtime; discarding connection"
                );
                pool.forget(id);
            }
        }
    }
}
