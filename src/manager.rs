// # Schema Administration
//
// Convenience DDL over the pool. These helpers follow the library's
// permissive admin semantics: instead of `Result`, they return an
// `AdminOutcome` status record that callers are free to ignore. Failures
// are logged and still traverse the observability path of the underlying
// connection operation.

use crate::context::Context;
use crate::driver::Value;
use crate::error::DbError;
use crate::pool::ConnectionPool;
use crate::schema::{TableRecord, TableSchema};

/// Result of an admin operation. Not `#[must_use]`; dropping it is the
/// expected way to ignore a failure.
#[derive(Debug)]
pub struct AdminOutcome {
    ok: bool,
    error: Option<DbError>,
}

impl AdminOutcome {
    fn success() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    fn failed(operation: &str, error: DbError) -> Self {
        tracing::warn!(operation, error = %error, "admin operation failed");
        Self {
            ok: false,
            error: Some(error),
        }
    }

    pub fn ok(&self) -> bool {
        self.ok
    }

    pub fn error(&self) -> Option<&DbError> {
        self.error.as_ref()
    }

    /// Upgrade to a `Result` for callers that do want to propagate.
    pub fn into_result(self) -> crate::error::Result<()> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Clone)]
pub struct DbManager {
    pool: ConnectionPool,
}

impl DbManager {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    async fn exec(&self, ctx: &Context, operation: &str, sql: &str) -> AdminOutcome {
        let mut conn = match self.pool.acquire(ctx).await {
            Ok(conn) => conn,
            Err(e) => return AdminOutcome::failed(operation, e),
        };
        let result = conn.exec(ctx, sql, &[]).await;
        if let Err(e) = conn.release().await {
            tracing::warn!(error = %e, "release after admin operation failed");
        }
        match result {
            Ok(_) => AdminOutcome::success(),
            Err(e) => AdminOutcome::failed(operation, e),
        }
    }

    pub async fn ensure_database(&self, ctx: &Context, name: &str) -> AdminOutcome {
        self.exec(
            ctx,
            "ensure_database",
            &format!("CREATE DATABASE IF NOT EXISTS `{name}`"),
        )
        .await
    }

    pub async fn drop_database(&self, ctx: &Context, name: &str) -> AdminOutcome {
        self.exec(
            ctx,
            "drop_database",
            &format!("DROP DATABASE IF EXISTS `{name}`"),
        )
        .await
    }

    /// Create the table backing a record type.
    pub async fn create_table_for<T: TableRecord>(&self, ctx: &Context) -> AdminOutcome {
        let schema = match TableSchema::derive::<T>() {
            Ok(schema) => schema,
            Err(e) => return AdminOutcome::failed("create_table", e),
        };
        self.exec(ctx, "create_table", &schema.create_table_sql())
            .await
    }

    /// Run caller-provided CREATE TABLE DDL.
    pub async fn create_table_sql(&self, ctx: &Context, sql: &str) -> AdminOutcome {
        self.exec(ctx, "create_table", sql).await
    }

    pub async fn drop_table(&self, ctx: &Context, table: &str) -> AdminOutcome {
        self.exec(ctx, "drop_table", &format!("DROP TABLE IF EXISTS {table}"))
            .await
    }

    pub async fn truncate_table(&self, ctx: &Context, table: &str) -> AdminOutcome {
        self.exec(ctx, "truncate_table", &format!("TRUNCATE TABLE {table}"))
            .await
    }

    /// Whether `table` exists in the configured database. Errors read as
    /// "does not exist" after a warning.
    pub async fn table_exists(&self, ctx: &Context, table: &str) -> bool {
        let mut conn = match self.pool.acquire(ctx).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "table_exists acquire failed");
                return false;
            }
        };
        let row = conn
            .query_row(
                ctx,
                "SELECT COUNT(*) FROM information_schema.tables \
                 WHERE table_schema = ? AND table_name = ?",
                &[
                    Value::Text(self.pool.config().endpoint.database.clone()),
                    Value::Text(table.to_string()),
                ],
            )
            .await;
        if let Err(e) = conn.release().await {
            tracing::warn!(error = %e, "release after table_exists failed");
        }
        match row {
            Ok(Some(row)) => row.get(0).and_then(Value::as_i64).unwrap_or(0) > 0,
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "table_exists query failed");
                false
            }
        }
    }

    /// Tables in the configured database. Empty on error, after a warning.
    pub async fn list_tables(&self, ctx: &Context) -> Vec<String> {
        let mut conn = match self.pool.acquire(ctx).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(error = %e, "list_tables acquire failed");
                return Vec::new();
            }
        };
        let mut tables = Vec::new();
        let result = conn
            .query_stream(
                ctx,
                "SELECT table_name FROM information_schema.tables WHERE table_schema = ?",
                &[Value::Text(self.pool.config().endpoint.database.clone())],
                |row| {
                    if let Some(name) = row.get(0).and_then(Value::as_str) {
                        tables.push(name.to_string());
                    }
                    Ok(())
                },
            )
            .await;
        if let Err(e) = conn.release().await {
            tracing::warn!(error = %e, "release after list_tables failed");
        }
        if let Err(e) = result {
            tracing::warn!(error = %e, "list_tables query failed");
            return Vec::new();
        }
        tables
    }
}

impl ConnectionPool {
    pub fn manager(&self) -> DbManager {
        DbManager::new(self.clone())
    }
}
