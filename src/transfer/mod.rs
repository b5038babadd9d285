// # Table Import / Export
//
// Converts between table rows and SQL / CSV / JSON representations. Exports
// introspect the live schema through `information_schema` and stream rows;
// imports batch multi-value inserts and can truncate the destination first
// (falling back to `DELETE FROM` where `TRUNCATE` is not permitted).
// SQL import is reserved and reports `NotImplemented`.

mod csv_format;
mod json_format;
mod sql_format;

use serde::{Deserialize, Serialize};

use crate::context::Context;
use crate::driver::Value;
use crate::error::{DbError, Result};
use crate::pool::ConnectionPool;

/// Rows per multi-value INSERT on the import path, bounded well below the
/// driver parameter limit.
pub const IMPORT_BATCH_ROWS: usize = 1000;

/// Default destination for CSV imports without an explicit table name.
pub const DEFAULT_IMPORT_TABLE: &str = "imported_table";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntrospectedColumn {
    pub name: String,
    pub column_type: String,
    pub nullable: bool,
    pub key: String,
    pub default: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Destination table; CSV imports default to `imported_table`.
    pub table: Option<String>,

    /// Empty the destination before loading.
    pub truncate_first: bool,

    /// On multi-table imports, log per-table failures and continue.
    pub ignore_errors: bool,
}

pub struct Exporter {
    pool: ConnectionPool,
}

pub struct Importer {
    pool: ConnectionPool,
}

impl ConnectionPool {
    pub fn exporter(&self) -> Exporter {
        Exporter {
            pool: self.clone(),
        }
    }

    pub fn importer(&self) -> Importer {
        Importer {
            pool: self.clone(),
        }
    }
}

/// Read a table's column layout from `information_schema`.
pub(crate) async fn introspect(
    pool: &ConnectionPool,
    ctx: &Context,
    table: &str,
) -> Result<Vec<IntrospectedColumn>> {
    let mut conn = pool.acquire(ctx).await?;
    let mut columns = Vec::new();
    let result = conn
        .query_stream(
            ctx,
            "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE, COLUMN_KEY, COLUMN_DEFAULT \
             FROM information_schema.columns \
             WHERE table_schema = ? AND table_name = ? ORDER BY ORDINAL_POSITION",
            &[
                Value::Text(pool.config().endpoint.database.clone()),
                Value::Text(table.to_string()),
            ],
            |row| {
                columns.push(IntrospectedColumn {
                    name: row.get(0).and_then(Value::as_str).unwrap_or_default().to_string(),
                    column_type: row
                        .get(1)
                        .and_then(Value::as_str)
                        .unwrap_or("TEXT")
                        .to_string(),
                    nullable: row.get(2).and_then(Value::as_str) == Some("YES"),
                    key: row.get(3).and_then(Value::as_str).unwrap_or_default().to_string(),
                    default: row.get(4).and_then(|v| match v {
                        Value::Null => None,
                        other => Some(other.to_text()),
                    }),
                });
                Ok(())
            },
        )
        .await;
    if let Err(e) = conn.release().await {
        tracing::warn!(error = %e, "release after introspection failed");
    }
    result?;
    if columns.is_empty() {
        return Err(DbError::Configuration(format!(
            "table {table:?} is not known to information_schema"
        )));
    }
    Ok(columns)
}

/// Stream every row of `table` in introspected column order.
pub(crate) async fn scan_table<F>(
    pool: &ConnectionPool,
    ctx: &Context,
    table: &str,
    columns: &[IntrospectedColumn],
    mut on_row: F,
) -> Result<u64>
where
    F: FnMut(&[Value]) -> Result<()>,
{
    let column_list: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
    let sql = format!("SELECT {} FROM {table}", column_list.join(", "));
    let mut conn = pool.acquire(ctx).await?;
    let result = conn
        .query_stream(ctx, &sql, &[], |row| on_row(row.values()))
        .await;
    if let Err(e) = conn.release().await {
        tracing::warn!(error = %e, "release after table scan failed");
    }
    result
}

impl Importer {
    /// Empty the destination, preferring `TRUNCATE` and falling back to
    /// `DELETE FROM`.
    pub(crate) async fn clear_table(&self, ctx: &Context, table: &str) -> Result<()> {
        let mut conn = self.pool.acquire(ctx).await?;
        let truncated = conn.exec(ctx, &format!("TRUNCATE TABLE {table}"), &[]).await;
        let result = match truncated {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::warn!(table, error = %e, "TRUNCATE failed, falling back to DELETE");
                conn.exec(ctx, &format!("DELETE FROM {table}"), &[])
                    .await
                    .map(|_| ())
            }
        };
        if let Err(e) = conn.release().await {
            tracing::warn!(error = %e, "release after truncate failed");
        }
        result
    }

    /// Insert rows in batches of `IMPORT_BATCH_ROWS`.
    pub(crate) async fn insert_batches(
        &self,
        ctx: &Context,
        table: &str,
        columns: &[&str],
        rows: &[Vec<Value>],
    ) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut conn = self.pool.acquire(ctx).await?;
        let mut inserted = 0u64;
        let mut result = Ok(());
        for batch in rows.chunks(IMPORT_BATCH_ROWS) {
            match conn.bulk_insert(ctx, table, columns, batch).await {
                Ok(outcome) => inserted += outcome.rows_affected,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        if let Err(e) = conn.release().await {
            tracing::warn!(error = %e, "release after import failed");
        }
        result.map(|_| inserted)
    }

    pub(crate) async fn ensure_table(
        &self,
        ctx: &Context,
        table: &str,
        columns: &[(String, String)],
    ) -> Result<()> {
        let definitions: Vec<String> = columns
            .iter()
            .map(|(name, sql_type)| format!("{name} {sql_type}"))
            .collect();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table} ({})",
            definitions.join(", ")
        );
        let mut conn = self.pool.acquire(ctx).await?;
        let result = conn.exec(ctx, &sql, &[]).await.map(|_| ());
        if let Err(e) = conn.release().await {
            tracing::warn!(error = %e, "release after create table failed");
        }
        result
    }

    /// Reserved. The SQL dump format needs a real statement parser, which
    /// this crate deliberately does not carry.
    pub async fn import_sql<R: std::io::Read>(
        &self,
        _ctx: &Context,
        _reader: R,
        _options: &ImportOptions,
    ) -> Result<u64> {
        Err(DbError::NotImplemented("SQL import".into()))
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

impl Exporter {
    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::DbConfig;
    use crate::driver::mock::{MockDriver, MockHandle};

    pub(super) async fn transfer_setup() -> (ConnectionPool, MockHandle) {
        let driver = Arc::new(MockDriver::new());
        let handle = driver.handle();
        let mut config = DbConfig::for_driver("mock");
        config.endpoint.database = "shop".into();
        let pool = ConnectionPool::connect_with_driver(config, driver)
            .await
            .unwrap();
        (pool, handle)
    }

    pub(super) fn script_schema(handle: &MockHandle, rows: Vec<Vec<Value>>) {
        handle.script_rows(
            "FROM information_schema.columns",
            &[
                "COLUMN_NAME",
                "COLUMN_TYPE",
                "IS_NULLABLE",
                "COLUMN_KEY",
                "COLUMN_DEFAULT",
            ],
            rows,
        );
    }

    pub(super) fn schema_row(name: &str, ty: &str, nullable: bool, key: &str) -> Vec<Value> {
        vec![
            Value::Text(name.into()),
            Value::Text(ty.into()),
            Value::Text(if nullable { "YES" } else { "NO" }.into()),
            Value::Text(key.into()),
            Value::Null,
        ]
    }

    #[tokio::test]
    async fn test_introspection_maps_columns() {
        let (pool, handle) = transfer_setup().await;
        script_schema(
            &handle,
            vec![
                schema_row("id", "int", false, "PRI"),
                schema_row("name", "varchar(255)", true, ""),
            ],
        );

        let columns = introspect(&pool, &Context::background(), "products")
            .await
            .unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].name, "id");
        assert!(!columns[0].nullable);
        assert_eq!(columns[0].key, "PRI");
        assert!(columns[1].nullable);
    }

    #[tokio::test]
    async fn test_introspection_unknown_table() {
        let (pool, _) = transfer_setup().await;
        let result = introspect(&pool, &Context::background(), "missing").await;
        assert!(matches!(result, Err(DbError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_truncate_falls_back_to_delete() {
        let (pool, handle) = transfer_setup().await;
        handle.script_error("TRUNCATE TABLE products", 1142, "DROP command denied", 1);

        pool.importer()
            .clear_table(&Context::background(), "products")
            .await
            .unwrap();
        assert_eq!(handle.committed_matching("DELETE FROM products"), 1);
    }

    #[tokio::test]
    async fn test_import_batching() {
        let (pool, handle) = transfer_setup().await;
        let rows: Vec<Vec<Value>> = (0..2500i64).map(|i| vec![Value::Int(i)]).collect();

        let inserted = pool
            .importer()
            .insert_batches(&Context::background(), "numbers", &["n"], &rows)
            .await
            .unwrap();
        assert_eq!(inserted, 2500);
        assert_eq!(handle.statements_matching("INSERT INTO numbers"), 3);
    }

    #[tokio::test]
    async fn test_sql_import_reserved() {
        let (pool, _) = transfer_setup().await;
        let result = pool
            .importer()
            .import_sql(
                &Context::background(),
                "INSERT INTO t VALUES (1);".as_bytes(),
                &ImportOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(DbError::NotImplemented(_))));
    }
}
