// # Table Binder
//
// CRUD over a record type through its derived schema. Every statement is
// parameterized; column order always follows the record's declared order so
// scan targets line up without name lookups.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use super::{TableRecord, TableSchema};
use crate::builder;
use crate::context::Context;
use crate::driver::{ExecOutcome, Row, Value};
use crate::error::{DbError, Result};
use crate::pool::ConnectionPool;

/// Column-to-value assignments for `update_in` / `update_by`. Ordered so the
/// generated SQL is deterministic.
pub type ColumnUpdates = BTreeMap<String, Value>;

pub struct TableBinder<T: TableRecord> {
    pool: ConnectionPool,
    schema: Arc<TableSchema>,
    _record: PhantomData<fn() -> T>,
}

impl<T: TableRecord> TableBinder<T> {
    pub fn new(pool: &ConnectionPool) -> Result<Self> {
        Ok(Self {
            pool: pool.clone(),
            schema: TableSchema::derive::<T>()?,
            _record: PhantomData,
        })
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    async fn exec_sql(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<ExecOutcome> {
        let mut conn = self.pool.acquire(ctx).await?;
        let result = conn.exec(ctx, sql, args).await;
        if let Err(e) = conn.release().await {
            tracing::warn!(error = %e, "release after binder exec failed");
        }
        result
    }

    async fn query_row_sql(&self, ctx: &Context, sql: &str, args: &[Value]) -> Result<Option<Row>> {
        let mut conn = self.pool.acquire(ctx).await?;
        let result = conn.query_row(ctx, sql, args).await;
        if let Err(e) = conn.release().await {
            tracing::warn!(error = %e, "release after binder query failed");
        }
        result
    }

    async fn collect_rows(
        &self,
        ctx: &Context,
        sql: &str,
        args: &[Value],
    ) -> Result<Vec<Vec<Value>>> {
        let mut conn = self.pool.acquire(ctx).await?;
        let mut collected = Vec::new();
        let result = conn
            .query_stream(ctx, sql, args, |row| {
                collected.push(row.values().to_vec());
                Ok(())
            })
            .await;
        if let Err(e) = conn.release().await {
            tracing::warn!(error = %e, "release after binder query failed");
        }
        result.map(|_| collected)
    }

    /// Create the backing table from the derived schema.
    pub async fn create_table(&self, ctx: &Context) -> Result<()> {
        self.exec_sql(ctx, &self.schema.create_table_sql(), &[])
            .await
            .map(|_| ())
    }

    fn insert_columns(&self) -> (Vec<&str>, Vec<usize>) {
        let columns = self.schema.non_auto_columns();
        (
            columns.iter().map(|c| c.name.as_str()).collect(),
            columns.iter().map(|c| c.field_index).collect(),
        )
    }

    fn values_at(record: &T, indexes: &[usize]) -> Result<Vec<Value>> {
        let all = record.field_values();
        indexes
            .iter()
            .map(|&i| {
                all.get(i).cloned().ok_or_else(|| {
                    DbError::Configuration(format!(
                        "record produced {} values but the schema expects index {i}",
                        all.len()
                    ))
                })
            })
            .collect()
    }

    /// Insert one record, skipping auto-increment columns, and write the
    /// generated id back into the record.
    pub async fn add(&self, ctx: &Context, record: &mut T) -> Result<ExecOutcome> {
        let (columns, indexes) = self.insert_columns();
        let values = Self::values_at(record, &indexes)?;
        let (sql, args) = builder::build_bulk_insert(&self.schema.table, &columns, &[values])?;
        let outcome = self.exec_sql(ctx, &sql, &args).await?;
        if self.schema.auto_increment_column().is_some() && outcome.last_insert_id > 0 {
            record.set_generated_id(outcome.last_insert_id);
        }
        Ok(outcome)
    }

    /// Insert many records in one multi-row statement.
    pub async fn add_many(&self, ctx: &Context, records: &[T]) -> Result<ExecOutcome> {
        let (columns, indexes) = self.insert_columns();
        let rows: Result<Vec<Vec<Value>>> = records
            .iter()
            .map(|r| Self::values_at(r, &indexes))
            .collect();
        let (sql, args) = builder::build_bulk_insert(&self.schema.table, &columns, &rows?)?;
        self.exec_sql(ctx, &sql, &args).await
    }

    /// Delete by primary key. Returns the affected-row count.
    pub async fn delete(&self, ctx: &Context, id: impl Into<Value>) -> Result<u64> {
        let pk = self.schema.primary_key_column()?;
        let sql = format!("DELETE FROM {} WHERE {} = ?", self.schema.table, pk.name);
        let outcome = self.exec_sql(ctx, &sql, &[id.into()]).await?;
        Ok(outcome.rows_affected)
    }

    /// Delete every row whose primary key appears in `ids`.
    pub async fn delete_in(&self, ctx: &Context, ids: &[Value]) -> Result<u64> {
        let pk = self.schema.primary_key_column()?;
        let template = format!("DELETE FROM {} WHERE {} IN (?)", self.schema.table, pk.name);
        let (sql, args) = builder::expand_in(&template, ids, &[])?;
        let outcome = self.exec_sql(ctx, &sql, &args).await?;
        Ok(outcome.rows_affected)
    }

    /// Delete by an arbitrary WHERE clause.
    pub async fn delete_by(&self, ctx: &Context, clause: &str, args: &[Value]) -> Result<u64> {
        if clause.trim().is_empty() {
            return Err(DbError::Builder("delete_by requires a WHERE clause".into()));
        }
        let sql = format!("DELETE FROM {} WHERE {clause}", self.schema.table);
        let outcome = self.exec_sql(ctx, &sql, args).await?;
        Ok(outcome.rows_affected)
    }

    /// Update all non-primary-key columns of `record`, keyed by its primary
    /// key.
    pub async fn update(&self, ctx: &Context, record: &T) -> Result<u64> {
        let pk = self.schema.primary_key_column()?;
        let all = record.field_values();
        let mut assignments = Vec::new();
        let mut args = Vec::new();
        for column in &self.schema.columns {
            if column.primary_key {
                continue;
            }
            assignments.push(format!("{} = ?", column.name));
            args.push(all.get(column.field_index).cloned().unwrap_or(Value::Null));
        }
        if assignments.is_empty() {
            return Err(DbError::Builder("record has no updatable columns".into()));
        }
        args.push(all.get(pk.field_index).cloned().unwrap_or(Value::Null));
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = ?",
            self.schema.table,
            assignments.join(", "),
            pk.name
        );
        let outcome = self.exec_sql(ctx, &sql, &args).await?;
        Ok(outcome.rows_affected)
    }

    /// Apply `changes` to every row whose primary key appears in `ids`.
    pub async fn update_in(
        &self,
        ctx: &Context,
        ids: &[Value],
        changes: &ColumnUpdates,
    ) -> Result<u64> {
        if changes.is_empty() {
            return Err(DbError::Builder("update_in with no column changes".into()));
        }
        let pk = self.schema.primary_key_column()?;
        let assignments: Vec<String> = changes.keys().map(|c| format!("{c} = ?")).collect();
        let template = format!(
            "UPDATE {} SET {} WHERE {} IN (?)",
            self.schema.table,
            assignments.join(", "),
            pk.name
        );
        // Assignment arguments precede the expanded id list.
        let (sql, id_args) = builder::expand_in(&template, ids, &[])?;
        let mut args: Vec<Value> = changes.values().cloned().collect();
        args.extend(id_args);
        let outcome = self.exec_sql(ctx, &sql, &args).await?;
        Ok(outcome.rows_affected)
    }

    /// Apply `changes` to every row matching `clause`.
    pub async fn update_by(
        &self,
        ctx: &Context,
        clause: &str,
        changes: &ColumnUpdates,
        args: &[Value],
    ) -> Result<u64> {
        if changes.is_empty() {
            return Err(DbError::Builder("update_by with no column changes".into()));
        }
        if clause.trim().is_empty() {
            return Err(DbError::Builder("update_by requires a WHERE clause".into()));
        }
        let assignments: Vec<String> = changes.keys().map(|c| format!("{c} = ?")).collect();
        let sql = format!(
            "UPDATE {} SET {} WHERE {clause}",
            self.schema.table,
            assignments.join(", ")
        );
        let mut bound: Vec<Value> = changes.values().cloned().collect();
        bound.extend_from_slice(args);
        let outcome = self.exec_sql(ctx, &sql, &bound).await?;
        Ok(outcome.rows_affected)
    }

    fn select_prefix(&self) -> String {
        format!(
            "SELECT {} FROM {}",
            self.schema.column_names().join(", "),
            self.schema.table
        )
    }

    fn hydrate(&self, values: &[Value]) -> Result<T>
    where
        T: Default,
    {
        let mut record = T::default();
        record.load_values(values)?;
        Ok(record)
    }

    /// Fetch one record by primary key.
    pub async fn get(&self, ctx: &Context, id: impl Into<Value>) -> Result<Option<T>>
    where
        T: Default,
    {
        let pk = self.schema.primary_key_column()?;
        let sql = format!("{} WHERE {} = ? LIMIT 1", self.select_prefix(), pk.name);
        let row = self.query_row_sql(ctx, &sql, &[id.into()]).await?;
        row.map(|r| self.hydrate(r.values())).transpose()
    }

    /// Fetch the first record matching `clause`.
    pub async fn get_by(&self, ctx: &Context, clause: &str, args: &[Value]) -> Result<Option<T>>
    where
        T: Default,
    {
        let sql = if clause.trim().is_empty() {
            format!("{} LIMIT 1", self.select_prefix())
        } else {
            format!("{} WHERE {clause} LIMIT 1", self.select_prefix())
        };
        let row = self.query_row_sql(ctx, &sql, args).await?;
        row.map(|r| self.hydrate(r.values())).transpose()
    }

    /// Fetch every record whose primary key appears in `ids`.
    pub async fn get_in(&self, ctx: &Context, ids: &[Value]) -> Result<Vec<T>>
    where
        T: Default,
    {
        let pk = self.schema.primary_key_column()?;
        let template = format!("{} WHERE {} IN (?)", self.select_prefix(), pk.name);
        let (sql, args) = builder::expand_in(&template, ids, &[])?;
        let rows = self.collect_rows(ctx, &sql, &args).await?;
        rows.iter().map(|values| self.hydrate(values)).collect()
    }

    /// Fetch one page. `page` and `size` are 1-based and must be positive;
    /// the offset is `(page - 1) * size`.
    pub async fn get_page(
        &self,
        ctx: &Context,
        page: u64,
        size: u64,
        clause: &str,
        args: &[Value],
    ) -> Result<Vec<T>>
    where
        T: Default,
    {
        if page == 0 {
            return Err(DbError::Builder("page must be >= 1".into()));
        }
        if size == 0 {
            return Err(DbError::Builder("page size must be >= 1".into()));
        }
        let offset = (page - 1) * size;
        let mut sql = self.select_prefix();
        if !clause.trim().is_empty() {
            sql.push_str(&format!(" WHERE {clause}"));
        }
        sql.push_str(" LIMIT ? OFFSET ?");
        let mut bound = args.to_vec();
        bound.push(Value::UInt(size));
        bound.push(Value::UInt(offset));
        let rows = self.collect_rows(ctx, &sql, &bound).await?;
        rows.iter().map(|values| self.hydrate(values)).collect()
    }

    /// Fetch every record matching `clause` (or the whole table).
    pub async fn get_all(&self, ctx: &Context, clause: &str, args: &[Value]) -> Result<Vec<T>>
    where
        T: Default,
    {
        let sql = if clause.trim().is_empty() {
            self.select_prefix()
        } else {
            format!("{} WHERE {clause}", self.select_prefix())
        };
        let rows = self.collect_rows(ctx, &sql, args).await?;
        rows.iter().map(|values| self.hydrate(values)).collect()
    }
}

impl ConnectionPool {
    /// Bind a record type to its table over this pool.
    pub fn binder<T: TableRecord>(&self) -> Result<TableBinder<T>> {
        TableBinder::new(self)
    }
}
