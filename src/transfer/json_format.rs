// # JSON Export / Import
//
// Single-table shape: `{table, schema, records}` with one object per row.
// Multi-table shape: `{database, tables: {name: {schema, records}}}`.
// Import reverses the export; unknown record fields are ignored.

use serde_json::{json, Map, Value as Json};

use super::{introspect, scan_table, Exporter, ImportOptions, Importer};
use crate::context::Context;
use crate::driver::Value;
use crate::error::{DbError, Result};

impl Exporter {
    /// Export one table as `{table, schema, records}`.
    pub async fn export_json(&self, ctx: &Context, table: &str) -> Result<Json> {
        let columns = introspect(self.pool(), ctx, table).await?;
        let mut records: Vec<Json> = Vec::new();
        scan_table(self.pool(), ctx, table, &columns, |values| {
            let mut record = Map::new();
            for (column, value) in columns.iter().zip(values) {
                record.insert(column.name.clone(), value.to_json());
            }
            records.push(Json::Object(record));
            Ok(())
        })
        .await?;

        Ok(json!({
            "table": table,
            "schema": columns,
            "records": records,
        }))
    }

    /// Export several tables as `{database, tables: {name: ...}}`.
    pub async fn export_database_json(&self, ctx: &Context, tables: &[&str]) -> Result<Json> {
        let mut exported = Map::new();
        for table in tables {
            let dump = self.export_json(ctx, table).await?;
            let mut entry = Map::new();
            entry.insert("schema".to_string(), dump["schema"].clone());
            entry.insert("records".to_string(), dump["records"].clone());
            exported.insert(table.to_string(), Json::Object(entry));
        }
        Ok(json!({
            "database": self.pool().config().endpoint.database,
            "tables": exported,
        }))
    }

    /// Serialize `export_json` straight into a writer.
    pub async fn export_json_to<W: std::io::Write>(
        &self,
        ctx: &Context,
        table: &str,
        writer: W,
    ) -> Result<()> {
        let dump = self.export_json(ctx, table).await?;
        serde_json::to_writer_pretty(writer, &dump)?;
        Ok(())
    }
}

fn column_names_from(dump: &Json) -> Result<Vec<String>> {
    if let Some(schema) = dump.get("schema").and_then(Json::as_array) {
        let names: Vec<String> = schema
            .iter()
            .filter_map(|c| c.get("name").and_then(Json::as_str))
            .map(str::to_string)
            .collect();
        if !names.is_empty() {
            return Ok(names);
        }
    }
    // No schema: fall back to the first record's keys.
    dump.get("records")
        .and_then(Json::as_array)
        .and_then(|records| records.first())
        .and_then(Json::as_object)
        .map(|record| record.keys().cloned().collect())
        .ok_or_else(|| DbError::Builder("JSON dump carries neither schema nor records".into()))
}

fn column_types_from(dump: &Json, names: &[String]) -> Vec<(String, String)> {
    let schema = dump.get("schema").and_then(Json::as_array);
    names
        .iter()
        .map(|name| {
            let sql_type = schema
                .and_then(|columns| {
                    columns.iter().find(|c| {
                        c.get("name").and_then(Json::as_str) == Some(name.as_str())
                    })
                })
                .and_then(|c| c.get("column_type").and_then(Json::as_str))
                .unwrap_or("VARCHAR(255)");
            (name.clone(), sql_type.to_string())
        })
        .collect()
}

impl Importer {
    /// Import a single-table dump produced by `export_json`. Returns the
    /// number of rows inserted.
    pub async fn import_json(
        &self,
        ctx: &Context,
        dump: &Json,
        options: &ImportOptions,
    ) -> Result<u64> {
        if dump.get("tables").is_some() {
            return self.import_database_json(ctx, dump, options).await;
        }
        self.import_single_table(ctx, dump, options).await
    }

    async fn import_single_table(
        &self,
        ctx: &Context,
        dump: &Json,
        options: &ImportOptions,
    ) -> Result<u64> {
        let table = options
            .table
            .clone()
            .or_else(|| {
                dump.get("table")
                    .and_then(Json::as_str)
                    .map(str::to_string)
            })
            .ok_or_else(|| DbError::Builder("JSON dump names no table".into()))?;

        let columns = column_names_from(dump)?;
        self.ensure_table(ctx, &table, &column_types_from(dump, &columns))
            .await?;
        if options.truncate_first {
            self.clear_table(ctx, &table).await?;
        }

        let records = dump
            .get("records")
            .and_then(Json::as_array)
            .cloned()
            .unwrap_or_default();
        let rows: Vec<Vec<Value>> = records
            .iter()
            .filter_map(Json::as_object)
            .map(|record| {
                columns
                    .iter()
                    .map(|c| {
                        record
                            .get(c)
                            .map(Value::from_json)
                            .unwrap_or(Value::Null)
                    })
                    .collect()
            })
            .collect();

        let column_refs: Vec<&str> = columns.iter().map(|c| c.as_str()).collect();
        self.insert_batches(ctx, &table, &column_refs, &rows).await
    }

    /// Import a multi-table dump. With `ignore_errors`, a failing table is
    /// logged and skipped.
    pub async fn import_database_json(
        &self,
        ctx: &Context,
        dump: &Json,
        options: &ImportOptions,
    ) -> Result<u64> {
        let tables = dump
            .get("tables")
            .and_then(Json::as_object)
            .ok_or_else(|| DbError::Builder("JSON dump has no tables object".into()))?;

        let mut inserted = 0u64;
        for (name, entry) in tables {
            let per_table = ImportOptions {
                table: Some(name.clone()),
                truncate_first: options.truncate_first,
                ignore_errors: options.ignore_errors,
            };
            match self.import_single_table(ctx, entry, &per_table).await {
                Ok(count) => inserted += count,
                Err(e) if options.ignore_errors => {
                    tracing::warn!(table = name.as_str(), error = %e, "skipping table on import");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(inserted)
    }
}
