// # CSV Export / Import
//
// RFC-4180 via the `csv` crate. Export writes a header row plus one row per
// record, with NULL as an empty field; import reads the header as the column
// list, types every column VARCHAR(255), and turns empty fields back into
// NULL.

use csv::{ReaderBuilder, WriterBuilder};

use super::{introspect, scan_table, Exporter, ImportOptions, Importer, DEFAULT_IMPORT_TABLE};
use crate::context::Context;
use crate::driver::Value;
use crate::error::{DbError, Result};

impl Exporter {
    /// Export `table` to CSV. Returns the number of data rows written.
    pub async fn export_csv<W: std::io::Write>(
        &self,
        ctx: &Context,
        table: &str,
        writer: W,
    ) -> Result<u64> {
        let columns = introspect(self.pool(), ctx, table).await?;
        let mut csv = WriterBuilder::new().from_writer(writer);
        csv.write_record(columns.iter().map(|c| c.name.as_str()))
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        let mut rows = 0u64;
        scan_table(self.pool(), ctx, table, &columns, |values| {
            let record: Vec<String> = values.iter().map(Value::to_text).collect();
            csv.write_record(&record)
                .map_err(|e| DbError::Serialization(e.to_string()))?;
            rows += 1;
            Ok(())
        })
        .await?;

        csv.flush().map_err(DbError::Io)?;
        Ok(rows)
    }
}

impl Importer {
    /// Import CSV into `options.table` (default `imported_table`), creating
    /// the destination with all-VARCHAR(255) columns when missing. Returns
    /// the number of rows inserted.
    pub async fn import_csv<R: std::io::Read>(
        &self,
        ctx: &Context,
        reader: R,
        options: &ImportOptions,
    ) -> Result<u64> {
        let table = options
            .table
            .clone()
            .unwrap_or_else(|| DEFAULT_IMPORT_TABLE.to_string());

        let mut csv = ReaderBuilder::new().has_headers(true).from_reader(reader);
        let headers = csv
            .headers()
            .map_err(|e| DbError::Serialization(e.to_string()))?
            .clone();
        if headers.is_empty() {
            return Err(DbError::Builder("CSV input has no header row".into()));
        }
        let columns: Vec<String> = headers.iter().map(|h| h.trim().to_string()).collect();

        let mut rows: Vec<Vec<Value>> = Vec::new();
        for record in csv.records() {
            let record = record.map_err(|e| DbError::Serialization(e.to_string()))?;
            let row: Vec<Value> = (0..columns.len())
                .map(|i| match record.get(i) {
                    None | Some("") => Value::Null,
                    Some(field) => Value::Text(field.to_string()),
                })
                .collect();
            rows.push(row);
        }

        let definitions: Vec<(String, String)> = columns
            .iter()
            .map(|c| (c.clone(), "VARCHAR(255)".to_string()))
            .collect();
        self.ensure_table(ctx, &table, &definitions).await?;

        if options.truncate_first {
            self.clear_table(ctx, &table).await?;
        }

        let column_refs: Vec<&str> = columns.iter().map(|c| c.as_str()).collect();
        self.insert_batches(ctx, &table, &column_refs, &rows).await
    }
}
