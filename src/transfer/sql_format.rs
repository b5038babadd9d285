// # SQL Export
//
// Emits a `CREATE TABLE` mirroring the introspected schema (types, NOT
// NULL, defaults, primary key) followed by one multi-value `INSERT` with
// literal values. Multi-table dumps separate tables with a blank line.

use std::io::Write;

use super::{introspect, scan_table, Exporter, IntrospectedColumn};
use crate::context::Context;
use crate::driver::Value;
use crate::error::{DbError, Result};

fn render_create_table(table: &str, columns: &[IntrospectedColumn]) -> String {
    let mut parts: Vec<String> = Vec::with_capacity(columns.len() + 1);
    for column in columns {
        let mut definition = format!("  {} {}", column.name, column.column_type);
        if !column.nullable {
            definition.push_str(" NOT NULL");
        }
        if let Some(default) = &column.default {
            definition.push_str(&format!(" DEFAULT '{}'", default.replace('\'', "''")));
        }
        parts.push(definition);
    }
    let primary: Vec<&str> = columns
        .iter()
        .filter(|c| c.key == "PRI")
        .map(|c| c.name.as_str())
        .collect();
    if !primary.is_empty() {
        parts.push(format!("  PRIMARY KEY ({})", primary.join(", ")));
    }
    format!("CREATE TABLE {table} (\n{}\n);", parts.join(",\n"))
}

impl Exporter {
    /// Export one table as SQL statements. Returns the number of rows in
    /// the INSERT.
    pub async fn export_sql<W: Write>(
        &self,
        ctx: &Context,
        table: &str,
        mut writer: W,
    ) -> Result<u64> {
        let columns = introspect(self.pool(), ctx, table).await?;
        writeln!(writer, "{}", render_create_table(table, &columns)).map_err(DbError::Io)?;

        let mut tuples: Vec<String> = Vec::new();
        scan_table(self.pool(), ctx, table, &columns, |values| {
            let literals: Vec<String> = values.iter().map(Value::to_sql_literal).collect();
            tuples.push(format!("({})", literals.join(", ")));
            Ok(())
        })
        .await?;

        if !tuples.is_empty() {
            let column_list: Vec<&str> = columns.iter().map(|c| c.name.as_str()).collect();
            writeln!(
                writer,
                "INSERT INTO {table} ({}) VALUES\n{};",
                column_list.join(", "),
                tuples.join(",\n")
            )
            .map_err(DbError::Io)?;
        }
        Ok(tuples.len() as u64)
    }

    /// Export several tables, blank-line separated.
    pub async fn export_database_sql<W: Write>(
        &self,
        ctx: &Context,
        tables: &[&str],
        mut writer: W,
    ) -> Result<u64> {
        let mut total = 0u64;
        for (index, table) in tables.iter().enumerate() {
            if index > 0 {
                writeln!(writer).map_err(DbError::Io)?;
            }
            total += self.export_sql(ctx, table, &mut writer).await?;
        }
        Ok(total)
    }
}
