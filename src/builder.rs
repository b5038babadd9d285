// # Query Builders
//
// Parameterized SQL construction: multi-row inserts, upserts, named-parameter
// binding and IN-list expansion. Every builder validates before the driver is
// touched; failures are `DbError::Builder`.

use std::collections::BTreeMap;

use crate::driver::Value;
use crate::error::{DbError, Result};

/// MySQL caps prepared-statement parameters at u16::MAX.
const MAX_PARAMETERS: usize = 65_535;

/// Build one multi-row `INSERT INTO table (c1, ...) VALUES (?, ...), ...`.
///
/// Fails on an empty row set, a row whose length differs from the column
/// list, or a parameter count beyond the driver limit. Argument order is
/// row-major.
pub fn build_bulk_insert(
    table: &str,
    columns: &[&str],
    rows: &[Vec<Value>],
) -> Result<(String, Vec<Value>)> {
    if table.is_empty() {
        return Err(DbError::Builder("table name is empty".into()));
    }
    if columns.is_empty() {
        return Err(DbError::Builder("column list is empty".into()));
    }
    if rows.is_empty() {
        return Err(DbError::Builder("row set is empty".into()));
    }
    for (index, row) in rows.iter().enumerate() {
        if row.len() != columns.len() {
            return Err(DbError::Builder(format!(
                "row {index} has {} values, expected {}",
                row.len(),
                columns.len()
            )));
        }
    }
    let total = rows.len() * columns.len();
    if total > MAX_PARAMETERS {
        return Err(DbError::Builder(format!(
            "{total} parameters exceed the driver limit of {MAX_PARAMETERS}"
        )));
    }

    let placeholder_row = format!("({})", vec!["?"; columns.len()].join(", "));
    let placeholders = vec![placeholder_row; rows.len()].join(", ");
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES {placeholders}",
        columns.join(", ")
    );
    let args: Vec<Value> = rows.iter().flat_map(|r| r.iter().cloned()).collect();
    Ok((sql, args))
}

/// Bulk insert with ` ON DUPLICATE KEY UPDATE col = VALUES(col), ...`
/// appended. An empty update list degrades to a plain bulk insert.
pub fn build_insert_on_duplicate(
    table: &str,
    columns: &[&str],
    rows: &[Vec<Value>],
    update_columns: &[&str],
) -> Result<(String, Vec<Value>)> {
    let (mut sql, args) = build_bulk_insert(table, columns, rows)?;
    if update_columns.is_empty() {
        return Ok((sql, args));
    }
    let assignments: Vec<String> = update_columns
        .iter()
        .map(|c| format!("{c} = VALUES({c})"))
        .collect();
    sql.push_str(" ON DUPLICATE KEY UPDATE ");
    sql.push_str(&assignments.join(", "));
    Ok((sql, args))
}

/// Named parameters for `:name`-style queries.
#[derive(Debug, Clone, Default)]
pub struct NamedParams {
    values: BTreeMap<String, Value>,
}

impl NamedParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(name.into(), value.into());
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for NamedParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Rewrite `:name` placeholders into positional `?` markers, producing the
/// argument list in placeholder order. Placeholders inside string literals
/// are left alone; a `:name` with no matching parameter fails.
pub fn bind_named(sql: &str, params: &NamedParams) -> Result<(String, Vec<Value>)> {
    let mut out = String::with_capacity(sql.len());
    let mut args = Vec::new();
    let mut chars = sql.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            if c == '\\' {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            } else if c == '\'' {
                in_string = false;
            }
            continue;
        }
        match c {
            '\'' => {
                in_string = true;
                out.push(c);
            }
            ':' if chars.peek().copied().is_some_and(is_name_start) => {
                let mut name = String::new();
                while chars.peek().copied().is_some_and(is_name_char) {
                    name.push(chars.next().expect("peeked"));
                }
                match params.get(&name) {
                    Some(value) => {
                        out.push('?');
                        args.push(value.clone());
                    }
                    None => {
                        return Err(DbError::Builder(format!("missing named parameter :{name}")))
                    }
                }
            }
            _ => out.push(c),
        }
    }
    Ok((out, args))
}

/// Expand the first `(?)` (or, failing that, the first bare `?`) into an
/// `n`-element placeholder list for `list`, appending `extras` after the
/// expanded arguments. Callers using the bare-`?` form supply their own
/// parentheses.
pub fn expand_in(
    sql: &str,
    list: &[Value],
    extras: &[Value],
) -> Result<(String, Vec<Value>)> {
    if list.is_empty() {
        return Err(DbError::Builder("IN expansion over an empty slice".into()));
    }
    let placeholders = vec!["?"; list.len()].join(", ");

    let expanded = if let Some(index) = sql.find("(?)") {
        let mut out = String::with_capacity(sql.len() + placeholders.len());
        out.push_str(&sql[..index]);
        out.push('(');
        out.push_str(&placeholders);
        out.push(')');
        out.push_str(&sql[index + 3..]);
        out
    } else if let Some(index) = sql.find('?') {
        let mut out = String::with_capacity(sql.len() + placeholders.len());
        out.push_str(&sql[..index]);
        out.push_str(&placeholders);
        out.push_str(&sql[index + 1..]);
        out
    } else {
        return Err(DbError::Builder(
            "query has no placeholder to expand".into(),
        ));
    };

    let mut args: Vec<Value> = list.to_vec();
    args.extend_from_slice(extras);
    Ok((expanded, args))
}
