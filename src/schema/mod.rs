// # Table Schemas from Record Descriptors
//
// Record types describe their table through a companion descriptor: one
// `FieldSpec` per field carrying the field name, a tag string, and a value
// kind for type inference. The tag grammar is parsed once per record type
// and the resulting `TableSchema` is cached by `TypeId`, so hot-path CRUD
// never re-parses tags.
//
// Tag grammar (comma-separated tokens, single tag per field):
//
// | Token | Effect |
// |-------|--------|
// | bare identifier (first token) | column name |
// | `name=...` | column name |
// | `type=...` | SQL type override |
// | `pk`, `primary`, `primary_key`, `primarykey` | primary key |
// | `auto`, `auto_increment` | auto increment |
// | `notnull`, `not null`, `not_null` | NOT NULL |
// | `unique` | column-level UNIQUE |
// | `index` | table-level KEY |
// | `uniqueindex`, `unique_index`, `uniq` | table-level UNIQUE KEY |
// | `default=V` | default value (functions and numerics unquoted) |

pub mod binder;

use std::any::TypeId;
use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::driver::Value;
use crate::error::{DbError, Result};

/// Inferred SQL affinity of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    BigInt,
    UInt,
    Float,
    Double,
    Bool,
    Text,
    Bytes,
    DateTime,
    Other,
}

fn inferred_sql_type(kind: ValueKind) -> &'static str {
    match kind {
        ValueKind::Int => "INT",
        ValueKind::BigInt | ValueKind::UInt => "BIGINT",
        ValueKind::Float | ValueKind::Double => "DOUBLE",
        ValueKind::Bool => "TINYINT(1)",
        ValueKind::Text => "VARCHAR(255)",
        ValueKind::Bytes => "BLOB",
        ValueKind::DateTime => "DATETIME",
        ValueKind::Other => "TEXT",
    }
}

/// Descriptor for one record field.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub tag: &'static str,
    pub kind: ValueKind,
}

impl FieldSpec {
    pub const fn new(name: &'static str, tag: &'static str, kind: ValueKind) -> Self {
        Self { name, tag, kind }
    }
}

/// A record type bindable to a table. `field_values` and `load_values` use
/// the declared field order; the binder keeps SQL column order aligned with
/// it.
pub trait TableRecord: Send + Sync + 'static {
    /// Override the inferred table name.
    fn table_name() -> Option<&'static str> {
        None
    }

    fn field_specs() -> &'static [FieldSpec];

    /// Current field values, in declared order.
    fn field_values(&self) -> Vec<Value>;

    /// Assign fields from `values`, in declared order. Extra values are
    /// ignored; missing values leave fields untouched.
    fn load_values(&mut self, values: &[Value]) -> Result<()>;

    /// Receive the generated id after an insert through an auto-increment
    /// column.
    fn set_generated_id(&mut self, _id: u64) {}
}

#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub sql_type: String,
    pub primary_key: bool,
    pub auto_increment: bool,
    pub not_null: bool,
    pub unique: bool,
    pub indexed: bool,
    pub unique_indexed: bool,
    pub default_value: Option<String>,
    /// Position of the backing field in the record's declared order.
    pub field_index: usize,
}

#[derive(Debug, Clone)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnSchema>,
    pub primary_key: Option<usize>,
}

static SCHEMAS: Lazy<DashMap<TypeId, Arc<TableSchema>>> = Lazy::new(DashMap::new);

/// Convert `CamelCase` (or a full type path) to `snake_case`.
pub fn snake_case(name: &str) -> String {
    let bare = name.rsplit("::").next().unwrap_or(name);
    let mut out = String::with_capacity(bare.len() + 4);
    for (i, c) in bare.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

const DEFAULT_FUNCTIONS: [&str; 4] = ["CURRENT_TIMESTAMP", "CURRENT_TIMESTAMP()", "NOW()", "NULL"];

fn render_default(value: &str) -> String {
    if DEFAULT_FUNCTIONS.contains(&value.to_uppercase().as_str()) {
        return value.to_string();
    }
    if value.parse::<f64>().is_ok() {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "''"))
}

fn parse_field(spec: &FieldSpec, field_index: usize) -> ColumnSchema {
    let mut column = ColumnSchema {
        name: snake_case(spec.name),
        sql_type: String::new(),
        primary_key: false,
        auto_increment: false,
        not_null: false,
        unique: false,
        indexed: false,
        unique_indexed: false,
        default_value: None,
        field_index,
    };
    let mut explicit_type: Option<String> = None;

    for (position, raw) in spec.tag.split(',').enumerate() {
        let token = raw.trim();
        if token.is_empty() {
            continue;
        }
        if let Some((key, value)) = token.split_once('=') {
            match key.trim().to_ascii_lowercase().as_str() {
                "name" => column.name = value.trim().to_string(),
                "type" => explicit_type = Some(value.trim().to_string()),
                "default" => column.default_value = Some(value.trim().to_string()),
                _ => {}
            }
            continue;
        }
        match token.to_ascii_lowercase().as_str() {
            "pk" | "primary" | "primary_key" | "primarykey" => column.primary_key = true,
            "auto" | "auto_increment" => column.auto_increment = true,
            "notnull" | "not null" | "not_null" => column.not_null = true,
            "unique" => column.unique = true,
            "index" => column.indexed = true,
            "uniqueindex" | "unique_index" | "uniq" => column.unique_indexed = true,
            _ if position == 0 => column.name = token.to_string(),
            _ => {}
        }
    }

    column.sql_type =
        explicit_type.unwrap_or_else(|| inferred_sql_type(spec.kind).to_string());
    column
}

impl TableSchema {
    /// The cached schema for `T`, parsing the descriptor on first use.
    pub fn derive<T: TableRecord>() -> Result<Arc<TableSchema>> {
        let key = TypeId::of::<T>();
        if let Some(schema) = SCHEMAS.get(&key) {
            return Ok(schema.clone());
        }
        let schema = Arc::new(Self::build::<T>()?);
        SCHEMAS.insert(key, schema.clone());
        Ok(schema)
    }

    fn build<T: TableRecord>() -> Result<TableSchema> {
        let specs = T::field_specs();
        if specs.is_empty() {
            return Err(DbError::Configuration(
                "record type declares no fields".into(),
            ));
        }
        let table = match T::table_name() {
            Some(name) => name.to_string(),
            None => snake_case(std::any::type_name::<T>()),
        };

        let columns: Vec<ColumnSchema> = specs
            .iter()
            .enumerate()
            .map(|(index, spec)| parse_field(spec, index))
            .collect();

        let mut primary_key = None;
        for (index, column) in columns.iter().enumerate() {
            if column.primary_key {
                if primary_key.is_some() {
                    return Err(DbError::Configuration(format!(
                        "table {table} declares more than one primary key"
                    )));
                }
                primary_key = Some(index);
            }
        }

        Ok(TableSchema {
            table,
            columns,
            primary_key,
        })
    }

    pub fn primary_key_column(&self) -> Result<&ColumnSchema> {
        self.primary_key
            .map(|i| &self.columns[i])
            .ok_or_else(|| {
                DbError::Configuration(format!("table {} has no primary key", self.table))
            })
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn non_auto_columns(&self) -> Vec<&ColumnSchema> {
        self.columns.iter().filter(|c| !c.auto_increment).collect()
    }

    pub fn auto_increment_column(&self) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.auto_increment)
    }

    /// Render the CREATE TABLE statement for this schema.
    pub fn create_table_sql(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.columns.len() + 3);
        for column in &self.columns {
            let mut definition = format!("{} {}", column.name, column.sql_type);
            if column.not_null || column.primary_key {
                definition.push_str(" NOT NULL");
            }
            if column.auto_increment {
                definition.push_str(" AUTO_INCREMENT");
            }
            if column.unique {
                definition.push_str(" UNIQUE");
            }
            if let Some(default) = &column.default_value {
                definition.push_str(" DEFAULT ");
                definition.push_str(&render_default(default));
            }
            parts.push(definition);
        }
        if let Some(pk) = self.primary_key {
            parts.push(format!("PRIMARY KEY ({})", self.columns[pk].name));
        }
        for column in &self.columns {
            if column.unique_indexed {
                parts.push(format!("UNIQUE KEY uk_{0} ({0})", column.name));
            } else if column.indexed {
                parts.push(format!("KEY idx_{0} ({0})", column.name));
            }
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.table,
            parts.join(", ")
        )
    }
}
