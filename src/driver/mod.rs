// # Driver Abstraction
//
// The runtime never speaks the wire protocol itself. It consumes a driver
// through the capability traits below: connect, ping, execute, query with a
// lazy row cursor, prepared statements, and transaction demarcation. Drivers
// register under an identifier in a process-wide registry; the pool resolves
// its driver by name from the configuration.

mod value;

pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

pub use self::value::{ExecOutcome, Row, StatementId, Value};
use crate::config::Endpoint;
use crate::error::{DbError, Result};

/// Lazy cursor over a result set. Rows are produced on demand; dropping the
/// cursor abandons the remainder.
#[async_trait]
pub trait RowCursor: Send {
    fn columns(&self) -> &[String];

    async fn next_row(&mut self) -> Result<Option<Row>>;
}

pub type BoxRowCursor = Box<dyn RowCursor>;

/// One wire connection. Not safe for concurrent use; the pool guarantees a
/// connection is owned by exactly one borrow at a time.
#[async_trait]
pub trait DriverConnection: Send {
    async fn ping(&mut self) -> Result<()>;

    async fn exec(&mut self, sql: &str, args: &[Value]) -> Result<ExecOutcome>;

    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<BoxRowCursor>;

    async fn prepare(&mut self, sql: &str) -> Result<StatementId>;

    async fn exec_prepared(&mut self, stmt: StatementId, args: &[Value]) -> Result<ExecOutcome>;

    async fn query_prepared(&mut self, stmt: StatementId, args: &[Value]) -> Result<BoxRowCursor>;

    async fn close_statement(&mut self, stmt: StatementId) -> Result<()>;

    async fn begin(&mut self) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

pub type BoxDriverConnection = Box<dyn DriverConnection>;

/// A registered wire driver: a connection factory keyed by identifier.
#[async_trait]
pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self, endpoint: &Endpoint) -> Result<BoxDriverConnection>;
}

static DRIVERS: Lazy<RwLock<HashMap<String, Arc<dyn Driver>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Register a driver under its identifier. Re-registering a name replaces
/// the previous driver.
pub fn register_driver(driver: Arc<dyn Driver>) {
    DRIVERS
        .write()
        .insert(driver.name().to_string(), driver.clone());
}

/// Resolve a registered driver by identifier.
pub fn lookup_driver(name: &str) -> Result<Arc<dyn Driver>> {
    DRIVERS
        .read()
        .get(name)
        .cloned()
        .ok_or_else(|| DbError::Configuration(format!("unknown driver {name:?}")))
}

/// Identifiers of every registered driver, for diagnostics.
pub fn registered_drivers() -> Vec<String> {
    let mut names: Vec<String> = DRIVERS.read().keys().cloned().collect();
    names.sort();
    names
}

/// In-memory cursor over pre-materialized rows. Useful for drivers that
/// buffer a result set, and for the mock driver.
pub struct VecCursor {
    columns: Vec<String>,
    rows: std::vec::IntoIter<Row>,
}

impl VecCursor {
    pub fn new(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}

#[async_trait]
impl RowCursor for VecCursor {
    fn columns(&self) -> &[String] {
        &self.columns
    }

    async fn next_row(&mut self) -> Result<Option<Row>> {
        Ok(self.rows.next())
    }
}

/// Build rows sharing one column header, for drivers and tests.
pub fn rows_from_values(columns: &[&str], values: Vec<Vec<Value>>) -> Vec<Row> {
    let header = Arc::new(columns.iter().map(|c| c.to_string()).collect::<Vec<_>>());
    values
        .into_iter()
        .map(|v| Row::new(header.clone(), v))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_vec_cursor_drains() {
        let rows = rows_from_values(&["a"], vec![vec![Value::Int(1)], vec![Value::Int(2)]]);
        let mut cursor = VecCursor::new(vec!["a".into()], rows);
        assert_eq!(cursor.columns(), &["a".to_string()]);
        assert_eq!(
            cursor.next_row().await.unwrap().unwrap().get(0),
            Some(&Value::Int(1))
        );
        assert_eq!(
            cursor.next_row().await.unwrap().unwrap().get(0),
            Some(&Value::Int(2))
        );
        assert!(cursor.next_row().await.unwrap().is_none());
    }

    #[test]
    fn test_registry_roundtrip() {
        let driver = Arc::new(mock::MockDriver::new());
        register_driver(driver.clone());
        let found = lookup_driver("mock").unwrap();
        assert_eq!(found.name(), "mock");
        assert!(lookup_driver("no-such-driver").is_err());
    }
}
