// # Mock Driver
//
// In-memory driver used by the test suites. Statements are recorded with
// their transaction state so commit/rollback effects are observable, and
// responses can be scripted per query pattern: canned rows, canned exec
// outcomes, or server error codes injected a fixed number of times (the
// deadlock-then-success scenarios).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    rows_from_values, BoxDriverConnection, BoxRowCursor, Driver, DriverConnection, ExecOutcome,
    StatementId, Value, VecCursor,
};
use crate::config::Endpoint;
use crate::error::{DbError, Result};

/// One statement observed by the mock, with the transaction state it ran in.
#[derive(Debug, Clone)]
pub struct StatementEvent {
    pub connection: u64,
    pub sql: String,
    pub args: Vec<Value>,
    pub in_transaction: bool,
}

enum ScriptResponse {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Exec(ExecOutcome),
    Error {
        code: u16,
        message: String,
    },
}

struct Script {
    pattern: String,
    remaining: u32,
    response: ScriptResponse,
}

#[derive(Default)]
struct MockShared {
    next_conn_id: AtomicU64,
    connects: AtomicU64,
    closed_connections: AtomicU64,
    fail_connects: AtomicU32,
    fail_pings: AtomicU32,
    next_insert_id: AtomicU64,
    prepared_statements: AtomicU64,
    closed_statements: AtomicU64,
    open_statements: AtomicI64,
    connect_delay: Mutex<Option<Duration>>,
    scripts: Mutex<Vec<Script>>,
    log: Mutex<Vec<StatementEvent>>,
    committed: Mutex<Vec<StatementEvent>>,
    rolled_back: Mutex<Vec<StatementEvent>>,
}

impl MockShared {
    fn respond(&self, sql: &str) -> Option<Result<ScriptedOutcome>> {
        self.respond_matching(sql, |_| true)
    }

    /// Only error scripts apply to `prepare`; canned results stay queued for
    /// the execution that follows.
    fn respond_error_only(&self, sql: &str) -> Option<Result<ScriptedOutcome>> {
        self.respond_matching(sql, |s| matches!(s.response, ScriptResponse::Error { .. }))
    }

    fn respond_matching(
        &self,
        sql: &str,
        accept: impl Fn(&Script) -> bool,
    ) -> Option<Result<ScriptedOutcome>> {
        let mut scripts = self.scripts.lock();
        let position = scripts
            .iter()
            .position(|s| s.remaining > 0 && sql.contains(&s.pattern) && accept(s))?;
        let script = &mut scripts[position];
        if script.remaining != u32::MAX {
            script.remaining -= 1;
        }
        let outcome = match &script.response {
            ScriptResponse::Rows { columns, rows } => Ok(ScriptedOutcome::Rows {
                columns: columns.clone(),
                rows: rows.clone(),
            }),
            ScriptResponse::Exec(outcome) => Ok(ScriptedOutcome::Exec(*outcome)),
            ScriptResponse::Error { code, message } => Err(DbError::query(*code, message.clone())),
        };
        if script.remaining == 0 {
            scripts.remove(position);
        }
        Some(outcome)
    }
}

enum ScriptedOutcome {
    Rows {
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
    },
    Exec(ExecOutcome),
}

/// Test-side control surface for a `MockDriver`.
#[derive(Clone)]
pub struct MockHandle {
    shared: Arc<MockShared>,
}

impl MockHandle {
    /// Queries containing `pattern` return these rows.
    pub fn script_rows(&self, pattern: &str, columns: &[&str], rows: Vec<Vec<Value>>) {
        self.shared.scripts.lock().push(Script {
            pattern: pattern.to_string(),
            remaining: u32::MAX,
            response: ScriptResponse::Rows {
                columns: columns.iter().map(|c| c.to_string()).collect(),
                rows,
            },
        });
    }

    /// Statements containing `pattern` return this outcome.
    pub fn script_exec(&self, pattern: &str, outcome: ExecOutcome) {
        self.shared.scripts.lock().push(Script {
            pattern: pattern.to_string(),
            remaining: u32::MAX,
            response: ScriptResponse::Exec(outcome),
        });
    }

    /// The next `times` statements containing `pattern` fail with the given
    /// server error code.
    pub fn script_error(&self, pattern: &str, code: u16, message: &str, times: u32) {
        self.shared.scripts.lock().push(Script {
            pattern: pattern.to_string(),
            remaining: times,
            response: ScriptResponse::Error {
                code,
                message: message.to_string(),
            },
        });
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.shared.fail_connects.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_pings(&self, n: u32) {
        self.shared.fail_pings.store(n, Ordering::SeqCst);
    }

    /// Artificial latency added to every connect.
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.shared.connect_delay.lock() = Some(delay);
    }

    /// Every statement observed, in arrival order.
    pub fn statements(&self) -> Vec<StatementEvent> {
        self.shared.log.lock().clone()
    }

    /// Statements whose effects are visible: autocommit statements plus
    /// statements of committed transactions.
    pub fn committed(&self) -> Vec<StatementEvent> {
        self.shared.committed.lock().clone()
    }

    pub fn rolled_back(&self) -> Vec<StatementEvent> {
        self.shared.rolled_back.lock().clone()
    }

    pub fn committed_matching(&self, pattern: &str) -> usize {
        self.shared
            .committed
            .lock()
            .iter()
            .filter(|e| e.sql.contains(pattern))
            .count()
    }

    pub fn statements_matching(&self, pattern: &str) -> usize {
        self.shared
            .log
            .lock()
            .iter()
            .filter(|e| e.sql.contains(pattern))
            .count()
    }

    pub fn connects(&self) -> u64 {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn closed_connections(&self) -> u64 {
        self.shared.closed_connections.load(Ordering::SeqCst)
    }

    pub fn prepared_statements(&self) -> u64 {
        self.shared.prepared_statements.load(Ordering::SeqCst)
    }

    pub fn closed_statements(&self) -> u64 {
        self.shared.closed_statements.load(Ordering::SeqCst)
    }

    /// Currently open prepared statements across all connections.
    pub fn open_statements(&self) -> i64 {
        self.shared.open_statements.load(Ordering::SeqCst)
    }

    pub fn clear_log(&self) {
        self.shared.log.lock().clear();
        self.shared.committed.lock().clear();
        self.shared.rolled_back.lock().clear();
    }
}

/// The mock driver itself; registers under the identifier `mock`.
pub struct MockDriver {
    shared: Arc<MockShared>,
}

impl MockDriver {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MockShared::default()),
        }
    }

    pub fn handle(&self) -> MockHandle {
        MockHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn connect(&self, _endpoint: &Endpoint) -> Result<BoxDriverConnection> {
        let failing = self
            .shared
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DbError::Unavailable("connection refused".into()));
        }
        let delay = *self.shared.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        let id = self.shared.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(MockConnection {
            id,
            shared: self.shared.clone(),
            in_tx: false,
            tx_buffer: Vec::new(),
            statements: HashMap::new(),
            next_stmt: 0,
            closed: false,
        }))
    }
}

struct MockConnection {
    id: u64,
    shared: Arc<MockShared>,
    in_tx: bool,
    tx_buffer: Vec<StatementEvent>,
    statements: HashMap<StatementId, String>,
    next_stmt: u32,
    closed: bool,
}

impl MockConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(DbError::ConnectionClosed);
        }
        Ok(())
    }

    fn record(&mut self, sql: &str, args: &[Value]) {
        let event = StatementEvent {
            connection: self.id,
            sql: sql.to_string(),
            args: args.to_vec(),
            in_transaction: self.in_tx,
        };
        self.shared.log.lock().push(event.clone());
        if self.in_tx {
            self.tx_buffer.push(event);
        } else {
            self.shared.committed.lock().push(event);
        }
    }

    fn record_attempt(&self, sql: &str, args: &[Value]) {
        self.shared.log.lock().push(StatementEvent {
            connection: self.id,
            sql: sql.to_string(),
            args: args.to_vec(),
            in_transaction: self.in_tx,
        });
    }

    fn default_exec_outcome(&self, sql: &str) -> ExecOutcome {
        let upper = sql.to_uppercase();
        if upper.trim_start().starts_with("INSERT") {
            let rows = match upper.find("VALUES") {
                Some(idx) => upper[idx..].matches('(').count().max(1) as u64,
                None => 1,
            };
            let id = self.shared.next_insert_id.fetch_add(1, Ordering::SeqCst) + 1;
            ExecOutcome {
                last_insert_id: id,
                rows_affected: rows,
            }
        } else {
            ExecOutcome {
                last_insert_id: 0,
                rows_affected: 1,
            }
        }
    }
}

#[async_trait]
impl DriverConnection for MockConnection {
    async fn ping(&mut self) -> Result<()> {
        self.check_open()?;
        let failing = self
            .shared
            .fail_pings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DbError::Unavailable("connection refused".into()));
        }
        Ok(())
    }

    async fn exec(&mut self, sql: &str, args: &[Value]) -> Result<ExecOutcome> {
        self.check_open()?;
        match self.shared.respond(sql) {
            Some(Err(e)) => {
                self.record_attempt(sql, args);
                Err(e)
            }
            Some(Ok(ScriptedOutcome::Exec(outcome))) => {
                self.record(sql, args);
                Ok(outcome)
            }
            Some(Ok(ScriptedOutcome::Rows { .. })) | None => {
                let outcome = self.default_exec_outcome(sql);
                self.record(sql, args);
                Ok(outcome)
            }
        }
    }

    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<BoxRowCursor> {
        self.check_open()?;
        self.record_attempt(sql, args);
        match self.shared.respond(sql) {
            Some(Err(e)) => Err(e),
            Some(Ok(ScriptedOutcome::Rows { columns, rows })) => {
                let header: Vec<&str> = columns.iter().map(|c| c.as_str()).collect();
                let rows = rows_from_values(&header, rows);
                Ok(Box::new(VecCursor::new(columns, rows)) as BoxRowCursor)
            }
            Some(Ok(ScriptedOutcome::Exec(_))) | None => {
                Ok(Box::new(VecCursor::empty()) as BoxRowCursor)
            }
        }
    }

    async fn prepare(&mut self, sql: &str) -> Result<StatementId> {
        self.check_open()?;
        if let Some(Err(e)) = self.shared.respond_error_only(sql) {
            return Err(e);
        }
        self.next_stmt += 1;
        let id = StatementId::new(self.next_stmt);
        self.statements.insert(id, sql.to_string());
        self.shared
            .prepared_statements
            .fetch_add(1, Ordering::SeqCst);
        self.shared.open_statements.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn exec_prepared(&mut self, stmt: StatementId, args: &[Value]) -> Result<ExecOutcome> {
        self.check_open()?;
        let sql = self
            .statements
            .get(&stmt)
            .cloned()
            .ok_or_else(|| DbError::Internal(format!("unknown statement {}", stmt.raw())))?;
        self.exec(&sql, args).await
    }

    async fn query_prepared(&mut self, stmt: StatementId, args: &[Value]) -> Result<BoxRowCursor> {
        self.check_open()?;
        let sql = self
            .statements
            .get(&stmt)
            .cloned()
            .ok_or_else(|| DbError::Internal(format!("unknown statement {}", stmt.raw())))?;
        self.query(&sql, args).await
    }

    async fn close_statement(&mut self, stmt: StatementId) -> Result<()> {
        self.check_open()?;
        if self.statements.remove(&stmt).is_none() {
            return Err(DbError::Internal(format!(
                "statement {} already closed",
                stmt.raw()
            )));
        }
        self.shared.closed_statements.fetch_add(1, Ordering::SeqCst);
        self.shared.open_statements.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    async fn begin(&mut self) -> Result<()> {
        self.check_open()?;
        if self.in_tx {
            return Err(DbError::Internal("transaction already open".into()));
        }
        self.in_tx = true;
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.in_tx {
            return Err(DbError::Internal("no open transaction".into()));
        }
        self.in_tx = false;
        let events = std::mem::take(&mut self.tx_buffer);
        self.shared.committed.lock().extend(events);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.check_open()?;
        if !self.in_tx {
            return Err(DbError::Internal("no open transaction".into()));
        }
        self.in_tx = false;
        let events = std::mem::take(&mut self.tx_buffer);
        self.shared.rolled_back.lock().extend(events);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.in_tx {
            self.in_tx = false;
            let events = std::mem::take(&mut self.tx_buffer);
            self.shared.rolled_back.lock().extend(events);
        }
        let open = self.statements.len() as i64;
        self.statements.clear();
        self.shared.open_statements.fetch_sub(open, Ordering::SeqCst);
        self.shared
            .closed_connections
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
