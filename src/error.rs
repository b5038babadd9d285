// # Error Types and MySQL Error Classification
//
// Every fallible operation in this crate returns `Result<T>` with `DbError`.
// The classifier maps MySQL-family server error codes onto a small taxonomy
// consumed by the retry executor and the transaction executor.

use std::time::Duration;

use thiserror::Error;

/// Classification of a database error, derived from the server error code.
///
/// `Retryable` and `ReadOnly` are both considered retryable by the retry
/// executor; `ReadOnly` stays a distinct class so callers targeting a
/// single-primary topology can opt out of re-driving those.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Deadlock or lock-wait timeout; safe to re-drive on a fresh attempt.
    Retryable,
    /// Duplicate-key violation.
    Conflict,
    /// Server is in read-only mode (e.g. a replica).
    ReadOnly,
    /// NOT NULL, foreign-key or CHECK violation.
    Constraint,
    Unknown,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Retryable | ErrorClass::ReadOnly)
    }
}

/// Map a MySQL server error code onto its class.
///
/// | Code | Class |
/// |------|-------|
/// | 1213 | Retryable (deadlock) |
/// | 1205 | Retryable (lock wait timeout) |
/// | 1290 | ReadOnly |
/// | 1062, 1022 | Conflict (duplicate key) |
/// | 1048 | Constraint (not null) |
/// | 1451, 1452 | Constraint (foreign key) |
/// | 3819 | Constraint (check) |
pub fn classify_code(code: u16) -> ErrorClass {
    match code {
        1213 | 1205 => ErrorClass::Retryable,
        1290 => ErrorClass::ReadOnly,
        1062 | 1022 => ErrorClass::Conflict,
        1048 | 1451 | 1452 | 3819 => ErrorClass::Constraint,
        _ => ErrorClass::Unknown,
    }
}

/// Errors surfaced by the access runtime.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("connection unavailable: {0}")]
    Unavailable(String),

    #[error("pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("query failed (code {code}): {message}")]
    Query { code: u16, message: String },

    #[error("builder error: {0}")]
    Builder(String),

    #[error("transaction aborted: {source}")]
    TransactionAborted {
        #[source]
        source: Box<DbError>,
    },

    #[error("slow query storage error: {0}")]
    SlowQueryStorage(String),

    #[error("health check failed: {message}")]
    HealthCheck { message: String, recoverable: bool },

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DbError {
    /// Construct a server-side query failure from its error code.
    pub fn query(code: u16, message: impl Into<String>) -> Self {
        DbError::Query {
            code,
            message: message.into(),
        }
    }

    pub fn timeout(elapsed: Duration) -> Self {
        DbError::Cancelled(format!("deadline exceeded after {elapsed:?}"))
    }

    /// The MySQL server error code, when this error carries one.
    pub fn code(&self) -> Option<u16> {
        match self {
            DbError::Query { code, .. } => Some(*code),
            DbError::TransactionAborted { source } => source.code(),
            _ => None,
        }
    }

    /// Classify this error for retry decisions.
    pub fn class(&self) -> ErrorClass {
        match self {
            DbError::Query { code, .. } => classify_code(*code),
            DbError::TransactionAborted { source } => source.class(),
            DbError::Unavailable(_) => ErrorClass::Retryable,
            DbError::HealthCheck {
                recoverable: true, ..
            } => ErrorClass::Retryable,
            _ => ErrorClass::Unknown,
        }
    }

    /// Whether the retry executor may re-drive the failed operation.
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
