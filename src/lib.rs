// RustyMySQL - MySQL access runtime for Rust applications
//
// A client-side access layer between application code and a wire driver:
// pooled connections with leak detection and health monitoring, transaction
// orchestration with classified retries, per-connection prepared-statement
// caching, slow-query recording and analysis, bulk/named/IN query builders,
// descriptor-based CRUD binding, and table import/export.
//
// The wire protocol itself is out of scope: drivers plug in through the
// capability traits in `driver` and register by identifier.

pub mod builder;
pub mod config;
pub mod context;
pub mod driver;
pub mod dsn;
pub mod error;
pub mod health;
pub mod manager;
pub mod observe;
pub mod pool;
pub mod retry;
pub mod schema;
pub mod slowlog;
pub mod transfer;
pub mod tx;

pub use builder::NamedParams;
pub use config::{
    DbConfig, Endpoint, HealthCheckConfig, NormalizationMode, ObservabilityConfig, PoolConfig,
    RetryPolicy, SlowLogFileConfig, SlowQueryConfig,
};
pub use context::Context;
pub use driver::{
    lookup_driver, register_driver, Driver, DriverConnection, ExecOutcome, Row, RowCursor,
    StatementId, Value,
};
pub use dsn::{DsnBuilder, TlsMode};
pub use error::{classify_code, DbError, ErrorClass, Result};
pub use health::{HealthChecker, HealthError, HealthErrorKind, HealthMonitor, HealthStatus};
pub use manager::{AdminOutcome, DbManager};
pub use observe::{LeakEvent, LeakHandler, MemoryMetrics, MetricsSink, NoopMetrics};
pub use pool::{ConnectionPool, PoolStats, PooledConn, StatementCacheStats};
pub use schema::binder::{ColumnUpdates, TableBinder};
pub use schema::{FieldSpec, TableRecord, TableSchema, ValueKind};
pub use slowlog::{
    AnalysisReport, QueryPattern, RecordFilter, RecordIdentity, SlowQueryHandler,
    SlowQueryRecord, SlowQueryRecorder, SlowQueryStats,
};
pub use transfer::{Exporter, ImportOptions, Importer};
pub use tx::Transaction;
