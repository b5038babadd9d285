// # Configuration
//
// The runtime consumes a fully resolved `DbConfig`; nothing here reads files.
// Every record validates its own ranges, and `DbConfig::validate` cascades
// before the pool is constructed. `from_env` (see `env.rs`) resolves the
// recognized environment variable set into a config.

mod env;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};

/// Where and as whom to connect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
    /// Driver parameters appended to the DSN (`parseTime`, `tls`, ...).
    pub params: BTreeMap<String, String>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: String::new(),
            params: BTreeMap::new(),
        }
    }
}

impl Endpoint {
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(DbError::Configuration("endpoint host is required".into()));
        }
        if self.port == 0 {
            return Err(DbError::Configuration(
                "endpoint port must be in (0, 65535]".into(),
            ));
        }
        Ok(())
    }

    /// The same endpoint without a database, used for bootstrap connections
    /// that must run `CREATE DATABASE`.
    pub fn without_database(&self) -> Endpoint {
        let mut endpoint = self.clone();
        endpoint.database = String::new();
        endpoint
    }
}

/// Sizing and lifetime limits for the connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on open connections (idle + borrowed). Must be > 0.
    pub max_open: usize,

    /// Upper bound on idle connections kept for reuse. Must be <= max_open.
    pub max_idle: usize,

    /// Maximum connection age before it is closed on release.
    /// Zero means unbounded.
    pub conn_max_lifetime: Duration,

    /// Maximum idle time before a pooled connection is discarded.
    /// Zero means unbounded.
    pub conn_max_idle_time: Duration,

    /// Per-borrow prepared-statement cache capacity. Zero disables caching.
    pub statement_cache_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = num_cpus::get();
        Self {
            max_open: cores * 2,
            max_idle: cores,
            conn_max_lifetime: Duration::from_secs(3600),
            conn_max_idle_time: Duration::from_secs(600),
            statement_cache_size: 64,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_open == 0 {
            return Err(DbError::Configuration("max_open must be > 0".into()));
        }
        if self.max_idle > self.max_open {
            return Err(DbError::Configuration(format!(
                "max_idle ({}) must not exceed max_open ({})",
                self.max_idle, self.max_open
            )));
        }
        Ok(())
    }
}

/// Parameters governing the retry executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Must be >= 1.
    pub max_attempts: u32,

    /// Base backoff; attempt k sleeps min(base * k, max_backoff).
    pub base_backoff: Duration,

    /// Cap on any single backoff sleep. Must be >= base_backoff.
    pub max_backoff: Duration,

    /// Replace each sleep with a uniform random duration in [0, sleep).
    pub jitter: bool,

    /// Stop retrying once this much wall time has elapsed since the first
    /// attempt. Zero means unbounded.
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
            jitter: true,
            max_elapsed: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(DbError::Configuration("max_attempts must be >= 1".into()));
        }
        if self.base_backoff.is_zero() {
            return Err(DbError::Configuration("base_backoff must be > 0".into()));
        }
        if self.max_backoff < self.base_backoff {
            return Err(DbError::Configuration(
                "max_backoff must be >= base_backoff".into(),
            ));
        }
        Ok(())
    }
}

/// How slow-query fingerprints are computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NormalizationMode {
    /// Store the original query text as the fingerprint.
    None,
    /// Strip literals, collapse whitespace, upper-case.
    Basic,
}

/// Append-only file backing for the slow-query log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlowLogFileConfig {
    pub path: std::path::PathBuf,

    /// Rotate (rename to `.old`, reopen) once the file exceeds this size.
    pub max_file_size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlowQueryConfig {
    pub enabled: bool,

    /// Only operations strictly slower than this are recorded.
    pub threshold: Duration,

    /// Ring-buffer capacity for in-memory records.
    pub max_records: usize,

    /// Upper bound on distinct tracked patterns.
    pub max_patterns: usize,

    /// Replace argument values with bounded placeholders before storage.
    pub sanitize_args: bool,

    /// Capture a caller stack with each record.
    pub include_stack: bool,

    pub normalization: NormalizationMode,

    /// When set, records are additionally persisted as JSON lines.
    pub file: Option<SlowLogFileConfig>,
}

impl Default for SlowQueryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: Duration::from_millis(200),
            max_records: 1000,
            max_patterns: 200,
            sanitize_args: true,
            include_stack: false,
            normalization: NormalizationMode::Basic,
            file: None,
        }
    }
}

impl SlowQueryConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        if self.max_records == 0 {
            return Err(DbError::Configuration("max_records must be > 0".into()));
        }
        if self.max_patterns == 0 {
            return Err(DbError::Configuration("max_patterns must be > 0".into()));
        }
        if let Some(file) = &self.file {
            if file.max_file_size == 0 {
                return Err(DbError::Configuration("max_file_size must be > 0".into()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Overall budget for one health check.
    pub timeout: Duration,

    /// Additional attempts for `health_check_with_retry`.
    pub retry_attempts: u32,

    pub retry_backoff: Duration,

    /// Budget for the test query inside a check.
    pub query_timeout: Duration,

    pub test_query: String,

    /// Tick period for the background monitor.
    pub monitoring_interval: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retry_attempts: 2,
            retry_backoff: Duration::from_millis(250),
            query_timeout: Duration::from_secs(2),
            test_query: "SELECT 1".to_string(),
            monitoring_interval: Duration::from_secs(30),
        }
    }
}

impl HealthCheckConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeout.is_zero() {
            return Err(DbError::Configuration("health timeout must be > 0".into()));
        }
        if self.query_timeout.is_zero() {
            return Err(DbError::Configuration(
                "health query_timeout must be > 0".into(),
            ));
        }
        if self.monitoring_interval.is_zero() {
            return Err(DbError::Configuration(
                "monitoring_interval must be > 0".into(),
            ));
        }
        if self.test_query.is_empty() {
            return Err(DbError::Configuration("test_query must be set".into()));
        }
        Ok(())
    }
}

/// Which per-operation hooks fire on the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub logging: bool,
    pub metrics: bool,
    pub tracing: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            logging: true,
            metrics: true,
            tracing: false,
        }
    }
}

/// The resolved configuration the pool is constructed from. Immutable once
/// the pool exists, except for pool sizing (`resize`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DbConfig {
    /// Identifier of a registered driver (`mysql`, `mock`, ...).
    pub driver: String,

    pub endpoint: Endpoint,

    pub pool: PoolConfig,

    pub retry: RetryPolicy,

    pub slow_query: SlowQueryConfig,

    pub health: HealthCheckConfig,

    pub observability: ObservabilityConfig,

    /// Issue `CREATE DATABASE IF NOT EXISTS` through a database-less
    /// connection before the pool comes up.
    pub auto_create_database: bool,
}

impl DbConfig {
    /// A config for the named driver with defaults everywhere else.
    pub fn for_driver(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.driver.is_empty() {
            return Err(DbError::Configuration("driver must be set".into()));
        }
        self.endpoint.validate()?;
        self.pool.validate()?;
        self.retry.validate()?;
        self.slow_query.validate()?;
        self.health.validate()?;
        Ok(())
    }
}
