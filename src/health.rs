// # Health Checking and Monitoring
//
// `HealthChecker` probes the pool: ping plus a test query, with pool
// telemetry attached. `DeepHealthCheck` additionally exercises concurrent
// acquires and flags capacity pressure. `health_check_with_retry` drives the
// check under the retry executor, continuing only while every recorded
// error looks recoverable. `HealthMonitor` runs the check on an interval,
// caches the latest status, and doubles as the pool's leak sweeper.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::RetryPolicy;
use crate::context::Context;
use crate::error::{DbError, Result};
use crate::pool::ConnectionPool;
use crate::retry;

/// Message fragments that indicate a transient infrastructure failure.
const RECOVERABLE_PATTERNS: [&str; 8] = [
    "connection refused",
    "timeout",
    "temporary failure",
    "network is unreachable",
    "connection reset",
    "broken pipe",
    "no such host",
    "context deadline exceeded",
];

pub fn is_recoverable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RECOVERABLE_PATTERNS.iter().any(|p| lower.contains(p))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthErrorKind {
    Connectivity,
    QueryExecution,
    DeepCheck,
    HealthCheckFailure,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthError {
    pub kind: HealthErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub recoverable: bool,
}

impl HealthError {
    fn new(kind: HealthErrorKind, error: &DbError) -> Self {
        let message = error.to_string();
        let recoverable = is_recoverable_message(&message);
        Self {
            kind,
            message,
            timestamp: Utc::now(),
            recoverable,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub last_checked: DateTime<Utc>,
    pub response_time: Duration,
    pub connections_active: usize,
    pub connections_idle: usize,
    pub connections_max: usize,
    pub errors: Vec<HealthError>,
    pub details: BTreeMap<String, String>,
}

impl HealthStatus {
    pub fn all_errors_recoverable(&self) -> bool {
        !self.errors.is_empty() && self.errors.iter().all(|e| e.recoverable)
    }
}

#[derive(Clone)]
pub struct HealthChecker {
    pool: ConnectionPool,
}

impl HealthChecker {
    pub fn new(pool: ConnectionPool) -> Self {
        Self { pool }
    }

    /// Ping plus test query, with pool telemetry. Never fails; problems are
    /// reported inside the returned status.
    pub async fn health_check(&self, ctx: &Context) -> HealthStatus {
        let config = &self.pool.config().health;
        let started = Instant::now();
        let check_ctx = ctx.child_with_timeout(config.timeout);
        let mut errors = Vec::new();

        match self.pool.acquire(&check_ctx).await {
            Ok(mut conn) => {
                if let Err(e) = conn.ping(&check_ctx).await {
                    errors.push(HealthError::new(HealthErrorKind::Connectivity, &e));
                } else {
                    let query_ctx = check_ctx.child_with_timeout(config.query_timeout);
                    if let Err(e) = conn
                        .query_row(&query_ctx, &config.test_query, &[])
                        .await
                    {
                        errors.push(HealthError::new(HealthErrorKind::QueryExecution, &e));
                    }
                }
                if let Err(e) = conn.release().await {
                    tracing::warn!(error = %e, "release after health check failed");
                }
            }
            Err(e) => {
                errors.push(HealthError::new(HealthErrorKind::Connectivity, &e));
            }
        }

        self.finish_status(started, errors)
    }

    fn finish_status(&self, started: Instant, errors: Vec<HealthError>) -> HealthStatus {
        let stats = self.pool.stats();
        let mut details = BTreeMap::new();
        details.insert("driver".to_string(), self.pool.config().driver.clone());
        details.insert(
            "database".to_string(),
            self.pool.config().endpoint.database.clone(),
        );
        details.insert(
            "utilization".to_string(),
            format!("{:.2}", stats.utilization()),
        );

        HealthStatus {
            healthy: errors.is_empty(),
            last_checked: Utc::now(),
            response_time: started.elapsed(),
            connections_active: stats.in_use,
            connections_idle: stats.idle,
            connections_max: stats.max_open,
            errors,
            details,
        }
    }

    /// `health_check` plus three concurrent acquire/ping probes. Capacity
    /// pressure (in-use above 80% of max, or acquire waits beyond one
    /// second) is flagged in the details.
    pub async fn deep_health_check(&self, ctx: &Context) -> HealthStatus {
        let config = &self.pool.config().health;
        let started = Instant::now();
        let mut status = self.health_check(ctx).await;

        let check_ctx = ctx.child_with_timeout(config.timeout);
        let probes = (0..3).map(|_| {
            let pool = self.pool.clone();
            let probe_ctx = check_ctx.child();
            async move {
                let waited = Instant::now();
                let mut conn = pool.acquire(&probe_ctx).await?;
                let wait = waited.elapsed();
                let result = conn.ping(&probe_ctx).await;
                let _ = conn.release().await;
                result.map(|_| wait)
            }
        });
        let outcomes = futures::future::join_all(probes).await;

        let mut max_wait = Duration::ZERO;
        for outcome in outcomes {
            match outcome {
                Ok(wait) => max_wait = max_wait.max(wait),
                Err(e) => {
                    status
                        .errors
                        .push(HealthError::new(HealthErrorKind::DeepCheck, &e));
                }
            }
        }

        let stats = self.pool.stats();
        if stats.utilization() > 0.8 {
            status.details.insert(
                "warning_pool_pressure".to_string(),
                format!(
                    "{} of {} connections in use",
                    stats.in_use, stats.max_open
                ),
            );
        }
        if max_wait > Duration::from_secs(1) {
            status.details.insert(
                "warning_acquire_wait".to_string(),
                format!("acquire waited {max_wait:?}"),
            );
        }
        status.details.insert(
            "deep_check".to_string(),
            if status.errors.is_empty() {
                "passed".to_string()
            } else {
                "failed".to_string()
            },
        );
        status.healthy = status.errors.is_empty();
        status.response_time = started.elapsed();
        status
    }

    /// Drive `health_check` under the retry executor. Retries continue only
    /// while every recorded error is recoverable; the total attempt count is
    /// `retry_attempts + 1`.
    pub async fn health_check_with_retry(&self, ctx: &Context) -> Result<HealthStatus> {
        let config = &self.pool.config().health;
        let backoff = config.retry_backoff.max(Duration::from_millis(1));
        let policy = RetryPolicy {
            max_attempts: config.retry_attempts + 1,
            base_backoff: backoff,
            max_backoff: backoff.saturating_mul(config.retry_attempts.max(1)),
            jitter: false,
            max_elapsed: Duration::ZERO,
        };

        retry::run(ctx, &policy, |attempt| async move {
            let status = self.health_check(ctx).await;
            if status.healthy {
                return Ok(status);
            }
            let recoverable = status.all_errors_recoverable();
            let message = status
                .errors
                .iter()
                .map(|e| e.message.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            tracing::debug!(attempt, recoverable, errors = %message, "health check attempt failed");
            Err(DbError::HealthCheck {
                message,
                recoverable,
            })
        })
        .await
    }
}

/// Background monitor: periodic health checks cached behind an RwLock.
pub struct HealthMonitor {
    checker: HealthChecker,
    interval: Duration,
    status: Arc<RwLock<Option<HealthStatus>>>,
    worker: Mutex<Option<(Context, JoinHandle<()>)>>,
}

impl HealthMonitor {
    pub fn new(pool: ConnectionPool) -> Self {
        let interval = pool.config().health.monitoring_interval;
        Self {
            checker: HealthChecker::new(pool),
            interval,
            status: Arc::new(RwLock::new(None)),
            worker: Mutex::new(None),
        }
    }

    pub fn with_interval(pool: ConnectionPool, interval: Duration) -> Self {
        let mut monitor = Self::new(pool);
        monitor.interval = interval;
        monitor
    }

    /// Start the background task. Fails when monitoring is already running.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(DbError::Internal("health monitoring already running".into()));
        }

        let ctx = Context::background();
        let checker = self.checker.clone();
        let status = self.status.clone();
        let interval = self.interval;
        let task_ctx = ctx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = task_ctx.done() => break,
                }
                let latest = checker.health_check(&task_ctx).await;
                if task_ctx.is_done() {
                    break;
                }
                tracing::debug!(healthy = latest.healthy, "health monitor tick");
                *status.write() = Some(latest);
                checker.pool.sweep_leaks();
            }
        });
        *worker = Some((ctx, handle));
        Ok(())
    }

    /// Stop the background task. Idempotent; after return no further status
    /// updates occur.
    pub fn stop(&self) {
        if let Some((ctx, handle)) = self.worker.lock().take() {
            ctx.cancel();
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// The most recent status captured by the background task.
    pub fn latest(&self) -> Option<HealthStatus> {
        self.status.read().clone()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ConnectionPool {
    pub fn health_checker(&self) -> HealthChecker {
        HealthChecker::new(self.clone())
    }

    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(self.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::DbConfig;
    use crate::driver::mock::{MockDriver, MockHandle};

    async fn pool_with(config_fn: impl FnOnce(&mut DbConfig)) -> (ConnectionPool, MockHandle) {
        let driver = Arc::new(MockDriver::new());
        let handle = driver.handle();
        let mut config = DbConfig::for_driver("mock");
        config.endpoint.database = "test".into();
        config_fn(&mut config);
        let pool = ConnectionPool::connect_with_driver(config, driver)
            .await
            .unwrap();
        (pool, handle)
    }

    #[test]
    fn test_recoverable_patterns() {
        assert!(is_recoverable_message("dial tcp: connection refused"));
        assert!(is_recoverable_message("read: Connection Reset by peer"));
        assert!(is_recoverable_message("context deadline exceeded"));
        assert!(!is_recoverable_message("syntax error near 'FROM'"));
    }

    #[tokio::test]
    async fn test_healthy_check() {
        let (pool, handle) = pool_with(|_| {}).await;
        let status = pool.health_checker().health_check(&Context::background()).await;
        assert!(status.healthy);
        assert!(status.errors.is_empty());
        assert_eq!(status.connections_active, 0);
        assert_eq!(handle.statements_matching("SELECT 1"), 1);
        assert_eq!(status.details.get("driver").unwrap(), "mock");
    }

    #[tokio::test]
    async fn test_ping_failure_is_recoverable_connectivity() {
        let (pool, handle) = pool_with(|_| {}).await;
        handle.fail_next_pings(1);
        let status = pool.health_checker().health_check(&Context::background()).await;
        assert!(!status.healthy);
        assert_eq!(status.errors.len(), 1);
        assert_eq!(status.errors[0].kind, HealthErrorKind::Connectivity);
        assert!(status.errors[0].recoverable);
    }

    #[tokio::test]
    async fn test_query_failure_kind() {
        let (pool, handle) = pool_with(|_| {}).await;
        handle.script_error("SELECT 1", 1064, "syntax error near SELECT", 1);
        let status = pool.health_checker().health_check(&Context::background()).await;
        assert!(!status.healthy);
        assert_eq!(status.errors[0].kind, HealthErrorKind::QueryExecution);
        assert!(!status.errors[0].recoverable);
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let (pool, handle) = pool_with(|c| {
            c.health.retry_attempts = 2;
            c.health.retry_backoff = Duration::from_millis(1);
        })
        .await;
        handle.fail_next_pings(1);

        let status = pool
            .health_checker()
            .health_check_with_retry(&Context::background())
            .await
            .unwrap();
        assert!(status.healthy);
        // One failed ping, one successful ping on the retry.
        assert_eq!(handle.statements_matching("SELECT 1"), 1);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_recoverable() {
        let (pool, handle) = pool_with(|c| {
            c.health.retry_attempts = 5;
            c.health.retry_backoff = Duration::from_millis(1);
        })
        .await;
        handle.script_error("SELECT 1", 1064, "syntax error near SELECT", 10);

        let result = pool
            .health_checker()
            .health_check_with_retry(&Context::background())
            .await;
        assert!(matches!(
            result,
            Err(DbError::HealthCheck {
                recoverable: false,
                ..
            })
        ));
        // Only the first attempt ran.
        assert_eq!(handle.statements_matching("SELECT 1"), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_on_persistent_recoverable() {
        let (pool, handle) = pool_with(|c| {
            c.health.retry_attempts = 2;
            c.health.retry_backoff = Duration::from_millis(1);
        })
        .await;
        handle.fail_next_pings(10);

        let result = pool
            .health_checker()
            .health_check_with_retry(&Context::background())
            .await;
        assert!(matches!(
            result,
            Err(DbError::HealthCheck {
                recoverable: true,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_deep_check_passes_on_idle_pool() {
        let (pool, _) = pool_with(|c| {
            c.pool.max_open = 4;
            c.pool.max_idle = 4;
        })
        .await;
        let status = pool
            .health_checker()
            .deep_health_check(&Context::background())
            .await;
        assert!(status.healthy);
        assert_eq!(status.details.get("deep_check").unwrap(), "passed");
        assert!(!status.details.contains_key("warning_pool_pressure"));
    }

    #[tokio::test]
    async fn test_monitor_caches_status_and_stops() {
        let (pool, _) = pool_with(|c| {
            c.health.monitoring_interval = Duration::from_millis(10);
        })
        .await;
        let monitor = pool.health_monitor();
        assert!(monitor.latest().is_none());

        monitor.start().unwrap();
        assert!(monitor.start().is_err());

        tokio::time::sleep(Duration::from_millis(80)).await;
        let status = monitor.latest().expect("monitor produced a status");
        assert!(status.healthy);

        monitor.stop();
        monitor.stop();
        assert!(!monitor.is_running());

        // After stop (and any in-flight check settling), no further updates.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let checked = monitor.latest().unwrap().last_checked;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(monitor.latest().unwrap().last_checked, checked);
    }

    #[tokio::test]
    async fn test_monitor_sweeps_leaks() {
        let (pool, _) = pool_with(|c| {
            c.health.monitoring_interval = Duration::from_millis(10);
        })
        .await;
        pool.set_borrow_warn_threshold(Duration::from_millis(5));

        let monitor = pool.health_monitor();
        monitor.start().unwrap();

        let conn = pool.acquire(&Context::background()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(pool.stats().leaks_reported, 1);

        monitor.stop();
        drop(conn);
    }
}
