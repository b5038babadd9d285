// # Connection Pool Engine
//
// Owns the set of driver connections: bounded open/idle sets, blocking
// acquire that honors the caller's context, lifetime and idle-time culling,
// leak detection on the release path and via the monitor sweep, runtime
// resizing, and optional database auto-creation at construction.
//
// Locking layout:
// - `state` (idle queue + open count) is a parking_lot mutex, never held
//   across an await point
// - `borrowed` is a DashMap keyed by connection id
// - counters are atomics; metric sinks are invoked after locks are dropped

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;

use super::pool_metrics::{PoolCounters, PoolStats};
use super::pooled_connection::PooledConn;
use super::statement_cache::StatementCache;
use crate::config::DbConfig;
use crate::context::Context;
use crate::driver::{lookup_driver, BoxDriverConnection, Driver};
use crate::dsn::DsnBuilder;
use crate::error::{DbError, Result};
use crate::observe::{dispatch_leak, metric, LeakEvent, LeakHandler, MetricsSink, NoopMetrics};
use crate::slowlog::{RecordIdentity, SlowQueryRecorder};

/// Waiters re-check pool state at least this often, covering the window
/// between a capacity check and wakeup registration.
const WAIT_RECHECK: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy)]
struct Sizing {
    max_open: usize,
    max_idle: usize,
}

struct IdleEntry {
    conn: BoxDriverConnection,
    id: u64,
    created_at: Instant,
    idle_since: Instant,
}

struct PoolState {
    idle: VecDeque<IdleEntry>,
    /// Connections that exist or are being created (idle + borrowed +
    /// in-flight connects).
    open: usize,
    closed: bool,
}

pub(super) struct BorrowedEntry {
    acquired_at: Instant,
    acquired_wall: SystemTime,
    leak_reported: AtomicBool,
}

pub(crate) struct PoolInner {
    pub(crate) config: DbConfig,
    driver: Arc<dyn Driver>,
    sizing: Mutex<Sizing>,
    state: Mutex<PoolState>,
    notify: Notify,
    borrowed: DashMap<u64, BorrowedEntry>,
    next_conn_id: AtomicU64,
    pub(crate) counters: PoolCounters,
    metrics: RwLock<Arc<dyn MetricsSink>>,
    pub(crate) recorder: Option<Arc<SlowQueryRecorder>>,
    leak_threshold: RwLock<Option<Duration>>,
    leak_handler: RwLock<Option<Arc<dyn LeakHandler>>>,
    dsn: String,
}

enum AcquirePlan {
    Reuse(IdleEntry),
    /// An idle entry found expired under the lock; `open` was already
    /// decremented, the connection still needs closing.
    Discard(IdleEntry),
    Create,
    Wait,
}

impl PoolInner {
    pub(crate) fn metrics_sink(&self) -> Arc<dyn MetricsSink> {
        self.metrics.read().clone()
    }

    fn sizing(&self) -> Sizing {
        *self.sizing.lock()
    }

    fn lifetime_expired(&self, created_at: Instant) -> bool {
        let lifetime = self.config.pool.conn_max_lifetime;
        !lifetime.is_zero() && created_at.elapsed() > lifetime
    }

    fn idle_expired(&self, idle_since: Instant) -> bool {
        let max_idle_time = self.config.pool.conn_max_idle_time;
        !max_idle_time.is_zero() && idle_since.elapsed() > max_idle_time
    }

    async fn discard(&self, mut entry: IdleEntry) {
        if let Err(e) = entry.conn.close().await {
            tracing::warn!(connection_id = entry.id, error = %e, "error closing connection");
        }
        self.counters.record_connection_closed();
        self.notify.notify_one();
    }

    fn register_borrow(&self, id: u64) {
        self.borrowed.insert(
            id,
            BorrowedEntry {
                acquired_at: Instant::now(),
                acquired_wall: SystemTime::now(),
                leak_reported: AtomicBool::new(false),
            },
        );
    }

    fn report_leak_if_due(&self, id: u64, entry: &BorrowedEntry, held: Duration) {
        let Some(threshold) = *self.leak_threshold.read() else {
            return;
        };
        if held <= threshold || entry.leak_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        self.counters.record_leak();
        tracing::warn!(
            connection_id = id,
            held_for = ?held,
            threshold = ?threshold,
            "borrow held past warning threshold"
        );
        if self.config.observability.metrics {
            self.metrics_sink().inc_counter(metric::POOL_LEAKS, 1);
        }
        if let Some(handler) = self.leak_handler.read().clone() {
            let event = LeakEvent {
                connection_id: id,
                held_for: held,
                acquired_at: entry.acquired_wall,
            };
            dispatch_leak(handler.as_ref(), &event);
        }
    }

    /// Report every over-threshold borrow once. Driven by the health
    /// monitor's tick.
    pub(crate) fn sweep_leaks(&self) {
        for item in self.borrowed.iter() {
            let held = item.value().acquired_at.elapsed();
            self.report_leak_if_due(*item.key(), item.value(), held);
        }
    }

    /// Return a borrowed connection to the pool; used by release and by the
    /// borrow's Drop safety net. A dirty connection (unterminated
    /// transaction) is closed instead of idling.
    pub(super) async fn restore(
        &self,
        id: u64,
        conn: BoxDriverConnection,
        created_at: Instant,
        acquired_at: Instant,
        dirty: bool,
    ) {
        let held = acquired_at.elapsed();
        if let Some((_, entry)) = self.borrowed.remove(&id) {
            self.report_leak_if_due(id, &entry, held);
        }
        self.counters.record_release();

        let mut to_close = Some(conn);
        {
            let sizing = self.sizing();
            let mut state = self.state.lock();
            let keep = !state.closed
                && !dirty
                && !self.lifetime_expired(created_at)
                && state.idle.len() < sizing.max_idle
                && state.open <= sizing.max_open;
            if keep {
                state.idle.push_back(IdleEntry {
                    conn: to_close.take().expect("connection present"),
                    id,
                    created_at,
                    idle_since: Instant::now(),
                });
            } else {
                state.open -= 1;
            }
        }
        if let Some(mut conn) = to_close {
            if let Err(e) = conn.close().await {
                tracing::warn!(connection_id = id, error = %e, "error closing connection");
            }
            self.counters.record_connection_closed();
        }
        self.notify.notify_one();

        // Sinks run strictly after pool state is settled so an exporter can
        // never re-enter pool locks mid-release.
        if self.config.observability.metrics {
            let sink = self.metrics_sink();
            sink.inc_counter(metric::POOL_RELEASES, 1);
            sink.add_up_down(metric::POOL_IN_USE, -1);
            sink.observe_histogram(metric::CONN_HELD_MS, held.as_secs_f64() * 1000.0);
        }
    }

    /// Synchronous fallback when a borrow is dropped outside the runtime:
    /// the connection is lost, but capacity is reclaimed.
    pub(super) fn forget(&self, id: u64) {
        self.borrowed.remove(&id);
        self.counters.record_release();
        self.counters.record_connection_closed();
        self.state.lock().open -= 1;
        self.notify.notify_one();
    }
}

/// A pool of driver connections. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct ConnectionPool {
    pub(crate) inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Construct a pool for `config`, resolving the driver from the process
    /// registry.
    pub async fn connect(config: DbConfig) -> Result<ConnectionPool> {
        let driver = lookup_driver(&config.driver)?;
        Self::connect_with_driver(config, driver).await
    }

    /// Construct a pool around an explicit driver instance (tests, embedded
    /// drivers).
    pub async fn connect_with_driver(
        config: DbConfig,
        driver: Arc<dyn Driver>,
    ) -> Result<ConnectionPool> {
        config.validate()?;

        if config.auto_create_database && !config.endpoint.database.is_empty() {
            ensure_database(driver.as_ref(), &config).await?;
        }

        let recorder = if config.slow_query.enabled {
            Some(Arc::new(SlowQueryRecorder::new(
                config.slow_query.clone(),
                RecordIdentity::from_endpoint(&config.endpoint),
            )?))
        } else {
            None
        };

        let dsn = DsnBuilder::from_endpoint(&config.endpoint)
            .build()
            .unwrap_or_else(|_| {
                format!(
                    "tcp({}:{})/{}",
                    config.endpoint.host, config.endpoint.port, config.endpoint.database
                )
            });

        let sizing = Sizing {
            max_open: config.pool.max_open,
            max_idle: config.pool.max_idle,
        };
        tracing::info!(
            driver = %config.driver,
            host = %config.endpoint.host,
            database = %config.endpoint.database,
            max_open = sizing.max_open,
            max_idle = sizing.max_idle,
            "connection pool initialized"
        );

        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                driver,
                sizing: Mutex::new(sizing),
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    open: 0,
                    closed: false,
                }),
                notify: Notify::new(),
                borrowed: DashMap::new(),
                next_conn_id: AtomicU64::new(0),
                counters: PoolCounters::default(),
                metrics: RwLock::new(Arc::new(NoopMetrics)),
                recorder,
                leak_threshold: RwLock::new(None),
                leak_handler: RwLock::new(None),
                dsn,
            }),
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.inner.config
    }

    /// The DSN this pool was constructed from.
    pub fn dsn(&self) -> &str {
        &self.inner.dsn
    }

    pub fn recorder(&self) -> Option<Arc<SlowQueryRecorder>> {
        self.inner.recorder.clone()
    }

    pub fn set_metrics_sink(&self, sink: Arc<dyn MetricsSink>) {
        *self.inner.metrics.write() = sink;
    }

    /// Borrows held longer than `threshold` are reported through the leak
    /// handler.
    pub fn set_borrow_warn_threshold(&self, threshold: Duration) {
        *self.inner.leak_threshold.write() = Some(threshold);
    }

    pub fn clear_borrow_warn_threshold(&self) {
        *self.inner.leak_threshold.write() = None;
    }

    pub fn set_leak_handler(&self, handler: Arc<dyn LeakHandler>) {
        *self.inner.leak_handler.write() = Some(handler);
    }

    /// Borrow a connection, blocking while the pool is saturated. Honors the
    /// context's deadline and cancellation.
    pub async fn acquire(&self, ctx: &Context) -> Result<PooledConn> {
        let wait_started = Instant::now();
        loop {
            if let Some(e) = ctx.err() {
                self.inner.counters.record_acquire_failure();
                return Err(e);
            }

            let notified = self.inner.notify.notified();
            tokio::pin!(notified);

            let plan = {
                let sizing = self.inner.sizing();
                let mut state = self.inner.state.lock();
                if state.closed {
                    drop(state);
                    self.inner.counters.record_acquire_failure();
                    return Err(DbError::ConnectionClosed);
                }
                match state.idle.pop_front() {
                    Some(entry) => {
                        if self.inner.lifetime_expired(entry.created_at)
                            || self.inner.idle_expired(entry.idle_since)
                        {
                            state.open -= 1;
                            // Close outside the lock.
                            AcquirePlan::Discard(entry)
                        } else {
                            AcquirePlan::Reuse(entry)
                        }
                    }
                    None => {
                        if state.open < sizing.max_open {
                            state.open += 1;
                            AcquirePlan::Create
                        } else {
                            AcquirePlan::Wait
                        }
                    }
                }
            };

            match plan {
                AcquirePlan::Reuse(entry) => {
                    return Ok(self.finish_acquire(entry, wait_started));
                }
                AcquirePlan::Discard(entry) => {
                    self.inner.discard(entry).await;
                    continue;
                }
                AcquirePlan::Create => match ctx
                    .run(self.inner.driver.connect(&self.inner.config.endpoint))
                    .await
                {
                    Ok(conn) => {
                        self.inner.counters.record_connection_created();
                        let id = self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
                        let entry = IdleEntry {
                            conn,
                            id,
                            created_at: Instant::now(),
                            idle_since: Instant::now(),
                        };
                        return Ok(self.finish_acquire(entry, wait_started));
                    }
                    Err(e) => {
                        self.inner.state.lock().open -= 1;
                        self.inner.notify.notify_one();
                        self.inner.counters.record_acquire_failure();
                        return Err(e);
                    }
                },
                AcquirePlan::Wait => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep(WAIT_RECHECK) => {}
                        _ = ctx.done() => {
                            self.inner.counters.record_acquire_failure();
                            return Err(DbError::PoolExhausted(format!(
                                "no connection became available within {:?}",
                                wait_started.elapsed()
                            )));
                        }
                    }
                }
            }
        }
    }

    fn finish_acquire(&self, entry: IdleEntry, wait_started: Instant) -> PooledConn {
        let waited = wait_started.elapsed();
        self.inner.counters.record_acquire(waited);
        self.inner.register_borrow(entry.id);

        if self.inner.config.observability.metrics {
            let sink = self.inner.metrics_sink();
            sink.inc_counter(metric::POOL_ACQUIRES, 1);
            sink.add_up_down(metric::POOL_IN_USE, 1);
            sink.observe_histogram(metric::POOL_ACQUIRE_WAIT_MS, waited.as_secs_f64() * 1000.0);
        }

        let cache_size = self.inner.config.pool.statement_cache_size;
        PooledConn {
            conn: Some(entry.conn),
            pool: self.inner.clone(),
            id: entry.id,
            created_at: entry.created_at,
            acquired_at: Instant::now(),
            cache: (cache_size > 0).then(|| StatementCache::new(cache_size)),
            tx_open: false,
        }
    }

    /// Acquire, run `f`, and release exactly once regardless of the outcome.
    pub async fn with_conn<T, F>(&self, ctx: &Context, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(
            &'c mut PooledConn,
            &'c Context,
        ) -> futures::future::BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.acquire(ctx).await?;
        let result = f(&mut conn, ctx).await;
        if let Err(e) = conn.release().await {
            tracing::warn!(error = %e, "release after with_conn failed");
        }
        result
    }

    /// Change the pool bounds at runtime. Excess idle connections are closed
    /// immediately; excess borrowed connections are closed as they come back.
    pub async fn resize(&self, max_open: usize, max_idle: usize) -> Result<()> {
        if max_open == 0 {
            return Err(DbError::Configuration("max_open must be > 0".into()));
        }
        if max_idle > max_open {
            return Err(DbError::Configuration(format!(
                "max_idle ({max_idle}) must not exceed max_open ({max_open})"
            )));
        }

        let excess: Vec<IdleEntry> = {
            let mut sizing = self.inner.sizing.lock();
            *sizing = Sizing { max_open, max_idle };
            let mut state = self.inner.state.lock();
            let mut excess = Vec::new();
            while state.idle.len() > max_idle
                || (state.open > max_open && !state.idle.is_empty())
            {
                let entry = state.idle.pop_front().expect("idle entry present");
                state.open -= 1;
                excess.push(entry);
            }
            excess
        };
        for entry in excess {
            self.inner.discard(entry).await;
        }
        self.inner.notify.notify_waiters();
        tracing::info!(max_open, max_idle, "pool resized");
        Ok(())
    }

    /// Shrink `max_open` by `n`. Fails when the reduction would leave no
    /// capacity.
    pub async fn scale_down(&self, n: usize) -> Result<()> {
        let current = self.inner.sizing();
        let new_max = current
            .max_open
            .checked_sub(n)
            .filter(|m| *m > 0)
            .ok_or_else(|| {
                DbError::Configuration(format!(
                    "scaling down by {n} from {} would empty the pool",
                    current.max_open
                ))
            })?;
        self.resize(new_max, current.max_idle.min(new_max)).await
    }

    pub fn stats(&self) -> PoolStats {
        let sizing = self.inner.sizing();
        let (open, idle) = {
            let state = self.inner.state.lock();
            (state.open, state.idle.len())
        };
        self.inner.counters.snapshot(
            open,
            idle,
            self.inner.borrowed.len(),
            sizing.max_open,
            sizing.max_idle,
        )
    }

    /// Report over-threshold borrows now, without waiting for the monitor.
    pub fn sweep_leaks(&self) {
        self.inner.sweep_leaks();
    }

    /// Close the pool: drain idle connections and reject further acquires.
    /// Borrowed connections are closed as they are released.
    pub async fn close(&self) {
        let drained: Vec<IdleEntry> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let drained: Vec<IdleEntry> = state.idle.drain(..).collect();
            state.open -= drained.len();
            drained
        };
        for mut entry in drained {
            if let Err(e) = entry.conn.close().await {
                tracing::warn!(connection_id = entry.id, error = %e, "error closing connection");
            }
            self.inner.counters.record_connection_closed();
        }
        self.inner.notify.notify_waiters();
        tracing::info!("connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

async fn ensure_database(driver: &dyn Driver, config: &DbConfig) -> Result<()> {
    let mut bootstrap = driver
        .connect(&config.endpoint.without_database())
        .await?;
    let result = bootstrap
        .exec(
            &format!(
                "CREATE DATABASE IF NOT EXISTS `{}`",
                config.endpoint.database
            ),
            &[],
        )
        .await;
    if let Err(e) = bootstrap.close().await {
        tracing::warn!(error = %e, "error closing bootstrap connection");
    }
    result.map(|_| ()).map_err(|e| {
        DbError::Configuration(format!(
            "auto-creating database {:?} failed: {e}",
            config.endpoint.database
        ))
    })
}
