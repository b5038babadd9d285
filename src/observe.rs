// # Observability Hooks
//
// Leaf interfaces the runtime emits events through. Exporters (statsd,
// Prometheus, ...) plug in behind `MetricsSink`; leak reports go through
// `LeakHandler`. Handler invocations run synchronously on the triggering
// task and are panic-caught, so implementations must be non-blocking or
// offload to their own queue.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

/// Counter / histogram / gauge sink. Implementations must be cheap; they run
/// inline on the data plane.
pub trait MetricsSink: Send + Sync {
    fn inc_counter(&self, name: &str, value: u64);

    fn observe_histogram(&self, name: &str, value: f64);

    fn add_up_down(&self, name: &str, delta: i64);
}

/// Discards everything. The default sink.
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn inc_counter(&self, _name: &str, _value: u64) {}

    fn observe_histogram(&self, _name: &str, _value: f64) {}

    fn add_up_down(&self, _name: &str, _delta: i64) {}
}

/// In-memory sink for tests and for exporters that scrape on an interval.
#[derive(Debug, Default)]
pub struct MemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    histograms: Mutex<HashMap<String, Vec<f64>>>,
    gauges: Mutex<HashMap<String, i64>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn histogram(&self, name: &str) -> Vec<f64> {
        self.histograms.lock().get(name).cloned().unwrap_or_default()
    }

    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges.lock().get(name).copied().unwrap_or(0)
    }
}

impl MetricsSink for MemoryMetrics {
    fn inc_counter(&self, name: &str, value: u64) {
        *self.counters.lock().entry(name.to_string()).or_insert(0) += value;
    }

    fn observe_histogram(&self, name: &str, value: f64) {
        self.histograms
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    fn add_up_down(&self, name: &str, delta: i64) {
        *self.gauges.lock().entry(name.to_string()).or_insert(0) += delta;
    }
}

/// A borrow held past the configured warning threshold.
#[derive(Debug, Clone)]
pub struct LeakEvent {
    pub connection_id: u64,
    pub held_for: Duration,
    pub acquired_at: SystemTime,
}

pub trait LeakHandler: Send + Sync {
    fn on_leak(&self, event: &LeakEvent);
}

impl<F> LeakHandler for F
where
    F: Fn(&LeakEvent) + Send + Sync,
{
    fn on_leak(&self, event: &LeakEvent) {
        self(event)
    }
}

/// Invoke a leak handler, catching panics so a misbehaving handler cannot
/// take down the data plane.
pub(crate) fn dispatch_leak(handler: &dyn LeakHandler, event: &LeakEvent) {
    if catch_unwind(AssertUnwindSafe(|| handler.on_leak(event))).is_err() {
        tracing::warn!(
            connection_id = event.connection_id,
            held_for = ?event.held_for,
            "leak handler panicked"
        );
    }
}

// Metric names emitted by the runtime.
pub mod metric {
    pub const POOL_ACQUIRES: &str = "pool.acquires";
    pub const POOL_ACQUIRE_FAILURES: &str = "pool.acquire_failures";
    pub const POOL_RELEASES: &str = "pool.releases";
    pub const POOL_LEAKS: &str = "pool.leaks";
    pub const POOL_IN_USE: &str = "pool.in_use";
    pub const POOL_ACQUIRE_WAIT_MS: &str = "pool.acquire_wait_ms";
    pub const CONN_HELD_MS: &str = "pool.conn_held_ms";
    pub const OP_EXEC: &str = "db.exec";
    pub const OP_QUERY: &str = "db.query";
    pub const OP_ERRORS: &str = "db.errors";
    pub const OP_DURATION_MS: &str = "db.op_duration_ms";
    pub const TX_COMMITS: &str = "db.tx_commits";
    pub const TX_ROLLBACKS: &str = "db.tx_rollbacks";
    pub const TX_RETRIES: &str = "db.tx_retries";
}
