// # Pool Counters
//
// Atomic counters maintained by the pool and surfaced as a `PoolStats`
// snapshot. Counters are monotonic; gauges (open/idle/in-use) are computed
// at snapshot time from pool state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    total_acquires: AtomicU64,
    failed_acquires: AtomicU64,
    releases: AtomicU64,
    connections_created: AtomicU64,
    connections_closed: AtomicU64,
    leaks_reported: AtomicU64,
    acquire_wait_nanos: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn record_acquire(&self, waited: Duration) {
        self.total_acquires.fetch_add(1, Ordering::Relaxed);
        self.acquire_wait_nanos
            .fetch_add(waited.as_nanos() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_acquire_failure(&self) {
        self.failed_acquires.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_leak(&self) {
        self.leaks_reported.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn total_acquires(&self) -> u64 {
        self.total_acquires.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(
        &self,
        open: usize,
        idle: usize,
        in_use: usize,
        max_open: usize,
        max_idle: usize,
    ) -> PoolStats {
        let total_acquires = self.total_acquires.load(Ordering::Relaxed);
        let wait_nanos = self.acquire_wait_nanos.load(Ordering::Relaxed);
        PoolStats {
            open,
            idle,
            in_use,
            max_open,
            max_idle,
            total_acquires,
            failed_acquires: self.failed_acquires.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            leaks_reported: self.leaks_reported.load(Ordering::Relaxed),
            average_acquire_wait: if total_acquires == 0 {
                Duration::ZERO
            } else {
                Duration::from_nanos(wait_nanos / total_acquires)
            },
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub open: usize,
    pub idle: usize,
    pub in_use: usize,
    pub max_open: usize,
    pub max_idle: usize,
    pub total_acquires: u64,
    pub failed_acquires: u64,
    pub releases: u64,
    pub connections_created: u64,
    pub connections_closed: u64,
    pub leaks_reported: u64,
    pub average_acquire_wait: Duration,
}

impl PoolStats {
    /// Fraction of capacity currently borrowed.
    pub fn utilization(&self) -> f64 {
        if self.max_open == 0 {
            return 0.0;
        }
        self.in_use as f64 / self.max_open as f64
    }
}
