// # Per-Connection Prepared-Statement Cache
//
// Access-ordered map from query text to prepared-statement handle, bounded
// by capacity. The cache is owned by a single borrow and is therefore
// single-writer; the lock only keeps hit lookups consistent with a
// concurrent mid-prepare access. Preparing happens outside the lock, with a
// re-check for a racing insertion on completion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::driver::{DriverConnection, StatementId};
use crate::error::Result;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatementCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
    pub capacity: usize,
}

struct CacheInner {
    entries: HashMap<String, StatementId>,
    /// Front = most recently used.
    order: Vec<String>,
}

impl CacheInner {
    fn promote(&mut self, sql: &str) {
        if let Some(position) = self.order.iter().position(|s| s == sql) {
            let key = self.order.remove(position);
            self.order.insert(0, key);
        }
    }
}

enum InsertOutcome {
    /// The statement went in; the LRU entry fell out.
    Inserted { evicted: Option<StatementId> },
    /// Another prepare for the same text won the race.
    Raced { winner: StatementId },
}

pub struct StatementCache {
    inner: Mutex<CacheInner>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: Vec::new(),
            }),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn lookup(&self, sql: &str) -> Option<StatementId> {
        let mut inner = self.inner.lock();
        let id = inner.entries.get(sql).copied()?;
        inner.promote(sql);
        Some(id)
    }

    fn insert(&self, sql: &str, id: StatementId) -> InsertOutcome {
        let mut inner = self.inner.lock();
        if let Some(winner) = inner.entries.get(sql).copied() {
            return InsertOutcome::Raced { winner };
        }
        inner.entries.insert(sql.to_string(), id);
        inner.order.insert(0, sql.to_string());
        let evicted = if inner.entries.len() > self.capacity {
            inner.order.pop().map(|key| {
                inner
                    .entries
                    .remove(&key)
                    .expect("LRU order out of sync with entries")
            })
        } else {
            None
        };
        InsertOutcome::Inserted { evicted }
    }

    /// Return the cached handle for `sql`, preparing and caching it on miss.
    /// Exactly one of the hit/miss counters is incremented per call.
    pub async fn get_or_prepare(
        &self,
        conn: &mut dyn DriverConnection,
        sql: &str,
    ) -> Result<StatementId> {
        if let Some(id) = self.lookup(sql) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(id);
        }

        // Prepare outside the lock; the driver round-trip must not hold it.
        let prepared = conn.prepare(sql).await?;

        match self.insert(sql, prepared) {
            InsertOutcome::Raced { winner } => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = conn.close_statement(prepared).await {
                    tracing::warn!(error = %e, "failed to close raced statement");
                }
                Ok(winner)
            }
            InsertOutcome::Inserted { evicted } => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                if let Some(old) = evicted {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                    if let Err(e) = conn.close_statement(old).await {
                        tracing::warn!(error = %e, "failed to close evicted statement");
                    }
                }
                Ok(prepared)
            }
        }
    }

    /// Close every cached handle exactly once and empty the cache. Called on
    /// borrow release and on pool shutdown.
    pub async fn close_all(&self, conn: &mut dyn DriverConnection) {
        let handles: Vec<StatementId> = {
            let mut inner = self.inner.lock();
            inner.order.clear();
            inner.entries.drain().map(|(_, id)| id).collect()
        };
        for id in handles {
            if let Err(e) = conn.close_statement(id).await {
                tracing::warn!(error = %e, "failed to close cached statement");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StatementCacheStats {
        StatementCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self.len(),
            capacity: self.capacity,
        }
    }
}
