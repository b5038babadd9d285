// # Connection Pool Module
//
// Pooled access to driver connections:
//
// - `connection_pool`: the pool engine — bounded open/idle sets, blocking
//   context-aware acquire, lifetime culling, leak detection, resizing
// - `pooled_connection`: the borrow — exclusive ownership of one driver
//   connection, with the data-plane operation surface and observability
//   fan-out
// - `statement_cache`: per-borrow LRU of prepared statements
// - `pool_metrics`: atomic counters and the `PoolStats` snapshot

pub mod connection_pool;
pub mod pool_metrics;
pub mod pooled_connection;
pub mod statement_cache;

pub use connection_pool::ConnectionPool;
pub use pool_metrics::PoolStats;
pub use pooled_connection::PooledConn;
pub use statement_cache::{StatementCache, StatementCacheStats};
