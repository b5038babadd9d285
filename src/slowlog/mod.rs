// # Slow-Query Recorder
//
// Captures data-plane operations whose duration exceeds the configured
// threshold: fingerprints the query, sanitizes arguments when asked to, and
// hands the record to the configured storage (bounded memory ring, or an
// append-only JSON-lines file with rotation). Recording failures are logged
// and never fail the triggering operation.

mod analyzer;
mod fingerprint;
mod storage;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};

pub use self::analyzer::{AnalysisReport, AnalysisSummary, TimeSlot};
pub use self::fingerprint::normalize;
use self::storage::{FileStore, MemoryStore, SlowQueryStore};
use crate::config::{Endpoint, SlowQueryConfig};
use crate::driver::Value;
use crate::error::{DbError, Result};

const SANITIZE_MAX_STRING: usize = 50;
const PATTERN_EXAMPLES: usize = 3;

mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}

/// One captured slow query. Immutable once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlowQueryRecord {
    pub id: String,
    pub query: String,
    pub normalized_query: String,
    #[serde(with = "duration_nanos")]
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub database: String,
    pub user: String,
    pub host: String,
}

/// Aggregate statistics over every record sharing a fingerprint. Counters
/// only grow until `clear`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPattern {
    pub normalized_query: String,
    pub count: u64,
    pub total_duration: Duration,
    pub average_duration: Duration,
    pub max_duration: Duration,
    pub last_seen: DateTime<Utc>,
    /// Up to three original query texts.
    pub examples: Vec<String>,
}

impl QueryPattern {
    fn new(record: &SlowQueryRecord) -> Self {
        Self {
            normalized_query: record.normalized_query.clone(),
            count: 0,
            total_duration: Duration::ZERO,
            average_duration: Duration::ZERO,
            max_duration: Duration::ZERO,
            last_seen: record.timestamp,
            examples: Vec::new(),
        }
    }

    fn absorb(&mut self, record: &SlowQueryRecord) {
        self.count += 1;
        self.total_duration += record.duration;
        self.average_duration = self.total_duration / self.count as u32;
        self.max_duration = self.max_duration.max(record.duration);
        self.last_seen = self.last_seen.max(record.timestamp);
        if self.examples.len() < PATTERN_EXAMPLES && !self.examples.contains(&record.query) {
            self.examples.push(record.query.clone());
        }
    }
}

/// Criteria for `SlowQueryRecorder::records`.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub min_duration: Option<Duration>,
    pub max_duration: Option<Duration>,
    /// Substring match against the normalized query.
    pub pattern_substring: Option<String>,
    pub database: Option<String>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl RecordFilter {
    fn matches(&self, record: &SlowQueryRecord) -> bool {
        if let Some(start) = self.start_time {
            if record.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if record.timestamp > end {
                return false;
            }
        }
        if let Some(min) = self.min_duration {
            if record.duration < min {
                return false;
            }
        }
        if let Some(max) = self.max_duration {
            if record.duration > max {
                return false;
            }
        }
        if let Some(pattern) = &self.pattern_substring {
            if !record.normalized_query.contains(pattern.as_str()) {
                return false;
            }
        }
        if let Some(database) = &self.database {
            if &record.database != database {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TopQuery {
    pub normalized_query: String,
    pub count: u64,
}

/// Summary over currently stored records.
#[derive(Debug, Clone, Serialize)]
pub struct SlowQueryStats {
    pub total_count: usize,
    pub unique_queries: usize,
    pub average_duration: Duration,
    pub max_duration: Duration,
    pub min_duration: Duration,
    pub last_record_time: Option<DateTime<Utc>>,
    /// Top patterns by count, at most ten.
    pub top_queries: Vec<TopQuery>,
}

/// Callback invoked for every stored record, on the recording task. Must be
/// non-blocking.
pub trait SlowQueryHandler: Send + Sync {
    fn on_slow_query(&self, record: &SlowQueryRecord);
}

impl<F> SlowQueryHandler for F
where
    F: Fn(&SlowQueryRecord) + Send + Sync,
{
    fn on_slow_query(&self, record: &SlowQueryRecord) {
        self(record)
    }
}

/// Identity attached to each record.
#[derive(Debug, Clone, Default)]
pub struct RecordIdentity {
    pub database: String,
    pub user: String,
    pub host: String,
}

impl RecordIdentity {
    pub fn from_endpoint(endpoint: &Endpoint) -> Self {
        Self {
            database: endpoint.database.clone(),
            user: endpoint.username.clone(),
            host: format!("{}:{}", endpoint.host, endpoint.port),
        }
    }
}

pub struct SlowQueryRecorder {
    config: SlowQueryConfig,
    identity: RecordIdentity,
    store: Arc<dyn SlowQueryStore>,
    handler: RwLock<Option<Arc<dyn SlowQueryHandler>>>,
}

impl SlowQueryRecorder {
    pub fn new(config: SlowQueryConfig, identity: RecordIdentity) -> Result<Self> {
        config.validate()?;
        let store: Arc<dyn SlowQueryStore> = match &config.file {
            Some(file) => Arc::new(FileStore::open(
                &file.path,
                file.max_file_size,
                config.max_records,
                config.max_patterns,
            )?),
            None => Arc::new(MemoryStore::new(config.max_records, config.max_patterns)),
        };
        Ok(Self {
            config,
            identity,
            store,
            handler: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &SlowQueryConfig {
        &self.config
    }

    pub fn set_handler(&self, handler: Arc<dyn SlowQueryHandler>) {
        *self.handler.write() = Some(handler);
    }

    /// Record one data-plane operation. Filters by threshold; storage errors
    /// are swallowed after a warning.
    pub fn observe(
        &self,
        query: &str,
        args: &[Value],
        duration: Duration,
        error: Option<&DbError>,
    ) {
        if !self.config.enabled || duration <= self.config.threshold {
            return;
        }

        let record = self.build_record(query, args, duration, error);
        if let Err(e) = self.store.append(&record) {
            tracing::warn!(error = %e, "failed to store slow query record");
            return;
        }
        if let Some(handler) = self.handler.read().clone() {
            if catch_unwind(AssertUnwindSafe(|| handler.on_slow_query(&record))).is_err() {
                tracing::warn!(record_id = %record.id, "slow query handler panicked");
            }
        }
    }

    fn build_record(
        &self,
        query: &str,
        args: &[Value],
        duration: Duration,
        error: Option<&DbError>,
    ) -> SlowQueryRecord {
        let args = if self.config.sanitize_args {
            args.iter().map(sanitize_arg).collect()
        } else {
            args.iter().map(Value::to_json).collect()
        };
        SlowQueryRecord {
            id: random_id(),
            query: query.to_string(),
            normalized_query: normalize(query, self.config.normalization),
            duration,
            timestamp: Utc::now(),
            args,
            error: error.map(|e| e.to_string()),
            stack: self
                .config
                .include_stack
                .then(|| std::backtrace::Backtrace::force_capture().to_string()),
            database: self.identity.database.clone(),
            user: self.identity.user.clone(),
            host: self.identity.host.clone(),
        }
    }

    /// Stored records matching `filter`, newest first.
    pub fn records(&self, filter: &RecordFilter) -> Vec<SlowQueryRecord> {
        let mut records: Vec<SlowQueryRecord> = self
            .store
            .records()
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        let records = records.into_iter().skip(filter.offset);
        match filter.limit {
            Some(limit) => records.take(limit).collect(),
            None => records.collect(),
        }
    }

    pub fn stats(&self) -> SlowQueryStats {
        let records = self.store.records();
        let total_count = records.len();
        let mut unique = std::collections::HashSet::new();
        let mut total = Duration::ZERO;
        let mut max = Duration::ZERO;
        let mut min = Duration::MAX;
        let mut last: Option<DateTime<Utc>> = None;
        for record in &records {
            unique.insert(record.normalized_query.as_str());
            total += record.duration;
            max = max.max(record.duration);
            min = min.min(record.duration);
            last = Some(match last {
                Some(t) => t.max(record.timestamp),
                None => record.timestamp,
            });
        }
        let mut top: Vec<TopQuery> = self
            .store
            .patterns()
            .into_iter()
            .map(|p| TopQuery {
                normalized_query: p.normalized_query,
                count: p.count,
            })
            .collect();
        top.sort_by(|a, b| b.count.cmp(&a.count));
        top.truncate(10);

        SlowQueryStats {
            total_count,
            unique_queries: unique.len(),
            average_duration: if total_count == 0 {
                Duration::ZERO
            } else {
                total / total_count as u32
            },
            max_duration: max,
            min_duration: if total_count == 0 { Duration::ZERO } else { min },
            last_record_time: last,
            top_queries: top,
        }
    }

    /// Patterns sorted by count, descending.
    pub fn patterns(&self, limit: usize) -> Vec<QueryPattern> {
        let mut patterns = self.store.patterns();
        patterns.sort_by(|a, b| b.count.cmp(&a.count));
        patterns.truncate(limit);
        patterns
    }

    /// Drop every stored record; for file storage this truncates the log.
    pub fn clear(&self) -> Result<()> {
        self.store.clear()
    }

    /// Analyze the records matching `filter` (offset/limit are ignored).
    pub fn analyze(&self, filter: &RecordFilter) -> AnalysisReport {
        let records: Vec<SlowQueryRecord> = self
            .store
            .records()
            .into_iter()
            .filter(|r| filter.matches(r))
            .collect();
        analyzer::analyze(&records)
    }
}

fn random_id() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    hex::encode(bytes)
}

fn sanitize_arg(value: &Value) -> serde_json::Value {
    let text = match value {
        Value::Text(s) => {
            if s.chars().count() > SANITIZE_MAX_STRING {
                s.chars().take(SANITIZE_MAX_STRING).collect()
            } else {
                "[string]".to_string()
            }
        }
        Value::Bytes(b) => format!("[bytes:{}]", b.len()),
        other => format!("[{}]", other.type_label()),
    };
    serde_json::Value::String(text)
}
