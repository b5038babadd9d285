// # Slow-Query Storage
//
// Two backings share one interface: a bounded in-memory ring with an
// in-place pattern map, and an append-only JSON-lines file that mirrors the
// ring and rotates once it outgrows its size budget. The file lock is held
// only for the append; rotation briefly holds it exclusively.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};

use super::{QueryPattern, SlowQueryRecord};
use crate::error::{DbError, Result};

/// Records kept in memory after a file rotation.
const ROTATION_KEEP: usize = 1000;

pub(super) trait SlowQueryStore: Send + Sync {
    fn append(&self, record: &SlowQueryRecord) -> Result<()>;

    fn records(&self) -> Vec<SlowQueryRecord>;

    fn patterns(&self) -> Vec<QueryPattern>;

    fn clear(&self) -> Result<()>;
}

struct MemoryInner {
    ring: VecDeque<SlowQueryRecord>,
    patterns: HashMap<String, QueryPattern>,
}

pub(super) struct MemoryStore {
    inner: RwLock<MemoryInner>,
    max_records: usize,
    max_patterns: usize,
}

impl MemoryStore {
    pub(super) fn new(max_records: usize, max_patterns: usize) -> Self {
        Self {
            inner: RwLock::new(MemoryInner {
                ring: VecDeque::new(),
                patterns: HashMap::new(),
            }),
            max_records,
            max_patterns,
        }
    }

    fn push(&self, record: SlowQueryRecord) {
        let mut inner = self.inner.write();
        absorb_into(&mut inner.patterns, &record, self.max_patterns);
        inner.ring.push_back(record);
        while inner.ring.len() > self.max_records {
            inner.ring.pop_front();
        }
    }

    /// Keep only the newest `keep` records and rebuild the pattern map from
    /// what is left. Used after file rotation.
    fn truncate_to(&self, keep: usize) {
        let mut inner = self.inner.write();
        while inner.ring.len() > keep {
            inner.ring.pop_front();
        }
        inner.patterns.clear();
        let records: Vec<SlowQueryRecord> = inner.ring.iter().cloned().collect();
        for record in &records {
            absorb_into(&mut inner.patterns, record, self.max_patterns);
        }
    }
}

fn absorb_into(
    patterns: &mut HashMap<String, QueryPattern>,
    record: &SlowQueryRecord,
    max_patterns: usize,
) {
    if let Some(pattern) = patterns.get_mut(&record.normalized_query) {
        pattern.absorb(record);
        return;
    }
    if patterns.len() >= max_patterns {
        return;
    }
    let mut pattern = QueryPattern::new(record);
    pattern.absorb(record);
    patterns.insert(record.normalized_query.clone(), pattern);
}

impl SlowQueryStore for MemoryStore {
    fn append(&self, record: &SlowQueryRecord) -> Result<()> {
        self.push(record.clone());
        Ok(())
    }

    fn records(&self) -> Vec<SlowQueryRecord> {
        self.inner.read().ring.iter().cloned().collect()
    }

    fn patterns(&self) -> Vec<QueryPattern> {
        self.inner.read().patterns.values().cloned().collect()
    }

    fn clear(&self) -> Result<()> {
        let mut inner = self.inner.write();
        inner.ring.clear();
        inner.patterns.clear();
        Ok(())
    }
}

pub(super) struct FileStore {
    memory: MemoryStore,
    path: PathBuf,
    max_file_size: u64,
    file: Mutex<File>,
}

impl FileStore {
    /// Open (or create) the log file, replaying existing lines into memory.
    /// Malformed lines are skipped silently.
    pub(super) fn open(
        path: &Path,
        max_file_size: u64,
        max_records: usize,
        max_patterns: usize,
    ) -> Result<Self> {
        let memory = MemoryStore::new(max_records, max_patterns);
        if path.exists() {
            let reader = BufReader::new(File::open(path)?);
            for line in reader.lines() {
                let line = line?;
                if let Ok(record) = serde_json::from_str::<SlowQueryRecord>(&line) {
                    memory.push(record);
                }
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            memory,
            path: path.to_path_buf(),
            max_file_size,
            file: Mutex::new(file),
        })
    }

    fn rotated_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".old");
        PathBuf::from(name)
    }

    fn rotate(&self, file: &mut File) -> Result<()> {
        file.flush()?;
        std::fs::rename(&self.path, self.rotated_path())?;
        *file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.memory.truncate_to(ROTATION_KEEP);
        tracing::info!(path = %self.path.display(), "rotated slow query log");
        Ok(())
    }
}

impl SlowQueryStore for FileStore {
    fn append(&self, record: &SlowQueryRecord) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| DbError::SlowQueryStorage(e.to_string()))?;
        {
            let mut file = self.file.lock();
            writeln!(file, "{line}").map_err(|e| DbError::SlowQueryStorage(e.to_string()))?;
            let size = file
                .metadata()
                .map_err(|e| DbError::SlowQueryStorage(e.to_string()))?
                .len();
            if size > self.max_file_size {
                self.rotate(&mut file)
                    .map_err(|e| DbError::SlowQueryStorage(e.to_string()))?;
            }
        }
        self.memory.push(record.clone());
        Ok(())
    }

    fn records(&self) -> Vec<SlowQueryRecord> {
        self.memory.records()
    }

    fn patterns(&self) -> Vec<QueryPattern> {
        self.memory.patterns()
    }

    fn clear(&self) -> Result<()> {
        let file = self.file.lock();
        file.set_len(0)
            .map_err(|e| DbError::SlowQueryStorage(e.to_string()))?;
        drop(file);
        self.memory.clear()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use super::*;

    fn record(query: &str, normalized: &str, ms: u64) -> SlowQueryRecord {
        SlowQueryRecord {
            id: "0011223344556677".into(),
            query: query.to_string(),
            normalized_query: normalized.to_string(),
            duration: Duration::from_millis(ms),
            timestamp: Utc::now(),
            args: Vec::new(),
            error: None,
            stack: None,
            database: "test".into(),
            user: "root".into(),
            host: "localhost:3306".into(),
        }
    }

    #[test]
    fn test_ring_discards_oldest() {
        let store = MemoryStore::new(3, 10);
        for i in 0..5 {
            store
                .append(&record(&format!("SELECT {i}"), "SELECT ?", 100))
                .unwrap();
        }
        let records = store.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].query, "SELECT 2");
    }

    #[test]
    fn test_pattern_cap() {
        let store = MemoryStore::new(100, 2);
        store.append(&record("a", "A", 1)).unwrap();
        store.append(&record("b", "B", 1)).unwrap();
        store.append(&record("c", "C", 1)).unwrap();
        store.append(&record("a2", "A", 1)).unwrap();
        let patterns = store.patterns();
        assert_eq!(patterns.len(), 2);
        let a = patterns.iter().find(|p| p.normalized_query == "A").unwrap();
        assert_eq!(a.count, 2);
    }

    #[test]
    fn test_file_store_replays_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slow.log");
        {
            let store = FileStore::open(&path, 1 << 20, 100, 10).unwrap();
            store.append(&record("SELECT 1 FROM t", "SELECT ? FROM T", 120)).unwrap();
            store.append(&record("SELECT 2 FROM t", "SELECT ? FROM T", 130)).unwrap();
        }
        let reopened = FileStore::open(&path, 1 << 20, 100, 10).unwrap();
        assert_eq!(reopened.records().len(), 2);
        assert_eq!(reopened.patterns()[0].count, 2);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slow.log");
        {
            let store = FileStore::open(&path, 1 << 20, 100, 10).unwrap();
            store.append(&record("SELECT 1", "SELECT ?", 120)).unwrap();
        }
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(file, "{{not json").unwrap();
        }
        let reopened = FileStore::open(&path, 1 << 20, 100, 10).unwrap();
        assert_eq!(reopened.records().len(), 1);
    }

    #[test]
    fn test_rotation_renames_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slow.log");
        let store = FileStore::open(&path, 256, 5000, 10).unwrap();
        for i in 0..50 {
            store
                .append(&record(&format!("SELECT {i} FROM t"), "SELECT ? FROM T", 100))
                .unwrap();
        }
        assert!(path.with_extension("log.old").exists() || {
            let mut old = path.as_os_str().to_os_string();
            old.push(".old");
            PathBuf::from(old).exists()
        });
        // Current file was reopened fresh, so it stays below the cap plus
        // one in-flight record.
        let size = std::fs::metadata(&path).unwrap().len();
        assert!(size < 512);
    }

    #[test]
    fn test_clear_truncates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slow.log");
        let store = FileStore::open(&path, 1 << 20, 100, 10).unwrap();
        store.append(&record("SELECT 1", "SELECT ?", 120)).unwrap();
        store.clear().unwrap();
        assert_eq!(store.records().len(), 0);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }
}
