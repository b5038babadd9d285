// # Slow-Query Analysis
//
// Offline aggregation over a set of captured records: percentile summary,
// the slowest individual queries, the most frequent patterns, a 24-slot
// distribution across the observed time range, and rule-based
// recommendations derived from normalized query shapes.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{QueryPattern, SlowQueryRecord};

const DISTRIBUTION_SLOTS: usize = 24;
const TOP_QUERIES: usize = 10;
const FREQUENT_THRESHOLD: u64 = 10;
const FREQUENT_AVG_DURATION: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub total_count: usize,
    pub unique_queries: usize,
    pub average_duration: Duration,
    pub median_duration: Duration,
    pub p95_duration: Duration,
    pub p99_duration: Duration,
    pub max_duration: Duration,
    pub min_duration: Duration,
    pub window_start: Option<DateTime<Utc>>,
    pub window_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeSlot {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub count: usize,
    pub total_duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisReport {
    pub summary: AnalysisSummary,
    pub top_slow_queries: Vec<SlowQueryRecord>,
    pub frequent_patterns: Vec<QueryPattern>,
    pub time_distribution: Vec<TimeSlot>,
    pub recommendations: Vec<String>,
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn summarize(records: &[SlowQueryRecord]) -> AnalysisSummary {
    let mut durations: Vec<Duration> = records.iter().map(|r| r.duration).collect();
    durations.sort();

    let total: Duration = durations.iter().sum();
    let unique = records
        .iter()
        .map(|r| r.normalized_query.as_str())
        .collect::<std::collections::HashSet<_>>()
        .len();

    AnalysisSummary {
        total_count: records.len(),
        unique_queries: unique,
        average_duration: if records.is_empty() {
            Duration::ZERO
        } else {
            total / records.len() as u32
        },
        median_duration: percentile(&durations, 50.0),
        p95_duration: percentile(&durations, 95.0),
        p99_duration: percentile(&durations, 99.0),
        max_duration: durations.last().copied().unwrap_or(Duration::ZERO),
        min_duration: durations.first().copied().unwrap_or(Duration::ZERO),
        window_start: records.iter().map(|r| r.timestamp).min(),
        window_end: records.iter().map(|r| r.timestamp).max(),
    }
}

fn distribute(records: &[SlowQueryRecord]) -> Vec<TimeSlot> {
    let (Some(start), Some(end)) = (
        records.iter().map(|r| r.timestamp).min(),
        records.iter().map(|r| r.timestamp).max(),
    ) else {
        return Vec::new();
    };

    let span = (end - start).max(chrono::Duration::seconds(1));
    let slot_width = span / DISTRIBUTION_SLOTS as i32;
    let mut slots: Vec<TimeSlot> = (0..DISTRIBUTION_SLOTS)
        .map(|i| TimeSlot {
            start: start + slot_width * i as i32,
            end: start + slot_width * (i as i32 + 1),
            count: 0,
            total_duration: Duration::ZERO,
        })
        .collect();

    for record in records {
        let offset = record.timestamp - start;
        let index = if slot_width.is_zero() {
            0
        } else {
            (offset.num_milliseconds() / slot_width.num_milliseconds().max(1)) as usize
        };
        let slot = &mut slots[index.min(DISTRIBUTION_SLOTS - 1)];
        slot.count += 1;
        slot.total_duration += record.duration;
    }
    slots
}

fn recommend(records: &[SlowQueryRecord]) -> Vec<String> {
    let mut recommendations = Vec::new();
    let mut patterns: HashMap<&str, (u64, Duration)> = HashMap::new();
    for record in records {
        let entry = patterns
            .entry(record.normalized_query.as_str())
            .or_insert((0, Duration::ZERO));
        entry.0 += 1;
        entry.1 += record.duration;
    }

    let mut saw_select_star = false;
    let mut saw_unbounded_order = false;
    let mut saw_like = false;
    for (pattern, (count, total)) in &patterns {
        if pattern.contains("SELECT *") && !saw_select_star {
            saw_select_star = true;
            recommendations
                .push("Avoid SELECT *; project only the columns you read".to_string());
        }
        if pattern.contains("ORDER BY") && !pattern.contains("LIMIT") && !saw_unbounded_order {
            saw_unbounded_order = true;
            recommendations
                .push("ORDER BY without LIMIT sorts the full result set; add a LIMIT".to_string());
        }
        if pattern.contains("LIKE") && !saw_like {
            saw_like = true;
            recommendations.push(
                "LIKE patterns are expensive; prefer prefix matches or a full-text index"
                    .to_string(),
            );
        }
        let average = *total / (*count).max(1) as u32;
        if *count >= FREQUENT_THRESHOLD && average >= FREQUENT_AVG_DURATION {
            recommendations.push(format!(
                "Query appears {count} times averaging {average:?}; consider adding an index: {pattern}"
            ));
        }
    }
    recommendations
}

/// Analyze a set of records produced by the recorder.
pub(super) fn analyze(records: &[SlowQueryRecord]) -> AnalysisReport {
    let mut by_duration: Vec<SlowQueryRecord> = records.to_vec();
    by_duration.sort_by(|a, b| b.duration.cmp(&a.duration));
    by_duration.truncate(TOP_QUERIES);

    let mut patterns: HashMap<String, QueryPattern> = HashMap::new();
    for record in records {
        patterns
            .entry(record.normalized_query.clone())
            .or_insert_with(|| QueryPattern::new(record))
            .absorb(record);
    }
    let mut frequent: Vec<QueryPattern> = patterns.into_values().collect();
    frequent.sort_by(|a, b| b.count.cmp(&a.count));
    frequent.truncate(TOP_QUERIES);

    AnalysisReport {
        summary: summarize(records),
        top_slow_queries: by_duration,
        frequent_patterns: frequent,
        time_distribution: distribute(records),
        recommendations: recommend(records),
    }
}
