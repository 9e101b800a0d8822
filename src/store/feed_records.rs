// =============================================================================
// Feed Record Store
// =============================================================================
//
// Append-dedup storage for canonical feed records plus per-scope ingestion
// watermarks. Rows are keyed by the record identity (scope dims + event
// time), so re-ingesting the same event is an in-place overwrite of
// values/meta/ts_ingested — the logical row set never grows on replays.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::types::{FeedIngestionState, FeedRecord, FeedScope};

/// Per-scope summary row returned by [`FeedRecordStore::list_indexed_feeds`].
#[derive(Debug, Clone, Serialize)]
pub struct FeedIndexEntry {
    pub source: String,
    pub subject: String,
    pub kind: String,
    pub granularity: String,
    pub record_count: u64,
    pub oldest_ts: Option<DateTime<Utc>>,
    pub newest_ts: Option<DateTime<Utc>>,
    pub watermark_ts: Option<DateTime<Utc>>,
    pub watermark_updated_at: Option<DateTime<Utc>>,
}

/// Thread-safe feed store shared by the ingest worker, the backfill engine,
/// the input assembler and the scorer's truth windows.
#[derive(Default)]
pub struct FeedRecordStore {
    records: RwLock<HashMap<String, FeedRecord>>,
    watermarks: RwLock<HashMap<String, FeedIngestionState>>,
}

impl FeedRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert records by identity. Returns the number of records processed
    /// (including overwrites of already-present identities).
    pub fn append_records(&self, records: &[FeedRecord]) -> usize {
        if records.is_empty() {
            return 0;
        }
        let mut map = self.records.write();
        for record in records {
            map.insert(record.identity(), record.clone());
        }
        records.len()
    }

    /// Records for one scope ordered by `ts_event` ascending, optionally
    /// bounded by `[start_ts, end_ts]` (inclusive) and truncated to `limit`.
    pub fn fetch_records(
        &self,
        scope: &FeedScope,
        start_ts: Option<DateTime<Utc>>,
        end_ts: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Vec<FeedRecord> {
        let map = self.records.read();
        let mut rows: Vec<FeedRecord> = map
            .values()
            .filter(|r| {
                r.source == scope.source
                    && r.subject == scope.subject
                    && r.kind == scope.kind
                    && r.granularity == scope.granularity
                    && start_ts.map_or(true, |s| r.ts_event >= s)
                    && end_ts.map_or(true, |e| r.ts_event <= e)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.ts_event);
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        rows
    }

    /// The newest `limit` records for a scope, still in ascending order.
    /// Used where a trailing window is wanted rather than the head of the
    /// series.
    pub fn fetch_recent(&self, scope: &FeedScope, limit: usize) -> Vec<FeedRecord> {
        let mut rows = self.fetch_records(scope, None, None, None);
        if rows.len() > limit {
            rows.drain(..rows.len() - limit);
        }
        rows
    }

    /// Newest record for a scope at or before the given bound.
    pub fn fetch_latest_record(
        &self,
        scope: &FeedScope,
        at_or_before: Option<DateTime<Utc>>,
    ) -> Option<FeedRecord> {
        let map = self.records.read();
        map.values()
            .filter(|r| {
                r.source == scope.source
                    && r.subject == scope.subject
                    && r.kind == scope.kind
                    && r.granularity == scope.granularity
                    && at_or_before.map_or(true, |b| r.ts_event <= b)
            })
            .max_by_key(|r| r.ts_event)
            .cloned()
    }

    /// Delete all records with `ts_event < cutoff`. Returns the count.
    pub fn prune_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut map = self.records.write();
        let before = map.len();
        map.retain(|_, r| r.ts_event >= cutoff);
        before - map.len()
    }

    /// Per-scope counts and bounds, joined with the watermarks, ordered by
    /// scope dimensions.
    pub fn list_indexed_feeds(&self) -> Vec<FeedIndexEntry> {
        let map = self.records.read();
        let watermarks = self.watermarks.read();

        let mut grouped: HashMap<FeedScope, (u64, DateTime<Utc>, DateTime<Utc>)> = HashMap::new();
        for record in map.values() {
            let entry = grouped
                .entry(record.scope())
                .or_insert((0, record.ts_event, record.ts_event));
            entry.0 += 1;
            entry.1 = entry.1.min(record.ts_event);
            entry.2 = entry.2.max(record.ts_event);
        }

        let mut entries: Vec<FeedIndexEntry> = grouped
            .into_iter()
            .map(|(scope, (count, oldest, newest))| {
                let state = watermarks.get(&scope.watermark_id());
                FeedIndexEntry {
                    source: scope.source.clone(),
                    subject: scope.subject.clone(),
                    kind: scope.kind.to_string(),
                    granularity: scope.granularity.clone(),
                    record_count: count,
                    oldest_ts: Some(oldest),
                    newest_ts: Some(newest),
                    watermark_ts: state.and_then(|s| s.last_event_ts),
                    watermark_updated_at: state.map(|s| s.updated_at),
                }
            })
            .collect();
        entries.sort_by(|a, b| {
            (&a.source, &a.subject, &a.kind, &a.granularity)
                .cmp(&(&b.source, &b.subject, &b.kind, &b.granularity))
        });
        entries
    }

    /// Newest records first, optionally filtered per dimension. Diagnostics
    /// surface for the feeds tail endpoint.
    pub fn tail_records(
        &self,
        source: Option<&str>,
        subject: Option<&str>,
        kind: Option<&str>,
        granularity: Option<&str>,
        limit: usize,
    ) -> Vec<FeedRecord> {
        let map = self.records.read();
        let mut rows: Vec<FeedRecord> = map
            .values()
            .filter(|r| {
                source.map_or(true, |s| r.source == s)
                    && subject.map_or(true, |s| r.subject == s)
                    && kind.map_or(true, |k| r.kind.as_str() == k)
                    && granularity.map_or(true, |g| r.granularity == g)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|r| std::cmp::Reverse(r.ts_event));
        rows.truncate(limit.max(1));
        rows
    }

    pub fn get_watermark(&self, scope: &FeedScope) -> Option<FeedIngestionState> {
        self.watermarks.read().get(&scope.watermark_id()).cloned()
    }

    pub fn set_watermark(&self, state: FeedIngestionState) {
        self.watermarks
            .write()
            .insert(state.scope().watermark_id(), state);
    }

    pub fn rollback(&self) {}
}

// =============================================================================
// Tests
// =============================================================================
