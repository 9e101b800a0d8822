// =============================================================================
// Parquet Backfill Sink — Hive-partitioned daily data files
// =============================================================================
//
// Layout: `{base_dir}/{source}/{subject}/{kind}/{granularity}/YYYY-MM-DD.parquet`
//
// Standard OHLCV columns are flattened out of the values map; everything else
// (plus the record meta) is packed into a JSON `meta` column. Overwrites
// merge: read the existing file, concat, dedup by `ts_event` keeping the last
// occurrence, sort ascending, rewrite.
// =============================================================================

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{
    Array, ArrayRef, Float64Array, RecordBatch, StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::Serialize;
use tracing::warn;

use crate::types::{FeedIngestionState, FeedRecord};

/// Value keys that become first-class parquet columns.
const STANDARD_VALUE_COLUMNS: &[&str] = &["open", "high", "low", "close", "volume"];

/// Manifest row for one data file.
#[derive(Debug, Clone, Serialize)]
pub struct DataFileEntry {
    pub path: String,
    pub records: i64,
    pub size_bytes: u64,
    pub date: String,
}

/// One flattened parquet row.
#[derive(Debug, Clone)]
struct RowData {
    ts_event_us: i64,
    source: String,
    subject: String,
    kind: String,
    granularity: String,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
    volume: Option<f64>,
    meta: String,
}

pub struct ParquetBackfillSink {
    base_dir: PathBuf,
}

impl ParquetBackfillSink {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Write records grouped by scope + day. Returns the number processed.
    pub fn append_records(&self, records: &[FeedRecord]) -> usize {
        let mut grouped: BTreeMap<PathBuf, Vec<RowData>> = BTreeMap::new();
        for record in records {
            let date = record.ts_event.format("%Y-%m-%d").to_string();
            let path = self.file_path(
                &record.source,
                &record.subject,
                record.kind.as_str(),
                &record.granularity,
                &date,
            );
            grouped.entry(path).or_default().push(flatten_record(record));
        }

        for (path, rows) in grouped {
            if let Err(e) = self.write_or_merge(&path, rows) {
                warn!(path = %path.display(), error = %e, "parquet write failed");
            }
        }
        records.len()
    }

    /// Manifest of every data file under the base directory.
    pub fn list_files(&self) -> Vec<DataFileEntry> {
        let mut manifest = Vec::new();
        let mut paths = Vec::new();
        collect_parquet_files(&self.base_dir, &mut paths);
        paths.sort();

        for path in paths {
            let Ok(file) = File::open(&path) else { continue };
            let Ok(reader) = ParquetRecordBatchReaderBuilder::try_new(file) else {
                warn!(path = %path.display(), "unreadable parquet file skipped");
                continue;
            };
            let records = reader.metadata().file_metadata().num_rows();
            let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let rel = path
                .strip_prefix(&self.base_dir)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            let date = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default();
            manifest.push(DataFileEntry {
                path: rel,
                records,
                size_bytes,
                date,
            });
        }
        manifest
    }

    /// Resolve a manifest-relative path to an absolute parquet file. Rejects
    /// traversal and non-parquet paths.
    pub fn read_file(&self, rel_path: &str) -> Option<PathBuf> {
        if rel_path.contains("..") || !rel_path.ends_with(".parquet") {
            return None;
        }
        let full = self.base_dir.join(rel_path);
        if full.is_file() {
            Some(full)
        } else {
            None
        }
    }

    fn file_path(
        &self,
        source: &str,
        subject: &str,
        kind: &str,
        granularity: &str,
        date: &str,
    ) -> PathBuf {
        self.base_dir
            .join(source)
            .join(subject)
            .join(kind)
            .join(granularity)
            .join(format!("{date}.parquet"))
    }

    fn write_or_merge(&self, path: &Path, mut rows: Vec<RowData>) -> Result<()> {
        if path.exists() {
            match read_rows(path) {
                Ok(mut existing) => {
                    existing.append(&mut rows);
                    rows = existing;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "existing parquet unreadable, overwriting");
                }
            }
        }

        // Dedup by ts_event keeping the last occurrence, then sort.
        let mut by_ts: BTreeMap<i64, RowData> = BTreeMap::new();
        for row in rows {
            by_ts.insert(row.ts_event_us, row);
        }
        let rows: Vec<RowData> = by_ts.into_values().collect();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let batch = rows_to_batch(&rows)?;
        let file =
            File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
            .with_context(|| format!("opening parquet writer {}", path.display()))?;
        writer
            .write(&batch)
            .with_context(|| format!("writing record batch {}", path.display()))?;
        writer
            .close()
            .with_context(|| format!("closing parquet writer {}", path.display()))?;
        Ok(())
    }
}

impl crate::backfill::BackfillSink for ParquetBackfillSink {
    fn append_records(&self, records: &[FeedRecord]) -> usize {
        ParquetBackfillSink::append_records(self, records)
    }

    /// The jobs table tracks progress for data-file backfills.
    fn set_watermark(&self, _state: FeedIngestionState) {}
}

// =============================================================================
// Row/schema conversion
// =============================================================================

fn file_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new(
            "ts_event",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        Field::new("source", DataType::Utf8, false),
        Field::new("subject", DataType::Utf8, false),
        Field::new("kind", DataType::Utf8, false),
        Field::new("granularity", DataType::Utf8, false),
        Field::new("open", DataType::Float64, true),
        Field::new("high", DataType::Float64, true),
        Field::new("low", DataType::Float64, true),
        Field::new("close", DataType::Float64, true),
        Field::new("volume", DataType::Float64, true),
        Field::new("meta", DataType::Utf8, false),
    ]))
}

fn flatten_record(record: &FeedRecord) -> RowData {
    let values = &record.values;
    let get = |key: &str| values.get(key).and_then(|v| v.as_f64());

    // Non-standard value fields and the record meta travel in the JSON column.
    let mut extra = crate::types::JsonMap::new();
    for (key, value) in values {
        if !STANDARD_VALUE_COLUMNS.contains(&key.as_str()) {
            extra.insert(key.clone(), value.clone());
        }
    }
    if !record.meta.is_empty() {
        extra.insert(
            "_record_meta".into(),
            serde_json::Value::Object(record.meta.clone()),
        );
    }
    let meta = if extra.is_empty() {
        "{}".to_string()
    } else {
        serde_json::Value::Object(extra).to_string()
    };

    RowData {
        ts_event_us: record.ts_event.timestamp_micros(),
        source: record.source.clone(),
        subject: record.subject.clone(),
        kind: record.kind.to_string(),
        granularity: record.granularity.clone(),
        open: get("open"),
        high: get("high"),
        low: get("low"),
        close: get("close"),
        volume: get("volume"),
        meta,
    }
}

fn rows_to_batch(rows: &[RowData]) -> Result<RecordBatch> {
    let ts: TimestampMicrosecondArray = rows
        .iter()
        .map(|r| Some(r.ts_event_us))
        .collect::<TimestampMicrosecondArray>()
        .with_timezone("UTC");

    let columns: Vec<ArrayRef> = vec![
        Arc::new(ts),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.source.as_str()))),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.subject.as_str()))),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.kind.as_str()))),
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|r| r.granularity.as_str()),
        )),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.open))),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.high))),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.low))),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.close))),
        Arc::new(Float64Array::from_iter(rows.iter().map(|r| r.volume))),
        Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.meta.as_str()))),
    ];

    RecordBatch::try_new(file_schema(), columns).context("building record batch")
}

fn read_rows(path: &Path) -> Result<Vec<RowData>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .context("opening parquet reader")?
        .build()
        .context("building parquet reader")?;

    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.context("reading record batch")?;
        let ts = downcast::<TimestampMicrosecondArray>(&batch, 0)?;
        let source = downcast::<StringArray>(&batch, 1)?;
        let subject = downcast::<StringArray>(&batch, 2)?;
        let kind = downcast::<StringArray>(&batch, 3)?;
        let granularity = downcast::<StringArray>(&batch, 4)?;
        let open = downcast::<Float64Array>(&batch, 5)?;
        let high = downcast::<Float64Array>(&batch, 6)?;
        let low = downcast::<Float64Array>(&batch, 7)?;
        let close = downcast::<Float64Array>(&batch, 8)?;
        let volume = downcast::<Float64Array>(&batch, 9)?;
        let meta = downcast::<StringArray>(&batch, 10)?;

        let opt = |arr: &Float64Array, i: usize| {
            if arr.is_null(i) {
                None
            } else {
                Some(arr.value(i))
            }
        };

        for i in 0..batch.num_rows() {
            rows.push(RowData {
                ts_event_us: ts.value(i),
                source: source.value(i).to_string(),
                subject: subject.value(i).to_string(),
                kind: kind.value(i).to_string(),
                granularity: granularity.value(i).to_string(),
                open: opt(open, i),
                high: opt(high, i),
                low: opt(low, i),
                close: opt(close, i),
                volume: opt(volume, i),
                meta: meta.value(i).to_string(),
            });
        }
    }
    Ok(rows)
}

fn downcast<'a, T: 'static>(batch: &'a RecordBatch, index: usize) -> Result<&'a T> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("column {index} has an unexpected type"))
}

fn collect_parquet_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_parquet_files(&path, out);
        } else if path.extension().map_or(false, |e| e == "parquet") {
            out.push(path);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FeedKind, JsonMap};
    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    fn candle(ts_offset_secs: i64, close: f64) -> FeedRecord {
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut values = JsonMap::new();
        values.insert("open".into(), Value::from(close - 0.5));
        values.insert("high".into(), Value::from(close + 1.0));
        values.insert("low".into(), Value::from(close - 1.0));
        values.insert("close".into(), Value::from(close));
        values.insert("volume".into(), Value::from(10.0));
        values.insert("vwap".into(), Value::from(close + 0.1));
        FeedRecord {
            source: "binance".into(),
            subject: "BTCUSDT".into(),
            kind: FeedKind::Candle,
            granularity: "1m".into(),
            ts_event: base + chrono::Duration::seconds(ts_offset_secs),
            ts_ingested: Utc::now(),
            values,
            meta: JsonMap::new(),
        }
    }

    #[test]
    fn writes_hive_partitioned_layout() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ParquetBackfillSink::new(dir.path());
        sink.append_records(&[candle(0, 100.0), candle(60, 101.0)]);

        let expected = dir
            .path()
            .join("binance/BTCUSDT/candle/1m/2026-01-01.parquet");
        assert!(expected.is_file());

        let manifest = sink.list_files();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].records, 2);
        assert_eq!(manifest[0].date, "2026-01-01");
        assert_eq!(manifest[0].path, "binance/BTCUSDT/candle/1m/2026-01-01.parquet");
    }

    #[test]
    fn merge_dedups_by_ts_event_keeping_last() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ParquetBackfillSink::new(dir.path());
        sink.append_records(&[candle(0, 100.0), candle(60, 101.0)]);
        // Overwrite the first timestamp with a revised close.
        sink.append_records(&[candle(0, 200.0), candle(120, 102.0)]);

        let path = sink
            .read_file("binance/BTCUSDT/candle/1m/2026-01-01.parquet")
            .unwrap();
        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 3);
        // Sorted ascending, first row carries the revised value.
        assert!(rows.windows(2).all(|w| w[0].ts_event_us < w[1].ts_event_us));
        assert_eq!(rows[0].close, Some(200.0));
    }

    #[test]
    fn extra_values_land_in_meta_json() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ParquetBackfillSink::new(dir.path());
        sink.append_records(&[candle(0, 100.0)]);

        let path = sink
            .read_file("binance/BTCUSDT/candle/1m/2026-01-01.parquet")
            .unwrap();
        let rows = read_rows(&path).unwrap();
        let meta: Value = serde_json::from_str(&rows[0].meta).unwrap();
        assert!((meta.get("vwap").unwrap().as_f64().unwrap() - 100.1).abs() < 1e-9);
    }

    #[test]
    fn read_file_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ParquetBackfillSink::new(dir.path());
        assert!(sink.read_file("../etc/passwd").is_none());
        assert!(sink.read_file("foo/bar.txt").is_none());
    }

    #[test]
    fn records_split_across_days() {
        let dir = tempfile::tempdir().unwrap();
        let sink = ParquetBackfillSink::new(dir.path());
        sink.append_records(&[candle(0, 100.0), candle(86_400, 101.0)]);
        let manifest = sink.list_files();
        assert_eq!(manifest.len(), 2);
        let dates: Vec<&str> = manifest.iter().map(|m| m.date.as_str()).collect();
        assert!(dates.contains(&"2026-01-01"));
        assert!(dates.contains(&"2026-01-02"));
    }
}
