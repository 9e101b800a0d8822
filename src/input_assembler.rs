// =============================================================================
// Input Assembler — per-tick input envelope
// =============================================================================
//
// Builds the model-facing input from stored feed records: a trailing window
// of 1-minute candles, roll-ups to 5m/15m/1h bars, and the latest order-book
// and funding microstructure if present. Tick records are synthesized into
// flat OHLC bars. When the store is under-filled, one bounded recovery fetch
// is attempted against the live feed before re-reading.
// =============================================================================

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backfill::feed_data_to_domain;
use crate::feeds::{DataFeed, FeedFetchRequest};
use crate::store::FeedRecordStore;
use crate::types::{FeedKind, FeedRecord, FeedScope, JsonMap};

/// Roll-up targets: (target_minutes, bar_count).
/// 5m×60 → 5 h, 15m×40 → 10 h, 1h×24 → 1 day.
const MULTI_TF: &[(i64, usize)] = &[(5, 60), (15, 40), (60, 24)];

/// A flat OHLCV bar inside the input envelope. `ts` is epoch seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

pub struct InputAssembler {
    feed: Arc<dyn DataFeed>,
    store: Arc<FeedRecordStore>,
    scope: FeedScope,
    window_size: usize,
}

impl InputAssembler {
    pub fn new(
        feed: Arc<dyn DataFeed>,
        store: Arc<FeedRecordStore>,
        scope: FeedScope,
        window_size: usize,
    ) -> Self {
        Self {
            feed,
            store,
            scope,
            window_size: window_size.max(1),
        }
    }

    pub fn scope(&self) -> &FeedScope {
        &self.scope
    }

    /// Build the raw input envelope for one dispatch tick.
    pub async fn get_input(&self, now: DateTime<Utc>) -> JsonMap {
        // Enough 1m candles to fill the largest roll-up window.
        let max_needed = MULTI_TF
            .iter()
            .map(|(tf, count)| (*tf as usize) * count)
            .max()
            .unwrap_or(0);
        let load_limit = self.window_size.max(max_needed);

        let mut candles = self.load_recent_candles(load_limit);
        if candles.len() < self.window_size.min(3) {
            self.recover_window(
                now - Duration::minutes((load_limit as i64).max(5)),
                now,
            )
            .await;
            candles = self.load_recent_candles(load_limit);
        }

        let asof_ts = candles
            .last()
            .map(|c| c.ts)
            .unwrap_or_else(|| now.timestamp());

        let mut input = JsonMap::new();
        input.insert("symbol".into(), self.scope.subject.clone().into());
        input.insert("asof_ts".into(), asof_ts.into());

        let tail_start = candles.len().saturating_sub(self.window_size);
        input.insert(
            "candles_1m".into(),
            serde_json::to_value(&candles[tail_start..]).unwrap_or_default(),
        );
        for (target_minutes, count) in MULTI_TF {
            let key = if *target_minutes < 60 {
                format!("candles_{target_minutes}m")
            } else {
                format!("candles_{}h", target_minutes / 60)
            };
            let bars = aggregate_candles(&candles, *target_minutes, *count);
            input.insert(key, serde_json::to_value(bars).unwrap_or_default());
        }

        if let Some(orderbook) = self.load_latest_microstructure(FeedKind::Depth) {
            input.insert("orderbook".into(), serde_json::Value::Object(orderbook));
        }
        if let Some(funding) = self.load_latest_microstructure(FeedKind::Funding) {
            input.insert("funding".into(), serde_json::Value::Object(funding));
        }

        input
    }

    /// Feed records covering a resolution window. Dimensions default to the
    /// assembler's own scope; an empty read triggers one padded recovery
    /// fetch before re-reading.
    pub async fn fetch_window(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        source: Option<&str>,
        subject: Option<&str>,
        kind: Option<&str>,
        granularity: Option<&str>,
    ) -> Vec<FeedRecord> {
        let scope = FeedScope {
            source: source.unwrap_or(&self.scope.source).to_string(),
            subject: subject.unwrap_or(&self.scope.subject).to_string(),
            kind: kind
                .and_then(FeedKind::parse)
                .unwrap_or(self.scope.kind),
            granularity: granularity.unwrap_or(&self.scope.granularity).to_string(),
        };

        let records = self
            .store
            .fetch_records(&scope, Some(start), Some(end), None);
        if !records.is_empty() {
            return records;
        }

        self.recover_window(start - Duration::minutes(2), end + Duration::minutes(2))
            .await;
        self.store.fetch_records(&scope, Some(start), Some(end), None)
    }

    // ── internals ───────────────────────────────────────────────────────

    fn load_recent_candles(&self, limit: usize) -> Vec<Candle> {
        let records = self.store.fetch_recent(&self.scope, limit.max(1));
        let mut candles = Vec::with_capacity(records.len());
        for record in &records {
            let Some(price) = record_price(record) else {
                continue;
            };
            let ts = record.ts_event.timestamp();
            if record.kind == FeedKind::Candle {
                let get = |key: &str, fallback: f64| {
                    record.values.get(key).and_then(|v| v.as_f64()).unwrap_or(fallback)
                };
                candles.push(Candle {
                    ts,
                    open: get("open", price),
                    high: get("high", price),
                    low: get("low", price),
                    close: get("close", price),
                    volume: get("volume", 0.0),
                });
            } else {
                // Tick records synthesize a flat bar.
                candles.push(Candle {
                    ts,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: 0.0,
                });
            }
        }
        candles
    }

    /// One-shot recovery fetch against the live feed. Failures are logged
    /// and swallowed; the caller re-reads whatever the store has.
    async fn recover_window(&self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let kind = match self.scope.kind {
            FeedKind::Tick | FeedKind::Candle => self.scope.kind,
            _ => FeedKind::Tick,
        };
        let request = FeedFetchRequest {
            subjects: vec![self.scope.subject.clone()],
            kind,
            granularity: self.scope.granularity.clone(),
            start_ts: Some(start.timestamp()),
            end_ts: Some(end.timestamp()),
            limit: Some(500),
        };
        match self.feed.fetch(request).await {
            Ok(records) if !records.is_empty() => {
                let domain: Vec<FeedRecord> = records
                    .iter()
                    .map(|r| feed_data_to_domain(&self.scope.source, r))
                    .collect();
                let written = self.store.append_records(&domain);
                debug!(written, "recovered feed window");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "recovery fetch failed"),
        }
    }

    fn load_latest_microstructure(&self, kind: FeedKind) -> Option<JsonMap> {
        let scope = FeedScope {
            source: self.scope.source.clone(),
            subject: self.scope.subject.clone(),
            kind,
            granularity: self.scope.granularity.clone(),
        };
        let record = self.store.fetch_latest_record(&scope, None)?;
        if record.values.is_empty() {
            None
        } else {
            Some(record.values)
        }
    }
}

/// Roll 1m candles up into `target_minutes` bars by flooring each timestamp
/// to the interval boundary. Buckets carry open=first, high=max, low=min,
/// close=last, volume=sum. Returns at most `max_output` bars, oldest first.
pub fn aggregate_candles(
    candles_1m: &[Candle],
    target_minutes: i64,
    max_output: usize,
) -> Vec<Candle> {
    if candles_1m.is_empty() {
        return Vec::new();
    }
    if target_minutes <= 1 {
        let start = candles_1m.len().saturating_sub(max_output);
        return candles_1m[start..].to_vec();
    }

    let interval_s = target_minutes * 60;
    let mut buckets: std::collections::BTreeMap<i64, Candle> = Default::default();
    for c in candles_1m {
        let bucket_ts = (c.ts / interval_s) * interval_s;
        buckets
            .entry(bucket_ts)
            .and_modify(|bar| {
                bar.high = bar.high.max(c.high);
                bar.low = bar.low.min(c.low);
                bar.close = c.close;
                bar.volume += c.volume;
            })
            .or_insert(Candle {
                ts: bucket_ts,
                open: c.open,
                high: c.high,
                low: c.low,
                close: c.close,
                volume: c.volume,
            });
    }

    let bars: Vec<Candle> = buckets.into_values().collect();
    let start = bars.len().saturating_sub(max_output);
    bars[start..].to_vec()
}

fn record_price(record: &FeedRecord) -> Option<f64> {
    for key in ["close", "price"] {
        if let Some(v) = record.values.get(key).and_then(|v| v.as_f64()) {
            return Some(v);
        }
    }
    None
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::{FeedDataRecord, FeedHandle, FeedSubscription, SubjectDescriptor};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    struct EmptyFeed;

    #[async_trait]
    impl DataFeed for EmptyFeed {
        fn source(&self) -> &str {
            "test"
        }
        async fn list_subjects(&self) -> anyhow::Result<Vec<SubjectDescriptor>> {
            Ok(Vec::new())
        }
        async fn listen(
            &self,
            _subscription: FeedSubscription,
            _sink: mpsc::Sender<FeedDataRecord>,
        ) -> anyhow::Result<FeedHandle> {
            anyhow::bail!("not used")
        }
        async fn fetch(&self, _request: FeedFetchRequest) -> anyhow::Result<Vec<FeedDataRecord>> {
            Ok(Vec::new())
        }
    }

    fn bar(ts: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Candle {
        Candle { ts, open, high, low, close, volume }
    }

    #[test]
    fn rollup_buckets_by_floor() {
        // Four 1m bars spanning two 5m buckets (600 boundary at 300).
        let candles = vec![
            bar(0, 1.0, 2.0, 0.5, 1.5, 1.0),
            bar(60, 1.5, 3.0, 1.0, 2.0, 1.0),
            bar(300, 2.0, 2.5, 1.8, 2.2, 2.0),
            bar(360, 2.2, 4.0, 2.0, 3.0, 2.0),
        ];
        let bars = aggregate_candles(&candles, 5, 10);
        assert_eq!(bars.len(), 2);

        assert_eq!(bars[0].ts, 0);
        assert_eq!(bars[0].open, 1.0);
        assert_eq!(bars[0].high, 3.0);
        assert_eq!(bars[0].low, 0.5);
        assert_eq!(bars[0].close, 2.0);
        assert_eq!(bars[0].volume, 2.0);

        assert_eq!(bars[1].ts, 300);
        assert_eq!(bars[1].close, 3.0);
        assert_eq!(bars[1].volume, 4.0);
    }

    #[test]
    fn rollup_caps_output_and_aligns_timestamps() {
        let candles: Vec<Candle> = (0..120)
            .map(|i| bar(i * 60, 1.0, 1.0, 1.0, 1.0, 1.0))
            .collect();
        let bars = aggregate_candles(&candles, 15, 4);
        assert_eq!(bars.len(), 4);
        for b in &bars {
            assert_eq!(b.ts % (15 * 60), 0);
        }
        // Most recent buckets win the cap.
        assert_eq!(bars.last().unwrap().ts, 105 * 60);
    }

    #[test]
    fn rollup_of_empty_is_empty() {
        assert!(aggregate_candles(&[], 5, 10).is_empty());
    }

    fn store_with_candles(n: i64) -> Arc<FeedRecordStore> {
        let store = Arc::new(FeedRecordStore::new());
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let records: Vec<FeedRecord> = (0..n)
            .map(|i| {
                let mut values = JsonMap::new();
                values.insert("open".into(), serde_json::Value::from(100.0 + i as f64));
                values.insert("high".into(), serde_json::Value::from(101.0 + i as f64));
                values.insert("low".into(), serde_json::Value::from(99.0 + i as f64));
                values.insert("close".into(), serde_json::Value::from(100.5 + i as f64));
                values.insert("volume".into(), serde_json::Value::from(1.0));
                FeedRecord {
                    source: "binance".into(),
                    subject: "BTCUSDT".into(),
                    kind: FeedKind::Candle,
                    granularity: "1m".into(),
                    ts_event: base + Duration::minutes(i),
                    ts_ingested: Utc::now(),
                    values,
                    meta: JsonMap::new(),
                }
            })
            .collect();
        store.append_records(&records);
        store
    }

    #[tokio::test]
    async fn envelope_has_all_timeframes() {
        let store = store_with_candles(120);
        let assembler = InputAssembler::new(
            Arc::new(EmptyFeed),
            store,
            FeedScope::new("binance", "BTCUSDT", FeedKind::Candle, "1m"),
            60,
        );
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 2, 0, 0).unwrap();
        let input = assembler.get_input(now).await;

        assert_eq!(input.get("symbol").unwrap().as_str().unwrap(), "BTCUSDT");
        for key in ["candles_1m", "candles_5m", "candles_15m", "candles_1h"] {
            assert!(input.get(key).unwrap().is_array(), "missing {key}");
        }
        assert_eq!(
            input.get("candles_1m").unwrap().as_array().unwrap().len(),
            60
        );
        // asof tracks the newest candle, not the wall clock.
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            input.get("asof_ts").unwrap().as_i64().unwrap(),
            (base + Duration::minutes(119)).timestamp()
        );
    }

    #[tokio::test]
    async fn tick_records_synthesize_flat_bars() {
        let store = Arc::new(FeedRecordStore::new());
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let mut values = JsonMap::new();
        values.insert("price".into(), serde_json::Value::from(42.0));
        store.append_records(&[
            FeedRecord {
                source: "pyth".into(),
                subject: "BTC".into(),
                kind: FeedKind::Tick,
                granularity: "1s".into(),
                ts_event: base,
                ts_ingested: Utc::now(),
                values: values.clone(),
                meta: JsonMap::new(),
            },
            FeedRecord {
                source: "pyth".into(),
                subject: "BTC".into(),
                kind: FeedKind::Tick,
                granularity: "1s".into(),
                ts_event: base + Duration::seconds(1),
                ts_ingested: Utc::now(),
                values,
                meta: JsonMap::new(),
            },
        ]);

        let assembler = InputAssembler::new(
            Arc::new(EmptyFeed),
            store,
            FeedScope::new("pyth", "BTC", FeedKind::Tick, "1s"),
            2,
        );
        let input = assembler.get_input(base + Duration::seconds(5)).await;
        let candles = input.get("candles_1m").unwrap().as_array().unwrap();
        assert_eq!(candles.len(), 2);
        let first = &candles[0];
        assert_eq!(first.get("open").unwrap().as_f64().unwrap(), 42.0);
        assert_eq!(first.get("close").unwrap().as_f64().unwrap(), 42.0);
        assert_eq!(first.get("volume").unwrap().as_f64().unwrap(), 0.0);
    }

    #[tokio::test]
    async fn fetch_window_uses_scope_overrides() {
        let store = store_with_candles(10);
        let assembler = InputAssembler::new(
            Arc::new(EmptyFeed),
            store,
            FeedScope::new("pyth", "BTC", FeedKind::Tick, "1s"),
            10,
        );
        let base = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let records = assembler
            .fetch_window(
                base,
                base + Duration::minutes(30),
                Some("binance"),
                Some("BTCUSDT"),
                Some("candle"),
                Some("1m"),
            )
            .await;
        assert_eq!(records.len(), 10);
    }
}
