// =============================================================================
// Binance Feed Adapter
// =============================================================================
//
// Pull side: public REST klines/ticker endpoints. Push side: the kline
// WebSocket stream, emitting only closed candles so stored records stay
// immutable. Reconnection is handled inside the listen task; a stream error
// tears the socket down and reconnects after a short pause.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

use crate::feeds::{
    DataFeed, FeedDataRecord, FeedFetchRequest, FeedHandle, FeedSettings, FeedSubscription,
    SubjectDescriptor,
};
use crate::types::{FeedKind, JsonMap};

const BINANCE_API: &str = "https://api.binance.com";
const BINANCE_WS: &str = "wss://stream.binance.com:9443";

// =============================================================================
// REST client
// =============================================================================

/// Thin client over the public (unsigned) Binance REST endpoints.
#[derive(Clone)]
pub struct BinanceRestClient {
    base_url: String,
    client: reqwest::Client,
}

impl BinanceRestClient {
    pub fn new() -> Self {
        Self::with_base_url(BINANCE_API)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.to_string(),
            client,
        }
    }

    /// GET /api/v3/exchangeInfo.
    pub async fn exchange_info(&self) -> Result<Value> {
        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/exchangeInfo request failed")?;
        resp.error_for_status()
            .context("exchangeInfo returned an error status")?
            .json()
            .await
            .context("failed to decode exchangeInfo JSON")
    }

    /// GET /api/v3/klines. Timestamps are milliseconds.
    pub async fn klines(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<Value>> {
        let mut params = vec![
            ("symbol".to_string(), symbol.to_string()),
            ("interval".to_string(), interval.to_string()),
        ];
        if let Some(start) = start_ms {
            params.push(("startTime".into(), start.to_string()));
        }
        if let Some(end) = end_ms {
            params.push(("endTime".into(), end.to_string()));
        }
        if let Some(limit) = limit {
            params.push(("limit".into(), limit.to_string()));
        }

        let url = format!("{}/api/v3/klines", self.base_url);
        let resp = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;
        let payload: Value = resp
            .error_for_status()
            .context("klines returned an error status")?
            .json()
            .await
            .context("failed to decode klines JSON")?;
        Ok(payload.as_array().cloned().unwrap_or_default())
    }
}

impl Default for BinanceRestClient {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Feed adapter
// =============================================================================

pub struct BinanceFeed {
    client: BinanceRestClient,
    settings: FeedSettings,
}

impl BinanceFeed {
    pub fn new(settings: FeedSettings) -> Self {
        Self {
            client: BinanceRestClient::new(),
            settings,
        }
    }

    pub fn with_client(client: BinanceRestClient, settings: FeedSettings) -> Self {
        Self { client, settings }
    }
}

#[async_trait]
impl DataFeed for BinanceFeed {
    fn source(&self) -> &str {
        "binance"
    }

    async fn list_subjects(&self) -> Result<Vec<SubjectDescriptor>> {
        let symbols = match self.client.exchange_info().await {
            Ok(payload) => payload
                .get("symbols")
                .and_then(|v| v.as_array())
                .cloned()
                .unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "exchangeInfo failed, serving fallback subject");
                Vec::new()
            }
        };

        if symbols.is_empty() {
            // Upstream is rate-limited often enough that callers still need
            // a usable descriptor.
            let mut metadata = JsonMap::new();
            metadata.insert("fallback".into(), Value::Bool(true));
            return Ok(vec![SubjectDescriptor {
                symbol: "BTCUSDT".into(),
                display_name: Some("BTC / USDT".into()),
                kinds: vec![FeedKind::Tick, FeedKind::Candle],
                granularities: vec!["1m".into(), "5m".into(), "15m".into(), "1h".into()],
                source: "binance".into(),
                metadata,
            }]);
        }

        let mut descriptors = Vec::new();
        for row in symbols.iter().take(500) {
            let Some(symbol) = row.get("symbol").and_then(|v| v.as_str()) else {
                continue;
            };
            let mut metadata = JsonMap::new();
            for key in ["status", "baseAsset", "quoteAsset"] {
                if let Some(v) = row.get(key) {
                    metadata.insert(key.to_string(), v.clone());
                }
            }
            descriptors.push(SubjectDescriptor {
                symbol: symbol.to_string(),
                display_name: Some(symbol.to_string()),
                kinds: vec![FeedKind::Tick, FeedKind::Candle],
                granularities: vec!["1m".into(), "5m".into(), "15m".into(), "1h".into()],
                source: "binance".into(),
                metadata,
            });
        }
        Ok(descriptors)
    }

    async fn listen(
        &self,
        subscription: FeedSubscription,
        sink: mpsc::Sender<FeedDataRecord>,
    ) -> Result<FeedHandle> {
        let url = build_stream_url(&subscription.subjects, &subscription.granularity);
        let kind = subscription.kind;
        let granularity = subscription.granularity.clone();
        let reconnect = std::time::Duration::from_secs(self.settings.poll_seconds.max(1));

        let task = tokio::spawn(async move {
            // Last emitted event time per subject; enforces monotonicity
            // across reconnects.
            let mut watermark: HashMap<String, i64> = HashMap::new();
            loop {
                if let Err(e) =
                    run_kline_stream(&url, kind, &granularity, &sink, &mut watermark).await
                {
                    warn!(error = %e, "kline stream error — reconnecting");
                }
                if sink.is_closed() {
                    return;
                }
                tokio::time::sleep(reconnect).await;
            }
        });

        Ok(FeedHandle::new(task))
    }

    async fn fetch(&self, request: FeedFetchRequest) -> Result<Vec<FeedDataRecord>> {
        let interval = if request.granularity.is_empty() {
            "1m"
        } else {
            request.granularity.as_str()
        };

        let mut records = Vec::new();
        for subject in &request.subjects {
            let rows = self
                .client
                .klines(
                    subject,
                    interval,
                    request.start_ts.map(|s| s * 1000),
                    request.end_ts.map(|e| e * 1000),
                    request.limit,
                )
                .await?;
            for row in rows {
                if let Some(record) =
                    kline_row_to_record(subject, request.kind, interval, &row)
                {
                    records.push(record);
                }
            }
        }
        records.sort_by_key(|r| r.ts_event);
        Ok(records)
    }
}

// =============================================================================
// Kline decoding
// =============================================================================

/// Build the combined-stream URL for all subjects at one interval.
fn build_stream_url(subjects: &[String], interval: &str) -> String {
    let streams: Vec<String> = subjects
        .iter()
        .map(|s| format!("{}@kline_{}", s.to_lowercase(), interval))
        .collect();
    format!("{}/stream?streams={}", BINANCE_WS, streams.join("/"))
}

/// Read one socket lifetime; returns when the stream drops or errors.
async fn run_kline_stream(
    url: &str,
    kind: FeedKind,
    granularity: &str,
    sink: &mpsc::Sender<FeedDataRecord>,
    watermark: &mut HashMap<String, i64>,
) -> Result<()> {
    info!(url, "connecting to kline WebSocket");
    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to kline WebSocket")?;
    let (_write, mut read) = ws_stream.split();

    while let Some(msg) = read.next().await {
        let msg = msg.context("kline WebSocket read error")?;
        let tokio_tungstenite::tungstenite::Message::Text(text) = msg else {
            // Ping/pong/binary frames — tungstenite answers pings itself.
            continue;
        };
        match parse_kline_message(&text, kind, granularity) {
            Ok(Some(record)) => {
                let last = watermark.get(&record.subject).copied();
                if last.map_or(false, |ts| record.ts_event <= ts) {
                    continue;
                }
                watermark.insert(record.subject.clone(), record.ts_event);
                if sink.send(record).await.is_err() {
                    // Receiver gone; stop reading.
                    return Ok(());
                }
            }
            Ok(None) => {} // unclosed candle, skipped
            Err(e) => warn!(error = %e, "failed to parse kline message"),
        }
    }

    warn!("kline WebSocket stream ended");
    Ok(())
}

/// Parse one combined-stream kline message into a canonical record.
/// Returns `None` for in-progress candles — only closed candles are emitted.
fn parse_kline_message(
    text: &str,
    kind: FeedKind,
    granularity: &str,
) -> Result<Option<FeedDataRecord>> {
    let root: Value = serde_json::from_str(text).context("failed to parse kline JSON")?;
    let data = root.get("data").unwrap_or(&root);

    let subject = data
        .get("s")
        .and_then(|v| v.as_str())
        .context("missing field data.s")?
        .to_uppercase();
    let k = data.get("k").context("missing field data.k")?;

    let is_closed = k.get("x").and_then(|v| v.as_bool()).unwrap_or(false);
    if !is_closed {
        return Ok(None);
    }

    let open_time_ms = k.get("t").and_then(|v| v.as_i64()).context("missing field k.t")?;
    let mut values = JsonMap::new();
    for (column, field) in [
        ("open", "o"),
        ("high", "h"),
        ("low", "l"),
        ("close", "c"),
        ("volume", "v"),
    ] {
        values.insert(column.into(), Value::from(numeric_field(&k[field], field)?));
    }

    debug!(subject = %subject, ts = open_time_ms / 1000, "closed candle");

    Ok(Some(FeedDataRecord {
        source: "binance".into(),
        subject,
        kind,
        granularity: granularity.to_string(),
        ts_event: open_time_ms / 1000,
        values,
        metadata: JsonMap::new(),
    }))
}

/// Map one REST kline row `[open_time, o, h, l, c, v, close_time, …]` into a
/// canonical record. Tick requests collapse the candle to a single price.
fn kline_row_to_record(
    subject: &str,
    kind: FeedKind,
    granularity: &str,
    row: &Value,
) -> Option<FeedDataRecord> {
    let cols = row.as_array()?;
    if cols.len() < 6 {
        return None;
    }
    let open_time_ms = cols[0].as_i64()?;
    let open = numeric_field(&cols[1], "open").ok()?;
    let high = numeric_field(&cols[2], "high").ok()?;
    let low = numeric_field(&cols[3], "low").ok()?;
    let close = numeric_field(&cols[4], "close").ok()?;
    let volume = numeric_field(&cols[5], "volume").ok()?;

    let mut values = JsonMap::new();
    match kind {
        FeedKind::Tick => {
            values.insert("price".into(), Value::from(close));
        }
        _ => {
            values.insert("open".into(), Value::from(open));
            values.insert("high".into(), Value::from(high));
            values.insert("low".into(), Value::from(low));
            values.insert("close".into(), Value::from(close));
            values.insert("volume".into(), Value::from(volume));
        }
    }

    let mut metadata = JsonMap::new();
    metadata.insert("ingested_at".into(), Value::String(Utc::now().to_rfc3339()));

    Some(FeedDataRecord {
        source: "binance".into(),
        subject: subject.to_string(),
        kind,
        granularity: granularity.to_string(),
        ts_event: open_time_ms / 1000,
        values,
        metadata,
    })
}

/// Binance encodes kline floats as JSON strings; accept either encoding.
fn numeric_field(value: &Value, field: &str) -> Result<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| anyhow::anyhow!("kline field {field} is not numeric: {value}"))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_url_combines_subjects() {
        let url = build_stream_url(&["BTCUSDT".into(), "ETHUSDT".into()], "1m");
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@kline_1m/ethusdt@kline_1m"
        );
    }

    #[test]
    fn parse_closed_kline() {
        let text = r#"{
            "stream": "btcusdt@kline_1m",
            "data": {
                "s": "BTCUSDT",
                "k": {
                    "t": 1767225600000, "T": 1767225659999, "i": "1m",
                    "o": "100.0", "h": "101.5", "l": "99.5", "c": "101.0",
                    "v": "12.5", "n": 42, "x": true
                }
            }
        }"#;
        let record = parse_kline_message(text, FeedKind::Candle, "1m")
            .unwrap()
            .unwrap();
        assert_eq!(record.subject, "BTCUSDT");
        assert_eq!(record.ts_event, 1767225600);
        assert_eq!(record.values.get("close").unwrap().as_f64().unwrap(), 101.0);
    }

    #[test]
    fn unclosed_kline_is_skipped() {
        let text = r#"{
            "data": {
                "s": "BTCUSDT",
                "k": {"t": 1767225600000, "o": "1", "h": "1", "l": "1", "c": "1", "v": "0", "x": false}
            }
        }"#;
        assert!(parse_kline_message(text, FeedKind::Candle, "1m")
            .unwrap()
            .is_none());
    }

    #[test]
    fn rest_kline_row_maps_to_candle_values() {
        let row = serde_json::json!([
            1767225600000i64, "100.0", "101.0", "99.0", "100.5", "50.0", 1767225659999i64
        ]);
        let record = kline_row_to_record("BTCUSDT", FeedKind::Candle, "1m", &row).unwrap();
        assert_eq!(record.ts_event, 1767225600);
        assert_eq!(record.values.get("open").unwrap().as_f64().unwrap(), 100.0);
        assert_eq!(record.values.get("volume").unwrap().as_f64().unwrap(), 50.0);

        let tick = kline_row_to_record("BTCUSDT", FeedKind::Tick, "1m", &row).unwrap();
        assert_eq!(tick.values.get("price").unwrap().as_f64().unwrap(), 100.5);
        assert!(tick.values.get("open").is_none());
    }
}
