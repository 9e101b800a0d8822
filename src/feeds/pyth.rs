// =============================================================================
// Pyth Feed Adapter — Hermes REST polling
// =============================================================================
//
// Hermes serves the latest signed price per feed id; both `listen` and
// `fetch` resolve through that endpoint, so this adapter is a pure polling
// feed producing tick records. Prices arrive as scaled integers with an
// exponent and are normalized to floats.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::feeds::{
    DataFeed, FeedDataRecord, FeedFetchRequest, FeedHandle, FeedSettings, FeedSubscription,
    SubjectDescriptor,
};
use crate::types::{FeedKind, JsonMap};

const PYTH_HERMES: &str = "https://hermes.pyth.network";

/// Well-known feed ids for the default subjects.
fn default_feed_ids() -> HashMap<String, String> {
    let mut map = HashMap::new();
    map.insert(
        "BTC".to_string(),
        "0xe62df6c8b4a85fe1cc8b337a5f8854d9c1f5f59e4cb4ce8b063a492f6ed5b5b6".to_string(),
    );
    map.insert(
        "ETH".to_string(),
        "0xff61491a931112ddf1bd8147cd1b641375f79f5825126d665480874634fd0ace".to_string(),
    );
    map
}

// =============================================================================
// Hermes client
// =============================================================================

#[derive(Clone)]
pub struct PythHermesClient {
    base_url: String,
    client: reqwest::Client,
}

impl PythHermesClient {
    pub fn new() -> Self {
        Self::with_base_url(PYTH_HERMES)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(8))
            .build()
            .expect("failed to build reqwest client");
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// GET /v2/updates/price/latest for the given feed ids.
    pub async fn latest_prices(&self, feed_ids: &[String]) -> Result<Vec<Value>> {
        let url = format!("{}/v2/updates/price/latest", self.base_url);
        let params: Vec<(String, String)> = feed_ids
            .iter()
            .map(|id| ("ids[]".to_string(), id.clone()))
            .chain(std::iter::once(("parsed".to_string(), "true".to_string())))
            .collect();
        let resp = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .context("GET /v2/updates/price/latest request failed")?;
        let payload: Value = resp
            .error_for_status()
            .context("latest prices returned an error status")?
            .json()
            .await
            .context("failed to decode hermes JSON")?;
        Ok(payload
            .get("parsed")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default())
    }
}

impl Default for PythHermesClient {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Feed adapter
// =============================================================================

pub struct PythFeed {
    client: PythHermesClient,
    settings: FeedSettings,
    feed_ids: HashMap<String, String>,
}

impl PythFeed {
    pub fn new(settings: FeedSettings) -> Self {
        Self {
            client: PythHermesClient::new(),
            settings,
            feed_ids: default_feed_ids(),
        }
    }

    pub fn with_client(client: PythHermesClient, settings: FeedSettings) -> Self {
        Self {
            client,
            settings,
            feed_ids: default_feed_ids(),
        }
    }

    fn ids_for(&self, subjects: &[String]) -> Vec<(String, String)> {
        subjects
            .iter()
            .filter_map(|s| {
                self.feed_ids
                    .get(&s.to_uppercase())
                    .map(|id| (s.to_uppercase(), id.clone()))
            })
            .collect()
    }

    async fn poll_once(&self, subjects: &[String], granularity: &str) -> Vec<FeedDataRecord> {
        let pairs = self.ids_for(subjects);
        if pairs.is_empty() {
            return Vec::new();
        }
        let ids: Vec<String> = pairs.iter().map(|(_, id)| id.clone()).collect();
        let rows = match self.client.latest_prices(&ids).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "hermes poll failed");
                return Vec::new();
            }
        };

        let by_id: HashMap<&str, &(String, String)> = pairs
            .iter()
            .map(|pair| (pair.1.trim_start_matches("0x"), pair))
            .collect();

        let mut records = Vec::new();
        for row in &rows {
            let Some(id) = row.get("id").and_then(|v| v.as_str()) else {
                continue;
            };
            let Some((subject, _)) = by_id.get(id.trim_start_matches("0x")).map(|p| (*p).clone())
            else {
                continue;
            };
            if let Some(record) = parse_price_row(&subject, granularity, row) {
                records.push(record);
            }
        }
        records
    }
}

#[async_trait]
impl DataFeed for PythFeed {
    fn source(&self) -> &str {
        "pyth"
    }

    async fn list_subjects(&self) -> Result<Vec<SubjectDescriptor>> {
        let mut subjects: Vec<(&String, &String)> = self.feed_ids.iter().collect();
        subjects.sort();
        Ok(subjects
            .into_iter()
            .map(|(symbol, feed_id)| {
                let mut metadata = JsonMap::new();
                metadata.insert("feed_id".into(), Value::String(feed_id.clone()));
                SubjectDescriptor {
                    symbol: symbol.clone(),
                    display_name: Some(symbol.clone()),
                    kinds: vec![FeedKind::Tick],
                    granularities: vec!["1s".into(), "1m".into()],
                    source: "pyth".into(),
                    metadata,
                }
            })
            .collect())
    }

    async fn listen(
        &self,
        subscription: FeedSubscription,
        sink: mpsc::Sender<FeedDataRecord>,
    ) -> Result<FeedHandle> {
        let feed = PythFeed {
            client: self.client.clone(),
            settings: self.settings.clone(),
            feed_ids: self.feed_ids.clone(),
        };
        let poll = std::time::Duration::from_secs(self.settings.poll_seconds.max(1));

        let task = tokio::spawn(async move {
            let mut watermark: HashMap<String, i64> = HashMap::new();
            loop {
                let records = feed
                    .poll_once(&subscription.subjects, &subscription.granularity)
                    .await;
                for record in records {
                    let last = watermark.get(&record.subject).copied();
                    if last.map_or(false, |ts| record.ts_event <= ts) {
                        continue;
                    }
                    watermark.insert(record.subject.clone(), record.ts_event);
                    if sink.send(record).await.is_err() {
                        return;
                    }
                }
                tokio::time::sleep(poll).await;
            }
        });

        Ok(FeedHandle::new(task))
    }

    async fn fetch(&self, request: FeedFetchRequest) -> Result<Vec<FeedDataRecord>> {
        // Hermes has no history endpoint; a fetch serves the latest point,
        // which is enough for recovery reads and terminates backfill pages.
        let mut records = self
            .poll_once(&request.subjects, &request.granularity)
            .await;
        if let Some(end) = request.end_ts {
            records.retain(|r| r.ts_event <= end);
        }
        if let Some(start) = request.start_ts {
            records.retain(|r| r.ts_event >= start);
        }
        records.sort_by_key(|r| r.ts_event);
        Ok(records)
    }
}

/// Parse one Hermes parsed-price row into a tick record.
fn parse_price_row(subject: &str, granularity: &str, row: &Value) -> Option<FeedDataRecord> {
    let price_obj = row.get("price")?;
    let raw: f64 = match price_obj.get("price")? {
        Value::String(s) => s.parse().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    let expo = price_obj.get("expo")?.as_i64()?;
    let publish_time = price_obj.get("publish_time")?.as_i64()?;
    let price = raw * 10f64.powi(expo as i32);

    let mut values = JsonMap::new();
    values.insert("price".into(), Value::from(price));
    if let Some(conf) = price_obj.get("conf").and_then(|v| match v {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }) {
        values.insert("conf".into(), Value::from(conf * 10f64.powi(expo as i32)));
    }

    Some(FeedDataRecord {
        source: "pyth".into(),
        subject: subject.to_string(),
        kind: FeedKind::Tick,
        granularity: granularity.to_string(),
        ts_event: publish_time,
        values,
        metadata: JsonMap::new(),
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn price_row_normalizes_exponent() {
        let row = serde_json::json!({
            "id": "e62df6c8",
            "price": {"price": "4512345678901", "conf": "12345678", "expo": -8, "publish_time": 1767225600}
        });
        let record = parse_price_row("BTC", "1s", &row).unwrap();
        let price = record.values.get("price").unwrap().as_f64().unwrap();
        assert!((price - 45123.45678901).abs() < 1e-6);
        assert_eq!(record.ts_event, 1767225600);
        assert_eq!(record.kind, FeedKind::Tick);
    }

    #[test]
    fn unknown_subjects_resolve_to_no_ids() {
        let feed = PythFeed::new(FeedSettings::default());
        assert!(feed.ids_for(&["DOGE".into()]).is_empty());
        assert_eq!(feed.ids_for(&["btc".into()]).len(), 1);
    }
}
