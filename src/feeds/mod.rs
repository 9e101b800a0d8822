// =============================================================================
// Feed Adapters — provider-agnostic market data
// =============================================================================
//
// A `DataFeed` exposes pull (`fetch`) and push (`listen`) access over one
// canonical record shape. Providers normalize their native payloads into
// `FeedDataRecord`s; everything downstream (store, backfill, assembler) is
// provider-blind.
//
// Listeners own per-subject monotonicity: a record whose `ts_event` is at or
// before the last emitted record for the same subject is dropped. Adapter
// failures are swallowed and retried on the poll/reconnect cadence.
// =============================================================================

pub mod binance;
pub mod pyth;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::types::{FeedKind, JsonMap};

// =============================================================================
// Canonical contracts
// =============================================================================

/// Provider-native subject descriptor with per-subject capabilities.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SubjectDescriptor {
    pub symbol: String,
    pub display_name: Option<String>,
    pub kinds: Vec<FeedKind>,
    pub granularities: Vec<String>,
    pub source: String,
    pub metadata: JsonMap,
}

/// Push/listen subscription request.
#[derive(Debug, Clone)]
pub struct FeedSubscription {
    pub subjects: Vec<String>,
    pub kind: FeedKind,
    pub granularity: String,
}

/// Pull/fetch request used for backfill and truth windows. Timestamps are
/// epoch seconds.
#[derive(Debug, Clone, Default)]
pub struct FeedFetchRequest {
    pub subjects: Vec<String>,
    pub kind: FeedKind,
    pub granularity: String,
    pub start_ts: Option<i64>,
    pub end_ts: Option<i64>,
    pub limit: Option<usize>,
}

/// Canonical feed record as emitted by adapters. `ts_event` is epoch seconds;
/// the store converts to UTC datetimes on append.
#[derive(Debug, Clone)]
pub struct FeedDataRecord {
    pub source: String,
    pub subject: String,
    pub kind: FeedKind,
    pub granularity: String,
    pub ts_event: i64,
    pub values: JsonMap,
    pub metadata: JsonMap,
}

/// Handle for an active listener; dropping it does not stop the stream,
/// calling [`FeedHandle::stop`] does.
pub struct FeedHandle {
    task: JoinHandle<()>,
}

impl FeedHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}

// =============================================================================
// DataFeed trait
// =============================================================================

#[async_trait]
pub trait DataFeed: Send + Sync {
    /// Canonical source name ("binance", "pyth", …).
    fn source(&self) -> &str;

    /// Subjects the provider can serve.
    async fn list_subjects(&self) -> Result<Vec<SubjectDescriptor>>;

    /// Start pushing canonical records into `sink` until the handle is
    /// stopped. Implementations reconnect/retry internally.
    async fn listen(
        &self,
        subscription: FeedSubscription,
        sink: mpsc::Sender<FeedDataRecord>,
    ) -> Result<FeedHandle>;

    /// One page of historical records, ordered by `ts_event` ascending.
    async fn fetch(&self, request: FeedFetchRequest) -> Result<Vec<FeedDataRecord>>;
}

/// Runtime options shared by providers.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub poll_seconds: u64,
}

impl Default for FeedSettings {
    fn default() -> Self {
        Self { poll_seconds: 5 }
    }
}

/// Instantiate a provider by name.
pub fn create_feed(provider: &str, settings: FeedSettings) -> Result<Arc<dyn DataFeed>> {
    match provider.trim().to_lowercase().as_str() {
        "binance" => Ok(Arc::new(binance::BinanceFeed::new(settings))),
        "pyth" => Ok(Arc::new(pyth::PythFeed::new(settings))),
        other => bail!("unknown feed provider: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_knows_builtin_providers() {
        assert!(create_feed("binance", FeedSettings::default()).is_ok());
        assert!(create_feed("PYTH", FeedSettings::default()).is_ok());
        assert!(create_feed("nope", FeedSettings::default()).is_err());
    }
}
