// =============================================================================
// Central Application State
// =============================================================================
//
// The single shared value every worker and API handler hangs off. All
// subsystems are `Arc`-shared; the store owns the interior locks, so
// `AppState` itself carries no mutexes.
// =============================================================================

use std::sync::Arc;

use anyhow::{anyhow, Result};

use crate::api::schema::{auto_report_schema, ReportSchema};
use crate::config::Config;
use crate::contract::ChallengeContract;
use crate::events::EventBus;
use crate::feeds::DataFeed;
use crate::input_assembler::InputAssembler;
use crate::merkle::MerkleService;
use crate::parquet_sink::ParquetBackfillSink;
use crate::store::Store;
use crate::types::FeedScope;

pub struct AppState {
    pub config: Arc<Config>,
    pub contract: Arc<ChallengeContract>,
    pub store: Arc<Store>,
    pub events: Arc<EventBus>,
    pub feed: Arc<dyn DataFeed>,
    pub assembler: Arc<InputAssembler>,
    pub parquet_sink: Arc<ParquetBackfillSink>,
    pub merkle: Arc<MerkleService>,
    pub report_schema: ReportSchema,
    pub start_time: std::time::Instant,
}

impl AppState {
    /// Wire the shared state. Validates the report schema — an invalid UI
    /// contract aborts startup.
    pub fn build(
        config: Arc<Config>,
        contract: Arc<ChallengeContract>,
        feed: Arc<dyn DataFeed>,
    ) -> Result<Arc<Self>> {
        let report_schema = auto_report_schema(&contract);
        report_schema
            .validate()
            .map_err(|e| anyhow!("invalid report schema: {e}"))?;

        let store = Arc::new(Store::new());
        let events = Arc::new(EventBus::default());
        let assembler = Arc::new(InputAssembler::new(
            feed.clone(),
            store.feed_records.clone(),
            FeedScope::new(
                &config.feed_provider,
                config.primary_subject(),
                config.feed_kind,
                &config.feed_granularity,
            ),
            config.feed_candles_window,
        ));
        let merkle = Arc::new(MerkleService::new(
            store.merkle.clone(),
            store.snapshots.clone(),
        ));
        let parquet_sink = Arc::new(ParquetBackfillSink::new(config.backfill_data_dir.clone()));

        Ok(Arc::new(Self {
            config,
            contract,
            store,
            events,
            feed,
            assembler,
            parquet_sink,
            merkle,
            report_schema,
            start_time: std::time::Instant::now(),
        }))
    }
}
