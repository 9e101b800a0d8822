// =============================================================================
// Feed-Data Worker — backfill-then-listen live ingest
// =============================================================================
//
// On start the worker closes the gap between the stored watermark and now
// (bounded by the configured backfill window), then opens the live listener.
// Every sink event is a single store append + watermark update + best-effort
// `new_feed_data` publish. A retention tick prunes records older than the
// configured TTL.
// =============================================================================

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::backfill::{feed_data_to_domain, BackfillRequest, BackfillService};
use crate::config::Config;
use crate::events::{EventBus, NEW_FEED_DATA};
use crate::feeds::{DataFeed, FeedDataRecord, FeedSubscription};
use crate::store::FeedRecordStore;
use crate::types::{FeedIngestionState, FeedScope, JsonMap};

pub struct FeedDataWorker {
    feed: Arc<dyn DataFeed>,
    store: Arc<FeedRecordStore>,
    events: Arc<EventBus>,
    config: Arc<Config>,
}

impl FeedDataWorker {
    pub fn new(
        feed: Arc<dyn DataFeed>,
        store: Arc<FeedRecordStore>,
        events: Arc<EventBus>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            feed,
            store,
            events,
            config,
        }
    }

    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        info!(
            provider = %self.config.feed_provider,
            subjects = ?self.config.feed_subjects,
            "feed-data worker started"
        );

        self.initial_backfill().await;

        let (tx, mut rx) = mpsc::channel::<FeedDataRecord>(256);
        let subscription = FeedSubscription {
            subjects: self.config.feed_subjects.clone(),
            kind: self.config.feed_kind,
            granularity: self.config.feed_granularity.clone(),
        };
        let handle = match self.feed.listen(subscription, tx).await {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "failed to open feed listener");
                return;
            }
        };

        let mut retention = tokio::time::interval(std::time::Duration::from_secs(
            self.config.feed_retention_check_seconds.max(1),
        ));
        retention.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                record = rx.recv() => match record {
                    Some(record) => self.ingest(record),
                    None => {
                        warn!("feed listener channel closed");
                        break;
                    }
                },
                _ = retention.tick() => self.prune(),
            }
        }

        handle.stop().await;
        info!("feed-data worker stopped");
    }

    /// Close the watermark → now gap per subject before going live.
    async fn initial_backfill(&self) {
        let now = Utc::now();
        let floor = now - Duration::minutes(self.config.feed_backfill_minutes.max(0));
        let service = BackfillService::new(self.feed.clone(), self.store.clone(), None);

        for subject in &self.config.feed_subjects {
            let scope = FeedScope::new(
                &self.config.feed_provider,
                subject,
                self.config.feed_kind,
                &self.config.feed_granularity,
            );
            let start = self
                .store
                .get_watermark(&scope)
                .and_then(|w| w.last_event_ts)
                .map_or(floor, |wm| wm.max(floor));
            if start >= now {
                continue;
            }

            let request = BackfillRequest::new(
                &self.config.feed_provider,
                vec![subject.clone()],
                self.config.feed_kind,
                &self.config.feed_granularity,
                start,
                now,
            );
            match service.run(request).await {
                Ok(result) => info!(
                    subject = %subject,
                    records = result.records_written,
                    pages = result.pages_fetched,
                    "startup backfill complete"
                ),
                Err(e) => warn!(subject = %subject, error = %e, "startup backfill failed"),
            }
        }
    }

    /// One live record: append, advance watermark, wake the dispatcher.
    fn ingest(&self, record: FeedDataRecord) {
        let domain = feed_data_to_domain(&self.config.feed_provider, &record);
        let ts_event = domain.ts_event;
        let scope = domain.scope();
        self.store.append_records(&[domain]);

        let mut meta = JsonMap::new();
        meta.insert("phase".into(), "live".into());
        self.store.set_watermark(FeedIngestionState {
            source: scope.source.clone(),
            subject: scope.subject.clone(),
            kind: scope.kind,
            granularity: scope.granularity.clone(),
            last_event_ts: Some(ts_event),
            meta,
            updated_at: Utc::now(),
        });

        // Advisory wake-up; never blocks ingestion.
        self.events.publish(NEW_FEED_DATA, "");
    }

    fn prune(&self) {
        let cutoff = Utc::now() - Duration::days(self.config.feed_record_ttl_days.max(0));
        let deleted = self.store.prune_before(cutoff);
        if deleted > 0 {
            info!(deleted, cutoff = %cutoff, "pruned expired feed records");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::types::FeedKind;

    fn test_config() -> Arc<Config> {
        let mut config = Config::from_env();
        config.feed_provider = "test".into();
        config.feed_subjects = vec!["BTC".into()];
        config.feed_kind = FeedKind::Tick;
        config.feed_granularity = "1s".into();
        Arc::new(config)
    }

    struct NullFeed;

    #[async_trait::async_trait]
    impl DataFeed for NullFeed {
        fn source(&self) -> &str {
            "test"
        }
        async fn list_subjects(&self) -> anyhow::Result<Vec<crate::feeds::SubjectDescriptor>> {
            Ok(Vec::new())
        }
        async fn listen(
            &self,
            _subscription: FeedSubscription,
            _sink: mpsc::Sender<FeedDataRecord>,
        ) -> anyhow::Result<crate::feeds::FeedHandle> {
            anyhow::bail!("not used")
        }
        async fn fetch(
            &self,
            _request: crate::feeds::FeedFetchRequest,
        ) -> anyhow::Result<Vec<FeedDataRecord>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn ingest_appends_and_publishes() {
        let store = Arc::new(FeedRecordStore::new());
        let events = Arc::new(EventBus::new(8));
        let worker = FeedDataWorker::new(
            Arc::new(NullFeed),
            store.clone(),
            events.clone(),
            test_config(),
        );

        let mut rx = events.subscribe();
        let mut values = JsonMap::new();
        values.insert("price".into(), serde_json::Value::from(100.0));
        worker.ingest(FeedDataRecord {
            source: "test".into(),
            subject: "BTC".into(),
            kind: FeedKind::Tick,
            granularity: "1s".into(),
            ts_event: 1_767_225_600,
            values,
            metadata: JsonMap::new(),
        });

        let scope = FeedScope::new("test", "BTC", FeedKind::Tick, "1s");
        assert_eq!(store.fetch_records(&scope, None, None, None).len(), 1);

        let watermark = store.get_watermark(&scope).unwrap();
        assert_eq!(
            watermark.meta.get("phase").and_then(|v| v.as_str()),
            Some("live")
        );

        let event = rx.try_recv().unwrap();
        assert_eq!(event.channel, NEW_FEED_DATA);
    }

    #[tokio::test]
    async fn prune_honors_ttl() {
        let store = Arc::new(FeedRecordStore::new());
        let events = Arc::new(EventBus::new(8));
        let worker =
            FeedDataWorker::new(Arc::new(NullFeed), store.clone(), events, test_config());

        let mut values = JsonMap::new();
        values.insert("price".into(), serde_json::Value::from(1.0));
        store.append_records(&[crate::types::FeedRecord {
            source: "test".into(),
            subject: "BTC".into(),
            kind: FeedKind::Tick,
            granularity: "1s".into(),
            ts_event: Utc::now() - Duration::days(30),
            ts_ingested: Utc::now(),
            values,
            meta: JsonMap::new(),
        }]);

        worker.prune();
        let scope = FeedScope::new("test", "BTC", FeedKind::Tick, "1s");
        assert!(store.fetch_records(&scope, None, None, None).is_empty());
    }
}
