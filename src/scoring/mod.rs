// =============================================================================
// Score Service — resolve → score → snapshot → leaderboard → merkle
// =============================================================================
//
// One cycle per wake-up:
//   1. resolve actuals on inputs past their horizon (pure over the feed
//      slice; a null result is retried next cycle),
//   2. score PENDING predictions whose input is RESOLVED (scoring failures
//      are captured on the score row; the prediction still advances),
//   3. build virtual ensemble predictions from the cycle and score them,
//   4. write per-model snapshots (challenge summary + metrics),
//   5. rebuild the leaderboard over the rolling windows,
//   6. commit the merkle cycle and announce `score_complete`.
//
// A cycle that errors rolls every repository back and re-enters the loop on
// the next tick.
// =============================================================================

pub mod ensemble;
pub mod metrics;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::contract::ChallengeContract;
use crate::events::{EventBus, SCORE_COMPLETE};
use crate::input_assembler::InputAssembler;
use crate::merkle::MerkleService;
use crate::scoring::ensemble::{
    apply_model_filter, build_ensemble_predictions, compute_weights, MetricsByModel,
    PredictionsByModel,
};
use crate::scoring::metrics::{MetricsContext, MetricsRegistry};
use crate::store::Store;
use crate::types::{
    InputRecord, InputStatus, JsonMap, LeaderboardEntry, LeaderboardScore, PredictionRecord,
    PredictionStatus, RankingScore, ScoreRecord, SnapshotRecord,
};

pub struct ScoreService {
    store: Arc<Store>,
    assembler: Arc<InputAssembler>,
    contract: Arc<ChallengeContract>,
    registry: Arc<MetricsRegistry>,
    merkle: Arc<MerkleService>,
    events: Arc<EventBus>,
    cycle_seconds: u64,
}

impl ScoreService {
    pub fn new(
        store: Arc<Store>,
        assembler: Arc<InputAssembler>,
        contract: Arc<ChallengeContract>,
        registry: Arc<MetricsRegistry>,
        merkle: Arc<MerkleService>,
        events: Arc<EventBus>,
        cycle_seconds: u64,
    ) -> Self {
        Self {
            store,
            assembler,
            contract,
            registry,
            merkle,
            events,
            cycle_seconds: cycle_seconds.max(1),
        }
    }

    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        info!("score service started");
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(self.cycle_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = interval.tick() => {
                    match self.run_once(Utc::now()).await {
                        Ok(true) => {}
                        Ok(false) => info!("no predictions scored this cycle"),
                        Err(e) => {
                            error!(error = %e, "score cycle error");
                            self.store.rollback_all();
                        }
                    }
                }
            }
        }
        info!("score service stopped");
    }

    /// One score cycle. Returns whether anything was scored.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<bool> {
        self.resolve_inputs(now).await;

        let scored = self.score_predictions(now);
        if scored.is_empty() {
            return Ok(false);
        }
        info!(count = scored.len(), "scored predictions");

        // Cycle predictions/scores per real model.
        let mut preds_by_model: PredictionsByModel = HashMap::new();
        let mut scores_by_model: HashMap<String, Vec<ScoreRecord>> = HashMap::new();
        for (prediction, score) in &scored {
            preds_by_model
                .entry(prediction.model_id.clone())
                .or_default()
                .push(prediction.clone());
            scores_by_model
                .entry(prediction.model_id.clone())
                .or_default()
                .push(score.clone());
        }

        // Virtual ensembles join the cycle before metrics run.
        let mut context = MetricsContext {
            model_id: String::new(),
            all_model_predictions: preds_by_model.clone(),
            ensemble_predictions: Default::default(),
        };
        for (prediction, score) in self.build_ensembles(&preds_by_model, &scores_by_model, now) {
            context
                .ensemble_predictions
                .entry(ensemble_name_of(&prediction))
                .or_default()
                .push(prediction.clone());
            context
                .all_model_predictions
                .entry(prediction.model_id.clone())
                .or_default()
                .push(prediction.clone());
            scores_by_model
                .entry(prediction.model_id.clone())
                .or_default()
                .push(score);
            preds_by_model
                .entry(prediction.model_id.clone())
                .or_default()
                .push(prediction);
        }

        let snapshots = self.write_snapshots(&preds_by_model, &scores_by_model, &context, now);
        self.rebuild_leaderboard(now);
        self.merkle.commit_cycle(&snapshots, now);
        self.events.publish(SCORE_COMPLETE, "");
        Ok(true)
    }

    // ── 1. resolve actuals ──────────────────────────────────────────────

    async fn resolve_inputs(&self, now: DateTime<Utc>) -> usize {
        let unresolved = self
            .store
            .inputs
            .find(Some(InputStatus::Received), Some(now));
        if unresolved.is_empty() {
            return 0;
        }

        let mut resolved = 0;
        for mut input in unresolved {
            let Some(resolvable_at) = input.resolvable_at else {
                continue;
            };
            let scope_str = |key: &str| {
                input
                    .scope
                    .get(key)
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            };
            let records = self
                .assembler
                .fetch_window(
                    input.received_at,
                    resolvable_at,
                    scope_str("source").as_deref(),
                    scope_str("subject").as_deref(),
                    scope_str("kind").as_deref(),
                    scope_str("granularity").as_deref(),
                )
                .await;

            let Some(actuals) = (self.contract.resolve_ground_truth)(&records) else {
                continue; // retried next cycle
            };
            input.actuals = Some(actuals);
            input.status = InputStatus::Resolved;
            self.store.inputs.save(input);
            resolved += 1;
        }
        if resolved > 0 {
            info!(resolved, "resolved actuals on inputs");
        }
        resolved
    }

    // ── 2. score pending predictions ────────────────────────────────────

    fn score_predictions(&self, now: DateTime<Utc>) -> Vec<(PredictionRecord, ScoreRecord)> {
        let pending = self.store.predictions.find(Some(PredictionStatus::Pending));
        if pending.is_empty() {
            return Vec::new();
        }

        let mut inputs_by_id: HashMap<String, InputRecord> = HashMap::new();
        for input in self.store.inputs.find(Some(InputStatus::Resolved), None) {
            inputs_by_id.insert(input.id.clone(), input);
        }

        let mut scored = Vec::new();
        for mut prediction in pending {
            let Some(input) = inputs_by_id.get(&prediction.input_id) else {
                continue; // actuals not yet available
            };
            let Some(actuals) = &input.actuals else {
                continue;
            };

            let score = self.score_one(&prediction, actuals, now);
            self.store.scores.save(score.clone());
            prediction.status = PredictionStatus::Scored;
            self.store.predictions.save(prediction.clone());
            scored.push((prediction, score));
        }
        scored
    }

    /// Scoring failures are a property of the challenge, not the prediction:
    /// they produce an unsuccessful score row and the prediction still
    /// advances to SCORED.
    fn score_one(
        &self,
        prediction: &PredictionRecord,
        actuals: &JsonMap,
        now: DateTime<Utc>,
    ) -> ScoreRecord {
        let id = format!("SCR_{}", prediction.id);
        match (self.contract.score_prediction)(&prediction.inference_output, actuals) {
            Ok(result) => match (self.contract.validate_score)(&result) {
                Ok(()) => ScoreRecord {
                    id,
                    prediction_id: prediction.id.clone(),
                    result,
                    success: true,
                    failed_reason: None,
                    scored_at: now,
                },
                Err(reason) => {
                    warn!(prediction = %prediction.id, reason = %reason, "score result rejected");
                    ScoreRecord {
                        id,
                        prediction_id: prediction.id.clone(),
                        result: JsonMap::new(),
                        success: false,
                        failed_reason: Some(reason),
                        scored_at: now,
                    }
                }
            },
            Err(reason) => {
                warn!(prediction = %prediction.id, reason = %reason, "scoring function failed");
                ScoreRecord {
                    id,
                    prediction_id: prediction.id.clone(),
                    result: JsonMap::new(),
                    success: false,
                    failed_reason: Some(reason),
                    scored_at: now,
                }
            }
        }
    }

    // ── 3. ensembles ────────────────────────────────────────────────────

    fn build_ensembles(
        &self,
        preds_by_model: &PredictionsByModel,
        scores_by_model: &HashMap<String, Vec<ScoreRecord>>,
        now: DateTime<Utc>,
    ) -> Vec<(PredictionRecord, ScoreRecord)> {
        if self.contract.ensembles.is_empty() || preds_by_model.is_empty() {
            return Vec::new();
        }

        // Filter metrics: the cycle-mean primary score per model.
        let mut filter_metrics = MetricsByModel::new();
        for (model_id, scores) in scores_by_model {
            let values: Vec<f64> = scores.iter().filter_map(|s| s.value()).collect();
            let mut m = JsonMap::new();
            if !values.is_empty() {
                m.insert(
                    "value".into(),
                    Value::from(values.iter().sum::<f64>() / values.len() as f64),
                );
            }
            filter_metrics.insert(model_id.clone(), m);
        }

        let mut inputs_by_id: HashMap<String, InputRecord> = HashMap::new();
        for input in self.store.inputs.find(Some(InputStatus::Resolved), None) {
            inputs_by_id.insert(input.id.clone(), input);
        }

        let mut out = Vec::new();
        for spec in &self.contract.ensembles {
            let members = apply_model_filter(
                spec.filter.as_ref(),
                &filter_metrics,
                preds_by_model.clone(),
            );
            if members.is_empty() {
                continue;
            }
            let weights = compute_weights(spec.strategy, &members);
            for prediction in build_ensemble_predictions(&spec.name, &weights, &members, now) {
                self.store.predictions.save(prediction.clone());
                let Some(actuals) = inputs_by_id
                    .get(&prediction.input_id)
                    .and_then(|i| i.actuals.clone())
                else {
                    continue;
                };
                let score = self.score_one(&prediction, &actuals, now);
                self.store.scores.save(score.clone());
                out.push((prediction, score));
            }
        }
        out
    }

    // ── 4. snapshots ────────────────────────────────────────────────────

    fn write_snapshots(
        &self,
        preds_by_model: &PredictionsByModel,
        scores_by_model: &HashMap<String, Vec<ScoreRecord>>,
        context: &MetricsContext,
        now: DateTime<Utc>,
    ) -> Vec<SnapshotRecord> {
        let mut snapshots = Vec::new();
        for (model_id, predictions) in preds_by_model {
            let Some(scores) = scores_by_model.get(model_id) else {
                continue;
            };
            if scores.is_empty() {
                continue;
            }

            let results: Vec<JsonMap> = scores.iter().map(|s| s.result.clone()).collect();
            let mut summary = (self.contract.aggregate_snapshot)(&results);
            let metric_values = self.registry.compute(
                &self.contract.metrics,
                predictions,
                scores,
                &context.for_model(model_id),
            );
            for (key, value) in metric_values {
                summary.insert(key, value);
            }

            let period_start = scores
                .iter()
                .map(|s| s.scored_at)
                .min()
                .unwrap_or(now);

            let snapshot = SnapshotRecord {
                id: format!("SNAP_{}_{}", model_id, now.format("%Y%m%d_%H%M%S%.3f")),
                model_id: model_id.clone(),
                period_start,
                period_end: now,
                prediction_count: results.len() as u64,
                result_summary: summary,
                meta: JsonMap::new(),
                created_at: now,
                content_hash: None,
            };
            self.store.snapshots.save(snapshot.clone());
            snapshots.push(snapshot);
        }
        info!(count = snapshots.len(), "wrote snapshots");
        snapshots
    }

    // ── 5. leaderboard ──────────────────────────────────────────────────

    fn rebuild_leaderboard(&self, now: DateTime<Utc>) {
        let aggregation = &self.contract.aggregation;
        let snapshots = self.store.snapshots.find(None, None, None, usize::MAX);

        let mut by_model: HashMap<String, Vec<&SnapshotRecord>> = HashMap::new();
        for snap in &snapshots {
            by_model.entry(snap.model_id.clone()).or_default().push(snap);
        }

        let primary_hours = aggregation
            .windows
            .first()
            .map(|w| w.hours)
            .unwrap_or(24.0);

        let mut entries: Vec<LeaderboardEntry> = Vec::new();
        let mut tie_values: HashMap<String, Vec<f64>> = HashMap::new();
        for (model_id, model_snaps) in &by_model {
            let mean_over = |key: &str, hours: f64| -> f64 {
                let cutoff = now - Duration::seconds((hours * 3600.0) as i64);
                let values: Vec<f64> = model_snaps
                    .iter()
                    .filter(|s| s.period_end >= cutoff)
                    .filter_map(|s| s.result_summary.get(key).and_then(|v| v.as_f64()))
                    .collect();
                if values.is_empty() {
                    0.0
                } else {
                    values.iter().sum::<f64>() / values.len() as f64
                }
            };

            let mut metrics = JsonMap::new();
            for window in &aggregation.windows {
                metrics.insert(
                    window.name.clone(),
                    Value::from(mean_over(&aggregation.ranking_key, window.hours)),
                );
            }
            // The headline value: the ranking key over the primary window.
            let ranking_value = mean_over(&aggregation.ranking_key, primary_hours);
            metrics.insert(aggregation.ranking_key.clone(), Value::from(ranking_value));

            tie_values.insert(
                model_id.clone(),
                aggregation
                    .tie_breakers
                    .iter()
                    .map(|key| mean_over(key, primary_hours))
                    .collect(),
            );

            let model = self.store.models.get(model_id);
            entries.push(LeaderboardEntry {
                model_id: model_id.clone(),
                score: LeaderboardScore {
                    metrics,
                    ranking: RankingScore {
                        key: aggregation.ranking_key.clone(),
                        value: ranking_value,
                        direction: aggregation.ranking_direction.clone(),
                        tie_breakers: aggregation.tie_breakers.clone(),
                    },
                },
                rank: 0,
                model_name: model.as_ref().map(|m| m.name.clone()),
                cruncher_name: model.as_ref().map(|m| m.player_name.clone()),
            });
        }

        let descending = aggregation.descending();
        entries.sort_by(|a, b| {
            let primary = compare_f64(a.score.ranking.value, b.score.ranking.value, descending);
            if primary != std::cmp::Ordering::Equal {
                return primary;
            }
            let empty = Vec::new();
            let ta = tie_values.get(&a.model_id).unwrap_or(&empty);
            let tb = tie_values.get(&b.model_id).unwrap_or(&empty);
            for (va, vb) in ta.iter().zip(tb.iter()) {
                let ord = compare_f64(*va, *vb, descending);
                if ord != std::cmp::Ordering::Equal {
                    return ord;
                }
            }
            a.model_id.cmp(&b.model_id)
        });
        for (idx, entry) in entries.iter_mut().enumerate() {
            entry.rank = idx as u32 + 1;
        }

        let mut meta = JsonMap::new();
        meta.insert("generated_by".into(), Value::String("score_service".into()));
        self.store.leaderboards.save(entries, meta);
    }
}

fn compare_f64(a: f64, b: f64, descending: bool) -> std::cmp::Ordering {
    let ord = a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal);
    if descending {
        ord.reverse()
    } else {
        ord
    }
}

fn ensemble_name_of(prediction: &PredictionRecord) -> String {
    prediction
        .meta
        .get("ensemble_name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| prediction.model_id.clone())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::{
        DataFeed, FeedDataRecord, FeedFetchRequest, FeedHandle, FeedSubscription,
        SubjectDescriptor,
    };
    use crate::types::{FeedKind, FeedRecord, FeedScope};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio::sync::mpsc;

    struct EmptyFeed;

    #[async_trait]
    impl DataFeed for EmptyFeed {
        fn source(&self) -> &str {
            "test"
        }
        async fn list_subjects(&self) -> Result<Vec<SubjectDescriptor>> {
            Ok(Vec::new())
        }
        async fn listen(
            &self,
            _s: FeedSubscription,
            _sink: mpsc::Sender<FeedDataRecord>,
        ) -> Result<FeedHandle> {
            anyhow::bail!("not used")
        }
        async fn fetch(&self, _r: FeedFetchRequest) -> Result<Vec<FeedDataRecord>> {
            Ok(Vec::new())
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn service(store: Arc<Store>) -> ScoreService {
        let assembler = Arc::new(InputAssembler::new(
            Arc::new(EmptyFeed),
            store.feed_records.clone(),
            FeedScope::new("test", "BTCUSDT", FeedKind::Candle, "1m"),
            10,
        ));
        let contract = Arc::new(ChallengeContract::starter("BTCUSDT"));
        let merkle = Arc::new(MerkleService::new(
            store.merkle.clone(),
            store.snapshots.clone(),
        ));
        ScoreService::new(
            store.clone(),
            assembler,
            contract,
            Arc::new(MetricsRegistry::with_builtins()),
            merkle,
            Arc::new(EventBus::new(8)),
            60,
        )
    }

    fn seed_feed(store: &Store, start: DateTime<Utc>, prices: &[f64]) {
        let records: Vec<FeedRecord> = prices
            .iter()
            .enumerate()
            .map(|(i, price)| {
                let mut values = JsonMap::new();
                values.insert("close".into(), Value::from(*price));
                FeedRecord {
                    source: "test".into(),
                    subject: "BTCUSDT".into(),
                    kind: FeedKind::Candle,
                    granularity: "1m".into(),
                    ts_event: start + Duration::minutes(i as i64),
                    ts_ingested: Utc::now(),
                    values,
                    meta: JsonMap::new(),
                }
            })
            .collect();
        store.feed_records.append_records(&records);
    }

    fn seed_input(store: &Store, id: &str, received_at: DateTime<Utc>, horizon_mins: i64) {
        let mut scope = JsonMap::new();
        scope.insert("source".into(), "test".into());
        scope.insert("subject".into(), "BTCUSDT".into());
        scope.insert("kind".into(), "candle".into());
        scope.insert("granularity".into(), "1m".into());
        store.inputs.save(InputRecord {
            id: id.into(),
            raw_data: JsonMap::new(),
            actuals: None,
            status: InputStatus::Received,
            scope,
            received_at,
            resolvable_at: Some(received_at + Duration::minutes(horizon_mins)),
            meta: JsonMap::new(),
        });
    }

    fn seed_prediction(store: &Store, id: &str, model: &str, input: &str, value: f64) {
        let mut output = JsonMap::new();
        output.insert("value".into(), Value::from(value));
        store.predictions.save(PredictionRecord {
            id: id.into(),
            input_id: input.into(),
            model_id: model.into(),
            prediction_config_id: Some("c1".into()),
            scope_key: "default-scope".into(),
            scope: JsonMap::new(),
            status: PredictionStatus::Pending,
            exec_time_ms: 1.0,
            inference_output: output,
            meta: JsonMap::new(),
            performed_at: base_time(),
            resolvable_at: Some(base_time() + Duration::minutes(5)),
        });
    }

    #[tokio::test]
    async fn full_cycle_scores_snapshots_and_ranks() {
        let store = Arc::new(Store::new());
        let t0 = base_time();
        seed_feed(&store, t0, &[100.0, 101.0, 102.0, 103.0, 104.0, 105.0]);
        seed_input(&store, "inp1", t0, 5);
        seed_prediction(&store, "p1", "m1", "inp1", 0.5);
        seed_prediction(&store, "p2", "m2", "inp1", -0.5);

        let service = service(store.clone());
        let now = t0 + Duration::minutes(10);
        assert!(service.run_once(now).await.unwrap());

        // Inputs resolved, predictions advanced, scores persisted.
        let input = store.inputs.get("inp1").unwrap();
        assert_eq!(input.status, InputStatus::Resolved);
        assert!(input.actuals.is_some());

        let p1 = store.predictions.get("p1").unwrap();
        assert_eq!(p1.status, PredictionStatus::Scored);
        let s1 = store.scores.get_by_prediction("p1").unwrap();
        assert!(s1.success);
        // Long call on a +5% move scores positive; short scores negative.
        assert!(s1.value().unwrap() > 0.0);
        let s2 = store.scores.get_by_prediction("p2").unwrap();
        assert!(s2.value().unwrap() < 0.0);

        // Real models and the ensemble got snapshots.
        let m1_snaps = store.snapshots.find(Some("m1"), None, None, 10);
        assert_eq!(m1_snaps.len(), 1);
        assert!(m1_snaps[0].result_summary.get("ic").is_some());
        let ens_snaps = store
            .snapshots
            .find(Some("__ensemble_collective__"), None, None, 10);
        assert_eq!(ens_snaps.len(), 1);

        // Leaderboard ranks m1 above m2 (desc on score value).
        let board = store.leaderboards.get_latest().unwrap();
        assert!(board.entries.len() >= 2);
        let rank_of = |model: &str| {
            board
                .entries
                .iter()
                .find(|e| e.model_id == model)
                .unwrap()
                .rank
        };
        assert!(rank_of("m1") < rank_of("m2"));

        // Merkle cycle committed over the cycle's snapshots.
        let cycle = store.merkle.latest_cycle().unwrap();
        assert_eq!(cycle.snapshot_count, 3);
        assert_eq!(cycle.chained_root, cycle.snapshots_root);
    }

    #[tokio::test]
    async fn unresolved_horizon_keeps_prediction_pending() {
        let store = Arc::new(Store::new());
        let t0 = base_time();
        seed_feed(&store, t0, &[100.0, 101.0]);
        // Horizon far in the future.
        seed_input(&store, "inp1", t0, 600);
        seed_prediction(&store, "p1", "m1", "inp1", 0.5);

        let service = service(store.clone());
        assert!(!service.run_once(t0 + Duration::minutes(1)).await.unwrap());
        assert_eq!(
            store.predictions.get("p1").unwrap().status,
            PredictionStatus::Pending
        );
        assert!(store.scores.get_by_prediction("p1").is_none());
    }

    #[tokio::test]
    async fn missing_ground_truth_retries_next_cycle() {
        let store = Arc::new(Store::new());
        let t0 = base_time();
        // No feed data at all → resolver returns nothing.
        seed_input(&store, "inp1", t0, 5);
        seed_prediction(&store, "p1", "m1", "inp1", 0.5);

        let service = service(store.clone());
        assert!(!service.run_once(t0 + Duration::minutes(10)).await.unwrap());
        let input = store.inputs.get("inp1").unwrap();
        assert_eq!(input.status, InputStatus::Received);

        // Feed data arrives; the next cycle resolves and scores.
        seed_feed(&store, t0, &[100.0, 101.0, 102.0, 103.0, 104.0, 105.0]);
        assert!(service.run_once(t0 + Duration::minutes(11)).await.unwrap());
        assert_eq!(
            store.predictions.get("p1").unwrap().status,
            PredictionStatus::Scored
        );
    }

    #[tokio::test]
    async fn absent_predictions_are_never_scored() {
        let store = Arc::new(Store::new());
        let t0 = base_time();
        seed_feed(&store, t0, &[100.0, 101.0, 102.0, 103.0, 104.0, 105.0]);
        seed_input(&store, "inp1", t0, 5);
        seed_prediction(&store, "p1", "m1", "inp1", 0.5);
        store.predictions.save(PredictionRecord {
            id: "abs1".into(),
            input_id: "inp1".into(),
            model_id: "m2".into(),
            prediction_config_id: Some("c1".into()),
            scope_key: "default-scope".into(),
            scope: JsonMap::new(),
            status: PredictionStatus::Absent,
            exec_time_ms: 0.0,
            inference_output: JsonMap::new(),
            meta: JsonMap::new(),
            performed_at: t0,
            resolvable_at: Some(t0 + Duration::minutes(5)),
        });

        let service = service(store.clone());
        service.run_once(t0 + Duration::minutes(10)).await.unwrap();

        assert!(store.scores.get_by_prediction("abs1").is_none());
        assert_eq!(
            store.predictions.get("abs1").unwrap().status,
            PredictionStatus::Absent
        );
    }

    #[tokio::test]
    async fn scoring_is_idempotent_per_prediction() {
        let store = Arc::new(Store::new());
        let t0 = base_time();
        seed_feed(&store, t0, &[100.0, 101.0, 102.0, 103.0, 104.0, 105.0]);
        seed_input(&store, "inp1", t0, 5);
        seed_prediction(&store, "p1", "m1", "inp1", 0.5);

        let service = service(store.clone());
        service.run_once(t0 + Duration::minutes(10)).await.unwrap();
        let first = store.scores.get_by_prediction("p1").unwrap();

        // A second cycle finds nothing PENDING; the score row is unchanged.
        service.run_once(t0 + Duration::minutes(11)).await.unwrap();
        let second = store.scores.get_by_prediction("p1").unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.result, second.result);
        assert_eq!(first.scored_at, second.scored_at);
    }
}
