// =============================================================================
// Predict Dispatcher — event-driven fan-out loop
// =============================================================================
//
// One wake-up = one cycle: assemble the input, tick every connected model,
// then walk the active configs in order and fan a predict call out for each
// config that has come due. Responses become PENDING rows (FAILED when the
// output does not validate); known models missing from a response set get an
// ABSENT marker row. The loop then sleeps until `new_feed_data` arrives or
// the fallback poll interval elapses.
//
// Per config, predictions are emitted in strict time order; the dispatcher
// is single-threaded per process.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::contract::ChallengeContract;
use crate::events::{EventBus, NEW_FEED_DATA};
use crate::input_assembler::InputAssembler;
use crate::runner::{ModelRun, ModelRunner, RunnerResult};
use crate::store::Store;
use crate::types::{
    InputRecord, InputStatus, JsonMap, Model, PredictionRecord, PredictionStatus,
    ScheduledPredictionConfig,
};

pub struct PredictDispatcher {
    store: Arc<Store>,
    assembler: Arc<InputAssembler>,
    runner: Arc<dyn ModelRunner>,
    contract: Arc<ChallengeContract>,
    events: Arc<EventBus>,
    /// Fallback poll interval when no feed event arrives.
    cycle_seconds: u64,

    next_run: HashMap<String, DateTime<Utc>>,
    known_models: HashMap<String, Model>,
    runner_initialized: bool,
}

impl PredictDispatcher {
    pub fn new(
        store: Arc<Store>,
        assembler: Arc<InputAssembler>,
        runner: Arc<dyn ModelRunner>,
        contract: Arc<ChallengeContract>,
        events: Arc<EventBus>,
        cycle_seconds: u64,
    ) -> Self {
        Self {
            store,
            assembler,
            runner,
            contract,
            events,
            cycle_seconds: cycle_seconds.max(1),
            next_run: HashMap::new(),
            known_models: HashMap::new(),
            runner_initialized: false,
        }
    }

    pub async fn run(&mut self, mut stop: watch::Receiver<bool>) {
        info!("predict dispatcher started");
        loop {
            if *stop.borrow() {
                break;
            }
            match self.run_once(Utc::now()).await {
                Ok(count) if count > 0 => info!(count, "dispatched predictions"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "predict cycle error"),
            }

            let events = self.events.clone();
            let timeout = std::time::Duration::from_secs(self.cycle_seconds);
            tokio::select! {
                _ = events.wait_for(NEW_FEED_DATA, timeout) => {}
                _ = stop.changed() => break,
            }
        }
        info!("predict dispatcher stopped");
    }

    /// One dispatch cycle. Returns the number of predictions recorded.
    pub async fn run_once(&mut self, now: DateTime<Utc>) -> Result<usize> {
        if !self.runner_initialized {
            self.runner.init().await.context("runner init failed")?;
            self.runner_initialized = true;
        }

        // 1. Assemble and persist the input for this tick.
        let raw_data = self.assembler.get_input(now).await;
        let mut input = InputRecord {
            id: format!("INP_{}", now.format("%Y%m%d_%H%M%S%.3f")),
            raw_data,
            actuals: None,
            status: InputStatus::Received,
            scope: JsonMap::new(),
            received_at: now,
            resolvable_at: None,
            meta: JsonMap::new(),
        };
        self.store.inputs.save(input.clone());

        // 2. Tick every connected model; refresh the registry from responders.
        match self.runner.call("tick", &input.raw_data).await {
            Ok(responses) => {
                for (run, _) in &responses {
                    self.register_model(run);
                }
            }
            Err(e) => warn!(error = %e, "tick broadcast failed"),
        }

        // 3. Fan out per due config.
        let configs = self.store.schedules.fetch_active();
        if configs.is_empty() {
            info!("no active prediction configs");
            return Ok(0);
        }

        let mut predictions: Vec<PredictionRecord> = Vec::new();
        for config in &configs {
            if let Some(next) = self.next_run.get(&config.id) {
                if now < *next {
                    continue;
                }
            }
            let batch = self.predict_config(config, &mut input, now).await;
            predictions.extend(batch);
            self.next_run.insert(
                config.id.clone(),
                now + Duration::seconds(config.schedule.prediction_interval_seconds as i64),
            );
        }

        // 4. Persist the cycle's records in one shot.
        self.store.predictions.save_all(&predictions);
        Ok(predictions.len())
    }

    async fn predict_config(
        &mut self,
        config: &ScheduledPredictionConfig,
        input: &mut InputRecord,
        now: DateTime<Utc>,
    ) -> Vec<PredictionRecord> {
        // Scope: scope_key + contract defaults + config template overrides.
        let mut scope = JsonMap::new();
        scope.insert("scope_key".into(), Value::String(config.scope_key.clone()));
        for (key, value) in &self.contract.scope {
            scope.insert(key.clone(), value.clone());
        }
        for (key, value) in &config.scope_template {
            scope.insert(key.clone(), value.clone());
        }

        let resolve_after = config.schedule.resolve_after_seconds.unwrap_or_else(|| {
            scope
                .get("horizon_seconds")
                .and_then(|v| v.as_u64())
                .unwrap_or_else(|| self.contract.horizon_seconds())
        });
        let resolvable_at = now + Duration::seconds(resolve_after as i64);

        // Earliest horizon wins: tighten the input and stamp it with the
        // feed dimensions the resolver will need.
        if input.resolvable_at.map_or(true, |r| resolvable_at < r) {
            input.resolvable_at = Some(resolvable_at);
            let feed_scope = self.assembler.scope();
            let mut input_scope = JsonMap::new();
            input_scope.insert("source".into(), feed_scope.source.clone().into());
            input_scope.insert("subject".into(), feed_scope.subject.clone().into());
            input_scope.insert("kind".into(), feed_scope.kind.to_string().into());
            input_scope.insert(
                "granularity".into(),
                feed_scope.granularity.clone().into(),
            );
            for (key, value) in &scope {
                if key != "scope_key" {
                    input_scope.insert(key.clone(), value.clone());
                }
            }
            input.scope = input_scope;
            self.store.inputs.save(input.clone());
        }

        let responses = match self.runner.call(&self.contract.call_method, &scope).await {
            Ok(responses) => responses,
            Err(e) => {
                warn!(config = %config.id, error = %e, "predict fan-out failed");
                Vec::new()
            }
        };

        let mut records = Vec::new();
        let mut seen: std::collections::HashSet<String> = Default::default();
        for (run, result) in &responses {
            self.register_model(run);
            seen.insert(run.model_id.clone());
            records.push(self.build_record(run, result, config, input, &scope, now, resolvable_at));
        }

        // Every known model that stayed silent gets an ABSENT marker.
        let known: Vec<String> = self.known_models.keys().cloned().collect();
        for model_id in known {
            if !seen.contains(&model_id) {
                records.push(PredictionRecord {
                    id: prediction_id(PredictionStatus::Absent, &model_id, &config.scope_key, now),
                    input_id: input.id.clone(),
                    model_id,
                    prediction_config_id: Some(config.id.clone()),
                    scope_key: config.scope_key.clone(),
                    scope: scope_without_key(&scope),
                    status: PredictionStatus::Absent,
                    exec_time_ms: 0.0,
                    inference_output: JsonMap::new(),
                    meta: JsonMap::new(),
                    performed_at: now,
                    resolvable_at: Some(resolvable_at),
                });
            }
        }

        records
    }

    fn build_record(
        &self,
        run: &ModelRun,
        result: &RunnerResult,
        config: &ScheduledPredictionConfig,
        input: &InputRecord,
        scope: &JsonMap,
        now: DateTime<Utc>,
        resolvable_at: DateTime<Utc>,
    ) -> PredictionRecord {
        let mut output = match &result.result {
            Value::Object(map) => map.clone(),
            Value::Null => JsonMap::new(),
            other => {
                let mut map = JsonMap::new();
                map.insert("result".into(), other.clone());
                map
            }
        };

        let mut meta = JsonMap::new();
        let status = if result.status == "SUCCESS" {
            match (self.contract.validate_output)(&output) {
                Ok(()) => PredictionStatus::Pending,
                Err(reason) => {
                    warn!(model = %run.model_id, reason = %reason, "inference output rejected");
                    let mut wrapped = JsonMap::new();
                    wrapped.insert("_validation_error".into(), Value::String(reason));
                    wrapped.insert("raw_output".into(), Value::Object(output));
                    output = wrapped;
                    PredictionStatus::Failed
                }
            }
        } else {
            meta.insert("runner_status".into(), Value::String(result.status.clone()));
            PredictionStatus::Failed
        };

        PredictionRecord {
            id: prediction_id(status, &run.model_id, &config.scope_key, now),
            input_id: input.id.clone(),
            model_id: run.model_id.clone(),
            prediction_config_id: Some(config.id.clone()),
            scope_key: config.scope_key.clone(),
            scope: scope_without_key(scope),
            status,
            exec_time_ms: result.exec_time_us / 1000.0,
            inference_output: output,
            meta,
            performed_at: now,
            resolvable_at: Some(resolvable_at),
        }
    }

    fn register_model(&mut self, run: &ModelRun) {
        let model = run.to_model();
        self.known_models.insert(model.id.clone(), model.clone());
        self.store.models.save(model);
    }
}

/// `{PRE|ABS}_{model}_{sanitized_scope_key}_{timestamp}` — unique per
/// (model, scope_key, dispatch time).
fn prediction_id(
    status: PredictionStatus,
    model_id: &str,
    scope_key: &str,
    now: DateTime<Utc>,
) -> String {
    let suffix = if status == PredictionStatus::Absent {
        "ABS"
    } else {
        "PRE"
    };
    let safe_key: String = scope_key
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "{}_{}_{}_{}",
        suffix,
        model_id,
        safe_key,
        now.format("%Y%m%d_%H%M%S%.3f")
    )
}

fn scope_without_key(scope: &JsonMap) -> JsonMap {
    let mut out = scope.clone();
    out.remove("scope_key");
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feeds::{DataFeed, FeedDataRecord, FeedFetchRequest, FeedHandle, FeedSubscription, SubjectDescriptor};
    use crate::types::{FeedKind, FeedScope, Schedule};
    use async_trait::async_trait;
    use parking_lot::Mutex;
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

    /// Runner serving a fixed response set per predict call.
    struct ScriptedRunner {
        responses: Mutex<Vec<Vec<(ModelRun, RunnerResult)>>>,
    }

    impl ScriptedRunner {
        fn new(responses: Vec<Vec<(ModelRun, RunnerResult)>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl ModelRunner for ScriptedRunner {
        async fn init(&self) -> Result<()> {
            Ok(())
        }

        async fn call(
            &self,
            method: &str,
            _payload: &JsonMap,
        ) -> Result<Vec<(ModelRun, RunnerResult)>> {
            if method == "tick" {
                return Ok(Vec::new());
            }
            let mut responses = self.responses.lock();
            if responses.is_empty() {
                Ok(Vec::new())
            } else {
                Ok(responses.remove(0))
            }
        }
    }

    fn run_for(model_id: &str) -> ModelRun {
        ModelRun {
            model_id: model_id.into(),
            model_name: format!("{model_id}-name"),
            deployment_id: "dep".into(),
            cruncher_id: "p".into(),
            cruncher_name: "P".into(),
        }
    }

    fn success(value: f64) -> RunnerResult {
        RunnerResult {
            status: "SUCCESS".into(),
            result: serde_json::json!({ "value": value }),
            exec_time_us: 1000.0,
        }
    }

    fn dispatcher(
        runner: Arc<dyn ModelRunner>,
        configs: Vec<ScheduledPredictionConfig>,
    ) -> (PredictDispatcher, Arc<Store>) {
        let store = Arc::new(Store::new());
        store.schedules.replace_all(configs);
        let assembler = Arc::new(InputAssembler::new(
            Arc::new(EmptyFeed),
            store.feed_records.clone(),
            FeedScope::new("test", "BTCUSDT", FeedKind::Candle, "1m"),
            3,
        ));
        let contract = Arc::new(ChallengeContract::starter("BTCUSDT"));
        let events = Arc::new(EventBus::new(8));
        let dispatcher = PredictDispatcher::new(
            store.clone(),
            assembler,
            runner,
            contract,
            events,
            60,
        );
        (dispatcher, store)
    }

    fn config(id: &str, interval: u64) -> ScheduledPredictionConfig {
        ScheduledPredictionConfig {
            id: id.into(),
            scope_key: format!("{id}-scope"),
            scope_template: JsonMap::new(),
            schedule: Schedule {
                prediction_interval_seconds: interval,
                resolve_after_seconds: Some(120),
            },
            active: true,
            order: 0,
            meta: JsonMap::new(),
        }
    }

    #[tokio::test]
    async fn absent_model_gets_marker_row() {
        // m1 and m2 respond in cycle 1; only m1 responds in cycle 2.
        let runner = Arc::new(ScriptedRunner::new(vec![
            vec![
                (run_for("m1"), success(0.1)),
                (run_for("m2"), success(0.2)),
            ],
            vec![(run_for("m1"), success(0.3))],
        ]));
        let (mut dispatcher, store) = dispatcher(runner, vec![config("c1", 1)]);

        let t0 = Utc::now();
        dispatcher.run_once(t0).await.unwrap();
        dispatcher.run_once(t0 + Duration::seconds(2)).await.unwrap();

        let absent = store.predictions.find(Some(PredictionStatus::Absent));
        assert_eq!(absent.len(), 1);
        assert_eq!(absent[0].model_id, "m2");
        assert!(absent[0].inference_output.is_empty());
        assert!(absent[0].id.starts_with("ABS_m2_"));

        let pending = store.predictions.find(Some(PredictionStatus::Pending));
        assert_eq!(pending.len(), 3);
    }

    #[tokio::test]
    async fn invalid_output_is_failed_with_detail() {
        let bad = RunnerResult {
            status: "SUCCESS".into(),
            result: serde_json::json!({ "value": "not-a-number" }),
            exec_time_us: 0.0,
        };
        let runner = Arc::new(ScriptedRunner::new(vec![vec![(run_for("m1"), bad)]]));
        let (mut dispatcher, store) = dispatcher(runner, vec![config("c1", 60)]);

        dispatcher.run_once(Utc::now()).await.unwrap();

        let failed = store.predictions.find(Some(PredictionStatus::Failed));
        assert_eq!(failed.len(), 1);
        assert!(failed[0]
            .inference_output
            .get("_validation_error")
            .is_some());
        assert!(failed[0].inference_output.get("raw_output").is_some());
    }

    #[tokio::test]
    async fn runner_error_status_is_failed() {
        let timeout = RunnerResult {
            status: "TIMEOUT".into(),
            result: Value::Null,
            exec_time_us: 0.0,
        };
        let runner = Arc::new(ScriptedRunner::new(vec![vec![(run_for("m1"), timeout)]]));
        let (mut dispatcher, store) = dispatcher(runner, vec![config("c1", 60)]);

        dispatcher.run_once(Utc::now()).await.unwrap();

        let failed = store.predictions.find(Some(PredictionStatus::Failed));
        assert_eq!(failed.len(), 1);
        assert_eq!(
            failed[0].meta.get("runner_status").and_then(|v| v.as_str()),
            Some("TIMEOUT")
        );
    }

    #[tokio::test]
    async fn config_interval_gates_dispatch() {
        let runner = Arc::new(ScriptedRunner::new(vec![
            vec![(run_for("m1"), success(0.1))],
            vec![(run_for("m1"), success(0.2))],
        ]));
        let (mut dispatcher, store) = dispatcher(runner, vec![config("c1", 300)]);

        let t0 = Utc::now();
        assert_eq!(dispatcher.run_once(t0).await.unwrap(), 1);
        // Not yet due.
        assert_eq!(
            dispatcher.run_once(t0 + Duration::seconds(10)).await.unwrap(),
            0
        );
        // Due again.
        assert_eq!(
            dispatcher.run_once(t0 + Duration::seconds(301)).await.unwrap(),
            1
        );
        assert_eq!(store.predictions.find(None).len(), 2);
    }

    #[tokio::test]
    async fn input_resolvable_at_tightens_to_earliest_horizon() {
        let mut slow = config("slow", 60);
        slow.schedule.resolve_after_seconds = Some(600);
        slow.order = 0;
        let mut fast = config("fast", 60);
        fast.schedule.resolve_after_seconds = Some(60);
        fast.order = 1;

        let runner = Arc::new(ScriptedRunner::new(vec![
            vec![(run_for("m1"), success(0.1))],
            vec![(run_for("m1"), success(0.1))],
        ]));
        let (mut dispatcher, store) = dispatcher(runner, vec![slow, fast]);

        let t0 = Utc::now();
        dispatcher.run_once(t0).await.unwrap();

        let inputs = store.inputs.find(None, None);
        assert_eq!(inputs.len(), 1);
        let resolvable = inputs[0].resolvable_at.unwrap();
        assert_eq!(resolvable, t0 + Duration::seconds(60));
        // Feed dims stamped for the resolver.
        assert_eq!(
            inputs[0].scope.get("source").and_then(|v| v.as_str()),
            Some("test")
        );
        assert!(inputs[0].scope.get("scope_key").is_none());
    }
}
