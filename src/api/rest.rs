// =============================================================================
// Read API — Axum router and handlers
// =============================================================================
//
// Public reads (health, schema, leaderboard, models, feeds), gated reads
// (predictions, snapshots, checkpoints) and admin mutations (backfill
// trigger, checkpoint settlement) over the shared state. Typed errors map to
// HTTP statuses; all times on the wire are RFC 3339 UTC.
// =============================================================================

use std::sync::Arc;

use axum::extract::{Path, RawQuery, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::app_state::AppState;
use crate::backfill::{BackfillRequest, BackfillService};
use crate::contract::Aggregation;
use crate::error::CoordinatorError;
use crate::types::{
    CheckpointRecord, CheckpointStatus, FeedKind, JsonMap, PredictionRecord, ScoreRecord,
    FRAC_64_MULTIPLIER,
};

use super::auth::api_key_gate;
use super::schema::flatten_metrics;

type ApiResult = Result<Json<Value>, CoordinatorError>;

// =============================================================================
// Router
// =============================================================================

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/healthz", get(healthz))
        .route("/reports/schema", get(report_schema))
        .route(
            "/reports/schema/leaderboard-columns",
            get(report_schema_columns),
        )
        .route(
            "/reports/schema/metrics-widgets",
            get(report_schema_widgets),
        )
        .route("/reports/models", get(list_models))
        .route("/reports/leaderboard", get(leaderboard))
        .route("/reports/feeds", get(feeds_index))
        .route("/reports/feeds/tail", get(feeds_tail))
        // ── Reads ───────────────────────────────────────────────────
        .route("/reports/models/global", get(models_global))
        .route("/reports/models/params", get(models_params))
        .route("/reports/models/:model_id/diversity", get(model_diversity))
        .route("/reports/predictions", get(predictions))
        .route("/reports/snapshots", get(snapshots))
        .route("/reports/checkpoints", get(checkpoints))
        .route("/reports/checkpoints/latest", get(latest_checkpoint))
        .route(
            "/reports/checkpoints/:checkpoint_id/payload",
            get(checkpoint_payload),
        )
        .route(
            "/reports/checkpoints/:checkpoint_id/emission",
            get(checkpoint_emission),
        )
        .route(
            "/reports/checkpoints/:checkpoint_id/emission/cli-format",
            get(checkpoint_emission_cli),
        )
        .route("/reports/emissions/latest", get(latest_emission))
        // ── Admin ───────────────────────────────────────────────────
        .route(
            "/reports/checkpoints/:checkpoint_id/confirm",
            post(confirm_checkpoint),
        )
        .route(
            "/reports/checkpoints/:checkpoint_id/status",
            patch(update_checkpoint_status),
        )
        .route("/reports/backfill", post(trigger_backfill))
        .route("/reports/backfill/jobs", get(backfill_jobs))
        .route("/reports/backfill/jobs/:job_id", get(backfill_job))
        .route("/reports/backfill/feeds", get(feeds_index))
        // ── Data files ──────────────────────────────────────────────
        .route("/data/backfill/index", get(data_file_index))
        .route("/data/backfill/*rel_path", get(data_file_download))
        // ── Middleware & state ──────────────────────────────────────
        .layer(axum::middleware::from_fn_with_state(
            state.config.clone(),
            api_key_gate,
        ))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health & schema
// =============================================================================

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn report_schema(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::to_value(&state.report_schema).unwrap_or_default())
}

async fn report_schema_columns(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::to_value(&state.report_schema.leaderboard_columns).unwrap_or_default())
}

async fn report_schema_widgets(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::to_value(&state.report_schema.metrics_widgets).unwrap_or_default())
}

// =============================================================================
// Models & leaderboard
// =============================================================================

async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    let rows: Vec<Value> = state
        .store
        .models
        .fetch_all()
        .into_iter()
        .map(|m| {
            json!({
                "model_id": m.id,
                "model_name": m.name,
                "cruncher_name": m.player_name,
                "cruncher_id": m.player_id,
                "deployment_id": m.deployment_identifier,
            })
        })
        .collect();
    Json(Value::Array(rows))
}

async fn leaderboard(State(state): State<Arc<AppState>>) -> Json<Value> {
    let Some(board) = state.store.leaderboards.get_latest() else {
        return Json(Value::Array(Vec::new()));
    };

    let mut rows: Vec<Value> = board
        .entries
        .iter()
        .map(|entry| {
            let mut row = JsonMap::new();
            row.insert("created_at".into(), rfc3339(board.created_at));
            row.insert("model_id".into(), entry.model_id.clone().into());
            row.insert(
                "score_metrics".into(),
                Value::Object(entry.score.metrics.clone()),
            );
            row.insert(
                "score_ranking".into(),
                serde_json::to_value(&entry.score.ranking).unwrap_or_default(),
            );
            for (key, value) in flatten_metrics(&entry.score.metrics) {
                row.insert(key, value);
            }
            row.insert("rank".into(), entry.rank.into());
            row.insert(
                "model_name".into(),
                entry.model_name.clone().map(Value::from).unwrap_or(Value::Null),
            );
            row.insert(
                "cruncher_name".into(),
                entry
                    .cruncher_name
                    .clone()
                    .map(Value::from)
                    .unwrap_or(Value::Null),
            );
            Value::Object(row)
        })
        .collect();
    rows.sort_by_key(|row| row.get("rank").and_then(|r| r.as_u64()).unwrap_or(999_999));
    Json(Value::Array(rows))
}

// =============================================================================
// Rolling metrics & predictions
// =============================================================================

async fn models_global(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Json<Value> {
    let (model_ids, start, end) = range_params(&state, &raw);
    let rows = scored_by_model(&state, &model_ids, start, end)
        .into_iter()
        .filter_map(|(model_id, scored)| {
            let timed = timed_scores(&scored);
            if timed.is_empty() {
                return None;
            }
            let metrics = window_metrics(&timed, &state.contract.aggregation, Utc::now());
            let performed_at = scored
                .iter()
                .map(|(p, _)| p.performed_at)
                .max()
                .unwrap_or(end);
            Some(Value::Object(metric_row(
                &state, &model_id, None, &metrics, performed_at,
            )))
        })
        .collect();
    Json(Value::Array(rows))
}

async fn models_params(
    State(state): State<Arc<AppState>>,
    RawQuery(raw): RawQuery,
) -> Json<Value> {
    let (model_ids, start, end) = range_params(&state, &raw);

    // Regroup by (model, scope_key).
    let mut grouped: std::collections::BTreeMap<
        (String, String),
        Vec<(PredictionRecord, ScoreRecord)>,
    > = Default::default();
    for (model_id, scored) in scored_by_model(&state, &model_ids, start, end) {
        for (prediction, score) in scored {
            grouped
                .entry((model_id.clone(), prediction.scope_key.clone()))
                .or_default()
                .push((prediction, score));
        }
    }

    let rows: Vec<Value> = grouped
        .into_iter()
        .filter_map(|((model_id, scope_key), scored)| {
            let timed = timed_scores(&scored);
            if timed.is_empty() {
                return None;
            }
            let metrics = window_metrics(&timed, &state.contract.aggregation, Utc::now());
            let performed_at = scored
                .iter()
                .map(|(p, _)| p.performed_at)
                .max()
                .unwrap_or(end);
            let mut row = metric_row(&state, &model_id, Some(&scope_key), &metrics, performed_at);
            if let Some((prediction, _)) = scored.last() {
                row.insert("scope".into(), Value::Object(prediction.scope.clone()));
            }
            Some(Value::Object(row))
        })
        .collect();
    Json(Value::Array(rows))
}

async fn predictions(State(state): State<Arc<AppState>>, RawQuery(raw): RawQuery) -> Json<Value> {
    let (model_ids, start, end) = range_params(&state, &raw);
    let mut rows: Vec<Value> = Vec::new();
    for prediction in state.store.predictions.find_range(&model_ids, start, end) {
        let score = state.store.scores.get_by_prediction(&prediction.id);
        rows.push(json!({
            "model_id": prediction.model_id,
            "prediction_config_id": prediction.prediction_config_id,
            "scope_key": prediction.scope_key,
            "scope": prediction.scope,
            "status": prediction.status.to_string(),
            "score_value": score.as_ref().and_then(|s| s.value()),
            "score_success": score.as_ref().map(|s| s.success).unwrap_or(false),
            "score_failed_reason": score
                .as_ref()
                .map(|s| s.failed_reason.clone())
                .unwrap_or_else(|| Some("Prediction not scored".into())),
            "scored_at": score.as_ref().map(|s| rfc3339(s.scored_at)),
            "performed_at": rfc3339(prediction.performed_at),
        }));
    }
    Json(Value::Array(rows))
}

// =============================================================================
// Diversity feedback
// =============================================================================

async fn model_diversity(
    State(state): State<Arc<AppState>>,
    Path(model_id): Path<String>,
) -> ApiResult {
    let snapshots = state.store.snapshots.find(Some(&model_id), None, None, 1);
    let Some(snapshot) = snapshots.into_iter().next() else {
        return Err(CoordinatorError::NotFound(format!(
            "no snapshots for model {model_id}"
        )));
    };

    let rank = state.store.leaderboards.get_latest().and_then(|board| {
        board
            .entries
            .iter()
            .find(|e| e.model_id == model_id)
            .map(|e| e.rank)
    });

    let summary_f64 = |key: &str| {
        snapshot
            .result_summary
            .get(key)
            .and_then(|v| v.as_f64())
    };
    let correlation = summary_f64("model_correlation").unwrap_or(0.0);
    let contribution = summary_f64("contribution");
    let diversity_score = 1.0 - correlation;

    let mut metrics = JsonMap::new();
    for key in [
        "ic",
        "model_correlation",
        "ensemble_correlation",
        "contribution",
        "fnc",
    ] {
        if let Some(v) = summary_f64(key) {
            metrics.insert(key.into(), Value::from(v));
        }
    }

    Ok(Json(json!({
        "model_id": model_id,
        "rank": rank,
        "diversity_score": diversity_score,
        "metrics": metrics,
        "guidance": diversity_guidance(correlation, contribution),
    })))
}

/// Plain-language feedback for competitors, derived from the latest
/// snapshot's correlation/contribution metrics.
fn diversity_guidance(correlation: f64, contribution: Option<f64>) -> Vec<String> {
    let mut guidance = Vec::new();
    if correlation > 0.7 {
        guidance.push(format!(
            "High correlation with other models ({correlation:.2}). Consider a different \
             feature set, horizon or signal transformation to stand out."
        ));
    }
    if let Some(c) = contribution {
        if c < 0.0 {
            guidance.push(
                "Negative contribution: the ensemble currently performs better without this \
                 model's signal."
                    .to_string(),
            );
        }
    }
    if correlation < 0.3 && contribution.map_or(false, |c| c > 0.0) {
        guidance.push(
            "Unique alpha: low correlation with the field and a positive ensemble \
             contribution. Keep it up."
                .to_string(),
        );
    }
    if guidance.is_empty() {
        guidance.push("Model diversity looks healthy.".to_string());
    }
    guidance
}

// =============================================================================
// Feeds
// =============================================================================

async fn feeds_index(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::to_value(state.store.feed_records.list_indexed_feeds()).unwrap_or_default())
}

async fn feeds_tail(State(state): State<Arc<AppState>>, RawQuery(raw): RawQuery) -> Json<Value> {
    let params = query_pairs(&raw);
    let get = |key: &str| params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
    let limit = get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(20)
        .clamp(1, 200);

    let rows: Vec<Value> = state
        .store
        .feed_records
        .tail_records(get("source"), get("subject"), get("kind"), get("granularity"), limit)
        .into_iter()
        .map(|r| {
            json!({
                "source": r.source,
                "subject": r.subject,
                "kind": r.kind.to_string(),
                "granularity": r.granularity,
                "ts_event": rfc3339(r.ts_event),
                "ts_ingested": rfc3339(r.ts_ingested),
                "values": r.values,
                "meta": r.meta,
            })
        })
        .collect();
    Json(Value::Array(rows))
}

// =============================================================================
// Snapshots
// =============================================================================

async fn snapshots(State(state): State<Arc<AppState>>, RawQuery(raw): RawQuery) -> Json<Value> {
    let params = query_pairs(&raw);
    let get = |key: &str| params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
    let limit = get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(100)
        .clamp(1, 1000);

    let rows: Vec<Value> = state
        .store
        .snapshots
        .find(
            get("model_id"),
            get("since").and_then(parse_datetime),
            get("until").and_then(parse_datetime),
            limit,
        )
        .into_iter()
        .map(|s| {
            json!({
                "id": s.id,
                "model_id": s.model_id,
                "period_start": rfc3339(s.period_start),
                "period_end": rfc3339(s.period_end),
                "prediction_count": s.prediction_count,
                "result_summary": s.result_summary,
                "content_hash": s.content_hash,
                "created_at": rfc3339(s.created_at),
            })
        })
        .collect();
    Json(Value::Array(rows))
}

// =============================================================================
// Checkpoints & emissions
// =============================================================================

async fn checkpoints(State(state): State<Arc<AppState>>, RawQuery(raw): RawQuery) -> Json<Value> {
    let params = query_pairs(&raw);
    let status = params
        .iter()
        .find(|(k, _)| k == "status")
        .and_then(|(_, v)| CheckpointStatus::parse(v));
    let limit = params
        .iter()
        .find(|(k, _)| k == "limit")
        .and_then(|(_, v)| v.parse::<usize>().ok())
        .unwrap_or(20)
        .clamp(1, 100);

    let rows: Vec<Value> = state
        .store
        .checkpoints
        .find(status, limit)
        .iter()
        .map(checkpoint_to_json)
        .collect();
    Json(Value::Array(rows))
}

async fn latest_checkpoint(State(state): State<Arc<AppState>>) -> ApiResult {
    let checkpoint = state
        .store
        .checkpoints
        .get_latest()
        .ok_or_else(|| CoordinatorError::NotFound("no checkpoints found".into()))?;
    Ok(Json(checkpoint_to_json(&checkpoint)))
}

async fn checkpoint_payload(
    State(state): State<Arc<AppState>>,
    Path(checkpoint_id): Path<String>,
) -> ApiResult {
    let checkpoint = get_checkpoint(&state, &checkpoint_id)?;
    Ok(Json(json!({
        "checkpoint_id": checkpoint.id,
        "period_start": rfc3339(checkpoint.period_start),
        "period_end": rfc3339(checkpoint.period_end),
        "merkle_root": checkpoint.merkle_root,
        "entries": checkpoint.entries,
    })))
}

async fn checkpoint_emission(
    State(state): State<Arc<AppState>>,
    Path(checkpoint_id): Path<String>,
) -> ApiResult {
    let checkpoint = get_checkpoint(&state, &checkpoint_id)?;
    let emission = checkpoint
        .entries
        .first()
        .ok_or_else(|| CoordinatorError::NotFound("no emission data in checkpoint".into()))?;
    Ok(Json(serde_json::to_value(emission).unwrap_or_default()))
}

async fn checkpoint_emission_cli(
    State(state): State<Arc<AppState>>,
    Path(checkpoint_id): Path<String>,
) -> ApiResult {
    let checkpoint = get_checkpoint(&state, &checkpoint_id)?;
    let emission = checkpoint
        .entries
        .first()
        .ok_or_else(|| CoordinatorError::NotFound("no emission data in checkpoint".into()))?;
    Ok(Json(emission_cli_format(&checkpoint, emission)))
}

async fn latest_emission(State(state): State<Arc<AppState>>) -> ApiResult {
    let checkpoint = state
        .store
        .checkpoints
        .get_latest()
        .ok_or_else(|| CoordinatorError::NotFound("no checkpoints found".into()))?;
    let emission = checkpoint
        .entries
        .first()
        .ok_or_else(|| CoordinatorError::NotFound("no emission data in checkpoint".into()))?;
    Ok(Json(json!({
        "checkpoint_id": checkpoint.id,
        "status": checkpoint.status.to_string(),
        "period_start": rfc3339(checkpoint.period_start),
        "period_end": rfc3339(checkpoint.period_end),
        "emission": emission,
    })))
}

/// CLI-friendly form: `cruncher_index` resolved to model ids through the
/// checkpoint's ranking snapshot, percentages as decimals rounded to six
/// digits.
fn emission_cli_format(
    checkpoint: &CheckpointRecord,
    emission: &crate::types::EmissionCheckpoint,
) -> Value {
    let ranking = checkpoint
        .meta
        .get("ranking")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    let to_pct = |reward_pct: i64| {
        let pct = reward_pct as f64 / FRAC_64_MULTIPLIER as f64 * 100.0;
        (pct * 1e6).round() / 1e6
    };

    let mut crunch_emission = JsonMap::new();
    for reward in &emission.cruncher_rewards {
        let key = ranking
            .get(reward.cruncher_index)
            .and_then(|entry| entry.get("model_id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| reward.cruncher_index.to_string());
        crunch_emission.insert(key, Value::from(to_pct(reward.reward_pct)));
    }

    let provider_map = |rewards: &[crate::types::ProviderReward]| {
        let mut map = JsonMap::new();
        for reward in rewards {
            map.insert(reward.provider.clone(), Value::from(to_pct(reward.reward_pct)));
        }
        Value::Object(map)
    };

    json!({
        "crunch": emission.crunch,
        "crunchEmission": crunch_emission,
        "computeProvider": provider_map(&emission.compute_provider_rewards),
        "dataProvider": provider_map(&emission.data_provider_rewards),
    })
}

async fn confirm_checkpoint(
    State(state): State<Arc<AppState>>,
    Path(checkpoint_id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult {
    let mut checkpoint = get_checkpoint(&state, &checkpoint_id)?;
    if checkpoint.status != CheckpointStatus::Pending {
        return Err(CoordinatorError::Conflict(format!(
            "checkpoint is {}, expected PENDING",
            checkpoint.status
        )));
    }
    let tx_hash = body
        .get("tx_hash")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| CoordinatorError::Validation("tx_hash required".into()))?;

    checkpoint.status = CheckpointStatus::Submitted;
    checkpoint.tx_hash = Some(tx_hash.to_string());
    checkpoint.submitted_at = Some(Utc::now());
    state.store.checkpoints.save(checkpoint.clone());
    info!(checkpoint = %checkpoint_id, tx_hash, "checkpoint confirmed");
    Ok(Json(checkpoint_to_json(&checkpoint)))
}

async fn update_checkpoint_status(
    State(state): State<Arc<AppState>>,
    Path(checkpoint_id): Path<String>,
    Json(body): Json<Value>,
) -> ApiResult {
    let mut checkpoint = get_checkpoint(&state, &checkpoint_id)?;
    let requested = body
        .get("status")
        .and_then(|v| v.as_str())
        .and_then(CheckpointStatus::parse)
        .ok_or_else(|| {
            CoordinatorError::Validation(
                "invalid status; valid: PENDING, SUBMITTED, CLAIMABLE, PAID".into(),
            )
        })?;

    // Settlement only moves forward, one step at a time.
    if checkpoint.status.next() != Some(requested) {
        return Err(CoordinatorError::Conflict(format!(
            "cannot transition from {} to {}",
            checkpoint.status, requested
        )));
    }
    checkpoint.status = requested;
    state.store.checkpoints.save(checkpoint.clone());
    info!(checkpoint = %checkpoint_id, status = %requested, "checkpoint status advanced");
    Ok(Json(checkpoint_to_json(&checkpoint)))
}

// =============================================================================
// Backfill admin
// =============================================================================

async fn trigger_backfill(
    State(state): State<Arc<AppState>>,
    Json(body): Json<Value>,
) -> Result<Response, CoordinatorError> {
    let field = |key: &str| {
        body.get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or_else(|| CoordinatorError::Validation(format!("missing field '{key}'")))
    };
    let source = field("source")?;
    let subject = field("subject")?;
    let kind = FeedKind::parse(&field("kind")?)
        .ok_or_else(|| CoordinatorError::Validation("invalid kind".into()))?;
    let granularity = field("granularity")?;
    let start = parse_datetime(&field("start")?)
        .ok_or_else(|| CoordinatorError::Validation("invalid start timestamp".into()))?;
    let end = parse_datetime(&field("end")?)
        .ok_or_else(|| CoordinatorError::Validation("invalid end timestamp".into()))?;
    if start >= end {
        return Err(CoordinatorError::Validation("start must be before end".into()));
    }

    // One active job at a time — a second create conflicts (409).
    let job = state
        .store
        .backfill_jobs
        .create(&source, &subject, kind, &granularity, start, end)?;

    // The actual paging runs in the background against the data-file sink.
    let service = BackfillService::new(
        state.feed.clone(),
        state.parquet_sink.clone(),
        Some(state.store.backfill_jobs.clone()),
    );
    let mut request = BackfillRequest::new(&source, vec![subject], kind, &granularity, start, end);
    request.job_id = Some(job.id.clone());
    let job_id = job.id.clone();
    tokio::spawn(async move {
        if let Err(e) = service.run(request).await {
            error!(job = %job_id, error = %e, "backfill job failed");
        }
    });

    Ok((StatusCode::CREATED, Json(job_to_json(&job))).into_response())
}

async fn backfill_jobs(State(state): State<Arc<AppState>>) -> Json<Value> {
    let rows: Vec<Value> = state
        .store
        .backfill_jobs
        .find(None, 100)
        .iter()
        .map(job_to_json)
        .collect();
    Json(Value::Array(rows))
}

async fn backfill_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> ApiResult {
    let job = state
        .store
        .backfill_jobs
        .get(&job_id)
        .ok_or_else(|| CoordinatorError::NotFound(format!("backfill job {job_id} not found")))?;
    let mut row = job_to_json(&job);
    if let Some(obj) = row.as_object_mut() {
        obj.insert("progress_pct".into(), Value::from(job.progress_pct()));
    }
    Ok(Json(row))
}

fn job_to_json(job: &crate::types::BackfillJob) -> Value {
    json!({
        "id": job.id,
        "source": job.source,
        "subject": job.subject,
        "kind": job.kind.to_string(),
        "granularity": job.granularity,
        "start_ts": rfc3339(job.start_ts),
        "end_ts": rfc3339(job.end_ts),
        "cursor_ts": rfc3339(job.cursor_ts),
        "records_written": job.records_written,
        "pages_fetched": job.pages_fetched,
        "status": job.status.to_string(),
        "error": job.error,
        "created_at": rfc3339(job.created_at),
        "updated_at": rfc3339(job.updated_at),
    })
}

// =============================================================================
// Data files
// =============================================================================

async fn data_file_index(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(serde_json::to_value(state.parquet_sink.list_files()).unwrap_or_default())
}

async fn data_file_download(
    State(state): State<Arc<AppState>>,
    Path(rel_path): Path<String>,
) -> Result<Response, CoordinatorError> {
    let path = state
        .parquet_sink
        .read_file(&rel_path)
        .ok_or_else(|| CoordinatorError::NotFound(format!("data file {rel_path} not found")))?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|e| CoordinatorError::Store(format!("reading {}: {e}", path.display())))?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/octet-stream")],
        bytes,
    )
        .into_response())
}

// =============================================================================
// Shared helpers
// =============================================================================

fn rfc3339(ts: DateTime<Utc>) -> Value {
    Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true))
}

fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn get_checkpoint(
    state: &AppState,
    checkpoint_id: &str,
) -> Result<CheckpointRecord, CoordinatorError> {
    state
        .store
        .checkpoints
        .get(checkpoint_id)
        .ok_or_else(|| CoordinatorError::NotFound(format!("checkpoint {checkpoint_id} not found")))
}

fn checkpoint_to_json(checkpoint: &CheckpointRecord) -> Value {
    json!({
        "id": checkpoint.id,
        "period_start": rfc3339(checkpoint.period_start),
        "period_end": rfc3339(checkpoint.period_end),
        "status": checkpoint.status.to_string(),
        "entries": checkpoint.entries,
        "meta": checkpoint.meta,
        "merkle_root": checkpoint.merkle_root,
        "created_at": rfc3339(checkpoint.created_at),
        "tx_hash": checkpoint.tx_hash,
        "submitted_at": checkpoint.submitted_at.map(rfc3339),
    })
}

/// Decode a raw query string into pairs. Handles percent-escapes and `+`.
fn query_pairs(raw: &Option<String>) -> Vec<(String, String)> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let mut parts = pair.splitn(2, '=');
            let key = percent_decode(parts.next().unwrap_or_default());
            let value = percent_decode(parts.next().unwrap_or_default());
            (key, value)
        })
        .collect()
}

fn percent_decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// `projectIds` accepts repeated params or a single comma-separated value.
fn normalize_project_ids(raw_values: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for value in raw_values {
        for part in value.split(',') {
            let trimmed = part.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
        }
    }
    out
}

/// Extract `(model_ids, start, end)` for the report range endpoints. Missing
/// ids default to every known model; the window defaults to the last 7 days.
fn range_params(
    state: &AppState,
    raw: &Option<String>,
) -> (Vec<String>, DateTime<Utc>, DateTime<Utc>) {
    let params = query_pairs(raw);
    let raw_ids: Vec<String> = params
        .iter()
        .filter(|(k, _)| k == "projectIds")
        .map(|(_, v)| v.clone())
        .collect();
    let mut model_ids = normalize_project_ids(&raw_ids);
    if model_ids.is_empty() {
        model_ids = state.store.models.fetch_all().into_iter().map(|m| m.id).collect();
    }

    let get = |key: &str| {
        params
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| parse_datetime(v))
    };
    let end = get("end").unwrap_or_else(Utc::now);
    let start = get("start").unwrap_or_else(|| end - Duration::days(7));
    (model_ids, start, end)
}

/// Predictions joined to their scores, grouped per model.
fn scored_by_model(
    state: &AppState,
    model_ids: &[String],
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> std::collections::BTreeMap<String, Vec<(PredictionRecord, ScoreRecord)>> {
    let mut out: std::collections::BTreeMap<String, Vec<(PredictionRecord, ScoreRecord)>> =
        Default::default();
    for prediction in state.store.predictions.find_range(model_ids, start, end) {
        if let Some(score) = state.store.scores.get_by_prediction(&prediction.id) {
            out.entry(prediction.model_id.clone())
                .or_default()
                .push((prediction, score));
        }
    }
    out
}

fn timed_scores(scored: &[(PredictionRecord, ScoreRecord)]) -> Vec<(DateTime<Utc>, f64)> {
    scored
        .iter()
        .filter(|(_, s)| s.success)
        .filter_map(|(p, s)| s.value().map(|v| (p.performed_at, v)))
        .collect()
}

/// Mean of the score series per rolling window, relative to `now`.
fn window_metrics(
    timed: &[(DateTime<Utc>, f64)],
    aggregation: &Aggregation,
    now: DateTime<Utc>,
) -> JsonMap {
    let mut metrics = JsonMap::new();
    for window in &aggregation.windows {
        let cutoff = now - Duration::seconds((window.hours * 3600.0) as i64);
        let values: Vec<f64> = timed
            .iter()
            .filter(|(ts, _)| *ts >= cutoff)
            .map(|(_, v)| *v)
            .collect();
        let mean = if values.is_empty() {
            0.0
        } else {
            values.iter().sum::<f64>() / values.len() as f64
        };
        metrics.insert(window.name.clone(), Value::from(mean));
    }
    metrics
}

fn metric_row(
    state: &AppState,
    model_id: &str,
    scope_key: Option<&str>,
    metrics: &JsonMap,
    performed_at: DateTime<Utc>,
) -> JsonMap {
    let aggregation = &state.contract.aggregation;
    let ranking_value = aggregation
        .windows
        .first()
        .and_then(|w| metrics.get(&w.name))
        .and_then(|v| v.as_f64());

    let mut row = JsonMap::new();
    row.insert("model_id".into(), model_id.into());
    if let Some(scope_key) = scope_key {
        row.insert("scope_key".into(), scope_key.into());
    }
    row.insert("score_metrics".into(), Value::Object(metrics.clone()));
    row.insert(
        "score_ranking".into(),
        json!({
            "key": aggregation.ranking_key,
            "value": ranking_value,
            "direction": aggregation.ranking_direction,
        }),
    );
    for (key, value) in flatten_metrics(metrics) {
        row.insert(key, value);
    }
    row.insert("performed_at".into(), rfc3339(performed_at));
    row
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_ids_accept_both_shapes() {
        assert_eq!(
            normalize_project_ids(&["a,b".into(), "c".into()]),
            vec!["a".to_string(), "b".to_string(), "c".to_string()]
        );
        assert_eq!(
            normalize_project_ids(&[" a , ,b ".into()]),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(normalize_project_ids(&[]).is_empty());
    }

    #[test]
    fn query_pairs_decode_escapes() {
        let raw = Some("start=2026-01-01T00%3A00%3A00Z&projectIds=a%2Cb&x=1+2".to_string());
        let pairs = query_pairs(&raw);
        assert!(pairs.contains(&("start".into(), "2026-01-01T00:00:00Z".into())));
        assert!(pairs.contains(&("projectIds".into(), "a,b".into())));
        assert!(pairs.contains(&("x".into(), "1 2".into())));
    }

    #[test]
    fn datetime_parsing_is_utc() {
        let dt = parse_datetime("2026-01-01T12:00:00+02:00").unwrap();
        assert_eq!(dt.to_rfc3339(), "2026-01-01T10:00:00+00:00");
        assert!(parse_datetime("not-a-date").is_none());
    }

    #[test]
    fn guidance_flags_high_correlation_and_negative_contribution() {
        let guidance = diversity_guidance(0.85, Some(-0.01));
        let joined = guidance.join(" ").to_lowercase();
        assert!(joined.contains("correlation"));
        assert!(joined.contains("negative contribution"));
    }

    #[test]
    fn guidance_praises_unique_alpha() {
        let guidance = diversity_guidance(0.15, Some(0.03));
        let joined = guidance.join(" ").to_lowercase();
        assert!(joined.contains("unique alpha"));
    }

    #[test]
    fn guidance_defaults_to_healthy() {
        let guidance = diversity_guidance(0.5, Some(0.01));
        assert_eq!(guidance.len(), 1);
        assert!(guidance[0].contains("healthy"));
    }

    #[test]
    fn cli_format_resolves_indices_to_model_ids() {
        use crate::types::{CruncherReward, EmissionCheckpoint, ProviderReward};
        let now = Utc::now();
        let mut meta = JsonMap::new();
        meta.insert(
            "ranking".into(),
            json!([
                {"model_id": "m1", "rank": 1},
                {"model_id": "m2", "rank": 2},
            ]),
        );
        let emission = EmissionCheckpoint {
            crunch: "crunch-key".into(),
            cruncher_rewards: vec![
                CruncherReward { cruncher_index: 0, reward_pct: 650_000_000 },
                CruncherReward { cruncher_index: 1, reward_pct: 350_000_000 },
            ],
            compute_provider_rewards: vec![ProviderReward {
                provider: "cp".into(),
                reward_pct: FRAC_64_MULTIPLIER,
            }],
            data_provider_rewards: Vec::new(),
        };
        let checkpoint = CheckpointRecord {
            id: "CKP_1".into(),
            period_start: now,
            period_end: now,
            status: CheckpointStatus::Pending,
            entries: vec![emission.clone()],
            meta,
            merkle_root: None,
            created_at: now,
            tx_hash: None,
            submitted_at: None,
        };

        let cli = emission_cli_format(&checkpoint, &emission);
        assert_eq!(cli["crunch"], "crunch-key");
        assert_eq!(cli["crunchEmission"]["m1"], 65.0);
        assert_eq!(cli["crunchEmission"]["m2"], 35.0);
        assert_eq!(cli["computeProvider"]["cp"], 100.0);
    }

    #[test]
    fn window_metrics_mean_within_cutoff() {
        let aggregation = Aggregation::default();
        let now = Utc::now();
        let timed = vec![
            (now - Duration::hours(1), 0.2),
            (now - Duration::hours(2), 0.4),
            // Outside the 24h "recent" window.
            (now - Duration::days(3), 1.0),
        ];
        let metrics = window_metrics(&timed, &aggregation, now);
        let recent = metrics.get("recent").unwrap().as_f64().unwrap();
        assert!((recent - 0.3).abs() < 1e-12);
        // The 7-day "steady" window sees all three points.
        let steady = metrics.get("steady").unwrap().as_f64().unwrap();
        assert!((steady - (0.2 + 0.4 + 1.0) / 3.0).abs() < 1e-12);
    }
}
