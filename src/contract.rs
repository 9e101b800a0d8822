// =============================================================================
// Challenge Contract
// =============================================================================
//
// Everything the challenge author owns, injected at process init as plain
// function values: payload validators, the ground-truth resolver, the scoring
// function, the snapshot aggregator, plus aggregation/ensemble/emission
// configuration. The coordinator core never interprets challenge payloads
// beyond these hooks.
//
// The bundled "starter" contract predicts a forward return for one subject
// and scores direction agreement.
// =============================================================================

use std::sync::Arc;

use serde_json::Value;

use crate::types::{FeedRecord, JsonMap};

// ── Function signatures ──────────────────────────────────────────────────────

/// Validate a challenge payload at the boundary. `Err` carries a
/// human-readable reason.
pub type ValidatorFn = Arc<dyn Fn(&JsonMap) -> Result<(), String> + Send + Sync>;

/// Compute ground truth from the feed records covering a resolution window.
/// `None` means "not resolvable yet" and is retried next cycle.
pub type ResolveGroundTruthFn = Arc<dyn Fn(&[FeedRecord]) -> Option<JsonMap> + Send + Sync>;

/// Score one prediction output against resolved actuals.
pub type ScoringFn = Arc<dyn Fn(&JsonMap, &JsonMap) -> Result<JsonMap, String> + Send + Sync>;

/// Collapse a cycle's score results into a per-model summary.
pub type AggregateSnapshotFn = Arc<dyn Fn(&[JsonMap]) -> JsonMap + Send + Sync>;

// ── Aggregation configuration ────────────────────────────────────────────────

/// One rolling leaderboard window.
#[derive(Debug, Clone)]
pub struct AggregationWindow {
    pub name: String,
    pub hours: f64,
}

/// How snapshots roll up into the leaderboard and checkpoints.
///
/// `ranking_key` addresses a scalar inside `result_summary`. The leaderboard
/// exposes one windowed mean of that scalar per window; the headline ranking
/// value is the mean over the first window.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub windows: Vec<AggregationWindow>,
    pub ranking_key: String,
    /// "desc" (higher is better) or "asc".
    pub ranking_direction: String,
    pub tie_breakers: Vec<String>,
}

impl Aggregation {
    pub fn descending(&self) -> bool {
        self.ranking_direction != "asc"
    }
}

impl Default for Aggregation {
    fn default() -> Self {
        Self {
            windows: vec![
                AggregationWindow { name: "recent".into(), hours: 24.0 },
                AggregationWindow { name: "steady".into(), hours: 24.0 * 7.0 },
                AggregationWindow { name: "anchor".into(), hours: 24.0 * 30.0 },
            ],
            ranking_key: "value".into(),
            ranking_direction: "desc".into(),
            tie_breakers: vec!["ic".into(), "hit_rate".into()],
        }
    }
}

// ── Ensemble configuration ───────────────────────────────────────────────────

/// Weighting strategy for a virtual ensemble model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightStrategy {
    InverseVariance,
    EqualWeight,
}

/// Which members participate in an ensemble.
#[derive(Debug, Clone, PartialEq)]
pub enum EnsembleFilter {
    /// Keep the top N models by primary summary value.
    TopN(usize),
    /// Keep models whose named metric is at or above the threshold.
    MinMetric(String, f64),
}

#[derive(Debug, Clone)]
pub struct EnsembleSpec {
    pub name: String,
    pub strategy: WeightStrategy,
    pub filter: Option<EnsembleFilter>,
}

// ── Emission configuration ───────────────────────────────────────────────────

/// Which reward-distribution strategy the checkpoint builder uses.
#[derive(Debug, Clone)]
pub enum EmissionStrategy {
    /// Rank tiers: 35% / 4×10% / 5×5% tier budgets split across the present
    /// members of each tier.
    TierDefault,
    /// Composite of normalized rank, contribution and diversity components.
    ContributionWeighted {
        rank_weight: f64,
        contribution_weight: f64,
        diversity_weight: f64,
        min_pct: f64,
    },
}

// ── Contract ─────────────────────────────────────────────────────────────────

/// The full challenge contract value, passed by `Arc` to every service.
#[derive(Clone)]
pub struct ChallengeContract {
    /// Default scope key when a config does not override it.
    pub scope_key: String,
    /// Challenge scope defaults merged under every dispatch scope
    /// (`subject`, `horizon_seconds`, `step_seconds`, …).
    pub scope: JsonMap,
    /// Runner method invoked for prediction calls.
    pub call_method: String,

    pub validate_output: ValidatorFn,
    pub validate_score: ValidatorFn,
    pub resolve_ground_truth: ResolveGroundTruthFn,
    pub score_prediction: ScoringFn,
    pub aggregate_snapshot: AggregateSnapshotFn,

    pub aggregation: Aggregation,
    /// Metric names computed per model per cycle (registry lookups).
    pub metrics: Vec<String>,
    pub ensembles: Vec<EnsembleSpec>,
    pub emission: EmissionStrategy,
}

impl ChallengeContract {
    /// The bundled forward-return starter challenge.
    pub fn starter(subject: &str) -> Self {
        let mut scope = JsonMap::new();
        scope.insert("subject".into(), Value::String(subject.to_string()));
        scope.insert("horizon_seconds".into(), Value::from(300));
        scope.insert("step_seconds".into(), Value::from(60));

        Self {
            scope_key: "default-scope".into(),
            scope,
            call_method: "predict".into(),
            validate_output: Arc::new(validate_numeric_value),
            validate_score: Arc::new(validate_score_result),
            resolve_ground_truth: Arc::new(resolve_return_from_records),
            score_prediction: Arc::new(score_directional),
            aggregate_snapshot: Arc::new(mean_of_numeric_keys),
            aggregation: Aggregation::default(),
            metrics: vec![
                "ic".into(),
                "ic_sharpe".into(),
                "mean_return".into(),
                "hit_rate".into(),
                "max_drawdown".into(),
                "sortino_ratio".into(),
                "turnover".into(),
                "model_correlation".into(),
                "fnc".into(),
                "ensemble_correlation".into(),
                "contribution".into(),
            ],
            ensembles: vec![EnsembleSpec {
                name: "collective".into(),
                strategy: WeightStrategy::InverseVariance,
                filter: None,
            }],
            emission: EmissionStrategy::TierDefault,
        }
    }

    /// Horizon fallback used when a schedule has no `resolve_after_seconds`.
    pub fn horizon_seconds(&self) -> u64 {
        self.scope
            .get("horizon_seconds")
            .and_then(|v| v.as_u64())
            .unwrap_or(300)
    }
}

// =============================================================================
// Starter-challenge hooks
// =============================================================================

/// Inference output must carry a finite numeric `value`.
fn validate_numeric_value(output: &JsonMap) -> Result<(), String> {
    match output.get("value") {
        Some(v) => match v.as_f64() {
            Some(f) if f.is_finite() => Ok(()),
            Some(_) => Err("field 'value' must be finite".into()),
            None => Err("field 'value' must be numeric".into()),
        },
        None => Err("missing required field 'value'".into()),
    }
}

/// Score results carry a numeric `value` unless scoring itself failed.
fn validate_score_result(result: &JsonMap) -> Result<(), String> {
    match result.get("value") {
        Some(Value::Null) | None => Err("missing required field 'value'".into()),
        Some(v) => {
            if v.as_f64().is_some() {
                Ok(())
            } else {
                Err("field 'value' must be numeric".into())
            }
        }
    }
}

/// Ground truth for the starter challenge: the realized return between the
/// first and last priced record of the resolution window.
fn resolve_return_from_records(records: &[FeedRecord]) -> Option<JsonMap> {
    let prices: Vec<f64> = records.iter().filter_map(record_price).collect();
    if prices.len() < 2 {
        return None;
    }
    let first = prices[0];
    let last = prices[prices.len() - 1];
    if first.abs() < f64::EPSILON {
        return None;
    }
    let actual_return = last / first - 1.0;

    let mut actuals = JsonMap::new();
    actuals.insert("actual_return".into(), Value::from(actual_return));
    actuals.insert("first_price".into(), Value::from(first));
    actuals.insert("last_price".into(), Value::from(last));
    Some(actuals)
}

fn record_price(record: &FeedRecord) -> Option<f64> {
    for key in ["close", "price"] {
        if let Some(v) = record.values.get(key).and_then(|v| v.as_f64()) {
            return Some(v);
        }
    }
    None
}

/// Directional scoring: long when the predicted value is non-negative, short
/// otherwise; the score is the signed realized return.
fn score_directional(output: &JsonMap, actuals: &JsonMap) -> Result<JsonMap, String> {
    let predicted = output
        .get("value")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| "prediction output has no numeric 'value'".to_string())?;
    let actual_return = actuals
        .get("actual_return")
        .and_then(|v| v.as_f64())
        .ok_or_else(|| "actuals have no numeric 'actual_return'".to_string())?;

    let sign = if predicted >= 0.0 { 1.0 } else { -1.0 };
    let mut result = JsonMap::new();
    result.insert("value".into(), Value::from(sign * actual_return));
    result.insert("actual_return".into(), Value::from(actual_return));
    result.insert("predicted".into(), Value::from(predicted));
    Ok(result)
}

/// Per-model cycle summary: the mean of every numeric key across the cycle's
/// score results, plus a `count`.
fn mean_of_numeric_keys(results: &[JsonMap]) -> JsonMap {
    let mut sums: std::collections::BTreeMap<String, (f64, usize)> = Default::default();
    for result in results {
        for (key, value) in result {
            if let Some(f) = value.as_f64() {
                let entry = sums.entry(key.clone()).or_insert((0.0, 0));
                entry.0 += f;
                entry.1 += 1;
            }
        }
    }

    let mut summary = JsonMap::new();
    for (key, (sum, n)) in sums {
        if n > 0 {
            summary.insert(key, Value::from(sum / n as f64));
        }
    }
    summary.insert("count".into(), Value::from(results.len() as u64));
    summary
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::types::FeedKind;

    fn candle(close: f64) -> FeedRecord {
        let mut values = JsonMap::new();
        values.insert("close".into(), Value::from(close));
        FeedRecord {
            source: "binance".into(),
            subject: "BTCUSDT".into(),
            kind: FeedKind::Candle,
            granularity: "1m".into(),
            ts_event: Utc::now(),
            ts_ingested: Utc::now(),
            values,
            meta: JsonMap::new(),
        }
    }

    #[test]
    fn output_validation_requires_numeric_value() {
        let mut output = JsonMap::new();
        assert!(validate_numeric_value(&output).is_err());
        output.insert("value".into(), Value::String("0.5".into()));
        assert!(validate_numeric_value(&output).is_err());
        output.insert("value".into(), Value::from(0.5));
        assert!(validate_numeric_value(&output).is_ok());
    }

    #[test]
    fn ground_truth_is_realized_return() {
        let records = vec![candle(100.0), candle(101.0), candle(102.0)];
        let actuals = resolve_return_from_records(&records).unwrap();
        let r = actuals.get("actual_return").unwrap().as_f64().unwrap();
        assert!((r - 0.02).abs() < 1e-12);
    }

    #[test]
    fn ground_truth_needs_two_priced_records() {
        assert!(resolve_return_from_records(&[candle(100.0)]).is_none());
        assert!(resolve_return_from_records(&[]).is_none());
    }

    #[test]
    fn directional_score_sign() {
        let mut output = JsonMap::new();
        output.insert("value".into(), Value::from(-1.0));
        let mut actuals = JsonMap::new();
        actuals.insert("actual_return".into(), Value::from(-0.01));
        let result = score_directional(&output, &actuals).unwrap();
        // Short call on a falling market scores positive.
        assert!((result.get("value").unwrap().as_f64().unwrap() - 0.01).abs() < 1e-12);
    }

    #[test]
    fn snapshot_summary_means_numeric_keys() {
        let mut a = JsonMap::new();
        a.insert("value".into(), Value::from(1.0));
        let mut b = JsonMap::new();
        b.insert("value".into(), Value::from(3.0));
        let summary = mean_of_numeric_keys(&[a, b]);
        assert_eq!(summary.get("value").unwrap().as_f64().unwrap(), 2.0);
        assert_eq!(summary.get("count").unwrap().as_u64().unwrap(), 2);
    }
}
