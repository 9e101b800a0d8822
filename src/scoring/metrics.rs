// =============================================================================
// Metrics Registry & Built-ins
// =============================================================================
//
// Named metric functions with one fixed signature:
//
//     fn(predictions, scores, context) -> f64
//
// Predictions carry the model's signal (`inference_output`); scores carry the
// per-prediction result including ground-truth info; the context carries
// cross-model data for correlation/contribution metrics. Unregistered names
// are skipped; a non-finite result is recorded as 0.0 (except `ic_sharpe`,
// which legitimately reports +∞ for a perfectly consistent signal).
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use tracing::warn;

use crate::types::{JsonMap, PredictionRecord, ScoreRecord};

/// Ensemble model ids are reserved: `__ensemble_<name>__`.
pub const ENSEMBLE_PREFIX: &str = "__ensemble_";
pub const ENSEMBLE_SUFFIX: &str = "__";

pub fn ensemble_model_id(name: &str) -> String {
    format!("{ENSEMBLE_PREFIX}{name}{ENSEMBLE_SUFFIX}")
}

pub fn is_ensemble_model(model_id: &str) -> bool {
    model_id.starts_with(ENSEMBLE_PREFIX)
}

// =============================================================================
// Context
// =============================================================================

/// Shared state for one evaluation cycle, built once and reused across all
/// model evaluations so cross-model metrics don't re-fetch data.
#[derive(Default, Clone)]
pub struct MetricsContext {
    pub model_id: String,
    /// Every model's cycle predictions, ensembles included.
    pub all_model_predictions: HashMap<String, Vec<PredictionRecord>>,
    /// Ensemble predictions by ensemble name, iteration-ordered.
    pub ensemble_predictions: BTreeMap<String, Vec<PredictionRecord>>,
}

impl MetricsContext {
    pub fn for_model(&self, model_id: &str) -> MetricsContext {
        let mut ctx = self.clone();
        ctx.model_id = model_id.to_string();
        ctx
    }
}

// =============================================================================
// Registry
// =============================================================================

pub type MetricFn = fn(&[PredictionRecord], &[ScoreRecord], &MetricsContext) -> f64;

pub struct MetricsRegistry {
    metrics: HashMap<String, MetricFn>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            metrics: HashMap::new(),
        }
    }

    /// A registry pre-populated with every built-in.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("ic", compute_ic);
        registry.register("ic_sharpe", compute_ic_sharpe);
        registry.register("mean_return", compute_mean_return);
        registry.register("hit_rate", compute_hit_rate);
        registry.register("model_correlation", compute_model_correlation);
        registry.register("max_drawdown", compute_max_drawdown);
        registry.register("sortino_ratio", compute_sortino_ratio);
        registry.register("turnover", compute_turnover);
        registry.register("fnc", compute_fnc);
        registry.register("contribution", compute_contribution);
        registry.register("ensemble_correlation", compute_ensemble_correlation);
        registry
    }

    pub fn register(&mut self, name: &str, f: MetricFn) {
        self.metrics.insert(name.to_string(), f);
    }

    pub fn get(&self, name: &str) -> Option<MetricFn> {
        self.metrics.get(name).copied()
    }

    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = self.metrics.keys().cloned().collect();
        names.sort();
        names
    }

    /// Compute the requested metrics. Unknown names are skipped with a
    /// warning; NaN collapses to 0.0.
    pub fn compute(
        &self,
        names: &[String],
        predictions: &[PredictionRecord],
        scores: &[ScoreRecord],
        context: &MetricsContext,
    ) -> JsonMap {
        let mut out = JsonMap::new();
        for name in names {
            let Some(metric) = self.get(name) else {
                warn!(metric = %name, "metric not registered, skipping");
                continue;
            };
            let mut value = metric(predictions, scores, context);
            if value.is_nan() {
                value = 0.0;
            }
            out.insert(name.clone(), serde_json::Value::from(value));
        }
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

// =============================================================================
// Extraction helpers
// =============================================================================

const SIGNAL_KEYS: &[&str] = &["value", "expected_return", "signal", "prediction"];

/// The prediction signal per record: tries the common field names in order,
/// then the first numeric field. Rows without a signal are skipped.
pub fn extract_pred_values(predictions: &[PredictionRecord]) -> Vec<f64> {
    let mut values = Vec::with_capacity(predictions.len());
    for p in predictions {
        let output = &p.inference_output;
        let mut v = SIGNAL_KEYS
            .iter()
            .find_map(|key| output.get(*key).and_then(|v| v.as_f64()));
        if v.is_none() {
            v = output.values().find_map(|val| val.as_f64());
        }
        if let Some(v) = v {
            values.push(v);
        }
    }
    values
}

/// The primary score scalar per record; rows without one are skipped.
pub fn extract_score_values(scores: &[ScoreRecord]) -> Vec<f64> {
    scores.iter().filter_map(|s| s.value()).collect()
}

/// Actual returns from score results. Every row contributes a value — rows
/// without `actual_return`/`return` default to 0.0 so the series stays
/// aligned with the score series.
pub fn extract_actual_returns(scores: &[ScoreRecord]) -> Vec<f64> {
    scores
        .iter()
        .map(|s| {
            ["actual_return", "return"]
                .iter()
                .find_map(|key| s.result.get(*key).and_then(|v| v.as_f64()))
                .unwrap_or(0.0)
        })
        .collect()
}

/// Spearman rank correlation of the first `min(len)` points of two series.
pub fn spearman_correlation(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n < 2 {
        return 0.0;
    }

    fn rank(values: &[f64]) -> Vec<f64> {
        let mut indexed: Vec<usize> = (0..values.len()).collect();
        indexed.sort_by(|&a, &b| {
            values[a]
                .partial_cmp(&values[b])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut ranks = vec![0.0; values.len()];
        for (rank, idx) in indexed.into_iter().enumerate() {
            ranks[idx] = rank as f64;
        }
        ranks
    }

    let rx = rank(&x[..n]);
    let ry = rank(&y[..n]);
    let mean_rx = rx.iter().sum::<f64>() / n as f64;
    let mean_ry = ry.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_x = 0.0;
    let mut var_y = 0.0;
    for i in 0..n {
        let dx = rx[i] - mean_rx;
        let dy = ry[i] - mean_ry;
        cov += dx * dy;
        var_x += dx * dx;
        var_y += dy * dy;
    }
    let std_x = var_x.sqrt();
    let std_y = var_y.sqrt();
    if std_x < 1e-12 || std_y < 1e-12 {
        return 0.0;
    }
    cov / (std_x * std_y)
}

// =============================================================================
// Tier 1 — core metrics
// =============================================================================

/// Information coefficient: Spearman rank correlation between the prediction
/// signal and the actual return.
pub fn compute_ic(
    predictions: &[PredictionRecord],
    scores: &[ScoreRecord],
    _context: &MetricsContext,
) -> f64 {
    spearman_correlation(
        &extract_pred_values(predictions),
        &extract_actual_returns(scores),
    )
}

/// mean(IC)/std(IC) over sub-chunks of the window; rewards IC consistency.
pub fn compute_ic_sharpe(
    predictions: &[PredictionRecord],
    scores: &[ScoreRecord],
    _context: &MetricsContext,
) -> f64 {
    let preds = extract_pred_values(predictions);
    let actuals = extract_actual_returns(scores);
    let n = preds.len().min(actuals.len());
    if n < 4 {
        return 0.0;
    }

    let chunk_size = std::cmp::max(2, n / std::cmp::max(3, n / 10));
    let mut ics = Vec::new();
    let mut start = 0;
    while start + chunk_size <= n {
        let end = (start + chunk_size).min(n);
        if end - start >= 2 {
            ics.push(spearman_correlation(&preds[start..end], &actuals[start..end]));
        }
        start += chunk_size;
    }
    if ics.len() < 2 {
        return 0.0;
    }

    let mean_ic = ics.iter().sum::<f64>() / ics.len() as f64;
    let var = ics.iter().map(|ic| (ic - mean_ic).powi(2)).sum::<f64>() / ics.len() as f64;
    let std_ic = var.sqrt();
    if std_ic < 1e-12 {
        // All chunk ICs identical — perfectly consistent signal.
        return if mean_ic.abs() > 1e-12 { f64::INFINITY } else { 0.0 };
    }
    mean_ic / std_ic
}

/// Average return of a sign-following long/short strategy.
pub fn compute_mean_return(
    predictions: &[PredictionRecord],
    scores: &[ScoreRecord],
    _context: &MetricsContext,
) -> f64 {
    let preds = extract_pred_values(predictions);
    let actuals = extract_actual_returns(scores);
    let n = preds.len().min(actuals.len());
    if n == 0 {
        return 0.0;
    }
    (0..n)
        .map(|i| if preds[i] >= 0.0 { actuals[i] } else { -actuals[i] })
        .sum::<f64>()
        / n as f64
}

/// Fraction of predictions whose sign matched the realized return.
pub fn compute_hit_rate(
    predictions: &[PredictionRecord],
    scores: &[ScoreRecord],
    _context: &MetricsContext,
) -> f64 {
    let preds = extract_pred_values(predictions);
    let actuals = extract_actual_returns(scores);
    let n = preds.len().min(actuals.len());
    if n == 0 {
        return 0.0;
    }
    let correct = (0..n)
        .filter(|&i| (preds[i] >= 0.0) == (actuals[i] >= 0.0))
        .count();
    correct as f64 / n as f64
}

/// Mean pairwise Spearman correlation against every other real model.
pub fn compute_model_correlation(
    predictions: &[PredictionRecord],
    _scores: &[ScoreRecord],
    context: &MetricsContext,
) -> f64 {
    let my_vals = extract_pred_values(predictions);
    if my_vals.len() < 2 {
        return 0.0;
    }

    let mut correlations = Vec::new();
    for (other_id, other_preds) in &context.all_model_predictions {
        if *other_id == context.model_id || is_ensemble_model(other_id) {
            continue;
        }
        let other_vals = extract_pred_values(other_preds);
        if other_vals.len() < 2 {
            continue;
        }
        correlations.push(spearman_correlation(&my_vals, &other_vals));
    }
    if correlations.is_empty() {
        return 0.0;
    }
    correlations.iter().sum::<f64>() / correlations.len() as f64
}

// =============================================================================
// Tier 2 — risk/stability metrics
// =============================================================================

/// Most negative peak-to-trough excursion on cumulative score values.
pub fn compute_max_drawdown(
    _predictions: &[PredictionRecord],
    scores: &[ScoreRecord],
    _context: &MetricsContext,
) -> f64 {
    let values = extract_score_values(scores);
    if values.len() < 2 {
        return 0.0;
    }
    let mut cumulative = 0.0;
    let mut peak = 0.0;
    let mut max_dd = 0.0;
    for v in values {
        cumulative += v;
        if cumulative > peak {
            peak = cumulative;
        }
        let dd = cumulative - peak;
        if dd < max_dd {
            max_dd = dd;
        }
    }
    max_dd
}

/// Mean strategy return over downside deviation; only negative returns
/// penalize.
pub fn compute_sortino_ratio(
    predictions: &[PredictionRecord],
    scores: &[ScoreRecord],
    _context: &MetricsContext,
) -> f64 {
    let preds = extract_pred_values(predictions);
    let actuals = extract_actual_returns(scores);
    let n = preds.len().min(actuals.len());
    if n < 2 {
        return 0.0;
    }

    let returns: Vec<f64> = (0..n)
        .map(|i| if preds[i] >= 0.0 { actuals[i] } else { -actuals[i] })
        .collect();
    let mean = returns.iter().sum::<f64>() / n as f64;
    let downside_sq: Vec<f64> = returns.iter().filter(|r| **r < 0.0).map(|r| r * r).collect();

    if downside_sq.is_empty() {
        return if mean != 0.0 { mean / 1e-9 } else { 0.0 };
    }
    let downside_dev = (downside_sq.iter().sum::<f64>() / downside_sq.len() as f64).sqrt();
    if downside_dev < 1e-12 {
        return 0.0;
    }
    mean / downside_dev
}

/// Mean absolute change in the signal between consecutive predictions.
pub fn compute_turnover(
    predictions: &[PredictionRecord],
    _scores: &[ScoreRecord],
    _context: &MetricsContext,
) -> f64 {
    let values = extract_pred_values(predictions);
    if values.len() < 2 {
        return 0.0;
    }
    values
        .windows(2)
        .map(|w| (w[1] - w[0]).abs())
        .sum::<f64>()
        / (values.len() - 1) as f64
}

// =============================================================================
// Tier 3 — ensemble-aware metrics
// =============================================================================

/// Correlation of this model's signal to the (first) ensemble output.
pub fn compute_ensemble_correlation(
    predictions: &[PredictionRecord],
    _scores: &[ScoreRecord],
    context: &MetricsContext,
) -> f64 {
    let my_vals = extract_pred_values(predictions);
    if my_vals.len() < 2 {
        return 0.0;
    }
    for ens_preds in context.ensemble_predictions.values() {
        let ens_vals = extract_pred_values(ens_preds);
        if ens_vals.len() < 2 {
            continue;
        }
        return spearman_correlation(&my_vals, &ens_vals);
    }
    0.0
}

/// Leave-one-out contribution: how much the ensemble IC drops without this
/// model. Positive = the model helps.
pub fn compute_contribution(
    predictions: &[PredictionRecord],
    scores: &[ScoreRecord],
    context: &MetricsContext,
) -> f64 {
    let my_vals = extract_pred_values(predictions);
    if my_vals.len() < 2 {
        return 0.0;
    }

    let Some(ens_preds) = context.ensemble_predictions.values().next() else {
        return 0.0;
    };
    let ens_vals = extract_pred_values(ens_preds);
    if ens_vals.len() < 2 {
        return 0.0;
    }

    let others: Vec<&Vec<PredictionRecord>> = context
        .all_model_predictions
        .iter()
        .filter(|(id, _)| **id != context.model_id && !is_ensemble_model(id))
        .map(|(_, preds)| preds)
        .collect();
    if others.is_empty() {
        return 0.0;
    }

    // Equal-weight leave-one-out ensemble from the remaining models.
    let n_preds = my_vals.len().min(ens_vals.len());
    let n_others = others.len() as f64;
    let mut loo_vals = vec![0.0; n_preds];
    for other_preds in &others {
        let vals = extract_pred_values(other_preds);
        for i in 0..vals.len().min(n_preds) {
            loo_vals[i] += vals[i] / n_others;
        }
    }

    let actuals = extract_actual_returns(scores);
    if actuals.len() < 2 {
        return 0.0;
    }

    let ic_full = spearman_correlation(&ens_vals[..n_preds], &actuals[..n_preds.min(actuals.len())]);
    let ic_loo = spearman_correlation(&loo_vals, &actuals[..n_preds.min(actuals.len())]);
    ic_full - ic_loo
}

/// Feature-neutral correlation: IC of the residual after removing the mean
/// prediction across all real models.
pub fn compute_fnc(
    predictions: &[PredictionRecord],
    scores: &[ScoreRecord],
    context: &MetricsContext,
) -> f64 {
    let my_vals = extract_pred_values(predictions);
    if my_vals.len() < 2 {
        return 0.0;
    }
    let actuals = extract_actual_returns(scores);
    let n = my_vals.len().min(actuals.len());
    if n < 2 {
        return 0.0;
    }

    let others: Vec<&Vec<PredictionRecord>> = context
        .all_model_predictions
        .iter()
        .filter(|(id, _)| !is_ensemble_model(id))
        .map(|(_, preds)| preds)
        .collect();
    if others.len() <= 1 {
        // Only this model — FNC degenerates to IC.
        return spearman_correlation(&my_vals[..n], &actuals[..n]);
    }

    let n_models = others.len() as f64;
    let mut mean_preds = vec![0.0; n];
    for preds in &others {
        let vals = extract_pred_values(preds);
        for i in 0..vals.len().min(n) {
            mean_preds[i] += vals[i] / n_models;
        }
    }

    let residuals: Vec<f64> = (0..n).map(|i| my_vals[i] - mean_preds[i]).collect();
    spearman_correlation(&residuals, &actuals[..n])
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::Value;

    fn prediction(model: &str, value: f64) -> PredictionRecord {
        let mut output = JsonMap::new();
        output.insert("value".into(), Value::from(value));
        PredictionRecord {
            id: format!("p_{model}_{value}"),
            input_id: "inp".into(),
            model_id: model.into(),
            prediction_config_id: None,
            scope_key: "s".into(),
            scope: JsonMap::new(),
            status: crate::types::PredictionStatus::Scored,
            exec_time_ms: 0.0,
            inference_output: output,
            meta: JsonMap::new(),
            performed_at: Utc::now(),
            resolvable_at: None,
        }
    }

    fn score(value: f64, actual_return: f64) -> ScoreRecord {
        let mut result = JsonMap::new();
        result.insert("value".into(), Value::from(value));
        result.insert("actual_return".into(), Value::from(actual_return));
        ScoreRecord {
            id: "s".into(),
            prediction_id: "p".into(),
            result,
            success: true,
            failed_reason: None,
            scored_at: Utc::now(),
        }
    }

    fn series(model: &str, values: &[f64]) -> Vec<PredictionRecord> {
        values.iter().map(|v| prediction(model, *v)).collect()
    }

    #[test]
    fn spearman_perfect_and_inverse() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let up = [10.0, 20.0, 30.0, 40.0];
        let down = [40.0, 30.0, 20.0, 10.0];
        assert!((spearman_correlation(&x, &up) - 1.0).abs() < 1e-12);
        assert!((spearman_correlation(&x, &down) + 1.0).abs() < 1e-12);
        assert_eq!(spearman_correlation(&x, &[1.0, 1.0, 1.0, 1.0]), 0.0);
    }

    #[test]
    fn ic_tracks_monotone_agreement() {
        let preds = series("m1", &[0.1, 0.2, 0.3, 0.4]);
        let scores: Vec<ScoreRecord> = [0.01, 0.02, 0.03, 0.04]
            .iter()
            .map(|r| score(*r, *r))
            .collect();
        let ctx = MetricsContext::default();
        assert!((compute_ic(&preds, &scores, &ctx) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn hit_rate_counts_sign_agreement() {
        let preds = series("m1", &[0.1, -0.2, 0.3, -0.4]);
        let scores: Vec<ScoreRecord> = [0.01, 0.02, 0.03, -0.04]
            .iter()
            .map(|r| score(*r, *r))
            .collect();
        let ctx = MetricsContext::default();
        // Signs agree on indices 0, 2, 3.
        assert!((compute_hit_rate(&preds, &scores, &ctx) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn mean_return_follows_signal_sign() {
        let preds = series("m1", &[1.0, -1.0]);
        let scores = vec![score(0.0, 0.02), score(0.0, -0.04)];
        let ctx = MetricsContext::default();
        // long +2% and short -4% → (0.02 + 0.04) / 2
        assert!((compute_mean_return(&preds, &scores, &ctx) - 0.03).abs() < 1e-12);
    }

    #[test]
    fn drawdown_is_most_negative_excursion() {
        let scores: Vec<ScoreRecord> = [1.0, -2.0, -1.0, 3.0]
            .iter()
            .map(|v| score(*v, 0.0))
            .collect();
        let ctx = MetricsContext::default();
        // Cumulative: 1, -1, -2, 1 — trough at -2 from peak 1.
        assert!((compute_max_drawdown(&[], &scores, &ctx) + 3.0).abs() < 1e-12);
    }

    #[test]
    fn turnover_is_mean_absolute_delta() {
        let preds = series("m1", &[0.0, 1.0, -1.0]);
        let ctx = MetricsContext::default();
        assert!((compute_turnover(&preds, &[], &ctx) - 1.5).abs() < 1e-12);
    }

    #[test]
    fn model_correlation_excludes_self_and_ensembles() {
        let mine = series("m1", &[1.0, 2.0, 3.0]);
        let mut ctx = MetricsContext::default();
        ctx.model_id = "m1".into();
        ctx.all_model_predictions
            .insert("m1".into(), mine.clone());
        ctx.all_model_predictions
            .insert("m2".into(), series("m2", &[2.0, 4.0, 6.0]));
        ctx.all_model_predictions.insert(
            ensemble_model_id("collective"),
            series("ens", &[9.0, 1.0, 5.0]),
        );
        let corr = compute_model_correlation(&mine, &[], &ctx);
        // Only m2 counts, and it is rank-identical.
        assert!((corr - 1.0).abs() < 1e-12);
    }

    #[test]
    fn ic_sharpe_consistent_signal_is_infinite() {
        let preds = series("m1", &(0..12).map(|i| i as f64).collect::<Vec<_>>());
        let scores: Vec<ScoreRecord> = (0..12).map(|i| score(0.0, i as f64)).collect();
        let ctx = MetricsContext::default();
        assert!(compute_ic_sharpe(&preds, &scores, &ctx).is_infinite());
    }

    #[test]
    fn ic_sharpe_needs_enough_points() {
        let preds = series("m1", &[1.0, 2.0, 3.0]);
        let scores: Vec<ScoreRecord> = (0..3).map(|i| score(0.0, i as f64)).collect();
        let ctx = MetricsContext::default();
        assert_eq!(compute_ic_sharpe(&preds, &scores, &ctx), 0.0);
    }

    #[test]
    fn contribution_positive_for_aligned_model() {
        // Ensemble tracks the truth; m2 is anti-correlated noise. Removing
        // m1 (the aligned model) leaves only noise, so contribution > 0.
        let truth = [0.01, 0.02, 0.03, 0.04];
        let mine = series("m1", &[1.0, 2.0, 3.0, 4.0]);
        let noise = series("m2", &[4.0, 3.0, 2.0, 1.0]);
        let ens = series(&ensemble_model_id("collective"), &[1.0, 2.0, 3.0, 4.0]);

        let mut ctx = MetricsContext::default();
        ctx.model_id = "m1".into();
        ctx.all_model_predictions.insert("m1".into(), mine.clone());
        ctx.all_model_predictions.insert("m2".into(), noise);
        ctx.ensemble_predictions
            .insert("collective".into(), ens);

        let scores: Vec<ScoreRecord> = truth.iter().map(|r| score(*r, *r)).collect();
        assert!(compute_contribution(&mine, &scores, &ctx) > 0.0);
    }

    #[test]
    fn registry_skips_unknown_metrics() {
        let registry = MetricsRegistry::with_builtins();
        let ctx = MetricsContext::default();
        let out = registry.compute(
            &["ic".to_string(), "does_not_exist".to_string()],
            &[],
            &[],
            &ctx,
        );
        assert!(out.contains_key("ic"));
        assert!(!out.contains_key("does_not_exist"));
    }

    #[test]
    fn registry_lists_builtins_sorted() {
        let registry = MetricsRegistry::with_builtins();
        let names = registry.available();
        assert_eq!(names.len(), 11);
        assert!(names.windows(2).all(|w| w[0] < w[1]));
        assert!(names.contains(&"contribution".to_string()));
    }
}
