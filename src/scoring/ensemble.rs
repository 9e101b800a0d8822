// =============================================================================
// Ensemble Builder — virtual meta-models
// =============================================================================
//
// Combines member predictions into synthetic predictions for a reserved
// virtual model id (`__ensemble_<name>__`). Members are filtered, weighted by
// the configured strategy, then grouped by `(input_id, scope_key)` and
// averaged; members missing a value simply drop out of that group's average.
// Ensemble predictions are born SCORED-eligible and flow through snapshotting
// like any real model.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::contract::{EnsembleFilter, WeightStrategy};
use crate::scoring::metrics::ensemble_model_id;
use crate::types::{JsonMap, PredictionRecord, PredictionStatus};

/// Per-model prediction sets for one cycle.
pub type PredictionsByModel = HashMap<String, Vec<PredictionRecord>>;
/// Per-model metric maps used by filters.
pub type MetricsByModel = HashMap<String, JsonMap>;

// =============================================================================
// Weight strategies
// =============================================================================

/// Compute normalized member weights for the given strategy.
pub fn compute_weights(
    strategy: WeightStrategy,
    predictions: &PredictionsByModel,
) -> HashMap<String, f64> {
    match strategy {
        WeightStrategy::EqualWeight => equal_weight(predictions),
        WeightStrategy::InverseVariance => inverse_variance(predictions),
    }
}

/// 1/N for every member.
fn equal_weight(predictions: &PredictionsByModel) -> HashMap<String, f64> {
    let n = predictions.len();
    if n == 0 {
        return HashMap::new();
    }
    predictions
        .keys()
        .map(|m| (m.clone(), 1.0 / n as f64))
        .collect()
}

/// weight = 1/var(signal), normalized; members whose variance cannot be
/// computed fall back to weight 1 pre-normalization.
fn inverse_variance(predictions: &PredictionsByModel) -> HashMap<String, f64> {
    let mut raw: HashMap<String, f64> = HashMap::new();
    for (model_id, preds) in predictions {
        let values: Vec<f64> = preds
            .iter()
            .filter_map(|p| p.inference_output.get("value").and_then(|v| v.as_f64()))
            .collect();
        if values.len() < 2 {
            raw.insert(model_id.clone(), 1.0);
            continue;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        raw.insert(
            model_id.clone(),
            if variance < 1e-12 { 1.0 } else { 1.0 / variance },
        );
    }

    let total: f64 = raw.values().sum();
    if total < 1e-12 {
        let n = raw.len();
        return raw
            .keys()
            .map(|m| (m.clone(), 1.0 / n as f64))
            .collect();
    }
    raw.into_iter().map(|(m, w)| (m, w / total)).collect()
}

// =============================================================================
// Filters
// =============================================================================

/// Select which members participate in the ensemble.
pub fn apply_model_filter(
    filter: Option<&EnsembleFilter>,
    metrics: &MetricsByModel,
    predictions: PredictionsByModel,
) -> PredictionsByModel {
    match filter {
        None => predictions,
        Some(EnsembleFilter::TopN(n)) => {
            let mut ranked: Vec<&String> = predictions.keys().collect();
            ranked.sort_by(|a, b| {
                let value = |m: &str| {
                    metrics
                        .get(m)
                        .and_then(|v| v.get("value"))
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0)
                };
                value(b)
                    .partial_cmp(&value(a))
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            let kept: std::collections::HashSet<String> =
                ranked.into_iter().take(*n).cloned().collect();
            predictions
                .into_iter()
                .filter(|(m, _)| kept.contains(m))
                .collect()
        }
        Some(EnsembleFilter::MinMetric(name, threshold)) => predictions
            .into_iter()
            .filter(|(m, _)| {
                metrics
                    .get(m)
                    .and_then(|v| v.get(name.as_str()))
                    .and_then(|v| v.as_f64())
                    .unwrap_or(0.0)
                    >= *threshold
            })
            .collect(),
    }
}

// =============================================================================
// Prediction builder
// =============================================================================

/// Build the virtual model's predictions: one per `(input_id, scope_key)`
/// group, with `value = Σ wᵢ·vᵢ / Σ wᵢ` over members that produced a value.
pub fn build_ensemble_predictions(
    name: &str,
    weights: &HashMap<String, f64>,
    predictions_by_model: &PredictionsByModel,
    now: DateTime<Utc>,
) -> Vec<PredictionRecord> {
    let virtual_model_id = ensemble_model_id(name);

    // (input_id, scope_key) → model_id → prediction
    let mut groups: HashMap<(String, String), HashMap<String, &PredictionRecord>> = HashMap::new();
    for (model_id, preds) in predictions_by_model {
        if !weights.contains_key(model_id) {
            continue;
        }
        for p in preds {
            groups
                .entry((p.input_id.clone(), p.scope_key.clone()))
                .or_default()
                .insert(model_id.clone(), p);
        }
    }

    let mut weights_meta = JsonMap::new();
    let mut sorted_weights: Vec<(&String, &f64)> = weights.iter().collect();
    sorted_weights.sort_by(|a, b| a.0.cmp(b.0));
    for (model_id, w) in sorted_weights {
        weights_meta.insert(model_id.clone(), Value::from(*w));
    }

    let mut out = Vec::new();
    for ((input_id, scope_key), members) in groups {
        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        let mut scope = JsonMap::new();
        for (model_id, prediction) in &members {
            if scope.is_empty() {
                scope = prediction.scope.clone();
            }
            let Some(value) = prediction
                .inference_output
                .get("value")
                .and_then(|v| v.as_f64())
            else {
                continue;
            };
            let w = weights.get(model_id.as_str()).copied().unwrap_or(0.0);
            weighted_sum += w * value;
            weight_sum += w;
        }
        if weight_sum < 1e-12 {
            continue;
        }

        let mut output = JsonMap::new();
        output.insert("value".into(), Value::from(weighted_sum / weight_sum));

        let mut meta = JsonMap::new();
        meta.insert("weights".into(), Value::Object(weights_meta.clone()));
        meta.insert("ensemble_name".into(), Value::String(name.to_string()));

        out.push(PredictionRecord {
            id: format!("pred_{virtual_model_id}_{input_id}_{scope_key}"),
            input_id,
            model_id: virtual_model_id.clone(),
            prediction_config_id: None,
            scope_key,
            scope,
            status: PredictionStatus::Scored,
            exec_time_ms: 0.0,
            inference_output: output,
            meta,
            performed_at: now,
            resolvable_at: None,
        });
    }

    out.sort_by(|a, b| a.id.cmp(&b.id));
    out
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction(model: &str, input: &str, value: Option<f64>) -> PredictionRecord {
        let mut output = JsonMap::new();
        if let Some(v) = value {
            output.insert("value".into(), Value::from(v));
        }
        PredictionRecord {
            id: format!("p_{model}_{input}"),
            input_id: input.into(),
            model_id: model.into(),
            prediction_config_id: None,
            scope_key: "scope".into(),
            scope: JsonMap::new(),
            status: PredictionStatus::Scored,
            exec_time_ms: 0.0,
            inference_output: output,
            meta: JsonMap::new(),
            performed_at: Utc::now(),
            resolvable_at: None,
        }
    }

    #[test]
    fn equal_weights_sum_to_one() {
        let mut preds = PredictionsByModel::new();
        preds.insert("m1".into(), vec![prediction("m1", "i1", Some(1.0))]);
        preds.insert("m2".into(), vec![prediction("m2", "i1", Some(2.0))]);
        let weights = compute_weights(WeightStrategy::EqualWeight, &preds);
        assert_eq!(weights.len(), 2);
        assert!((weights.values().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn inverse_variance_prefers_stable_models() {
        let mut preds = PredictionsByModel::new();
        preds.insert(
            "steady".into(),
            vec![
                prediction("steady", "i1", Some(1.0)),
                prediction("steady", "i2", Some(1.01)),
            ],
        );
        preds.insert(
            "wild".into(),
            vec![
                prediction("wild", "i1", Some(-5.0)),
                prediction("wild", "i2", Some(5.0)),
            ],
        );
        let weights = compute_weights(WeightStrategy::InverseVariance, &preds);
        assert!(weights["steady"] > weights["wild"]);
        assert!((weights.values().sum::<f64>() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn top_n_filter_keeps_best_by_value() {
        let mut preds = PredictionsByModel::new();
        let mut metrics = MetricsByModel::new();
        for (model, value) in [("a", 0.3), ("b", 0.1), ("c", 0.2)] {
            preds.insert(model.into(), vec![prediction(model, "i1", Some(1.0))]);
            let mut m = JsonMap::new();
            m.insert("value".into(), Value::from(value));
            metrics.insert(model.into(), m);
        }
        let kept = apply_model_filter(Some(&EnsembleFilter::TopN(2)), &metrics, preds);
        assert!(kept.contains_key("a"));
        assert!(kept.contains_key("c"));
        assert!(!kept.contains_key("b"));
    }

    #[test]
    fn min_metric_filter_thresholds() {
        let mut preds = PredictionsByModel::new();
        let mut metrics = MetricsByModel::new();
        for (model, ic) in [("a", 0.05), ("b", -0.01)] {
            preds.insert(model.into(), vec![prediction(model, "i1", Some(1.0))]);
            let mut m = JsonMap::new();
            m.insert("ic".into(), Value::from(ic));
            metrics.insert(model.into(), m);
        }
        let kept = apply_model_filter(
            Some(&EnsembleFilter::MinMetric("ic".into(), 0.0)),
            &metrics,
            preds,
        );
        assert_eq!(kept.len(), 1);
        assert!(kept.contains_key("a"));
    }

    #[test]
    fn weighted_average_groups_by_input() {
        let mut preds = PredictionsByModel::new();
        preds.insert(
            "m1".into(),
            vec![
                prediction("m1", "i1", Some(1.0)),
                prediction("m1", "i2", Some(3.0)),
            ],
        );
        preds.insert("m2".into(), vec![prediction("m2", "i1", Some(3.0))]);

        let mut weights = HashMap::new();
        weights.insert("m1".to_string(), 0.5);
        weights.insert("m2".to_string(), 0.5);

        let out = build_ensemble_predictions("collective", &weights, &preds, Utc::now());
        assert_eq!(out.len(), 2);

        let by_input: HashMap<&str, &PredictionRecord> =
            out.iter().map(|p| (p.input_id.as_str(), p)).collect();
        // i1: both members → (0.5·1 + 0.5·3) / 1 = 2
        assert_eq!(
            by_input["i1"]
                .inference_output
                .get("value")
                .unwrap()
                .as_f64()
                .unwrap(),
            2.0
        );
        // i2: only m1 → 3
        assert_eq!(
            by_input["i2"]
                .inference_output
                .get("value")
                .unwrap()
                .as_f64()
                .unwrap(),
            3.0
        );
        assert_eq!(by_input["i1"].model_id, "__ensemble_collective__");
        assert_eq!(
            by_input["i1"].meta.get("ensemble_name").unwrap().as_str(),
            Some("collective")
        );
    }

    #[test]
    fn members_without_value_are_ignored() {
        let mut preds = PredictionsByModel::new();
        preds.insert("m1".into(), vec![prediction("m1", "i1", Some(2.0))]);
        preds.insert("m2".into(), vec![prediction("m2", "i1", None)]);

        let mut weights = HashMap::new();
        weights.insert("m1".to_string(), 0.5);
        weights.insert("m2".to_string(), 0.5);

        let out = build_ensemble_predictions("collective", &weights, &preds, Utc::now());
        assert_eq!(out.len(), 1);
        assert_eq!(
            out[0].inference_output.get("value").unwrap().as_f64().unwrap(),
            2.0
        );
    }
}
