// =============================================================================
// Prediction Lifecycle Stores
// =============================================================================
//
// Inputs, predictions, scores, models and the scheduled-config registry.
// The dispatcher is the only writer of inputs/predictions until they reach
// SCORED; the scorer then owns them. Every write targets a single id, so the
// stores need no cross-row coordination.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::{
    InputRecord, InputStatus, Model, PredictionRecord, PredictionStatus, ScheduledPredictionConfig,
    ScoreRecord,
};

// =============================================================================
// Inputs
// =============================================================================

#[derive(Default)]
pub struct InputStore {
    rows: RwLock<HashMap<String, InputRecord>>,
}

impl InputStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, input: InputRecord) {
        self.rows.write().insert(input.id.clone(), input);
    }

    pub fn get(&self, id: &str) -> Option<InputRecord> {
        self.rows.read().get(id).cloned()
    }

    /// Inputs filtered by status and resolvability bound, oldest first.
    pub fn find(
        &self,
        status: Option<InputStatus>,
        resolvable_before: Option<DateTime<Utc>>,
    ) -> Vec<InputRecord> {
        let rows = self.rows.read();
        let mut out: Vec<InputRecord> = rows
            .values()
            .filter(|i| {
                status.map_or(true, |s| i.status == s)
                    && resolvable_before
                        .map_or(true, |b| i.resolvable_at.map_or(false, |r| r <= b))
            })
            .cloned()
            .collect();
        out.sort_by_key(|i| i.received_at);
        out
    }

    pub fn rollback(&self) {}
}

// =============================================================================
// Predictions
// =============================================================================

#[derive(Default)]
pub struct PredictionStore {
    rows: RwLock<HashMap<String, PredictionRecord>>,
}

impl PredictionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, prediction: PredictionRecord) {
        self.rows
            .write()
            .insert(prediction.id.clone(), prediction);
    }

    /// Persist a dispatch cycle's records in one lock acquisition.
    pub fn save_all(&self, predictions: &[PredictionRecord]) {
        let mut rows = self.rows.write();
        for p in predictions {
            rows.insert(p.id.clone(), p.clone());
        }
    }

    pub fn get(&self, id: &str) -> Option<PredictionRecord> {
        self.rows.read().get(id).cloned()
    }

    /// Predictions by status, ordered by `performed_at`.
    pub fn find(&self, status: Option<PredictionStatus>) -> Vec<PredictionRecord> {
        let rows = self.rows.read();
        let mut out: Vec<PredictionRecord> = rows
            .values()
            .filter(|p| status.map_or(true, |s| p.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|p| p.performed_at);
        out
    }

    /// Predictions for the given models inside `[from, to]`, ordered by
    /// `performed_at`. An empty model list matches nothing.
    pub fn find_range(
        &self,
        model_ids: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Vec<PredictionRecord> {
        let rows = self.rows.read();
        let mut out: Vec<PredictionRecord> = rows
            .values()
            .filter(|p| {
                model_ids.iter().any(|m| *m == p.model_id)
                    && p.performed_at >= from
                    && p.performed_at <= to
            })
            .cloned()
            .collect();
        out.sort_by_key(|p| p.performed_at);
        out
    }

    pub fn rollback(&self) {}
}

// =============================================================================
// Scores
// =============================================================================

#[derive(Default)]
pub struct ScoreStore {
    rows: RwLock<HashMap<String, ScoreRecord>>,
}

impl ScoreStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert by id. Score ids are derived from the prediction id, which
    /// makes re-scoring the same prediction idempotent.
    pub fn save(&self, score: ScoreRecord) {
        self.rows.write().insert(score.id.clone(), score);
    }

    pub fn get(&self, id: &str) -> Option<ScoreRecord> {
        self.rows.read().get(id).cloned()
    }

    pub fn get_by_prediction(&self, prediction_id: &str) -> Option<ScoreRecord> {
        self.rows
            .read()
            .values()
            .find(|s| s.prediction_id == prediction_id)
            .cloned()
    }

    pub fn rollback(&self) {}
}

// =============================================================================
// Models
// =============================================================================

#[derive(Default)]
pub struct ModelStore {
    rows: RwLock<HashMap<String, Model>>,
}

impl ModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert a model, preserving the original `created_at` on refresh.
    pub fn save(&self, model: Model) {
        let mut rows = self.rows.write();
        match rows.get_mut(&model.id) {
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = model;
                existing.created_at = created_at;
                existing.updated_at = Utc::now();
            }
            None => {
                rows.insert(model.id.clone(), model);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Model> {
        self.rows.read().get(id).cloned()
    }

    pub fn fetch_all(&self) -> Vec<Model> {
        let mut models: Vec<Model> = self.rows.read().values().cloned().collect();
        models.sort_by(|a, b| a.id.cmp(&b.id));
        models
    }

    pub fn rollback(&self) {}
}

// =============================================================================
// Scheduled-config registry
// =============================================================================

/// Writer: startup seed. Readers: the dispatcher.
#[derive(Default)]
pub struct ScheduleStore {
    rows: RwLock<Vec<ScheduledPredictionConfig>>,
}

impl ScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace_all(&self, configs: Vec<ScheduledPredictionConfig>) {
        *self.rows.write() = configs;
    }

    /// Active configs sorted by `order`.
    pub fn fetch_active(&self) -> Vec<ScheduledPredictionConfig> {
        let mut configs: Vec<ScheduledPredictionConfig> = self
            .rows
            .read()
            .iter()
            .filter(|c| c.active)
            .cloned()
            .collect();
        configs.sort_by_key(|c| c.order);
        configs
    }

    pub fn rollback(&self) {}
}

// =============================================================================
// Tests
// =============================================================================
