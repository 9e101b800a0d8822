// =============================================================================
// Checkpoint Builder — periodic roll-up for on-chain settlement
// =============================================================================
//
// Every period: gather the snapshots since the last checkpoint, aggregate
// them per model weighted by prediction count, rank by the challenge's
// ranking key, build the emission payload, and persist a PENDING checkpoint.
// The merkle checkpoint tree over the covered cycles is committed last and
// its root recorded on the checkpoint row.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::contract::ChallengeContract;
use crate::emission::{build_emission, RankedEntry};
use crate::merkle::MerkleService;
use crate::store::Store;
use crate::types::{CheckpointRecord, CheckpointStatus, JsonMap, SnapshotRecord};

pub struct CheckpointService {
    store: Arc<Store>,
    contract: Arc<ChallengeContract>,
    merkle: Arc<MerkleService>,
    crunch_pubkey: String,
    compute_provider: Option<String>,
    data_provider: Option<String>,
    interval_seconds: u64,
}

impl CheckpointService {
    pub fn new(
        store: Arc<Store>,
        contract: Arc<ChallengeContract>,
        merkle: Arc<MerkleService>,
        crunch_pubkey: String,
        compute_provider: Option<String>,
        data_provider: Option<String>,
        interval_seconds: u64,
    ) -> Self {
        Self {
            store,
            contract,
            merkle,
            crunch_pubkey,
            compute_provider,
            data_provider,
            interval_seconds: interval_seconds.max(1),
        }
    }

    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        info!(interval = self.interval_seconds, "checkpoint worker started");
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.interval_seconds));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = interval.tick() => {
                    self.create_checkpoint(Utc::now());
                }
            }
        }
        info!("checkpoint worker stopped");
    }

    /// Roll the window since the last checkpoint into a new PENDING
    /// checkpoint. Returns `None` when the window holds no snapshots.
    pub fn create_checkpoint(&self, now: DateTime<Utc>) -> Option<CheckpointRecord> {
        let period_start = self
            .store
            .checkpoints
            .get_latest()
            .map(|last| last.period_end)
            .unwrap_or_else(|| now - Duration::seconds(self.interval_seconds as i64));

        let snapshots =
            self.store
                .snapshots
                .find(None, Some(period_start), Some(now), usize::MAX);
        if snapshots.is_empty() {
            info!(since = %period_start, "no snapshots in window, skipping checkpoint");
            return None;
        }

        let ranked = self.rank_models(&snapshots);
        let emission = build_emission(
            &self.contract.emission,
            &ranked,
            &self.crunch_pubkey,
            self.compute_provider.as_deref(),
            self.data_provider.as_deref(),
        );

        let mut meta = JsonMap::new();
        meta.insert("snapshot_count".into(), Value::from(snapshots.len() as u64));
        meta.insert("model_count".into(), Value::from(ranked.len() as u64));
        meta.insert(
            "ranking".into(),
            serde_json::to_value(&ranked).unwrap_or_default(),
        );

        let checkpoint = CheckpointRecord {
            id: format!("CKP_{}", now.format("%Y%m%d_%H%M%S")),
            period_start,
            period_end: now,
            status: CheckpointStatus::Pending,
            entries: vec![emission],
            meta,
            merkle_root: None,
            created_at: now,
            tx_hash: None,
            submitted_at: None,
        };
        self.store.checkpoints.save(checkpoint.clone());

        // Tamper evidence over the covered cycles.
        match self
            .merkle
            .commit_checkpoint(&checkpoint.id, period_start, now, now)
        {
            Some(root) => {
                self.store.checkpoints.update_merkle_root(&checkpoint.id, &root);
                info!(checkpoint = %checkpoint.id, root = %&root[..16.min(root.len())], "checkpoint merkle root recorded");
            }
            None => warn!(checkpoint = %checkpoint.id, "no merkle cycles covered by checkpoint"),
        }

        info!(
            checkpoint = %checkpoint.id,
            models = ranked.len(),
            snapshots = snapshots.len(),
            period_start = %period_start,
            period_end = %now,
            "created checkpoint"
        );
        self.store.checkpoints.get(&checkpoint.id)
    }

    /// Aggregate snapshots per model (weighted by prediction count) and rank
    /// by the challenge's ranking key.
    fn rank_models(&self, snapshots: &[SnapshotRecord]) -> Vec<RankedEntry> {
        let mut by_model: HashMap<String, Vec<&SnapshotRecord>> = HashMap::new();
        for snap in snapshots {
            by_model.entry(snap.model_id.clone()).or_default().push(snap);
        }

        let mut entries: Vec<RankedEntry> = Vec::new();
        for (model_id, model_snaps) in by_model {
            let total_preds: u64 = model_snaps.iter().map(|s| s.prediction_count).sum();
            if total_preds == 0 {
                continue;
            }

            let mut summary: JsonMap = JsonMap::new();
            for snap in &model_snaps {
                let weight = snap.prediction_count as f64 / total_preds as f64;
                for (key, value) in &snap.result_summary {
                    if let Some(v) = value.as_f64() {
                        let prev = summary.get(key).and_then(|x| x.as_f64()).unwrap_or(0.0);
                        summary.insert(key.clone(), Value::from(prev + v * weight));
                    }
                }
            }

            let model = self.store.models.get(&model_id);
            entries.push(RankedEntry {
                model_id,
                model_name: model.as_ref().map(|m| m.name.clone()),
                cruncher_name: model.as_ref().map(|m| m.player_name.clone()),
                rank: 0,
                prediction_count: total_preds,
                snapshot_count: model_snaps.len() as u64,
                result_summary: summary,
            });
        }

        let key = &self.contract.aggregation.ranking_key;
        let descending = self.contract.aggregation.descending();
        entries.sort_by(|a, b| {
            let va = a.result_summary.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
            let vb = b.result_summary.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
            let ord = va.partial_cmp(&vb).unwrap_or(std::cmp::Ordering::Equal);
            let ord = if descending { ord.reverse() } else { ord };
            ord.then_with(|| a.model_id.cmp(&b.model_id))
        });
        for (idx, entry) in entries.iter_mut().enumerate() {
            entry.rank = idx as u32 + 1;
        }
        entries
    }
}

// =============================================================================
// Tests
// =============================================================================
