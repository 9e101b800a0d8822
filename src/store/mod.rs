// =============================================================================
// Store — in-process repositories
// =============================================================================
//
// One `Store` value aggregates every repository. Workers share it through
// `Arc<AppState>`; each write operates on disjoint row sets by design (feed
// rows per identity, lifecycle rows per id, snapshots per cycle), so the
// repositories need only their own interior locks.
//
// `rollback_all` exists for the score cycle's failure path: repositories
// expose `rollback()` as part of their contract, a no-op for this backing.
// =============================================================================

pub mod backfill_jobs;
pub mod feed_records;
pub mod merkle;
pub mod predictions;
pub mod snapshots;

use std::sync::Arc;

pub use backfill_jobs::BackfillJobStore;
pub use feed_records::{FeedIndexEntry, FeedRecordStore};
pub use merkle::MerkleStore;
pub use predictions::{InputStore, ModelStore, PredictionStore, ScheduleStore, ScoreStore};
pub use snapshots::{CheckpointStore, LeaderboardStore, SnapshotStore};

pub struct Store {
    pub feed_records: Arc<FeedRecordStore>,
    pub backfill_jobs: Arc<BackfillJobStore>,
    pub inputs: Arc<InputStore>,
    pub predictions: Arc<PredictionStore>,
    pub scores: Arc<ScoreStore>,
    pub models: Arc<ModelStore>,
    pub schedules: Arc<ScheduleStore>,
    pub snapshots: Arc<SnapshotStore>,
    pub leaderboards: Arc<LeaderboardStore>,
    pub checkpoints: Arc<CheckpointStore>,
    pub merkle: Arc<MerkleStore>,
}

impl Store {
    pub fn new() -> Self {
        Self {
            feed_records: Arc::new(FeedRecordStore::new()),
            backfill_jobs: Arc::new(BackfillJobStore::new()),
            inputs: Arc::new(InputStore::new()),
            predictions: Arc::new(PredictionStore::new()),
            scores: Arc::new(ScoreStore::new()),
            models: Arc::new(ModelStore::new()),
            schedules: Arc::new(ScheduleStore::new()),
            snapshots: Arc::new(SnapshotStore::new()),
            leaderboards: Arc::new(LeaderboardStore::new()),
            checkpoints: Arc::new(CheckpointStore::new()),
            merkle: Arc::new(MerkleStore::new()),
        }
    }

    /// Best-effort rollback across every repository after a failed cycle.
    pub fn rollback_all(&self) {
        self.feed_records.rollback();
        self.backfill_jobs.rollback();
        self.inputs.rollback();
        self.predictions.rollback();
        self.scores.rollback();
        self.models.rollback();
        self.schedules.rollback();
        self.snapshots.rollback();
        self.leaderboards.rollback();
        self.checkpoints.rollback();
        self.merkle.rollback();
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}
