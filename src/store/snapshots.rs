// =============================================================================
// Snapshot / Leaderboard / Checkpoint Stores
// =============================================================================
//
// Snapshots and leaderboards are append-only; readers always take the latest
// leaderboard by `created_at`. Checkpoints carry a settlement status machine
// that only the API mutates.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::{CheckpointRecord, CheckpointStatus, JsonMap, Leaderboard, LeaderboardEntry, SnapshotRecord};

// =============================================================================
// Snapshots
// =============================================================================

#[derive(Default)]
pub struct SnapshotStore {
    rows: RwLock<HashMap<String, SnapshotRecord>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, snapshot: SnapshotRecord) {
        self.rows.write().insert(snapshot.id.clone(), snapshot);
    }

    pub fn get(&self, id: &str) -> Option<SnapshotRecord> {
        self.rows.read().get(id).cloned()
    }

    /// Record the canonical content hash once the snapshot is committed to a
    /// merkle cycle.
    pub fn set_content_hash(&self, id: &str, content_hash: &str) {
        if let Some(row) = self.rows.write().get_mut(id) {
            row.content_hash = Some(content_hash.to_string());
        }
    }

    /// Snapshots filtered by model and `period_end` bounds, newest first.
    pub fn find(
        &self,
        model_id: Option<&str>,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
        limit: usize,
    ) -> Vec<SnapshotRecord> {
        let rows = self.rows.read();
        let mut out: Vec<SnapshotRecord> = rows
            .values()
            .filter(|s| {
                model_id.map_or(true, |m| s.model_id == m)
                    && since.map_or(true, |b| s.period_end >= b)
                    && until.map_or(true, |b| s.period_end <= b)
            })
            .cloned()
            .collect();
        out.sort_by_key(|s| std::cmp::Reverse(s.period_end));
        out.truncate(limit);
        out
    }

    pub fn rollback(&self) {}
}

// =============================================================================
// Leaderboards
// =============================================================================

#[derive(Default)]
pub struct LeaderboardStore {
    rows: RwLock<Vec<Leaderboard>>,
}

impl LeaderboardStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a new leaderboard generation.
    pub fn save(&self, entries: Vec<LeaderboardEntry>, meta: JsonMap) -> Leaderboard {
        let now = Utc::now();
        let board = Leaderboard {
            id: format!("LB_{}", now.format("%Y%m%d_%H%M%S%.3f")),
            created_at: now,
            entries,
            meta,
        };
        self.rows.write().push(board.clone());
        board
    }

    /// The canonical (latest) leaderboard.
    pub fn get_latest(&self) -> Option<Leaderboard> {
        self.rows
            .read()
            .iter()
            .max_by_key(|b| b.created_at)
            .cloned()
    }

    pub fn rollback(&self) {}
}

// =============================================================================
// Checkpoints
// =============================================================================

#[derive(Default)]
pub struct CheckpointStore {
    rows: RwLock<HashMap<String, CheckpointRecord>>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save(&self, checkpoint: CheckpointRecord) {
        self.rows
            .write()
            .insert(checkpoint.id.clone(), checkpoint);
    }

    pub fn get(&self, id: &str) -> Option<CheckpointRecord> {
        self.rows.read().get(id).cloned()
    }

    /// Checkpoints newest-first, optionally filtered by status.
    pub fn find(&self, status: Option<CheckpointStatus>, limit: usize) -> Vec<CheckpointRecord> {
        let rows = self.rows.read();
        let mut out: Vec<CheckpointRecord> = rows
            .values()
            .filter(|c| status.map_or(true, |s| c.status == s))
            .cloned()
            .collect();
        out.sort_by_key(|c| std::cmp::Reverse(c.created_at));
        out.truncate(limit);
        out
    }

    pub fn get_latest(&self) -> Option<CheckpointRecord> {
        self.rows
            .read()
            .values()
            .max_by_key(|c| c.created_at)
            .cloned()
    }

    pub fn update_merkle_root(&self, id: &str, merkle_root: &str) {
        if let Some(row) = self.rows.write().get_mut(id) {
            row.merkle_root = Some(merkle_root.to_string());
        }
    }

    pub fn rollback(&self) {}
}

// =============================================================================
// Tests
// =============================================================================
