// =============================================================================
// Merkle Store
// =============================================================================
//
// Committed cycles and the persisted tree nodes for cycles and checkpoints.
// Node rows reference each other by id; the in-memory tree is rebuilt from
// these rows when a proof is requested.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::types::{MerkleCycle, MerkleNodeRow};

#[derive(Default)]
pub struct MerkleStore {
    cycles: RwLock<HashMap<String, MerkleCycle>>,
    nodes: RwLock<HashMap<String, MerkleNodeRow>>,
}

impl MerkleStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Cycles ──────────────────────────────────────────────────────────

    pub fn save_cycle(&self, cycle: MerkleCycle) {
        self.cycles.write().insert(cycle.id.clone(), cycle);
    }

    pub fn get_cycle(&self, id: &str) -> Option<MerkleCycle> {
        self.cycles.read().get(id).cloned()
    }

    /// The most recently committed cycle; chaining always observes this.
    pub fn latest_cycle(&self) -> Option<MerkleCycle> {
        self.cycles
            .read()
            .values()
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            })
            .cloned()
    }

    /// Cycles with `created_at` in `[since, until]`, oldest first.
    pub fn find_cycles(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Vec<MerkleCycle> {
        let cycles = self.cycles.read();
        let mut out: Vec<MerkleCycle> = cycles
            .values()
            .filter(|c| c.created_at >= since && c.created_at <= until)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    pub fn all_cycles(&self) -> Vec<MerkleCycle> {
        let cycles = self.cycles.read();
        let mut out: Vec<MerkleCycle> = cycles.values().cloned().collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        out
    }

    // ── Nodes ───────────────────────────────────────────────────────────

    pub fn save_node(&self, node: MerkleNodeRow) {
        self.nodes.write().insert(node.id.clone(), node);
    }

    pub fn find_node_by_snapshot(&self, snapshot_id: &str) -> Option<MerkleNodeRow> {
        self.nodes
            .read()
            .values()
            .find(|n| n.snapshot_id.as_deref() == Some(snapshot_id))
            .cloned()
    }

    pub fn find_nodes_by_cycle(&self, cycle_id: &str) -> Vec<MerkleNodeRow> {
        let mut out: Vec<MerkleNodeRow> = self
            .nodes
            .read()
            .values()
            .filter(|n| n.cycle_id.as_deref() == Some(cycle_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.level.cmp(&b.level).then(a.position.cmp(&b.position)));
        out
    }

    /// Checkpoint-tree leaves whose hash matches the given cycle root. Used
    /// to discover which checkpoint covers a cycle.
    pub fn find_checkpoint_nodes_by_hash(&self, hash: &str) -> Vec<MerkleNodeRow> {
        self.nodes
            .read()
            .values()
            .filter(|n| n.checkpoint_id.is_some() && n.hash == hash)
            .cloned()
            .collect()
    }

    pub fn rollback(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cycle(id: &str, offset_secs: i64) -> MerkleCycle {
        MerkleCycle {
            id: id.into(),
            previous_cycle_id: None,
            previous_cycle_root: None,
            snapshots_root: "r".into(),
            chained_root: "r".into(),
            snapshot_count: 1,
            created_at: Utc::now() + chrono::Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn latest_cycle_is_by_created_at() {
        let store = MerkleStore::new();
        store.save_cycle(cycle("a", 0));
        store.save_cycle(cycle("b", 10));
        assert_eq!(store.latest_cycle().unwrap().id, "b");
    }

    #[test]
    fn cycles_in_window_are_ordered() {
        let store = MerkleStore::new();
        store.save_cycle(cycle("b", 10));
        store.save_cycle(cycle("a", 0));
        let all = store.all_cycles();
        assert_eq!(all[0].id, "a");
        assert_eq!(all[1].id, "b");
    }
}
