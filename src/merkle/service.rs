// =============================================================================
// Merkle Service — cycle chaining, checkpoint trees, inclusion proofs
// =============================================================================
//
// After every score cycle: hash the cycle's snapshots, build a mini-tree,
// chain its root to the previous cycle (`SHA-256(prev_chained || snapshots)`
// over hex strings; the genesis cycle's chained root IS its snapshots root).
// At checkpoint time: a tree over the covered cycles' chained roots. Proofs
// rebuild the persisted cycle tree and walk sibling steps to the root.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use crate::merkle::hasher::{canonical_snapshot_hash, sha256_concat};
use crate::merkle::tree::{
    build_merkle_tree, generate_proof, get_root, verify_proof, ProofStep, TreeNode,
};
use crate::store::{MerkleStore, SnapshotStore};
use crate::types::{MerkleCycle, MerkleNodeRow, SnapshotRecord};

/// Inclusion proof for one snapshot: leaf → cycle tree root.
#[derive(Debug, Clone, Serialize)]
pub struct MerkleProof {
    pub snapshot_id: String,
    pub snapshot_content_hash: String,
    pub cycle_id: Option<String>,
    pub snapshots_root: Option<String>,
    pub chained_root: Option<String>,
    pub checkpoint_id: Option<String>,
    pub path: Vec<ProofStep>,
}

impl MerkleProof {
    /// Recompute the path and compare against the cycle's snapshots root.
    pub fn verify(&self) -> bool {
        match &self.snapshots_root {
            Some(root) => verify_proof(&self.snapshot_content_hash, &self.path, root),
            None => false,
        }
    }
}

pub struct MerkleService {
    store: Arc<MerkleStore>,
    snapshots: Arc<SnapshotStore>,
}

impl MerkleService {
    pub fn new(store: Arc<MerkleStore>, snapshots: Arc<SnapshotStore>) -> Self {
        Self { store, snapshots }
    }

    /// Commit one score cycle. Returns `None` when there are no snapshots —
    /// an empty cycle is never recorded.
    pub fn commit_cycle(
        &self,
        snapshots: &[SnapshotRecord],
        now: DateTime<Utc>,
    ) -> Option<MerkleCycle> {
        if snapshots.is_empty() {
            return None;
        }

        let cycle_id = format!("CYC_{}", now.format("%Y%m%d_%H%M%S_%6f"));

        // Leaves sorted by model id for determinism.
        let mut sorted: Vec<&SnapshotRecord> = snapshots.iter().collect();
        sorted.sort_by(|a, b| a.model_id.cmp(&b.model_id));

        let mut leaves = Vec::with_capacity(sorted.len());
        for (position, snap) in sorted.iter().enumerate() {
            let content_hash = canonical_snapshot_hash(
                &snap.model_id,
                snap.period_start,
                snap.period_end,
                snap.prediction_count,
                &snap.result_summary,
            );
            self.snapshots.set_content_hash(&snap.id, &content_hash);
            let mut leaf = TreeNode::leaf(&content_hash, position as u32);
            leaf.snapshot_id = Some(snap.id.clone());
            leaf.snapshot_content_hash = Some(content_hash);
            leaves.push(leaf);
        }

        let arena = build_merkle_tree(leaves);
        let snapshots_root = get_root(&arena)
            .map(|n| n.hash.clone())
            .unwrap_or_default();

        // Chain to the latest committed cycle.
        let previous = self.store.latest_cycle();
        let (previous_id, previous_root) = match &previous {
            Some(prev) => (Some(prev.id.clone()), Some(prev.chained_root.clone())),
            None => (None, None),
        };
        let chained_root = match &previous_root {
            Some(prev) => sha256_concat(prev, &snapshots_root),
            None => snapshots_root.clone(),
        };

        let cycle = MerkleCycle {
            id: cycle_id.clone(),
            previous_cycle_id: previous_id,
            previous_cycle_root: previous_root,
            snapshots_root: snapshots_root.clone(),
            chained_root: chained_root.clone(),
            snapshot_count: sorted.len() as u64,
            created_at: now,
        };
        self.store.save_cycle(cycle.clone());
        self.persist_nodes(&arena, Some(&cycle_id), None, now);

        info!(
            cycle = %cycle_id,
            snapshots = sorted.len(),
            snapshots_root = %&snapshots_root[..16.min(snapshots_root.len())],
            chained_root = %&chained_root[..16.min(chained_root.len())],
            "merkle cycle committed"
        );
        Some(cycle)
    }

    /// Build the checkpoint tree over the chained roots of every cycle in
    /// `[period_start, period_end]`. Returns the checkpoint merkle root, or
    /// `None` when the window holds no cycles.
    pub fn commit_checkpoint(
        &self,
        checkpoint_id: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let cycles = self.store.find_cycles(period_start, period_end);
        if cycles.is_empty() {
            info!(checkpoint = %checkpoint_id, "no merkle cycles in checkpoint window");
            return None;
        }

        let leaves: Vec<TreeNode> = cycles
            .iter()
            .enumerate()
            .map(|(i, c)| TreeNode::leaf(&c.chained_root, i as u32))
            .collect();
        let arena = build_merkle_tree(leaves);
        let merkle_root = get_root(&arena).map(|n| n.hash.clone())?;

        self.persist_nodes(&arena, None, Some(checkpoint_id), now);

        info!(
            checkpoint = %checkpoint_id,
            cycles = cycles.len(),
            root = %&merkle_root[..16.min(merkle_root.len())],
            "merkle checkpoint committed"
        );
        Some(merkle_root)
    }

    /// Inclusion proof for one committed snapshot. Rebuilds the cycle's tree
    /// from persisted nodes and walks sibling steps from the leaf.
    pub fn get_proof(&self, snapshot_id: &str) -> Option<MerkleProof> {
        let leaf_row = self.store.find_node_by_snapshot(snapshot_id)?;
        let cycle_id = leaf_row.cycle_id.clone()?;

        let rows = self.store.find_nodes_by_cycle(&cycle_id);
        let mut index_of: HashMap<String, usize> = HashMap::new();
        let mut arena: Vec<TreeNode> = Vec::with_capacity(rows.len());
        for row in &rows {
            index_of.insert(row.id.clone(), arena.len());
            arena.push(TreeNode {
                hash: row.hash.clone(),
                level: row.level,
                position: row.position,
                left: None,
                right: None,
                snapshot_id: row.snapshot_id.clone(),
                snapshot_content_hash: row.snapshot_content_hash.clone(),
            });
        }
        for row in &rows {
            let idx = index_of[&row.id];
            arena[idx].left = row
                .left_child_id
                .as_ref()
                .and_then(|id| index_of.get(id))
                .copied();
            arena[idx].right = row
                .right_child_id
                .as_ref()
                .and_then(|id| index_of.get(id))
                .copied();
        }

        let path = generate_proof(&arena, &leaf_row.hash);
        let cycle = self.store.get_cycle(&cycle_id);

        // Which checkpoint tree (if any) covers this cycle's chained root.
        let checkpoint_id = cycle.as_ref().and_then(|c| {
            self.store
                .find_checkpoint_nodes_by_hash(&c.chained_root)
                .into_iter()
                .find_map(|n| n.checkpoint_id)
        });

        Some(MerkleProof {
            snapshot_id: snapshot_id.to_string(),
            snapshot_content_hash: leaf_row
                .snapshot_content_hash
                .unwrap_or_else(|| leaf_row.hash.clone()),
            cycle_id: Some(cycle_id),
            snapshots_root: cycle.as_ref().map(|c| c.snapshots_root.clone()),
            chained_root: cycle.as_ref().map(|c| c.chained_root.clone()),
            checkpoint_id,
            path,
        })
    }

    /// Persist the arena under stable ids `MRK_{owner}_{level}_{position}`.
    fn persist_nodes(
        &self,
        arena: &[TreeNode],
        cycle_id: Option<&str>,
        checkpoint_id: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let owner = cycle_id.or(checkpoint_id).unwrap_or_default();
        let node_id =
            |node: &TreeNode| format!("MRK_{}_{}_{}", owner, node.level, node.position);
        for node in arena {
            self.store.save_node(MerkleNodeRow {
                id: node_id(node),
                cycle_id: cycle_id.map(str::to_string),
                checkpoint_id: checkpoint_id.map(str::to_string),
                level: node.level,
                position: node.position,
                hash: node.hash.clone(),
                left_child_id: node.left.map(|i| node_id(&arena[i])),
                right_child_id: node.right.map(|i| node_id(&arena[i])),
                snapshot_id: node.snapshot_id.clone(),
                snapshot_content_hash: node.snapshot_content_hash.clone(),
                created_at: now,
            });
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
