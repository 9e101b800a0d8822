// =============================================================================
// Binary Merkle tree — construction, proofs, verification
// =============================================================================
//
// Nodes live in an arena and reference each other by index, so persisted
// rows (which reference by id) rebuild into the same structure. An odd node
// count at any level duplicates the last node — never a zero-hash pad.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::merkle::hasher::sha256_concat;

/// In-memory tree node. `left`/`right` are arena indices.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub hash: String,
    pub level: u32,
    pub position: u32,
    pub left: Option<usize>,
    pub right: Option<usize>,
    pub snapshot_id: Option<String>,
    pub snapshot_content_hash: Option<String>,
}

impl TreeNode {
    pub fn leaf(hash: &str, position: u32) -> Self {
        Self {
            hash: hash.to_string(),
            level: 0,
            position,
            left: None,
            right: None,
            snapshot_id: None,
            snapshot_content_hash: None,
        }
    }
}

/// One step of an inclusion proof: the sibling hash and which side the
/// sibling sits on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: String,
    /// "left" or "right" — the position of the sibling.
    pub position: String,
}

/// Build the tree over `leaves`, returning the full arena (leaves first,
/// then intermediates; the root is the node with the highest level). Empty
/// input yields an empty arena.
pub fn build_merkle_tree(leaves: Vec<TreeNode>) -> Vec<TreeNode> {
    if leaves.is_empty() {
        return Vec::new();
    }
    let mut arena = leaves;
    if arena.len() == 1 {
        return arena;
    }

    let mut current: Vec<usize> = (0..arena.len()).collect();
    let mut level: u32 = 1;
    while current.len() > 1 {
        // Duplicate the last node on odd counts.
        if current.len() % 2 == 1 {
            current.push(*current.last().unwrap());
        }
        let mut next = Vec::with_capacity(current.len() / 2);
        for (pair, chunk) in current.chunks(2).enumerate() {
            let (left, right) = (chunk[0], chunk[1]);
            let parent = TreeNode {
                hash: sha256_concat(&arena[left].hash, &arena[right].hash),
                level,
                position: pair as u32,
                left: Some(left),
                right: Some(right),
                snapshot_id: None,
                snapshot_content_hash: None,
            };
            arena.push(parent);
            next.push(arena.len() - 1);
        }
        current = next;
        level += 1;
    }
    arena
}

/// The root node of an arena built by [`build_merkle_tree`].
pub fn get_root(arena: &[TreeNode]) -> Option<&TreeNode> {
    arena.iter().max_by_key(|n| n.level)
}

/// Sibling path from the leaf with `leaf_hash` up to the root. Empty when
/// the leaf is unknown (or is itself the root).
pub fn generate_proof(arena: &[TreeNode], leaf_hash: &str) -> Vec<ProofStep> {
    let Some(leaf) = arena
        .iter()
        .position(|n| n.level == 0 && n.hash == leaf_hash)
    else {
        return Vec::new();
    };

    // child index → parent index
    let mut parent_of: std::collections::HashMap<usize, usize> = Default::default();
    for (idx, node) in arena.iter().enumerate() {
        if let Some(left) = node.left {
            parent_of.insert(left, idx);
        }
        if let Some(right) = node.right {
            parent_of.insert(right, idx);
        }
    }

    let mut path = Vec::new();
    let mut current = leaf;
    while let Some(&parent) = parent_of.get(&current) {
        let node = &arena[parent];
        if node.left == Some(current) {
            if let Some(right) = node.right {
                path.push(ProofStep {
                    hash: arena[right].hash.clone(),
                    position: "right".into(),
                });
            }
        } else if let Some(left) = node.left {
            path.push(ProofStep {
                hash: arena[left].hash.clone(),
                position: "left".into(),
            });
        }
        current = parent;
    }
    path
}

/// Recompute the root from a leaf hash and proof path, comparing to the
/// expected root.
pub fn verify_proof(leaf_hash: &str, proof: &[ProofStep], expected_root: &str) -> bool {
    let mut current = leaf_hash.to_string();
    for step in proof {
        current = if step.position == "right" {
            sha256_concat(&current, &step.hash)
        } else {
            sha256_concat(&step.hash, &current)
        };
    }
    current == expected_root
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(hashes: &[&str]) -> Vec<TreeNode> {
        hashes
            .iter()
            .enumerate()
            .map(|(i, h)| TreeNode::leaf(h, i as u32))
            .collect()
    }

    #[test]
    fn empty_input_yields_empty_arena() {
        assert!(build_merkle_tree(Vec::new()).is_empty());
    }

    #[test]
    fn single_leaf_is_its_own_root() {
        let arena = build_merkle_tree(leaves(&["aaaa"]));
        assert_eq!(arena.len(), 1);
        assert_eq!(get_root(&arena).unwrap().hash, "aaaa");
    }

    #[test]
    fn two_leaves_hash_as_hex_concat() {
        let arena = build_merkle_tree(leaves(&["aaaa", "bbbb"]));
        assert_eq!(arena.len(), 3);
        let root = get_root(&arena).unwrap();
        assert_eq!(root.hash, sha256_concat("aaaa", "bbbb"));
        assert_eq!(root.level, 1);
    }

    #[test]
    fn odd_count_duplicates_last_leaf() {
        let arena = build_merkle_tree(leaves(&["aa", "bb", "cc"]));
        // 3 leaves + 2 level-1 parents + 1 root.
        assert_eq!(arena.len(), 6);
        let root = get_root(&arena).unwrap();
        let left = sha256_concat("aa", "bb");
        let right = sha256_concat("cc", "cc");
        assert_eq!(root.hash, sha256_concat(&left, &right));
        // The duplicated pair references one arena node twice.
        let dup_parent = arena.iter().find(|n| n.level == 1 && n.position == 1).unwrap();
        assert_eq!(dup_parent.left, dup_parent.right);
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        let hashes = ["h0", "h1", "h2", "h3", "h4"];
        let arena = build_merkle_tree(leaves(&hashes));
        let root = get_root(&arena).unwrap().hash.clone();
        for h in &hashes {
            let proof = generate_proof(&arena, h);
            assert!(verify_proof(h, &proof, &root), "leaf {h} failed");
        }
    }

    #[test]
    fn tampered_leaf_fails_verification() {
        let arena = build_merkle_tree(leaves(&["h0", "h1", "h2"]));
        let root = get_root(&arena).unwrap().hash.clone();
        let proof = generate_proof(&arena, "h1");
        assert!(verify_proof("h1", &proof, &root));
        assert!(!verify_proof("tampered", &proof, &root));
    }

    #[test]
    fn unknown_leaf_has_empty_proof() {
        let arena = build_merkle_tree(leaves(&["h0", "h1"]));
        assert!(generate_proof(&arena, "nope").is_empty());
    }
}
