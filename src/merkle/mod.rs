// =============================================================================
// Merkle — tamper evidence over snapshots and cycles
// =============================================================================

pub mod hasher;
pub mod service;
pub mod tree;

pub use hasher::{canonical_snapshot_hash, sha256_concat};
pub use service::{MerkleProof, MerkleService};
pub use tree::{build_merkle_tree, generate_proof, get_root, verify_proof, ProofStep, TreeNode};
