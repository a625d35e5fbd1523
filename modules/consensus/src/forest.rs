//! Bounded pool of blocks not yet linked into the canonical chain.
//!
//! The forest is an arena: one owning map from hash to node, with
//! parent/child relationships stored as hash keys rather than references.
//! Evicting a node unlinks it from both sides so no dangling adjacency
//! entries survive it.

use std::collections::{HashMap, VecDeque};

use agora_common::{Block, BlockHash};
use tracing::debug;

use crate::errors::ChainError;

/// Default bound on the number of pooled blocks.
pub const DEFAULT_FOREST_CAPACITY: usize = 128;

/// A pooled block with its linkage into the rest of the forest.
#[derive(Debug, Clone)]
pub struct ForestNode {
    /// The block itself
    pub block: Block,
    /// Hash of this block (identity key in the arena)
    pub hash: BlockHash,
    /// Hash of the parent block
    pub parent_hash: BlockHash,
    /// Parent node, if it is also pooled
    pub parent: Option<BlockHash>,
    /// Pooled nodes whose parent is this block
    pub children: Vec<BlockHash>,
}

impl ForestNode {
    fn new(block: Block) -> Self {
        let hash = block.hash;
        let parent_hash = block.parent_hash();
        Self {
            block,
            hash,
            parent_hash,
            parent: None,
            children: Vec::new(),
        }
    }
}

/// The block forest: an eviction-bounded arena of not-yet-canonical blocks.
pub struct BlockForest {
    /// All pooled nodes keyed by hash
    nodes: HashMap<BlockHash, ForestNode>,
    /// Insertion order, oldest first, for eviction
    order: VecDeque<BlockHash>,
    /// Maximum number of pooled nodes
    capacity: usize,
}

impl BlockForest {
    /// Create an empty forest bounded to `capacity` nodes.
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&ForestNode> {
        self.nodes.get(hash)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Insert a block, evicting the oldest node if the bound is exceeded.
    ///
    /// Fails with [`ChainError::DuplicatedBlock`] if the hash is already
    /// pooled. After insertion, any pooled nodes claiming this block as
    /// parent are linked to it (children arriving before parents is
    /// expected under network reordering).
    pub fn insert(&mut self, block: Block) -> Result<(), ChainError> {
        let hash = block.hash;
        if self.nodes.contains_key(&hash) {
            return Err(ChainError::DuplicatedBlock { hash });
        }

        self.nodes.insert(hash, ForestNode::new(block));
        self.order.push_back(hash);

        self.adopt_waiting_children(hash);
        self.link_to_pooled_parent(hash);

        while self.nodes.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            // Entries in `order` may already have been promoted or removed
            if self.nodes.contains_key(&oldest) {
                debug!("Forest full, evicting {oldest}");
                self.remove(&oldest);
            }
        }

        Ok(())
    }

    /// Remove a node, unlinking it from its parent's children and clearing
    /// its children's parent back-references.
    pub fn remove(&mut self, hash: &BlockHash) -> Option<ForestNode> {
        let node = self.nodes.remove(hash)?;

        if let Some(parent_hash) = node.parent {
            if let Some(parent) = self.nodes.get_mut(&parent_hash) {
                parent.children.retain(|h| h != hash);
            }
        }

        for child_hash in &node.children {
            if let Some(child) = self.nodes.get_mut(child_hash) {
                child.parent = None;
            }
        }

        self.order.retain(|h| h != hash);
        Some(node)
    }

    /// Walk parent links up from `hash` to the root of its linked subtree.
    ///
    /// Returns the root's hash and the number of pooled ancestors between
    /// `hash` and the root inclusive of the root - the count of blocks
    /// still unlinked to the canonical chain above this one.
    pub fn subtree_root(&self, hash: &BlockHash) -> (BlockHash, usize) {
        let mut current = *hash;
        let mut unsynced = 0;
        while let Some(parent) = self.nodes.get(&current).and_then(|n| n.parent) {
            current = parent;
            unsynced += 1;
        }
        (current, unsynced)
    }

    /// Children of a pooled node, cloned for traversal while mutating.
    pub fn children_of(&self, hash: &BlockHash) -> Vec<BlockHash> {
        self.nodes.get(hash).map(|n| n.children.clone()).unwrap_or_default()
    }

    /// Link any already-pooled nodes whose parent hash is `hash`.
    fn adopt_waiting_children(&mut self, hash: BlockHash) {
        let waiting: Vec<BlockHash> = self
            .nodes
            .values()
            .filter(|n| n.hash != hash && n.parent_hash == hash)
            .map(|n| n.hash)
            .collect();

        for child_hash in waiting {
            if let Some(child) = self.nodes.get_mut(&child_hash) {
                child.parent = Some(hash);
            }
            if let Some(node) = self.nodes.get_mut(&hash) {
                node.children.push(child_hash);
            }
        }
    }

    /// Link `hash` to its parent if the parent is pooled.
    fn link_to_pooled_parent(&mut self, hash: BlockHash) {
        let Some(parent_hash) = self.nodes.get(&hash).map(|n| n.parent_hash) else {
            return;
        };
        if !self.nodes.contains_key(&parent_hash) {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&hash) {
            node.parent = Some(parent_hash);
        }
        if let Some(parent) = self.nodes.get_mut(&parent_hash) {
            parent.children.push(hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_common::crypto::Keypair;

    fn keypair() -> Keypair {
        Keypair::from_seed(&[1u8; 32])
    }

    fn block(height: u64, parent: BlockHash, timestamp: i64) -> Block {
        Block::build(height, parent, timestamp, vec![], &keypair())
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let mut forest = BlockForest::new(8);
        let b = block(1, BlockHash::default(), 15);
        forest.insert(b.clone()).unwrap();
        assert!(matches!(
            forest.insert(b),
            Err(ChainError::DuplicatedBlock { .. })
        ));
        assert_eq!(forest.len(), 1);
    }

    #[test]
    fn children_arriving_first_are_adopted() {
        let mut forest = BlockForest::new(8);
        let parent = block(1, BlockHash::default(), 15);
        let child = block(2, parent.hash, 30);

        forest.insert(child.clone()).unwrap();
        assert!(forest.get(&child.hash).unwrap().parent.is_none());

        forest.insert(parent.clone()).unwrap();
        assert_eq!(forest.get(&child.hash).unwrap().parent, Some(parent.hash));
        assert_eq!(forest.children_of(&parent.hash), vec![child.hash]);
    }

    #[test]
    fn subtree_root_counts_unsynced_ancestors() {
        let mut forest = BlockForest::new(8);
        let b1 = block(1, BlockHash::default(), 15);
        let b2 = block(2, b1.hash, 30);
        let b3 = block(3, b2.hash, 45);

        // Reverse arrival order
        forest.insert(b3.clone()).unwrap();
        forest.insert(b2.clone()).unwrap();
        forest.insert(b1.clone()).unwrap();

        let (root, unsynced) = forest.subtree_root(&b3.hash);
        assert_eq!(root, b1.hash);
        assert_eq!(unsynced, 2);

        let (root, unsynced) = forest.subtree_root(&b1.hash);
        assert_eq!(root, b1.hash);
        assert_eq!(unsynced, 0);
    }

    #[test]
    fn eviction_unlinks_both_sides() {
        let mut forest = BlockForest::new(2);
        let b1 = block(1, BlockHash::default(), 15);
        let b2 = block(2, b1.hash, 30);
        let b3 = block(3, b2.hash, 45);

        forest.insert(b1.clone()).unwrap();
        forest.insert(b2.clone()).unwrap();
        // Inserting b3 exceeds the bound; b1 (oldest) is evicted
        forest.insert(b3.clone()).unwrap();

        assert!(!forest.contains(&b1.hash));
        assert_eq!(forest.len(), 2);
        // b2 must no longer claim the evicted b1 as its parent
        assert!(forest.get(&b2.hash).unwrap().parent.is_none());
    }

    #[test]
    fn remove_clears_child_back_references() {
        let mut forest = BlockForest::new(8);
        let b1 = block(1, BlockHash::default(), 15);
        let b2 = block(2, b1.hash, 30);
        forest.insert(b1.clone()).unwrap();
        forest.insert(b2.clone()).unwrap();

        forest.remove(&b1.hash);
        assert!(forest.get(&b2.hash).unwrap().parent.is_none());
    }
}
