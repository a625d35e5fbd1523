//! In-memory chain store, for tests and single-run nodes.

use std::collections::HashMap;
use std::sync::Mutex;

use agora_common::slots::ConsensusState;
use agora_common::{Block, BlockHash};
use anyhow::Result;

use super::ChainStore;

/// Chain store backed by in-process maps. Contents are lost on shutdown.
#[derive(Default)]
pub struct MemoryStore {
    blocks: Mutex<HashMap<BlockHash, Block>>,
    states: Mutex<HashMap<BlockHash, ConsensusState>>,
    heights: Mutex<HashMap<u64, BlockHash>>,
    meta: Mutex<HashMap<String, BlockHash>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ChainStore for MemoryStore {
    fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>> {
        Ok(self.blocks.lock().unwrap().get(hash).cloned())
    }

    fn put_block(&self, block: &Block) -> Result<()> {
        self.blocks.lock().unwrap().insert(block.hash, block.clone());
        Ok(())
    }

    fn get_consensus_state(&self, hash: &BlockHash) -> Result<Option<ConsensusState>> {
        Ok(self.states.lock().unwrap().get(hash).cloned())
    }

    fn put_consensus_state(&self, hash: &BlockHash, state: &ConsensusState) -> Result<()> {
        self.states.lock().unwrap().insert(*hash, state.clone());
        Ok(())
    }

    fn get_hash_by_height(&self, height: u64) -> Result<Option<BlockHash>> {
        Ok(self.heights.lock().unwrap().get(&height).copied())
    }

    fn put_height_index(&self, height: u64, hash: &BlockHash) -> Result<()> {
        self.heights.lock().unwrap().insert(height, *hash);
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<BlockHash>> {
        Ok(self.meta.lock().unwrap().get(key).copied())
    }

    fn put_meta(&self, key: &str, hash: &BlockHash) -> Result<()> {
        self.meta.lock().unwrap().insert(key.to_string(), *hash);
        Ok(())
    }
}
