use agora_common::slots::ConsensusState;
use agora_common::{Block, BlockHash, ConsensusBlock};
use anyhow::Result;

pub mod fjall;
pub mod memory;

/// Meta key for the canonical tail hash
pub const TAIL_KEY: &str = "tail";
/// Meta key for the last irreversible block hash
pub const LIB_KEY: &str = "lib";
/// Meta key for the genesis hash
pub const GENESIS_KEY: &str = "genesis";

/// Persistent record store for canonical blocks and their consensus states.
///
/// The chain maintainer is the only writer; reads must see every record a
/// prior write persisted (no caching contract is implied here - the chain
/// keeps its own bounded cache above this trait).
pub trait ChainStore: Send + Sync {
    fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>>;
    fn put_block(&self, block: &Block) -> Result<()>;

    fn get_consensus_state(&self, hash: &BlockHash) -> Result<Option<ConsensusState>>;
    fn put_consensus_state(&self, hash: &BlockHash, state: &ConsensusState) -> Result<()>;

    /// Height index covers canonical blocks only and is rewritten on reorg.
    fn get_hash_by_height(&self, height: u64) -> Result<Option<BlockHash>>;
    fn put_height_index(&self, height: u64, hash: &BlockHash) -> Result<()>;

    /// Well-known singleton pointers (tail, LIB, genesis).
    fn get_meta(&self, key: &str) -> Result<Option<BlockHash>>;
    fn put_meta(&self, key: &str, hash: &BlockHash) -> Result<()>;

    /// A block together with its consensus state, if both are stored.
    fn get_consensus_block(&self, hash: &BlockHash) -> Result<Option<ConsensusBlock>> {
        let Some(block) = self.get_block(hash)? else {
            return Ok(None);
        };
        let Some(state) = self.get_consensus_state(hash)? else {
            return Ok(None);
        };
        Ok(Some(ConsensusBlock::new(block, state)))
    }
}
