//! Fjall-backed persistent chain store.

use std::{fs, path::PathBuf, sync::Arc};

use agora_common::slots::ConsensusState;
use agora_common::{Block, BlockHash};
use anyhow::Result;
use config::Config;
use fjall::{Database, Keyspace};

use super::ChainStore;

const DEFAULT_DATABASE_PATH: &str = "fjall-chain";
const DEFAULT_CLEAR_ON_START: bool = false;
const BLOCKS_KEYSPACE: &str = "blocks";
const STATES_KEYSPACE: &str = "consensus-states";
const BLOCK_HASHES_BY_HEIGHT_KEYSPACE: &str = "block-hashes-by-height";
const META_KEYSPACE: &str = "meta";

pub struct FjallStore {
    database: Database,
    blocks: Keyspace,
    states: Keyspace,
    block_hashes_by_height: Keyspace,
    meta: Keyspace,
}

impl FjallStore {
    pub fn new(config: Arc<Config>) -> Result<Self> {
        let path = config
            .get_string("database-path")
            .unwrap_or_else(|_| DEFAULT_DATABASE_PATH.to_string());
        let clear = config.get_bool("clear-on-start").unwrap_or(DEFAULT_CLEAR_ON_START);
        let path = PathBuf::from(path);
        if clear && path.exists() {
            fs::remove_dir_all(&path)?;
        }
        let database = Database::builder(&path).open()?;
        let blocks = database.keyspace(BLOCKS_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let states = database.keyspace(STATES_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;
        let block_hashes_by_height = database.keyspace(
            BLOCK_HASHES_BY_HEIGHT_KEYSPACE,
            fjall::KeyspaceCreateOptions::default,
        )?;
        let meta = database.keyspace(META_KEYSPACE, fjall::KeyspaceCreateOptions::default)?;

        Ok(Self {
            database,
            blocks,
            states,
            block_hashes_by_height,
            meta,
        })
    }
}

impl ChainStore for FjallStore {
    fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>> {
        let Some(bytes) = self.blocks.get(hash.as_ref())? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn put_block(&self, block: &Block) -> Result<()> {
        let encoded = serde_json::to_vec(block)?;
        let mut batch = self.database.batch();
        batch.insert(&self.blocks, block.hash.as_ref(), encoded);
        batch.commit()?;
        Ok(())
    }

    fn get_consensus_state(&self, hash: &BlockHash) -> Result<Option<ConsensusState>> {
        let Some(bytes) = self.states.get(hash.as_ref())? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn put_consensus_state(&self, hash: &BlockHash, state: &ConsensusState) -> Result<()> {
        let encoded = serde_json::to_vec(state)?;
        let mut batch = self.database.batch();
        batch.insert(&self.states, hash.as_ref(), encoded);
        batch.commit()?;
        Ok(())
    }

    fn get_hash_by_height(&self, height: u64) -> Result<Option<BlockHash>> {
        let Some(bytes) = self.block_hashes_by_height.get(height.to_be_bytes())? else {
            return Ok(None);
        };
        Ok(Some(BlockHash::try_from(bytes.as_ref())?))
    }

    fn put_height_index(&self, height: u64, hash: &BlockHash) -> Result<()> {
        let mut batch = self.database.batch();
        batch.insert(&self.block_hashes_by_height, height.to_be_bytes(), hash.as_ref());
        batch.commit()?;
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Option<BlockHash>> {
        let Some(bytes) = self.meta.get(key.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(BlockHash::try_from(bytes.as_ref())?))
    }

    fn put_meta(&self, key: &str, hash: &BlockHash) -> Result<()> {
        let mut batch = self.database.batch();
        batch.insert(&self.meta, key.as_bytes(), hash.as_ref());
        batch.commit()?;
        Ok(())
    }
}
