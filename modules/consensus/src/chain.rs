//! Canonical-chain maintenance: tail and LIB tracking, common-ancestor
//! search, revert/re-apply reorgs and fork choice.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use agora_common::messages::SyncRequestMessage;
use agora_common::slots::{ConsensusState, SlotConfig};
use agora_common::{
    Block, BlockHash, BlockInfo, BlockStatus, ConsensusBlock, Transaction, TxHash, ValidatorId,
};
use anyhow::{anyhow, Context, Result};
use tracing::{debug, info};

use crate::errors::ChainError;
use crate::stores::{ChainStore, GENESIS_KEY, LIB_KEY, TAIL_KEY};

/// Default number of confirmations behind the tail before a block becomes
/// irreversible
pub const DEFAULT_LIB_DEPTH: u64 = 8;

/// Bound on the recently-loaded block cache and the detached tail set
const CACHE_SIZE: usize = 128;

/// Observable outcomes of chain operations, drained by the owning module
/// and published to the bus after the chain lock is released.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// The canonical tail changed
    TailUpdated(BlockInfo),

    /// A reorg reverted blocks; their transactions go back to the pool
    BlocksReverted {
        blocks: Vec<BlockInfo>,
        txs: Vec<Transaction>,
    },

    /// A block became canonical, consuming its transactions
    TxsCommitted {
        block_hash: BlockHash,
        tx_hashes: Vec<TxHash>,
    },

    /// The last irreversible block advanced
    LibAdvanced(BlockInfo),

    /// Missing history should be requested from the network
    SyncWanted(SyncRequestMessage),
}

/// Insertion-order bounded map of consensus blocks keyed by hash.
struct BoundedCache {
    map: HashMap<BlockHash, ConsensusBlock>,
    order: VecDeque<BlockHash>,
    capacity: usize,
}

impl BoundedCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, block: ConsensusBlock) {
        let hash = block.hash();
        if self.map.insert(hash, block).is_none() {
            self.order.push_back(hash);
        }
        while self.map.len() > self.capacity {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.map.remove(&oldest);
        }
    }

    fn get(&self, hash: &BlockHash) -> Option<&ConsensusBlock> {
        self.map.get(hash)
    }

    fn remove(&mut self, hash: &BlockHash) {
        if self.map.remove(hash).is_some() {
            self.order.retain(|h| h != hash);
        }
    }

    fn contains(&self, hash: &BlockHash) -> bool {
        self.map.contains_key(hash)
    }

    fn values(&self) -> impl Iterator<Item = &ConsensusBlock> {
        self.map.values()
    }

    fn retain(&mut self, mut keep: impl FnMut(&ConsensusBlock) -> bool) {
        self.map.retain(|_, v| keep(v));
        let map = &self.map;
        self.order.retain(|h| map.contains_key(h));
    }
}

/// The canonical-chain maintainer.
///
/// Owns the genesis block, the current tail, the last irreversible block
/// and the detached fork-choice candidates. Invariants: `lib.height <=
/// tail.height`; the LIB never moves backwards and is never reverted;
/// the tail is always reachable from genesis through stored parent links.
pub struct Blockchain {
    store: Arc<dyn ChainStore>,
    genesis: ConsensusBlock,
    tail: ConsensusBlock,
    lib: ConsensusBlock,
    /// Recently loaded or stored blocks, to avoid storage round-trips on
    /// ancestor walks
    cached_blocks: BoundedCache,
    /// Blocks with no known children that are not (yet) canonical
    detached_tails: BoundedCache,
    lib_depth: u64,
    events: Vec<ChainEvent>,
}

impl Blockchain {
    /// Open the chain from storage, seeding genesis on first run.
    pub fn bootstrap(
        store: Arc<dyn ChainStore>,
        bookkeepers: Vec<ValidatorId>,
        genesis_timestamp: i64,
        slot_config: &SlotConfig,
        lib_depth: u64,
    ) -> Result<Self> {
        if genesis_timestamp % slot_config.slot_secs != 0 {
            return Err(anyhow!(
                "genesis timestamp {genesis_timestamp} is not slot-aligned"
            ));
        }

        let genesis = match store.get_meta(GENESIS_KEY)? {
            Some(hash) => store
                .get_consensus_block(&hash)?
                .context("genesis block missing from storage")?,
            None => {
                let block = Block::genesis(genesis_timestamp);
                let state = ConsensusState::at(genesis_timestamp, bookkeepers, slot_config)?;
                let genesis = ConsensusBlock::new(block, state);
                store.put_block(&genesis.block)?;
                store.put_consensus_state(&genesis.hash(), &genesis.state)?;
                store.put_height_index(0, &genesis.hash())?;
                store.put_meta(GENESIS_KEY, &genesis.hash())?;
                store.put_meta(TAIL_KEY, &genesis.hash())?;
                store.put_meta(LIB_KEY, &genesis.hash())?;
                info!("Seeded genesis block {}", genesis.hash());
                genesis
            }
        };

        let tail_hash = store.get_meta(TAIL_KEY)?.context("tail pointer missing")?;
        let tail =
            store.get_consensus_block(&tail_hash)?.context("tail block missing from storage")?;
        let lib_hash = store.get_meta(LIB_KEY)?.context("lib pointer missing")?;
        let lib =
            store.get_consensus_block(&lib_hash)?.context("lib block missing from storage")?;

        info!(
            tail = %tail.hash(),
            height = tail.height(),
            lib = lib.height(),
            "Opened chain"
        );

        Ok(Self {
            store,
            genesis,
            tail,
            lib,
            cached_blocks: BoundedCache::new(CACHE_SIZE),
            detached_tails: BoundedCache::new(CACHE_SIZE),
            lib_depth,
            events: Vec::new(),
        })
    }

    pub fn genesis(&self) -> &ConsensusBlock {
        &self.genesis
    }

    pub fn tail(&self) -> &ConsensusBlock {
        &self.tail
    }

    pub fn lib(&self) -> &ConsensusBlock {
        &self.lib
    }

    /// Drain the accumulated observable events.
    pub fn take_events(&mut self) -> Vec<ChainEvent> {
        std::mem::take(&mut self.events)
    }

    pub(crate) fn push_event(&mut self, event: ChainEvent) {
        self.events.push(event);
    }

    /// Whether the block is committed to the canonical store.
    pub fn contains(&self, hash: &BlockHash) -> Result<bool, ChainError> {
        if self.cached_blocks.contains(hash) {
            return Ok(true);
        }
        Ok(self.store.get_block(hash)?.is_some())
    }

    /// Load a stored block with its consensus state, through the cache.
    pub fn get_block(&mut self, hash: &BlockHash) -> Result<Option<ConsensusBlock>, ChainError> {
        if let Some(block) = self.cached_blocks.get(hash) {
            return Ok(Some(block.clone()));
        }
        let Some(block) = self.store.get_consensus_block(hash)? else {
            return Ok(None);
        };
        self.cached_blocks.insert(block.clone());
        Ok(Some(block))
    }

    /// Persist a freshly verified batch from the forest.
    ///
    /// All blocks are stored; the childless ones become detached tail
    /// candidates. The batch's attachment point stops being a candidate
    /// itself - it has a child now.
    pub fn put_verified_new_blocks(
        &mut self,
        parent: &ConsensusBlock,
        all: &[ConsensusBlock],
        tails: &[ConsensusBlock],
    ) -> Result<(), ChainError> {
        for block in all {
            self.store.put_block(&block.block)?;
            self.store.put_consensus_state(&block.hash(), &block.state)?;
            self.cached_blocks.insert(block.clone());
        }

        debug!("Accepted {} new block(s) on chain", all.len());

        for tail in tails {
            self.detached_tails.insert(tail.clone());
        }
        self.detached_tails.remove(&parent.hash());

        Ok(())
    }

    /// Currently detached fork-choice candidates.
    pub fn detached_tails(&self) -> Vec<ConsensusBlock> {
        self.detached_tails.values().cloned().collect()
    }

    /// Fork-choice entry point: make `new_tail` the canonical tail.
    ///
    /// Finds the lowest common ancestor with the current tail, reverts the
    /// old branch (refusing to cross the LIB), re-indexes the new branch,
    /// and persists the new tail pointer. On error nothing is changed.
    pub fn set_tail_block(&mut self, new_tail: &ConsensusBlock) -> Result<(), ChainError> {
        if new_tail.hash().is_zero() {
            return Err(ChainError::NilArgument);
        }

        let old_tail = self.tail.clone();
        let ancestor = self.find_lowest_common_ancestor_with_tail(new_tail)?;
        let reverted = self.collect_revert_chain(&ancestor, &old_tail)?;
        let applied = self.collect_chain(&ancestor, new_tail)?;

        for block in &applied {
            self.store.put_height_index(block.height(), &block.hash())?;
        }
        self.store.put_meta(TAIL_KEY, &new_tail.hash())?;
        self.tail = new_tail.clone();

        if !reverted.is_empty() {
            info!(
                "Reverted {} block(s) down to ancestor {}",
                reverted.len(),
                ancestor.height()
            );
            let blocks = reverted
                .iter()
                .map(|b| BlockInfo::of(&b.block, BlockStatus::Reverted))
                .collect();
            let txs = reverted.iter().flat_map(|b| b.block.txs.clone()).collect();
            self.events.push(ChainEvent::BlocksReverted { blocks, txs });
        }

        for block in &applied {
            self.events.push(ChainEvent::TxsCommitted {
                block_hash: block.hash(),
                tx_hashes: block.block.txs.iter().map(|tx| tx.hash).collect(),
            });
        }

        self.events.push(ChainEvent::TailUpdated(BlockInfo::of(
            &new_tail.block,
            BlockStatus::Canonical,
        )));

        info!(height = new_tail.height(), hash = %new_tail.hash(), "Updated tail");
        Ok(())
    }

    /// The lowest common ancestor of `block` and the current tail.
    ///
    /// Walks both chains backward by parent pointers, equalizing heights
    /// first, then stepping together until the hashes match. Running off
    /// stored history is a corruption signal, not a normal-path error.
    pub fn find_lowest_common_ancestor_with_tail(
        &mut self,
        block: &ConsensusBlock,
    ) -> Result<ConsensusBlock, ChainError> {
        let mut target = self
            .get_block(&block.hash())?
            .ok_or(ChainError::MissingParentBlock { hash: block.hash() })?;
        let mut tail = self.tail.clone();

        while target.height() > tail.height() {
            target = self.parent_of(&target)?;
        }
        while tail.height() > target.height() {
            tail = self.parent_of(&tail)?;
        }
        while tail.hash() != target.hash() {
            tail = self.parent_of(&tail)?;
            target = self.parent_of(&target)?;
        }

        Ok(target)
    }

    /// Compare the tail with every detached candidate and switch to a
    /// strictly better one: greater height wins; on equal height, the
    /// lexicographically greater hash wins.
    pub fn deal_with_fork(&mut self) -> Result<(), ChainError> {
        let mut best = self.tail.clone();
        for candidate in self.detached_tails.values() {
            if Self::better_tail(candidate, &best) {
                best = candidate.clone();
            }
        }

        if best.hash() == self.tail.hash() {
            debug!("Current tail is best, no need to change");
            return Ok(());
        }

        self.set_tail_block(&best)
    }

    /// Advance the LIB to `lib_depth` confirmations behind the tail.
    ///
    /// Monotonic: never moves backwards, whatever the configured depth.
    pub fn update_lib(&mut self) -> Result<(), ChainError> {
        let target_height = self.tail.height().saturating_sub(self.lib_depth);
        if target_height <= self.lib.height() {
            return Ok(());
        }

        let mut current = self.tail.clone();
        while current.height() > target_height {
            current = self.parent_of(&current)?;
        }

        self.store.put_meta(LIB_KEY, &current.hash())?;
        self.lib = current.clone();
        info!(height = current.height(), hash = %current.hash(), "LIB advanced");
        self.events.push(ChainEvent::LibAdvanced(BlockInfo::of(
            &current.block,
            BlockStatus::Canonical,
        )));

        // Candidates at or below the LIB can never win fork choice
        let lib_height = self.lib.height();
        self.detached_tails.retain(|b| b.height() > lib_height);

        Ok(())
    }

    fn better_tail(a: &ConsensusBlock, b: &ConsensusBlock) -> bool {
        (a.height(), a.hash()) > (b.height(), b.hash())
    }

    fn parent_of(&mut self, block: &ConsensusBlock) -> Result<ConsensusBlock, ChainError> {
        let parent_hash = block.parent_hash();
        self.get_block(&parent_hash)?.ok_or(ChainError::MissingParentBlock { hash: parent_hash })
    }

    /// Blocks that would be reverted walking `to` back down to `from`,
    /// tail first. Fails with [`ChainError::CannotRevertLib`] if the walk
    /// would revert the LIB itself; no state is touched either way.
    fn collect_revert_chain(
        &mut self,
        from: &ConsensusBlock,
        to: &ConsensusBlock,
    ) -> Result<Vec<ConsensusBlock>, ChainError> {
        let mut reverted = Vec::new();
        let mut current = to.clone();
        while current.hash() != from.hash() {
            if current.hash() == self.lib.hash() {
                return Err(ChainError::CannotRevertLib);
            }
            reverted.push(current.clone());
            current = self.parent_of(&current)?;
        }
        Ok(reverted)
    }

    /// Blocks from `ancestor` (exclusive) up to `tip` (inclusive), in
    /// ascending height order.
    fn collect_chain(
        &mut self,
        ancestor: &ConsensusBlock,
        tip: &ConsensusBlock,
    ) -> Result<Vec<ConsensusBlock>, ChainError> {
        let mut chain = Vec::new();
        let mut current = tip.clone();
        while current.hash() != ancestor.hash() {
            chain.push(current.clone());
            current = self.parent_of(&current)?;
        }
        chain.reverse();
        Ok(chain)
    }
}
