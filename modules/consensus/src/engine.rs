//! The consensus engine: one struct tying the block forest to the
//! canonical chain, entered by both the network path and local
//! production through [`ConsensusEngine::push`].

use agora_common::messages::{BlockOrigin, SyncRequestMessage};
use agora_common::slots::SlotConfig;
use agora_common::{Block, BlockHash, ConsensusBlock};
use tracing::{debug, warn};

use crate::chain::{Blockchain, ChainEvent};
use crate::errors::ChainError;
use crate::forest::{BlockForest, DEFAULT_FOREST_CAPACITY};

/// Number of unsynced pooled ancestors above which per-block backfill is
/// abandoned in favour of a bulk sync
pub const SYNC_THRESHOLD: usize = 16;

/// Fork-resolution contract exposed to the scheduler and the network
/// dispatcher.
pub trait ForkConsensus {
    /// Structural verification of a block, with no chain context.
    fn verify_block(&self, block: &Block) -> Result<(), ChainError>;

    /// Switch to the best detached tail if one beats the current tail.
    fn deal_with_fork(&mut self) -> Result<(), ChainError>;

    /// Advance the last irreversible block.
    fn update_lib(&mut self) -> Result<(), ChainError>;
}

/// Forest plus chain, driven as one state machine.
pub struct ConsensusEngine {
    chain: Blockchain,
    forest: BlockForest,
    slot_config: SlotConfig,
    sync_threshold: usize,
}

impl ConsensusEngine {
    pub fn new(chain: Blockchain, slot_config: SlotConfig) -> Self {
        Self {
            chain,
            forest: BlockForest::new(DEFAULT_FOREST_CAPACITY),
            slot_config,
            sync_threshold: SYNC_THRESHOLD,
        }
    }

    pub fn chain(&self) -> &Blockchain {
        &self.chain
    }

    pub fn chain_mut(&mut self) -> &mut Blockchain {
        &mut self.chain
    }

    /// Drain observable events accumulated by the last operations.
    pub fn take_events(&mut self) -> Vec<ChainEvent> {
        self.chain.take_events()
    }

    /// Submit a block into the forest and, if it links to known history,
    /// through to the canonical chain and fork resolution.
    ///
    /// Returns the canonical tail hash after fork resolution. All
    /// verification and linking for this block and any pooled descendants
    /// completes before returning - no partial batch is visible to the
    /// chain.
    pub fn push(&mut self, origin: &BlockOrigin, block: Block) -> Result<BlockHash, ChainError> {
        let hash = block.hash;

        if self.forest.contains(&hash) || self.chain.contains(&hash)? {
            debug!("Found duplicated block {hash}");
            return Err(ChainError::DuplicatedBlock { hash });
        }

        block.verify_integrity()?;

        self.forest.insert(block)?;

        let (root_hash, unsynced) = self.forest.subtree_root(&hash);
        let parent_hash = match self.forest.get(&root_hash) {
            Some(node) => node.parent_hash,
            None => return Err(ChainError::MissingParentBlock { hash: root_hash }),
        };

        if root_hash != hash && *origin == BlockOrigin::Local {
            // A locally produced block must attach directly to known
            // history; floating ancestors mean the scheduler built on a
            // stale or unknown tail.
            return Err(ChainError::MissingParentBlock { hash: parent_hash });
        }

        let Some(parent) = self.chain.get_block(&parent_hash)? else {
            return self.request_parent(origin, parent_hash, unsynced);
        };

        let mut all = Vec::new();
        let mut tails = Vec::new();
        if let Err(e) = self.travel_and_link(&parent, root_hash, &mut all, &mut tails) {
            self.forest.remove(&root_hash);
            return Err(e);
        }

        if let Err(e) = self.chain.put_verified_new_blocks(&parent, &all, &tails) {
            self.forest.remove(&root_hash);
            return Err(e);
        }

        // The batch is owned by the canonical store now
        for block in &all {
            self.forest.remove(&block.hash());
        }

        self.deal_with_fork()?;
        Ok(self.chain.tail().hash())
    }

    /// The block's parent is known to neither the forest nor the chain.
    /// Local blocks fail hard; network blocks stay pooled while the
    /// missing history is requested.
    fn request_parent(
        &mut self,
        origin: &BlockOrigin,
        parent_hash: BlockHash,
        unsynced: usize,
    ) -> Result<BlockHash, ChainError> {
        let peer = match origin {
            BlockOrigin::Local => {
                return Err(ChainError::MissingParentBlock { hash: parent_hash });
            }
            BlockOrigin::Peer(peer) => peer.clone(),
        };

        if unsynced > self.sync_threshold {
            warn!("{unsynced} unsynced ancestors pooled, requesting bulk sync");
            self.chain.push_event(ChainEvent::SyncWanted(SyncRequestMessage::Bulk {
                from_height: self.chain.tail().height() + 1,
            }));
        } else {
            debug!("Requesting missing parent {parent_hash} from {peer}");
            self.chain.push_event(ChainEvent::SyncWanted(SyncRequestMessage::Parent {
                peer,
                hash: parent_hash,
            }));
        }

        Err(ChainError::SyncParent)
    }

    /// Top-down traversal from a canonical parent through the pooled
    /// subtree: verify each link, derive its consensus state, and collect
    /// all linked blocks plus the childless tails.
    ///
    /// A child subtree that fails verification is skipped (and left to
    /// eviction); it does not poison its siblings.
    fn travel_and_link(
        &mut self,
        parent: &ConsensusBlock,
        hash: BlockHash,
        all: &mut Vec<ConsensusBlock>,
        tails: &mut Vec<ConsensusBlock>,
    ) -> Result<(), ChainError> {
        let Some(node) = self.forest.get(&hash) else {
            return Ok(());
        };
        let block = node.block.clone();
        let children = node.children.clone();

        let linked = self.link_to_parent(parent, block)?;
        debug!(height = linked.height(), hash = %linked.hash(), "Block verified");

        all.push(linked.clone());
        if children.is_empty() {
            tails.push(linked.clone());
        }

        for child in children {
            if let Err(e) = self.travel_and_link(&linked, child, all, tails) {
                debug!("Dropping unlinkable subtree at {child}: {e}");
            }
        }

        Ok(())
    }

    /// Verify one parent/child link and derive the child's consensus
    /// state: heights must be consecutive, the elapsed time must land on
    /// a slot boundary, and the producer must lead that slot.
    fn link_to_parent(
        &self,
        parent: &ConsensusBlock,
        block: Block,
    ) -> Result<ConsensusBlock, ChainError> {
        if block.height() != parent.height() + 1 {
            return Err(ChainError::InvalidHeight {
                expected: parent.height() + 1,
                got: block.height(),
            });
        }

        let elapsed = block.timestamp() - parent.timestamp();
        if elapsed <= 0 {
            return Err(ChainError::Slot(agora_common::slots::SlotError::NotForgeTime));
        }

        let state = parent.state.next_consensus_state(elapsed, &self.slot_config)?;

        let producer = block.producer_id();
        if producer != state.leader {
            return Err(ChainError::WrongLeader {
                expected: state.leader,
                got: producer,
            });
        }

        Ok(ConsensusBlock::new(block, state))
    }
}

impl ForkConsensus for ConsensusEngine {
    fn verify_block(&self, block: &Block) -> Result<(), ChainError> {
        block.verify_integrity()?;
        Ok(())
    }

    fn deal_with_fork(&mut self) -> Result<(), ChainError> {
        self.chain.deal_with_fork()
    }

    fn update_lib(&mut self) -> Result<(), ChainError> {
        self.chain.update_lib()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::memory::MemoryStore;
    use agora_common::crypto::Keypair;
    use agora_common::Transaction;
    use std::sync::Arc;

    struct Harness {
        engine: ConsensusEngine,
        keypairs: Vec<Keypair>,
        config: SlotConfig,
    }

    impl Harness {
        /// Two-bookkeeper chain starting at genesis timestamp 0.
        fn new(lib_depth: u64) -> Self {
            let keypairs: Vec<Keypair> =
                (1..=2u8).map(|i| Keypair::from_seed(&[i; 32])).collect();
            let bookkeepers = keypairs.iter().map(|k| k.public().id()).collect();
            let config = SlotConfig::default();
            let chain = Blockchain::bootstrap(
                Arc::new(MemoryStore::new()),
                bookkeepers,
                0,
                &config,
                lib_depth,
            )
            .unwrap();
            Self {
                engine: ConsensusEngine::new(chain, config.clone()),
                keypairs,
                config,
            }
        }

        /// Build a valid next block on `parent`, signed by the slot leader.
        fn forge(&self, parent: &ConsensusBlock, txs: Vec<Transaction>) -> Block {
            let timestamp = parent.timestamp() + self.config.slot_secs;
            let state =
                parent.state.next_consensus_state(self.config.slot_secs, &self.config).unwrap();
            let keypair = self
                .keypairs
                .iter()
                .find(|k| k.public().id() == state.leader)
                .expect("leader keypair");
            Block::build(parent.height() + 1, parent.hash(), timestamp, txs, keypair)
        }

        fn genesis(&self) -> ConsensusBlock {
            self.engine.chain().genesis().clone()
        }

        fn tail_hash(&self) -> BlockHash {
            self.engine.chain().tail().hash()
        }

        fn push_peer(&mut self, block: Block) -> Result<BlockHash, ChainError> {
            self.engine.push(&BlockOrigin::Peer("peer-1".into()), block)
        }
    }

    fn tx(byte: u8) -> Transaction {
        Transaction::new(vec![byte])
    }

    #[test]
    fn extends_tail_with_valid_block() {
        let mut h = Harness::new(DEFAULT_LIB_DEPTH_FOR_TESTS);
        let genesis = h.genesis();
        let a = h.forge(&genesis, vec![tx(1)]);

        let tail = h.push_peer(a.clone()).unwrap();
        assert_eq!(tail, a.hash);
        assert_eq!(h.engine.chain().tail().height(), 1);
        assert!(h.engine.forest.is_empty());
    }

    #[test]
    fn push_is_idempotent() {
        let mut h = Harness::new(DEFAULT_LIB_DEPTH_FOR_TESTS);
        let genesis = h.genesis();
        let a = h.forge(&genesis, vec![tx(1)]);

        h.push_peer(a.clone()).unwrap();
        let tail_before = h.tail_hash();
        h.engine.take_events();

        let second = h.push_peer(a);
        assert!(matches!(second, Err(ChainError::DuplicatedBlock { .. })));
        assert_eq!(h.tail_hash(), tail_before);
        assert!(h.engine.take_events().is_empty());
    }

    #[test]
    fn rejects_block_with_wrong_producer() {
        let mut h = Harness::new(DEFAULT_LIB_DEPTH_FOR_TESTS);
        let genesis = h.genesis();

        // Correctly timed block, signed by the non-leader
        let state = genesis.state.next_consensus_state(15, &h.config).unwrap();
        let wrong = h
            .keypairs
            .iter()
            .find(|k| k.public().id() != state.leader)
            .unwrap();
        let block = Block::build(1, genesis.hash(), 15, vec![], wrong);

        let result = h.push_peer(block);
        assert!(matches!(result, Err(ChainError::WrongLeader { .. })));
        assert_eq!(h.engine.chain().tail().height(), 0);
    }

    #[test]
    fn network_block_with_unknown_parent_requests_sync() {
        let mut h = Harness::new(DEFAULT_LIB_DEPTH_FOR_TESTS);
        let genesis = h.genesis();
        let a = h.forge(&genesis, vec![tx(1)]);
        let b = h.forge(&link(&genesis, &a, &h.config), vec![tx(2)]);

        // b arrives first; its parent a is unknown everywhere
        let result = h.push_peer(b.clone());
        assert!(matches!(result, Err(ChainError::SyncParent)));

        let events = h.engine.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            ChainEvent::SyncWanted(SyncRequestMessage::Parent { hash, .. }) if *hash == a.hash
        )));
        // The floating block stays pooled for backfill
        assert!(h.engine.forest.contains(&b.hash));
    }

    #[test]
    fn local_block_with_unknown_parent_is_fatal() {
        let mut h = Harness::new(DEFAULT_LIB_DEPTH_FOR_TESTS);
        let genesis = h.genesis();
        let a = h.forge(&genesis, vec![tx(1)]);
        let b = h.forge(&link(&genesis, &a, &h.config), vec![tx(2)]);

        let result = h.engine.push(&BlockOrigin::Local, b);
        assert!(matches!(result, Err(ChainError::MissingParentBlock { .. })));
        assert!(h.engine.take_events().is_empty());
    }

    #[test]
    fn forest_links_reverse_arrival_closure() {
        let mut h = Harness::new(DEFAULT_LIB_DEPTH_FOR_TESTS);
        let genesis = h.genesis();
        let b1 = h.forge(&genesis, vec![tx(1)]);
        let cb1 = link(&genesis, &b1, &h.config);
        let b2 = h.forge(&cb1, vec![tx(2)]);
        let cb2 = link(&cb1, &b2, &h.config);
        let b3 = h.forge(&cb2, vec![tx(3)]);

        // Arrival order B3, B2, B1
        assert!(matches!(h.push_peer(b3.clone()), Err(ChainError::SyncParent)));
        assert!(matches!(h.push_peer(b2.clone()), Err(ChainError::SyncParent)));
        let tail = h.push_peer(b1.clone()).unwrap();

        // All three linked in one batch; the childless B3 is the new tail
        assert_eq!(tail, b3.hash);
        assert_eq!(h.engine.chain().tail().height(), 3);
        for hash in [b1.hash, b2.hash, b3.hash] {
            assert!(h.engine.chain.contains(&hash).unwrap());
        }
        assert!(h.engine.forest.is_empty());
    }

    #[test]
    fn fork_choice_is_a_total_order() {
        let mut h = Harness::new(DEFAULT_LIB_DEPTH_FOR_TESTS);
        let genesis = h.genesis();

        // Competing height-1 blocks from the same slot leader
        let a = h.forge(&genesis, vec![tx(1)]);
        let b = h.forge(&genesis, vec![tx(2)]);
        let winner = if a.hash > b.hash { a.hash } else { b.hash };

        h.push_peer(a.clone()).unwrap();
        h.push_peer(b.clone()).unwrap();
        assert_eq!(h.tail_hash(), winner);

        // Arrival order must not matter
        let mut h2 = Harness::new(DEFAULT_LIB_DEPTH_FOR_TESTS);
        h2.push_peer(b).unwrap();
        h2.push_peer(a).unwrap();
        assert_eq!(h2.tail_hash(), winner);
    }

    #[test]
    fn longer_fork_triggers_reorg_returning_txs() {
        let mut h = Harness::new(DEFAULT_LIB_DEPTH_FOR_TESTS);
        let genesis = h.genesis();

        let a = h.forge(&genesis, vec![tx(1)]);
        let b = h.forge(&genesis, vec![tx(2)]);
        h.push_peer(a.clone()).unwrap();
        h.push_peer(b.clone()).unwrap();

        let tail = h.tail_hash();
        let (winner, loser) = if tail == a.hash { (a, b) } else { (b, a) };
        assert_eq!(h.tail_hash(), winner.hash);
        h.engine.take_events();

        // Extend the losing branch to height 2 - it now beats the winner
        let loser_cb = link(&genesis, &loser, &h.config);
        let c = h.forge(&loser_cb, vec![tx(3)]);
        let new_tail = h.push_peer(c.clone()).unwrap();

        assert_eq!(new_tail, c.hash);
        assert_eq!(h.engine.chain().tail().height(), 2);

        // The reorg reverted the old winner and returned its transactions
        let events = h.engine.take_events();
        let reverted = events.iter().find_map(|e| match e {
            ChainEvent::BlocksReverted { blocks, txs } => Some((blocks.clone(), txs.clone())),
            _ => None,
        });
        let (blocks, txs) = reverted.expect("revert event");
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].hash, winner.hash);
        assert_eq!(txs, winner.txs);
    }

    #[test]
    fn never_reverts_past_lib() {
        // lib_depth 0: the tail itself becomes irreversible on update
        let mut h = Harness::new(0);
        let genesis = h.genesis();

        let x1 = h.forge(&genesis, vec![tx(1)]);
        h.push_peer(x1.clone()).unwrap();
        let cx1 = link(&genesis, &x1, &h.config);
        let x2 = h.forge(&cx1, vec![tx(2)]);
        h.push_peer(x2.clone()).unwrap();
        h.engine.update_lib().unwrap();
        assert_eq!(h.engine.chain().lib().hash(), x2.hash);

        // A longer competing branch cannot displace the irreversible tail
        let y1 = h.forge(&genesis, vec![tx(11)]);
        h.push_peer(y1.clone()).ok();
        let cy1 = link(&genesis, &y1, &h.config);
        let y2 = h.forge(&cy1, vec![tx(12)]);
        h.push_peer(y2.clone()).ok();
        let cy2 = link(&cy1, &y2, &h.config);
        let y3 = h.forge(&cy2, vec![tx(13)]);

        let result = h.push_peer(y3);
        assert!(matches!(result, Err(ChainError::CannotRevertLib)));
        assert_eq!(h.tail_hash(), x2.hash);
        assert_eq!(h.engine.chain().lib().hash(), x2.hash);
    }

    #[test]
    fn lib_advances_monotonically_with_depth() {
        let mut h = Harness::new(2);
        let genesis = h.genesis();

        let mut parent = genesis;
        let mut hashes = Vec::new();
        for i in 0..5u8 {
            let block = h.forge(&parent, vec![tx(i)]);
            h.push_peer(block.clone()).unwrap();
            parent = link(&parent, &block, &h.config);
            hashes.push(block.hash);
        }

        // Tail height 5, depth 2 - LIB lands at height 3
        h.engine.update_lib().unwrap();
        assert_eq!(h.engine.chain().lib().height(), 3);
        assert_eq!(h.engine.chain().lib().hash(), hashes[2]);

        // A second update with an unchanged tail is a no-op
        h.engine.take_events();
        h.engine.update_lib().unwrap();
        assert_eq!(h.engine.chain().lib().height(), 3);
        assert!(h.engine.take_events().is_empty());
    }

    #[test]
    fn end_to_end_fork_scenario() {
        let mut h = Harness::new(DEFAULT_LIB_DEPTH_FOR_TESTS);
        let genesis = h.genesis();

        // Push A (height 1): tail becomes A
        let a = h.forge(&genesis, vec![tx(1)]);
        assert_eq!(h.push_peer(a.clone()).unwrap(), a.hash);

        // Push competing B: the greater hash holds the tail
        let b = h.forge(&genesis, vec![tx(2)]);
        h.push_peer(b.clone()).unwrap();
        let expected = if a.hash > b.hash { a.hash } else { b.hash };
        assert_eq!(h.tail_hash(), expected);

        // Push C (height 2) on the branch that lost: height wins over hash
        let loser = if expected == a.hash { &b } else { &a };
        let loser_cb = link(&genesis, loser, &h.config);
        let c = h.forge(&loser_cb, vec![tx(3)]);
        assert_eq!(h.push_peer(c.clone()).unwrap(), c.hash);
        assert_eq!(h.engine.chain().tail().height(), 2);
    }

    #[test]
    fn deep_unsynced_chain_triggers_bulk_sync() {
        let mut h = Harness::new(DEFAULT_LIB_DEPTH_FOR_TESTS);
        let genesis = h.genesis();

        // Forge a straight chain b1..b19 but never deliver b1
        let mut parent = genesis;
        let mut blocks = Vec::new();
        for i in 0..19u8 {
            let block = h.forge(&parent, vec![tx(i)]);
            parent = link(&parent, &block, &h.config);
            blocks.push(block);
        }

        for block in blocks.iter().skip(1).take(17) {
            assert!(matches!(h.push_peer(block.clone()), Err(ChainError::SyncParent)));
        }
        h.engine.take_events();

        // The 18th floating block pools 17 unsynced ancestors - past the
        // per-block backfill threshold
        assert!(matches!(
            h.push_peer(blocks[18].clone()),
            Err(ChainError::SyncParent)
        ));
        let events = h.engine.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            ChainEvent::SyncWanted(SyncRequestMessage::Bulk { from_height: 1 })
        )));
    }

    const DEFAULT_LIB_DEPTH_FOR_TESTS: u64 = crate::chain::DEFAULT_LIB_DEPTH;

    /// Derive the consensus block for a forged child (test convenience).
    fn link(parent: &ConsensusBlock, block: &Block, config: &SlotConfig) -> ConsensusBlock {
        let elapsed = block.timestamp() - parent.timestamp();
        let state = parent.state.next_consensus_state(elapsed, config).unwrap();
        ConsensusBlock::new(block.clone(), state)
    }
}
