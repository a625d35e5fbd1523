//! Core type definitions for Agora

use crate::crypto::{self, content_hash, Keypair, PublicKey, Signature};
use crate::hash::{BlockHash, Hash, TxHash, ValidatorId};
use crate::slots::ConsensusState;

/// Errors found when checking a block's internal consistency
#[derive(Debug, thiserror::Error)]
pub enum IntegrityError {
    /// A transaction's recorded hash does not match its payload
    #[error("transaction hash mismatch at index {index}")]
    TxHashMismatch { index: usize },

    /// The header's tx root does not cover the carried transactions
    #[error("tx root mismatch")]
    TxRootMismatch,

    /// The block hash is not the hash of the header contents
    #[error("block hash mismatch: recorded {recorded}, computed {computed}")]
    HashMismatch {
        recorded: BlockHash,
        computed: BlockHash,
    },

    /// The producer signature does not verify against the block hash
    #[error("invalid producer signature")]
    BadSignature,
}

/// An opaque transaction - the consensus core never inspects payloads
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Transaction {
    /// Raw payload bytes
    pub payload: Vec<u8>,

    /// Content hash of the payload
    pub hash: TxHash,
}

impl Transaction {
    /// Create a transaction, deriving its hash from the payload.
    pub fn new(payload: Vec<u8>) -> Self {
        let hash = content_hash(&payload);
        Self { payload, hash }
    }
}

/// Block header - the hashed portion of a block
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BlockHeader {
    /// Height on the chain (genesis is 0)
    pub height: u64,

    /// Hash of the parent block
    pub parent_hash: BlockHash,

    /// Production time, unix seconds
    pub timestamp: i64,

    /// Public key of the producing bookkeeper
    pub producer: PublicKey,

    /// Root hash over the transaction hashes, in order
    pub tx_root: Hash<32>,
}

impl BlockHeader {
    /// Canonical byte encoding used for hashing and signing.
    ///
    /// Field order is fixed; all integers big-endian. Changing this breaks
    /// every stored block hash.
    pub fn hashing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + 32 + 8 + 32 + 32);
        bytes.extend_from_slice(&self.height.to_be_bytes());
        bytes.extend_from_slice(self.parent_hash.as_ref());
        bytes.extend_from_slice(&self.timestamp.to_be_bytes());
        bytes.extend_from_slice(self.producer.as_ref());
        bytes.extend_from_slice(self.tx_root.as_ref());
        bytes
    }

    /// The content-derived identity of a block with this header.
    pub fn compute_hash(&self) -> BlockHash {
        content_hash(&self.hashing_bytes())
    }
}

/// Root hash over an ordered list of transaction hashes
pub fn tx_root(txs: &[Transaction]) -> Hash<32> {
    let mut bytes = Vec::with_capacity(txs.len() * 32);
    for tx in txs {
        bytes.extend_from_slice(tx.hash.as_ref());
    }
    content_hash(&bytes)
}

/// A complete block - immutable once constructed
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Block {
    /// Header fields
    pub header: BlockHeader,

    /// Transactions carried by this block
    pub txs: Vec<Transaction>,

    /// Hash of the header contents
    pub hash: BlockHash,

    /// Producer's signature over the block hash
    pub signature: Signature,
}

impl Block {
    /// Assemble and sign a new block on top of a parent.
    pub fn build(
        height: u64,
        parent_hash: BlockHash,
        timestamp: i64,
        txs: Vec<Transaction>,
        keypair: &Keypair,
    ) -> Self {
        let header = BlockHeader {
            height,
            parent_hash,
            timestamp,
            producer: keypair.public(),
            tx_root: tx_root(&txs),
        };
        let hash = header.compute_hash();
        let signature = keypair.sign(hash);
        Self {
            header,
            txs,
            hash,
            signature,
        }
    }

    /// The genesis block: height 0, no parent, no transactions.
    ///
    /// Genesis is established by configuration, not production, so it
    /// carries a zero producer key and signature and is exempt from
    /// signature verification.
    pub fn genesis(timestamp: i64) -> Self {
        let header = BlockHeader {
            height: 0,
            parent_hash: BlockHash::default(),
            timestamp,
            producer: PublicKey::from([0u8; 32]),
            tx_root: tx_root(&[]),
        };
        let hash = header.compute_hash();
        Self {
            header,
            txs: Vec::new(),
            hash,
            signature: Signature::default(),
        }
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    pub fn parent_hash(&self) -> BlockHash {
        self.header.parent_hash
    }

    pub fn timestamp(&self) -> i64 {
        self.header.timestamp
    }

    /// The producing bookkeeper's identity (hash of its public key).
    pub fn producer_id(&self) -> ValidatorId {
        self.header.producer.id()
    }

    /// Structural verification: recorded hashes match content and the
    /// producer signature verifies. Genesis blocks skip the signature.
    pub fn verify_integrity(&self) -> Result<(), IntegrityError> {
        for (index, tx) in self.txs.iter().enumerate() {
            if tx.hash != crypto::content_hash(&tx.payload) {
                return Err(IntegrityError::TxHashMismatch { index });
            }
        }

        if self.header.tx_root != tx_root(&self.txs) {
            return Err(IntegrityError::TxRootMismatch);
        }

        let computed = self.header.compute_hash();
        if self.hash != computed {
            return Err(IntegrityError::HashMismatch {
                recorded: self.hash,
                computed,
            });
        }

        if self.header.height > 0 && !self.header.producer.verify(self.hash, &self.signature) {
            return Err(IntegrityError::BadSignature);
        }

        Ok(())
    }
}

/// A block paired with the consensus state snapshot at that block
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ConsensusBlock {
    /// The block itself
    pub block: Block,

    /// Consensus state as of this block
    pub state: ConsensusState,
}

impl ConsensusBlock {
    pub fn new(block: Block, state: ConsensusState) -> Self {
        Self { block, state }
    }

    pub fn height(&self) -> u64 {
        self.block.height()
    }

    pub fn hash(&self) -> BlockHash {
        self.block.hash
    }

    pub fn parent_hash(&self) -> BlockHash {
        self.block.parent_hash()
    }

    pub fn timestamp(&self) -> i64 {
        self.block.timestamp()
    }
}

/// Block status, as seen by observers
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum BlockStatus {
    /// On the canonical chain
    Canonical,

    /// Known but not (yet) canonical - a fork-choice candidate
    Detached,

    /// Reverted from the canonical chain by a reorg
    Reverted,
}

impl Default for BlockStatus {
    fn default() -> Self {
        Self::Canonical
    }
}

/// Block summary, shared across multiple messages
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockInfo {
    /// Block status
    pub status: BlockStatus,

    /// Block height
    pub height: u64,

    /// Block hash
    pub hash: BlockHash,

    /// Production time, unix seconds
    pub timestamp: i64,
}

impl BlockInfo {
    /// Summarise a block with the given status.
    pub fn of(block: &Block, status: BlockStatus) -> Self {
        Self {
            status,
            height: block.height(),
            hash: block.hash,
            timestamp: block.timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> Keypair {
        Keypair::from_seed(&[42u8; 32])
    }

    #[test]
    fn built_block_passes_integrity() {
        let txs = vec![Transaction::new(vec![1, 2, 3]), Transaction::new(vec![4])];
        let block = Block::build(1, BlockHash::new([9u8; 32]), 15, txs, &keypair());
        assert!(block.verify_integrity().is_ok());
        assert_eq!(block.height(), 1);
    }

    #[test]
    fn hash_is_pure_function_of_header() {
        let block = Block::build(3, BlockHash::new([1u8; 32]), 45, vec![], &keypair());
        assert_eq!(block.hash, block.header.compute_hash());
    }

    #[test]
    fn tampered_payload_fails_integrity() {
        let mut block = Block::build(
            1,
            BlockHash::default(),
            15,
            vec![Transaction::new(vec![1])],
            &keypair(),
        );
        block.txs[0].payload = vec![2];
        assert!(matches!(
            block.verify_integrity(),
            Err(IntegrityError::TxHashMismatch { index: 0 })
        ));
    }

    #[test]
    fn tampered_header_fails_integrity() {
        let mut block = Block::build(1, BlockHash::default(), 15, vec![], &keypair());
        block.header.height = 2;
        assert!(matches!(
            block.verify_integrity(),
            Err(IntegrityError::HashMismatch { .. })
        ));
    }

    #[test]
    fn foreign_signature_fails_integrity() {
        let mut block = Block::build(1, BlockHash::default(), 15, vec![], &keypair());
        let other = Keypair::from_seed(&[43u8; 32]);
        block.signature = other.sign(block.hash);
        assert!(matches!(
            block.verify_integrity(),
            Err(IntegrityError::BadSignature)
        ));
    }

    #[test]
    fn genesis_passes_without_signature() {
        let genesis = Block::genesis(0);
        assert_eq!(genesis.height(), 0);
        assert!(genesis.parent_hash().is_zero());
        assert!(genesis.verify_integrity().is_ok());
    }
}
