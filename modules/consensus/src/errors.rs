//! Error types for forest and chain operations.

use agora_common::slots::SlotError;
use agora_common::{BlockHash, IntegrityError, ValidatorId};

/// Errors returned by [`BlockForest`](crate::forest::BlockForest) and
/// [`Blockchain`](crate::chain::Blockchain) operations.
#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    /// The block is already in the forest or on the canonical chain.
    /// Rejection - no state change, the caller must not retry.
    #[error("duplicated block {hash}")]
    DuplicatedBlock { hash: BlockHash },

    /// The block failed structural verification.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// A parent walk hit a hole in storage. Fatal for locally produced
    /// blocks; for canonical-chain walks it signals corruption.
    #[error("cannot find the block's parent block in storage: {hash}")]
    MissingParentBlock { hash: BlockHash },

    /// Floating block received from the network; its parent is being
    /// requested from peers. Transient - the block is held for backfill.
    #[error("floating block received, syncing its parent from peers")]
    SyncParent,

    /// A linked block's height does not follow its parent's.
    #[error("invalid block height: expected {expected}, got {got}")]
    InvalidHeight { expected: u64, got: u64 },

    /// A linked block was produced by a bookkeeper that does not lead the
    /// block's slot.
    #[error("block producer {got} is not the slot leader {expected}")]
    WrongLeader {
        expected: ValidatorId,
        got: ValidatorId,
    },

    /// Slot schedule computation failed while linking.
    #[error(transparent)]
    Slot(#[from] SlotError),

    /// An argument carried a sentinel (all-zero) hash where a real block
    /// was required. Misuse - must never occur on a correct node.
    #[error("argument is nil")]
    NilArgument,

    /// A fork choice tried to revert at or past the last irreversible
    /// block. Must never occur on a correct node.
    #[error("cannot revert last irreversible block")]
    CannotRevertLib,

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl ChainError {
    /// True for expected, frequent outcomes the caller should log quietly
    /// and drop; false for errors worth surfacing loudly.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ChainError::DuplicatedBlock { .. }
                | ChainError::Integrity(_)
                | ChainError::InvalidHeight { .. }
                | ChainError::WrongLeader { .. }
                | ChainError::Slot(_)
        )
    }

    /// True when the error means "sync missing history", not "bad block".
    pub fn is_sync_needed(&self) -> bool {
        matches!(self, ChainError::SyncParent)
    }
}
