//! Definition of Agora messages

// We don't use these messages in the agora_common crate itself
#![allow(dead_code)]

use crate::slots::ConsensusState;
use crate::types::{Block, BlockInfo, Transaction};
use crate::{BlockHash, TxHash};

// Caryatid core messages
use caryatid_module_clock::messages::ClockTickMessage;

/// Where a submitted block came from
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BlockOrigin {
    /// Produced by this node's scheduler
    Local,

    /// Delivered by the network layer from the given peer
    Peer(String),
}

/// A block entering the forest, from the network or local production
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlockAnnounceMessage {
    /// Origin - determines missing-parent handling
    pub origin: BlockOrigin,

    /// The block itself
    pub block: Block,
}

/// Outcome of a local block submission
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum SubmitOutcome {
    /// Block accepted; the canonical tail after fork resolution
    Accepted { tail: BlockHash },

    /// Block refused with the chain error rendered as text
    Rejected { reason: String },
}

/// Response to a block submission request
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SubmitResultMessage {
    /// Hash of the submitted block
    pub block_hash: BlockHash,

    /// What happened to it
    pub outcome: SubmitOutcome,
}

/// The canonical tail changed
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct TailUpdatedMessage {
    /// New tail summary
    pub tail: BlockInfo,
}

/// Blocks reverted by a reorg; their transactions go back to the pool
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct BlocksRevertedMessage {
    /// Reverted block summaries, tail first
    pub blocks: Vec<BlockInfo>,

    /// Transactions returned to the pending pool
    pub txs: Vec<Transaction>,
}

/// The last irreversible block advanced
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct LibAdvancedMessage {
    /// New LIB summary
    pub lib: BlockInfo,
}

/// Transactions consumed by an accepted block
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct TxsCommittedMessage {
    /// The accepting block
    pub block_hash: BlockHash,

    /// Hashes of the consumed transactions
    pub tx_hashes: Vec<TxHash>,
}

/// Request to the network layer to backfill missing history
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum SyncRequestMessage {
    /// Ask one peer for a single missing parent block
    Parent { peer: String, hash: BlockHash },

    /// Too far behind - ask the network for bulk sync from a height
    Bulk { from_height: u64 },
}

/// New transactions for the pending pool
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct TxsMessage {
    /// The transactions
    pub txs: Vec<Transaction>,
}

/// Request for pending transactions (request/response)
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct TxQueryMessage {
    /// Maximum number of transactions wanted
    pub limit: usize,
}

/// Pending transactions response
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub struct TxQueryResponseMessage {
    /// The pending transactions, oldest first
    pub txs: Vec<Transaction>,
}

/// Chain state queries (request/response)
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ChainQueryMessage {
    /// Current canonical tail with its consensus state
    GetTail,

    /// Current last irreversible block
    GetLib,
}

/// Chain state query responses
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ChainQueryResponseMessage {
    /// Tail summary plus the consensus state at the tail
    Tail {
        tail: BlockInfo,
        state: ConsensusState,
    },

    /// LIB summary
    Lib { lib: BlockInfo },

    /// Query failed
    Error(String),
}

/// External control of the block production loop
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProducerControlMessage {
    /// Allow production
    Enable,

    /// Stop production entirely
    Disable,

    /// Suspend/resume production without disabling
    SetPending(bool),
}

// === Global message enum ===
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Message {
    None(()),                                   // Just so we have a simple default

    // Generic messages, get of jail free cards
    String(String),                             // Simple string
    JSON(serde_json::Value),                    // JSON object

    // Caryatid standard messages
    Clock(ClockTickMessage),                    // Clock tick

    // Block flow
    BlockAnnounce(BlockAnnounceMessage),        // Block received or produced
    SubmitResult(SubmitResultMessage),          // Local submission outcome

    // Chain events
    TailUpdated(TailUpdatedMessage),            // Canonical tail changed
    BlocksReverted(BlocksRevertedMessage),      // Reorg reverted blocks
    LibAdvanced(LibAdvancedMessage),            // LIB moved forward
    TxsCommitted(TxsCommittedMessage),          // Txs consumed by a block
    SyncRequest(SyncRequestMessage),            // Backfill wanted

    // Transaction pool
    Txs(TxsMessage),                            // New transactions
    TxQuery(TxQueryMessage),                    // Pending tx request
    TxQueryResponse(TxQueryResponseMessage),    // Pending tx response

    // Chain queries
    ChainQuery(ChainQueryMessage),              // Chain state request
    ChainQueryResponse(ChainQueryResponseMessage), // Chain state response

    // Producer control
    ProducerControl(ProducerControlMessage),    // Enable/disable/pending
}

impl Default for Message {
    fn default() -> Self {
        Self::None(())
    }
}

// Casts from specific messages
impl From<ClockTickMessage> for Message {
    fn from(msg: ClockTickMessage) -> Self {
        Message::Clock(msg)
    }
}

impl From<BlockAnnounceMessage> for Message {
    fn from(msg: BlockAnnounceMessage) -> Self {
        Message::BlockAnnounce(msg)
    }
}

impl From<SubmitResultMessage> for Message {
    fn from(msg: SubmitResultMessage) -> Self {
        Message::SubmitResult(msg)
    }
}

impl From<TailUpdatedMessage> for Message {
    fn from(msg: TailUpdatedMessage) -> Self {
        Message::TailUpdated(msg)
    }
}

impl From<BlocksRevertedMessage> for Message {
    fn from(msg: BlocksRevertedMessage) -> Self {
        Message::BlocksReverted(msg)
    }
}

impl From<LibAdvancedMessage> for Message {
    fn from(msg: LibAdvancedMessage) -> Self {
        Message::LibAdvanced(msg)
    }
}

impl From<TxsCommittedMessage> for Message {
    fn from(msg: TxsCommittedMessage) -> Self {
        Message::TxsCommitted(msg)
    }
}

impl From<SyncRequestMessage> for Message {
    fn from(msg: SyncRequestMessage) -> Self {
        Message::SyncRequest(msg)
    }
}

impl From<TxsMessage> for Message {
    fn from(msg: TxsMessage) -> Self {
        Message::Txs(msg)
    }
}

impl From<TxQueryMessage> for Message {
    fn from(msg: TxQueryMessage) -> Self {
        Message::TxQuery(msg)
    }
}

impl From<TxQueryResponseMessage> for Message {
    fn from(msg: TxQueryResponseMessage) -> Self {
        Message::TxQueryResponse(msg)
    }
}

impl From<ProducerControlMessage> for Message {
    fn from(msg: ProducerControlMessage) -> Self {
        Message::ProducerControl(msg)
    }
}
