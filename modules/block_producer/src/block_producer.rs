//! Agora block producer module for Caryatid
//! Runs the per-slot production state machine: on each clock tick, decide
//! whether this node leads the slot, collect pending transactions, build
//! and sign a block, and submit it for fork resolution.

use agora_common::crypto::Keypair;
use agora_common::messages::{
    BlockAnnounceMessage, BlockOrigin, ChainQueryMessage, ChainQueryResponseMessage, Message,
    ProducerControlMessage, SubmitOutcome, TxQueryMessage, TxsMessage,
};
use agora_common::slots::{ConsensusState, SlotConfig, SlotError};
use agora_common::{Block, BlockInfo, Transaction, ValidatorId};
use anyhow::{anyhow, Result};
use caryatid_sdk::{module, Context, Module};
use chrono::Utc;
use config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const DEFAULT_CLOCK_TOPIC: &str = "clock.tick";
const DEFAULT_SUBMIT_TOPIC: &str = "agora.block.submit";
const DEFAULT_TX_QUERY_TOPIC: &str = "agora.query.txpool";
const DEFAULT_CHAIN_QUERY_TOPIC: &str = "agora.query.chain";
const DEFAULT_CONTROL_TOPIC: &str = "agora.producer.control";
const DEFAULT_TAIL_TOPIC: &str = "agora.chain.tail";
const DEFAULT_PUBLISH_TXS_TOPIC: &str = "agora.tx.received";
const DEFAULT_TX_LIMIT: usize = 2000;
const DEFAULT_TX_TIMEOUT_MS: u64 = 500;
const DEFAULT_SUBMIT_TIMEOUT_MS: u64 = 5000;

/// Per-slot refusals and failures of the production loop.
///
/// The refusal variants are expected, frequent control flow - every
/// non-leader node sees `InvalidLeader` on every slot it doesn't lead -
/// and are logged quietly.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    #[error("cannot forge block now, waiting for enable")]
    CannotForgeWhenDisable,

    #[error("cannot forge block now, waiting for pending to be cancelled")]
    CannotForgeWhenPending,

    #[error("canonical tail not known yet")]
    TailUnknown,

    #[error("a block was already forged in the current slot")]
    BlockForgedInNextTimePoint,

    #[error("cannot forge block now, waiting for the last slot's block")]
    WaitingBlockInLastTimePoint,

    #[error("not the leader for this slot")]
    InvalidLeader,

    #[error("failed to generate next consensus state: {0}")]
    GenerateNextConsensusState(#[from] SlotError),

    #[error("timed out collecting pending transactions")]
    CollectTimeout,

    #[error("wrong message type in collaborator response")]
    TypeWrong,

    #[error("timed out submitting block")]
    SubmitTimeout,

    #[error("failed to append new block to the chain")]
    AppendNewBlockFailed,

    #[error("block submission rejected: {0}")]
    SubmitRejected(String),
}

impl ForgeError {
    /// Expected scheduling refusals - cheap, frequent, logged at debug.
    fn is_refusal(&self) -> bool {
        matches!(
            self,
            ForgeError::CannotForgeWhenDisable
                | ForgeError::CannotForgeWhenPending
                | ForgeError::BlockForgedInNextTimePoint
                | ForgeError::WaitingBlockInLastTimePoint
                | ForgeError::InvalidLeader
        )
    }
}

/// Compute the production deadline for this tick, or refuse the slot.
///
/// Refuses with [`ForgeError::BlockForgedInNextTimePoint`] if the tail was
/// already forged in the upcoming slot, and with
/// [`ForgeError::WaitingBlockInLastTimePoint`] when it is too early to
/// start building (the previous slot's block may still arrive).
fn calculate_deadline(
    config: &SlotConfig,
    tail_timestamp: i64,
    now_ms: i64,
) -> Result<i64, ForgeError> {
    let last_point = config.last_chance(now_ms);
    let next_point = config.next_chance(now_ms);
    let tail_ms = tail_timestamp * 1000;

    if tail_ms >= next_point {
        return Err(ForgeError::BlockForgedInNextTimePoint);
    }
    if tail_ms == last_point {
        return Ok(config.produce_deadline(now_ms));
    }
    if next_point - now_ms <= config.min_produce_ms {
        return Ok(config.produce_deadline(now_ms));
    }
    Err(ForgeError::WaitingBlockInLastTimePoint)
}

/// Cached view of the canonical tail, refreshed through chain queries.
struct TailView {
    info: BlockInfo,
    state: ConsensusState,
}

/// Mutable state of the production loop. Owned by the run task; control
/// messages and tail updates arrive through the same select loop.
struct ProducerState {
    enable: bool,
    pending: bool,
    tail: Option<TailView>,
}

/// Resolved topic set used by the forge pipeline.
struct Topics {
    submit: String,
    tx_query: String,
    chain_query: String,
    publish_txs: String,
}

/// Block producer module
#[module(
    message_type(Message),
    name = "block-producer",
    description = "Slot-scheduled block production"
)]
pub struct BlockProducer;

impl BlockProducer {
    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let clock_topic =
            config.get_string("clock-topic").unwrap_or(DEFAULT_CLOCK_TOPIC.to_string());
        let control_topic =
            config.get_string("control-topic").unwrap_or(DEFAULT_CONTROL_TOPIC.to_string());
        let tail_topic =
            config.get_string("tail-topic").unwrap_or(DEFAULT_TAIL_TOPIC.to_string());

        let topics = Topics {
            submit: config.get_string("submit-topic").unwrap_or(DEFAULT_SUBMIT_TOPIC.to_string()),
            tx_query: config
                .get_string("tx-query-topic")
                .unwrap_or(DEFAULT_TX_QUERY_TOPIC.to_string()),
            chain_query: config
                .get_string("chain-query-topic")
                .unwrap_or(DEFAULT_CHAIN_QUERY_TOPIC.to_string()),
            publish_txs: config
                .get_string("publish-txs-topic")
                .unwrap_or(DEFAULT_PUBLISH_TXS_TOPIC.to_string()),
        };

        let tx_limit = config.get_int("tx-limit").unwrap_or(DEFAULT_TX_LIMIT as i64) as usize;
        let tx_timeout =
            Duration::from_millis(config.get_int("tx-timeout-ms").unwrap_or(DEFAULT_TX_TIMEOUT_MS as i64) as u64);
        let submit_timeout = Duration::from_millis(
            config.get_int("submit-timeout-ms").unwrap_or(DEFAULT_SUBMIT_TIMEOUT_MS as i64) as u64,
        );

        let slot_config = read_slot_config(&config);

        let seed = read_key_seed(&config)?;
        let keypair = Keypair::from_seed(&seed);
        let bookkeeper: ValidatorId = keypair.public().id();
        info!("Producing as bookkeeper {bookkeeper}");

        let mut state = ProducerState {
            enable: config.get_bool("enable").unwrap_or(true),
            pending: false,
            tail: None,
        };

        let mut clock_subscription = context.subscribe(&clock_topic).await?;
        let mut control_subscription = context.subscribe(&control_topic).await?;
        let mut tail_subscription = context.subscribe(&tail_topic).await?;

        context.clone().run(async move {
            loop {
                tokio::select! {
                    result = clock_subscription.read() => {
                        let Ok((_, message)) = result else {
                            info!("Clock subscription closed, stopping production");
                            return;
                        };
                        let Message::Clock(_tick) = message.as_ref() else {
                            continue;
                        };

                        let now_ms = Utc::now().timestamp_millis();
                        match forge(
                            &context,
                            &topics,
                            &slot_config,
                            &keypair,
                            &bookkeeper,
                            &mut state,
                            now_ms,
                            tx_limit,
                            tx_timeout,
                            submit_timeout,
                        )
                        .await
                        {
                            Ok(hash) => info!("Forged and appended block {hash}"),
                            Err(e) if e.is_refusal() => debug!("Not forging: {e}"),
                            Err(e) => warn!("Forging failed: {e}"),
                        }
                    }

                    result = control_subscription.read() => {
                        let Ok((_, message)) = result else {
                            return;
                        };
                        if let Message::ProducerControl(control) = message.as_ref() {
                            info!("Producer control: {control:?}");
                            match control {
                                ProducerControlMessage::Enable => state.enable = true,
                                ProducerControlMessage::Disable => state.enable = false,
                                ProducerControlMessage::SetPending(pending) => {
                                    state.pending = *pending;
                                }
                            }
                        }
                    }

                    result = tail_subscription.read() => {
                        let Ok((_, message)) = result else {
                            return;
                        };
                        if let Message::TailUpdated(_) = message.as_ref() {
                            // Stale view - re-query before the next slot
                            state.tail = None;
                        }
                    }
                }
            }
        });

        Ok(())
    }
}

/// One slot tick of the production state machine.
#[allow(clippy::too_many_arguments)]
async fn forge(
    context: &Arc<Context<Message>>,
    topics: &Topics,
    slot_config: &SlotConfig,
    keypair: &Keypair,
    bookkeeper: &ValidatorId,
    state: &mut ProducerState,
    now_ms: i64,
    tx_limit: usize,
    tx_timeout: Duration,
    submit_timeout: Duration,
) -> Result<agora_common::BlockHash, ForgeError> {
    if !state.enable {
        return Err(ForgeError::CannotForgeWhenDisable);
    }
    if state.pending {
        return Err(ForgeError::CannotForgeWhenPending);
    }

    if state.tail.is_none() {
        state.tail = query_tail(context, &topics.chain_query, tx_timeout).await;
    }
    let tail = state.tail.as_ref().ok_or(ForgeError::TailUnknown)?;

    let deadline_ms = calculate_deadline(slot_config, tail.info.timestamp, now_ms)?;

    // Leadership check for the upcoming slot
    let next_point_ms = slot_config.next_chance(now_ms);
    let elapsed_secs = next_point_ms / 1000 - tail.info.timestamp;
    let next_state = tail.state.next_consensus_state(elapsed_secs, slot_config)?;
    if next_state.leader != *bookkeeper {
        return Err(ForgeError::InvalidLeader);
    }

    info!("My turn to forge block, {bookkeeper}");

    // Collection may not outlive the production deadline
    let budget = Duration::from_millis((deadline_ms - now_ms).max(0) as u64);
    let txs = collect_txs(context, &topics.tx_query, tx_limit, tx_timeout.min(budget)).await?;
    debug!("Packing {} transaction(s)", txs.len());

    let block = Block::build(
        tail.info.height + 1,
        tail.info.hash,
        next_state.timestamp,
        txs,
        keypair,
    );
    let block_hash = block.hash;

    match submit_block(context, &topics.submit, block.clone(), submit_timeout).await {
        Ok(tail_hash) if tail_hash == block_hash => {
            // Our block is the canonical tail - its state is already known
            state.tail = Some(TailView {
                info: BlockInfo::of(&block, agora_common::BlockStatus::Canonical),
                state: next_state,
            });
            Ok(block_hash)
        }
        Ok(_) => {
            return_txs(context, &topics.publish_txs, block.txs).await;
            Err(ForgeError::AppendNewBlockFailed)
        }
        Err(e) => {
            return_txs(context, &topics.publish_txs, block.txs).await;
            Err(e)
        }
    }
}

/// Fetch the canonical tail and its consensus state from the chain.
async fn query_tail(
    context: &Arc<Context<Message>>,
    chain_query_topic: &str,
    wait: Duration,
) -> Option<TailView> {
    let request = Arc::new(Message::ChainQuery(ChainQueryMessage::GetTail));
    let response = timeout(wait, context.message_bus.request(chain_query_topic, request))
        .await
        .ok()?
        .ok()?;
    match response.as_ref() {
        Message::ChainQueryResponse(ChainQueryResponseMessage::Tail { tail, state }) => {
            Some(TailView {
                info: tail.clone(),
                state: state.clone(),
            })
        }
        _ => None,
    }
}

/// Synchronously collect pending transactions, bounded by `wait` so a slow
/// pool never stalls slot detection.
async fn collect_txs(
    context: &Arc<Context<Message>>,
    tx_query_topic: &str,
    limit: usize,
    wait: Duration,
) -> Result<Vec<Transaction>, ForgeError> {
    let request = Arc::new(Message::TxQuery(TxQueryMessage { limit }));
    let response = timeout(wait, context.message_bus.request(tx_query_topic, request))
        .await
        .map_err(|_| ForgeError::CollectTimeout)?
        .map_err(|_| ForgeError::CollectTimeout)?;
    match response.as_ref() {
        Message::TxQueryResponse(txs) => Ok(txs.txs.clone()),
        _ => Err(ForgeError::TypeWrong),
    }
}

/// Submit the signed block for fork resolution and return the resulting
/// canonical tail hash.
async fn submit_block(
    context: &Arc<Context<Message>>,
    submit_topic: &str,
    block: Block,
    wait: Duration,
) -> Result<agora_common::BlockHash, ForgeError> {
    let request = Arc::new(Message::BlockAnnounce(BlockAnnounceMessage {
        origin: BlockOrigin::Local,
        block,
    }));
    let response = timeout(wait, context.message_bus.request(submit_topic, request))
        .await
        .map_err(|_| ForgeError::SubmitTimeout)?
        .map_err(|_| ForgeError::SubmitTimeout)?;
    match response.as_ref() {
        Message::SubmitResult(result) => match &result.outcome {
            SubmitOutcome::Accepted { tail } => Ok(*tail),
            SubmitOutcome::Rejected { reason } => Err(ForgeError::SubmitRejected(reason.clone())),
        },
        _ => Err(ForgeError::TypeWrong),
    }
}

/// Return collected transactions to the pool rather than losing them.
async fn return_txs(context: &Arc<Context<Message>>, txs_topic: &str, txs: Vec<Transaction>) {
    if txs.is_empty() {
        return;
    }
    warn!("Returning {} transaction(s) to the pool", txs.len());
    let message = Arc::new(Message::Txs(TxsMessage { txs }));
    context
        .message_bus
        .publish(txs_topic, message)
        .await
        .unwrap_or_else(|e| warn!("Failed to return transactions: {e}"));
}

/// Slot schedule parameters, defaulted to the network standard.
fn read_slot_config(config: &Config) -> SlotConfig {
    let defaults = SlotConfig::default();
    SlotConfig {
        slot_secs: config.get_int("slot-secs").unwrap_or(defaults.slot_secs),
        generation_size: config
            .get_int("generation-size")
            .map(|v| v as u64)
            .unwrap_or(defaults.generation_size),
        generation_stride: config
            .get_int("generation-stride")
            .map(|v| v as u64)
            .unwrap_or(defaults.generation_stride),
        min_produce_ms: config.get_int("min-produce-ms").unwrap_or(defaults.min_produce_ms),
        max_produce_ms: config.get_int("max-produce-ms").unwrap_or(defaults.max_produce_ms),
    }
}

/// The producer's signing seed (32 bytes, hex).
fn read_key_seed(config: &Config) -> Result<[u8; 32]> {
    let hex_seed =
        config.get_string("key-seed").map_err(|_| anyhow!("No key-seed configured"))?;
    let bytes = hex::decode(&hex_seed)?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("key-seed must be exactly 32 bytes of hex"))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Default schedule: 15s slots. The tick cadence is 1s, so "now" falls
    // just after a boundary in the common case.

    #[test]
    fn refuses_when_tail_already_in_next_slot() {
        let config = SlotConfig::default();
        // Tail forged at t=30s; now is 16s into the chain - the tail is
        // ahead of the next boundary
        let result = calculate_deadline(&config, 30, 16_000);
        assert!(matches!(result, Err(ForgeError::BlockForgedInNextTimePoint)));
    }

    #[test]
    fn forges_when_tail_in_last_slot() {
        let config = SlotConfig::default();
        // Tail forged exactly at the previous boundary (15s), now 16s
        let deadline = calculate_deadline(&config, 15, 16_000).unwrap();
        assert_eq!(deadline, 16_000 + config.max_produce_ms);
    }

    #[test]
    fn forges_near_boundary_even_with_old_tail() {
        let config = SlotConfig::default();
        // Tail is older than the last slot, but the boundary is close
        // enough that waiting longer would waste the slot
        let deadline = calculate_deadline(&config, 0, 28_500).unwrap();
        assert_eq!(deadline, 30_000);
    }

    #[test]
    fn waits_when_last_slot_block_may_still_arrive() {
        let config = SlotConfig::default();
        // Tail is old and there is plenty of time before the boundary
        let result = calculate_deadline(&config, 0, 17_000);
        assert!(matches!(result, Err(ForgeError::WaitingBlockInLastTimePoint)));
    }

    #[test]
    fn refusals_are_quiet_failures_are_not() {
        assert!(ForgeError::InvalidLeader.is_refusal());
        assert!(ForgeError::WaitingBlockInLastTimePoint.is_refusal());
        assert!(!ForgeError::AppendNewBlockFailed.is_refusal());
        assert!(!ForgeError::CollectTimeout.is_refusal());
    }
}
