//! Agora consensus module for Caryatid
//! Owns the block forest and the canonical chain; blocks from the network
//! and from local production both enter through the same engine.

pub mod chain;
pub mod engine;
pub mod errors;
pub mod forest;
pub mod stores;

use agora_common::messages::{
    BlockOrigin, ChainQueryMessage, ChainQueryResponseMessage, Message, SubmitOutcome,
    SubmitResultMessage,
};
use agora_common::slots::SlotConfig;
use agora_common::{BlockInfo, BlockStatus, ValidatorId};
use anyhow::{anyhow, bail, Result};
use caryatid_sdk::{module, Context, Module};
use chain::{Blockchain, ChainEvent};
use config::Config;
use engine::{ConsensusEngine, ForkConsensus};
use errors::ChainError;
use std::sync::Arc;
use stores::{fjall::FjallStore, memory::MemoryStore, ChainStore};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const DEFAULT_SUBSCRIBE_BLOCKS_TOPIC: &str = "agora.block.received";
const DEFAULT_SUBMIT_TOPIC: &str = "agora.block.submit";
const DEFAULT_PUBLISH_TAIL_TOPIC: &str = "agora.chain.tail";
const DEFAULT_PUBLISH_REVERTED_TOPIC: &str = "agora.chain.reverted";
const DEFAULT_PUBLISH_LIB_TOPIC: &str = "agora.chain.lib";
const DEFAULT_PUBLISH_COMMITTED_TOPIC: &str = "agora.tx.committed";
const DEFAULT_PUBLISH_SYNC_TOPIC: &str = "agora.network.sync";
const DEFAULT_PUBLISH_BROADCAST_TOPIC: &str = "agora.block.broadcast";
const DEFAULT_CHAIN_QUERY_TOPIC: &str = "agora.query.chain";
const DEFAULT_CLOCK_TOPIC: &str = "clock.tick";
const DEFAULT_STORE: &str = "memory";
const DEFAULT_LIB_INTERVAL: u64 = 15; // seconds
const DEFAULT_GENESIS_TIMESTAMP: i64 = 0;

/// Topics the module publishes chain events on
#[derive(Clone)]
struct PublishTopics {
    tail: String,
    reverted: String,
    lib: String,
    committed: String,
    sync: String,
}

/// Consensus module
/// Parameterised by the outer message enum used on the bus
#[module(
    message_type(Message),
    name = "consensus",
    description = "Block forest and canonical chain"
)]
pub struct Consensus;

impl Consensus {
    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        // Get configuration
        let subscribe_blocks_topic = config
            .get_string("subscribe-blocks-topic")
            .unwrap_or(DEFAULT_SUBSCRIBE_BLOCKS_TOPIC.to_string());
        info!("Creating blocks subscriber on '{subscribe_blocks_topic}'");

        let submit_topic =
            config.get_string("submit-topic").unwrap_or(DEFAULT_SUBMIT_TOPIC.to_string());
        info!("Handling block submissions on '{submit_topic}'");

        let chain_query_topic = config
            .get_string("chain-query-topic")
            .unwrap_or(DEFAULT_CHAIN_QUERY_TOPIC.to_string());

        let clock_topic =
            config.get_string("clock-topic").unwrap_or(DEFAULT_CLOCK_TOPIC.to_string());

        let topics = PublishTopics {
            tail: config
                .get_string("publish-tail-topic")
                .unwrap_or(DEFAULT_PUBLISH_TAIL_TOPIC.to_string()),
            reverted: config
                .get_string("publish-reverted-topic")
                .unwrap_or(DEFAULT_PUBLISH_REVERTED_TOPIC.to_string()),
            lib: config
                .get_string("publish-lib-topic")
                .unwrap_or(DEFAULT_PUBLISH_LIB_TOPIC.to_string()),
            committed: config
                .get_string("publish-committed-topic")
                .unwrap_or(DEFAULT_PUBLISH_COMMITTED_TOPIC.to_string()),
            sync: config
                .get_string("publish-sync-topic")
                .unwrap_or(DEFAULT_PUBLISH_SYNC_TOPIC.to_string()),
        };

        let broadcast_topic = config
            .get_string("publish-broadcast-topic")
            .unwrap_or(DEFAULT_PUBLISH_BROADCAST_TOPIC.to_string());

        let lib_interval =
            config.get_int("lib-interval").unwrap_or(DEFAULT_LIB_INTERVAL as i64) as u64;
        info!("LIB update interval {lib_interval}s");

        let lib_depth = config.get_int("lib-depth").unwrap_or(chain::DEFAULT_LIB_DEPTH as i64) as u64;
        info!("LIB confirmation depth {lib_depth}");

        let genesis_timestamp =
            config.get_int("genesis-timestamp").unwrap_or(DEFAULT_GENESIS_TIMESTAMP);

        let bookkeepers = read_bookkeepers(&config)?;
        info!("{} bookkeeper(s) configured", bookkeepers.len());

        let slot_config = read_slot_config(&config);

        let store_type = config.get_string("store").unwrap_or(DEFAULT_STORE.to_string());
        let store: Arc<dyn ChainStore> = match store_type.as_str() {
            "memory" => Arc::new(MemoryStore::new()),
            "fjall" => Arc::new(FjallStore::new(config.clone())?),
            _ => bail!("Unknown store type {store_type}"),
        };

        let blockchain = Blockchain::bootstrap(
            store,
            bookkeepers,
            genesis_timestamp,
            &slot_config,
            lib_depth,
        )?;
        let engine = Arc::new(Mutex::new(ConsensusEngine::new(blockchain, slot_config)));

        // Serve local block submissions: the producer needs the resulting
        // tail synchronously to detect a failed append
        let submit_engine = engine.clone();
        let submit_context = context.clone();
        let submit_topics = topics.clone();
        let submit_broadcast_topic = broadcast_topic.clone();
        context.handle(&submit_topic, move |req| {
            let engine = submit_engine.clone();
            let context = submit_context.clone();
            let topics = submit_topics.clone();
            let broadcast_topic = submit_broadcast_topic.clone();
            async move {
                let Message::BlockAnnounce(announce) = req.as_ref() else {
                    return Arc::new(Message::SubmitResult(SubmitResultMessage {
                        block_hash: Default::default(),
                        outcome: SubmitOutcome::Rejected {
                            reason: "invalid message for block submission".to_string(),
                        },
                    }));
                };

                let block_hash = announce.block.hash;
                let (result, events) = {
                    let mut engine = engine.lock().await;
                    let result = engine.push(&announce.origin, announce.block.clone());
                    (result, engine.take_events())
                };
                publish_events(&context, &topics, events).await;

                let outcome = match result {
                    Ok(tail) => {
                        // Hand the accepted block to the network layer
                        // (fire and forget)
                        context
                            .message_bus
                            .publish(&broadcast_topic, req.clone())
                            .await
                            .unwrap_or_else(|e| error!("Failed to broadcast block: {e}"));
                        SubmitOutcome::Accepted { tail }
                    }
                    Err(e) => SubmitOutcome::Rejected {
                        reason: e.to_string(),
                    },
                };
                Arc::new(Message::SubmitResult(SubmitResultMessage {
                    block_hash,
                    outcome,
                }))
            }
        });

        // Serve chain state queries
        let query_engine = engine.clone();
        context.handle(&chain_query_topic, move |req| {
            let engine = query_engine.clone();
            async move {
                let Message::ChainQuery(query) = req.as_ref() else {
                    return Arc::new(Message::ChainQueryResponse(
                        ChainQueryResponseMessage::Error("invalid message for chain-query".into()),
                    ));
                };

                let engine = engine.lock().await;
                let response = match query {
                    ChainQueryMessage::GetTail => {
                        let tail = engine.chain().tail();
                        ChainQueryResponseMessage::Tail {
                            tail: BlockInfo::of(&tail.block, BlockStatus::Canonical),
                            state: tail.state.clone(),
                        }
                    }
                    ChainQueryMessage::GetLib => {
                        let lib = engine.chain().lib();
                        ChainQueryResponseMessage::Lib {
                            lib: BlockInfo::of(&lib.block, BlockStatus::Canonical),
                        }
                    }
                };
                Arc::new(Message::ChainQueryResponse(response))
            }
        });

        // Subscribe for network blocks and clock ticks
        let mut blocks_subscription = context.subscribe(&subscribe_blocks_topic).await?;
        let mut clock_subscription = context.subscribe(&clock_topic).await?;

        context.clone().run(async move {
            loop {
                tokio::select! {
                    result = blocks_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Block message read failed");
                            return;
                        };

                        if let Message::BlockAnnounce(announce) = message.as_ref() {
                            let origin = match &announce.origin {
                                BlockOrigin::Local => {
                                    // Local production must use the submit
                                    // request so the producer sees the result
                                    warn!("Ignoring local block on network topic");
                                    continue;
                                }
                                origin => origin.clone(),
                            };

                            let (result, events) = {
                                let mut engine = engine.lock().await;
                                let result = engine.push(&origin, announce.block.clone());
                                (result, engine.take_events())
                            };
                            log_push_result(&announce.block.hash, &result);
                            publish_events(&context, &topics, events).await;
                        }
                    }

                    result = clock_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Clock message read failed");
                            return;
                        };

                        if let Message::Clock(tick) = message.as_ref() {
                            if lib_interval > 0 && tick.number % lib_interval == 0 {
                                let (result, events) = {
                                    let mut engine = engine.lock().await;
                                    let result = engine.update_lib();
                                    (result, engine.take_events())
                                };
                                if let Err(e) = result {
                                    error!("LIB update failed: {e}");
                                }
                                publish_events(&context, &topics, events).await;
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }
}

/// Parse the configured bookkeeper identities (hex hashes, in order).
fn read_bookkeepers(config: &Config) -> Result<Vec<ValidatorId>> {
    let entries: Vec<String> = config.get("bookkeepers").unwrap_or_default();
    if entries.is_empty() {
        bail!("No bookkeepers configured");
    }
    entries
        .iter()
        .map(|s| s.parse::<ValidatorId>().map_err(|e| anyhow!("bad bookkeeper id {s}: {e}")))
        .collect()
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

/// Log a push outcome at the severity its error class warrants.
fn log_push_result(hash: &agora_common::BlockHash, result: &Result<agora_common::BlockHash, ChainError>) {
    match result {
        Ok(tail) => debug!("Accepted block {hash}, tail now {tail}"),
        Err(e) if e.is_rejection() => debug!("Rejected block {hash}: {e}"),
        Err(e) if e.is_sync_needed() => info!("Holding block {hash}: {e}"),
        Err(e) => error!("Failed to push block {hash}: {e}"),
    }
}

/// Publish drained chain events to their topics.
async fn publish_events(
    context: &Arc<Context<Message>>,
    topics: &PublishTopics,
    events: Vec<ChainEvent>,
) {
    for event in events {
        let (topic, message) = match event {
            ChainEvent::TailUpdated(tail) => (
                topics.tail.clone(),
                Message::TailUpdated(agora_common::messages::TailUpdatedMessage { tail }),
            ),
            ChainEvent::BlocksReverted { blocks, txs } => (
                topics.reverted.clone(),
                Message::BlocksReverted(agora_common::messages::BlocksRevertedMessage {
                    blocks,
                    txs,
                }),
            ),
            ChainEvent::TxsCommitted {
                block_hash,
                tx_hashes,
            } => (
                topics.committed.clone(),
                Message::TxsCommitted(agora_common::messages::TxsCommittedMessage {
                    block_hash,
                    tx_hashes,
                }),
            ),
            ChainEvent::LibAdvanced(lib) => (
                topics.lib.clone(),
                Message::LibAdvanced(agora_common::messages::LibAdvancedMessage { lib }),
            ),
            ChainEvent::SyncWanted(request) => {
                (topics.sync.clone(), Message::SyncRequest(request))
            }
        };

        context
            .message_bus
            .publish(&topic, Arc::new(message))
            .await
            .unwrap_or_else(|e| error!("Failed to publish to {topic}: {e}"));
    }
}
