//! Agora transaction pool module for Caryatid
//! Holds pending transactions until a block consumes them; drained by the
//! block producer, refilled by reverts.

use agora_common::messages::{Message, TxQueryResponseMessage};
use agora_common::{Transaction, TxHash};
use anyhow::Result;
use caryatid_sdk::{module, Context, Module};
use config::Config;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

const DEFAULT_SUBSCRIBE_TXS_TOPIC: &str = "agora.tx.received";
const DEFAULT_SUBSCRIBE_COMMITTED_TOPIC: &str = "agora.tx.committed";
const DEFAULT_SUBSCRIBE_REVERTED_TOPIC: &str = "agora.chain.reverted";
const DEFAULT_QUERY_TOPIC: &str = "agora.query.txpool";
const DEFAULT_MAX_PENDING: usize = 10_000;

/// Pending transactions in arrival order, deduplicated by hash.
struct PendingPool {
    queue: VecDeque<Transaction>,
    known: HashSet<TxHash>,
    max_pending: usize,
}

impl PendingPool {
    fn new(max_pending: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            known: HashSet::new(),
            max_pending,
        }
    }

    fn insert(&mut self, tx: Transaction) {
        if self.known.contains(&tx.hash) || self.queue.len() >= self.max_pending {
            return;
        }
        self.known.insert(tx.hash);
        self.queue.push_back(tx);
    }

    /// Take up to `limit` transactions out of the pool, oldest first.
    /// The caller owns them now; a failed block returns them explicitly.
    fn drain(&mut self, limit: usize) -> Vec<Transaction> {
        let count = limit.min(self.queue.len());
        let drained: Vec<Transaction> = self.queue.drain(..count).collect();
        for tx in &drained {
            self.known.remove(&tx.hash);
        }
        drained
    }

    fn remove(&mut self, hashes: &[TxHash]) {
        let doomed: HashSet<&TxHash> = hashes.iter().collect();
        self.queue.retain(|tx| !doomed.contains(&tx.hash));
        for hash in hashes {
            self.known.remove(hash);
        }
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

/// Transaction pool module
#[module(
    message_type(Message),
    name = "tx-pool",
    description = "Pending transaction pool"
)]
pub struct TxPool;

impl TxPool {
    /// Main init function
    pub async fn init(&self, context: Arc<Context<Message>>, config: Arc<Config>) -> Result<()> {
        let txs_topic = config
            .get_string("subscribe-txs-topic")
            .unwrap_or(DEFAULT_SUBSCRIBE_TXS_TOPIC.to_string());
        info!("Creating transactions subscriber on '{txs_topic}'");

        let committed_topic = config
            .get_string("subscribe-committed-topic")
            .unwrap_or(DEFAULT_SUBSCRIBE_COMMITTED_TOPIC.to_string());

        let reverted_topic = config
            .get_string("subscribe-reverted-topic")
            .unwrap_or(DEFAULT_SUBSCRIBE_REVERTED_TOPIC.to_string());

        let query_topic =
            config.get_string("query-topic").unwrap_or(DEFAULT_QUERY_TOPIC.to_string());
        info!("Serving pending-transaction queries on '{query_topic}'");

        let max_pending =
            config.get_int("max-pending").unwrap_or(DEFAULT_MAX_PENDING as i64) as usize;

        let pool = Arc::new(Mutex::new(PendingPool::new(max_pending)));

        // Serve pending-transaction requests from the producer
        let query_pool = pool.clone();
        context.handle(&query_topic, move |req| {
            let pool = query_pool.clone();
            async move {
                let Message::TxQuery(query) = req.as_ref() else {
                    return Arc::new(Message::TxQueryResponse(TxQueryResponseMessage {
                        txs: Vec::new(),
                    }));
                };
                let txs = pool.lock().await.drain(query.limit);
                debug!("Handing {} pending transaction(s) to the producer", txs.len());
                Arc::new(Message::TxQueryResponse(TxQueryResponseMessage { txs }))
            }
        });

        let mut txs_subscription = context.subscribe(&txs_topic).await?;
        let mut committed_subscription = context.subscribe(&committed_topic).await?;
        let mut reverted_subscription = context.subscribe(&reverted_topic).await?;

        context.clone().run(async move {
            loop {
                tokio::select! {
                    result = txs_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Transaction message read failed");
                            return;
                        };
                        if let Message::Txs(msg) = message.as_ref() {
                            let mut pool = pool.lock().await;
                            for tx in &msg.txs {
                                pool.insert(tx.clone());
                            }
                            debug!("Pool holds {} pending transaction(s)", pool.len());
                        }
                    }

                    result = committed_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Committed message read failed");
                            return;
                        };
                        if let Message::TxsCommitted(msg) = message.as_ref() {
                            pool.lock().await.remove(&msg.tx_hashes);
                        }
                    }

                    result = reverted_subscription.read() => {
                        let Ok((_, message)) = result else {
                            error!("Reverted message read failed");
                            return;
                        };
                        if let Message::BlocksReverted(msg) = message.as_ref() {
                            info!("Reinserting {} transaction(s) from reverted blocks", msg.txs.len());
                            let mut pool = pool.lock().await;
                            for tx in &msg.txs {
                                pool.insert(tx.clone());
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(byte: u8) -> Transaction {
        Transaction::new(vec![byte])
    }

    #[test]
    fn drains_in_arrival_order() {
        let mut pool = PendingPool::new(100);
        pool.insert(tx(1));
        pool.insert(tx(2));
        pool.insert(tx(3));

        let drained = pool.drain(2);
        assert_eq!(drained, vec![tx(1), tx(2)]);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn deduplicates_by_hash() {
        let mut pool = PendingPool::new(100);
        pool.insert(tx(1));
        pool.insert(tx(1));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn drained_txs_can_be_reinserted() {
        let mut pool = PendingPool::new(100);
        pool.insert(tx(1));
        let drained = pool.drain(10);
        assert_eq!(pool.len(), 0);

        for tx in drained {
            pool.insert(tx);
        }
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn remove_targets_only_named_hashes() {
        let mut pool = PendingPool::new(100);
        pool.insert(tx(1));
        pool.insert(tx(2));
        pool.remove(&[tx(1).hash]);
        assert_eq!(pool.drain(10), vec![tx(2)]);
    }

    #[test]
    fn bound_is_respected() {
        let mut pool = PendingPool::new(2);
        pool.insert(tx(1));
        pool.insert(tx(2));
        pool.insert(tx(3));
        assert_eq!(pool.len(), 2);
    }
}
