//! Pending transaction pool

use async_trait::async_trait;
use palisade_core::{
    Block, ChainId, Hash, PalisadeError, PalisadeResult, Timestamp, TransactionSource, TxBatch, TxId,
};
use palisade_crypto::hashing::hash;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Pool entry with metadata
#[derive(Debug, Clone)]
pub struct PoolEntry {
    pub tx_id: TxId,
    pub payload: Vec<u8>,
    pub priority: u64,
    pub received_at: Timestamp,
}

#[derive(Default)]
struct PoolInner {
    entries: HashMap<TxId, PoolEntry>,
    /// (priority, arrival sequence reversed, id): highest first when iterated backwards
    by_priority: BTreeSet<(u64, std::cmp::Reverse<u64>, TxId)>,
    sequence: HashMap<TxId, u64>,
    next_sequence: u64,
}

impl PoolInner {
    fn remove(&mut self, tx_id: &TxId) -> Option<PoolEntry> {
        let entry = self.entries.remove(tx_id)?;
        if let Some(seq) = self.sequence.remove(tx_id) {
            self.by_priority
                .remove(&(entry.priority, std::cmp::Reverse(seq), *tx_id));
        }
        Some(entry)
    }
}

/// Transaction pool ordered by priority, then arrival
///
/// Transactions are opaque byte strings; their id is the BLAKE3 hash of the
/// payload.
pub struct TxPool {
    inner: RwLock<PoolInner>,
    max_size: usize,
}

impl TxPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            inner: RwLock::new(PoolInner::default()),
            max_size,
        }
    }

    /// Add a transaction; `false` when it is known or the pool is full of
    /// higher-priority work
    pub fn add(&self, payload: Vec<u8>, priority: u64) -> bool {
        let tx_id = hash(&payload);
        let mut inner = self.inner.write();

        if inner.entries.contains_key(&tx_id) {
            return false;
        }

        if inner.entries.len() >= self.max_size {
            let lowest = inner.by_priority.iter().next().copied();
            match lowest {
                Some((p, _, id)) if p < priority => {
                    inner.remove(&id);
                    debug!("Evicted transaction {} (priority {})", id, p);
                }
                _ => {
                    warn!("Transaction pool full, transaction rejected");
                    return false;
                }
            }
        }

        let seq = inner.next_sequence;
        inner.next_sequence += 1;
        inner.sequence.insert(tx_id, seq);
        inner.by_priority.insert((priority, std::cmp::Reverse(seq), tx_id));
        inner.entries.insert(
            tx_id,
            PoolEntry {
                tx_id,
                payload,
                priority,
                received_at: Timestamp::now(),
            },
        );

        debug!("Added transaction {} to pool (priority: {})", tx_id, priority);
        true
    }

    pub fn contains(&self, tx_id: &Hash) -> bool {
        self.inner.read().entries.contains_key(tx_id)
    }

    pub fn remove(&self, tx_id: &Hash) -> Option<PoolEntry> {
        self.inner.write().remove(tx_id)
    }

    /// Drop the transactions included in a confirmed block
    pub fn prune_block(&self, block: &Block) -> usize {
        let mut inner = self.inner.write();
        block
            .transactions
            .iter()
            .filter(|tx| inner.remove(&hash(tx)).is_some())
            .count()
    }

    pub fn size(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Highest-priority transactions whose total payload fits `max_size`
    pub fn select(&self, max_size: usize) -> TxBatch {
        let inner = self.inner.read();
        let mut batch = TxBatch::default();
        let mut used = 0usize;

        for (_, _, tx_id) in inner.by_priority.iter().rev() {
            let Some(entry) = inner.entries.get(tx_id) else {
                continue;
            };
            if used + entry.payload.len() > max_size {
                continue;
            }
            used += entry.payload.len();
            batch.tx_ids.push(entry.tx_id);
            batch.transactions.push(entry.payload.clone());
        }
        batch
    }
}

impl Default for TxPool {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl TransactionSource for TxPool {
    async fn get_packable_transactions(
        &self,
        _chain_id: ChainId,
        deadline: Timestamp,
        max_size: usize,
    ) -> PalisadeResult<TxBatch> {
        if Timestamp::now() >= deadline {
            return Err(PalisadeError::Timeout("packing deadline already passed".into()));
        }
        Ok(self.select(max_size))
    }
}

pub type SharedTxPool = Arc<TxPool>;

pub fn create_txpool(max_size: usize) -> SharedTxPool {
    Arc::new(TxPool::new(max_size))
}
