//! In-memory block store

use async_trait::async_trait;
use palisade_core::{Block, BlockStore, ChainId, Hash, Height, PalisadeResult};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Block store kept entirely in memory
///
/// Used by tests and single-process devnets. One instance serves one chain;
/// the chain id of each call is not checked.
pub struct MemoryBlockStore {
    blocks: RwLock<BTreeMap<Height, Block>>,
    /// Candidates announced for the next height, newest last
    candidates: RwLock<Vec<Hash>>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(BTreeMap::new()),
            candidates: RwLock::new(Vec::new()),
        }
    }

    /// Create a store holding `genesis`
    pub fn with_genesis(genesis: Block) -> Self {
        let store = Self::new();
        store.blocks.write().insert(genesis.height(), genesis);
        store
    }

    pub fn height(&self) -> Option<Height> {
        self.blocks.read().keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }

    /// Hashes of candidates announced through `notify_candidate`
    pub fn announced_candidates(&self) -> Vec<Hash> {
        self.candidates.read().clone()
    }
}

impl Default for MemoryBlockStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn save_block(&self, _chain_id: ChainId, block: &Block) -> PalisadeResult<bool> {
        let mut blocks = self.blocks.write();
        if blocks.contains_key(&block.height()) {
            return Ok(false);
        }
        blocks.insert(block.height(), block.clone());
        self.candidates.write().clear();

        info!("Stored block #{} {}", block.height(), block.hash);
        Ok(true)
    }

    async fn get_block(&self, _chain_id: ChainId, height: Height) -> PalisadeResult<Option<Block>> {
        Ok(self.blocks.read().get(&height).cloned())
    }

    async fn latest_block(&self, _chain_id: ChainId) -> PalisadeResult<Option<Block>> {
        Ok(self.blocks.read().values().next_back().cloned())
    }

    async fn notify_candidate(&self, _chain_id: ChainId, block: &Block) -> PalisadeResult<()> {
        debug!("Candidate announced for #{}: {}", block.height(), block.hash);
        self.candidates.write().push(block.hash);
        Ok(())
    }
}

/// Shared in-memory store
pub type SharedMemoryBlockStore = Arc<MemoryBlockStore>;

pub fn create_memory_store(genesis: Block) -> SharedMemoryBlockStore {
    Arc::new(MemoryBlockStore::with_genesis(genesis))
}


#[cfg(test)]
mod tests {
    use super::test_blocks::block;
    use super::*;

    #[tokio::test]
    async fn test_save_is_first_writer_wins() {
        let store = MemoryBlockStore::with_genesis(block(0, 0));

        assert!(store.save_block(1, &block(1, 1)).await.unwrap());
        assert!(!store.save_block(1, &block(1, 2)).await.unwrap());

        let stored = store.get_block(1, 1).await.unwrap().unwrap();
        assert_eq!(stored.hash, Hash::from_bytes([1u8; 32]));
        assert_eq!(store.latest_block(1).await.unwrap().unwrap().height(), 1);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_candidates_cleared_on_save() {
        let store = MemoryBlockStore::new();
        store.notify_candidate(1, &block(1, 7)).await.unwrap();
        assert_eq!(store.announced_candidates().len(), 1);

        store.save_block(1, &block(1, 7)).await.unwrap();
        assert!(store.announced_candidates().is_empty());
    }
}
