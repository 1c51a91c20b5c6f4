//! Persistent block store using sled database

use async_trait::async_trait;
use palisade_core::{Block, BlockStore, ChainId, Height, PalisadeError, PalisadeResult};
use parking_lot::RwLock;
use sled::{Db, Tree};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const BLOCKS_TREE: &str = "blocks";
const CANDIDATES_TREE: &str = "candidates";
const META_TREE: &str = "meta";
const LATEST_KEY: &[u8] = b"latest";

fn storage_err(e: sled::Error) -> PalisadeError {
    PalisadeError::StorageError(e.to_string())
}

/// Block store backed by sled
///
/// Blocks are keyed by big-endian height so tree iteration follows the chain.
pub struct SledBlockStore {
    db: Db,
    blocks: Tree,
    candidates: Tree,
    meta: Tree,
    latest: RwLock<Option<Height>>,
}

impl SledBlockStore {
    pub fn open<P: AsRef<Path>>(path: P) -> PalisadeResult<Self> {
        let db = sled::open(path).map_err(storage_err)?;
        let blocks = db.open_tree(BLOCKS_TREE).map_err(storage_err)?;
        let candidates = db.open_tree(CANDIDATES_TREE).map_err(storage_err)?;
        let meta = db.open_tree(META_TREE).map_err(storage_err)?;

        let latest = match meta.get(LATEST_KEY).map_err(storage_err)? {
            Some(bytes) => {
                let raw: [u8; 8] = bytes
                    .as_ref()
                    .try_into()
                    .map_err(|_| PalisadeError::StateCorruption("latest height record".into()))?;
                Some(u64::from_be_bytes(raw))
            }
            None => None,
        };

        Ok(Self {
            db,
            blocks,
            candidates,
            meta,
            latest: RwLock::new(latest),
        })
    }

    pub fn height(&self) -> Option<Height> {
        *self.latest.read()
    }

    fn load(&self, height: Height) -> PalisadeResult<Option<Block>> {
        match self.blocks.get(height.to_be_bytes()).map_err(storage_err)? {
            Some(bytes) => Ok(Some(Block::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Persist `genesis` when the store is empty
    pub fn init_genesis(&self, genesis: &Block) -> PalisadeResult<bool> {
        if self.height().is_some() {
            return Ok(false);
        }
        self.insert(genesis)?;
        info!("Initialized block store with genesis {}", genesis.hash);
        Ok(true)
    }

    fn insert(&self, block: &Block) -> PalisadeResult<bool> {
        let key = block.height().to_be_bytes();
        let inserted = self
            .blocks
            .compare_and_swap(key, None as Option<&[u8]>, Some(block.to_bytes()?))
            .map_err(storage_err)?
            .is_ok();
        if !inserted {
            return Ok(false);
        }

        let mut latest = self.latest.write();
        if latest.map_or(true, |h| block.height() > h) {
            self.meta
                .insert(LATEST_KEY, &block.height().to_be_bytes())
                .map_err(storage_err)?;
            *latest = Some(block.height());
        }
        self.candidates.clear().map_err(storage_err)?;
        self.db.flush().map_err(storage_err)?;
        Ok(true)
    }
}

#[async_trait]
impl BlockStore for SledBlockStore {
    async fn save_block(&self, _chain_id: ChainId, block: &Block) -> PalisadeResult<bool> {
        let saved = self.insert(block)?;
        if saved {
            info!("Persisted block #{} {}", block.height(), block.hash);
        }
        Ok(saved)
    }

    async fn get_block(&self, _chain_id: ChainId, height: Height) -> PalisadeResult<Option<Block>> {
        self.load(height)
    }

    async fn latest_block(&self, _chain_id: ChainId) -> PalisadeResult<Option<Block>> {
        match self.height() {
            Some(height) => self.load(height),
            None => Ok(None),
        }
    }

    async fn notify_candidate(&self, _chain_id: ChainId, block: &Block) -> PalisadeResult<()> {
        debug!("Candidate announced for #{}: {}", block.height(), block.hash);
        self.candidates
            .insert(block.hash.as_bytes(), block.to_bytes()?)
            .map_err(storage_err)?;
        Ok(())
    }
}

pub type SharedSledBlockStore = Arc<SledBlockStore>;

pub fn create_persistent_store<P: AsRef<Path>>(path: P) -> PalisadeResult<SharedSledBlockStore> {
    Ok(Arc::new(SledBlockStore::open(path)?))
}
