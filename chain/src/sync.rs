//! Chain synchronization flag

use palisade_core::{ChainId, SyncStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Synchronization state set by the block sync layer
///
/// A node that starts from its own genesis or a trusted store is already in
/// sync; nodes catching up flip the flag once the download completes.
#[derive(Debug, Default)]
pub struct SyncFlag {
    synchronized: AtomicBool,
}

impl SyncFlag {
    pub fn new(synchronized: bool) -> Self {
        Self {
            synchronized: AtomicBool::new(synchronized),
        }
    }

    pub fn set(&self, synchronized: bool) {
        self.synchronized.store(synchronized, Ordering::Release);
    }
}

impl SyncStatus for SyncFlag {
    fn is_synchronized(&self, _chain_id: ChainId) -> bool {
        self.synchronized.load(Ordering::Acquire)
    }
}

pub type SharedSyncFlag = Arc<SyncFlag>;
