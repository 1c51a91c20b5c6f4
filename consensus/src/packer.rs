//! Block packing for the local producer slot

use crate::ledger::SharedVoteLedger;
use crate::round::Round;
use crate::state::{ConsensusEvent, SharedConsensusState};
use palisade_core::{Block, BlockHeader, BlockStore, Hash, Height, Signer, Timestamp, TransactionSource};
use palisade_crypto::hashing::{hash, merkle_root};
use std::sync::Arc;
use tracing::{debug, error, info};

/// A packed block together with its identifying fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCandidate {
    pub height: Height,
    pub hash: Hash,
    pub header_bytes: Vec<u8>,
    pub slot: u32,
    pub round_index: u64,
    pub block: Block,
}

impl BlockCandidate {
    pub fn from_block(block: Block) -> Self {
        Self {
            height: block.header.height,
            hash: block.hash,
            header_bytes: block.header.encode(),
            slot: block.header.packing_index,
            round_index: block.header.round_index,
            block,
        }
    }
}

/// Hash of a block header
pub fn header_hash(header: &BlockHeader) -> Hash {
    hash(&header.encode())
}

/// Transaction root over the payload hashes
pub fn tx_root(transactions: &[Vec<u8>]) -> Hash {
    let leaves: Vec<Hash> = transactions.iter().map(|tx| hash(tx)).collect();
    merkle_root(&leaves)
}

pub struct Packer {
    state: SharedConsensusState,
    ledger: SharedVoteLedger,
    txs: Arc<dyn TransactionSource>,
    signer: Arc<dyn Signer>,
    store: Arc<dyn BlockStore>,
}

impl Packer {
    pub fn new(
        state: SharedConsensusState,
        ledger: SharedVoteLedger,
        txs: Arc<dyn TransactionSource>,
        signer: Arc<dyn Signer>,
        store: Arc<dyn BlockStore>,
    ) -> Self {
        Self {
            state,
            ledger,
            txs,
            signer,
            store,
        }
    }

    /// Pack a block on top of `parent` if `slot` belongs to this node
    ///
    /// Returns `None` when the slot is not ours, its deadline has passed, or
    /// a collaborator fails; the caller then votes `Empty`.
    pub async fn try_pack(&self, round: &Round, slot: u32, parent: &Block) -> Option<BlockCandidate> {
        if !round.is_local_slot(slot) {
            return None;
        }
        let deadline = round.slot_deadline(slot);
        let now = Timestamp::now();
        if now >= deadline {
            debug!("Slot {} of round {} already over, not packing", slot, round.index);
            return None;
        }

        let chain_id = self.state.chain_id;
        let height = parent.height() + 1;
        // leave half of the remaining slot for propagation
        let pull_deadline = now.add_millis(deadline.duration_since(now).as_millis() as u64 / 2);

        let batch = match self
            .txs
            .get_packable_transactions(chain_id, pull_deadline, self.state.config.max_block_size)
            .await
        {
            Ok(batch) => batch,
            Err(e) => {
                error!("Transaction source failed while packing #{}: {}", height, e);
                return None;
            }
        };

        let header = BlockHeader {
            chain_id,
            height,
            previous_hash: parent.hash,
            timestamp: deadline,
            round_index: round.index,
            round_start: round.start_time,
            member_count: round.member_count() as u32,
            packing_index: slot,
            packer: self.state.local.public_key,
            tx_root: tx_root(&batch.transactions),
            tx_count: batch.len() as u32,
        };
        let block_hash = header_hash(&header);

        let signature = match self
            .signer
            .sign(chain_id, &self.state.local.packing_address, &block_hash)
            .await
        {
            Ok(signature) => signature,
            Err(e) => {
                error!("Failed to sign block #{}: {}", height, e);
                return None;
            }
        };

        let block = Block {
            header,
            hash: block_hash,
            signature,
            transactions: batch.transactions,
        };
        let candidate = BlockCandidate::from_block(block);

        self.ledger.observe_candidate(candidate.clone(), true);
        if let Err(e) = self.store.notify_candidate(chain_id, &candidate.block).await {
            debug!("Block store ignored candidate notice: {}", e);
        }

        info!(
            "Packed block #{} {} in round {} slot {} ({} txs)",
            height,
            block_hash,
            round.index,
            slot,
            candidate.block.transactions.len()
        );
        self.state.emit_event(ConsensusEvent::CandidatePacked {
            height,
            hash: block_hash,
            slot,
        });
        Some(candidate)
    }
}
