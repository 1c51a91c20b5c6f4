//! Collaborator contracts consumed by the consensus core
//!
//! Everything durable (blocks, validator set, keys) and everything on the
//! wire lives behind these traits.

use crate::block::Block;
use crate::types::*;
use crate::validator::ValidatorSetEntry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for Palisade operations
pub type PalisadeResult<T> = Result<T, crate::error::PalisadeError>;

/// Network command carried alongside every payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandId {
    /// Single stage vote
    Vote,
    /// Quorum certificate for one stage
    VoteResult,
    /// Packed block candidate
    Block,
    /// Request for a candidate block by height and hash
    GetCandidate,
}

impl CommandId {
    pub const ALL: [CommandId; 4] = [
        CommandId::Vote,
        CommandId::VoteResult,
        CommandId::Block,
        CommandId::GetCandidate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CommandId::Vote => "vote",
            CommandId::VoteResult => "voteResult",
            CommandId::Block => "block",
            CommandId::GetCandidate => "getCandidate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Peer-to-peer transport
#[async_trait]
pub trait Network: Send + Sync {
    /// Send a payload to a single peer
    async fn send_to_peer(
        &self,
        chain_id: ChainId,
        payload: Vec<u8>,
        peer: &PeerId,
        command: CommandId,
    ) -> PalisadeResult<()>;

    /// Send a payload to every connected peer except `exclude`
    async fn broadcast(
        &self,
        chain_id: ChainId,
        command: CommandId,
        payload: Vec<u8>,
        exclude: Option<&PeerId>,
    ) -> PalisadeResult<()>;
}

/// Transactions selected for one block
#[derive(Debug, Clone, Default)]
pub struct TxBatch {
    pub tx_ids: Vec<TxId>,
    pub transactions: Vec<Vec<u8>>,
}

impl TxBatch {
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn size(&self) -> usize {
        self.transactions.iter().map(|tx| tx.len()).sum()
    }
}

/// Transaction pool
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Select transactions to pack, answering before `deadline` and staying
    /// under `max_size` bytes
    async fn get_packable_transactions(
        &self,
        chain_id: ChainId,
        deadline: Timestamp,
        max_size: usize,
    ) -> PalisadeResult<TxBatch>;
}

/// Account signing service
#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign a 32-byte digest with the key behind `address`
    async fn sign(&self, chain_id: ChainId, address: &Address, digest: &Hash) -> PalisadeResult<Signature>;

    /// Public key of the account behind `address`
    async fn public_key(&self, chain_id: ChainId, address: &Address) -> PalisadeResult<PublicKey>;
}

/// Block persistence
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Persist a confirmed block; `false` if the height was already taken
    async fn save_block(&self, chain_id: ChainId, block: &Block) -> PalisadeResult<bool>;

    async fn get_block(&self, chain_id: ChainId, height: Height) -> PalisadeResult<Option<Block>>;

    async fn latest_block(&self, chain_id: ChainId) -> PalisadeResult<Option<Block>>;

    /// Informational: a candidate for the next height exists
    async fn notify_candidate(&self, chain_id: ChainId, block: &Block) -> PalisadeResult<()>;
}

/// Source of the staked validator set
#[async_trait]
pub trait ValidatorSource: Send + Sync {
    async fn current_validators(&self, chain_id: ChainId) -> PalisadeResult<Vec<ValidatorSetEntry>>;
}

/// Chain synchronization status
pub trait SyncStatus: Send + Sync {
    fn is_synchronized(&self, chain_id: ChainId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names() {
        for command in CommandId::ALL {
            assert_eq!(CommandId::parse(command.as_str()), Some(command));
        }
        assert_eq!(CommandId::parse("ping"), None);
    }

    #[test]
    fn test_tx_batch_size() {
        let batch = TxBatch {
            tx_ids: vec![Hash::ZERO, Hash::ZERO],
            transactions: vec![vec![0u8; 10], vec![0u8; 5]],
        };
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.size(), 15);
        assert!(TxBatch::default().is_empty());
    }
}
