//! Block and header types shared by the packer, the block store and the network

use crate::types::{ChainId, Hash, Height, PublicKey, Signature, Timestamp};
use serde::{Deserialize, Serialize};

/// Block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub chain_id: ChainId,
    pub height: Height,
    pub previous_hash: Hash,
    /// Block time (end of the producing slot)
    pub timestamp: Timestamp,
    pub round_index: u64,
    pub round_start: Timestamp,
    pub member_count: u32,
    /// 1-based slot of the producer within the round
    pub packing_index: u32,
    pub packer: PublicKey,
    pub tx_root: Hash,
    pub tx_count: u32,
}

impl BlockHeader {
    /// Canonical header bytes, the preimage of the block hash
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(164);
        buf.extend_from_slice(b"PALISADE_HEADER:");
        buf.extend_from_slice(&self.chain_id.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(self.previous_hash.as_bytes());
        buf.extend_from_slice(&self.timestamp.0.to_le_bytes());
        buf.extend_from_slice(&self.round_index.to_le_bytes());
        buf.extend_from_slice(&self.round_start.0.to_le_bytes());
        buf.extend_from_slice(&self.member_count.to_le_bytes());
        buf.extend_from_slice(&self.packing_index.to_le_bytes());
        buf.extend_from_slice(self.packer.as_bytes());
        buf.extend_from_slice(self.tx_root.as_bytes());
        buf.extend_from_slice(&self.tx_count.to_le_bytes());
        buf
    }

    /// Whether the producer of this header held the last slot of its round
    pub fn closes_round(&self) -> bool {
        self.packing_index >= self.member_count
    }
}

/// A produced block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub hash: Hash,
    /// Producer signature over `hash`
    pub signature: Signature,
    pub transactions: Vec<Vec<u8>>,
}

impl Block {
    pub fn height(&self) -> Height {
        self.header.height
    }

    /// Serialized size of the transaction payloads
    pub fn payload_size(&self) -> usize {
        self.transactions.iter().map(|tx| tx.len()).sum()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(height: Height) -> BlockHeader {
        BlockHeader {
            chain_id: 1,
            height,
            previous_hash: Hash::ZERO,
            timestamp: Timestamp::from_millis(10_000),
            round_index: 3,
            round_start: Timestamp::from_millis(0),
            member_count: 4,
            packing_index: 4,
            packer: PublicKey::from_bytes([9u8; 32]),
            tx_root: Hash::ZERO,
            tx_count: 0,
        }
    }

    #[test]
    fn test_header_encoding_covers_height() {
        assert_ne!(header(1).encode(), header(2).encode());
        assert!(header(1).closes_round());
    }

    #[test]
    fn test_block_bincode() {
        let block = Block {
            header: header(5),
            hash: Hash::from_bytes([1u8; 32]),
            signature: Signature::from_bytes([2u8; 64]),
            transactions: vec![b"tx-a".to_vec(), b"tx-bb".to_vec()],
        };
        let restored = Block::from_bytes(&block.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, block);
        assert_eq!(restored.payload_size(), 9);
    }
}
