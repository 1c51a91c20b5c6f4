//! Vote messages and their wire encoding
//!
//! Votes travel in a fixed little-endian layout:
//!
//! ```text
//! height u64 | round u64 | slot u32 | sub-vote-round u8 | stage u8 |
//! candidate [32] (all zero = Empty) | voter [32] | sig_len u8 | signature
//! ```
//!
//! A result message bundles the votes that crossed the quorum for one stage.

use palisade_core::{ChainId, Hash, Height, PublicKey, Signature};
use palisade_crypto::hashing::hash_multiple;
use palisade_crypto::signing::verify_digest;
use std::fmt;

use crate::error::VoteRejection;

/// Voting stage within one sub-vote-round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum VoteStage {
    One = 1,
    Two = 2,
}

impl VoteStage {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(VoteStage::One),
            2 => Some(VoteStage::Two),
            _ => None,
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize - 1
    }
}

/// What a vote is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Candidate {
    Block(Hash),
    /// No block for this slot
    Empty,
}

impl Candidate {
    pub fn from_hash(hash: Hash) -> Self {
        if hash.is_zero() {
            Candidate::Empty
        } else {
            Candidate::Block(hash)
        }
    }

    pub fn to_hash(self) -> Hash {
        match self {
            Candidate::Block(hash) => hash,
            Candidate::Empty => Hash::ZERO,
        }
    }

    pub fn block_hash(self) -> Option<Hash> {
        match self {
            Candidate::Block(hash) => Some(hash),
            Candidate::Empty => None,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Candidate::Block(hash) => write!(f, "{}", hash),
            Candidate::Empty => f.write_str("empty"),
        }
    }
}

/// Identifies one voting attempt for a height
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoteKey {
    pub height: Height,
    pub round_index: u64,
    pub sub_vote_round: u8,
}

impl VoteKey {
    pub fn new(height: Height, round_index: u64, sub_vote_round: u8) -> Self {
        Self {
            height,
            round_index,
            sub_vote_round,
        }
    }
}

impl fmt::Display for VoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}/r{}/s{}", self.height, self.round_index, self.sub_vote_round)
    }
}

/// A single signed stage vote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteMessage {
    pub height: Height,
    pub round_index: u64,
    /// Slot of the candidate's producer
    pub slot: u32,
    pub sub_vote_round: u8,
    pub stage: VoteStage,
    pub candidate: Candidate,
    pub voter: PublicKey,
    pub signature: Signature,
    /// Created by this node; never serialized
    pub local_origin: bool,
}

const VOTE_FIXED_LEN: usize = 8 + 8 + 4 + 1 + 1 + 32 + 32 + 1;

impl VoteMessage {
    /// A vote awaiting its signature
    pub fn unsigned(key: VoteKey, slot: u32, stage: VoteStage, candidate: Candidate, voter: PublicKey) -> Self {
        Self {
            height: key.height,
            round_index: key.round_index,
            slot,
            sub_vote_round: key.sub_vote_round,
            stage,
            candidate,
            voter,
            signature: Signature::from_bytes([0u8; 64]),
            local_origin: false,
        }
    }

    pub fn sign_with(mut self, chain_id: ChainId, sign_fn: impl FnOnce(&Hash) -> Signature) -> Self {
        self.signature = sign_fn(&self.digest(chain_id));
        self
    }

    pub fn key(&self) -> VoteKey {
        VoteKey::new(self.height, self.round_index, self.sub_vote_round)
    }

    /// Digest covered by the voter's signature
    pub fn digest(&self, chain_id: ChainId) -> Hash {
        hash_multiple(&[
            b"PALISADE_VOTE:".as_slice(),
            &chain_id.to_le_bytes(),
            &self.height.to_le_bytes(),
            &self.round_index.to_le_bytes(),
            &self.slot.to_le_bytes(),
            &[self.sub_vote_round, self.stage as u8],
            self.candidate.to_hash().as_bytes(),
        ])
    }

    pub fn verify(&self, chain_id: ChainId) -> bool {
        verify_digest(&self.voter, &self.digest(chain_id), &self.signature)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(VOTE_FIXED_LEN + Signature::LENGTH);
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(&self.round_index.to_le_bytes());
        buf.extend_from_slice(&self.slot.to_le_bytes());
        buf.push(self.sub_vote_round);
        buf.push(self.stage as u8);
        buf.extend_from_slice(self.candidate.to_hash().as_bytes());
        buf.extend_from_slice(self.voter.as_bytes());
        buf.push(Signature::LENGTH as u8);
        buf.extend_from_slice(self.signature.as_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, VoteRejection> {
        let mut reader = Reader::new(bytes);
        let vote = Self::read(&mut reader)?;
        reader.finish()?;
        Ok(vote)
    }

    fn read(reader: &mut Reader<'_>) -> Result<Self, VoteRejection> {
        let height = reader.u64()?;
        let round_index = reader.u64()?;
        let slot = reader.u32()?;
        let sub_vote_round = reader.u8()?;
        let stage = VoteStage::from_u8(reader.u8()?).ok_or(VoteRejection::Malformed)?;
        let candidate = Candidate::from_hash(Hash::from_bytes(reader.array()?));
        let voter = PublicKey::from_bytes(reader.array()?);
        let sig_len = reader.u8()? as usize;
        let signature = Signature::from_slice(reader.take(sig_len)?).ok_or(VoteRejection::Malformed)?;

        Ok(Self {
            height,
            round_index,
            slot,
            sub_vote_round,
            stage,
            candidate,
            voter,
            signature,
            local_origin: false,
        })
    }
}

/// Quorum certificate for one stage of one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteResultMessage {
    pub key: VoteKey,
    pub stage: VoteStage,
    pub candidate: Candidate,
    pub votes: Vec<VoteMessage>,
}

impl VoteResultMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.key.height.to_le_bytes());
        buf.extend_from_slice(&self.key.round_index.to_le_bytes());
        buf.push(self.key.sub_vote_round);
        buf.push(self.stage as u8);
        buf.extend_from_slice(self.candidate.to_hash().as_bytes());
        buf.extend_from_slice(&(self.votes.len() as u16).to_le_bytes());
        for vote in &self.votes {
            let bytes = vote.encode();
            buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            buf.extend_from_slice(&bytes);
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, VoteRejection> {
        let mut reader = Reader::new(bytes);
        let key = VoteKey::new(reader.u64()?, reader.u64()?, reader.u8()?);
        let stage = VoteStage::from_u8(reader.u8()?).ok_or(VoteRejection::Malformed)?;
        let candidate = Candidate::from_hash(Hash::from_bytes(reader.array()?));

        let count = reader.u16()? as usize;
        let mut votes = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            let len = reader.u16()? as usize;
            let vote = VoteMessage::decode(reader.take(len)?)?;
            // every bundled vote must back the certified outcome
            if vote.key() != key || vote.stage != stage || vote.candidate != candidate {
                return Err(VoteRejection::Malformed);
            }
            votes.push(vote);
        }
        reader.finish()?;

        Ok(Self {
            key,
            stage,
            candidate,
            votes,
        })
    }
}

/// Request for a candidate block we saw votes for but never received
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CandidateRequest {
    pub height: Height,
    pub hash: Hash,
}

impl CandidateRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(40);
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(self.hash.as_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, VoteRejection> {
        let mut reader = Reader::new(bytes);
        let request = Self {
            height: reader.u64()?,
            hash: Hash::from_bytes(reader.array()?),
        };
        reader.finish()?;
        Ok(request)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], VoteRejection> {
        let end = self.pos.checked_add(len).ok_or(VoteRejection::Malformed)?;
        let slice = self.bytes.get(self.pos..end).ok_or(VoteRejection::Malformed)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], VoteRejection> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, VoteRejection> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, VoteRejection> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, VoteRejection> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, VoteRejection> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// Trailing bytes make the message malformed
    fn finish(&self) -> Result<(), VoteRejection> {
        if self.pos == self.bytes.len() {
            Ok(())
        } else {
            Err(VoteRejection::Malformed)
        }
    }
}
