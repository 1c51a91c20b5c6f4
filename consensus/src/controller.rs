//! Vote and candidate validation
//!
//! Every vote, local or remote, passes through `submit_vote` before it
//! reaches the ledger. Checks run cheapest first so stale traffic never
//! costs a signature verification.

use crate::error::{StageWait, VoteRejection};
use crate::ledger::{CandidateObservation, Insertion, SharedVoteLedger};
use crate::packer::{header_hash, tx_root, BlockCandidate};
use crate::round_controller::SharedRoundController;
use crate::state::{ConsensusEvent, Equivocation, SharedConsensusState};
use crate::vote::{Candidate, VoteKey, VoteMessage, VoteStage};
use palisade_core::{Block, Height, PeerId};
use palisade_crypto::signing::verify_digest;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Heights past the last confirmed one that votes and candidates may address
pub const MAX_FUTURE_HEIGHTS: Height = 8;

/// Rounds past the current one that votes and candidates may address
pub const MAX_FUTURE_ROUNDS: u64 = 8;

/// Result of submitting a vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Recorded; `resolved` is set when this vote completed a quorum
    Accepted { resolved: Option<Candidate> },
    Rejected(VoteRejection),
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted { .. })
    }
}

/// A stage that just reached quorum
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageResolution {
    pub key: VoteKey,
    pub stage: VoteStage,
    pub candidate: Candidate,
}

pub struct VoteController {
    state: SharedConsensusState,
    ledger: SharedVoteLedger,
    rounds: SharedRoundController,
    resolutions: Option<mpsc::Sender<StageResolution>>,
}

pub type SharedVoteController = Arc<VoteController>;

impl VoteController {
    pub fn new(
        state: SharedConsensusState,
        ledger: SharedVoteLedger,
        rounds: SharedRoundController,
        resolutions: Option<mpsc::Sender<StageResolution>>,
    ) -> Self {
        Self {
            state,
            ledger,
            rounds,
            resolutions,
        }
    }

    /// Validate a vote and record it
    pub fn submit_vote(&self, vote: VoteMessage) -> Outcome {
        match self.check_vote(&vote) {
            Ok(threshold) => self.record_vote(vote, threshold),
            Err(rejection) => {
                debug!("Rejected vote {} from {}: {}", vote.key(), vote.voter, rejection);
                Outcome::Rejected(rejection)
            }
        }
    }

    /// Returns the quorum threshold of the vote's round
    fn check_vote(&self, vote: &VoteMessage) -> Result<usize, VoteRejection> {
        self.check_window(vote.height, vote.round_index)?;
        if vote.slot == 0 || vote.sub_vote_round == 0 {
            return Err(VoteRejection::Malformed);
        }
        if !vote.verify(self.state.chain_id) {
            return Err(VoteRejection::BadSignature);
        }

        let round = self
            .rounds
            .round_for(vote.round_index)
            .map_err(|_| VoteRejection::UnknownRound)?;
        if vote.slot as usize > round.member_count() {
            return Err(VoteRejection::Malformed);
        }
        if !round.contains(&vote.voter) && !self.state.is_seed(&vote.voter) {
            return Err(VoteRejection::UnauthorizedVoter);
        }
        Ok(self.state.quorum_threshold(round.member_count()))
    }

    /// Keeps the ledger bounded: nothing at or below the confirmed height,
    /// nothing far ahead of it or of the installed round
    fn check_window(&self, height: Height, round_index: u64) -> Result<(), VoteRejection> {
        let confirmed = self.state.last_confirmed();
        if height <= confirmed {
            return Err(VoteRejection::StaleVote);
        }
        if height > confirmed + MAX_FUTURE_HEIGHTS {
            return Err(VoteRejection::TooFarAhead);
        }
        if let Some(current) = self.rounds.current() {
            if round_index > current.index + MAX_FUTURE_ROUNDS {
                return Err(VoteRejection::TooFarAhead);
            }
        }
        Ok(())
    }

    /// Votes a certificate for `key` must carry
    pub fn certificate_threshold(&self, key: &VoteKey) -> Result<usize, VoteRejection> {
        self.check_window(key.height, key.round_index)?;
        let round = self
            .rounds
            .round_for(key.round_index)
            .map_err(|_| VoteRejection::UnknownRound)?;
        Ok(self.state.quorum_threshold(round.member_count()))
    }

    fn record_vote(&self, vote: VoteMessage, threshold: usize) -> Outcome {
        let key = vote.key();
        let stage = vote.stage;
        let voter = vote.voter;
        let candidate = vote.candidate;

        match self.ledger.insert(vote, threshold) {
            Insertion::Duplicate { prior } => {
                if prior != candidate {
                    warn!(
                        "Voter {} double voted at {} stage {:?}: {} and {}",
                        voter, key, stage, prior, candidate
                    );
                    self.state.emit_event(ConsensusEvent::Equivocation(Equivocation::DoubleVote {
                        key,
                        stage,
                        voter,
                        first: prior,
                        second: candidate,
                    }));
                }
                Outcome::Rejected(VoteRejection::DuplicateVote)
            }
            Insertion::Inserted { resolved } => {
                if let Some(candidate) = resolved {
                    info!("Stage {:?} of {} resolved to {}", stage, key, candidate);
                    self.publish_resolution(StageResolution { key, stage, candidate });
                }
                Outcome::Accepted { resolved }
            }
        }
    }

    fn publish_resolution(&self, resolution: StageResolution) {
        if let Some(tx) = &self.resolutions {
            if tx.try_send(resolution).is_err() {
                warn!("Resolution queue full, {} not relayed", resolution.key);
            }
        }
    }

    /// Verify a received block and record it as a candidate
    pub fn submit_candidate(
        &self,
        block: Block,
        origin: Option<&PeerId>,
    ) -> Result<CandidateObservation, VoteRejection> {
        let header = &block.header;
        self.check_window(header.height, header.round_index)?;
        if header.chain_id != self.state.chain_id
            || header.packing_index == 0
            || block.hash != header_hash(header)
            || header.tx_count as usize != block.transactions.len()
            || header.tx_root != tx_root(&block.transactions)
        {
            return Err(VoteRejection::Malformed);
        }
        if block.payload_size() > self.state.config.max_block_size {
            return Err(VoteRejection::Malformed);
        }

        let round = self
            .rounds
            .round_for(header.round_index)
            .map_err(|_| VoteRejection::UnknownRound)?;
        let producer = round
            .member_at(header.packing_index)
            .ok_or(VoteRejection::UnauthorizedVoter)?;
        if producer.entry.public_key != header.packer {
            return Err(VoteRejection::UnauthorizedVoter);
        }
        if !verify_digest(&header.packer, &block.hash, &block.signature) {
            return Err(VoteRejection::BadSignature);
        }

        let candidate = BlockCandidate::from_block(block);
        let (height, hash, slot, producer) = (
            candidate.height,
            candidate.hash,
            candidate.slot,
            candidate.block.header.packer,
        );
        let observation = self.ledger.observe_candidate(candidate, false);

        match observation {
            CandidateObservation::New => debug!("New candidate #{} {} slot {}", height, hash, slot),
            CandidateObservation::Known => {}
            CandidateObservation::Fork { existing } => {
                warn!(
                    "Producer {} forked #{} slot {}: {} and {}",
                    producer, height, slot, existing, hash
                );
                self.state.emit_event(ConsensusEvent::Equivocation(Equivocation::ForkedProducer {
                    height,
                    slot,
                    producer,
                    first: existing,
                    second: hash,
                }));
            }
        }
        if let Some(peer) = origin {
            self.ledger.record_source(height, hash, peer.clone());
        }
        Ok(observation)
    }

    /// Wait for one stage of `key` to resolve
    ///
    /// Ends with `RoundChanged` when the round controller cancels waits or
    /// the ledger entry is pruned.
    pub async fn await_stage_result(
        &self,
        key: VoteKey,
        stage: VoteStage,
        timeout: Duration,
    ) -> Result<Candidate, StageWait> {
        let mut result = self.ledger.subscribe(key, stage);
        let mut epoch = self.rounds.epoch();

        let wait = async {
            tokio::select! {
                resolved = result.wait_for(Option::is_some) => {
                    resolved.ok().and_then(|r| *r).ok_or(StageWait::RoundChanged)
                }
                _ = epoch.changed() => Err(StageWait::RoundChanged),
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(StageWait::Timeout),
        }
    }

    pub fn ledger(&self) -> &SharedVoteLedger {
        &self.ledger
    }

    pub fn rounds(&self) -> &SharedRoundController {
        &self.rounds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{genesis, Harness};
    use palisade_core::Hash;

    fn key() -> VoteKey {
        VoteKey::new(1, 1, 1)
    }

    #[test]
    fn test_seven_validators_need_five_votes() {
        let harness = Harness::new(7, 0);
        let candidate = Candidate::Block(Hash::from_bytes([9u8; 32]));

        for voter in 0..4 {
            let vote = harness.signed_vote(voter, key(), 1, VoteStage::One, candidate);
            assert_eq!(harness.controller.submit_vote(vote), Outcome::Accepted { resolved: None });
        }
        assert_eq!(harness.ledger.result(&key(), VoteStage::One), None);

        let fifth = harness.signed_vote(4, key(), 1, VoteStage::One, candidate);
        assert_eq!(
            harness.controller.submit_vote(fifth),
            Outcome::Accepted {
                resolved: Some(candidate)
            }
        );
        let sixth = harness.signed_vote(5, key(), 1, VoteStage::One, candidate);
        assert_eq!(harness.controller.submit_vote(sixth), Outcome::Accepted { resolved: None });

        let resolutions = harness.drain_resolutions();
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].candidate, candidate);
    }

    #[test]
    fn test_stale_vote_rejected_before_signature() {
        let harness = Harness::new(4, 0);
        harness.state.set_last_confirmed(3);

        let mut vote = harness.signed_vote(1, VoteKey::new(3, 1, 1), 1, VoteStage::One, Candidate::Empty);
        vote.signature = palisade_core::Signature::from_bytes([1u8; 64]);
        assert_eq!(
            harness.controller.submit_vote(vote),
            Outcome::Rejected(VoteRejection::StaleVote)
        );
    }

    #[test]
    fn test_far_future_votes_not_stored() {
        let harness = Harness::new(4, 0);
        harness.state.set_last_confirmed(2);

        let edge = VoteKey::new(2 + MAX_FUTURE_HEIGHTS, 1, 1);
        let vote = harness.signed_vote(1, edge, 1, VoteStage::One, Candidate::Empty);
        assert!(harness.controller.submit_vote(vote).is_accepted());

        for height in 3 + MAX_FUTURE_HEIGHTS..3 + MAX_FUTURE_HEIGHTS + 100 {
            let vote = harness.signed_vote(1, VoteKey::new(height, 1, 1), 1, VoteStage::One, Candidate::Empty);
            assert_eq!(
                harness.controller.submit_vote(vote),
                Outcome::Rejected(VoteRejection::TooFarAhead)
            );
        }
        assert_eq!(harness.ledger.len(), 1);
    }

    #[test]
    fn test_far_future_round_rejected() {
        let harness = Harness::new(4, 0);
        harness.rounds.switch_round(Arc::new(harness.round_starting_now(3)), false);

        let near = VoteKey::new(1, 3 + MAX_FUTURE_ROUNDS, 1);
        let vote = harness.signed_vote(1, near, 1, VoteStage::One, Candidate::Empty);
        assert!(harness.controller.submit_vote(vote).is_accepted());

        let far = VoteKey::new(1, 4 + MAX_FUTURE_ROUNDS, 1);
        let vote = harness.signed_vote(1, far, 1, VoteStage::One, Candidate::Empty);
        assert_eq!(
            harness.controller.submit_vote(vote),
            Outcome::Rejected(VoteRejection::TooFarAhead)
        );
    }

    #[test]
    fn test_rejections() {
        let harness = Harness::new(4, 0);

        let mut forged = harness.signed_vote(1, key(), 1, VoteStage::One, Candidate::Empty);
        forged.candidate = Candidate::Block(Hash::from_bytes([1u8; 32]));
        assert_eq!(
            harness.controller.submit_vote(forged),
            Outcome::Rejected(VoteRejection::BadSignature)
        );

        let zero_slot = harness.signed_vote(1, key(), 0, VoteStage::One, Candidate::Empty);
        assert_eq!(
            harness.controller.submit_vote(zero_slot),
            Outcome::Rejected(VoteRejection::Malformed)
        );

        let past_last_slot = harness.signed_vote(1, key(), 5, VoteStage::One, Candidate::Empty);
        assert_eq!(
            harness.controller.submit_vote(past_last_slot),
            Outcome::Rejected(VoteRejection::Malformed)
        );

        let outsider = harness.outsider_vote(key(), 1, VoteStage::One, Candidate::Empty);
        assert_eq!(
            harness.controller.submit_vote(outsider),
            Outcome::Rejected(VoteRejection::UnauthorizedVoter)
        );
    }

    #[test]
    fn test_seed_validator_accepted() {
        let harness = Harness::with_outsider_seed(4, 0);
        let vote = harness.outsider_vote(key(), 1, VoteStage::One, Candidate::Empty);
        assert!(harness.controller.submit_vote(vote).is_accepted());
    }

    #[test]
    fn test_double_vote_reported() {
        let harness = Harness::new(4, 0);
        let first = harness.signed_vote(2, key(), 1, VoteStage::Two, Candidate::Empty);
        let again = first.clone();
        let second = harness.signed_vote(2, key(), 1, VoteStage::Two, Candidate::Block(Hash::from_bytes([3u8; 32])));

        assert!(harness.controller.submit_vote(first).is_accepted());
        assert_eq!(
            harness.controller.submit_vote(again),
            Outcome::Rejected(VoteRejection::DuplicateVote)
        );
        assert!(harness.drain_events().is_empty());

        assert_eq!(
            harness.controller.submit_vote(second),
            Outcome::Rejected(VoteRejection::DuplicateVote)
        );
        let events = harness.drain_events();
        assert!(matches!(
            events.as_slice(),
            [ConsensusEvent::Equivocation(Equivocation::DoubleVote { .. })]
        ));
    }

    #[tokio::test]
    async fn test_await_stage_result() {
        let harness = Harness::new(4, 0);
        let controller = harness.controller.clone();

        let waiter = tokio::spawn(async move {
            controller
                .await_stage_result(key(), VoteStage::One, Duration::from_secs(5))
                .await
        });
        tokio::task::yield_now().await;
        for voter in 0..3 {
            let vote = harness.signed_vote(voter, key(), 1, VoteStage::One, Candidate::Empty);
            harness.controller.submit_vote(vote);
        }
        assert_eq!(waiter.await.unwrap(), Ok(Candidate::Empty));

        let timed_out = harness
            .controller
            .await_stage_result(key(), VoteStage::Two, Duration::from_millis(30))
            .await;
        assert_eq!(timed_out, Err(StageWait::Timeout));
    }

    #[tokio::test]
    async fn test_await_ends_on_round_change() {
        let harness = Harness::new(4, 0);
        let controller = harness.controller.clone();
        let waiter = tokio::spawn(async move {
            controller
                .await_stage_result(key(), VoteStage::One, Duration::from_secs(5))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        harness.rounds.cancel_waits();
        assert_eq!(waiter.await.unwrap(), Err(StageWait::RoundChanged));
    }

    #[test]
    fn test_candidate_verification() {
        let harness = Harness::new(4, 0);
        let round = harness.round_starting_now(1);
        let parent = genesis();

        let block = harness.signed_block(&round, 2, &parent, 1);
        let origin = PeerId::new("peer-2");
        assert_eq!(
            harness.controller.submit_candidate(block.clone(), Some(&origin)),
            Ok(CandidateObservation::New)
        );
        assert_eq!(
            harness.controller.submit_candidate(block.clone(), None),
            Ok(CandidateObservation::Known)
        );
        assert_eq!(harness.ledger.source(&block.hash), Some(origin));

        let fork = harness.signed_block(&round, 2, &parent, 2);
        assert_eq!(
            harness.controller.submit_candidate(fork, None),
            Ok(CandidateObservation::Fork { existing: block.hash })
        );
        assert!(matches!(
            harness.drain_events().as_slice(),
            [ConsensusEvent::Equivocation(Equivocation::ForkedProducer { .. })]
        ));

        let mut wrong_slot = harness.signed_block(&round, 3, &parent, 3);
        wrong_slot.header.packing_index = 1;
        wrong_slot.hash = header_hash(&wrong_slot.header);
        assert_eq!(
            harness.controller.submit_candidate(wrong_slot, None),
            Err(VoteRejection::UnauthorizedVoter)
        );

        let mut tampered = harness.signed_block(&round, 3, &parent, 4);
        tampered.transactions.push(vec![1]);
        assert_eq!(
            harness.controller.submit_candidate(tampered, None),
            Err(VoteRejection::Malformed)
        );

        let mut unsigned = harness.signed_block(&round, 3, &parent, 5);
        unsigned.signature = palisade_core::Signature::from_bytes([0u8; 64]);
        assert_eq!(
            harness.controller.submit_candidate(unsigned, None),
            Err(VoteRejection::BadSignature)
        );
    }
}
