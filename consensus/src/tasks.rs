//! Background processors next to the consensus loop
//!
//! - `VoteIngestion` drains the inbound queue and dispatches by command
//! - `ResultRelay` gossips a quorum certificate for every local resolution
//! - `FutureRoundProbe` notices peers voting ahead of this node

use crate::controller::{Outcome, SharedVoteController, StageResolution};
use crate::error::VoteRejection;
use crate::ledger::{CandidateObservation, SharedVoteLedger};
use crate::processor::{Processor, ProcessorContext};
use crate::relay::SharedMessageRelay;
use crate::round_controller::SharedRoundController;
use crate::state::{LoopPhase, RoundHint, SharedConsensusState};
use crate::vote::{Candidate, CandidateRequest, VoteMessage, VoteResultMessage};
use async_trait::async_trait;
use palisade_core::{Block, CommandId, PeerId};
use palisade_p2p::InboundMessage;
use std::collections::HashSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

/// Receiver shared across service restarts
pub type SharedInbox = Arc<Mutex<mpsc::Receiver<InboundMessage>>>;

pub type SharedResolutions = Arc<Mutex<mpsc::Receiver<StageResolution>>>;

pub struct VoteIngestion {
    state: SharedConsensusState,
    controller: SharedVoteController,
    ledger: SharedVoteLedger,
    relay: SharedMessageRelay,
    inbox: SharedInbox,
}

impl VoteIngestion {
    pub fn new(
        state: SharedConsensusState,
        controller: SharedVoteController,
        ledger: SharedVoteLedger,
        relay: SharedMessageRelay,
        inbox: SharedInbox,
    ) -> Self {
        Self {
            state,
            controller,
            ledger,
            relay,
            inbox,
        }
    }

    pub async fn handle(&self, message: InboundMessage) {
        if message.chain_id != self.state.chain_id {
            trace!("Dropping {} for chain {}", message.command, message.chain_id);
            return;
        }
        let InboundMessage {
            command,
            payload,
            origin,
            ..
        } = message;

        match command {
            CommandId::Vote => self.on_vote(&payload, &origin).await,
            CommandId::VoteResult => self.on_result(payload, &origin).await,
            CommandId::Block => self.on_block(payload, &origin).await,
            CommandId::GetCandidate => self.on_candidate_request(&payload, &origin).await,
        }
    }

    async fn on_vote(&self, payload: &[u8], origin: &PeerId) {
        let vote = match VoteMessage::decode(payload) {
            Ok(vote) => vote,
            Err(e) => {
                debug!("Undecodable vote from {}: {}", origin, e);
                return;
            }
        };

        match self.controller.submit_vote(vote.clone()) {
            Outcome::Accepted { .. } => {
                self.note_source(&vote, origin);
                self.relay.relay_vote(&vote, origin).await;
            }
            Outcome::Rejected(rejection) => log_rejection(&vote, rejection, origin),
        }
    }

    async fn on_result(&self, payload: Vec<u8>, origin: &PeerId) {
        if !self.relay.is_new_payload(&payload) {
            return;
        }
        let result = match VoteResultMessage::decode(&payload) {
            Ok(result) => result,
            Err(e) => {
                debug!("Undecodable vote result from {}: {}", origin, e);
                return;
            }
        };

        let threshold = match self.controller.certificate_threshold(&result.key) {
            Ok(threshold) => threshold,
            Err(rejection) => {
                debug!("Dropping result {} from {}: {}", result.key, origin, rejection);
                return;
            }
        };
        if result.votes.len() < threshold {
            debug!(
                "Dropping result {} from {}: {} votes, {} needed",
                result.key,
                origin,
                result.votes.len(),
                threshold
            );
            return;
        }
        let backs_result = |vote: &VoteMessage| {
            vote.key() == result.key && vote.stage == result.stage && vote.candidate == result.candidate
        };
        if !result.votes.iter().all(backs_result) {
            warn!("Dropping result {} from {}: votes for another stage or candidate", result.key, origin);
            return;
        }

        let mut accepted = 0;
        let mut backers = HashSet::new();
        for vote in &result.votes {
            match self.controller.submit_vote(vote.clone()) {
                Outcome::Accepted { .. } => {
                    accepted += 1;
                    backers.insert(vote.voter);
                }
                Outcome::Rejected(VoteRejection::DuplicateVote) => {
                    backers.insert(vote.voter);
                }
                Outcome::Rejected(rejection) => log_rejection(vote, rejection, origin),
            }
        }
        trace!(
            "Result {} stage {:?} from {}: {} new votes, {} valid",
            result.key,
            result.stage,
            origin,
            accepted,
            backers.len()
        );

        if backers.len() < threshold {
            debug!("Result {} from {} carries {} valid votes only", result.key, origin, backers.len());
            return;
        }
        if let Some(hash) = result.candidate.block_hash() {
            self.ledger.record_source(result.key.height, hash, origin.clone());
        }
        if accepted > 0 {
            self.relay.relay_result(payload, result.key.height, origin).await;
        }
    }

    async fn on_block(&self, payload: Vec<u8>, origin: &PeerId) {
        let block = match Block::from_bytes(&payload) {
            Ok(block) => block,
            Err(e) => {
                debug!("Undecodable block from {}: {}", origin, e);
                return;
            }
        };
        let height = block.height();

        match self.controller.submit_candidate(block, Some(origin)) {
            Ok(CandidateObservation::New) | Ok(CandidateObservation::Fork { .. }) => {
                self.relay.relay_block(payload, height, origin).await;
            }
            Ok(CandidateObservation::Known) => {}
            Err(VoteRejection::StaleVote) => trace!("Stale candidate #{} from {}", height, origin),
            Err(rejection) => warn!("Rejected candidate #{} from {}: {}", height, origin, rejection),
        }
    }

    async fn on_candidate_request(&self, payload: &[u8], origin: &PeerId) {
        let request = match CandidateRequest::decode(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("Undecodable candidate request from {}: {}", origin, e);
                return;
            }
        };
        if let Err(e) = self.relay.answer_candidate_request(request, origin).await {
            warn!("Failed to answer candidate request from {}: {}", origin, e);
        }
    }

    fn note_source(&self, vote: &VoteMessage, origin: &PeerId) {
        if let Candidate::Block(hash) = vote.candidate {
            self.ledger.record_source(vote.height, hash, origin.clone());
        }
    }
}

fn log_rejection(vote: &VoteMessage, rejection: VoteRejection, origin: &PeerId) {
    match rejection {
        VoteRejection::BadSignature | VoteRejection::UnauthorizedVoter => {
            warn!("Rejected vote {} from {} via {}: {}", vote.key(), vote.voter, origin, rejection)
        }
        _ => debug!("Rejected vote {} from {}: {}", vote.key(), vote.voter, rejection),
    }
}

#[async_trait]
impl Processor for VoteIngestion {
    fn name(&self) -> &'static str {
        "vote-ingestion"
    }

    async fn run(&mut self, ctx: &ProcessorContext) -> ControlFlow<()> {
        let message = {
            let mut inbox = self.inbox.lock().await;
            tokio::select! {
                message = inbox.recv() => message,
                _ = ctx.cancelled() => return ControlFlow::Break(()),
            }
        };

        match message {
            Some(message) => {
                self.handle(message).await;
                ControlFlow::Continue(())
            }
            None => {
                debug!("Inbound consensus queue closed");
                ControlFlow::Break(())
            }
        }
    }
}

pub struct ResultRelay {
    ledger: SharedVoteLedger,
    relay: SharedMessageRelay,
    resolutions: SharedResolutions,
}

impl ResultRelay {
    pub fn new(ledger: SharedVoteLedger, relay: SharedMessageRelay, resolutions: SharedResolutions) -> Self {
        Self {
            ledger,
            relay,
            resolutions,
        }
    }

    /// Certificate backing one resolution
    pub fn certificate(&self, resolution: &StageResolution) -> VoteResultMessage {
        VoteResultMessage {
            key: resolution.key,
            stage: resolution.stage,
            candidate: resolution.candidate,
            votes: self
                .ledger
                .stage_votes(&resolution.key, resolution.stage, resolution.candidate),
        }
    }
}

#[async_trait]
impl Processor for ResultRelay {
    fn name(&self) -> &'static str {
        "result-relay"
    }

    async fn run(&mut self, ctx: &ProcessorContext) -> ControlFlow<()> {
        let resolution = {
            let mut resolutions = self.resolutions.lock().await;
            tokio::select! {
                resolution = resolutions.recv() => resolution,
                _ = ctx.cancelled() => return ControlFlow::Break(()),
            }
        };
        let Some(resolution) = resolution else {
            return ControlFlow::Break(());
        };

        let certificate = self.certificate(&resolution);
        debug!(
            "{} stage {:?} resolved to {} with {} votes",
            resolution.key,
            resolution.stage,
            resolution.candidate,
            certificate.votes.len()
        );
        self.relay.broadcast_result(&certificate).await;
        ControlFlow::Continue(())
    }
}

pub struct FutureRoundProbe {
    state: SharedConsensusState,
    rounds: SharedRoundController,
    ledger: SharedVoteLedger,
}

impl FutureRoundProbe {
    pub fn new(state: SharedConsensusState, rounds: SharedRoundController, ledger: SharedVoteLedger) -> Self {
        Self { state, rounds, ledger }
    }

    fn threshold(&self, round_index: u64) -> Option<usize> {
        self.rounds
            .round_for(round_index)
            .ok()
            .map(|round| self.state.quorum_threshold(round.member_count()))
    }

    /// Compare ledger activity with the loop's position, once
    pub fn probe(&self) {
        let status = self.state.status();
        let active = self.state.active_height();
        if status.height != active || matches!(status.phase, LoopPhase::Idle | LoopPhase::Stopped) {
            return;
        }
        let ours = (status.round_index, status.sub_vote_round);
        let activity = self.ledger.activity();

        let ahead = activity
            .iter()
            .filter(|a| a.key.height == active && (a.key.round_index, a.key.sub_vote_round) > ours)
            .filter(|a| self.threshold(a.key.round_index).is_some_and(|t| a.voters >= t))
            .max_by_key(|a| a.key);
        if let Some(ahead) = ahead {
            info!(
                "Quorum of voters already at {} while this node is at round {} sub-round {}",
                ahead.key, status.round_index, status.sub_vote_round
            );
            self.state.set_hint(RoundHint {
                height: active,
                round_index: ahead.key.round_index,
                slot: ahead.slot.max(1),
                sub_vote_round: ahead.key.sub_vote_round,
            });
            self.rounds.cancel_waits();
            return;
        }

        let decided = self.ledger.stage_two_results(active);
        let decided_elsewhere = decided.iter().any(|(key, candidate)| {
            let at = (key.round_index, key.sub_vote_round);
            match candidate {
                Candidate::Block(_) => at != ours,
                Candidate::Empty => at > ours,
            }
        });
        if decided_elsewhere && matches!(status.phase, LoopPhase::StageOne | LoopPhase::StageTwo) {
            debug!("#{} decided under another key, waking the loop", active);
            self.rounds.cancel_waits();
            return;
        }

        // quorum two heights up means peers confirmed blocks this node lacks
        let further = activity
            .iter()
            .filter(|a| a.key.height > active + 1)
            .filter(|a| self.threshold(a.key.round_index).is_some_and(|t| a.voters >= t))
            .map(|a| a.key.height)
            .max();
        if let Some(height) = further {
            if decided.is_empty() && !self.state.is_behind() {
                warn!("Peers are voting at #{} while this node is at #{}", height, active);
                self.state.mark_behind(height - 1);
                self.rounds.cancel_waits();
            }
        }
    }
}

#[async_trait]
impl Processor for FutureRoundProbe {
    fn name(&self) -> &'static str {
        "future-round-probe"
    }

    async fn run(&mut self, ctx: &ProcessorContext) -> ControlFlow<()> {
        if !ctx.sleep(self.state.config.probe_interval()).await {
            return ControlFlow::Break(());
        }
        self.probe();
        ControlFlow::Continue(())
    }
}
