//! Outbound message handling
//!
//! Signs local votes, gossips accepted remote traffic onward and answers
//! candidate requests. Results and blocks are relayed once per payload.

use crate::controller::{Outcome, SharedVoteController};
use crate::ledger::SharedVoteLedger;
use crate::state::SharedConsensusState;
use crate::vote::{CandidateRequest, VoteMessage, VoteResultMessage};
use palisade_core::{Block, BlockStore, CommandId, Hash, Height, Network, PalisadeResult, PeerId, Signer, Timestamp};
use palisade_crypto::hashing::hash;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct MessageRelay {
    state: SharedConsensusState,
    controller: SharedVoteController,
    ledger: SharedVoteLedger,
    network: Arc<dyn Network>,
    signer: Arc<dyn Signer>,
    store: Arc<dyn BlockStore>,
    /// Payload hash -> height, for result and block dedup
    seen: Mutex<HashMap<Hash, Height>>,
}

pub type SharedMessageRelay = Arc<MessageRelay>;

impl MessageRelay {
    pub fn new(
        state: SharedConsensusState,
        controller: SharedVoteController,
        ledger: SharedVoteLedger,
        network: Arc<dyn Network>,
        signer: Arc<dyn Signer>,
        store: Arc<dyn BlockStore>,
    ) -> Self {
        Self {
            state,
            controller,
            ledger,
            network,
            signer,
            store,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Sign a local vote, record it and broadcast it
    pub async fn sign_and_broadcast(&self, unsigned: VoteMessage) -> PalisadeResult<Outcome> {
        let chain_id = self.state.chain_id;
        let digest = unsigned.digest(chain_id);
        let signature = self
            .signer
            .sign(chain_id, &self.state.local.packing_address, &digest)
            .await?;

        let mut vote = unsigned;
        vote.signature = signature;
        vote.local_origin = true;

        let outcome = self.controller.submit_vote(vote.clone());
        if let Outcome::Rejected(rejection) = outcome {
            // a rejected local vote is not worth gossiping
            warn!("Local vote {} stage {:?} rejected: {}", vote.key(), vote.stage, rejection);
            return Ok(outcome);
        }

        debug!("Voting {} at {} stage {:?}", vote.candidate, vote.key(), vote.stage);
        self.network
            .broadcast(chain_id, CommandId::Vote, vote.encode(), None)
            .await?;
        Ok(outcome)
    }

    /// Whether traffic for `height` is still worth forwarding
    pub fn within_cutoff(&self, height: Height) -> bool {
        match self.state.deadline(height) {
            Some(deadline) => {
                Timestamp::now() <= deadline.add_millis(self.state.config.relay_cutoff_secs * 1_000)
            }
            None => height > self.state.last_confirmed(),
        }
    }

    /// Forward an accepted remote vote
    pub async fn relay_vote(&self, vote: &VoteMessage, origin: &PeerId) {
        if !self.within_cutoff(vote.height) {
            debug!("Not relaying vote for #{} past cutoff", vote.height);
            return;
        }
        self.forward(CommandId::Vote, vote.encode(), Some(origin)).await;
    }

    pub async fn broadcast_result(&self, result: &VoteResultMessage) {
        let payload = result.encode();
        if self.mark_seen(&payload, result.key.height) {
            self.forward(CommandId::VoteResult, payload, None).await;
        }
    }

    /// Forward a result payload once; `false` if it was already handled
    pub async fn relay_result(&self, payload: Vec<u8>, height: Height, origin: &PeerId) -> bool {
        if !self.mark_seen(&payload, height) {
            return false;
        }
        if self.within_cutoff(height) {
            self.forward(CommandId::VoteResult, payload, Some(origin)).await;
        }
        true
    }

    pub async fn broadcast_block(&self, block: &Block) {
        match block.to_bytes() {
            Ok(payload) => {
                if self.mark_seen(&payload, block.height()) {
                    self.forward(CommandId::Block, payload, None).await;
                }
            }
            Err(e) => warn!("Failed to encode block #{}: {}", block.height(), e),
        }
    }

    pub async fn relay_block(&self, payload: Vec<u8>, height: Height, origin: &PeerId) {
        if self.mark_seen(&payload, height) && self.within_cutoff(height) {
            self.forward(CommandId::Block, payload, Some(origin)).await;
        }
    }

    /// First sighting of `payload`?
    pub fn is_new_payload(&self, payload: &[u8]) -> bool {
        !self.seen.lock().contains_key(&hash(payload))
    }

    fn mark_seen(&self, payload: &[u8], height: Height) -> bool {
        self.seen.lock().insert(hash(payload), height).is_none()
    }

    /// Ask `peer` for a block we hold votes for but never received
    pub async fn request_candidate(&self, height: Height, block_hash: Hash, peer: &PeerId) -> PalisadeResult<()> {
        debug!("Requesting candidate #{} {} from {}", height, block_hash, peer);
        let request = CandidateRequest {
            height,
            hash: block_hash,
        };
        self.network
            .send_to_peer(self.state.chain_id, request.encode(), peer, CommandId::GetCandidate)
            .await
    }

    /// Reply to a candidate request from the ledger or the block store
    pub async fn answer_candidate_request(&self, request: CandidateRequest, origin: &PeerId) -> PalisadeResult<bool> {
        let chain_id = self.state.chain_id;
        let block = match self.ledger.candidate(request.height, &request.hash) {
            Some(candidate) => Some(candidate.block),
            None => self
                .store
                .get_block(chain_id, request.height)
                .await?
                .filter(|b| b.hash == request.hash),
        };

        let Some(block) = block else {
            debug!("No candidate #{} {} for {}", request.height, request.hash, origin);
            return Ok(false);
        };
        self.network
            .send_to_peer(chain_id, block.to_bytes()?, origin, CommandId::Block)
            .await?;
        Ok(true)
    }

    /// Forget dedup entries at or below a confirmed height
    pub fn prune(&self, confirmed: Height) {
        self.seen.lock().retain(|_, height| *height > confirmed);
    }

    async fn forward(&self, command: CommandId, payload: Vec<u8>, exclude: Option<&PeerId>) {
        if let Err(e) = self
            .network
            .broadcast(self.state.chain_id, command, payload, exclude)
            .await
        {
            warn!("Failed to broadcast {}: {}", command, e);
        }
    }
}
