//! Consensus loop
//!
//! One state machine drives every height through
//! `WaitSync -> DetermineRound -> StageOne -> StageTwo -> Finalize`.
//! A stage-two timeout escalates the sub-vote-round; an `Empty` decision
//! hands the height to the next slot's producer.

use crate::controller::{Outcome, SharedVoteController};
use crate::error::StageWait;
use crate::ledger::SharedVoteLedger;
use crate::packer::{BlockCandidate, Packer};
use crate::processor::{Processor, ProcessorContext};
use crate::relay::SharedMessageRelay;
use crate::round::Round;
use crate::round_controller::SharedRoundController;
use crate::state::{ConsensusEvent, LoopPhase, LoopStatus, RoundHint, SharedConsensusState};
use crate::vote::{Candidate, VoteKey, VoteMessage, VoteStage};
use async_trait::async_trait;
use palisade_core::{Block, BlockHeader, BlockStore, Hash, Height, PalisadeError, PalisadeResult, SyncStatus, Timestamp};
use std::cmp::Reverse;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Where voting for a height currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub height: Height,
    pub round_index: u64,
    pub slot: u32,
    pub sub_vote_round: u8,
}

impl Position {
    pub fn at(key: VoteKey, slot: u32) -> Self {
        Self {
            height: key.height,
            round_index: key.round_index,
            slot,
            sub_vote_round: key.sub_vote_round,
        }
    }

    /// First position on top of `parent`
    pub fn after(parent: &BlockHeader) -> Self {
        let (round_index, slot) = if parent.closes_round() {
            (parent.round_index + 1, 1)
        } else {
            (parent.round_index, parent.packing_index + 1)
        };
        Self {
            height: parent.height + 1,
            round_index,
            slot,
            sub_vote_round: 1,
        }
    }

    /// Next producer after this slot was decided empty
    pub fn after_empty(&self, member_count: usize) -> Self {
        if self.slot as usize >= member_count || self.sub_vote_round == u8::MAX {
            self.next_round()
        } else {
            Self {
                slot: self.slot + 1,
                sub_vote_round: self.sub_vote_round + 1,
                ..*self
            }
        }
    }

    /// Same slot, one sub-vote-round later
    pub fn escalated(&self) -> Self {
        if self.sub_vote_round == u8::MAX {
            self.next_round()
        } else {
            Self {
                sub_vote_round: self.sub_vote_round + 1,
                ..*self
            }
        }
    }

    fn next_round(&self) -> Self {
        Self {
            round_index: self.round_index + 1,
            slot: 1,
            sub_vote_round: 1,
            ..*self
        }
    }

    pub fn key(&self) -> VoteKey {
        VoteKey::new(self.height, self.round_index, self.sub_vote_round)
    }
}

impl From<RoundHint> for Position {
    fn from(hint: RoundHint) -> Self {
        Self {
            height: hint.height,
            round_index: hint.round_index,
            slot: hint.slot,
            sub_vote_round: hint.sub_vote_round,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    WaitSync,
    DetermineRound(Option<Position>),
    StageOne(Position),
    StageTwo(Position, Candidate),
    Finalize(Position, Candidate),
}

pub struct ConsensusLoop {
    state: SharedConsensusState,
    rounds: SharedRoundController,
    controller: SharedVoteController,
    ledger: SharedVoteLedger,
    relay: SharedMessageRelay,
    packer: Packer,
    store: Arc<dyn BlockStore>,
    sync: Arc<dyn SyncStatus>,
    step: Step,
}

impl ConsensusLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        state: SharedConsensusState,
        rounds: SharedRoundController,
        controller: SharedVoteController,
        ledger: SharedVoteLedger,
        relay: SharedMessageRelay,
        packer: Packer,
        store: Arc<dyn BlockStore>,
        sync: Arc<dyn SyncStatus>,
    ) -> Self {
        Self {
            state,
            rounds,
            controller,
            ledger,
            relay,
            packer,
            store,
            sync,
            step: Step::WaitSync,
        }
    }

    fn poll_interval(&self) -> Duration {
        self.state.config.sync_poll_interval()
    }

    fn publish(&self, phase: LoopPhase, pos: &Position) {
        self.state.publish_status(LoopStatus {
            phase,
            height: pos.height,
            round_index: pos.round_index,
            slot: pos.slot,
            sub_vote_round: pos.sub_vote_round,
        });
    }

    /// Take over a height confirmed here or by the sync layer
    fn adopt_confirmed(&self, height: Height) {
        if height > self.state.last_confirmed() {
            self.state.set_last_confirmed(height);
            self.ledger.prune_heights(height);
            self.relay.prune(height);
        }
    }

    async fn wait_sync(&self, ctx: &ProcessorContext) -> Option<Step> {
        self.state.set_phase(LoopPhase::WaitSync);
        let chain_id = self.state.chain_id;

        match self.store.latest_block(chain_id).await {
            Ok(Some(latest)) => self.adopt_confirmed(latest.height()),
            Ok(None) => warn!("Block store holds no blocks"),
            Err(e) => error!("Failed to read latest block: {}", e),
        }

        let active = self.state.active_height();
        if !self.sync.is_synchronized(chain_id) {
            trace!("Waiting for chain sync");
        } else if self.state.is_behind() {
            trace!("Behind peers at #{}, waiting for sync", active);
        } else if !self.state.config.is_validator || !self.rounds.is_local_member(active) {
            trace!("Not a validator at #{}", active);
        } else {
            return Some(Step::DetermineRound(None));
        }
        ctx.sleep(self.poll_interval()).await.then_some(Step::WaitSync)
    }

    async fn determine_round(&self, ctx: &ProcessorContext, carried: Option<Position>) -> Option<Step> {
        self.state.set_phase(LoopPhase::DetermineRound);
        let active = self.state.active_height();

        let parent = match self.store.get_block(self.state.chain_id, active - 1).await {
            Ok(Some(block)) => block,
            Ok(None) => {
                warn!("Parent #{} missing from the block store", active - 1);
                return ctx.sleep(self.poll_interval()).await.then_some(Step::WaitSync);
            }
            Err(e) => {
                error!("Failed to read parent #{}: {}", active - 1, e);
                return ctx.sleep(self.poll_interval()).await.then_some(Step::WaitSync);
            }
        };

        let mut pos = carried
            .filter(|p| p.height == active)
            .or_else(|| self.state.take_hint(active).map(Position::from))
            .unwrap_or_else(|| Position::after(&parent.header));

        let round = match self.round_for_position(&mut pos, &parent) {
            Ok(round) => round,
            Err(e) => {
                debug!("No round for #{}: {}", active, e);
                return ctx.sleep(self.poll_interval()).await.then_some(Step::WaitSync);
            }
        };
        if pos.slot as usize > round.member_count() {
            return Some(Step::DetermineRound(Some(pos.next_round())));
        }

        let round = self.rounds.align_slot(pos.slot, Timestamp::now()).unwrap_or(round);
        let voting_window = self.state.config.stage_one_timeout_ms + self.state.config.stage_two_timeout_ms;
        self.state
            .record_deadline(active, round.slot_deadline(pos.slot).add_millis(voting_window));
        self.publish(LoopPhase::DetermineRound, &pos);
        debug!(
            "#{}: round {} slot {} sub-round {} (local slot {:?})",
            active,
            pos.round_index,
            pos.slot,
            pos.sub_vote_round,
            round.local_slot()
        );

        if round.is_local_slot(pos.slot) && !self.already_packed(&pos) {
            let wait = round.slot_start(pos.slot).duration_since(Timestamp::now());
            if !ctx.sleep(wait).await {
                return None;
            }
            if let Some(candidate) = self.packer.try_pack(&round, pos.slot, &parent).await {
                self.relay.broadcast_block(&candidate.block).await;
            }
        }
        Some(Step::StageOne(pos))
    }

    /// Install the round `pos` votes in
    fn round_for_position(&self, pos: &mut Position, parent: &Block) -> PalisadeResult<Arc<Round>> {
        if self.rounds.current().is_none() {
            let synced = self.sync.is_synchronized(self.state.chain_id);
            self.rounds.init_round(&parent.header, synced)?;
        }
        let current = self
            .rounds
            .current()
            .ok_or_else(|| PalisadeError::NoRound("no current round".into()))?;

        if pos.round_index < current.index {
            // the round moved on while this height was pending
            *pos = Position {
                round_index: current.index,
                slot: 1,
                sub_vote_round: 1,
                ..*pos
            };
            return Ok(current);
        }
        if pos.round_index == current.index {
            return Ok(current);
        }

        let lead = self.state.config.slot_interval_ms * pos.slot.saturating_sub(1) as u64;
        let start = Timestamp::from_millis(Timestamp::now().as_millis().saturating_sub(lead));
        let round = self.rounds.get_round(pos.round_index, start)?;
        self.rounds.switch_round(round.clone(), false);
        Ok(round)
    }

    fn already_packed(&self, pos: &Position) -> bool {
        self.ledger
            .candidates_for_slot(pos.height, pos.round_index, pos.slot)
            .iter()
            .any(|c| c.block.header.packer == self.state.local.public_key)
    }

    async fn stage_one(&self, ctx: &ProcessorContext, pos: Position) -> Option<Step> {
        self.publish(LoopPhase::StageOne, &pos);
        let deadline = self
            .rounds
            .round_for(pos.round_index)
            .map(|round| round.slot_deadline(pos.slot))
            .unwrap_or_else(|_| Timestamp::now());

        if !self.await_candidate(ctx, &pos, deadline).await? {
            return Some(self.on_round_changed(pos));
        }

        let choice = self.stage_one_choice(&pos).await;
        self.cast(&pos, VoteStage::One, choice).await;

        let timeout = self.state.config.stage_one_timeout();
        match self.wait_stage(ctx, pos.key(), VoteStage::One, timeout).await? {
            Ok(result) => Some(Step::StageTwo(pos, result)),
            Err(StageWait::Timeout) => {
                debug!("Stage one timed out at {}", pos.key());
                Some(Step::StageTwo(pos, Candidate::Empty))
            }
            Err(StageWait::RoundChanged) => Some(self.on_round_changed(pos)),
        }
    }

    /// Wait for a candidate of the current slot until `deadline`
    ///
    /// `None` on shutdown, `Some(false)` when the round changed.
    async fn await_candidate(&self, ctx: &ProcessorContext, pos: &Position, deadline: Timestamp) -> Option<bool> {
        let mut candidates = self.ledger.subscribe_candidates();
        let mut epoch = self.rounds.epoch();

        loop {
            if !self
                .ledger
                .candidates_for_slot(pos.height, pos.round_index, pos.slot)
                .is_empty()
            {
                return Some(true);
            }
            let remaining = deadline.duration_since(Timestamp::now());
            if remaining.is_zero() {
                return Some(true);
            }
            tokio::select! {
                changed = candidates.changed() => {
                    if changed.is_err() {
                        return Some(true);
                    }
                }
                _ = epoch.changed() => return Some(false),
                _ = tokio::time::sleep(remaining) => return Some(true),
                _ = ctx.cancelled() => return None,
            }
        }
    }

    /// Stage-one vote: the slot's candidate, the leading fork, or `Empty`
    async fn stage_one_choice(&self, pos: &Position) -> Candidate {
        let parent_hash = match self.store.get_block(self.state.chain_id, pos.height - 1).await {
            Ok(Some(parent)) => parent.hash,
            _ => return Candidate::Empty,
        };
        let candidates: Vec<BlockCandidate> = self
            .ledger
            .candidates_for_slot(pos.height, pos.round_index, pos.slot)
            .into_iter()
            .filter(|c| c.block.header.previous_hash == parent_hash)
            .collect();

        if candidates.len() > 1 {
            warn!(
                "{} forked candidates for #{} slot {}, following the stage-one leader",
                candidates.len(),
                pos.height,
                pos.slot
            );
        }
        let key = pos.key();
        candidates
            .iter()
            .max_by_key(|c| {
                let tally = self.ledger.tally(&key, VoteStage::One, Candidate::Block(c.hash));
                (tally, Reverse(c.hash))
            })
            .map(|c| Candidate::Block(c.hash))
            .unwrap_or(Candidate::Empty)
    }

    async fn stage_two(&self, ctx: &ProcessorContext, pos: Position, stage_one: Candidate) -> Option<Step> {
        self.publish(LoopPhase::StageTwo, &pos);
        self.cast(&pos, VoteStage::Two, stage_one).await;

        let timeout = self.state.config.stage_two_timeout();
        match self.wait_stage(ctx, pos.key(), VoteStage::Two, timeout).await? {
            Ok(result) => Some(Step::Finalize(pos, result)),
            Err(StageWait::Timeout) => Some(self.reconcile(&pos).unwrap_or_else(|| self.escalate(pos))),
            Err(StageWait::RoundChanged) => Some(self.on_round_changed(pos)),
        }
    }

    fn escalate(&self, pos: Position) -> Step {
        let next = pos.escalated();
        info!(
            "Stage two timed out at {}, continuing at round {} sub-round {}",
            pos.key(),
            next.round_index,
            next.sub_vote_round
        );
        self.state
            .emit_event(ConsensusEvent::SubRoundEscalated { key: pos.key() });

        let voting_window = self.state.config.stage_one_timeout_ms + self.state.config.stage_two_timeout_ms;
        self.state
            .record_deadline(pos.height, Timestamp::now().add_millis(voting_window));

        if next.round_index == pos.round_index {
            Step::StageOne(next)
        } else {
            Step::DetermineRound(Some(next))
        }
    }

    fn on_round_changed(&self, pos: Position) -> Step {
        debug!("Round changed while voting at {}", pos.key());
        self.reconcile(&pos).unwrap_or(Step::DetermineRound(Some(pos)))
    }

    /// Catch up with decisions made while this node was waiting elsewhere
    fn reconcile(&self, pos: &Position) -> Option<Step> {
        if self.state.last_confirmed() >= pos.height {
            return Some(Step::WaitSync);
        }

        let decided = self.ledger.stage_two_results(pos.height);
        if let Some((key, candidate)) = decided.iter().find(|(_, c)| c.block_hash().is_some()) {
            let slot = self.ledger.key_slot(key).unwrap_or(pos.slot);
            return Some(Step::Finalize(Position::at(*key, slot), *candidate));
        }

        let ours = (pos.round_index, pos.sub_vote_round);
        let latest_empty = decided
            .iter()
            .filter(|(key, _)| (key.round_index, key.sub_vote_round) >= ours)
            .max_by_key(|(key, _)| *key);
        if let Some((key, candidate)) = latest_empty {
            let slot = self.ledger.key_slot(key).unwrap_or(pos.slot);
            return Some(Step::Finalize(Position::at(*key, slot), *candidate));
        }

        self.state
            .take_hint(pos.height)
            .map(|hint| Step::DetermineRound(Some(hint.into())))
    }

    async fn finalize(&self, ctx: &ProcessorContext, pos: Position, decision: Candidate) -> Option<Step> {
        self.publish(LoopPhase::Finalize, &pos);
        match decision {
            Candidate::Block(hash) => self.confirm(ctx, pos, hash).await,
            Candidate::Empty => {
                info!(
                    "#{}: slot {} of round {} decided empty",
                    pos.height, pos.slot, pos.round_index
                );
                self.state.emit_event(ConsensusEvent::SlotSkipped {
                    height: pos.height,
                    round_index: pos.round_index,
                    slot: pos.slot,
                });
                let members = self
                    .rounds
                    .round_for(pos.round_index)
                    .map(|round| round.member_count())
                    .unwrap_or(0);
                Some(Step::DetermineRound(Some(pos.after_empty(members))))
            }
        }
    }

    async fn confirm(&self, ctx: &ProcessorContext, pos: Position, hash: Hash) -> Option<Step> {
        let chain_id = self.state.chain_id;
        if self.state.last_confirmed() >= pos.height {
            return Some(Step::WaitSync);
        }

        let block = match self.ledger.candidate(pos.height, &hash) {
            Some(candidate) => candidate.block,
            None => match self.fetch_candidate(ctx, pos.height, hash).await? {
                Some(block) => block,
                None => {
                    // the sync layer may have stored the height meanwhile
                    if let Ok(Some(_)) = self.store.get_block(chain_id, pos.height).await {
                        self.adopt_confirmed(pos.height);
                        return Some(Step::WaitSync);
                    }
                    return Some(Step::Finalize(pos, Candidate::Block(hash)));
                }
            },
        };

        match self.store.save_block(chain_id, &block).await {
            Ok(true) => {}
            Ok(false) => warn!("#{} already stored, keeping the stored block", pos.height),
            Err(e) => {
                error!("Failed to save block #{}: {}", pos.height, e);
                return ctx
                    .sleep(self.poll_interval())
                    .await
                    .then_some(Step::Finalize(pos, Candidate::Block(hash)));
            }
        }

        self.adopt_confirmed(pos.height);
        info!(
            "Confirmed block #{} {} (round {}, slot {}, sub-round {})",
            pos.height, hash, block.header.round_index, block.header.packing_index, pos.sub_vote_round
        );
        self.state.emit_event(ConsensusEvent::BlockConfirmed {
            height: pos.height,
            hash,
            round_index: block.header.round_index,
            slot: block.header.packing_index,
        });
        Some(Step::DetermineRound(None))
    }

    /// Ask the peer that vouched for `hash` and wait for the block
    ///
    /// `None` on shutdown, `Some(None)` when the block did not arrive in time.
    async fn fetch_candidate(&self, ctx: &ProcessorContext, height: Height, hash: Hash) -> Option<Option<Block>> {
        let Some(peer) = self.ledger.source(&hash) else {
            warn!("Block #{} {} was decided but no peer is known to have it", height, hash);
            return ctx.sleep(self.poll_interval()).await.then_some(None);
        };
        if let Err(e) = self.relay.request_candidate(height, hash, &peer).await {
            warn!("Candidate request to {} failed: {}", peer, e);
        }

        let mut candidates = self.ledger.subscribe_candidates();
        let deadline = tokio::time::Instant::now() + self.state.config.stage_two_timeout();
        loop {
            if let Some(candidate) = self.ledger.candidate(height, &hash) {
                return Some(Some(candidate.block));
            }
            tokio::select! {
                changed = candidates.changed() => {
                    if changed.is_err() {
                        return Some(None);
                    }
                }
                _ = tokio::time::sleep_until(deadline) => return Some(None),
                _ = ctx.cancelled() => return None,
            }
        }
    }

    async fn cast(&self, pos: &Position, stage: VoteStage, candidate: Candidate) {
        let key = pos.key();
        let local = self.state.local.public_key;
        if let Some(prior) = self.ledger.vote_of(&key, stage, &local) {
            trace!("Already voted {} at {} stage {:?}", prior, key, stage);
            return;
        }

        let unsigned = VoteMessage::unsigned(key, pos.slot, stage, candidate, local);
        match self.relay.sign_and_broadcast(unsigned).await {
            Ok(Outcome::Accepted { .. }) => {}
            Ok(Outcome::Rejected(_)) => {}
            Err(e) => error!("Failed to cast vote at {}: {}", key, e),
        }
    }

    async fn wait_stage(
        &self,
        ctx: &ProcessorContext,
        key: VoteKey,
        stage: VoteStage,
        timeout: Duration,
    ) -> Option<Result<Candidate, StageWait>> {
        tokio::select! {
            result = self.controller.await_stage_result(key, stage, timeout) => Some(result),
            _ = ctx.cancelled() => None,
        }
    }
}

#[async_trait]
impl Processor for ConsensusLoop {
    fn name(&self) -> &'static str {
        "consensus-loop"
    }

    async fn run(&mut self, ctx: &ProcessorContext) -> ControlFlow<()> {
        let next = match self.step {
            Step::WaitSync => self.wait_sync(ctx).await,
            Step::DetermineRound(carried) => self.determine_round(ctx, carried).await,
            Step::StageOne(pos) => self.stage_one(ctx, pos).await,
            Step::StageTwo(pos, stage_one) => self.stage_two(ctx, pos, stage_one).await,
            Step::Finalize(pos, decision) => self.finalize(ctx, pos, decision).await,
        };

        match next {
            Some(step) => {
                self.step = step;
                ControlFlow::Continue(())
            }
            None => {
                self.state.set_phase(LoopPhase::Stopped);
                ControlFlow::Break(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{genesis, Harness};
    use crate::processor::TaskSupervisor;
    use palisade_core::PublicKey;

    fn header(round_index: u64, packing_index: u32, member_count: u32) -> BlockHeader {
        BlockHeader {
            round_index,
            packing_index,
            member_count,
            height: 9,
            ..genesis().header
        }
    }

    #[test]
    fn test_position_after_parent() {
        let genesis_next = Position::after(&genesis().header);
        assert_eq!((genesis_next.height, genesis_next.round_index, genesis_next.slot), (1, 1, 1));

        let mid = Position::after(&header(4, 2, 5));
        assert_eq!((mid.height, mid.round_index, mid.slot, mid.sub_vote_round), (10, 4, 3, 1));

        let last = Position::after(&header(4, 5, 5));
        assert_eq!((last.round_index, last.slot), (5, 1));
    }

    #[test]
    fn test_position_after_empty_slot() {
        let pos = Position {
            height: 3,
            round_index: 2,
            slot: 2,
            sub_vote_round: 1,
        };
        let next = pos.after_empty(4);
        assert_eq!((next.round_index, next.slot, next.sub_vote_round), (2, 3, 2));

        let end = Position { slot: 4, ..pos }.after_empty(4);
        assert_eq!((end.height, end.round_index, end.slot, end.sub_vote_round), (3, 3, 1, 1));
    }

    #[test]
    fn test_escalation() {
        let pos = Position {
            height: 3,
            round_index: 2,
            slot: 2,
            sub_vote_round: 1,
        };
        assert_eq!(pos.escalated().sub_vote_round, 2);
        assert_eq!(pos.escalated().key(), VoteKey::new(3, 2, 2));

        let saturated = Position {
            sub_vote_round: u8::MAX,
            ..pos
        }
        .escalated();
        assert_eq!((saturated.round_index, saturated.slot, saturated.sub_vote_round), (3, 1, 1));
    }

    /// A harness whose local validator does not produce slot 1 of round 1
    fn follower_harness() -> Harness {
        let reference = Harness::new(4, 0);
        let round = reference.round_starting_at(1, genesis().header.timestamp);
        let producer: PublicKey = round.member_at(1).unwrap().entry.public_key;
        let local = reference
            .keys
            .iter()
            .position(|kp| kp.public_key() != producer)
            .unwrap();
        Harness::new(4, local)
    }

    fn other_voters(harness: &Harness, exclude: PublicKey, count: usize) -> Vec<usize> {
        (0..harness.keys.len())
            .filter(|i| {
                let pk = harness.keys[*i].public_key();
                pk != harness.local.public_key() && pk != exclude
            })
            .take(count)
            .collect()
    }

    async fn next_matching(harness: &Harness, pred: impl Fn(&ConsensusEvent) -> bool) -> ConsensusEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(event) = harness.drain_events().into_iter().find(|e| pred(e)) {
                    return event;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_silent_producer_slot_decided_empty() {
        let harness = follower_harness();
        let round = harness.round_starting_at(1, genesis().header.timestamp);
        let producer = round.member_at(1).unwrap().entry.public_key;
        let key = VoteKey::new(1, 1, 1);

        // the producer stays silent; two peers time out and vote empty
        for voter in other_voters(&harness, producer, 2) {
            for stage in [VoteStage::One, VoteStage::Two] {
                let vote = harness.signed_vote(voter, key, 1, stage, Candidate::Empty);
                assert!(harness.controller.submit_vote(vote).is_accepted());
            }
        }

        let mut supervisor = TaskSupervisor::new(Duration::from_millis(200));
        supervisor.spawn(harness.consensus_loop());

        let skipped = next_matching(&harness, |e| matches!(e, ConsensusEvent::SlotSkipped { .. })).await;
        assert_eq!(
            skipped,
            ConsensusEvent::SlotSkipped {
                height: 1,
                round_index: 1,
                slot: 1
            }
        );
        assert_eq!(
            harness
                .ledger
                .vote_of(&key, VoteStage::One, &harness.local.public_key()),
            Some(Candidate::Empty)
        );
        assert_eq!(harness.state.last_confirmed(), 0);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_candidate_confirmed_after_two_stages() {
        let harness = follower_harness();
        let round = harness.round_starting_at(1, genesis().header.timestamp);
        let producer = round.member_at(1).unwrap().entry.public_key;
        let block = harness.signed_block(&round, 1, &genesis(), 9);
        let key = VoteKey::new(1, 1, 1);

        harness.controller.submit_candidate(block.clone(), None).unwrap();
        for voter in other_voters(&harness, producer, 2) {
            for stage in [VoteStage::One, VoteStage::Two] {
                let vote = harness.signed_vote(voter, key, 1, stage, Candidate::Block(block.hash));
                assert!(harness.controller.submit_vote(vote).is_accepted());
            }
        }

        let mut supervisor = TaskSupervisor::new(Duration::from_millis(200));
        supervisor.spawn(harness.consensus_loop());

        let confirmed = next_matching(&harness, |e| matches!(e, ConsensusEvent::BlockConfirmed { .. })).await;
        assert_eq!(
            confirmed,
            ConsensusEvent::BlockConfirmed {
                height: 1,
                hash: block.hash,
                round_index: 1,
                slot: 1
            }
        );
        assert_eq!(
            harness.store.get_block(harness.state.chain_id, 1).await.unwrap(),
            Some(block)
        );
        assert_eq!(harness.state.last_confirmed(), 1);
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_split_vote_escalates_sub_round() {
        let harness = follower_harness();
        let round = harness.round_starting_at(1, genesis().header.timestamp);
        let producer = round.member_at(1).unwrap().entry.public_key;
        let block = harness.signed_block(&round, 1, &genesis(), 9);
        let key = VoteKey::new(1, 1, 1);

        // stage one splits, so nobody reaches a stage-two quorum
        harness.controller.submit_candidate(block.clone(), None).unwrap();
        let voters = other_voters(&harness, producer, 2);
        let one = harness.signed_vote(voters[0], key, 1, VoteStage::Two, Candidate::Empty);
        let two = harness.signed_vote(voters[1], key, 1, VoteStage::Two, Candidate::Block(block.hash));
        harness.controller.submit_vote(one);
        harness.controller.submit_vote(two);

        let mut supervisor = TaskSupervisor::new(Duration::from_millis(200));
        supervisor.spawn(harness.consensus_loop());

        let escalated = next_matching(&harness, |e| matches!(e, ConsensusEvent::SubRoundEscalated { .. })).await;
        assert_eq!(escalated, ConsensusEvent::SubRoundEscalated { key });

        // voting restarts at the same height one sub-vote-round later
        let next = VoteKey::new(1, 1, 2);
        let local = harness.local.public_key();
        let revote = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(candidate) = harness.ledger.vote_of(&next, VoteStage::One, &local) {
                    return candidate;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(revote, Candidate::Block(block.hash));
        assert_eq!(harness.state.last_confirmed(), 0);
        supervisor.shutdown().await;
    }
}
