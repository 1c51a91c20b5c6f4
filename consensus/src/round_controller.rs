//! Round lifecycle
//!
//! Owns the current and previous round, caches computed rounds and publishes
//! a cancellation epoch that every stage wait listens to.

use crate::ledger::SharedVoteLedger;
use crate::round::{compute_round, Round};
use crate::state::{ConsensusEvent, SharedConsensusState};
use palisade_core::{
    BlockHeader, Height, PalisadeError, PalisadeResult, Timestamp, ValidatorSetEntry, ValidatorSource,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// Computed rounds kept around for late votes
const ROUND_CACHE_SIZE: usize = 8;

pub struct RoundController {
    state: SharedConsensusState,
    ledger: SharedVoteLedger,
    validators: RwLock<Arc<Vec<ValidatorSetEntry>>>,
    current: RwLock<Option<Arc<Round>>>,
    previous: RwLock<Option<Arc<Round>>>,
    cache: Mutex<BTreeMap<u64, Arc<Round>>>,
    epoch: watch::Sender<u64>,
}

pub type SharedRoundController = Arc<RoundController>;

impl RoundController {
    pub fn new(state: SharedConsensusState, ledger: SharedVoteLedger, validators: Vec<ValidatorSetEntry>) -> Self {
        let (epoch, _) = watch::channel(0);
        Self {
            state,
            ledger,
            validators: RwLock::new(Arc::new(validators)),
            current: RwLock::new(None),
            previous: RwLock::new(None),
            cache: Mutex::new(BTreeMap::new()),
            epoch,
        }
    }

    /// Compute and install the round that follows `anchor`
    pub fn init_round(&self, anchor: &BlockHeader, synced: bool) -> PalisadeResult<Arc<Round>> {
        if !synced {
            return Err(PalisadeError::NoRound("chain not synchronized".into()));
        }

        let (index, start) = if anchor.height == 0 || anchor.closes_round() {
            (anchor.round_index + 1, anchor.timestamp)
        } else {
            (anchor.round_index, anchor.round_start)
        };

        let round = self.get_round(index, start)?;
        if round.local_member().is_none() {
            return Err(PalisadeError::NoRound(format!(
                "local node is not a member of round {}",
                index
            )));
        }

        self.switch_round(round.clone(), true);
        info!(
            "Initialized round {} with {} members (local slot {:?})",
            round.index,
            round.member_count(),
            round.local_slot()
        );
        Ok(round)
    }

    /// Install `round`
    ///
    /// Rounds only move forward unless `force` is set. Moving to a higher
    /// index prunes ledger rounds older than the previous one and cancels
    /// every pending stage wait.
    pub fn switch_round(&self, round: Arc<Round>, force: bool) -> bool {
        let mut current = self.current.write();
        let current_index = current.as_ref().map(|r| r.index);

        match current_index {
            Some(index) if round.index <= index && !force => return false,
            Some(index) if round.index == index => {
                // same round, new schedule: waits stay valid
                debug!("Round {} delayed to {}ms", index, round.delay_ms);
                *current = Some(round.clone());
                drop(current);
                self.cache.lock().insert(round.index, round);
                return true;
            }
            _ => {}
        }

        let from = current_index.unwrap_or(0);
        let to = round.index;
        *self.previous.write() = current.take();
        *current = Some(round.clone());
        drop(current);

        self.remember(round);
        if to > from {
            self.ledger.prune_rounds_below(to.saturating_sub(1));
        }
        self.epoch.send_modify(|epoch| *epoch += 1);

        if from != 0 {
            info!("Switched round {} -> {}", from, to);
            self.state.emit_event(ConsensusEvent::RoundSwitched { from, to });
        }
        true
    }

    /// Round `index` starting at `start_time`
    ///
    /// Membership is anchored at the height being decided, the same height
    /// `is_local_member` is asked about before voting.
    pub fn get_round(&self, index: u64, start_time: Timestamp) -> PalisadeResult<Arc<Round>> {
        if let Some(round) = self.cache.lock().get(&index) {
            if round.start_time == start_time {
                return Ok(round.clone());
            }
        }

        let snapshot = self.validators.read().clone();
        let round = Arc::new(compute_round(
            &snapshot,
            index,
            self.state.active_height(),
            start_time,
            self.state.config.slot_interval_ms,
            Some(&self.state.local.packing_address),
        )?);
        self.remember(round.clone());
        Ok(round)
    }

    /// Any round with this index, for membership checks
    pub fn round_for(&self, index: u64) -> PalisadeResult<Arc<Round>> {
        if let Some(round) = self.current().filter(|r| r.index == index) {
            return Ok(round);
        }
        if let Some(round) = self.previous.read().clone().filter(|r| r.index == index) {
            return Ok(round);
        }
        if let Some(round) = self.cache.lock().get(&index) {
            return Ok(round.clone());
        }
        self.get_round(index, Timestamp::now())
    }

    /// Current round, delayed so that `slot` does not start in the past
    pub fn align_slot(&self, slot: u32, now: Timestamp) -> Option<Arc<Round>> {
        let round = self.current()?;
        let start = round.slot_start(slot);
        if start >= now {
            return Some(round);
        }

        let delayed = Arc::new(round.delayed(now.as_millis() - start.as_millis()));
        self.switch_round(delayed.clone(), true);
        Some(delayed)
    }

    pub fn current(&self) -> Option<Arc<Round>> {
        self.current.read().clone()
    }

    pub fn previous(&self) -> Option<Arc<Round>> {
        self.previous.read().clone()
    }

    /// Replace the validator snapshot
    pub async fn refresh_validators(&self, source: &dyn ValidatorSource) -> PalisadeResult<usize> {
        let entries = source.current_validators(self.state.chain_id).await?;
        let count = entries.len();
        self.set_validators(entries);
        Ok(count)
    }

    pub fn set_validators(&self, entries: Vec<ValidatorSetEntry>) {
        *self.validators.write() = Arc::new(entries);
        self.cache.lock().clear();
    }

    pub fn validators(&self) -> Arc<Vec<ValidatorSetEntry>> {
        self.validators.read().clone()
    }

    pub fn is_local_member(&self, height: Height) -> bool {
        self.validators
            .read()
            .iter()
            .any(|e| e.packing_address == self.state.local.packing_address && e.is_active_at(height))
    }

    /// Wake every stage wait without changing rounds
    pub fn cancel_waits(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    pub fn epoch(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }

    fn remember(&self, round: Arc<Round>) {
        let mut cache = self.cache.lock();
        cache.insert(round.index, round);
        while cache.len() > ROUND_CACHE_SIZE {
            cache.pop_first();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{genesis, Harness};
    use palisade_chain::StakingEvent;

    #[test]
    fn test_init_from_genesis() {
        let harness = Harness::new(4, 0);
        let round = harness.rounds.init_round(&genesis().header, true).unwrap();

        assert_eq!(round.index, 1);
        assert_eq!(round.start_time, genesis().header.timestamp);
        assert!(round.local_member().is_some());
        assert_eq!(harness.rounds.current().unwrap().index, 1);
    }

    #[test]
    fn test_init_requires_sync_and_membership() {
        let harness = Harness::new(4, 0);
        assert!(matches!(
            harness.rounds.init_round(&genesis().header, false),
            Err(PalisadeError::NoRound(_))
        ));

        let outsider = Harness::outsider(4);
        assert!(matches!(
            outsider.rounds.init_round(&genesis().header, true),
            Err(PalisadeError::NoRound(_))
        ));
    }

    #[test]
    fn test_init_continues_open_round() {
        let harness = Harness::new(4, 0);
        let mut header = genesis().header;
        header.height = 6;
        header.round_index = 3;
        header.member_count = 4;
        header.packing_index = 2;
        header.round_start = Timestamp::from_millis(5_000);

        let round = harness.rounds.init_round(&header, true).unwrap();
        assert_eq!(round.index, 3);
        assert_eq!(round.start_time, Timestamp::from_millis(5_000));

        header.packing_index = 4;
        header.timestamp = Timestamp::from_millis(9_000);
        let next = harness.rounds.init_round(&header, true).unwrap();
        assert_eq!(next.index, 4);
        assert_eq!(next.start_time, Timestamp::from_millis(9_000));
    }

    #[tokio::test]
    async fn test_switch_is_monotonic() {
        let harness = Harness::new(4, 0);
        let epoch = harness.rounds.epoch();
        let r3 = harness.rounds.get_round(3, Timestamp::from_millis(0)).unwrap();
        let r2 = harness.rounds.get_round(2, Timestamp::from_millis(0)).unwrap();

        assert!(harness.rounds.switch_round(r3.clone(), false));
        assert!(!harness.rounds.switch_round(r2.clone(), false));
        assert!(!harness.rounds.switch_round(r3.clone(), false));
        assert_eq!(harness.rounds.current().unwrap().index, 3);
        assert_eq!(*epoch.borrow(), 1);

        let r4 = harness.rounds.get_round(4, Timestamp::from_millis(0)).unwrap();
        assert!(harness.rounds.switch_round(r4, false));
        assert_eq!(harness.rounds.previous().unwrap().index, 3);
        assert_eq!(*epoch.borrow(), 2);

        assert!(harness.rounds.switch_round(r2, true));
        assert_eq!(harness.rounds.current().unwrap().index, 2);
    }

    #[test]
    fn test_switch_prunes_old_rounds() {
        use crate::fixtures::test_vote;
        use crate::vote::{Candidate, VoteKey, VoteStage};

        let harness = Harness::new(4, 0);
        for round in 1..=4u64 {
            harness
                .ledger
                .insert(test_vote(VoteKey::new(1, round, 1), VoteStage::One, Candidate::Empty, 1), 3);
        }
        let r5 = harness.rounds.get_round(5, Timestamp::from_millis(0)).unwrap();
        harness.rounds.switch_round(r5, false);

        let rounds: Vec<u64> = harness.ledger.activity().iter().map(|a| a.key.round_index).collect();
        assert_eq!(rounds, vec![4]);
    }

    #[test]
    fn test_align_slot_delays_without_new_epoch() {
        let harness = Harness::new(4, 0);
        let epoch = harness.rounds.epoch();
        let round = harness.rounds.init_round(&genesis().header, true).unwrap();
        let before = *epoch.borrow();

        let now = round.slot_start(2).add_millis(750);
        let aligned = harness.rounds.align_slot(2, now).unwrap();
        assert_eq!(aligned.index, round.index);
        assert_eq!(aligned.slot_start(2), now);
        assert_eq!(harness.rounds.current().unwrap().delay_ms, 750);
        assert_eq!(*epoch.borrow(), before);

        let future = aligned.slot_start(3);
        let unchanged = harness.rounds.align_slot(3, future.add_millis(0)).unwrap();
        assert_eq!(unchanged.delay_ms, 750);
    }

    #[test]
    fn test_round_cache_is_bounded() {
        let harness = Harness::new(4, 0);
        for index in 0..20 {
            harness.rounds.get_round(index, Timestamp::from_millis(0)).unwrap();
        }
        assert!(harness.rounds.cache.lock().len() <= ROUND_CACHE_SIZE);
        assert_eq!(harness.rounds.round_for(19).unwrap().index, 19);
    }

    #[tokio::test]
    async fn test_refresh_replaces_snapshot() {
        let harness = Harness::new(4, 0);
        assert!(harness.rounds.is_local_member(1));

        let exit = StakingEvent::Exit {
            packing_address: harness.local_address(),
            height: 1,
        };
        harness.registry.apply(exit).unwrap();
        harness.rounds.refresh_validators(harness.registry.as_ref()).await.unwrap();
        assert!(!harness.rounds.is_local_member(1));
        assert!(harness.rounds.is_local_member(0));
    }

    #[test]
    fn test_validator_joining_at_active_height_gets_a_round() {
        let harness = Harness::new(4, 0);
        let local = harness.local_address();
        let entries = harness
            .rounds
            .validators()
            .iter()
            .cloned()
            .map(|mut entry| {
                if entry.packing_address == local {
                    entry.join_height = harness.state.active_height();
                }
                entry
            })
            .collect();
        harness.rounds.set_validators(entries);

        assert!(harness.rounds.is_local_member(harness.state.active_height()));
        let round = harness.rounds.init_round(&genesis().header, true).unwrap();
        assert!(round.local_member().is_some());
        assert_eq!(round.member_count(), 4);
    }
}
