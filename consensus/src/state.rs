//! Shared consensus state
//!
//! One `ConsensusState` per service instance. Every component reads the
//! configuration, the local identity and the confirmed height from here
//! instead of process-wide statics.

use crate::vote::{Candidate, VoteKey, VoteStage};
use palisade_core::{Address, ChainId, ConsensusConfig, Hash, Height, PublicKey, Timestamp};
use palisade_crypto::keys::address_from_public_key;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::trace;

/// The validator this node signs for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalIdentity {
    pub packing_address: Address,
    pub public_key: PublicKey,
}

/// Phase of the consensus loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopPhase {
    #[default]
    Idle,
    WaitSync,
    DetermineRound,
    StageOne,
    StageTwo,
    Finalize,
    Stopped,
}

impl fmt::Display for LoopPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopPhase::Idle => "idle",
            LoopPhase::WaitSync => "wait-sync",
            LoopPhase::DetermineRound => "determine-round",
            LoopPhase::StageOne => "stage-one",
            LoopPhase::StageTwo => "stage-two",
            LoopPhase::Finalize => "finalize",
            LoopPhase::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Snapshot of where the loop is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopStatus {
    pub phase: LoopPhase,
    pub height: Height,
    pub round_index: u64,
    pub slot: u32,
    pub sub_vote_round: u8,
}

/// Evidence of misbehaviour
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Equivocation {
    /// One producer signed two blocks for the same height and slot
    ForkedProducer {
        height: Height,
        slot: u32,
        producer: PublicKey,
        first: Hash,
        second: Hash,
    },
    /// One voter backed two candidates in the same stage
    DoubleVote {
        key: VoteKey,
        stage: VoteStage,
        voter: PublicKey,
        first: Candidate,
        second: Candidate,
    },
}

/// Events emitted by the consensus service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsensusEvent {
    /// Local node packed a candidate
    CandidatePacked { height: Height, hash: Hash, slot: u32 },
    /// A block was finalized and saved
    BlockConfirmed {
        height: Height,
        hash: Hash,
        round_index: u64,
        slot: u32,
    },
    /// A slot was decided empty
    SlotSkipped { height: Height, round_index: u64, slot: u32 },
    /// Stage two timed out; voting restarts one sub-vote-round later
    SubRoundEscalated { key: VoteKey },
    /// A newer round was installed
    RoundSwitched { from: u64, to: u64 },
    Equivocation(Equivocation),
}

/// Voting position announced by the future-round probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundHint {
    pub height: Height,
    pub round_index: u64,
    pub slot: u32,
    pub sub_vote_round: u8,
}

pub struct ConsensusState {
    pub chain_id: ChainId,
    pub config: ConsensusConfig,
    pub local: LocalIdentity,
    seeds: HashSet<Address>,
    last_confirmed: RwLock<Height>,
    height_deadlines: RwLock<BTreeMap<Height, Timestamp>>,
    behind: RwLock<Option<Height>>,
    hint: Mutex<Option<RoundHint>>,
    status: watch::Sender<LoopStatus>,
    event_tx: Option<mpsc::Sender<ConsensusEvent>>,
}

pub type SharedConsensusState = Arc<ConsensusState>;

impl ConsensusState {
    pub fn new(
        chain_id: ChainId,
        config: ConsensusConfig,
        local: LocalIdentity,
        seeds: impl IntoIterator<Item = Address>,
        event_tx: Option<mpsc::Sender<ConsensusEvent>>,
    ) -> Self {
        let (status, _) = watch::channel(LoopStatus::default());
        Self {
            chain_id,
            config,
            local,
            seeds: seeds.into_iter().collect(),
            last_confirmed: RwLock::new(0),
            height_deadlines: RwLock::new(BTreeMap::new()),
            behind: RwLock::new(None),
            hint: Mutex::new(None),
            status,
            event_tx,
        }
    }

    pub fn quorum_threshold(&self, member_count: usize) -> usize {
        self.config.quorum_threshold(member_count)
    }

    /// Seed validators are accepted as voters in every round
    pub fn is_seed(&self, voter: &PublicKey) -> bool {
        !self.seeds.is_empty() && self.seeds.contains(&address_from_public_key(voter))
    }

    pub fn last_confirmed(&self) -> Height {
        *self.last_confirmed.read()
    }

    /// Raise the confirmed height; lower values are ignored
    pub fn set_last_confirmed(&self, height: Height) {
        let mut current = self.last_confirmed.write();
        if height > *current {
            *current = height;
        }
        drop(current);

        self.height_deadlines.write().retain(|h, _| *h > height);
        let mut behind = self.behind.write();
        if behind.map_or(false, |target| target <= height) {
            *behind = None;
        }
    }

    pub fn active_height(&self) -> Height {
        self.last_confirmed() + 1
    }

    pub fn record_deadline(&self, height: Height, deadline: Timestamp) {
        let mut deadlines = self.height_deadlines.write();
        let entry = deadlines.entry(height).or_insert(deadline);
        if deadline > *entry {
            *entry = deadline;
        }
    }

    pub fn deadline(&self, height: Height) -> Option<Timestamp> {
        self.height_deadlines.read().get(&height).copied()
    }

    pub fn set_hint(&self, hint: RoundHint) {
        let mut slot = self.hint.lock();
        let newer = slot.map_or(true, |current| {
            (hint.height, hint.round_index, hint.sub_vote_round)
                > (current.height, current.round_index, current.sub_vote_round)
        });
        if newer {
            *slot = Some(hint);
        }
    }

    /// Take the pending hint if it still applies to `height`
    pub fn take_hint(&self, height: Height) -> Option<RoundHint> {
        let hint = self.hint.lock().take()?;
        (hint.height == height).then_some(hint)
    }

    /// Peers are voting at `height`; the local chain must catch up first
    pub fn mark_behind(&self, height: Height) {
        let mut behind = self.behind.write();
        if behind.map_or(true, |current| height > current) {
            *behind = Some(height);
        }
    }

    pub fn is_behind(&self) -> bool {
        self.behind.read().is_some()
    }

    pub fn publish_status(&self, status: LoopStatus) {
        self.status.send_replace(status);
    }

    pub fn set_phase(&self, phase: LoopPhase) {
        self.status.send_modify(|status| status.phase = phase);
    }

    pub fn status(&self) -> LoopStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LoopStatus> {
        self.status.subscribe()
    }

    pub fn emit_event(&self, event: ConsensusEvent) {
        if let Some(tx) = &self.event_tx {
            if tx.try_send(event).is_err() {
                trace!("Consensus event channel full or closed");
            }
        }
    }
}
