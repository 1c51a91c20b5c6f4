//! Vote ledger
//!
//! Holds the stage-one and stage-two vote sets of every live
//! (height, round, sub-vote-round) key, plus the block candidates seen for
//! each pending height. Each stage resolves at most once; waiters observe
//! the resolution through a `watch` slot.

use crate::packer::BlockCandidate;
use crate::vote::{Candidate, VoteKey, VoteMessage, VoteStage};
use palisade_core::{Hash, Height, PeerId, PublicKey};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;

/// One stage of one key
struct StageTally {
    votes: HashMap<PublicKey, VoteMessage>,
    counts: HashMap<Candidate, usize>,
    result: watch::Sender<Option<Candidate>>,
}

impl StageTally {
    fn new() -> Self {
        let (result, _) = watch::channel(None);
        Self {
            votes: HashMap::new(),
            counts: HashMap::new(),
            result,
        }
    }

    fn resolved(&self) -> Option<Candidate> {
        *self.result.borrow()
    }
}

struct LedgerEntry {
    stages: [StageTally; 2],
    voters: HashSet<PublicKey>,
    slot: u32,
}

impl LedgerEntry {
    fn new() -> Self {
        Self {
            stages: [StageTally::new(), StageTally::new()],
            voters: HashSet::new(),
            slot: 0,
        }
    }

    fn stage(&self, stage: VoteStage) -> &StageTally {
        &self.stages[stage.index()]
    }

    fn stage_mut(&mut self, stage: VoteStage) -> &mut StageTally {
        &mut self.stages[stage.index()]
    }
}

/// Result of inserting a vote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Insertion {
    /// Recorded; `resolved` is set only by the vote that crossed the quorum
    Inserted { resolved: Option<Candidate> },
    /// The voter already voted in this stage for `prior`
    Duplicate { prior: Candidate },
}

/// Result of recording a block candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateObservation {
    New,
    Known,
    /// Another block already occupies the same height, round and slot
    Fork { existing: Hash },
}

/// Voting activity seen for one key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyActivity {
    pub key: VoteKey,
    pub voters: usize,
    pub slot: u32,
}

#[derive(Debug, Clone)]
struct ObservedCandidate {
    candidate: BlockCandidate,
    local: bool,
}

pub struct VoteLedger {
    entries: Mutex<BTreeMap<VoteKey, LedgerEntry>>,
    candidates: Mutex<BTreeMap<Height, Vec<ObservedCandidate>>>,
    sources: Mutex<HashMap<Hash, (Height, PeerId)>>,
    candidate_seq: watch::Sender<u64>,
}

pub type SharedVoteLedger = Arc<VoteLedger>;

impl Default for VoteLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl VoteLedger {
    pub fn new() -> Self {
        let (candidate_seq, _) = watch::channel(0);
        Self {
            entries: Mutex::new(BTreeMap::new()),
            candidates: Mutex::new(BTreeMap::new()),
            sources: Mutex::new(HashMap::new()),
            candidate_seq,
        }
    }

    /// Record a vote and evaluate the quorum of its stage
    ///
    /// Votes arriving after the stage resolved are still recorded so the
    /// quorum certificate and probe activity stay complete.
    pub fn insert(&self, vote: VoteMessage, threshold: usize) -> Insertion {
        let mut entries = self.entries.lock();
        let entry = entries.entry(vote.key()).or_insert_with(LedgerEntry::new);
        entry.voters.insert(vote.voter);
        entry.slot = entry.slot.max(vote.slot);

        let tally = entry.stage_mut(vote.stage);
        if let Some(prior) = tally.votes.get(&vote.voter) {
            return Insertion::Duplicate { prior: prior.candidate };
        }

        let candidate = vote.candidate;
        tally.votes.insert(vote.voter, vote);
        let count = tally.counts.entry(candidate).or_insert(0);
        *count += 1;

        let resolved = if *count >= threshold && tally.resolved().is_none() {
            tally.result.send_replace(Some(candidate));
            Some(candidate)
        } else {
            None
        };
        Insertion::Inserted { resolved }
    }

    pub fn subscribe(&self, key: VoteKey, stage: VoteStage) -> watch::Receiver<Option<Candidate>> {
        self.entries
            .lock()
            .entry(key)
            .or_insert_with(LedgerEntry::new)
            .stage(stage)
            .result
            .subscribe()
    }

    pub fn result(&self, key: &VoteKey, stage: VoteStage) -> Option<Candidate> {
        self.entries.lock().get(key).and_then(|e| e.stage(stage).resolved())
    }

    /// What `voter` voted for in one stage, if anything
    pub fn vote_of(&self, key: &VoteKey, stage: VoteStage, voter: &PublicKey) -> Option<Candidate> {
        self.entries
            .lock()
            .get(key)
            .and_then(|e| e.stage(stage).votes.get(voter).map(|v| v.candidate))
    }

    pub fn tally(&self, key: &VoteKey, stage: VoteStage, candidate: Candidate) -> usize {
        self.entries
            .lock()
            .get(key)
            .and_then(|e| e.stage(stage).counts.get(&candidate).copied())
            .unwrap_or(0)
    }

    /// Vote counts per candidate for one stage
    pub fn tallies(&self, key: &VoteKey, stage: VoteStage) -> Vec<(Candidate, usize)> {
        self.entries
            .lock()
            .get(key)
            .map(|e| e.stage(stage).counts.iter().map(|(c, n)| (*c, *n)).collect())
            .unwrap_or_default()
    }

    /// Votes for `candidate` in one stage, ordered by voter
    pub fn stage_votes(&self, key: &VoteKey, stage: VoteStage, candidate: Candidate) -> Vec<VoteMessage> {
        let entries = self.entries.lock();
        let Some(entry) = entries.get(key) else {
            return Vec::new();
        };
        let mut votes: Vec<VoteMessage> = entry
            .stage(stage)
            .votes
            .values()
            .filter(|v| v.candidate == candidate)
            .cloned()
            .collect();
        votes.sort_by(|a, b| a.voter.cmp(&b.voter));
        votes
    }

    pub fn activity(&self) -> Vec<KeyActivity> {
        self.entries
            .lock()
            .iter()
            .map(|(key, entry)| KeyActivity {
                key: *key,
                voters: entry.voters.len(),
                slot: entry.slot,
            })
            .collect()
    }

    /// Highest producer slot voted on under `key`
    pub fn key_slot(&self, key: &VoteKey) -> Option<u32> {
        self.entries.lock().get(key).map(|e| e.slot).filter(|slot| *slot > 0)
    }

    /// Stage-two resolutions recorded for `height`
    pub fn stage_two_results(&self, height: Height) -> Vec<(VoteKey, Candidate)> {
        let start = VoteKey::new(height, 0, 0);
        let end = VoteKey::new(height, u64::MAX, u8::MAX);
        self.entries
            .lock()
            .range(start..=end)
            .filter_map(|(key, entry)| entry.stage(VoteStage::Two).resolved().map(|c| (*key, c)))
            .collect()
    }

    /// Drop everything at or below a confirmed height
    pub fn prune_heights(&self, confirmed: Height) {
        self.entries.lock().retain(|key, _| key.height > confirmed);
        self.candidates.lock().retain(|height, _| *height > confirmed);
        self.sources.lock().retain(|_, (height, _)| *height > confirmed);
    }

    pub fn prune_rounds_below(&self, round_index: u64) {
        self.entries.lock().retain(|key, _| key.round_index >= round_index);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn observe_candidate(&self, candidate: BlockCandidate, local: bool) -> CandidateObservation {
        let mut candidates = self.candidates.lock();
        let at_height = candidates.entry(candidate.height).or_default();

        if at_height.iter().any(|c| c.candidate.hash == candidate.hash) {
            return CandidateObservation::Known;
        }
        let fork = at_height
            .iter()
            .find(|c| c.candidate.round_index == candidate.round_index && c.candidate.slot == candidate.slot)
            .map(|c| c.candidate.hash);

        at_height.push(ObservedCandidate { candidate, local });
        drop(candidates);
        self.candidate_seq.send_modify(|seq| *seq += 1);

        match fork {
            Some(existing) => CandidateObservation::Fork { existing },
            None => CandidateObservation::New,
        }
    }

    pub fn candidate(&self, height: Height, hash: &Hash) -> Option<BlockCandidate> {
        self.candidates
            .lock()
            .get(&height)?
            .iter()
            .find(|c| &c.candidate.hash == hash)
            .map(|c| c.candidate.clone())
    }

    /// Candidates for one producer slot, earliest first
    pub fn candidates_for_slot(&self, height: Height, round_index: u64, slot: u32) -> Vec<BlockCandidate> {
        self.candidates
            .lock()
            .get(&height)
            .map(|all| {
                all.iter()
                    .filter(|c| c.candidate.round_index == round_index && c.candidate.slot == slot)
                    .map(|c| c.candidate.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn local_candidate(&self, height: Height) -> Option<BlockCandidate> {
        self.candidates
            .lock()
            .get(&height)?
            .iter()
            .rev()
            .find(|c| c.local)
            .map(|c| c.candidate.clone())
    }

    /// Ticks whenever a new candidate is recorded
    pub fn subscribe_candidates(&self) -> watch::Receiver<u64> {
        self.candidate_seq.subscribe()
    }

    /// Remember the first peer that vouched for `hash`
    pub fn record_source(&self, height: Height, hash: Hash, peer: PeerId) {
        self.sources.lock().entry(hash).or_insert((height, peer));
    }

    pub fn source(&self, hash: &Hash) -> Option<PeerId> {
        self.sources.lock().get(hash).map(|(_, peer)| peer.clone())
    }
}
