//! Shared helpers for unit tests

use crate::controller::{SharedVoteController, StageResolution, VoteController};
use crate::engine::ConsensusLoop;
use crate::ledger::{SharedVoteLedger, VoteLedger};
use crate::packer::{header_hash, tx_root, Packer};
use crate::relay::MessageRelay;
use crate::round::{compute_round, Round};
use crate::round_controller::{RoundController, SharedRoundController};
use crate::state::{ConsensusEvent, ConsensusState, LocalIdentity, SharedConsensusState};
use crate::vote::{Candidate, VoteKey, VoteMessage, VoteStage};
use async_trait::async_trait;
use palisade_chain::{
    create_memory_store, create_registry, create_txpool, GenesisConfig, SharedMemoryBlockStore, SharedSyncFlag,
    SharedTxPool, SharedValidatorRegistry, SyncFlag,
};
use palisade_core::{
    Address, Amount, Block, BlockHeader, ChainId, CommandId, ConsensusConfig, Hash, Height, Network, PalisadeResult,
    PeerId, PublicKey, Signature, Timestamp, ValidatorSetEntry,
};
use palisade_crypto::keyring::{KeyringSigner, SharedKeyring};
use palisade_crypto::keys::KeyPair;
use palisade_crypto::signing::sign_digest;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

pub(crate) const CHAIN_ID: ChainId = 7;

pub(crate) fn test_config() -> ConsensusConfig {
    ConsensusConfig {
        is_validator: true,
        slot_interval_ms: 200,
        stage_one_timeout_ms: 300,
        stage_two_timeout_ms: 300,
        probe_interval_ms: 50,
        sync_poll_interval_ms: 20,
        shutdown_grace_ms: 500,
        ..ConsensusConfig::default()
    }
}

pub(crate) fn genesis() -> Block {
    GenesisConfig {
        chain_id: CHAIN_ID,
        ..GenesisConfig::default()
    }
    .genesis_block()
}

pub(crate) fn keypairs(count: usize) -> Vec<KeyPair> {
    (0..count).map(|i| KeyPair::from_seed(&[i as u8 + 1; 32])).collect()
}

pub(crate) fn entries(keys: &[KeyPair]) -> Vec<ValidatorSetEntry> {
    keys.iter()
        .map(|kp| ValidatorSetEntry::new(kp.address(), kp.address(), kp.public_key(), Amount::from_pal(20_000), 0))
        .collect()
}

/// Unsigned vote from the fake voter `PublicKey([voter; 32])`
pub(crate) fn test_vote(key: VoteKey, stage: VoteStage, candidate: Candidate, voter: u8) -> VoteMessage {
    VoteMessage::unsigned(key, 1, stage, candidate, PublicKey::from_bytes([voter; 32]))
}

/// Unsigned block; `marker` varies the payload and therefore the hash
pub(crate) fn sample_block(height: Height, round_index: u64, slot: u32, marker: u8) -> Block {
    let transactions = vec![vec![marker; 4]];
    let header = BlockHeader {
        chain_id: CHAIN_ID,
        height,
        previous_hash: Hash::ZERO,
        timestamp: Timestamp::from_millis(0),
        round_index,
        round_start: Timestamp::from_millis(0),
        member_count: 4,
        packing_index: slot,
        packer: PublicKey::from_bytes([slot as u8; 32]),
        tx_root: tx_root(&transactions),
        tx_count: 1,
    };
    Block {
        hash: header_hash(&header),
        header,
        signature: Signature::from_bytes([0u8; 64]),
        transactions,
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Sent {
    pub command: CommandId,
    pub payload: Vec<u8>,
    pub target: Option<PeerId>,
    pub exclude: Option<PeerId>,
}

/// `Network` that only records what was sent
#[derive(Default)]
pub(crate) struct RecordingNetwork {
    sent: Mutex<Vec<Sent>>,
}

impl RecordingNetwork {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Network for RecordingNetwork {
    async fn send_to_peer(
        &self,
        _chain_id: ChainId,
        payload: Vec<u8>,
        peer: &PeerId,
        command: CommandId,
    ) -> PalisadeResult<()> {
        self.sent.lock().push(Sent {
            command,
            payload,
            target: Some(peer.clone()),
            exclude: None,
        });
        Ok(())
    }

    async fn broadcast(
        &self,
        _chain_id: ChainId,
        command: CommandId,
        payload: Vec<u8>,
        exclude: Option<&PeerId>,
    ) -> PalisadeResult<()> {
        self.sent.lock().push(Sent {
            command,
            payload,
            target: None,
            exclude: exclude.cloned(),
        });
        Ok(())
    }
}

/// One node's consensus components over in-memory collaborators
pub(crate) struct Harness {
    pub keys: Vec<KeyPair>,
    pub local: KeyPair,
    pub outsider: KeyPair,
    pub state: SharedConsensusState,
    pub ledger: SharedVoteLedger,
    pub rounds: SharedRoundController,
    pub controller: SharedVoteController,
    pub registry: SharedValidatorRegistry,
    pub store: SharedMemoryBlockStore,
    pub txpool: SharedTxPool,
    pub keyring: SharedKeyring,
    pub network: Arc<RecordingNetwork>,
    pub sync: SharedSyncFlag,
    events: Mutex<mpsc::Receiver<ConsensusEvent>>,
    resolutions: Mutex<mpsc::Receiver<StageResolution>>,
}

impl Harness {
    /// `count` validators; the node signs as validator `local_index`
    pub fn new(count: usize, local_index: usize) -> Self {
        let keys = keypairs(count);
        let local = keys[local_index].clone();
        Self::build(keys, local, false)
    }

    /// A node whose key is not in the validator set
    pub fn outsider(count: usize) -> Self {
        let keys = keypairs(count);
        Self::build(keys, outsider_key(), false)
    }

    /// Like `new`, with the outsider key configured as a seed validator
    pub fn with_outsider_seed(count: usize, local_index: usize) -> Self {
        let keys = keypairs(count);
        let local = keys[local_index].clone();
        Self::build(keys, local, true)
    }

    fn build(keys: Vec<KeyPair>, local: KeyPair, outsider_seed: bool) -> Self {
        let outsider = outsider_key();
        let seeds: Vec<Address> = if outsider_seed { vec![outsider.address()] } else { vec![] };
        let (event_tx, event_rx) = mpsc::channel(256);
        let (resolution_tx, resolution_rx) = mpsc::channel(256);

        let identity = LocalIdentity {
            packing_address: local.address(),
            public_key: local.public_key(),
        };
        let state = Arc::new(ConsensusState::new(CHAIN_ID, test_config(), identity, seeds, Some(event_tx)));
        let ledger = Arc::new(VoteLedger::new());
        let validators = entries(&keys);
        let rounds = Arc::new(RoundController::new(state.clone(), ledger.clone(), validators.clone()));
        let controller = Arc::new(VoteController::new(
            state.clone(),
            ledger.clone(),
            rounds.clone(),
            Some(resolution_tx),
        ));

        Self {
            keyring: Arc::new(KeyringSigner::with_key(local.clone())),
            registry: create_registry(validators),
            store: create_memory_store(genesis()),
            txpool: create_txpool(1_000),
            network: Arc::new(RecordingNetwork::default()),
            sync: Arc::new(SyncFlag::new(true)),
            keys,
            local,
            outsider,
            state,
            ledger,
            rounds,
            controller,
            events: Mutex::new(event_rx),
            resolutions: Mutex::new(resolution_rx),
        }
    }

    pub fn local_key(&self) -> &KeyPair {
        &self.local
    }

    pub fn local_address(&self) -> Address {
        self.local.address()
    }

    pub fn round_starting_at(&self, index: u64, start: Timestamp) -> Round {
        compute_round(
            &entries(&self.keys),
            index,
            self.state.active_height(),
            start,
            self.state.config.slot_interval_ms,
            Some(&self.local.address()),
        )
        .unwrap()
    }

    pub fn round_starting_now(&self, index: u64) -> Round {
        self.round_starting_at(index, Timestamp::now())
    }

    pub fn packer(&self) -> Packer {
        Packer::new(
            self.state.clone(),
            self.ledger.clone(),
            self.txpool.clone(),
            self.keyring.clone(),
            self.store.clone(),
        )
    }

    pub fn relay(&self) -> MessageRelay {
        MessageRelay::new(
            self.state.clone(),
            self.controller.clone(),
            self.ledger.clone(),
            self.network.clone(),
            self.keyring.clone(),
            self.store.clone(),
        )
    }

    pub fn consensus_loop(&self) -> ConsensusLoop {
        ConsensusLoop::new(
            self.state.clone(),
            self.rounds.clone(),
            self.controller.clone(),
            self.ledger.clone(),
            Arc::new(self.relay()),
            self.packer(),
            self.store.clone(),
            self.sync.clone(),
        )
    }

    pub fn signed_vote(
        &self,
        voter: usize,
        key: VoteKey,
        slot: u32,
        stage: VoteStage,
        candidate: Candidate,
    ) -> VoteMessage {
        sign_as(&self.keys[voter], key, slot, stage, candidate)
    }

    pub fn outsider_vote(&self, key: VoteKey, slot: u32, stage: VoteStage, candidate: Candidate) -> VoteMessage {
        sign_as(&self.outsider, key, slot, stage, candidate)
    }

    /// Block on `parent` produced and signed by the owner of `slot`
    pub fn signed_block(&self, round: &Round, slot: u32, parent: &Block, marker: u8) -> Block {
        let producer = &round.member_at(slot).unwrap().entry;
        let keypair = self
            .keys
            .iter()
            .find(|kp| kp.public_key() == producer.public_key)
            .unwrap();

        let transactions = vec![vec![marker; 8]];
        let header = BlockHeader {
            chain_id: CHAIN_ID,
            height: parent.height() + 1,
            previous_hash: parent.hash,
            timestamp: round.slot_deadline(slot),
            round_index: round.index,
            round_start: round.start_time,
            member_count: round.member_count() as u32,
            packing_index: slot,
            packer: keypair.public_key(),
            tx_root: tx_root(&transactions),
            tx_count: 1,
        };
        let hash = header_hash(&header);
        Block {
            header,
            hash,
            signature: sign_digest(keypair, &hash),
            transactions,
        }
    }

    pub fn drain_events(&self) -> Vec<ConsensusEvent> {
        let mut rx = self.events.lock();
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    pub fn drain_resolutions(&self) -> Vec<StageResolution> {
        let mut rx = self.resolutions.lock();
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }
}

fn outsider_key() -> KeyPair {
    KeyPair::from_seed(&[200u8; 32])
}

fn sign_as(keypair: &KeyPair, key: VoteKey, slot: u32, stage: VoteStage, candidate: Candidate) -> VoteMessage {
    VoteMessage::unsigned(key, slot, stage, candidate, keypair.public_key())
        .sign_with(CHAIN_ID, |digest| sign_digest(keypair, digest))
}
