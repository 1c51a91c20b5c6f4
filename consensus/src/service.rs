//! Consensus service
//!
//! Wires the shared state, ledger, controllers and relay together and owns
//! the processors that drive them. `start` and `stop` may be called any
//! number of times as validator membership changes.

use crate::controller::{SharedVoteController, VoteController};
use crate::engine::ConsensusLoop;
use crate::ledger::{SharedVoteLedger, VoteLedger};
use crate::packer::Packer;
use crate::processor::TaskSupervisor;
use crate::relay::{MessageRelay, SharedMessageRelay};
use crate::round_controller::{RoundController, SharedRoundController};
use crate::state::{ConsensusEvent, ConsensusState, LocalIdentity, LoopPhase, LoopStatus, SharedConsensusState};
use crate::tasks::{FutureRoundProbe, ResultRelay, SharedInbox, SharedResolutions, VoteIngestion};
use palisade_core::{
    BlockStore, ChainId, ConsensusConfig, Height, Network, OverflowPolicy, PalisadeError, PalisadeResult, Signer,
    SyncStatus, TransactionSource, ValidatorSource,
};
use palisade_p2p::InboundMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};

/// External collaborators of one consensus service
#[derive(Clone)]
pub struct ConsensusDeps {
    pub network: Arc<dyn Network>,
    pub signer: Arc<dyn Signer>,
    pub store: Arc<dyn BlockStore>,
    pub txs: Arc<dyn TransactionSource>,
    pub validators: Arc<dyn ValidatorSource>,
    pub sync: Arc<dyn SyncStatus>,
}

pub struct ConsensusService {
    state: SharedConsensusState,
    ledger: SharedVoteLedger,
    rounds: SharedRoundController,
    controller: SharedVoteController,
    relay: SharedMessageRelay,
    deps: ConsensusDeps,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbox: SharedInbox,
    resolutions: SharedResolutions,
    supervisor: Mutex<Option<TaskSupervisor>>,
    running: AtomicBool,
}

pub type SharedConsensusService = Arc<ConsensusService>;

impl ConsensusService {
    pub fn new(
        chain_id: ChainId,
        config: ConsensusConfig,
        local: LocalIdentity,
        deps: ConsensusDeps,
        event_tx: Option<mpsc::Sender<ConsensusEvent>>,
    ) -> PalisadeResult<Self> {
        config.validate()?;
        let seeds = config.seed_addresses()?;
        let capacity = config.inbound_queue_capacity;

        let state = Arc::new(ConsensusState::new(chain_id, config, local, seeds, event_tx));
        let ledger = Arc::new(VoteLedger::new());
        let rounds = Arc::new(RoundController::new(state.clone(), ledger.clone(), Vec::new()));
        let (resolution_tx, resolution_rx) = mpsc::channel(capacity);
        let controller = Arc::new(VoteController::new(
            state.clone(),
            ledger.clone(),
            rounds.clone(),
            Some(resolution_tx),
        ));
        let relay = Arc::new(MessageRelay::new(
            state.clone(),
            controller.clone(),
            ledger.clone(),
            deps.network.clone(),
            deps.signer.clone(),
            deps.store.clone(),
        ));
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);

        Ok(Self {
            state,
            ledger,
            rounds,
            controller,
            relay,
            deps,
            inbound_tx,
            inbox: Arc::new(Mutex::new(inbound_rx)),
            resolutions: Arc::new(Mutex::new(resolution_rx)),
            supervisor: Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Spawn the processors; `false` when already running
    pub async fn start(&self) -> PalisadeResult<bool> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() {
            return Ok(false);
        }

        let count = self.rounds.refresh_validators(self.deps.validators.as_ref()).await?;
        if let Some(latest) = self.deps.store.latest_block(self.state.chain_id).await? {
            self.state.set_last_confirmed(latest.height());
            self.ledger.prune_heights(latest.height());
        }

        let packer = Packer::new(
            self.state.clone(),
            self.ledger.clone(),
            self.deps.txs.clone(),
            self.deps.signer.clone(),
            self.deps.store.clone(),
        );
        let consensus_loop = ConsensusLoop::new(
            self.state.clone(),
            self.rounds.clone(),
            self.controller.clone(),
            self.ledger.clone(),
            self.relay.clone(),
            packer,
            self.deps.store.clone(),
            self.deps.sync.clone(),
        );

        let mut tasks = TaskSupervisor::new(self.state.config.shutdown_grace());
        tasks.spawn(VoteIngestion::new(
            self.state.clone(),
            self.controller.clone(),
            self.ledger.clone(),
            self.relay.clone(),
            self.inbox.clone(),
        ));
        tasks.spawn(ResultRelay::new(
            self.ledger.clone(),
            self.relay.clone(),
            self.resolutions.clone(),
        ));
        tasks.spawn(FutureRoundProbe::new(
            self.state.clone(),
            self.rounds.clone(),
            self.ledger.clone(),
        ));
        tasks.spawn(consensus_loop);

        *supervisor = Some(tasks);
        self.running.store(true, Ordering::SeqCst);
        info!(
            "Consensus started for chain {} at #{} with {} validators",
            self.state.chain_id,
            self.state.active_height(),
            count
        );
        Ok(true)
    }

    /// Stop every processor; `false` when not running
    pub async fn stop(&self) -> bool {
        let Some(mut tasks) = self.supervisor.lock().await.take() else {
            return false;
        };
        tasks.shutdown().await;
        self.running.store(false, Ordering::SeqCst);
        self.state.set_phase(LoopPhase::Stopped);
        info!("Consensus stopped for chain {}", self.state.chain_id);
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> LoopStatus {
        self.state.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LoopStatus> {
        self.state.subscribe_status()
    }

    pub fn last_confirmed(&self) -> Height {
        self.state.last_confirmed()
    }

    /// Reload the validator snapshot from the staking source
    pub async fn refresh_validators(&self) -> PalisadeResult<usize> {
        self.rounds.refresh_validators(self.deps.validators.as_ref()).await
    }

    /// Whether the local validator may vote at `height` per the last snapshot
    pub fn is_local_member(&self, height: Height) -> bool {
        self.state.config.is_validator && self.rounds.is_local_member(height)
    }

    /// Handle for the network layer to push inbound traffic
    pub fn ingress(&self) -> ConsensusIngress {
        ConsensusIngress {
            tx: self.inbound_tx.clone(),
            policy: self.state.config.overflow_policy,
            chain_id: self.state.chain_id,
        }
    }

    pub fn state(&self) -> &SharedConsensusState {
        &self.state
    }

    pub fn ledger(&self) -> &SharedVoteLedger {
        &self.ledger
    }

    pub fn rounds(&self) -> &SharedRoundController {
        &self.rounds
    }

    pub fn controller(&self) -> &SharedVoteController {
        &self.controller
    }

    pub fn relay(&self) -> &SharedMessageRelay {
        &self.relay
    }
}

/// Bounded entry point of the inbound consensus queue
#[derive(Clone)]
pub struct ConsensusIngress {
    tx: mpsc::Sender<InboundMessage>,
    policy: OverflowPolicy,
    chain_id: ChainId,
}

impl ConsensusIngress {
    /// Queue one message according to the overflow policy
    pub async fn deliver(&self, message: InboundMessage) -> PalisadeResult<()> {
        if message.chain_id != self.chain_id {
            return Ok(());
        }
        match self.policy {
            OverflowPolicy::Block => self
                .tx
                .send(message)
                .await
                .map_err(|_| PalisadeError::ChannelClosed("consensus inbound".into())),
            OverflowPolicy::DropNewest => match self.tx.try_send(message) {
                Ok(()) => Ok(()),
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    warn!("Consensus queue full, dropping {} from {}", dropped.command, dropped.origin);
                    Ok(())
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    Err(PalisadeError::ChannelClosed("consensus inbound".into()))
                }
            },
        }
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity()
    }
}

/// Forward everything from a transport inbox into the service
pub async fn pump_inbound(mut inbox: mpsc::Receiver<InboundMessage>, ingress: ConsensusIngress) {
    while let Some(message) = inbox.recv().await {
        if let Err(e) = ingress.deliver(message).await {
            warn!("Inbound pump stopped: {}", e);
            break;
        }
    }
}
