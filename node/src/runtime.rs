//! Node runtime combining storage, staking, transactions and consensus

use palisade_chain::{
    create_persistent_store, create_registry, create_txpool, GenesisConfig, SharedSledBlockStore, SharedSyncFlag,
    SharedTxPool, SharedValidatorRegistry, SyncFlag,
};
use palisade_consensus::{
    ConsensusDeps, ConsensusEvent, ConsensusIngress, ConsensusService, Equivocation, LocalIdentity,
    SharedConsensusService,
};
use palisade_core::{BlockStore, Height, Network, NodeConfig, PalisadeResult};
use palisade_crypto::keyring::KeyringSigner;
use palisade_crypto::keys::KeyPair;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

const TXPOOL_CAPACITY: usize = 10_000;
const EVENT_QUEUE_CAPACITY: usize = 1_024;

/// Everything one node runs, minus the transport
pub struct NodeRuntime {
    config: NodeConfig,
    keypair: KeyPair,
    store: SharedSledBlockStore,
    txpool: SharedTxPool,
    registry: SharedValidatorRegistry,
    sync: SharedSyncFlag,
    consensus: SharedConsensusService,
    events: parking_lot::Mutex<Option<mpsc::Receiver<ConsensusEvent>>>,
}

pub type SharedNodeRuntime = Arc<NodeRuntime>;

impl NodeRuntime {
    /// Open the block store under `data_dir`, seed it with genesis and wire
    /// the consensus service onto `network`
    pub fn new(
        mut config: NodeConfig,
        keypair: KeyPair,
        genesis: &GenesisConfig,
        network: Arc<dyn Network>,
    ) -> PalisadeResult<Self> {
        config.chain_id = genesis.chain_id;
        for seed in &genesis.seed_validators {
            if !config.consensus.seed_validators.contains(seed) {
                config.consensus.seed_validators.push(seed.clone());
            }
        }

        let store = create_persistent_store(config.data_dir.join("blocks"))?;
        store.init_genesis(&genesis.genesis_block())?;
        let registry = create_registry(genesis.validator_entries()?);
        let txpool = create_txpool(TXPOOL_CAPACITY);
        // no block download layer: the local store is the chain
        let sync = Arc::new(SyncFlag::new(true));

        let deps = ConsensusDeps {
            network,
            signer: Arc::new(KeyringSigner::with_key(keypair.clone())),
            store: store.clone(),
            txs: txpool.clone(),
            validators: registry.clone(),
            sync: sync.clone(),
        };
        let local = LocalIdentity {
            packing_address: keypair.address(),
            public_key: keypair.public_key(),
        };
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let consensus = Arc::new(ConsensusService::new(
            config.chain_id,
            config.consensus.clone(),
            local,
            deps,
            Some(event_tx),
        )?);

        info!(
            "Runtime ready for chain {} ({}), packing address {}",
            genesis.chain_name,
            config.chain_id,
            keypair.address()
        );
        Ok(Self {
            config,
            keypair,
            store,
            txpool,
            registry,
            sync,
            consensus,
            events: parking_lot::Mutex::new(Some(event_rx)),
        })
    }

    /// Run the membership watcher and the event logger until `shutdown`
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let mut tasks = Vec::new();
        if let Some(events) = self.events.lock().take() {
            tasks.push(tokio::spawn(self.clone().log_events(events)));
        }
        tasks.push(tokio::spawn(self.clone().watch_membership(shutdown.clone())));

        let mut shutdown = shutdown;
        let _ = shutdown.wait_for(|stop| *stop).await;
        for task in tasks {
            task.abort();
        }
        self.consensus.stop().await;
    }

    /// Start consensus while the local validator is in the set, stop it when
    /// it leaves
    async fn watch_membership(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut registry = self.registry.subscribe();
        let poll = self.config.consensus.sync_poll_interval();
        loop {
            if let Err(e) = self.reconcile_membership().await {
                error!("Membership check failed: {}", e);
            }
            tokio::select! {
                changed = registry.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(poll) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
        }
        debug!("Membership watcher stopped");
    }

    /// One membership check; `true` when consensus is running afterwards
    pub async fn reconcile_membership(&self) -> PalisadeResult<bool> {
        self.consensus.refresh_validators().await?;
        let height = self.next_height().await?;
        let member = self.consensus.is_local_member(height);

        match (member, self.consensus.is_running()) {
            (true, false) => {
                info!("Validator {} is in the set at #{}, starting consensus", self.keypair.address(), height);
                self.consensus.start().await?;
            }
            (false, true) => {
                info!("Validator {} left the set at #{}, stopping consensus", self.keypair.address(), height);
                self.consensus.stop().await;
            }
            _ => {}
        }
        Ok(self.consensus.is_running())
    }

    async fn next_height(&self) -> PalisadeResult<Height> {
        Ok(self
            .store
            .latest_block(self.config.chain_id)
            .await?
            .map_or(0, |block| block.height() + 1))
    }

    async fn log_events(self: Arc<Self>, mut events: mpsc::Receiver<ConsensusEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
    }

    async fn handle_event(&self, event: ConsensusEvent) {
        match event {
            ConsensusEvent::BlockConfirmed { height, hash, .. } => {
                match self.store.get_block(self.config.chain_id, height).await {
                    Ok(Some(block)) => {
                        let pruned = self.txpool.prune_block(&block);
                        debug!("Block #{} {} confirmed, {} transactions left the pool", height, hash, pruned);
                    }
                    Ok(None) => warn!("Confirmed block #{} missing from the store", height),
                    Err(e) => error!("Failed to load confirmed block #{}: {}", height, e),
                }
            }
            ConsensusEvent::CandidatePacked { height, hash, slot } => {
                debug!("Packed candidate #{} {} in slot {}", height, hash, slot)
            }
            ConsensusEvent::SlotSkipped {
                height,
                round_index,
                slot,
            } => info!("Slot {} of round {} skipped at #{}", slot, round_index, height),
            ConsensusEvent::SubRoundEscalated { key } => debug!("Escalated sub-vote-round at {}", key),
            ConsensusEvent::RoundSwitched { from, to } => debug!("Round {} -> {}", from, to),
            ConsensusEvent::Equivocation(Equivocation::ForkedProducer {
                height,
                slot,
                producer,
                first,
                second,
            }) => warn!(
                "Equivocation: producer {} signed {} and {} for #{} slot {}",
                producer, first, second, height, slot
            ),
            ConsensusEvent::Equivocation(Equivocation::DoubleVote {
                key,
                stage,
                voter,
                first,
                second,
            }) => warn!(
                "Equivocation: voter {} backed {} and {} at {} stage {:?}",
                voter, first, second, key, stage
            ),
        }
    }

    pub fn ingress(&self) -> ConsensusIngress {
        self.consensus.ingress()
    }

    pub fn consensus(&self) -> &SharedConsensusService {
        &self.consensus
    }

    pub fn registry(&self) -> &SharedValidatorRegistry {
        &self.registry
    }

    pub fn txpool(&self) -> &SharedTxPool {
        &self.txpool
    }

    pub fn store(&self) -> &SharedSledBlockStore {
        &self.store
    }

    pub fn sync(&self) -> &SharedSyncFlag {
        &self.sync
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }
}
