//! Full node: libp2p transport plus the runtime

use crate::runtime::NodeRuntime;
use palisade_chain::GenesisConfig;
use palisade_consensus::pump_inbound;
use palisade_core::NodeConfig;
use palisade_crypto::keys::KeyPair;
use palisade_p2p::NetworkService;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

/// Full Palisade node
pub struct PalisadeNode {
    config: NodeConfig,
    keypair: KeyPair,
    genesis: GenesisConfig,
}

impl PalisadeNode {
    pub fn new(config: NodeConfig, keypair: KeyPair, genesis: GenesisConfig) -> Self {
        Self {
            config,
            keypair,
            genesis,
        }
    }

    /// Run until ctrl-c
    pub async fn start(self) -> anyhow::Result<()> {
        info!("Starting Palisade node {}...", self.config.name);

        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.consensus.inbound_queue_capacity);
        let (mut network, handle) =
            NetworkService::new(&self.keypair, &self.config.network, self.genesis.chain_id, inbound_tx)?;
        network.connect_bootstrap(&self.config.network.bootstrap_nodes);
        let peer = network.local_peer().clone();

        let runtime = Arc::new(NodeRuntime::new(
            self.config,
            self.keypair,
            &self.genesis,
            Arc::new(handle),
        )?);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let network_task = tokio::spawn(network.run(shutdown_rx.clone()));
        let pump_task = tokio::spawn(pump_inbound(inbound_rx, runtime.ingress()));
        let runtime_task = tokio::spawn(runtime.clone().run(shutdown_rx));

        info!("Node started");
        info!("Peer ID: {}", peer);
        info!("Packing address: {}", runtime.keypair().address());
        info!("Is validator: {}", runtime.config().consensus.is_validator);

        match signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received, stopping node..."),
            Err(e) => error!("Error waiting for shutdown signal: {}", e),
        }

        let _ = shutdown_tx.send(true);
        if let Err(e) = runtime_task.await {
            error!("Runtime task failed: {}", e);
        }
        if let Err(e) = network_task.await {
            error!("Network task failed: {}", e);
        }
        pump_task.abort();

        info!("Node stopped at height {}", runtime.consensus().last_confirmed());
        Ok(())
    }
}

/// Node builder for easier configuration
pub struct NodeBuilder {
    config: NodeConfig,
    keypair: Option<KeyPair>,
    genesis: GenesisConfig,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            config: NodeConfig::default(),
            keypair: None,
            genesis: GenesisConfig::default(),
        }
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn keypair(mut self, keypair: KeyPair) -> Self {
        self.keypair = Some(keypair);
        self
    }

    pub fn genesis(mut self, genesis: GenesisConfig) -> Self {
        self.genesis = genesis;
        self
    }

    pub fn validator(mut self) -> Self {
        self.config.consensus.is_validator = true;
        self
    }

    pub fn p2p_addr(mut self, addr: &str) -> Self {
        self.config.network.listen_addr = addr.to_string();
        self
    }

    pub fn data_dir(mut self, dir: impl Into<std::path::PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn build(self) -> PalisadeNode {
        let keypair = self.keypair.unwrap_or_else(KeyPair::generate);
        let mut config = self.config;
        config.chain_id = self.genesis.chain_id;
        PalisadeNode::new(config, keypair, self.genesis)
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
