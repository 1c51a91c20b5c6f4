//! libp2p network service and its `Network` handle

use crate::behaviour::{command_topic, direct_topic, PalisadeBehaviour, PalisadeBehaviourEvent};
use crate::message::{Envelope, InboundMessage};
use crate::peer::{create_peer_manager, PeerInfo, SharedPeerManager};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    gossipsub::{self, IdentTopic},
    identity::Keypair,
    mdns,
    swarm::SwarmEvent,
    Multiaddr, Swarm,
};
use palisade_core::{ChainId, CommandId, Network, NetworkConfig, PalisadeError, PalisadeResult, PeerId};
use palisade_crypto::keys::KeyPair;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Commands from `NetworkHandle` to the swarm task
#[derive(Debug)]
enum NetworkCommand {
    Publish { topic: IdentTopic, data: Vec<u8> },
}

/// Network service driving the libp2p swarm
pub struct NetworkService {
    swarm: Swarm<PalisadeBehaviour>,
    peer_manager: SharedPeerManager,
    local_peer: PeerId,
    chain_id: ChainId,
    command_rx: mpsc::Receiver<NetworkCommand>,
    inbound_tx: mpsc::Sender<InboundMessage>,
}

/// Cloneable sender side implementing `Network`
#[derive(Clone)]
pub struct NetworkHandle {
    local_peer: PeerId,
    command_tx: mpsc::Sender<NetworkCommand>,
    peer_manager: SharedPeerManager,
}

impl NetworkService {
    /// Build the swarm, subscribe to the chain's topics and start listening
    ///
    /// The libp2p identity is derived from the node key so the peer id is
    /// stable across restarts.
    pub fn new(
        keypair: &KeyPair,
        config: &NetworkConfig,
        chain_id: ChainId,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Result<(Self, NetworkHandle)> {
        let libp2p_keypair = Keypair::ed25519_from_bytes(keypair.secret().as_bytes().to_vec())?;
        let behaviour = PalisadeBehaviour::new(&libp2p_keypair, config.enable_mdns)?;
        let idle_timeout = Duration::from_secs(config.connection_timeout.max(60));

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(libp2p_keypair)
            .with_tokio()
            .with_tcp(
                libp2p::tcp::Config::default(),
                libp2p::noise::Config::new,
                libp2p::yamux::Config::default,
            )?
            .with_behaviour(|_| behaviour)?
            .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(idle_timeout))
            .build();

        let local_peer = PeerId::new(swarm.local_peer_id().to_string());
        swarm.behaviour_mut().subscribe_chain(chain_id, local_peer.as_str())?;

        let listen_addr: Multiaddr = config.listen_addr.parse()?;
        swarm.listen_on(listen_addr)?;

        let peer_manager = create_peer_manager(config.max_peers);
        let (command_tx, command_rx) = mpsc::channel(1024);

        info!("Network service created for peer {}", local_peer);

        let handle = NetworkHandle {
            local_peer: local_peer.clone(),
            command_tx,
            peer_manager: peer_manager.clone(),
        };
        let service = Self {
            swarm,
            peer_manager,
            local_peer,
            chain_id,
            command_rx,
            inbound_tx,
        };
        Ok((service, handle))
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn connect_bootstrap(&mut self, nodes: &[String]) {
        for addr_str in nodes {
            match addr_str.parse::<Multiaddr>() {
                Ok(addr) => {
                    info!("Connecting to bootstrap node: {}", addr);
                    if let Err(e) = self.swarm.dial(addr.clone()) {
                        warn!("Failed to dial {}: {}", addr, e);
                    }
                }
                Err(e) => warn!("Invalid bootstrap address {}: {}", addr_str, e),
            }
        }
    }

    /// Run the swarm until `shutdown` flips to true
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_swarm_event(event).await,
                Some(command) = self.command_rx.recv() => self.handle_command(command),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Network service stopping");
                        break;
                    }
                }
            }
        }
    }

    fn handle_command(&mut self, command: NetworkCommand) {
        match command {
            NetworkCommand::Publish { topic, data } => {
                if let Err(e) = self.swarm.behaviour_mut().publish(topic.clone(), data) {
                    // InsufficientPeers is routine while the mesh forms
                    debug!("Publish to {} failed: {}", topic, e);
                }
            }
        }
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<PalisadeBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(PalisadeBehaviourEvent::Gossipsub(gossipsub::Event::Message { message, .. })) => {
                if let Some(inbound) = self.accept_gossip(message) {
                    let inbound_tx = self.inbound_tx.clone();
                    if inbound_tx.send(inbound).await.is_err() {
                        debug!("Inbound receiver closed, dropping message");
                    }
                }
            }
            SwarmEvent::Behaviour(PalisadeBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                for (peer_id, addr) in peers {
                    info!("mDNS discovered peer: {} at {}", peer_id, addr);
                    self.swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                    if let Err(e) = self.swarm.dial(addr) {
                        warn!("Failed to dial discovered peer: {}", e);
                    }
                }
            }
            SwarmEvent::Behaviour(PalisadeBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                for (peer_id, _) in peers {
                    debug!("mDNS peer expired: {}", peer_id);
                    self.swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
                }
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                let peer = PeerId::new(peer_id.to_string());
                if !self.peer_manager.add_peer(PeerInfo::new(peer.clone())) {
                    warn!("Peer limit reached, not tracking {}", peer);
                } else {
                    info!("Peer connected: {}", peer);
                }
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    let peer = PeerId::new(peer_id.to_string());
                    info!("Peer disconnected: {}", peer);
                    self.peer_manager.remove_peer(&peer);
                }
            }
            _ => {}
        }
    }

    /// Decode and filter one gossip message; `None` when it is not for us
    fn accept_gossip(&self, message: gossipsub::Message) -> Option<InboundMessage> {
        let envelope = match Envelope::from_bytes(&message.data) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping undecodable gossip message on {}: {}", message.topic, e);
                return None;
            }
        };

        if envelope.chain_id != self.chain_id || envelope.sender == self.local_peer {
            return None;
        }
        if envelope.target.as_ref().is_some_and(|target| target != &self.local_peer) {
            return None;
        }

        self.peer_manager.record_message(&envelope.sender);
        Some(envelope.into_inbound())
    }
}

impl NetworkHandle {
    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn peer_manager(&self) -> SharedPeerManager {
        self.peer_manager.clone()
    }

    async fn publish(&self, topic: IdentTopic, envelope: Envelope) -> PalisadeResult<()> {
        let data = envelope.to_bytes()?;
        self.command_tx
            .send(NetworkCommand::Publish { topic, data })
            .await
            .map_err(|_| PalisadeError::NetworkError("network service stopped".into()))
    }
}

#[async_trait]
impl Network for NetworkHandle {
    async fn send_to_peer(
        &self,
        chain_id: ChainId,
        payload: Vec<u8>,
        peer: &PeerId,
        command: CommandId,
    ) -> PalisadeResult<()> {
        let envelope = Envelope::new(chain_id, command, self.local_peer.clone(), payload).to(peer.clone());
        self.publish(direct_topic(chain_id, peer.as_str()), envelope).await
    }

    async fn broadcast(
        &self,
        chain_id: ChainId,
        command: CommandId,
        payload: Vec<u8>,
        exclude: Option<&PeerId>,
    ) -> PalisadeResult<()> {
        // gossip cannot skip a single peer; the excluded origin drops the
        // echo as a duplicate
        if let Some(peer) = exclude {
            debug!("Broadcasting {} (origin {} not excludable on gossip)", command, peer);
        }
        let envelope = Envelope::new(chain_id, command, self.local_peer.clone(), payload);
        self.publish(command_topic(chain_id, command), envelope).await
    }
}
