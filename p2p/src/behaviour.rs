//! Network behaviour for libp2p

use libp2p::{
    gossipsub::{self, IdentTopic, MessageAuthenticity, ValidationMode},
    identity::Keypair,
    mdns,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
};
use palisade_core::{ChainId, CommandId};
use std::time::Duration;

/// Gossip topic carrying one command of one chain
pub fn command_topic(chain_id: ChainId, command: CommandId) -> IdentTopic {
    IdentTopic::new(format!("palisade/{}/{}/1", chain_id, command.as_str()))
}

/// Topic a single node listens on for point-to-point messages
pub fn direct_topic(chain_id: ChainId, peer: &str) -> IdentTopic {
    IdentTopic::new(format!("palisade/{}/direct/{}", chain_id, peer))
}

/// Combined network behaviour
#[derive(NetworkBehaviour)]
pub struct PalisadeBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
}

impl PalisadeBehaviour {
    pub fn new(keypair: &Keypair, enable_mdns: bool) -> anyhow::Result<Self> {
        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(Duration::from_secs(1))
            .validation_mode(ValidationMode::Strict)
            .message_id_fn(|message| {
                // identical envelopes are delivered once
                let hash = palisade_crypto::hashing::hash(&message.data);
                gossipsub::MessageId::from(hash.to_hex())
            })
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build gossipsub config: {}", e))?;

        let gossipsub = gossipsub::Behaviour::new(MessageAuthenticity::Signed(keypair.clone()), gossipsub_config)
            .map_err(|e| anyhow::anyhow!("Failed to create gossipsub: {}", e))?;

        let mdns = if enable_mdns {
            Some(mdns::tokio::Behaviour::new(
                mdns::Config::default(),
                keypair.public().to_peer_id(),
            )?)
        } else {
            None
        };

        Ok(Self {
            gossipsub,
            mdns: Toggle::from(mdns),
        })
    }

    /// Subscribe to every command topic of `chain_id` and to our direct topic
    pub fn subscribe_chain(&mut self, chain_id: ChainId, local_peer: &str) -> Result<(), gossipsub::SubscriptionError> {
        for command in CommandId::ALL {
            self.gossipsub.subscribe(&command_topic(chain_id, command))?;
        }
        self.gossipsub.subscribe(&direct_topic(chain_id, local_peer))?;
        Ok(())
    }

    pub fn publish(&mut self, topic: IdentTopic, data: Vec<u8>) -> Result<gossipsub::MessageId, gossipsub::PublishError> {
        self.gossipsub.publish(topic, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names() {
        assert_eq!(command_topic(7, CommandId::VoteResult).to_string(), "palisade/7/voteResult/1");
        assert_ne!(
            command_topic(7, CommandId::Vote).hash(),
            command_topic(8, CommandId::Vote).hash()
        );
        assert_eq!(direct_topic(7, "peer-x").to_string(), "palisade/7/direct/peer-x");
    }
}
