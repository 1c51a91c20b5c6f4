//! In-memory network hub
//!
//! Connects any number of nodes inside one process with the same delivery
//! semantics as the gossip transport: broadcasts reach every other member,
//! point-to-point sends reach one. Members can be isolated to simulate an
//! offline node.

use crate::message::InboundMessage;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use palisade_core::{ChainId, CommandId, Network, PalisadeError, PalisadeResult, PeerId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Default)]
pub struct LocalHub {
    members: DashMap<PeerId, mpsc::Sender<InboundMessage>>,
    isolated: DashSet<PeerId>,
}

pub type SharedLocalHub = Arc<LocalHub>;

impl LocalHub {
    pub fn new() -> SharedLocalHub {
        Arc::new(Self::default())
    }

    /// Register a member and get its network handle and inbox
    pub fn join(self: &Arc<Self>, peer: PeerId, capacity: usize) -> (LocalNetwork, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        self.members.insert(peer.clone(), tx);
        let network = LocalNetwork {
            hub: self.clone(),
            local_peer: peer,
        };
        (network, rx)
    }

    pub fn leave(&self, peer: &PeerId) {
        self.members.remove(peer);
    }

    /// Cut a member off: it neither sends nor receives
    pub fn isolate(&self, peer: &PeerId) {
        self.isolated.insert(peer.clone());
    }

    pub fn reconnect(&self, peer: &PeerId) {
        self.isolated.remove(peer);
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    async fn deliver(&self, target: &PeerId, message: InboundMessage) {
        if self.isolated.contains(target) {
            return;
        }
        // clone the sender so no map guard is held across the await
        let sender = self.members.get(target).map(|s| s.clone());
        if let Some(sender) = sender {
            if sender.send(message).await.is_err() {
                trace!("Inbox of {} closed", target);
            }
        }
    }
}

/// A hub member's `Network` handle
#[derive(Clone)]
pub struct LocalNetwork {
    hub: SharedLocalHub,
    local_peer: PeerId,
}

impl LocalNetwork {
    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }
}

#[async_trait]
impl Network for LocalNetwork {
    async fn send_to_peer(
        &self,
        chain_id: ChainId,
        payload: Vec<u8>,
        peer: &PeerId,
        command: CommandId,
    ) -> PalisadeResult<()> {
        if self.hub.isolated.contains(&self.local_peer) {
            return Ok(());
        }
        if !self.hub.members.contains_key(peer) {
            return Err(PalisadeError::PeerNotFound(peer.to_string()));
        }
        let message = InboundMessage {
            chain_id,
            command,
            payload,
            origin: self.local_peer.clone(),
        };
        self.hub.deliver(peer, message).await;
        Ok(())
    }

    async fn broadcast(
        &self,
        chain_id: ChainId,
        command: CommandId,
        payload: Vec<u8>,
        exclude: Option<&PeerId>,
    ) -> PalisadeResult<()> {
        if self.hub.isolated.contains(&self.local_peer) {
            return Ok(());
        }
        let targets: Vec<PeerId> = self
            .hub
            .members
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|peer| peer != &self.local_peer && Some(peer) != exclude)
            .collect();

        for target in targets {
            let message = InboundMessage {
                chain_id,
                command,
                payload: payload.clone(),
                origin: self.local_peer.clone(),
            };
            self.hub.deliver(&target, message).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_skips_self_and_excluded() {
        let hub = LocalHub::new();
        let (a, mut rx_a) = hub.join(PeerId::new("a"), 8);
        let (_b, mut rx_b) = hub.join(PeerId::new("b"), 8);
        let (_c, mut rx_c) = hub.join(PeerId::new("c"), 8);

        a.broadcast(1, CommandId::Vote, vec![7], Some(&PeerId::new("c")))
            .await
            .unwrap();

        let got = rx_b.recv().await.unwrap();
        assert_eq!(got.origin, PeerId::new("a"));
        assert_eq!(got.payload, vec![7]);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_isolated_member() {
        let hub = LocalHub::new();
        let (a, _rx_a) = hub.join(PeerId::new("a"), 8);
        let (b, mut rx_b) = hub.join(PeerId::new("b"), 8);

        hub.isolate(&PeerId::new("b"));
        a.send_to_peer(1, vec![1], &PeerId::new("b"), CommandId::GetCandidate)
            .await
            .unwrap();
        assert!(rx_b.try_recv().is_err());

        hub.reconnect(&PeerId::new("b"));
        a.send_to_peer(1, vec![2], &PeerId::new("b"), CommandId::GetCandidate)
            .await
            .unwrap();
        assert_eq!(rx_b.recv().await.unwrap().payload, vec![2]);

        assert!(matches!(
            b.send_to_peer(1, vec![], &PeerId::new("zz"), CommandId::Block).await,
            Err(PalisadeError::PeerNotFound(_))
        ));
    }
}
