//! Wire envelope for Palisade network messages

use palisade_core::{ChainId, CommandId, PalisadeError, PalisadeResult, PeerId};
use serde::{Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Every payload travels inside an envelope naming its chain, command and
/// sender. The payload itself is opaque to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub version: u32,
    pub chain_id: ChainId,
    pub command: CommandId,
    pub sender: PeerId,
    /// Set for point-to-point messages
    pub target: Option<PeerId>,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(chain_id: ChainId, command: CommandId, sender: PeerId, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            chain_id,
            command,
            sender,
            target: None,
            payload,
        }
    }

    pub fn to(mut self, target: PeerId) -> Self {
        self.target = Some(target);
        self
    }

    pub fn to_bytes(&self) -> PalisadeResult<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> PalisadeResult<Self> {
        let envelope: Envelope =
            bincode::deserialize(bytes).map_err(|e| PalisadeError::DeserializationError(e.to_string()))?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(PalisadeError::Malformed(format!(
                "unsupported protocol version {}",
                envelope.version
            )));
        }
        Ok(envelope)
    }

    pub fn into_inbound(self) -> InboundMessage {
        InboundMessage {
            chain_id: self.chain_id,
            command: self.command,
            payload: self.payload,
            origin: self.sender,
        }
    }
}

/// A message delivered to the local node
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub chain_id: ChainId,
    pub command: CommandId,
    pub payload: Vec<u8>,
    /// Peer the message came from
    pub origin: PeerId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_into_inbound() {
        let envelope = Envelope::new(3, CommandId::Vote, PeerId::new("node-a"), vec![1, 2, 3])
            .to(PeerId::new("node-b"));
        let restored = Envelope::from_bytes(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(restored, envelope);

        let inbound = restored.into_inbound();
        assert_eq!(inbound.origin, PeerId::new("node-a"));
        assert_eq!(inbound.command, CommandId::Vote);
    }

    #[test]
    fn test_rejects_other_versions() {
        let mut envelope = Envelope::new(3, CommandId::Block, PeerId::new("a"), vec![]);
        envelope.version = 99;
        assert!(matches!(
            Envelope::from_bytes(&envelope.to_bytes().unwrap()),
            Err(PalisadeError::Malformed(_))
        ));
        assert!(Envelope::from_bytes(b"garbage").is_err());
    }
}
