//! In-process signing service

use async_trait::async_trait;
use dashmap::DashMap;
use palisade_core::{Address, ChainId, Hash, PalisadeError, PalisadeResult, PublicKey, Signature, Signer};
use std::sync::Arc;
use tracing::debug;

use crate::keys::KeyPair;
use crate::signing::sign_digest;

/// Holds the packing keys this node can sign with, keyed by packing address
#[derive(Default)]
pub struct KeyringSigner {
    keys: DashMap<Address, KeyPair>,
}

pub type SharedKeyring = Arc<KeyringSigner>;

impl KeyringSigner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(keypair: KeyPair) -> Self {
        let keyring = Self::new();
        keyring.insert(keypair);
        keyring
    }

    /// Add a key, returning its packing address
    pub fn insert(&self, keypair: KeyPair) -> Address {
        let address = keypair.address();
        debug!("Keyring: added {}", address);
        self.keys.insert(address, keypair);
        address
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.keys.contains_key(address)
    }

    pub fn addresses(&self) -> Vec<Address> {
        self.keys.iter().map(|entry| *entry.key()).collect()
    }
}

#[async_trait]
impl Signer for KeyringSigner {
    async fn sign(&self, _chain_id: ChainId, address: &Address, digest: &Hash) -> PalisadeResult<Signature> {
        let keypair = self
            .keys
            .get(address)
            .ok_or_else(|| PalisadeError::SigningKeyUnavailable(address.to_string()))?;
        Ok(sign_digest(&keypair, digest))
    }

    async fn public_key(&self, _chain_id: ChainId, address: &Address) -> PalisadeResult<PublicKey> {
        self.keys
            .get(address)
            .map(|kp| kp.public_key())
            .ok_or_else(|| PalisadeError::SigningKeyUnavailable(address.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::verify_digest;

    #[tokio::test]
    async fn test_keyring_signs_for_known_address() {
        let keypair = KeyPair::generate();
        let keyring = KeyringSigner::with_key(keypair.clone());
        let digest = Hash::from_bytes([5u8; 32]);

        let sig = keyring.sign(1, &keypair.address(), &digest).await.unwrap();
        assert!(verify_digest(&keypair.public_key(), &digest, &sig));
        assert_eq!(keyring.public_key(1, &keypair.address()).await.unwrap(), keypair.public_key());
    }

    #[tokio::test]
    async fn test_keyring_unknown_address() {
        let keyring = KeyringSigner::new();
        let result = keyring.sign(1, &Address::ZERO, &Hash::ZERO).await;
        assert!(matches!(result, Err(PalisadeError::SigningKeyUnavailable(_))));
    }
}
