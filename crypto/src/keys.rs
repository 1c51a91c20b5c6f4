//! Validator key pairs and address derivation

use ed25519_dalek::{SigningKey as Ed25519SigningKey, VerifyingKey as Ed25519VerifyingKey, SECRET_KEY_LENGTH};
use palisade_core::{Address, PalisadeError, PalisadeResult, PublicKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hashing::blake3_hash;

/// Ed25519 key pair of a packing account
#[derive(Clone)]
pub struct KeyPair {
    signing_key: Ed25519SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: Ed25519SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing_key: Ed25519SigningKey::from_bytes(seed),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> PalisadeResult<Self> {
        let seed: [u8; SECRET_KEY_LENGTH] = bytes.try_into().map_err(|_| PalisadeError::InvalidPrivateKey)?;
        Ok(Self::from_seed(&seed))
    }

    /// Parse a hex-encoded secret, as written by `palisade-node keygen`
    pub fn from_secret_hex(s: &str) -> PalisadeResult<Self> {
        let bytes = hex::decode(s.trim().trim_start_matches("0x")).map_err(|_| PalisadeError::InvalidPrivateKey)?;
        let secret = SecretKey::from_slice(&bytes)?;
        Ok(secret.to_keypair())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    /// Packing address (BLAKE3 of the public key)
    pub fn address(&self) -> Address {
        address_from_public_key(&self.public_key())
    }

    pub fn secret(&self) -> SecretKey {
        SecretKey::new(self.signing_key.to_bytes())
    }

    pub(crate) fn signing_key(&self) -> &Ed25519SigningKey {
        &self.signing_key
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyPair({})", self.address())
    }
}

pub fn address_from_public_key(public_key: &PublicKey) -> Address {
    Address::from_bytes(*blake3_hash(public_key.as_bytes()).as_bytes())
}

pub fn verify_address(address: &Address, public_key: &PublicKey) -> bool {
    address_from_public_key(public_key) == *address
}

pub fn public_key_to_ed25519(key: &PublicKey) -> PalisadeResult<Ed25519VerifyingKey> {
    Ed25519VerifyingKey::from_bytes(key.as_bytes()).map_err(|_| PalisadeError::InvalidPublicKey)
}

/// Secret key bytes, wiped on drop
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; 32],
}

impl SecretKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(bytes: &[u8]) -> PalisadeResult<Self> {
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| PalisadeError::InvalidPrivateKey)?;
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    pub fn to_keypair(&self) -> KeyPair {
        KeyPair::from_seed(&self.bytes)
    }
}

/// Public part of a key file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub public_key: String,
    pub address: String,
}

impl From<&KeyPair> for PublicKeyInfo {
    fn from(keypair: &KeyPair) -> Self {
        Self {
            public_key: keypair.public_key().to_hex(),
            address: keypair.address().to_hex(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_matches_public_key() {
        let kp = KeyPair::generate();
        assert!(verify_address(&kp.address(), &kp.public_key()));
        assert!(!verify_address(&Address::ZERO, &kp.public_key()));
    }

    #[test]
    fn test_secret_hex_roundtrip() {
        let kp = KeyPair::from_seed(&[42u8; 32]);
        let restored = KeyPair::from_secret_hex(&kp.secret().to_hex()).unwrap();
        assert_eq!(restored.address(), kp.address());
        assert!(matches!(
            KeyPair::from_secret_hex("abcd"),
            Err(PalisadeError::InvalidPrivateKey)
        ));
    }
}
