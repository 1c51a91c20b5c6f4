//! Ed25519 signatures over messages and 32-byte digests

use ed25519_dalek::{Signer, Verifier};
use palisade_core::{Hash, PalisadeError, PalisadeResult, PublicKey, Signature};

use crate::keys::{public_key_to_ed25519, KeyPair};

pub fn sign(keypair: &KeyPair, message: &[u8]) -> Signature {
    let signature = keypair.signing_key().sign(message);
    Signature::from_bytes(signature.to_bytes())
}

pub fn verify(public_key: &PublicKey, message: &[u8], signature: &Signature) -> PalisadeResult<()> {
    let verifying_key = public_key_to_ed25519(public_key)?;
    let sig = ed25519_dalek::Signature::from_bytes(signature.as_bytes());

    verifying_key
        .verify(message, &sig)
        .map_err(|_| PalisadeError::InvalidSignature)
}

/// Sign a precomputed digest (vote digests, block hashes)
pub fn sign_digest(keypair: &KeyPair, digest: &Hash) -> Signature {
    sign(keypair, digest.as_bytes())
}

pub fn verify_digest(public_key: &PublicKey, digest: &Hash, signature: &Signature) -> bool {
    verify(public_key, digest.as_bytes(), signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hashing::hash;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let signature = sign(&keypair, b"block header");
        assert!(verify(&keypair.public_key(), b"block header", &signature).is_ok());
        assert!(verify(&keypair.public_key(), b"other header", &signature).is_err());
    }

    #[test]
    fn test_digest_signature_binds_key() {
        let keypair1 = KeyPair::generate();
        let keypair2 = KeyPair::generate();
        let digest = hash(b"vote");

        let signature = sign_digest(&keypair1, &digest);
        assert!(verify_digest(&keypair1.public_key(), &digest, &signature));
        assert!(!verify_digest(&keypair2.public_key(), &digest, &signature));
        assert!(!verify_digest(&keypair1.public_key(), &hash(b"other"), &signature));
    }

    #[test]
    fn test_garbage_public_key() {
        let signature = Signature::from_bytes([0u8; 64]);
        assert!(!verify_digest(&PublicKey::from_bytes([0xffu8; 32]), &Hash::ZERO, &signature));
    }
}
