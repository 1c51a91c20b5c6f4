//! HKDF-SHA256 key derivation
//!
//! Used to derive reproducible validator keys for devnets and tests from a
//! shared phrase.

use hkdf::Hkdf;
use palisade_core::{PalisadeError, PalisadeResult};
use sha2::Sha256;

use crate::keys::{KeyPair, SecretKey};

pub fn derive_key_32(input_key_material: &[u8], salt: Option<&[u8]>, info: &[u8]) -> PalisadeResult<[u8; 32]> {
    let hk = Hkdf::<Sha256>::new(salt, input_key_material);
    let mut output = [0u8; 32];
    hk.expand(info, &mut output)
        .map_err(|e| PalisadeError::KeyDerivationFailed(e.to_string()))?;
    Ok(output)
}

/// Deterministic validator key number `index` of a devnet phrase
pub fn devnet_keypair(phrase: &str, index: u32) -> PalisadeResult<KeyPair> {
    let master = derive_key_32(phrase.as_bytes(), Some(b"palisade-devnet"), b"master")?;
    let info = format!("palisade/validator/{}", index);
    let secret = SecretKey::new(derive_key_32(&master, None, info.as_bytes())?);
    Ok(secret.to_keypair())
}

/// The first `count` devnet keys of a phrase
pub fn devnet_keypairs(phrase: &str, count: u32) -> PalisadeResult<Vec<KeyPair>> {
    (0..count).map(|i| devnet_keypair(phrase, i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_devnet_keys_are_reproducible() {
        let first = devnet_keypairs("local devnet", 3).unwrap();
        let again = devnet_keypairs("local devnet", 3).unwrap();

        assert_eq!(first.len(), 3);
        for (a, b) in first.iter().zip(&again) {
            assert_eq!(a.public_key(), b.public_key());
        }
        assert_ne!(first[0].address(), first[1].address());
        assert_ne!(
            devnet_keypair("other phrase", 0).unwrap().address(),
            first[0].address()
        );
    }
}
