//! Palisade Cryptography
//!
//! Ed25519 validator keys, BLAKE3 hashing and HKDF derivation, plus the
//! in-process signing service used by the consensus engine.

pub mod keys;
pub mod signing;
pub mod hashing;
pub mod derivation;
pub mod keyring;

pub use keys::*;
pub use signing::*;
pub use hashing::*;
pub use derivation::*;
pub use keyring::*;
