//! Error types for Palisade

use thiserror::Error;

/// Main error type for Palisade
#[derive(Error, Debug)]
pub enum PalisadeError {
    // ============ Cryptography Errors ============
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid private key")]
    InvalidPrivateKey,

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Signing key unavailable for {0}")]
    SigningKeyUnavailable(String),

    // ============ Consensus Errors ============
    #[error("No round: {0}")]
    NoRound(String),

    #[error("Not a validator")]
    NotAValidator,

    #[error("Node is not synchronized")]
    NotSynchronized,

    #[error("Invalid vote: {0}")]
    InvalidVote(String),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Validator set error: {0}")]
    ValidatorSetError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // ============ Storage Errors ============
    #[error("Block not found at height {0}")]
    BlockNotFound(u64),

    #[error("State corruption detected: {0}")]
    StateCorruption(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    // ============ Network Errors ============
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Message serialization failed: {0}")]
    SerializationError(String),

    #[error("Message deserialization failed: {0}")]
    DeserializationError(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    // ============ Configuration Errors ============
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    // ============ General Errors ============
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<std::io::Error> for PalisadeError {
    fn from(err: std::io::Error) -> Self {
        PalisadeError::StorageError(err.to_string())
    }
}

impl From<bincode::Error> for PalisadeError {
    fn from(err: bincode::Error) -> Self {
        PalisadeError::SerializationError(err.to_string())
    }
}

impl From<serde_json::Error> for PalisadeError {
    fn from(err: serde_json::Error) -> Self {
        PalisadeError::SerializationError(err.to_string())
    }
}
