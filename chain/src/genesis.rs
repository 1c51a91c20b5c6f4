//! Genesis configuration

use palisade_core::{
    Address, Amount, Block, BlockHeader, ChainId, Hash, PalisadeError, PalisadeResult, PublicKey, Signature,
    Timestamp, ValidatorSetEntry,
};
use palisade_crypto::hashing::hash;
use palisade_crypto::keys::{address_from_public_key, KeyPair};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::registry::MIN_DEPOSIT_PAL;

/// Initial validator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisValidator {
    /// Hex public key of the packing account
    pub public_key: String,
    /// Hex reward address; defaults to the packing address
    #[serde(default)]
    pub reward_address: Option<String>,
    pub deposit_pal: u64,
}

/// Genesis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenesisConfig {
    pub chain_name: String,
    pub chain_id: ChainId,
    /// Genesis block time in milliseconds
    pub timestamp: u64,
    pub validators: Vec<GenesisValidator>,
    /// Packing addresses accepted as voters during bootstrap
    #[serde(default)]
    pub seed_validators: Vec<String>,
}

impl Default for GenesisConfig {
    fn default() -> Self {
        Self {
            chain_name: "Palisade Mainnet".to_string(),
            chain_id: 1,
            timestamp: 0,
            validators: vec![],
            seed_validators: vec![],
        }
    }
}

impl GenesisConfig {
    pub fn devnet(chain_id: ChainId) -> Self {
        Self {
            chain_name: "Palisade Devnet".to_string(),
            chain_id,
            timestamp: Timestamp::now().as_millis(),
            ..Default::default()
        }
    }

    pub fn add_validator(mut self, keypair: &KeyPair, deposit_pal: u64) -> Self {
        self.validators.push(GenesisValidator {
            public_key: keypair.public_key().to_hex(),
            reward_address: None,
            deposit_pal,
        });
        self
    }

    pub fn add_seed(mut self, address: &Address) -> Self {
        self.seed_validators.push(address.to_hex());
        self
    }

    /// Validator set entries active from height 0
    pub fn validator_entries(&self) -> PalisadeResult<Vec<ValidatorSetEntry>> {
        self.validators
            .iter()
            .map(|v| {
                let public_key = PublicKey::from_hex(&v.public_key).map_err(|_| PalisadeError::InvalidPublicKey)?;
                let packing_address = address_from_public_key(&public_key);
                let reward_address = match &v.reward_address {
                    Some(s) => Address::from_hex(s).map_err(|e| PalisadeError::InvalidAddress(e.to_string()))?,
                    None => packing_address,
                };
                if v.deposit_pal < MIN_DEPOSIT_PAL {
                    return Err(PalisadeError::ConfigError(format!(
                        "genesis validator {} deposit below {} PAL",
                        packing_address, MIN_DEPOSIT_PAL
                    )));
                }
                Ok(ValidatorSetEntry::new(
                    packing_address,
                    reward_address,
                    public_key,
                    Amount::from_pal(v.deposit_pal),
                    0,
                ))
            })
            .collect()
    }

    pub fn seed_addresses(&self) -> PalisadeResult<Vec<Address>> {
        self.seed_validators
            .iter()
            .map(|s| Address::from_hex(s).map_err(|e| PalisadeError::InvalidAddress(e.to_string())))
            .collect()
    }

    /// The unsigned height-0 block every node derives identically
    pub fn genesis_block(&self) -> Block {
        let header = BlockHeader {
            chain_id: self.chain_id,
            height: 0,
            previous_hash: Hash::ZERO,
            timestamp: Timestamp::from_millis(self.timestamp),
            round_index: 0,
            round_start: Timestamp::from_millis(self.timestamp),
            member_count: 0,
            packing_index: 0,
            packer: PublicKey::from_bytes([0u8; 32]),
            tx_root: Hash::ZERO,
            tx_count: 0,
        };
        Block {
            hash: hash(&header.encode()),
            header,
            signature: Signature::from_bytes([0u8; 64]),
            transactions: vec![],
        }
    }

    pub fn to_json(&self) -> PalisadeResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| PalisadeError::SerializationError(e.to_string()))
    }

    pub fn from_json(json: &str) -> PalisadeResult<Self> {
        serde_json::from_str(json).map_err(|e| PalisadeError::DeserializationError(e.to_string()))
    }

    pub fn load(path: impl AsRef<Path>) -> PalisadeResult<Self> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PalisadeError::ConfigError(format!("{}: {}", path.as_ref().display(), e)))?;
        let config = Self::from_json(&json)?;
        info!(
            "Loaded genesis for {} (chain {}, {} validators)",
            config.chain_name,
            config.chain_id,
            config.validators.len()
        );
        Ok(config)
    }
}
