//! Configuration types for Palisade

use crate::error::PalisadeError;
use crate::traits::PalisadeResult;
use crate::types::{Address, ChainId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node name for logging
    pub name: String,

    /// Data directory
    pub data_dir: PathBuf,

    /// Chain this node takes part in
    pub chain_id: ChainId,

    /// Network configuration
    pub network: NetworkConfig,

    /// Consensus configuration
    pub consensus: ConsensusConfig,

    /// Logging filter, overridden by `RUST_LOG`
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "palisade-node".to_string(),
            data_dir: PathBuf::from("./data"),
            chain_id: 1,
            network: NetworkConfig::default(),
            consensus: ConsensusConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl NodeConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> PalisadeResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PalisadeError::ConfigError(format!("{}: {}", path.as_ref().display(), e)))?;
        let config: NodeConfig = serde_json::from_str(&content)
            .map_err(|e| PalisadeError::ConfigError(e.to_string()))?;
        config.consensus.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> PalisadeResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Listen address for P2P
    pub listen_addr: String,

    /// Bootstrap nodes
    pub bootstrap_nodes: Vec<String>,

    /// Maximum peer connections
    pub max_peers: usize,

    /// Enable mDNS for local discovery
    pub enable_mdns: bool,

    /// Connection timeout in seconds
    pub connection_timeout: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: "/ip4/0.0.0.0/tcp/30333".to_string(),
            bootstrap_nodes: vec![],
            max_peers: 50,
            enable_mdns: true,
            connection_timeout: 30,
        }
    }
}

/// What the inbound consensus queue does when it is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for room (backpressure onto the network reader)
    Block,
    /// Drop the incoming message and log it
    DropNewest,
}

/// Consensus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// This node takes part in voting when it is in the validator set
    pub is_validator: bool,

    /// Length of one producer slot in milliseconds
    pub slot_interval_ms: u64,

    /// Quorum ratio in percent (51-100)
    pub byzantine_ratio: u8,

    /// Stage-one vote wait in milliseconds
    pub stage_one_timeout_ms: u64,

    /// Stage-two vote wait in milliseconds
    pub stage_two_timeout_ms: u64,

    /// Stop re-broadcasting votes this long after a height's deadline
    pub relay_cutoff_secs: u64,

    /// Maximum transaction payload of a block in bytes
    pub max_block_size: usize,

    /// Packing addresses (hex) accepted as voters regardless of round membership
    pub seed_validators: Vec<String>,

    /// Capacity of the inbound consensus message queue
    pub inbound_queue_capacity: usize,

    /// Behaviour of the inbound queue when full
    pub overflow_policy: OverflowPolicy,

    /// Future round probe period in milliseconds
    pub probe_interval_ms: u64,

    /// Sync / membership poll period in milliseconds
    pub sync_poll_interval_ms: u64,

    /// Drain period for processors on shutdown in milliseconds
    pub shutdown_grace_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            is_validator: false,
            slot_interval_ms: 10_000,
            byzantine_ratio: 67, // 2/3 majority
            stage_one_timeout_ms: 5_000,
            stage_two_timeout_ms: 5_000,
            relay_cutoff_secs: 120,
            max_block_size: 2 * 1024 * 1024,
            seed_validators: vec![],
            inbound_queue_capacity: 1024,
            overflow_policy: OverflowPolicy::Block,
            probe_interval_ms: 1_000,
            sync_poll_interval_ms: 500,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl ConsensusConfig {
    pub fn validate(&self) -> PalisadeResult<()> {
        if !(51..=100).contains(&self.byzantine_ratio) {
            return Err(PalisadeError::ConfigError(format!(
                "byzantine_ratio must be within 51..=100, got {}",
                self.byzantine_ratio
            )));
        }
        if self.slot_interval_ms == 0 || self.stage_one_timeout_ms == 0 || self.stage_two_timeout_ms == 0 {
            return Err(PalisadeError::ConfigError(
                "slot interval and stage timeouts must be non-zero".into(),
            ));
        }
        if self.inbound_queue_capacity == 0 {
            return Err(PalisadeError::ConfigError("inbound_queue_capacity must be non-zero".into()));
        }
        self.seed_addresses()?;
        Ok(())
    }

    /// Distinct votes needed to resolve a stage in a round of `member_count`
    ///
    /// Never more than the round has members, so a ratio of 100 means all of them.
    pub fn quorum_threshold(&self, member_count: usize) -> usize {
        (member_count * self.byzantine_ratio as usize / 100 + 1).min(member_count.max(1))
    }

    pub fn seed_addresses(&self) -> PalisadeResult<Vec<Address>> {
        self.seed_validators
            .iter()
            .map(|s| Address::from_hex(s).map_err(|e| PalisadeError::InvalidAddress(format!("{}: {}", s, e))))
            .collect()
    }

    pub fn slot_interval(&self) -> Duration {
        Duration::from_millis(self.slot_interval_ms)
    }

    pub fn stage_one_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_one_timeout_ms)
    }

    pub fn stage_two_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_two_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn sync_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sync_poll_interval_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quorum_threshold() {
        let config = ConsensusConfig::default();
        assert_eq!(config.quorum_threshold(7), 5);
        assert_eq!(config.quorum_threshold(4), 3);
        assert_eq!(config.quorum_threshold(1), 1);
    }

    #[test]
    fn test_full_ratio_needs_every_member() {
        let config = ConsensusConfig {
            byzantine_ratio: 100,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.quorum_threshold(4), 4);
        assert_eq!(config.quorum_threshold(1), 1);

        let near = ConsensusConfig {
            byzantine_ratio: 99,
            ..Default::default()
        };
        assert_eq!(near.quorum_threshold(4), 4);
        assert_eq!(near.quorum_threshold(100), 100);
    }

    #[test]
    fn test_validate_rejects_weak_ratio() {
        let config = ConsensusConfig {
            byzantine_ratio: 50,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PalisadeError::ConfigError(_))));
        assert!(ConsensusConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_seed() {
        let config = ConsensusConfig {
            seed_validators: vec!["not-hex".into()],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PalisadeError::InvalidAddress(_))));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"chain_id": 9, "consensus": {"byzantine_ratio": 75}}"#).unwrap();
        assert_eq!(config.chain_id, 9);
        assert_eq!(config.consensus.byzantine_ratio, 75);
        assert_eq!(config.consensus.slot_interval_ms, 10_000);
        assert_eq!(config.consensus.overflow_policy, OverflowPolicy::Block);
    }
}
